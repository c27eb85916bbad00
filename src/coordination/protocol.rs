//! Wire protocol for the coordination service.
//!
//! Frames are a 4-byte big-endian length prefix followed by a JSON body.
//! Requests and responses are serde-tagged enums, so the message set is
//! closed and exhaustively matchable on both ends.
//!
//! Optional string fields travel as empty strings when absent; the literal
//! `"None"` is reserved to denote a value that was explicitly nulled, and
//! both forms decode to `None` (see [`nullable`]).

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a frame body; anything larger is a protocol violation.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Encoding helpers for optional string fields.
pub mod nullable {
    /// Encode an optional value: `None` becomes the reserved literal.
    #[must_use]
    pub fn encode(value: Option<&str>) -> String {
        match value {
            Some(v) => v.to_string(),
            None => "None".to_string(),
        }
    }

    /// Decode a wire string: empty (absent) and `"None"` (nulled) both
    /// decode to `None`.
    #[must_use]
    pub fn decode(raw: &str) -> Option<&str> {
        match raw {
            "" | "None" => None,
            value => Some(value),
        }
    }
}

/// A VM mapping record as it travels on the wire.
///
/// `state` holds the encoded [`VmState`](crate::types::VmState);
/// `current_time` is the VM's most recent locally observed schedule clock,
/// subject to the [`nullable`] encoding.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmMapping {
    pub server_uuid: String,
    pub server_name: String,
    pub control_ip: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub current_time: String,
}

/// Service information returned by `GetInfo`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InfoReply {
    pub version: String,
    pub uptime: f64,
    pub experiment_running: bool,
}

/// Error codes carried in error replies.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The requested record or timestamp does not exist.
    NotFound,
    /// The request was malformed.
    Invalid,
    /// The service failed internally.
    Internal,
}

/// The full request set. Exhaustive: the server rejects nothing silently.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    GetInfo,
    GetExperimentLaunchTime { db: String },
    SetExperimentLaunchTime { db: String, launch_time: String },
    GetExperimentStartTime { db: String },
    SetExperimentStartTime { db: String, start_time: String },
    InitializeExperimentStartTime { db: String },
    SetVmMapping { db: String, mapping: VmMapping },
    GetVmMappingByUuid { db: String, server_uuid: String },
    DestroyVmMappingByUuid { db: String, server_uuid: String },
    ListVmMappings { db: String, json_match_dict: String },
    CountVmMappingsNotReady { db: String },
    SetVmTimeByUuid {
        db: String,
        server_uuid: String,
        current_time: String,
    },
    SetVmStateByUuid {
        db: String,
        server_uuid: String,
        state: String,
    },
    DestroyAllVmMappings { db: String },
    ClearDb { db: String },
}

/// The full response set.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Response {
    Info(InfoReply),
    LaunchTime { db: String, launch_time: String },
    StartTime { db: String, start_time: String },
    Mapping(VmMapping),
    // A struct variant: internally tagged enums cannot carry a bare
    // sequence.
    Mappings { mappings: Vec<VmMapping> },
    Count { db: String, count: u32 },
    Empty,
    Error { code: ErrorCode, message: String },
}

/// Errors raised by the codec.
#[derive(Debug, Error, Diagnostic)]
pub enum ProtocolError {
    #[error("connection I/O error: {source}")]
    #[diagnostic(code(embermesh::protocol::io))]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("frame of {len} bytes exceeds the {MAX_FRAME_LEN}-byte limit")]
    #[diagnostic(code(embermesh::protocol::frame_too_large))]
    FrameTooLarge { len: u32 },

    #[error("malformed frame body: {source}")]
    #[diagnostic(code(embermesh::protocol::malformed))]
    Malformed {
        #[from]
        source: serde_json::Error,
    },
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<T, W>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)?;
    let len = body.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { len });
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame. `Ok(None)` on a clean EOF before
/// the length prefix.
pub async fn read_frame<T, R>(reader: &mut R) -> Result<Option<T>, ProtocolError>
where
    T: serde::de::DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { len });
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}
