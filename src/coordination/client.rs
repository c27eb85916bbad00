//! Client for the coordination service.
//!
//! One client owns one connection, re-established on demand. Calls retry
//! connection-level failures with randomized backoff; remote errors (such
//! as "no mapping for uuid") surface immediately. Methods mirror the RPC
//! table one-to-one, with timestamps decoded into `chrono` values and the
//! not-found error collapsed into `Option` where the caller only cares
//! about presence.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::types::VmState;
use crate::utils::RetryPolicy;

use super::protocol::{
    self, ErrorCode, InfoReply, ProtocolError, Request, Response, VmMapping,
};

/// Errors raised by client calls.
#[derive(Debug, Error, Diagnostic)]
pub enum ClientError {
    #[error("unable to reach the coordination service at {addr}")]
    #[diagnostic(
        code(embermesh::coordination::unreachable),
        help("The service may need to be started; check the configured host and port.")
    )]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("coordination service rejected the request ({code:?}): {message}")]
    #[diagnostic(code(embermesh::coordination::remote))]
    Remote { code: ErrorCode, message: String },

    #[error("unexpected reply to {op}")]
    #[diagnostic(code(embermesh::coordination::unexpected_reply))]
    UnexpectedReply { op: &'static str },

    #[error("connection closed mid-call")]
    #[diagnostic(code(embermesh::coordination::closed))]
    Closed,
}

impl ClientError {
    /// Whether another attempt could succeed.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ClientError::Connection { .. }
                | ClientError::Closed
                | ClientError::Protocol(ProtocolError::Io { .. })
        )
    }

    /// Whether this is the remote not-found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ClientError::Remote {
                code: ErrorCode::NotFound,
                ..
            }
        )
    }
}

/// The coordination client. Cheap to share behind an `Arc`.
pub struct CoordinationClient {
    addr: String,
    db: String,
    stream: Mutex<Option<TcpStream>>,
    retry: RetryPolicy,
}

impl CoordinationClient {
    /// Create a client for `addr`, namespaced to `db`.
    #[must_use]
    pub fn new(addr: impl Into<String>, db: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            db: db.into(),
            stream: Mutex::new(None),
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy (tests use a tight one).
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn db(&self) -> &str {
        &self.db
    }

    /// Check that the service is reachable.
    ///
    /// Returns `false` rather than erroring so callers can probe; use
    /// [`get_info`](Self::get_info) when the error matters.
    pub async fn check_connection(&self) -> bool {
        self.get_info().await.is_ok()
    }

    /// `GetInfo`: service version, uptime, and whether any experiment is
    /// running.
    pub async fn get_info(&self) -> Result<InfoReply, ClientError> {
        match self.call("get_info", Request::GetInfo).await? {
            Response::Info(info) => Ok(info),
            other => unexpected("get_info", other),
        }
    }

    /// `GetExperimentLaunchTime`; `None` when no launch has been recorded.
    pub async fn get_experiment_launch_time(
        &self,
    ) -> Result<Option<DateTime<Utc>>, ClientError> {
        let request = Request::GetExperimentLaunchTime { db: self.db.clone() };
        match self.call("get_experiment_launch_time", request).await {
            Ok(Response::LaunchTime { launch_time, .. }) => {
                Ok(parse_time("get_experiment_launch_time", &launch_time)?)
            }
            Ok(other) => unexpected("get_experiment_launch_time", other),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// `SetExperimentLaunchTime`.
    pub async fn set_experiment_launch_time(
        &self,
        launch_time: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ClientError> {
        let request = Request::SetExperimentLaunchTime {
            db: self.db.clone(),
            launch_time: launch_time.to_rfc3339(),
        };
        match self.call("set_experiment_launch_time", request).await? {
            Response::LaunchTime { launch_time, .. } => {
                parse_time("set_experiment_launch_time", &launch_time)?
                    .ok_or(ClientError::UnexpectedReply {
                        op: "set_experiment_launch_time",
                    })
            }
            other => unexpected("set_experiment_launch_time", other),
        }
    }

    /// `GetExperimentStartTime`; `None` when no start has been recorded.
    pub async fn get_experiment_start_time(
        &self,
    ) -> Result<Option<DateTime<Utc>>, ClientError> {
        let request = Request::GetExperimentStartTime { db: self.db.clone() };
        match self.call("get_experiment_start_time", request).await {
            Ok(Response::StartTime { start_time, .. }) => {
                Ok(parse_time("get_experiment_start_time", &start_time)?)
            }
            Ok(other) => unexpected("get_experiment_start_time", other),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// `SetExperimentStartTime`: returns the winning value, which may be
    /// an earlier writer's.
    pub async fn set_experiment_start_time(
        &self,
        start_time: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ClientError> {
        let request = Request::SetExperimentStartTime {
            db: self.db.clone(),
            start_time: start_time.to_rfc3339(),
        };
        match self.call("set_experiment_start_time", request).await? {
            Response::StartTime { start_time, .. } => {
                parse_time("set_experiment_start_time", &start_time)?.ok_or(
                    ClientError::UnexpectedReply {
                        op: "set_experiment_start_time",
                    },
                )
            }
            other => unexpected("set_experiment_start_time", other),
        }
    }

    /// `InitializeExperimentStartTime`: clear the recorded start time.
    pub async fn initialize_experiment_start_time(&self) -> Result<(), ClientError> {
        let request = Request::InitializeExperimentStartTime { db: self.db.clone() };
        match self.call("initialize_experiment_start_time", request).await? {
            Response::Empty => Ok(()),
            other => unexpected("initialize_experiment_start_time", other),
        }
    }

    /// `SetVMMapping`.
    pub async fn set_vm_mapping(&self, mapping: VmMapping) -> Result<VmMapping, ClientError> {
        let request = Request::SetVmMapping {
            db: self.db.clone(),
            mapping,
        };
        match self.call("set_vm_mapping", request).await? {
            Response::Mapping(mapping) => Ok(mapping),
            other => unexpected("set_vm_mapping", other),
        }
    }

    /// `GetVMMappingByUUID`; `None` for an unknown uuid.
    pub async fn get_vm_mapping_by_uuid(
        &self,
        server_uuid: &str,
    ) -> Result<Option<VmMapping>, ClientError> {
        let request = Request::GetVmMappingByUuid {
            db: self.db.clone(),
            server_uuid: server_uuid.to_string(),
        };
        match self.call("get_vm_mapping_by_uuid", request).await {
            Ok(Response::Mapping(mapping)) => Ok(Some(mapping)),
            Ok(other) => unexpected("get_vm_mapping_by_uuid", other),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// `DestroyVMMappingByUUID`.
    pub async fn destroy_vm_mapping_by_uuid(&self, server_uuid: &str) -> Result<(), ClientError> {
        let request = Request::DestroyVmMappingByUuid {
            db: self.db.clone(),
            server_uuid: server_uuid.to_string(),
        };
        match self.call("destroy_vm_mapping_by_uuid", request).await? {
            Response::Empty => Ok(()),
            other => unexpected("destroy_vm_mapping_by_uuid", other),
        }
    }

    /// `ListVMMappings` with an optional field-equality match object.
    pub async fn list_vm_mappings(
        &self,
        json_match: Option<&serde_json::Value>,
    ) -> Result<Vec<VmMapping>, ClientError> {
        let request = Request::ListVmMappings {
            db: self.db.clone(),
            json_match_dict: json_match.map(ToString::to_string).unwrap_or_default(),
        };
        match self.call("list_vm_mappings", request).await? {
            Response::Mappings { mappings } => Ok(mappings),
            other => unexpected("list_vm_mappings", other),
        }
    }

    /// `CountVMMappingsNotReady`: mappings whose state is neither
    /// `configured` nor `N/A`.
    pub async fn count_vm_mappings_not_ready(&self) -> Result<u32, ClientError> {
        let request = Request::CountVmMappingsNotReady { db: self.db.clone() };
        match self.call("count_vm_mappings_not_ready", request).await? {
            Response::Count { count, .. } => Ok(count),
            other => unexpected("count_vm_mappings_not_ready", other),
        }
    }

    /// `SetVMTimeByUUID`: record the VM's current schedule clock.
    pub async fn set_vm_time_by_uuid(
        &self,
        server_uuid: &str,
        current_time: Option<&str>,
    ) -> Result<VmMapping, ClientError> {
        let request = Request::SetVmTimeByUuid {
            db: self.db.clone(),
            server_uuid: server_uuid.to_string(),
            current_time: protocol::nullable::encode(current_time),
        };
        match self.call("set_vm_time_by_uuid", request).await? {
            Response::Mapping(mapping) => Ok(mapping),
            other => unexpected("set_vm_time_by_uuid", other),
        }
    }

    /// `SetVMStateByUUID`.
    pub async fn set_vm_state_by_uuid(
        &self,
        server_uuid: &str,
        state: VmState,
    ) -> Result<VmMapping, ClientError> {
        let request = Request::SetVmStateByUuid {
            db: self.db.clone(),
            server_uuid: server_uuid.to_string(),
            state: state.encode().to_string(),
        };
        match self.call("set_vm_state_by_uuid", request).await? {
            Response::Mapping(mapping) => Ok(mapping),
            other => unexpected("set_vm_state_by_uuid", other),
        }
    }

    /// `DestroyAllVMMappings`.
    pub async fn destroy_all_vm_mappings(&self) -> Result<(), ClientError> {
        let request = Request::DestroyAllVmMappings { db: self.db.clone() };
        match self.call("destroy_all_vm_mappings", request).await? {
            Response::Empty => Ok(()),
            other => unexpected("destroy_all_vm_mappings", other),
        }
    }

    /// `ClearDb`: reinitialize the start time and drop every mapping,
    /// atomically from this caller's view.
    pub async fn clear_db(&self) -> Result<(), ClientError> {
        let request = Request::ClearDb { db: self.db.clone() };
        match self.call("clear_db", request).await? {
            Response::Empty => Ok(()),
            other => unexpected("clear_db", other),
        }
    }

    /// One request/response exchange, with connection-level retries.
    async fn call(&self, op: &'static str, request: Request) -> Result<Response, ClientError> {
        let response = self
            .retry
            .run(op, || self.call_once(&request), ClientError::is_retriable)
            .await?;
        match response {
            Response::Error { code, message } => Err(ClientError::Remote { code, message }),
            other => Ok(other),
        }
    }

    async fn call_once(&self, request: &Request) -> Result<Response, ClientError> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(&self.addr).await.map_err(|source| {
                ClientError::Connection {
                    addr: self.addr.clone(),
                    source,
                }
            })?;
            *guard = Some(stream);
        }
        let stream = guard.as_mut().expect("connection established above");

        let result = async {
            protocol::write_frame(stream, request).await?;
            protocol::read_frame::<Response, _>(stream).await
        }
        .await;

        match result {
            Ok(Some(response)) => Ok(response),
            Ok(None) => {
                *guard = None;
                Err(ClientError::Closed)
            }
            Err(err) => {
                // Drop the broken connection so the next attempt redials.
                *guard = None;
                Err(err.into())
            }
        }
    }
}

fn unexpected<T>(op: &'static str, response: Response) -> Result<T, ClientError> {
    tracing::warn!(op, ?response, "unexpected coordination reply");
    Err(ClientError::UnexpectedReply { op })
}

fn parse_time(
    op: &'static str,
    raw: &str,
) -> Result<Option<DateTime<Utc>>, ClientError> {
    if raw.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|time| Some(time.with_timezone(&Utc)))
        .map_err(|_| ClientError::UnexpectedReply { op })
}
