//! The schedule blob store: a typed wrapper over the object store.
//!
//! Keys are VM names; values are JSON envelopes
//! `{"server_name": str, "text": base64(schedule bytes), "ip": str}`.
//! Accessors hand back the decoded schedule bytes so callers never touch
//! the envelope encoding.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::object::{ObjectStore, StoreError};

/// On-disk envelope format.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ScheduleEnvelope {
    server_name: String,
    text: String,
    ip: String,
}

/// A decoded schedule listing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedSchedule {
    pub server_name: String,
    pub bytes: Vec<u8>,
    pub ip: String,
}

/// Errors raised by schedule-store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum ScheduleStoreError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error("corrupt schedule envelope for \"{server_name}\": {message}")]
    #[diagnostic(code(embermesh::schedule_store::envelope))]
    Envelope {
        server_name: String,
        message: String,
    },
}

/// Store of per-VM schedules, keyed by VM name.
#[derive(Clone, Debug)]
pub struct ScheduleStore {
    store: ObjectStore,
}

impl ScheduleStore {
    #[must_use]
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    /// Write the schedule for a VM.
    pub async fn put(
        &self,
        server_name: &str,
        schedule_bytes: &[u8],
        ip: &str,
        broadcast: bool,
    ) -> Result<(), ScheduleStoreError> {
        let envelope = ScheduleEnvelope {
            server_name: server_name.to_string(),
            text: BASE64.encode(schedule_bytes),
            ip: ip.to_string(),
        };
        let body = serde_json::to_vec(&envelope).expect("envelopes always serialize");
        self.store.put_bytes(server_name, &body, broadcast).await?;
        Ok(())
    }

    /// Write several schedules.
    pub async fn batch_put(
        &self,
        schedules: &[DecodedSchedule],
        broadcast: bool,
    ) -> Result<(), ScheduleStoreError> {
        for schedule in schedules {
            self.put(&schedule.server_name, &schedule.bytes, &schedule.ip, broadcast)
                .await?;
        }
        Ok(())
    }

    /// Fetch and decode the schedule for a VM. `None` when the VM has no
    /// stored schedule yet.
    pub async fn get(&self, server_name: &str) -> Result<Option<Vec<u8>>, ScheduleStoreError> {
        let file = match self.store.get(server_name) {
            Ok(file) => file,
            Err(StoreError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let raw = file.read().await?;
        Ok(Some(decode_envelope(server_name, &raw)?.1))
    }

    /// Fetch and decode every stored schedule matching `pattern`.
    pub async fn list_all(
        &self,
        pattern: Option<&str>,
    ) -> Result<Vec<DecodedSchedule>, ScheduleStoreError> {
        let mut decoded = Vec::new();
        for name in self.store.list(pattern)? {
            let raw = self.store.get(&name)?.read().await?;
            let (envelope, bytes) = decode_envelope(&name, &raw)?;
            decoded.push(DecodedSchedule {
                server_name: envelope.server_name,
                bytes,
                ip: envelope.ip,
            });
        }
        Ok(decoded)
    }

    /// Remove the schedule for one VM.
    pub fn destroy_one(&self, server_name: &str) -> Result<(), ScheduleStoreError> {
        tracing::debug!(%server_name, "removing schedule");
        self.store.remove(server_name)?;
        Ok(())
    }

    /// Remove every stored schedule.
    pub fn destroy_all(&self) -> Result<(), ScheduleStoreError> {
        tracing::debug!("removing all schedules");
        self.store.remove("*")?;
        Ok(())
    }
}

fn decode_envelope(
    server_name: &str,
    raw: &[u8],
) -> Result<(ScheduleEnvelope, Vec<u8>), ScheduleStoreError> {
    let envelope: ScheduleEnvelope =
        serde_json::from_slice(raw).map_err(|err| ScheduleStoreError::Envelope {
            server_name: server_name.to_string(),
            message: err.to_string(),
        })?;
    let bytes = BASE64
        .decode(&envelope.text)
        .map_err(|err| ScheduleStoreError::Envelope {
            server_name: server_name.to_string(),
            message: format!("invalid base64 text: {err}"),
        })?;
    Ok((envelope, bytes))
}
