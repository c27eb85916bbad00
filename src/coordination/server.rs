//! The coordination service process.
//!
//! State is in-memory and namespaced by the request's `db` field, so a
//! production experiment and a test run can share one process without
//! touching each other. All writes are serialized through one lock; the
//! request volume here is small (state transitions and barrier polls, not
//! data traffic).

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::types::VmState;

use super::protocol::{
    self, ErrorCode, InfoReply, ProtocolError, Request, Response, VmMapping,
};

/// Errors raised by the server's accept loop.
#[derive(Debug, Error, Diagnostic)]
pub enum ServerError {
    #[error("failed to bind coordination service to {addr}: {source}")]
    #[diagnostic(code(embermesh::coordination::bind))]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept failed: {source}")]
    #[diagnostic(code(embermesh::coordination::accept))]
    Accept {
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default)]
struct DbState {
    launch_time: Option<DateTime<Utc>>,
    start_time: Option<DateTime<Utc>>,
    mappings: FxHashMap<String, VmMapping>,
    /// Registration order, for stable listings.
    order: Vec<String>,
}

impl DbState {
    fn insert_mapping(&mut self, mapping: VmMapping) {
        if !self.mappings.contains_key(&mapping.server_uuid) {
            self.order.push(mapping.server_uuid.clone());
        }
        self.mappings.insert(mapping.server_uuid.clone(), mapping);
    }

    fn remove_mapping(&mut self, server_uuid: &str) -> Option<VmMapping> {
        self.order.retain(|uuid| uuid != server_uuid);
        self.mappings.remove(server_uuid)
    }

    fn listed(&self) -> Vec<VmMapping> {
        self.order
            .iter()
            .filter_map(|uuid| self.mappings.get(uuid).cloned())
            .collect()
    }
}

#[derive(Debug, Default)]
struct ServiceState {
    dbs: FxHashMap<String, DbState>,
}

impl ServiceState {
    fn db(&mut self, name: &str) -> &mut DbState {
        self.dbs.entry(name.to_string()).or_default()
    }
}

/// The coordination service: bind once, then serve forever.
///
/// # Examples
///
/// ```rust,no_run
/// use embermesh::coordination::CoordinationServer;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let server = CoordinationServer::bind("127.0.0.1:50059").await?;
/// tokio::spawn(server.serve());
/// # Ok(())
/// # }
/// ```
pub struct CoordinationServer {
    listener: TcpListener,
    state: Arc<Mutex<ServiceState>>,
    started: Instant,
}

impl CoordinationServer {
    /// Bind the service socket. Use port 0 for an ephemeral port.
    pub async fn bind(addr: &str) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            state: Arc::new(Mutex::new(ServiceState::default())),
            started: Instant::now(),
        })
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until the task is dropped.
    pub async fn serve(self) -> Result<(), ServerError> {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "coordination service listening");
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .map_err(|source| ServerError::Accept { source })?;
            tracing::debug!(%peer, "accepted coordination connection");
            let state = Arc::clone(&self.state);
            let started = self.started;
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, state, started).await {
                    tracing::debug!(%peer, error = %err, "connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    state: Arc<Mutex<ServiceState>>,
    started: Instant,
) -> Result<(), ProtocolError> {
    loop {
        let Some(request) = protocol::read_frame::<Request, _>(&mut stream).await? else {
            return Ok(());
        };
        let response = {
            let mut guard = state.lock().await;
            dispatch(&mut guard, started, request)
        };
        protocol::write_frame(&mut stream, &response).await?;
    }
}

fn dispatch(state: &mut ServiceState, started: Instant, request: Request) -> Response {
    match request {
        Request::GetInfo => {
            let experiment_running = state
                .dbs
                .values()
                .any(|db| db.start_time.is_some());
            Response::Info(InfoReply {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime: started.elapsed().as_secs_f64(),
                experiment_running,
            })
        }

        Request::GetExperimentLaunchTime { db } => {
            match state.db(&db).launch_time {
                Some(time) => Response::LaunchTime {
                    db,
                    launch_time: time.to_rfc3339(),
                },
                None => not_found("no launch time recorded"),
            }
        }

        Request::SetExperimentLaunchTime { db, launch_time } => {
            match parse_time(&launch_time) {
                Some(time) => {
                    state.db(&db).launch_time = Some(time);
                    Response::LaunchTime {
                        db,
                        launch_time: time.to_rfc3339(),
                    }
                }
                None => invalid("unparseable launch_time"),
            }
        }

        Request::GetExperimentStartTime { db } => match state.db(&db).start_time {
            Some(time) => Response::StartTime {
                db,
                start_time: time.to_rfc3339(),
            },
            None => not_found("no start time recorded"),
        },

        Request::SetExperimentStartTime { db, start_time } => {
            match parse_time(&start_time) {
                Some(proposed) => {
                    // Set exactly once: concurrent writers converge on the
                    // first successful write and every caller reads the
                    // winning value back.
                    let db_state = state.db(&db);
                    let winner = *db_state.start_time.get_or_insert(proposed);
                    Response::StartTime {
                        db,
                        start_time: winner.to_rfc3339(),
                    }
                }
                None => invalid("unparseable start_time"),
            }
        }

        Request::InitializeExperimentStartTime { db } => {
            state.db(&db).start_time = None;
            Response::Empty
        }

        Request::SetVmMapping { db, mapping } => {
            let db_state = state.db(&db);
            db_state.insert_mapping(mapping.clone());
            Response::Mapping(mapping)
        }

        Request::GetVmMappingByUuid { db, server_uuid } => {
            match state.db(&db).mappings.get(&server_uuid) {
                Some(mapping) => Response::Mapping(mapping.clone()),
                None => not_found("no mapping for uuid"),
            }
        }

        Request::DestroyVmMappingByUuid { db, server_uuid } => {
            state.db(&db).remove_mapping(&server_uuid);
            Response::Empty
        }

        Request::ListVmMappings { db, json_match_dict } => {
            let matcher = match parse_match_dict(&json_match_dict) {
                Ok(matcher) => matcher,
                Err(message) => return invalid(&message),
            };
            let mappings = state
                .db(&db)
                .listed()
                .into_iter()
                .filter(|mapping| matches(mapping, &matcher))
                .collect();
            Response::Mappings { mappings }
        }

        Request::CountVmMappingsNotReady { db } => {
            let count = state
                .db(&db)
                .mappings
                .values()
                .filter(|mapping| !VmState::decode(&mapping.state).is_ready())
                .count() as u32;
            Response::Count { db, count }
        }

        Request::SetVmTimeByUuid {
            db,
            server_uuid,
            current_time,
        } => {
            let db_state = state.db(&db);
            match db_state.mappings.get_mut(&server_uuid) {
                Some(mapping) => {
                    mapping.current_time = current_time;
                    Response::Mapping(mapping.clone())
                }
                None => not_found("no mapping for uuid"),
            }
        }

        Request::SetVmStateByUuid {
            db,
            server_uuid,
            state: vm_state,
        } => {
            let db_state = state.db(&db);
            match db_state.mappings.get_mut(&server_uuid) {
                Some(mapping) => {
                    mapping.state = vm_state;
                    Response::Mapping(mapping.clone())
                }
                None => not_found("no mapping for uuid"),
            }
        }

        Request::DestroyAllVmMappings { db } => {
            let db_state = state.db(&db);
            db_state.mappings.clear();
            db_state.order.clear();
            Response::Empty
        }

        Request::ClearDb { db } => {
            // Atomic from the caller's view: one lock hold reinitializes
            // the start time and drops every mapping.
            let db_state = state.db(&db);
            db_state.start_time = None;
            db_state.mappings.clear();
            db_state.order.clear();
            Response::Empty
        }
    }
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

fn parse_match_dict(raw: &str) -> Result<FxHashMap<String, String>, String> {
    if raw.is_empty() {
        return Ok(FxHashMap::default());
    }
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|err| format!("bad json_match_dict: {err}"))?;
    let object = value
        .as_object()
        .ok_or_else(|| "json_match_dict must be an object".to_string())?;
    Ok(object
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), rendered)
        })
        .collect())
}

fn matches(mapping: &VmMapping, matcher: &FxHashMap<String, String>) -> bool {
    matcher.iter().all(|(key, expected)| {
        let actual = match key.as_str() {
            "server_uuid" => Some(&mapping.server_uuid),
            "server_name" => Some(&mapping.server_name),
            "control_ip" => Some(&mapping.control_ip),
            "state" => Some(&mapping.state),
            "current_time" => Some(&mapping.current_time),
            _ => None,
        };
        actual.is_some_and(|actual| actual == expected)
    })
}

fn not_found(message: &str) -> Response {
    Response::Error {
        code: ErrorCode::NotFound,
        message: message.to_string(),
    }
}

fn invalid(message: &str) -> Response {
    Response::Error {
        code: ErrorCode::Invalid,
        message: message.to_string(),
    }
}
