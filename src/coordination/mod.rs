//! The coordination service: authoritative VM state and experiment timing.
//!
//! One service process per experiment holds the VM mapping table and the
//! two experiment timestamps (launch and start). Agents and controllers
//! talk to it over a framed TCP protocol: 4-byte big-endian length prefix,
//! JSON body. The service is in-memory; a restart implies an experiment
//! restart.

pub mod client;
pub mod protocol;
pub mod server;
pub mod timing;

pub use client::{ClientError, CoordinationClient};
pub use protocol::{InfoReply, ProtocolError, Request, Response, VmMapping};
pub use server::{CoordinationServer, ServerError};
pub use timing::ExperimentTiming;
