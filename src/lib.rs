//! # Embermesh: Experiment Orchestration Core
//!
//! Embermesh materializes a virtual network of VMs on a cluster of
//! hypervisor hosts and coordinates per-VM timed activity: scripts,
//! binaries, file drops, file pulls, pauses. The crate covers the control
//! plane of that job, deciding *what* to build and *when* each VM acts,
//! while the hypervisor itself stays an external collaborator behind the
//! guest-agent seam.
//!
//! ## Core Concepts
//!
//! - **Model Components**: Named, manifest-described units of experiment
//!   specification that depend on and provide capability attributes
//! - **Resolver**: Deterministic, canonical ordering over components with
//!   default-provider selection and rendered cycle reports
//! - **Experiment Graph**: The decorable vertex/edge representation of the
//!   virtual network, mutated by per-component plugins
//! - **Schedules**: Per-VM timed entries, negative times before the start
//!   barrier and positive times after it
//! - **Agent**: One cooperative event loop per VM, driving the guest-agent
//!   channel and reporting state
//! - **Coordination Service**: The authoritative registry for VM mappings
//!   and the cluster-wide start barrier
//! - **Object Store**: Content-addressed, cluster-visible blobs for
//!   images, VM resources, and schedules
//!
//! ## Resolving and Building an Experiment
//!
//! ```rust,no_run
//! use embermesh::experiment::{ExperimentBuilder, ExperimentGraph, PluginRegistry};
//! use embermesh::manifests::RepositoryIndex;
//! use embermesh::resolver::{ComponentResolver, InitialComponent};
//! use rustc_hash::FxHashMap;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let index = RepositoryIndex::open("/var/lib/embermesh/repositories.json")?;
//! let resolver = ComponentResolver::from_index(&index, FxHashMap::default())?;
//!
//! let resolution = resolver.resolve(&[
//!     InitialComponent::named("base.topology"),
//!     InitialComponent::named("tests.ping_all"),
//! ])?;
//!
//! let builder = ExperimentBuilder::new(PluginRegistry::new());
//! let mut graph = ExperimentGraph::new();
//! let reports = builder.build(resolution.ordered(), &mut graph);
//! for report in &reports {
//!     println!("{}: errors={} ({:.3}s)", report.component, report.errors, report.time_secs);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Driving a VM
//!
//! Each hypervisor host runs one agent per local VM. The agent pulls its
//! schedule from the store, executes negative-time entries, reports
//! `configured`, waits at the start barrier, then executes positive-time
//! entries on the synchronized clock:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use embermesh::agent::{VmDescriptor, VmResourceHandler};
//! use embermesh::config::Config;
//! use embermesh::coordination::{CoordinationClient, ExperimentTiming};
//! use embermesh::store::{ObjectStore, ScheduleStore};
//!
//! # async fn example(guest: Arc<dyn embermesh::agent::GuestAgent>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_env();
//! let client = Arc::new(CoordinationClient::new(
//!     config.coordination.address(),
//!     config.coordination.db.clone(),
//! ));
//! let timing = ExperimentTiming::new(
//!     Arc::clone(&client),
//!     config.agent.experiment_start_buffer_secs,
//! );
//! let objects = ObjectStore::open(&config.store.root)?;
//! let schedules = ScheduleStore::new(objects.clone());
//!
//! let vm = VmDescriptor {
//!     uuid: "8a54e1f2-0000-4000-8000-9b1f7c3a2d10".into(),
//!     name: "host-0".into(),
//!     control_ip: "172.16.0.10".into(),
//! };
//! let (handler, _control) = VmResourceHandler::new(
//!     vm, guest, client, timing, schedules, objects, config.agent,
//! );
//! let final_state = handler.run().await?;
//! println!("VM finished in state {final_state}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Every module exposes a `thiserror` enum with miette diagnostics.
//! Resolution and decoration errors are fatal to their operation;
//! per-component build errors are values in the builder's report list;
//! agent-side runtime errors are retried with randomized backoff and only
//! then become fatal for that VM, without blocking the rest of the
//! cluster.
//!
//! ## Module Guide
//!
//! - [`manifests`] - Component manifests and the repository index
//! - [`resolver`] - Dependency graph and canonical ordering
//! - [`experiment`] - Experiment graph, decoration, plugins, builder
//! - [`schedule`] - Schedule entries and the agent's event queue
//! - [`agent`] - The per-VM schedule executor and guest-agent seam
//! - [`coordination`] - The coordination service, client, and timing
//! - [`store`] - The object store and schedule envelopes
//! - [`config`] - Constructor-injected configuration
//! - [`utils`] - Retry/backoff and content hashing

pub mod agent;
pub mod config;
pub mod coordination;
pub mod experiment;
pub mod manifests;
pub mod resolver;
pub mod schedule;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod utils;
