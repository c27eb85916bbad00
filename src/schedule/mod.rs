//! Per-VM schedules: timed entries and the agent's event queue.
//!
//! A schedule is an ordered sequence of entries keyed by a signed start
//! time: negative times run during the configuration phase (relative to VM
//! boot), positive times during the experiment phase (relative to the
//! cluster-synchronized start). Entries serialize deterministically so a
//! schedule round-trips byte-identically through the object store.

pub mod entry;
pub mod event;

pub use entry::{DataPayload, PauseDuration, ScheduleEntry, ScheduleError, VmSchedule};
pub use event::{EventQueue, ScheduleEvent, ScheduleEventType};
