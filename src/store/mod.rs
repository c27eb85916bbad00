//! Cluster-visible stores: the content-addressed object store and the
//! schedule-envelope wrapper.

pub mod object;
pub mod schedule;

pub use object::{ObjectStore, PutOutcome, StoreError, StoreFile};
pub use schedule::{DecodedSchedule, ScheduleStore, ScheduleStoreError};
