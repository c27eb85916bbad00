//! Schedule entries: one timed action against one VM.
//!
//! An entry bundles an optional program execution with the data it needs
//! in the guest (literal content drops, object-store file drops), optional
//! file-transfer-out monitors, and an optional pause. Zero is not a valid
//! start time: the sign carries the phase, so zero would be ambiguous.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while constructing or decoding schedules.
#[derive(Debug, Error, Diagnostic)]
pub enum ScheduleError {
    #[error("schedule entries cannot start at time zero")]
    #[diagnostic(
        code(embermesh::schedule::zero_start),
        help("Use a negative time for the configuration phase or a positive time for the experiment phase.")
    )]
    ZeroStartTime,

    #[error("pause durations must be positive (got {duration})")]
    #[diagnostic(code(embermesh::schedule::bad_pause))]
    NonPositivePause { duration: f64 },

    #[error("failed to decode schedule: {source}")]
    #[diagnostic(code(embermesh::schedule::decode))]
    Decode {
        #[from]
        source: serde_json::Error,
    },
}

/// A data requirement attached to an entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataPayload {
    /// Write literal content into the VM at `location`.
    Content {
        location: String,
        content: String,
        #[serde(default)]
        executable: bool,
    },
    /// Drop an object-store file into the VM at `location`.
    File {
        location: String,
        filename: String,
        #[serde(default)]
        executable: bool,
    },
    /// Monitor an in-VM path and pull it to the host every `interval`
    /// seconds. Files land under `<destination>/<vm_name>/<location>`;
    /// without a destination the configured transfer root is used.
    Transfer {
        location: String,
        interval: f64,
        #[serde(default)]
        destination: Option<String>,
    },
}

/// Duration of a pause entry.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "pause", rename_all = "snake_case")]
pub enum PauseDuration {
    /// Delay subsequent events by this many seconds.
    Finite { seconds: f64 },
    /// A *break*: progress stops until an external resume arrives.
    Break,
}

/// One timed action for one VM.
///
/// # Examples
///
/// ```rust
/// use embermesh::schedule::ScheduleEntry;
///
/// let mut entry = ScheduleEntry::new(-10.0).unwrap();
/// entry.set_executable("/opt/configure.sh");
/// entry.append_argument("--fast");
/// entry.add_content("/etc/motd", "experiment in progress", false);
/// assert_eq!(entry.arguments(), "--fast");
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScheduleEntry {
    start_time: f64,
    #[serde(default)]
    pub ignore_failure: bool,
    #[serde(default)]
    executable: Option<String>,
    #[serde(default)]
    arguments: String,
    #[serde(default)]
    pub data: Vec<DataPayload>,
    #[serde(default)]
    pause: Option<PauseDuration>,
}

impl ScheduleEntry {
    /// Create an entry at the given signed start time.
    pub fn new(start_time: f64) -> Result<Self, ScheduleError> {
        if start_time == 0.0 {
            return Err(ScheduleError::ZeroStartTime);
        }
        Ok(Self {
            start_time,
            ignore_failure: false,
            executable: None,
            arguments: String::new(),
            data: Vec::new(),
            pause: None,
        })
    }

    /// Signed start time. Negative means configuration phase.
    #[must_use]
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Whether this entry belongs to the configuration phase.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        self.start_time < 0.0
    }

    /// Name a program to run inside the VM.
    pub fn set_executable(&mut self, path: impl Into<String>) {
        self.executable = Some(path.into());
    }

    #[must_use]
    pub fn executable(&self) -> Option<&str> {
        self.executable.as_deref()
    }

    /// Append one argument to the space-joined command line.
    pub fn append_argument(&mut self, argument: impl Into<String>) {
        let argument = argument.into();
        if !self.arguments.is_empty() {
            self.arguments.push(' ');
        }
        self.arguments.push_str(&argument);
    }

    /// Append several arguments to the space-joined command line.
    pub fn append_arguments<I, S>(&mut self, arguments: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for argument in arguments {
            self.append_argument(argument);
        }
    }

    /// The accumulated space-joined command line.
    #[must_use]
    pub fn arguments(&self) -> &str {
        &self.arguments
    }

    /// Add a block of content to be written into the VM.
    pub fn add_content(
        &mut self,
        location: impl Into<String>,
        content: impl Into<String>,
        executable: bool,
    ) {
        self.data.push(DataPayload::Content {
            location: location.into(),
            content: content.into(),
            executable,
        });
    }

    /// Drop an object-store file into the VM.
    pub fn add_file(
        &mut self,
        location: impl Into<String>,
        filename: impl Into<String>,
        executable: bool,
    ) {
        self.data.push(DataPayload::File {
            location: location.into(),
            filename: filename.into(),
            executable,
        });
    }

    /// Monitor an in-VM path and pull updates to the host.
    pub fn add_transfer(
        &mut self,
        location: impl Into<String>,
        interval: f64,
        destination: Option<String>,
    ) {
        self.data.push(DataPayload::Transfer {
            location: location.into(),
            interval,
            destination,
        });
    }

    /// Pause all following events.
    ///
    /// To preserve strict intra-window ordering the entry's start time is
    /// nudged to the next representable value above it, so a pause always
    /// sorts after any sibling entry sharing its nominal time.
    pub fn add_pause(&mut self, duration: PauseDuration) -> Result<(), ScheduleError> {
        if let PauseDuration::Finite { seconds } = duration {
            if seconds <= 0.0 {
                return Err(ScheduleError::NonPositivePause { duration: seconds });
            }
        }
        self.start_time = self.start_time.next_up();
        self.pause = Some(duration);
        Ok(())
    }

    #[must_use]
    pub fn pause(&self) -> Option<PauseDuration> {
        self.pause
    }
}

/// A VM's full schedule: entries in insertion order, sortable into
/// execution order.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct VmSchedule {
    entries: Vec<ScheduleEntry>,
}

impl VmSchedule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ScheduleEntry) {
        self.entries.push(entry);
    }

    /// Entries in insertion order.
    #[must_use]
    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in execution order: ascending start time, insertion order
    /// breaking ties (the sort is stable).
    #[must_use]
    pub fn ordered(&self) -> Vec<ScheduleEntry> {
        let mut ordered = self.entries.clone();
        ordered.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
        ordered
    }

    /// Serialize to the canonical JSON byte form stored in schedule
    /// envelopes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("schedules always serialize")
    }

    /// Decode from the canonical JSON byte form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ScheduleError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_start_time_is_rejected() {
        assert!(matches!(
            ScheduleEntry::new(0.0),
            Err(ScheduleError::ZeroStartTime)
        ));
    }

    #[test]
    fn arguments_accumulate_space_joined() {
        let mut entry = ScheduleEntry::new(5.0).unwrap();
        entry.append_argument("--level");
        entry.append_arguments(["7", "--fast"]);
        assert_eq!(entry.arguments(), "--level 7 --fast");
    }

    #[test]
    fn pause_nudges_start_time_after_siblings() {
        let mut plain = ScheduleEntry::new(-10.0).unwrap();
        plain.set_executable("/bin/true");
        let mut paused = ScheduleEntry::new(-10.0).unwrap();
        paused
            .add_pause(PauseDuration::Finite { seconds: 3.0 })
            .unwrap();
        assert!(paused.start_time() > plain.start_time());

        let mut schedule = VmSchedule::new();
        schedule.push(paused.clone());
        schedule.push(plain.clone());
        let ordered = schedule.ordered();
        assert_eq!(ordered[0].executable(), Some("/bin/true"));
        assert!(ordered[1].pause().is_some());
    }

    #[test]
    fn non_positive_pause_is_rejected() {
        let mut entry = ScheduleEntry::new(1.0).unwrap();
        assert!(matches!(
            entry.add_pause(PauseDuration::Finite { seconds: 0.0 }),
            Err(ScheduleError::NonPositivePause { .. })
        ));
    }

    #[test]
    fn schedule_round_trips_through_bytes() {
        let mut schedule = VmSchedule::new();
        let mut entry = ScheduleEntry::new(-30.0).unwrap();
        entry.set_executable("/opt/setup.sh");
        entry.add_file("/opt/payload.bin", "payload.bin", true);
        entry.add_transfer("/var/log/app.log", 30.0, None);
        schedule.push(entry);

        let bytes = schedule.to_bytes();
        let decoded = VmSchedule::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, schedule);
    }

    #[test]
    fn serialization_is_deterministic() {
        let mut schedule = VmSchedule::new();
        let mut entry = ScheduleEntry::new(12.0).unwrap();
        entry.set_executable("/usr/bin/env");
        schedule.push(entry);
        assert_eq!(schedule.to_bytes(), schedule.to_bytes());
    }
}
