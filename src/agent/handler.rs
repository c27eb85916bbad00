//! The per-VM resource handler: one agent task driving one VM.
//!
//! The handler is a single cooperative event loop over a priority queue
//! keyed by `(start_time, insertion_seq)`. Suspension points are timed
//! waits, guest I/O, coordination RPCs, store reads, and transfer ticks;
//! every one of them observes the control channel, so cancellation and
//! break-resumes are never missed.
//!
//! Lifecycle: handshake → `configuring` (negative entries) → `configured`
//! (start barrier) → `running` (positive entries) → `exited`, with
//! `rebooting` entered whenever the guest signals a reboot and left once
//! the session is re-established at the entry after the trigger.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::config::AgentConfig;
use crate::coordination::{ClientError, CoordinationClient, ExperimentTiming};
use crate::schedule::{
    DataPayload, EventQueue, ScheduleEntry, ScheduleError, ScheduleEvent, ScheduleEventType,
    VmSchedule,
};
use crate::store::{ObjectStore, ScheduleStore, ScheduleStoreError, StoreError};
use crate::types::{ExitDisposition, VmState};
use crate::utils::RetryPolicy;

use super::guest::{GuestAgent, GuestError};

/// Identity of the VM an agent drives.
#[derive(Clone, Debug)]
pub struct VmDescriptor {
    pub uuid: String,
    pub name: String,
    pub control_ip: String,
}

/// External control events delivered to a running agent.
#[derive(Clone, Debug)]
pub enum ControlEvent {
    /// Release a break (infinite pause).
    Resume,
    /// Tear the agent down: drain, cancel transfers, report `exited`.
    Cancel,
    /// Inject a new schedule entry mid-run.
    NewEntry(ScheduleEntry),
}

/// Errors fatal to an agent. The VM's state becomes `exited` when one
/// surfaces.
#[derive(Debug, Error, Diagnostic)]
pub enum HandlerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Guest(#[from] GuestError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Coordination(#[from] ClientError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    ScheduleStore(#[from] ScheduleStoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("entry program \"{executable}\" exited with code {exit_code}")]
    #[diagnostic(
        code(embermesh::agent::entry_failed),
        help("Set `ignore_failure` on the entry to demote this to a warning.")
    )]
    EntryFailed { executable: String, exit_code: i32 },

    #[error("host-side I/O failed at {path}: {source}")]
    #[diagnostic(code(embermesh::agent::host_io))]
    HostIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Which phase the loop is in, for state restoration after a reboot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Configuration,
    Experiment,
}

impl Phase {
    fn state(self) -> VmState {
        match self {
            Phase::Configuration => VmState::Configuring,
            Phase::Experiment => VmState::Running,
        }
    }
}

/// Outcome of handling one event.
enum EventAction {
    Continue,
    Exit,
}

/// The agent itself.
pub struct VmResourceHandler {
    vm: VmDescriptor,
    guest: Arc<dyn GuestAgent>,
    client: Arc<CoordinationClient>,
    timing: ExperimentTiming,
    schedules: ScheduleStore,
    objects: ObjectStore,
    config: AgentConfig,
    control: flume::Receiver<ControlEvent>,
    retry: RetryPolicy,

    cancelled: bool,
    draining: bool,
    pending_entries: usize,
    last_reported_time: Option<f64>,
    /// Entries injected over the control channel before the queue exists.
    injected: Vec<ScheduleEntry>,
    /// Last observed (mtime, size) per monitored in-VM path.
    transfers_seen: FxHashMap<String, (i64, u64)>,
}

impl VmResourceHandler {
    /// Create a handler and the control-channel sender paired with it.
    pub fn new(
        vm: VmDescriptor,
        guest: Arc<dyn GuestAgent>,
        client: Arc<CoordinationClient>,
        timing: ExperimentTiming,
        schedules: ScheduleStore,
        objects: ObjectStore,
        config: AgentConfig,
    ) -> (Self, flume::Sender<ControlEvent>) {
        let (tx, rx) = flume::unbounded();
        let handler = Self {
            vm,
            guest,
            client,
            timing,
            schedules,
            objects,
            config,
            control: rx,
            retry: RetryPolicy::default(),
            cancelled: false,
            draining: false,
            pending_entries: 0,
            last_reported_time: None,
            injected: Vec::new(),
            transfers_seen: FxHashMap::default(),
        };
        (handler, tx)
    }

    /// Override the handshake/reconnect retry policy (tests use a tight
    /// one).
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Drive the VM's schedule to completion.
    ///
    /// Always leaves the published state terminal: `exited` on both the
    /// success and the failure path.
    pub async fn run(mut self) -> Result<VmState, HandlerError> {
        match self.run_inner().await {
            Ok(state) => Ok(state),
            Err(err) => {
                tracing::error!(vm = %self.vm.name, error = %err, "agent failed; marking VM exited");
                let _ = self.publish_state(VmState::Exited).await;
                Err(err)
            }
        }
    }

    async fn run_inner(&mut self) -> Result<VmState, HandlerError> {
        self.handshake().await?;
        self.publish_state(VmState::Configuring).await?;

        let Some(schedule) = self.wait_for_schedule().await? else {
            self.publish_state(VmState::Exited).await?;
            return Ok(VmState::Exited);
        };

        let mut queue = EventQueue::new();
        if schedule.is_empty() {
            queue.push(ScheduleEvent::new(ScheduleEventType::EmptySchedule, 0.0));
        } else {
            for entry in schedule.ordered() {
                let fire_at = entry.start_time();
                self.pending_entries += 1;
                queue.push(ScheduleEvent::new(ScheduleEventType::NewItem, fire_at).with_entry(entry));
            }
        }

        // Configuration phase: everything strictly before time zero.
        loop {
            self.drain_injected(&mut queue);
            let Some(fire_at) = queue.peek_fire_at() else {
                break;
            };
            if fire_at >= 0.0 {
                break;
            }
            let event = queue.pop().expect("peeked event is present");
            match self.handle_event(event, &mut queue, Phase::Configuration).await? {
                EventAction::Continue => {}
                EventAction::Exit => {
                    self.publish_state(VmState::Exited).await?;
                    return Ok(VmState::Exited);
                }
            }
            if self.cancelled {
                return self.finish_cancelled().await;
            }
        }

        self.publish_state(VmState::Configured).await?;
        self.report_time(None).await?;

        let Some(start_time) = self.wait_for_start().await? else {
            return self.finish_cancelled().await;
        };
        queue.push(ScheduleEvent::new(
            ScheduleEventType::ExperimentStartTimeSet,
            0.0,
        ));
        self.publish_state(VmState::Running).await?;
        if self.pending_entries == 0 {
            // Only transfer ticks (if any) remain; they must not re-arm or
            // the queue never drains.
            self.draining = true;
        }

        // Experiment phase: the synchronized clock is wall time minus the
        // published start time.
        loop {
            self.drain_injected(&mut queue);
            let Some(fire_at) = queue.peek_fire_at() else {
                break;
            };
            let now_rel = relative_now(start_time);
            if fire_at > now_rel {
                let wait = Duration::from_secs_f64(fire_at - now_rel);
                if self.sleep_observing_control(&mut queue, wait).await {
                    return self.finish_cancelled().await;
                }
                // A NewEntry may have arrived with an earlier time.
                continue;
            }
            let event = queue.pop().expect("peeked event is present");
            match self
                .handle_event(event, &mut queue, Phase::Experiment)
                .await?
            {
                EventAction::Continue => {}
                EventAction::Exit => break,
            }
            if self.cancelled {
                return self.finish_cancelled().await;
            }
        }

        self.publish_state(VmState::Exited).await?;
        tracing::info!(vm = %self.vm.name, "schedule drained; agent exiting");
        Ok(VmState::Exited)
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    async fn handle_event(
        &mut self,
        event: ScheduleEvent,
        queue: &mut EventQueue,
        phase: Phase,
    ) -> Result<EventAction, HandlerError> {
        match event.event_type {
            ScheduleEventType::NewItem => {
                let entry = event.entry.expect("NewItem events carry their entry");
                self.run_entry(&entry, queue, phase).await?;
                self.pending_entries = self.pending_entries.saturating_sub(1);
                if self.pending_entries == 0 && phase == Phase::Experiment {
                    self.draining = true;
                    queue.push(ScheduleEvent::new(ScheduleEventType::Exit, event.fire_at));
                }
                Ok(EventAction::Continue)
            }
            ScheduleEventType::Transfer => {
                let payload = event.transfer.expect("Transfer events carry their payload");
                self.transfer_tick(&payload).await?;
                if !self.draining {
                    if let DataPayload::Transfer { interval, .. } = &payload {
                        queue.push(
                            ScheduleEvent::new(
                                ScheduleEventType::Transfer,
                                event.fire_at + interval,
                            )
                            .with_transfer(payload.clone()),
                        );
                    }
                }
                Ok(EventAction::Continue)
            }
            ScheduleEventType::Pause => {
                if let Some(entry) = event.entry {
                    if let Some(pause) = entry.pause() {
                        self.apply_pause(pause, queue).await;
                    }
                }
                Ok(EventAction::Continue)
            }
            ScheduleEventType::Resume => {
                tracing::debug!(vm = %self.vm.name, "resume event observed outside a break");
                Ok(EventAction::Continue)
            }
            ScheduleEventType::ExperimentStartTimeSet => {
                tracing::info!(vm = %self.vm.name, "experiment start time set; entering running phase");
                Ok(EventAction::Continue)
            }
            ScheduleEventType::EmptySchedule => {
                tracing::info!(vm = %self.vm.name, "schedule is empty");
                Ok(EventAction::Exit)
            }
            ScheduleEventType::Exit => Ok(EventAction::Exit),
            ScheduleEventType::Unknown => {
                tracing::warn!(vm = %self.vm.name, "dropping unknown event");
                Ok(EventAction::Continue)
            }
        }
    }

    async fn run_entry(
        &mut self,
        entry: &ScheduleEntry,
        queue: &mut EventQueue,
        phase: Phase,
    ) -> Result<(), HandlerError> {
        self.report_time(Some(entry.start_time())).await?;
        self.stage_payloads(entry, queue).await?;

        if entry.executable().is_some() {
            let rebooted = self.launch_program(entry).await?;
            // The exit code and the marker file are idempotent reboot
            // signals: whichever fires first wins, the other is absorbed
            // during reconnect.
            let marker = self.reboot_marker_present().await;
            if rebooted || marker {
                self.handle_reboot(phase).await?;
            }
        }

        if let Some(pause) = entry.pause() {
            self.apply_pause(pause, queue).await;
        }
        Ok(())
    }

    /// Push entry payloads into the guest; transfer payloads become queue
    /// ticks instead.
    async fn stage_payloads(
        &mut self,
        entry: &ScheduleEntry,
        queue: &mut EventQueue,
    ) -> Result<(), HandlerError> {
        for payload in &entry.data {
            match payload {
                DataPayload::Content {
                    location,
                    content,
                    executable,
                } => {
                    self.guest
                        .file_write(location, content.as_bytes(), *executable)
                        .await?;
                }
                DataPayload::File {
                    location,
                    filename,
                    executable,
                } => {
                    let bytes = self.objects.get(filename)?.read().await?;
                    self.guest.file_write(location, &bytes, *executable).await?;
                }
                DataPayload::Transfer { interval, .. } => {
                    queue.push(
                        ScheduleEvent::new(
                            ScheduleEventType::Transfer,
                            entry.start_time() + interval,
                        )
                        .with_transfer(payload.clone()),
                    );
                }
            }
        }
        Ok(())
    }

    /// Dispatch the entry's program and poll it to completion.
    ///
    /// Returns whether the exit code signalled a reboot.
    async fn launch_program(&mut self, entry: &ScheduleEntry) -> Result<bool, HandlerError> {
        let executable = entry
            .executable()
            .expect("caller checked the entry has an executable")
            .to_string();

        // The in-VM launcher reads its invocation from a call-arguments
        // file next to the program: path, space-joined arguments, flags.
        let call_args = format!(
            "{executable}\n{}\n{}\n",
            entry.arguments(),
            u8::from(entry.ignore_failure)
        );
        self.guest
            .file_write(
                &format!("{executable}.call_arguments"),
                call_args.as_bytes(),
                false,
            )
            .await?;

        tracing::info!(vm = %self.vm.name, %executable, args = entry.arguments(), "dispatching program");
        let handle = self.guest.exec(&executable, entry.arguments()).await?;

        let exit_code = loop {
            let status = self.guest.exec_status(handle).await?;
            self.append_transcript(&status.stdout, &status.stderr).await?;
            if !status.running {
                break status.exit_code.unwrap_or(-1);
            }
            tokio::time::sleep(self.config.exec_poll_interval).await;
        };

        match ExitDisposition::classify(
            exit_code,
            self.guest.reboot_exit_code(),
            entry.ignore_failure,
        ) {
            ExitDisposition::Success => Ok(false),
            ExitDisposition::Skipped => {
                tracing::debug!(vm = %self.vm.name, %executable, "program reports already installed; skipping");
                Ok(false)
            }
            ExitDisposition::Reboot => {
                tracing::info!(vm = %self.vm.name, %executable, "program requested a reboot");
                Ok(true)
            }
            ExitDisposition::Warning => {
                tracing::warn!(
                    vm = %self.vm.name,
                    %executable,
                    exit_code,
                    "program failed but the entry ignores failures"
                );
                Ok(false)
            }
            ExitDisposition::Failure => Err(HandlerError::EntryFailed {
                executable,
                exit_code,
            }),
        }
    }

    async fn append_transcript(&self, stdout: &str, stderr: &str) -> Result<(), HandlerError> {
        if stdout.is_empty() && stderr.is_empty() {
            return Ok(());
        }
        let dir = &self.config.transcript_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| HandlerError::HostIo {
                path: dir.clone(),
                source,
            })?;
        let path = dir.join(format!("{}.log", self.vm.name));
        let mut contents = String::new();
        contents.push_str(stdout);
        contents.push_str(stderr);
        append_file(&path, contents.as_bytes()).await
    }

    // ------------------------------------------------------------------
    // Reboot handling
    // ------------------------------------------------------------------

    async fn reboot_marker_present(&self) -> bool {
        match self.guest.file_stat(&self.config.reboot_marker_path).await {
            Ok(stat) => stat.exists,
            Err(err) => {
                tracing::debug!(vm = %self.vm.name, error = %err, "reboot-marker probe failed");
                false
            }
        }
    }

    /// Re-establish the guest session after a reboot, then continue at the
    /// entry immediately after the trigger (the queue already points
    /// there).
    async fn handle_reboot(&mut self, phase: Phase) -> Result<(), HandlerError> {
        self.publish_state(VmState::Rebooting).await?;
        self.handshake().await?;
        // Absorb the marker so a second detection cannot fire for the
        // same reboot.
        if let Err(err) = self.guest.file_remove(&self.config.reboot_marker_path).await {
            tracing::debug!(vm = %self.vm.name, error = %err, "could not clear reboot marker");
        }
        self.publish_state(phase.state()).await?;
        tracing::info!(vm = %self.vm.name, "guest session re-established after reboot");
        Ok(())
    }

    /// Ping/sync handshake with bounded randomized backoff.
    async fn handshake(&self) -> Result<(), HandlerError> {
        let guest = Arc::clone(&self.guest);
        self.retry
            .run(
                "guest_handshake",
                || {
                    let guest = Arc::clone(&guest);
                    async move {
                        guest.ping().await?;
                        guest.sync().await
                    }
                },
                GuestError::is_retriable,
            )
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    async fn transfer_tick(&mut self, payload: &DataPayload) -> Result<(), HandlerError> {
        let DataPayload::Transfer {
            location,
            destination,
            ..
        } = payload
        else {
            return Ok(());
        };

        let stat = self.guest.file_stat(location).await?;
        if !stat.exists {
            return Ok(());
        }
        let current = (stat.mtime_ms, stat.size);
        if self.transfers_seen.get(location) == Some(&current) {
            return Ok(());
        }

        let bytes = self.guest.file_read(location).await?;
        let dest_root = destination
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.transfer_root.join("transfers"));
        let host_path = dest_root
            .join(&self.vm.name)
            .join(location.trim_start_matches('/'));
        if let Some(parent) = host_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| HandlerError::HostIo {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&host_path, &bytes)
            .await
            .map_err(|source| HandlerError::HostIo {
                path: host_path.clone(),
                source,
            })?;
        self.transfers_seen.insert(location.clone(), current);
        tracing::debug!(
            vm = %self.vm.name,
            %location,
            dest = %host_path.display(),
            size = bytes.len(),
            "pulled transfer file"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pauses and control
    // ------------------------------------------------------------------

    async fn apply_pause(
        &mut self,
        pause: crate::schedule::PauseDuration,
        queue: &mut EventQueue,
    ) {
        match pause {
            crate::schedule::PauseDuration::Finite { seconds } => {
                tracing::info!(vm = %self.vm.name, seconds, "pausing schedule");
                if self
                    .sleep_observing_control(queue, Duration::from_secs_f64(seconds))
                    .await
                {
                    self.cancelled = true;
                }
            }
            crate::schedule::PauseDuration::Break => {
                tracing::info!(vm = %self.vm.name, "break: waiting for an external resume");
                let control = self.control.clone();
                loop {
                    match control.recv_async().await {
                        Ok(ControlEvent::Resume) => {
                            tracing::info!(vm = %self.vm.name, "break released");
                            return;
                        }
                        Ok(ControlEvent::Cancel) => {
                            self.cancelled = true;
                            return;
                        }
                        Ok(ControlEvent::NewEntry(entry)) => {
                            self.enqueue_entry(queue, entry);
                        }
                        Err(_) => {
                            tracing::warn!(
                                vm = %self.vm.name,
                                "control channel closed during a break; cancelling"
                            );
                            self.cancelled = true;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Sleep for `duration` while staying responsive to control events.
    /// Returns `true` when cancelled.
    async fn sleep_observing_control(
        &mut self,
        queue: &mut EventQueue,
        duration: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + duration;
        let control = self.control.clone();
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                msg = control.recv_async() => match msg {
                    Ok(ControlEvent::Cancel) => return true,
                    Ok(ControlEvent::Resume) => {}
                    Ok(ControlEvent::NewEntry(entry)) => {
                        self.enqueue_entry(queue, entry);
                        return false;
                    }
                    Err(_) => {
                        tokio::time::sleep_until(deadline).await;
                        return false;
                    }
                },
            }
        }
    }

    fn enqueue_entry(&mut self, queue: &mut EventQueue, entry: ScheduleEntry) {
        self.pending_entries += 1;
        self.draining = false;
        let fire_at = entry.start_time();
        queue.push(ScheduleEvent::new(ScheduleEventType::NewItem, fire_at).with_entry(entry));
    }

    /// Non-blocking drain of the control channel. Injected entries are
    /// buffered until a queue exists to hold them.
    fn poll_control(&mut self) {
        loop {
            match self.control.try_recv() {
                Ok(ControlEvent::Cancel) => {
                    self.cancelled = true;
                    return;
                }
                Ok(ControlEvent::Resume) => {}
                Ok(ControlEvent::NewEntry(entry)) => self.injected.push(entry),
                Err(_) => return,
            }
        }
    }

    /// Move buffered injected entries into the live queue.
    fn drain_injected(&mut self, queue: &mut EventQueue) {
        for entry in std::mem::take(&mut self.injected) {
            self.enqueue_entry(queue, entry);
        }
    }

    // ------------------------------------------------------------------
    // Coordination
    // ------------------------------------------------------------------

    async fn publish_state(&self, state: VmState) -> Result<(), HandlerError> {
        tracing::debug!(vm = %self.vm.name, %state, "publishing VM state");
        match self.client.set_vm_state_by_uuid(&self.vm.uuid, state).await {
            Ok(_) => Ok(()),
            // A missing mapping means the experiment was torn down under
            // us; the caller will observe cancellation separately.
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn report_time(&mut self, time: Option<f64>) -> Result<(), HandlerError> {
        if time == self.last_reported_time {
            return Ok(());
        }
        self.last_reported_time = time;
        let rendered = time.map(format_schedule_time);
        match self
            .client
            .set_vm_time_by_uuid(&self.vm.uuid, rendered.as_deref())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Poll the schedule store until this VM's schedule appears.
    async fn wait_for_schedule(&mut self) -> Result<Option<VmSchedule>, HandlerError> {
        loop {
            self.poll_control();
            if self.cancelled {
                return Ok(None);
            }
            if let Some(bytes) = self.schedules.get(&self.vm.name).await? {
                return Ok(Some(VmSchedule::from_bytes(&bytes)?));
            }
            if self.mapping_gone().await? {
                self.cancelled = true;
                return Ok(None);
            }
            tokio::time::sleep(self.config.start_poll_interval).await;
        }
    }

    /// Park at the start barrier; any agent may request start-time
    /// initialization once every VM is ready.
    async fn wait_for_start(&mut self) -> Result<Option<DateTime<Utc>>, HandlerError> {
        loop {
            self.poll_control();
            if self.cancelled {
                return Ok(None);
            }
            if let Some(start) = self.timing.get_start_time().await? {
                return Ok(Some(start));
            }
            if self.client.count_vm_mappings_not_ready().await? == 0 {
                let start = self.timing.add_start_time().await?;
                return Ok(Some(start));
            }
            if self.mapping_gone().await? {
                self.cancelled = true;
                return Ok(None);
            }
            tokio::time::sleep(self.config.start_poll_interval).await;
        }
    }

    async fn mapping_gone(&self) -> Result<bool, HandlerError> {
        Ok(self
            .client
            .get_vm_mapping_by_uuid(&self.vm.uuid)
            .await?
            .is_none())
    }

    async fn finish_cancelled(&mut self) -> Result<VmState, HandlerError> {
        tracing::info!(vm = %self.vm.name, "agent cancelled; draining");
        self.draining = true;
        self.transfers_seen.clear();
        self.publish_state(VmState::Exited).await?;
        Ok(VmState::Exited)
    }
}

fn relative_now(start_time: DateTime<Utc>) -> f64 {
    (Utc::now() - start_time).num_milliseconds() as f64 / 1000.0
}

/// Render a schedule time the way mappings expect: integral times without
/// a fractional part.
fn format_schedule_time(time: f64) -> String {
    if time.fract() == 0.0 {
        format!("{}", time as i64)
    } else {
        format!("{time}")
    }
}

async fn append_file(path: &std::path::Path, bytes: &[u8]) -> Result<(), HandlerError> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|source| HandlerError::HostIo {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(bytes)
        .await
        .map_err(|source| HandlerError::HostIo {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(())
}
