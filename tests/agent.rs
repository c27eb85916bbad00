mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::FakeGuest;
use embermesh::agent::{
    register_vm, ControlEvent, VmDescriptor, VmResourceHandler,
};
use embermesh::config::AgentConfig;
use embermesh::coordination::{CoordinationClient, CoordinationServer, ExperimentTiming};
use embermesh::schedule::{PauseDuration, ScheduleEntry, VmSchedule};
use embermesh::store::{ObjectStore, ScheduleStore};
use embermesh::types::VmState;
use embermesh::utils::RetryPolicy;
use tempfile::TempDir;

struct Cluster {
    base: TempDir,
    addr: String,
    client: Arc<CoordinationClient>,
    timing: ExperimentTiming,
    objects: ObjectStore,
    schedules: ScheduleStore,
}

async fn cluster() -> Cluster {
    let base = TempDir::new().unwrap();
    let server = CoordinationServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    tokio::spawn(server.serve());

    let client =
        Arc::new(CoordinationClient::new(addr.clone(), "test").with_retry(RetryPolicy::quick()));
    let timing = ExperimentTiming::new(Arc::clone(&client), 0);
    let objects = ObjectStore::open(base.path().join("store")).unwrap();
    let schedules = ScheduleStore::new(objects.clone());
    Cluster {
        base,
        addr,
        client,
        timing,
        objects,
        schedules,
    }
}

fn agent_config(base: &TempDir) -> AgentConfig {
    AgentConfig {
        experiment_start_buffer_secs: 0,
        transfer_root: base.path().join("transfers"),
        transcript_dir: base.path().join("transcripts"),
        exec_poll_interval: Duration::from_millis(10),
        start_poll_interval: Duration::from_millis(25),
        ..AgentConfig::default()
    }
}

fn descriptor(n: u32) -> VmDescriptor {
    VmDescriptor {
        uuid: format!("uuid-{n}"),
        name: format!("host-{n}"),
        control_ip: format!("172.16.0.{}", 10 + n),
    }
}

async fn spawn_agent(
    cluster: &Cluster,
    vm: VmDescriptor,
    guest: Arc<FakeGuest>,
) -> (
    tokio::task::JoinHandle<Result<VmState, embermesh::agent::HandlerError>>,
    flume::Sender<ControlEvent>,
) {
    register_vm(&cluster.client, &vm, true, VmState::Uninitialized)
        .await
        .unwrap();
    let client = Arc::new(
        CoordinationClient::new(cluster.addr.clone(), "test").with_retry(RetryPolicy::quick()),
    );
    let timing = ExperimentTiming::new(Arc::clone(&client), 0);
    let (handler, control) = VmResourceHandler::new(
        vm,
        guest,
        client,
        timing,
        cluster.schedules.clone(),
        cluster.objects.clone(),
        agent_config(&cluster.base),
    );
    let handler = handler.with_retry(RetryPolicy::quick());
    (tokio::spawn(handler.run()), control)
}

#[tokio::test]
async fn full_lifecycle_with_negative_and_positive_entries() {
    let cluster = cluster().await;
    let vm = descriptor(0);
    let guest = Arc::new(FakeGuest::new());

    let mut schedule = VmSchedule::new();
    let mut configure = ScheduleEntry::new(-10.0).unwrap();
    configure.set_executable("/opt/configure.sh");
    configure.append_argument("--fast");
    configure.add_content("/etc/motd", "experiment", false);
    schedule.push(configure);
    let mut run = ScheduleEntry::new(0.2).unwrap();
    run.set_executable("/opt/run.sh");
    schedule.push(run);
    cluster
        .schedules
        .put(&vm.name, &schedule.to_bytes(), &vm.control_ip, false)
        .await
        .unwrap();

    let (task, _control) = spawn_agent(&cluster, vm.clone(), Arc::clone(&guest)).await;
    let state = task.await.unwrap().unwrap();
    assert_eq!(state, VmState::Exited);

    // Both programs ran, in schedule order.
    assert_eq!(
        guest.executed_paths(),
        vec!["/opt/configure.sh".to_string(), "/opt/run.sh".to_string()]
    );
    // The content payload landed in the guest.
    assert_eq!(guest.file("/etc/motd").unwrap().bytes, b"experiment");
    // The call-arguments file was staged next to the program.
    let call_args = guest.file("/opt/configure.sh.call_arguments").unwrap();
    assert!(String::from_utf8(call_args.bytes).unwrap().contains("--fast"));

    // The mapping ended terminal and a start time was published.
    let mapping = cluster
        .client
        .get_vm_mapping_by_uuid(&vm.uuid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(VmState::decode(&mapping.state), VmState::Exited);
    assert!(cluster.timing.get_start_time().await.unwrap().is_some());
}

#[tokio::test]
async fn object_store_payloads_are_staged_with_executable_bit() {
    let cluster = cluster().await;
    let vm = descriptor(0);
    let guest = Arc::new(FakeGuest::new());

    cluster
        .objects
        .put_bytes("tool.sh", b"#!/bin/sh\nexit 0\n", false)
        .await
        .unwrap();

    let mut schedule = VmSchedule::new();
    let mut entry = ScheduleEntry::new(-5.0).unwrap();
    entry.add_file("/usr/local/bin/tool.sh", "tool.sh", true);
    schedule.push(entry);
    cluster
        .schedules
        .put(&vm.name, &schedule.to_bytes(), &vm.control_ip, false)
        .await
        .unwrap();

    let (task, _control) = spawn_agent(&cluster, vm, Arc::clone(&guest)).await;
    assert_eq!(task.await.unwrap().unwrap(), VmState::Exited);

    let staged = guest.file("/usr/local/bin/tool.sh").unwrap();
    assert_eq!(staged.bytes, b"#!/bin/sh\nexit 0\n");
    assert!(staged.executable);
}

#[tokio::test]
async fn reboot_resumes_at_the_next_entry() {
    let cluster = cluster().await;
    let vm = descriptor(0);
    let guest = Arc::new(FakeGuest::new());
    // The configure program requests a reboot via the reserved exit code
    // and the guest also drops pings while it comes back up.
    guest.script_program("/opt/reboot_me.sh", &[164]);

    let mut schedule = VmSchedule::new();
    let mut reboot_entry = ScheduleEntry::new(-10.0).unwrap();
    reboot_entry.set_executable("/opt/reboot_me.sh");
    schedule.push(reboot_entry);
    let mut after = ScheduleEntry::new(-9.0).unwrap();
    after.add_content("/etc/after-reboot", "survived", false);
    schedule.push(after);
    cluster
        .schedules
        .put(&vm.name, &schedule.to_bytes(), &vm.control_ip, false)
        .await
        .unwrap();

    let (task, _control) = spawn_agent(&cluster, vm, Arc::clone(&guest)).await;
    // Inject ping failures once the first program has been dispatched.
    guest.fail_next_pings(2);

    assert_eq!(task.await.unwrap().unwrap(), VmState::Exited);
    // The trigger entry ran once; the following entry executed after the
    // reconnect.
    assert_eq!(guest.executed_paths(), vec!["/opt/reboot_me.sh".to_string()]);
    assert_eq!(guest.file("/etc/after-reboot").unwrap().bytes, b"survived");
}

#[tokio::test]
async fn failing_entry_is_fatal_unless_ignored() {
    let cluster = cluster().await;
    let guest = Arc::new(FakeGuest::new());
    guest.script_program("/opt/flaky.sh", &[3]);

    // ignore_failure on: the agent completes.
    let vm_ok = descriptor(0);
    let mut schedule = VmSchedule::new();
    let mut entry = ScheduleEntry::new(-5.0).unwrap();
    entry.set_executable("/opt/flaky.sh");
    entry.ignore_failure = true;
    schedule.push(entry);
    cluster
        .schedules
        .put(&vm_ok.name, &schedule.to_bytes(), &vm_ok.control_ip, false)
        .await
        .unwrap();
    let (task, _control) = spawn_agent(&cluster, vm_ok, Arc::clone(&guest)).await;
    assert_eq!(task.await.unwrap().unwrap(), VmState::Exited);

    // ignore_failure off: the agent fails and the VM still lands in
    // `exited`.
    let vm_bad = descriptor(1);
    let mut schedule = VmSchedule::new();
    let mut entry = ScheduleEntry::new(-5.0).unwrap();
    entry.set_executable("/opt/flaky.sh");
    schedule.push(entry);
    cluster
        .schedules
        .put(&vm_bad.name, &schedule.to_bytes(), &vm_bad.control_ip, false)
        .await
        .unwrap();
    let (task, _control) = spawn_agent(&cluster, vm_bad.clone(), Arc::clone(&guest)).await;
    assert!(task.await.unwrap().is_err());
    let mapping = cluster
        .client
        .get_vm_mapping_by_uuid(&vm_bad.uuid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(VmState::decode(&mapping.state), VmState::Exited);
}

#[tokio::test]
async fn finite_pause_delays_the_next_event() {
    let cluster = cluster().await;
    let vm = descriptor(0);
    let guest = Arc::new(FakeGuest::new());

    let mut schedule = VmSchedule::new();
    let mut first = ScheduleEntry::new(-10.0).unwrap();
    first.set_executable("/opt/first.sh");
    first.add_pause(PauseDuration::Finite { seconds: 0.5 }).unwrap();
    schedule.push(first);
    let mut second = ScheduleEntry::new(-9.0).unwrap();
    second.set_executable("/opt/second.sh");
    schedule.push(second);
    cluster
        .schedules
        .put(&vm.name, &schedule.to_bytes(), &vm.control_ip, false)
        .await
        .unwrap();

    let (task, _control) = spawn_agent(&cluster, vm, Arc::clone(&guest)).await;
    assert_eq!(task.await.unwrap().unwrap(), VmState::Exited);

    let executed = guest.executed();
    assert_eq!(executed.len(), 2);
    let gap = executed[1].at.duration_since(executed[0].at);
    assert!(gap >= Duration::from_millis(500), "gap was {gap:?}");
}

#[tokio::test]
async fn break_blocks_until_an_external_resume() {
    let cluster = cluster().await;
    let vm = descriptor(0);
    let guest = Arc::new(FakeGuest::new());

    let mut schedule = VmSchedule::new();
    let mut gate = ScheduleEntry::new(-10.0).unwrap();
    gate.add_pause(PauseDuration::Break).unwrap();
    schedule.push(gate);
    let mut after = ScheduleEntry::new(-9.0).unwrap();
    after.set_executable("/opt/after_break.sh");
    schedule.push(after);
    cluster
        .schedules
        .put(&vm.name, &schedule.to_bytes(), &vm.control_ip, false)
        .await
        .unwrap();

    let (task, control) = spawn_agent(&cluster, vm, Arc::clone(&guest)).await;

    // No progress while the break holds.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(guest.executed().is_empty());
    assert!(!task.is_finished());

    control.send(ControlEvent::Resume).unwrap();
    assert_eq!(task.await.unwrap().unwrap(), VmState::Exited);
    assert_eq!(guest.executed_paths(), vec!["/opt/after_break.sh".to_string()]);
}

#[tokio::test]
async fn distributed_start_converges_on_one_time() {
    let cluster = cluster().await;
    let guest_a = Arc::new(FakeGuest::new());
    let guest_b = Arc::new(FakeGuest::new());
    let vm_a = descriptor(0);
    let vm_b = descriptor(1);

    for vm in [&vm_a, &vm_b] {
        let mut schedule = VmSchedule::new();
        let mut configure = ScheduleEntry::new(-5.0).unwrap();
        configure.set_executable("/opt/configure.sh");
        schedule.push(configure);
        let mut run = ScheduleEntry::new(0.2).unwrap();
        run.set_executable("/opt/run.sh");
        schedule.push(run);
        cluster
            .schedules
            .put(&vm.name, &schedule.to_bytes(), &vm.control_ip, false)
            .await
            .unwrap();
    }

    let (task_a, _ca) = spawn_agent(&cluster, vm_a, Arc::clone(&guest_a)).await;
    let (task_b, _cb) = spawn_agent(&cluster, vm_b, Arc::clone(&guest_b)).await;

    assert_eq!(task_a.await.unwrap().unwrap(), VmState::Exited);
    assert_eq!(task_b.await.unwrap().unwrap(), VmState::Exited);

    // Exactly one start time was converged on, and both agents ran their
    // experiment-phase entry.
    assert!(cluster.timing.get_start_time().await.unwrap().is_some());
    assert!(guest_a.executed_paths().contains(&"/opt/run.sh".to_string()));
    assert!(guest_b.executed_paths().contains(&"/opt/run.sh".to_string()));
}

#[tokio::test]
async fn transfers_pull_changed_files_to_the_host() {
    let cluster = cluster().await;
    let vm = descriptor(0);
    let guest = Arc::new(FakeGuest::new());
    guest.seed_file("/var/log/app.log", b"line one\n");

    let mut schedule = VmSchedule::new();
    let mut monitor = ScheduleEntry::new(0.1).unwrap();
    monitor.add_transfer("/var/log/app.log", 0.1, None);
    schedule.push(monitor);
    let mut closer = ScheduleEntry::new(0.8).unwrap();
    closer.set_executable("/opt/done.sh");
    schedule.push(closer);
    cluster
        .schedules
        .put(&vm.name, &schedule.to_bytes(), &vm.control_ip, false)
        .await
        .unwrap();

    let (task, _control) = spawn_agent(&cluster, vm.clone(), Arc::clone(&guest)).await;
    assert_eq!(task.await.unwrap().unwrap(), VmState::Exited);

    let pulled = cluster
        .base
        .path()
        .join("transfers")
        .join("transfers")
        .join(&vm.name)
        .join("var/log/app.log");
    assert!(pulled.exists(), "expected {pulled:?} to exist");
    assert_eq!(std::fs::read(&pulled).unwrap(), b"line one\n");
}

#[tokio::test]
async fn cancellation_while_waiting_for_a_schedule() {
    let cluster = cluster().await;
    let vm = descriptor(0);
    let guest = Arc::new(FakeGuest::new());

    // No schedule is ever stored; the agent polls until cancelled.
    let (task, control) = spawn_agent(&cluster, vm, Arc::clone(&guest)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!task.is_finished());

    control.send(ControlEvent::Cancel).unwrap();
    assert_eq!(task.await.unwrap().unwrap(), VmState::Exited);
}

#[tokio::test]
async fn teardown_via_destroyed_mappings_stops_agents() {
    let cluster = cluster().await;
    let vm = descriptor(0);
    let guest = Arc::new(FakeGuest::new());

    let (task, _control) = spawn_agent(&cluster, vm, Arc::clone(&guest)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Controller-side teardown: drop every mapping; the agent notices the
    // missing mapping and exits.
    cluster.client.destroy_all_vm_mappings().await.unwrap();
    let state = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(state, VmState::Exited);
}

#[tokio::test]
async fn empty_schedule_exits_after_the_barrier() {
    let cluster = cluster().await;
    let vm = descriptor(0);
    let guest = Arc::new(FakeGuest::new());

    cluster
        .schedules
        .put(&vm.name, &VmSchedule::new().to_bytes(), &vm.control_ip, false)
        .await
        .unwrap();

    let (task, _control) = spawn_agent(&cluster, vm, Arc::clone(&guest)).await;
    let state = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(state, VmState::Exited);
    assert!(guest.executed().is_empty());
}

#[tokio::test]
async fn start_time_observed_by_agents_matches_the_service() {
    let cluster = cluster().await;
    let vm = descriptor(0);
    let guest = Arc::new(FakeGuest::new());

    let mut schedule = VmSchedule::new();
    let mut run = ScheduleEntry::new(0.1).unwrap();
    run.set_executable("/opt/run.sh");
    schedule.push(run);
    cluster
        .schedules
        .put(&vm.name, &schedule.to_bytes(), &vm.control_ip, false)
        .await
        .unwrap();

    let started = Instant::now();
    let (task, _control) = spawn_agent(&cluster, vm, Arc::clone(&guest)).await;
    assert_eq!(task.await.unwrap().unwrap(), VmState::Exited);

    // With a zero buffer the whole run stays prompt; the positive entry
    // waited for the barrier, not for minutes.
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(cluster.timing.get_start_time().await.unwrap().is_some());
}
