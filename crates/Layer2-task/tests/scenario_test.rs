//! End-to-end scenarios over a real directory tree and real `/bin/sh` children
//!
//! `cargo test -p ioc-task --test scenario_test -- --nocapture`

use ioc_foundation::{Error, LaunchConfig, StreamConfig};
use ioc_task::{
    discover, InstanceDescriptor, InstanceRegistry, InstanceState, ProcessInstance, StreamKind,
    HANGUP_SENTINEL,
};
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

const DEADLINE: Duration = Duration::from_secs(5);

fn write_instance(root: &Path, rel: &str, camera: Option<&str>) {
    let dir = root.join(rel);
    fs::create_dir_all(&dir).unwrap();
    let mut body = String::from(
        "#!../../bin/linux-x86_64/flir\n\
         epicsEnvSet(\"LOCATION\", \"LAB\")\n\
         epicsEnvSet(\"DEVICE_NAME\", \"FLIR1\")\n",
    );
    if let Some(camera) = camera {
        body.push_str(&format!("epicsEnvSet(\"CAMERA_NAME\", \"{}\")\n", camera));
    }
    fs::write(dir.join("instance.cmd"), body).unwrap();
}

/// `/bin/sh -c <script>` with the usual four trailing arguments as `$1..$4`
fn shell(script: &str) -> LaunchConfig {
    LaunchConfig::command("/bin/sh", &["-c", script, "start_ioc.sh"])
}

fn instance(script: &str) -> ProcessInstance {
    let descriptor = InstanceDescriptor::new("/tmp/stageA", "inst1", "LAB", "FLIR1", "FLIR-BFS");
    ProcessInstance::new(descriptor, shell(script), &StreamConfig::default())
}

fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks that the process exists.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

// ============================================================================
// Discovery
// ============================================================================

#[test]
fn test_discover_category_layout() {
    let root = tempfile::tempdir().unwrap();
    write_instance(root.path(), "stageA/ioc/cat1/inst1", Some("FLIR-BFS"));

    let found = discover(root.path());
    assert_eq!(found.len(), 1);
    let d = &found[0];
    assert_eq!(d.prefix(), "LAB:FLIR1:");
    assert_eq!(d.device_name(), "FLIR-BFS");
    assert_eq!(d.instance_name(), "inst1");
    assert_eq!(d.stage_path(), root.path().join("stageA"));
}

#[test]
fn test_discover_missing_camera_name() {
    let root = tempfile::tempdir().unwrap();
    write_instance(root.path(), "stageA/ioc/cat1/inst1", None);

    assert!(discover(root.path()).is_empty());
}

#[test]
fn test_discover_mixed_tree() {
    let root = tempfile::tempdir().unwrap();
    write_instance(root.path(), "stageA/ioc/cat1/inst1", Some("Cam 1"));
    write_instance(root.path(), "stageA/ioc/inst2", Some("Cam 2"));
    write_instance(root.path(), "stageA/ioc/inst3", None);
    write_instance(root.path(), "stageA/opi/inst4", Some("Not an IOC"));
    write_instance(root.path(), "stageB/iocBoot/inst5", Some("Cam 5"));

    let names: Vec<_> = discover(root.path())
        .iter()
        .map(|d| d.instance_name().to_string())
        .collect();
    assert_eq!(names, ["inst1", "inst2", "inst5"]);
}

#[test]
fn test_discover_missing_root() {
    let root = tempfile::tempdir().unwrap();
    assert!(discover(&root.path().join("does-not-exist")).is_empty());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_start_then_stop_then_restart() {
    let mut ioc = instance("exec sleep 30");

    ioc.start().unwrap();
    let first = ioc.pid();
    assert!(first > 0);
    ioc.stop().unwrap();
    assert_eq!(ioc.state(), InstanceState::Dormant);
    assert_eq!(ioc.pid(), 0);
    assert!(!process_alive(first));

    ioc.start().unwrap();
    assert_eq!(ioc.state(), InstanceState::Live);
    assert!(ioc.pid() > 0);
    ioc.stop().unwrap();
}

#[test]
fn test_start_is_idempotent() {
    let mut ioc = instance("exec sleep 30");
    ioc.start().unwrap();
    let pid = ioc.pid();
    let started_at = ioc.started_at();

    ioc.start().unwrap();
    assert_eq!(ioc.pid(), pid);
    assert_eq!(ioc.started_at(), started_at);
    ioc.stop().unwrap();
}

#[test]
fn test_stop_is_idempotent() {
    let mut ioc = instance("exec sleep 30");
    ioc.start().unwrap();
    ioc.stop().unwrap();
    let exit = ioc.last_exit();

    ioc.stop().unwrap();
    assert_eq!(ioc.state(), InstanceState::Dormant);
    assert_eq!(ioc.last_exit(), exit);
}

#[test]
fn test_child_receives_launch_arguments() {
    let mut ioc = instance("echo \"$1|$2|$3|$4\"; exec sleep 30");
    ioc.start().unwrap();

    let deadline = Instant::now() + DEADLINE;
    while ioc.stdout().line_count() == 0 && Instant::now() < deadline {
        ioc.drain().unwrap();
    }
    assert_eq!(ioc.stdout().lines(), ["dev|/tmp/stageA|inst1|0000"]);
    ioc.stop().unwrap();
}

#[test]
fn test_send_command_round_trip() {
    let mut ioc = instance("exec cat");
    ioc.start().unwrap();

    ioc.send_command("dbl").unwrap();
    ioc.send_command("").unwrap();
    ioc.send_command("dbpr FLIR1:Gain").unwrap();

    let deadline = Instant::now() + DEADLINE;
    while ioc.stdout().line_count() < 3 && Instant::now() < deadline {
        ioc.drain().unwrap();
    }
    assert_eq!(ioc.stdout().lines(), ["dbl", "", "dbpr FLIR1:Gain"]);
    assert!(ioc.stderr().lines().is_empty());
    ioc.stop().unwrap();
}

#[test]
fn test_hangup_appends_one_sentinel() {
    let mut ioc = instance("echo hello; echo bad >&2; exit 3");
    ioc.start().unwrap();

    let deadline = Instant::now() + DEADLINE;
    let err = loop {
        match ioc.drain() {
            Ok(_) if Instant::now() < deadline => continue,
            Ok(_) => panic!("child never hung up"),
            Err(e) => break e,
        }
    };
    assert!(matches!(err, Error::ChildUnresponsive(_)));
    assert!(err.is_hangup());

    assert_eq!(ioc.stdout().lines(), ["hello", HANGUP_SENTINEL]);
    assert_eq!(ioc.stderr().lines(), ["bad", HANGUP_SENTINEL]);

    // Closed streams are not read again
    assert!(ioc.drain().unwrap_err().is_hangup());
    for kind in [StreamKind::Stdout, StreamKind::Stderr] {
        assert!(ioc.is_closed(kind));
        let sentinels = ioc
            .stream(kind)
            .lines()
            .iter()
            .filter(|l| *l == HANGUP_SENTINEL)
            .count();
        assert_eq!(sentinels, 1, "{} has {} sentinels", kind, sentinels);
    }

    // Still Live until someone stops it
    assert!(ioc.is_started());
    ioc.stop().unwrap();
    assert_eq!(ioc.last_exit().and_then(|s| s.code()), Some(3));
}

#[test]
fn test_open_stream_is_read_after_other_hangs_up() {
    let mut ioc = instance("exec 2>&-; read go; seq 1 3000; exit 0");
    ioc.start().unwrap();

    let deadline = Instant::now() + DEADLINE;
    while !ioc.is_closed(StreamKind::Stderr) {
        ioc.drain().unwrap();
        assert!(Instant::now() < deadline, "stderr never hung up");
    }
    assert_eq!(ioc.stderr().lines(), [HANGUP_SENTINEL]);
    assert!(ioc.is_started());

    ioc.send_command("go").unwrap();
    let err = loop {
        match ioc.drain() {
            Ok(_) => assert!(Instant::now() < deadline, "stdout never hung up"),
            Err(e) => break e,
        }
    };
    assert!(err.is_hangup());

    let lines = ioc.stdout().lines();
    assert_eq!(lines.len(), 3001);
    assert_eq!(lines[0], "1");
    assert_eq!(lines[2999], "3000");
    assert_eq!(lines[3000], HANGUP_SENTINEL);
    ioc.stop().unwrap();
}

// ============================================================================
// Registry
// ============================================================================

#[test]
fn test_tick_publishes_lines_and_stops_hung_up() {
    let root = tempfile::tempdir().unwrap();
    write_instance(root.path(), "stageA/ioc/inst1", Some("Cam 1"));
    write_instance(root.path(), "stageA/ioc/inst2", Some("Cam 2"));

    let mut registry =
        InstanceRegistry::new(root.path()).with_launch(shell("echo \"up $3\"; exit 0"));
    assert_eq!(registry.rescan(), 2);
    registry.instance_mut(0).unwrap().start().unwrap();

    let mut seen = Vec::new();
    let deadline = Instant::now() + DEADLINE;
    loop {
        let report = registry.tick_with(|index, _, stream, line| {
            seen.push((index, stream, line.to_string()));
        });
        if report.stopped.contains(&0) {
            assert!(report.errors.is_empty());
            break;
        }
        assert!(Instant::now() < deadline, "instance never stopped");
    }

    assert!(seen.contains(&(0, StreamKind::Stdout, "up inst1".to_string())));
    assert!(seen.iter().any(|(_, _, line)| line == HANGUP_SENTINEL));
    assert!(seen.iter().all(|(index, _, _)| *index == 0));

    let ioc = registry.get(0).unwrap();
    assert_eq!(ioc.state(), InstanceState::Dormant);
    assert!(ioc.stdout().lines().is_empty());
    assert_eq!(registry.live_count(), 0);
}

#[test]
fn test_tick_reads_all_output_before_stopping() {
    let root = tempfile::tempdir().unwrap();
    write_instance(root.path(), "stageA/ioc/inst1", Some("Cam 1"));

    let mut registry = InstanceRegistry::new(root.path()).with_launch(shell("seq 1 3000; exit 0"));
    registry.rescan();
    registry.instance_mut(0).unwrap().start().unwrap();
    // Let the child finish so every byte is queued behind the hang-up
    std::thread::sleep(Duration::from_millis(300));

    let mut stdout = Vec::new();
    let deadline = Instant::now() + DEADLINE;
    loop {
        let report = registry.tick_with(|_, _, stream, line| {
            if stream == StreamKind::Stdout {
                stdout.push(line.to_string());
            }
        });
        if !report.stopped.is_empty() {
            break;
        }
        assert!(Instant::now() < deadline, "instance never stopped");
    }

    let expected: Vec<String> = (1..=3000).map(|n| n.to_string()).collect();
    assert_eq!(stdout.last().map(String::as_str), Some(HANGUP_SENTINEL));
    assert_eq!(&stdout[..3000], expected.as_slice());
}

#[test]
fn test_stop_all() {
    let root = tempfile::tempdir().unwrap();
    write_instance(root.path(), "stageA/ioc/inst1", Some("Cam 1"));
    write_instance(root.path(), "stageA/ioc/inst2", Some("Cam 2"));

    let mut registry = InstanceRegistry::new(root.path()).with_launch(shell("exec sleep 30"));
    registry.rescan();
    registry.instance_mut(0).unwrap().start().unwrap();
    registry.instance_mut(1).unwrap().start().unwrap();
    assert_eq!(registry.live_count(), 2);

    assert!(registry.stop_all().is_empty());
    assert_eq!(registry.live_count(), 0);
}

#[test]
fn test_clear_leaves_live_children_running() {
    let root = tempfile::tempdir().unwrap();
    write_instance(root.path(), "stageA/ioc/inst1", Some("Cam 1"));

    let mut registry = InstanceRegistry::new(root.path()).with_launch(shell("exec sleep 30"));
    registry.rescan();
    registry.instance_mut(0).unwrap().start().unwrap();
    let pid = registry.get(0).unwrap().pid();

    registry.clear();
    assert!(registry.is_empty());
    assert!(process_alive(pid));

    // SAFETY: `pid` is our own child, orphaned by clear().
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
        let mut status = 0;
        libc::waitpid(pid as libc::pid_t, &mut status, 0);
    }
}
