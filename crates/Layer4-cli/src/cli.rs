//! Attached console mode
//!
//! Starts one instance through the supervisor and bridges it to the terminal:
//! IOC lines go to stdout, each stdin line goes to the IOC as a command.

use anyhow::{bail, Context};
use ioc_foundation::{Error, LauncherConfig};
use ioc_task::{InstanceRegistry, LineEvent, Supervisor, SupervisorHandle};
use std::future::Future;
use std::io::{BufRead, Write};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, warn};

/// How often the console checks whether its instance is still live
const LIVENESS_INTERVAL: Duration = Duration::from_millis(100);

/// Run instance `target` until stdin EOF, Ctrl-C or hang-up
pub async fn run_instance(config: &LauncherConfig, target: &str) -> anyhow::Result<()> {
    let mut registry = InstanceRegistry::with_config(config);
    let count = registry.rescan();
    let index = resolve(&registry, target)
        .with_context(|| format!("no IOC '{}' among {} under {}", target, count, config.root.display()))?;

    let supervisor = Supervisor::spawn(registry, config.tick_interval());
    let handle = supervisor.handle();
    let lines = handle.subscribe();

    let pid = match handle.start(index).await {
        Ok(pid) => pid,
        Err(e) => {
            supervisor.shutdown().await?;
            bail!("failed to start IOC #{}: {}", index, e);
        }
    };
    eprintln!("IOC #{} started, PID {} (Ctrl-D or Ctrl-C to stop)", index, pid);

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl-C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let result = attach(&handle, index, lines, stdin_lines(), interrupt, &mut std::io::stdout()).await;

    supervisor.shutdown().await?;
    eprintln!("IOC #{} stopped", index);
    result
}

/// Stdin lines read on a plain thread
///
/// The thread may stay blocked in `read` after the console is done; it does
/// not hold up runtime shutdown the way a blocking-pool read would.
fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Bridge instance `index` to `out` until its commands end, `interrupt`
/// fires or the instance is no longer live
///
/// Every line published before the instance went dormant is written.
async fn attach<W: Write>(
    handle: &SupervisorHandle,
    index: usize,
    mut lines: broadcast::Receiver<LineEvent>,
    mut commands: mpsc::Receiver<String>,
    interrupt: impl Future<Output = ()>,
    out: &mut W,
) -> anyhow::Result<()> {
    tokio::pin!(interrupt);
    let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);

    loop {
        tokio::select! {
            event = lines.recv() => match event {
                Ok(event) if event.index == index => write_line(out, &event)?,
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("console skipped {} lines", n),
                Err(RecvError::Closed) => break,
            },
            command = commands.recv() => match command {
                Some(text) => match handle.send_command(index, text).await {
                    Ok(()) | Err(Error::NotRunning(_)) => {}
                    Err(e) => error!("send failed: {}", e),
                },
                None => break,
            },
            _ = liveness.tick() => {
                if !is_live(handle, index).await? {
                    // The worker publishes every line before it stops an instance
                    while let Ok(event) = lines.try_recv() {
                        if event.index == index {
                            write_line(out, &event)?;
                        }
                    }
                    break;
                }
            }
            _ = &mut interrupt => {
                eprintln!();
                break;
            }
        }
    }
    Ok(())
}

async fn is_live(handle: &SupervisorHandle, index: usize) -> anyhow::Result<bool> {
    let rows = handle.snapshot().await?;
    Ok(rows.get(index).map_or(false, |row| row.state.is_live()))
}

/// Numeric ID first, then instance or camera name
fn resolve(registry: &InstanceRegistry, target: &str) -> Option<usize> {
    match target.parse::<usize>() {
        Ok(id) if id < registry.count() => Some(id),
        _ => registry.find(target),
    }
}

fn write_line<W: Write>(out: &mut W, event: &LineEvent) -> std::io::Result<()> {
    if event.stream.is_error() {
        writeln!(out, "[stderr] {}", event.line)
    } else {
        writeln!(out, "{}", event.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ioc_foundation::LaunchConfig;
    use ioc_task::HANGUP_SENTINEL;
    use std::fs;
    use std::path::Path;

    const TICK: Duration = Duration::from_millis(5);

    fn write_instance(root: &Path, name: &str, camera: &str) {
        let dir = root.join("stage/ioc").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("instance.cmd"),
            format!(
                "epicsEnvSet(\"LOCATION\", \"LAB\")\n\
                 epicsEnvSet(\"DEVICE_NAME\", \"D\")\n\
                 epicsEnvSet(\"CAMERA_NAME\", \"{}\")\n",
                camera
            ),
        )
        .unwrap();
    }

    /// Start `script` as instance 0 and attach with stdin held open
    async fn attach_to(script: &str) -> String {
        let root = tempfile::tempdir().unwrap();
        write_instance(root.path(), "cam1", "Left");
        let mut registry = InstanceRegistry::new(root.path())
            .with_launch(LaunchConfig::command("/bin/sh", &["-c", script, "start_ioc.sh"]));
        registry.rescan();

        let supervisor = Supervisor::spawn(registry, TICK);
        let handle = supervisor.handle();
        let lines = handle.subscribe();
        handle.start(0).await.unwrap();

        let (_stdin, commands) = mpsc::channel(1);
        let mut out = Vec::new();
        tokio::time::timeout(
            Duration::from_secs(5),
            attach(&handle, 0, lines, commands, std::future::pending(), &mut out),
        )
        .await
        .expect("console did not exit after hang-up")
        .unwrap();

        supervisor.shutdown().await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_resolve_by_id_or_name() {
        let root = tempfile::tempdir().unwrap();
        write_instance(root.path(), "cam1", "Left");
        write_instance(root.path(), "cam2", "7");

        let mut registry = InstanceRegistry::new(root.path());
        registry.rescan();
        assert_eq!(resolve(&registry, "1"), Some(1));
        assert_eq!(resolve(&registry, "cam1"), Some(0));
        assert_eq!(resolve(&registry, "Left"), Some(0));
        // Out-of-range IDs fall back to a name lookup
        assert_eq!(resolve(&registry, "7"), Some(1));
        assert_eq!(resolve(&registry, "cam3"), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_attach_prints_last_lines_and_exits() {
        let out = attach_to("echo booting; echo failed >&2; exit 1").await;

        let lines: Vec<&str> = out.lines().collect();
        assert!(lines.contains(&"booting"), "{:?}", lines);
        assert!(lines.contains(&"[stderr] failed"), "{:?}", lines);
        assert!(lines.contains(&HANGUP_SENTINEL), "{:?}", lines);
        let stderr_sentinel = format!("[stderr] {}", HANGUP_SENTINEL);
        assert!(lines.contains(&stderr_sentinel.as_str()), "{:?}", lines);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_attach_prints_all_output() {
        let out = attach_to("seq 1 500; exit 0").await;

        let numbers: Vec<&str> = out.lines().filter(|l| !l.contains(HANGUP_SENTINEL)).collect();
        let expected: Vec<String> = (1..=500).map(|n| n.to_string()).collect();
        assert_eq!(numbers, expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_attach_stops_on_end_of_commands() {
        let root = tempfile::tempdir().unwrap();
        write_instance(root.path(), "cam1", "Left");
        let mut registry = InstanceRegistry::new(root.path())
            .with_launch(LaunchConfig::command("/bin/sh", &["-c", "exec cat", "start_ioc.sh"]));
        registry.rescan();

        let supervisor = Supervisor::spawn(registry, TICK);
        let handle = supervisor.handle();
        let lines = handle.subscribe();
        handle.start(0).await.unwrap();

        let (stdin, commands) = mpsc::channel(1);
        drop(stdin);
        let mut out = Vec::new();
        tokio::time::timeout(
            Duration::from_secs(5),
            attach(&handle, 0, lines, commands, std::future::pending(), &mut out),
        )
        .await
        .unwrap()
        .unwrap();

        // Detaching does not stop the instance; shutdown does
        assert!(is_live(&handle, 0).await.unwrap());
        let registry = supervisor.shutdown().await.unwrap();
        assert_eq!(registry.live_count(), 0);
    }
}
