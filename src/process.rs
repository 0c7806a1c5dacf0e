//! Process Supervisor (§4.B): a platform-agnostic wrapper over spawning,
//! observing, and killing subprocess trees, with stdio merged into a log
//! file and an optional filter regex.

use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct SpawnOpts {
    pub exe: PathBuf,
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env_overlay: HashMap<String, String>,
    pub inherit_stdio: bool,
    pub filter_regex: Option<Regex>,
    pub log_path: Option<PathBuf>,
}

/// A scoped handle to a spawned child. Dropping without calling [`stop`]
/// leaves the process running -- callers MUST call `stop` on every exit
/// path; the Backend Supervisor (§4.D) is one such guaranteed caller.
pub struct Handle {
    child: Arc<Mutex<Child>>,
    pid: u32,
    log_task: Option<tokio::task::JoinHandle<()>>,
}

impl Handle {
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

pub fn spawn(opts: SpawnOpts) -> std::io::Result<Handle> {
    let mut cmd = Command::new(&opts.exe);
    cmd.args(&opts.argv);
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }
    for (k, v) in &opts.env_overlay {
        cmd.env(k, v);
    }

    let log_file = if !opts.inherit_stdio {
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        opts.log_path
            .as_ref()
            .map(|p| std::fs::OpenOptions::new().create(true).append(true).open(p))
            .transpose()?
    } else {
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        None
    };

    let mut child = cmd.spawn()?;
    let pid = child.id().unwrap_or(0);
    info!(pid, exe = %opts.exe.display(), "spawned backend process");

    let log_task = if !opts.inherit_stdio {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let filter = opts.filter_regex.clone();
        let log_file = log_file.map(|f| Arc::new(Mutex::new(tokio::fs::File::from_std(f))));
        Some(tokio::spawn(pump_logs(stdout, stderr, filter, log_file)))
    } else {
        None
    };

    Ok(Handle { child: Arc::new(Mutex::new(child)), pid, log_task })
}

async fn pump_logs(
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    filter: Option<Regex>,
    log_file: Option<Arc<Mutex<tokio::fs::File>>>,
) {
    let mut lines = Vec::new();
    if let Some(out) = stdout {
        lines.push(tokio::spawn(pump_one(BufReader::new(out), filter.clone(), log_file.clone())));
    }
    if let Some(err) = stderr {
        lines.push(tokio::spawn(pump_one(BufReader::new(err), filter, log_file)));
    }
    for l in lines {
        let _ = l.await;
    }
}

async fn pump_one<R: tokio::io::AsyncRead + Unpin>(
    reader: BufReader<R>,
    filter: Option<Regex>,
    log_file: Option<Arc<Mutex<tokio::fs::File>>>,
) {
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(re) = &filter {
            if re.is_match(&line) {
                continue;
            }
        }
        if let Some(f) = &log_file {
            let mut f = f.lock().await;
            let _ = f.write_all(line.as_bytes()).await;
            let _ = f.write_all(b"\n").await;
        } else {
            debug!(target: "backend", "{line}");
        }
    }
}

pub async fn running(handle: &Handle) -> bool {
    let mut child = handle.child.lock().await;
    matches!(child.try_wait(), Ok(None))
}

/// Synchronous best-effort liveness check: used from readiness polling
/// closures that cannot `.await`. If the lock is contended, assumes alive
/// rather than false-negative-evicting a process mid-startup.
pub fn try_running(handle: &Handle) -> bool {
    match handle.child.try_lock() {
        Ok(mut child) => matches!(child.try_wait(), Ok(None)),
        Err(_) => true,
    }
}

pub async fn exit_code(handle: &Handle) -> Option<i32> {
    let mut child = handle.child.lock().await;
    child.try_wait().ok().flatten().and_then(|s| s.code())
}

/// Graceful stop: terminate signal, wait up to 5s, then kill. Idempotent.
pub async fn stop(handle: &Handle) {
    let mut child = handle.child.lock().await;
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    let waited = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
    if waited.is_err() {
        warn!(pid = handle.pid, "graceful stop timed out, killing");
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
    if let Some(task) = &handle.log_task {
        task.abort();
    }
}

/// Discover direct children of `pid` by walking `/proc` (Linux) so a shutdown
/// can stop a router's engine children without touching the gateway's own
/// parent process. Best-effort: returns an empty list on unsupported
/// platforms or permission errors.
pub fn children_of(pid: u32) -> Vec<u32> {
    #[cfg(target_os = "linux")]
    {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir("/proc") else { return out };
        for entry in entries.flatten() {
            let Ok(child_pid) = entry.file_name().to_string_lossy().parse::<u32>() else { continue };
            let status_path = entry.path().join("status");
            let Ok(status) = std::fs::read_to_string(status_path) else { continue };
            for line in status.lines() {
                if let Some(ppid_str) = line.strip_prefix("PPid:") {
                    if ppid_str.trim().parse::<u32>() == Ok(pid) {
                        out.push(child_pid);
                    }
                    break;
                }
            }
        }
        out
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_running_and_stop_round_trip() {
        let opts = SpawnOpts {
            exe: PathBuf::from("/bin/sh"),
            argv: vec!["-c".to_string(), "sleep 5".to_string()],
            cwd: None,
            env_overlay: HashMap::new(),
            inherit_stdio: true,
            filter_regex: None,
            log_path: None,
        };
        let handle = spawn(opts).expect("spawn should succeed on a unix test runner");
        assert!(running(&handle).await);
        stop(&handle).await;
        assert!(!running(&handle).await);
    }

    #[tokio::test]
    async fn exit_code_reported_after_natural_exit() {
        let opts = SpawnOpts {
            exe: PathBuf::from("/bin/sh"),
            argv: vec!["-c".to_string(), "exit 3".to_string()],
            cwd: None,
            env_overlay: HashMap::new(),
            inherit_stdio: true,
            filter_regex: None,
            log_path: None,
        };
        let handle = spawn(opts).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(exit_code(&handle).await, Some(3));
    }
}
