//! Subprocess launching with explicit working directories, and the registry
//! of running model processes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use tl_types::{config_error, internal_error, TlResult, TrialIndex};

const REAP_INTERVAL: Duration = Duration::from_millis(20);

/// Working directory for a command, passed explicitly instead of changing
/// the process's own current directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecDir(PathBuf);

impl ExecDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// Build `argv + [trial_dir]` running inside `exec_dir`.
pub fn build_command(argv: &[String], trial_dir: &Path, exec_dir: &ExecDir) -> TlResult<Command> {
    let (program, args) = argv.split_first().ok_or_else(|| config_error!("empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.arg(trial_dir);
    cmd.current_dir(exec_dir.path());
    cmd.stdin(Stdio::null());
    Ok(cmd)
}

/// Run a command to completion; a non-zero exit is an error carrying the
/// last line of stderr.
pub fn run_to_completion(argv: &[String], trial_dir: &Path, exec_dir: &ExecDir) -> TlResult<()> {
    let mut cmd = build_command(argv, trial_dir, exec_dir)?;
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = cmd.output()?;
    if output.status.success() {
        debug!(command = %argv.join(" "), "command finished");
        return Ok(());
    }

    let stderr_tail = String::from_utf8_lossy(&output.stderr)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no stderr output")
        .to_string();
    Err(internal_error!(
        "command `{}` exited with {}: {}",
        argv.join(" "),
        output.status,
        stderr_tail
    ))
}

/// State of a tracked model process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Running,
    Exited(ExitStatus),
    /// No process is tracked for the trial (never spawned here, or already
    /// reaped).
    Untracked,
}

/// Running model processes keyed by trial index.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    children: Mutex<HashMap<TrialIndex, Child>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn without waiting. Output goes to `stdout.log` / `stderr.log` in
    /// the trial directory.
    pub fn spawn(&self, index: TrialIndex, argv: &[String], trial_dir: &Path, exec_dir: &ExecDir) -> TlResult<u32> {
        fs::create_dir_all(trial_dir)?;
        let mut cmd = build_command(argv, trial_dir, exec_dir)?;
        cmd.stdout(Stdio::from(fs::File::create(trial_dir.join("stdout.log"))?));
        cmd.stderr(Stdio::from(fs::File::create(trial_dir.join("stderr.log"))?));

        let child = cmd.spawn()?;
        let pid = child.id();
        info!(trial = index, pid, command = %argv.join(" "), "spawned model process");

        if let Some(mut previous) = self.children.lock().insert(index, child) {
            warn!(trial = index, "replacing a tracked process");
            let _ = previous.kill();
            let _ = previous.wait();
        }
        Ok(pid)
    }

    /// Non-blocking check; exited processes are reaped and forgotten.
    pub fn poll(&self, index: TrialIndex) -> TlResult<ChildState> {
        let mut children = self.children.lock();
        let Some(child) = children.get_mut(&index) else {
            return Ok(ChildState::Untracked);
        };

        match child.try_wait()? {
            Some(status) => {
                children.remove(&index);
                debug!(trial = index, %status, "model process exited");
                Ok(ChildState::Exited(status))
            }
            None => Ok(ChildState::Running),
        }
    }

    /// Stop tracking a trial's process. It gets `grace` to exit on its own
    /// and is killed after that; either way it is reaped before returning.
    pub fn finish(&self, index: TrialIndex, grace: Duration) -> TlResult<Option<ExitStatus>> {
        let Some(mut child) = self.children.lock().remove(&index) else {
            return Ok(None);
        };

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(status) = child.try_wait()? {
                debug!(trial = index, %status, "model process exited");
                return Ok(Some(status));
            }
            std::thread::sleep(REAP_INTERVAL);
        }

        warn!(trial = index, pid = child.id(), "model process outlived its trial; terminating");
        if let Err(e) = child.kill() {
            debug!(trial = index, error = %e, "kill failed; process already exited");
        }
        Ok(Some(child.wait()?))
    }

    pub fn len(&self) -> usize {
        self.children.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.lock().is_empty()
    }

    /// Kill every tracked process; returns how many were signalled.
    pub fn terminate_all(&self) -> usize {
        let mut children = self.children.lock();
        let count = children.len();
        for (index, mut child) in children.drain() {
            match child.kill() {
                Ok(()) => info!(trial = index, pid = child.id(), "terminated model process"),
                Err(e) => warn!(trial = index, error = %e, "failed to terminate model process"),
            }
            let _ = child.wait();
        }
        count
    }
}

impl Drop for ProcessRegistry {
    fn drop(&mut self) {
        if !self.children.get_mut().is_empty() {
            self.terminate_all();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn commands_run_in_exec_dir_with_trial_dir_argument() {
        let tmp = TempDir::new().unwrap();
        let trial_dir = tmp.path().join("000000");
        fs::create_dir_all(&trial_dir).unwrap();

        // $0 is the appended trial directory under `sh -c`
        let cmd = argv(&["sh", "-c", "pwd > where.txt; echo \"$0\" > arg.txt"]);
        run_to_completion(&cmd, &trial_dir, &ExecDir::new(&trial_dir)).unwrap();

        let arg = fs::read_to_string(trial_dir.join("arg.txt")).unwrap();
        assert_eq!(arg.trim(), trial_dir.display().to_string());
        assert!(trial_dir.join("where.txt").exists());
    }

    #[test]
    fn failing_command_reports_stderr() {
        let tmp = TempDir::new().unwrap();
        let cmd = argv(&["sh", "-c", "echo nope >&2; exit 3"]);
        let err = run_to_completion(&cmd, tmp.path(), &ExecDir::new(tmp.path())).unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert!(build_command(&[], tmp.path(), &ExecDir::new(tmp.path())).is_err());
    }

    #[test]
    fn registry_tracks_and_reaps() {
        let tmp = TempDir::new().unwrap();
        let registry = ProcessRegistry::new();
        let exec = ExecDir::new(tmp.path());

        registry.spawn(0, &argv(&["sh", "-c", "exit 0"]), &tmp.path().join("a"), &exec).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        let status = loop {
            match registry.poll(0).unwrap() {
                ChildState::Exited(status) => break status,
                ChildState::Running if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(20)),
                other => panic!("unexpected state {other:?}"),
            }
        };
        assert!(status.success());
        assert_eq!(registry.poll(0).unwrap(), ChildState::Untracked);

        registry.spawn(1, &argv(&["sh", "-c", "sleep 30"]), &tmp.path().join("b"), &exec).unwrap();
        assert_eq!(registry.poll(1).unwrap(), ChildState::Running);
        assert_eq!(registry.terminate_all(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn finish_kills_lingering_process() {
        let tmp = TempDir::new().unwrap();
        let registry = ProcessRegistry::new();
        let exec = ExecDir::new(tmp.path());

        registry.spawn(2, &argv(&["sh", "-c", "sleep 30"]), &tmp.path().join("c"), &exec).unwrap();
        let started = Instant::now();
        let status = registry.finish(2, Duration::from_millis(100)).unwrap().unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(registry.is_empty());
        assert_eq!(registry.finish(2, Duration::ZERO).unwrap(), None);
    }
}
