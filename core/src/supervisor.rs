//! Child process launch and termination.
//!
//! The supervisor starts companion processes detached from any visible
//! console and keeps their standard streams drained so they cannot stall
//! on a full pipe buffer. It terminates only processes it started itself;
//! services discovered already running are never represented by a
//! [`ChildHandle`] and therefore can never be killed through here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Grace period when waiting for a killed child to exit.
const KILL_WAIT: Duration = Duration::from_secs(3);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

// ============================================================================
// ChildHandle
// ============================================================================

/// Opaque handle to a child started by [`ProcessSupervisor::start_hidden`]
/// in the current session.
#[derive(Debug)]
pub struct ChildHandle {
    name: String,
    pid: Option<u32>,
    child: Option<Child>,
}

impl ChildHandle {
    /// OS process id, if the child was still alive when spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns true if the child has not exited yet.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Requests termination and waits briefly for the child to exit.
    ///
    /// Idempotent: calling it again, or on a child that already exited, is
    /// a no-op. Failures are logged and swallowed, never returned.
    pub async fn kill(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("[{}] already exited: {}", self.name, status);
                return;
            }
            Ok(None) => {}
            Err(e) => warn!("[{}] could not query child status: {}", self.name, e),
        }

        info!("[{}] stopping (pid {:?})", self.name, self.pid);
        if let Err(e) = child.start_kill() {
            warn!("[{}] kill request failed: {}", self.name, e);
        }

        match tokio::time::timeout(KILL_WAIT, child.wait()).await {
            Ok(Ok(status)) => debug!("[{}] exited: {}", self.name, status),
            Ok(Err(e)) => warn!("[{}] wait after kill failed: {}", self.name, e),
            Err(_) => warn!(
                "[{}] did not exit within {:?} after kill",
                self.name, KILL_WAIT
            ),
        }
    }
}

// ============================================================================
// ProcessSupervisor
// ============================================================================

/// Starts hidden, stream-drained child processes.
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Creates a new supervisor.
    pub fn new() -> Self {
        Self
    }

    /// Resolves the launch program to an existing executable path.
    ///
    /// Absolute or multi-component paths must exist as given; bare command
    /// names are searched in `PATH`.
    pub fn locate_program(&self, program: &Path) -> Option<PathBuf> {
        if program.components().count() > 1 || program.is_absolute() {
            return program.exists().then(|| program.to_path_buf());
        }

        let path_var = std::env::var_os("PATH")?;
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(program);
            if candidate.exists() {
                return Some(candidate);
            }
            #[cfg(windows)]
            {
                let exe = dir.join(format!("{}.exe", program.display()));
                if exe.exists() {
                    return Some(exe);
                }
            }
        }
        None
    }

    /// Starts a child process with no visible window.
    ///
    /// Standard output and error are piped and continuously drained by
    /// background tasks (the OS pipe buffers are small; a child that logs
    /// more than they hold would block forever if nobody reads). The given
    /// environment variables are overlaid on the inherited environment.
    ///
    /// Returns as soon as the process is spawned; readiness is the health
    /// poller's concern.
    pub fn start_hidden(
        &self,
        name: &str,
        program: &Path,
        args: &[String],
        working_dir: Option<&Path>,
        env: &BTreeMap<String, String>,
    ) -> Result<ChildHandle> {
        info!("[{}] launching {} {:?}", name, program.display(), args);

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }

        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        let mut child = command.spawn().map_err(|e| {
            Error::Launch(format!("failed to start {}: {}", program.display(), e))
        })?;

        let pid = child.id();
        debug!("[{}] started (pid {:?})", name, pid);

        if let Some(stdout) = child.stdout.take() {
            spawn_drain(name.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_drain(name.to_string(), "stderr", stderr);
        }

        Ok(ChildHandle {
            name: name.to_string(),
            pid,
            child: Some(child),
        })
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards a child's output stream to the log, line by line.
fn spawn_drain<R>(name: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[{}] {}: {}", name, stream, line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> (PathBuf, Vec<String>) {
        (
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), script.to_string()],
        )
    }

    #[test]
    fn test_locate_program_absolute_path() {
        let supervisor = ProcessSupervisor::new();
        assert!(supervisor.locate_program(Path::new("/bin/sh")).is_some());
        assert!(supervisor
            .locate_program(Path::new("/nonexistent/binary"))
            .is_none());
    }

    #[test]
    fn test_locate_program_searches_path() {
        let supervisor = ProcessSupervisor::new();
        assert!(supervisor.locate_program(Path::new("sh")).is_some());
        assert!(supervisor
            .locate_program(Path::new("definitely-not-a-real-command"))
            .is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_and_kill() {
        let supervisor = ProcessSupervisor::new();
        let (program, args) = sh("sleep 30");
        let mut handle = supervisor
            .start_hidden("test", &program, &args, None, &BTreeMap::new())
            .unwrap();

        assert!(handle.is_running());
        handle.kill().await;
        assert!(!handle.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let supervisor = ProcessSupervisor::new();
        let (program, args) = sh("sleep 30");
        let mut handle = supervisor
            .start_hidden("test", &program, &args, None, &BTreeMap::new())
            .unwrap();

        handle.kill().await;
        handle.kill().await;
        handle.kill().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_after_child_exited() {
        let supervisor = ProcessSupervisor::new();
        let (program, args) = sh("exit 0");
        let mut handle = supervisor
            .start_hidden("test", &program, &args, None, &BTreeMap::new())
            .unwrap();

        // Give the shell a moment to exit on its own.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_running());
        handle.kill().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_overlay_reaches_child() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.txt");

        let supervisor = ProcessSupervisor::new();
        let (program, args) = sh(&format!("echo \"$COMPANION_TEST_VAR\" > {}", out.display()));
        let mut env = BTreeMap::new();
        env.insert("COMPANION_TEST_VAR".to_string(), "hello".to_string());

        let mut handle = supervisor
            .start_hidden("test", &program, &args, None, &env)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "hello");
        handle.kill().await;
    }

    #[tokio::test]
    async fn test_start_missing_executable_errors() {
        let supervisor = ProcessSupervisor::new();
        let result = supervisor.start_hidden(
            "test",
            Path::new("/nonexistent/binary"),
            &[],
            None,
            &BTreeMap::new(),
        );
        assert!(matches!(result, Err(Error::Launch(_))));
    }
}
