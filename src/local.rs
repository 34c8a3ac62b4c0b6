/// Foreground implementations used by `debug` runs on non-Windows hosts:
/// the agent is spawned directly as the current user, in its own process
/// group so termination takes any forked helpers with it.
use crate::supervisor::{
    ChildProcess, LaunchError, LaunchStage, Launcher, SessionId, SessionResolver,
};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{getsid, Pid};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Reports the supervisor's own login session as the active one.
pub struct CurrentSessionResolver;

impl SessionResolver for CurrentSessionResolver {
    fn active_session(&self) -> Option<SessionId> {
        match getsid(None) {
            Ok(sid) => Some(SessionId(sid.as_raw() as u32)),
            Err(_) => None,
        }
    }
}

pub struct LocalLauncher;

impl Launcher for LocalLauncher {
    type Child = LocalChild;

    fn launch(&self, executable: &Path, _session: SessionId) -> Result<LocalChild, LaunchError> {
        let workdir = executable.parent().unwrap_or_else(|| Path::new("."));
        let child = Command::new(executable)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| LaunchError::new(LaunchStage::Spawn, e))?;
        let pid = child.id();
        Ok(LocalChild {
            pid,
            child: Some(child),
        })
    }
}

#[derive(Debug)]
pub struct LocalChild {
    pid: u32,
    child: Option<std::process::Child>,
}

impl ChildProcess for LocalChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if matches!(child.try_wait(), Ok(None)) {
            // The child leads its own process group.
            if let Err(e) = killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
                warn!(pid = self.pid, error = %e, "failed to kill agent process group");
                let _ = child.kill();
            }
        }
        match child.wait() {
            Ok(status) => debug!(pid = self.pid, %status, "agent reaped"),
            Err(e) => warn!(pid = self.pid, error = %e, "failed to reap agent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    /// The agent is launched with no arguments, so long-running test
    /// children are small executable scripts.
    fn agent_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("helpdesk-agent");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_resolver_reports_a_session() {
        assert!(CurrentSessionResolver.active_session().is_some());
    }

    #[test]
    fn test_spawn_failure_is_a_launch_error() {
        let err = LocalLauncher
            .launch(Path::new("/nonexistent-binary-xyz"), SessionId(0))
            .unwrap_err();
        assert_eq!(err.stage, LaunchStage::Spawn);
        assert!(err.to_string().contains("creating process"));
    }

    #[test]
    fn test_terminate_kills_running_child() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = agent_script(tmp.path(), "sleep 30");

        let mut child = LocalLauncher.launch(&exe, SessionId(0)).unwrap();
        assert!(child.is_alive());

        child.terminate();
        assert!(!child.is_alive());
        // Idempotent.
        child.terminate();
    }

    #[test]
    fn test_exited_child_is_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = agent_script(tmp.path(), "exit 0");

        let mut child = LocalLauncher.launch(&exe, SessionId(0)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while child.is_alive() {
            assert!(Instant::now() < deadline, "child never exited");
            std::thread::sleep(Duration::from_millis(10));
        }
        // Already reaped; terminate is a no-op.
        child.terminate();
    }

    #[test]
    fn test_child_runs_in_its_executable_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = agent_script(tmp.path(), "pwd > cwd.txt");

        let mut child = LocalLauncher.launch(&exe, SessionId(0)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while child.is_alive() {
            assert!(Instant::now() < deadline, "child never exited");
            std::thread::sleep(Duration::from_millis(10));
        }

        let cwd = std::fs::read_to_string(tmp.path().join("cwd.txt")).unwrap();
        let recorded = PathBuf::from(cwd.trim());
        assert_eq!(
            recorded.canonicalize().unwrap(),
            tmp.path().canonicalize().unwrap()
        );
    }
}
