/// Supervisor state machine: keeps exactly one agent process alive inside
/// the active interactive desktop session.
///
/// The loop polls the session resolver, launches the agent through the
/// platform launcher when a session is available, restarts it after a crash
/// with a timed delay, and tears the child down when the stop signal fires.
/// All collaborators are injected so tests can substitute fakes.
use crate::stop::StopSignal;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// OS-assigned identifier of an interactive desktop session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolves the currently active interactive session.
///
/// Resolution failure is indistinguishable from "no session": the loop
/// keeps retrying and never treats it as fatal.
pub trait SessionResolver {
    fn active_session(&self) -> Option<SessionId>;
}

/// A launched agent process.
///
/// `is_alive` is a non-blocking poll, safe to call every cycle.
/// `terminate` forcibly stops the process if it is still running and
/// releases the underlying OS handle; it is idempotent, and dropping an
/// untracked child releases the handle as well, so the handle is freed
/// exactly once on every path.
pub trait ChildProcess {
    fn pid(&self) -> u32;
    fn is_alive(&mut self) -> bool;
    fn terminate(&mut self);
}

/// Creates the agent process inside a given session, running as that
/// session's interactive user.
pub trait Launcher {
    type Child: ChildProcess;

    fn launch(&self, executable: &Path, session: SessionId) -> Result<Self::Child, LaunchError>;
}

/// The step of the launch sequence that failed. The retry policy treats all
/// stages identically; the stage only appears in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStage {
    /// Acquiring the interactive user's token for the target session.
    QueryToken,
    /// Duplicating the token into a primary token.
    DuplicateToken,
    /// Building the user's environment block.
    Environment,
    /// Creating the process itself.
    Spawn,
}

/// A failed launch attempt, with the stage that failed and its cause.
#[derive(Debug)]
pub struct LaunchError {
    pub stage: LaunchStage,
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl LaunchError {
    pub fn new(
        stage: LaunchStage,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self.stage {
            LaunchStage::QueryToken => "acquiring user token",
            LaunchStage::DuplicateToken => "duplicating token",
            LaunchStage::Environment => "building user environment",
            LaunchStage::Spawn => "creating process",
        };
        write!(f, "{}: {}", stage, self.source)
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// The tracked agent process. At most one exists at any time; the record
/// owns the process handle exclusively.
struct ChildRecord<C> {
    child: C,
    pid: u32,
    session: SessionId,
    launched_at: DateTime<Utc>,
}

/// Loop states, evaluated once per cycle. The terminal state (stopped) is
/// implicit: the loop exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NoSession,
    ChildRunning,
    LaunchFailed,
}

/// Wait intervals between cycles. Values come from configuration.
#[derive(Debug, Clone, Copy)]
pub struct Tunables {
    /// Liveness poll period while a child is tracked.
    pub poll_interval: Duration,
    /// Delay before retrying after a failed launch.
    pub restart_delay: Duration,
    /// Delay between session checks while no user is logged in.
    pub session_wait: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            restart_delay: Duration::from_secs(5),
            session_wait: Duration::from_secs(10),
        }
    }
}

/// What the loop should do after one cycle.
enum Cycle {
    /// Wait on the stop signal for the given duration, then re-evaluate.
    Wait(Duration),
    /// Re-evaluate immediately.
    Continue,
}

pub struct Supervisor<R, L: Launcher> {
    resolver: R,
    launcher: L,
    stop: Arc<StopSignal>,
    executable: PathBuf,
    tunables: Tunables,
    state: SupervisorState,
    child: Option<ChildRecord<L::Child>>,
}

impl<R: SessionResolver, L: Launcher> Supervisor<R, L> {
    pub fn new(
        resolver: R,
        launcher: L,
        stop: Arc<StopSignal>,
        executable: PathBuf,
        tunables: Tunables,
    ) -> Self {
        Self {
            resolver,
            launcher,
            stop,
            executable,
            tunables,
            state: SupervisorState::NoSession,
            child: None,
        }
    }

    /// Run until the stop signal is set, then terminate any tracked child.
    pub fn run(&mut self) {
        info!(executable = %self.executable.display(), "supervisor started");
        while !self.stop.is_set() {
            match self.cycle() {
                Cycle::Wait(timeout) => {
                    if self.stop.wait_timeout(timeout) {
                        break;
                    }
                }
                Cycle::Continue => {}
            }
        }
        self.shutdown();
    }

    /// One evaluation of the transition table.
    fn cycle(&mut self) -> Cycle {
        // A failed launch only delays the next attempt; the state folds back
        // to NoSession before re-evaluation.
        if self.state == SupervisorState::LaunchFailed {
            self.set_state(SupervisorState::NoSession);
        }

        // A tracked child is checked before the session. A child that
        // outlives its login session is left running until it exits on its
        // own or the supervisor stops; the loop never relaunches while a
        // child is tracked.
        if let Some(record) = self.child.as_mut() {
            if record.child.is_alive() {
                return Cycle::Wait(self.tunables.poll_interval);
            }
        }
        if let Some(record) = self.child.take() {
            let uptime = (Utc::now() - record.launched_at).num_seconds();
            info!(
                pid = record.pid,
                session = %record.session,
                uptime_secs = uptime,
                "agent exited"
            );
            // Dropping the record releases the process handle.
            self.set_state(SupervisorState::NoSession);
            return Cycle::Continue;
        }

        let Some(session) = self.resolver.active_session() else {
            self.set_state(SupervisorState::NoSession);
            info!(
                wait_secs = self.tunables.session_wait.as_secs(),
                "no active user session; waiting"
            );
            return Cycle::Wait(self.tunables.session_wait);
        };

        match self.launcher.launch(&self.executable, session) {
            Ok(child) => {
                let pid = child.pid();
                self.child = Some(ChildRecord {
                    child,
                    pid,
                    session,
                    launched_at: Utc::now(),
                });
                self.set_state(SupervisorState::ChildRunning);
                info!(pid, %session, "agent launched");
                Cycle::Wait(self.tunables.poll_interval)
            }
            Err(error) => {
                warn!(
                    %session,
                    %error,
                    retry_secs = self.tunables.restart_delay.as_secs(),
                    "launch failed; retrying"
                );
                self.set_state(SupervisorState::LaunchFailed);
                Cycle::Wait(self.tunables.restart_delay)
            }
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut record) = self.child.take() {
            info!(pid = record.pid, "stop requested; terminating agent");
            record.child.terminate();
        }
        info!("supervisor stopped");
    }

    fn set_state(&mut self, next: SupervisorState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "state transition");
            self.state = next;
        }
    }

    #[cfg(test)]
    fn state(&self) -> SupervisorState {
        self.state
    }

    #[cfg(test)]
    fn tracked_session(&self) -> Option<SessionId> {
        self.child.as_ref().map(|record| record.session)
    }
}
