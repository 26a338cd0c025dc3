use crate::{config::Config, identity::SessionEnv, process, utils};
use anyhow::{Context, Result};
use nix::{
    sys::signal::{Signal::SIGKILL, kill},
    unistd::Pid,
};
use std::{
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info};

/// Long internal connection wait passed to the server (`-rfbwait`), in milliseconds.
const RFB_WAIT_MS: &str = "120000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    NotStarted,
    Starting,
    Ready,
    Failed,
}

/// Why the display server never became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayFailure {
    ChildExited(ExitStatus),
    Timeout(Duration),
}

impl fmt::Display for DisplayFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayFailure::ChildExited(status) => {
                write!(f, "display server exited before becoming ready ({status})")
            }
            DisplayFailure::Timeout(after) => {
                write!(f, "display server not ready after {after:?}")
            }
        }
    }
}

#[derive(Debug)]
pub enum Readiness {
    Ready(DisplayHandle),
    Failed(DisplayFailure),
}

/// Bounded readiness polling.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub ceiling: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            ceiling: Duration::from_secs(30),
        }
    }
}

/// Program and arguments used to start the display server.
#[derive(Debug, Clone)]
pub struct ServerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl ServerCommand {
    /// `Xtightvnc` configured from `config`, authenticated by `secret_file`.
    pub fn xtightvnc(config: &Config, secret_file: &Path) -> Self {
        let display = &config.display;

        let args = [
            OsString::from(display.name()),
            "-geometry".into(),
            display.geometry.clone().into(),
            "-depth".into(),
            display.depth.to_string().into(),
            "-rfbwait".into(),
            RFB_WAIT_MS.into(),
            "-rfbauth".into(),
            secret_file.as_os_str().to_os_string(),
            "-desktop".into(),
            config.desktop_name().into(),
        ];

        Self {
            program: PathBuf::from("Xtightvnc"),
            args: args.into(),
        }
    }
}

/// Starts the virtual display server and waits until its socket appears.
#[derive(Debug)]
pub struct DisplaySupervisor {
    server: ServerCommand,
    marker: PathBuf,
    lock: PathBuf,
    policy: PollPolicy,
    state: DisplayState,
}

impl DisplaySupervisor {
    pub fn new(server: ServerCommand, marker: PathBuf, lock: PathBuf) -> Self {
        Self {
            server,
            marker,
            lock,
            policy: PollPolicy::default(),
            state: DisplayState::NotStarted,
        }
    }

    pub fn from_config(config: &Config, secret_file: &Path) -> Self {
        Self::new(
            ServerCommand::xtightvnc(config, secret_file),
            config.display.marker_path(),
            config.display.lock_path(),
        )
        .with_policy(PollPolicy {
            interval: config.display.poll_interval(),
            ceiling: config.display.ready_timeout(),
        })
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[inline]
    pub fn state(&self) -> DisplayState {
        self.state
    }

    /// Removes the socket and lock file left behind by an unclean shutdown.
    pub fn cleanup_stale(&self) -> Result<()> {
        for path in [&self.marker, &self.lock] {
            if utils::remove_if_exists(path)? {
                debug!("Removed stale {}", path.display());
            }
        }

        Ok(())
    }

    /// Cleans up, starts the server and waits for it. A server that dies or
    /// never gets ready is reported as [`Readiness::Failed`], not as an error.
    pub fn launch(&mut self, env: &SessionEnv) -> Result<Readiness> {
        let handle = self.start(env)?;
        self.wait_ready(handle)
    }

    pub fn start(&mut self, env: &SessionEnv) -> Result<DisplayHandle> {
        self.cleanup_stale()?;
        self.state = DisplayState::Starting;

        info!(
            "Starting display server {} {:?}",
            self.server.program.display(),
            self.server.args
        );

        let child = process::spawn_background(
            env.apply(&mut Command::new(&self.server.program))
                .args(&self.server.args),
            "display server",
        )?;

        Ok(DisplayHandle::new(child, self.marker.clone()))
    }

    pub fn wait_ready(&mut self, mut handle: DisplayHandle) -> Result<Readiness> {
        let started = Instant::now();

        loop {
            if handle.marker_exists()? {
                self.state = DisplayState::Ready;
                info!("Display server ready after {:?}", started.elapsed());
                return Ok(Readiness::Ready(handle));
            }

            if let Some(status) = handle.try_wait()? {
                return Ok(self.fail(DisplayFailure::ChildExited(status)));
            }

            let elapsed = started.elapsed();
            if elapsed >= self.policy.ceiling {
                handle.terminate()?;
                return Ok(self.fail(DisplayFailure::Timeout(elapsed)));
            }

            thread::sleep(self.policy.interval.min(self.policy.ceiling - elapsed));
        }
    }

    fn fail(&mut self, failure: DisplayFailure) -> Readiness {
        self.state = DisplayState::Failed;
        error!("Display server failed to start: {failure}");
        Readiness::Failed(failure)
    }
}

/// Running display server plus the socket that signals readiness.
pub struct DisplayHandle {
    child: Child,
    marker: PathBuf,

    // Cached once the child has been reaped
    exited: Option<ExitStatus>,
}

impl DisplayHandle {
    #[inline]
    fn new(child: Child, marker: PathBuf) -> Self {
        Self {
            child,
            marker,
            exited: None,
        }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    #[cfg(test)]
    pub fn marker(&self) -> &Path {
        &self.marker
    }

    pub fn marker_exists(&self) -> Result<bool> {
        self.marker
            .try_exists()
            .with_context(|| format!("Failed to check {}", self.marker.display()))
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if self.exited.is_some() {
            return Ok(self.exited);
        }

        let status = self
            .child
            .try_wait()
            .with_context(|| format!("Failed to check status of process {}", self.pid()))?;

        self.exited = status;
        Ok(status)
    }

    /// Kills and reaps the server unless it already exited.
    pub fn terminate(&mut self) -> Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }

        let signal = SIGKILL;

        kill(self.pid(), signal).with_context(|| {
            format!(
                "Failed to terminate process {} with signal {}",
                self.pid(),
                signal
            )
        })?;

        let status = self
            .child
            .wait()
            .with_context(|| format!("Failed to wait for process {}", self.pid()))?;
        self.exited = Some(status);

        Ok(())
    }
}

impl fmt::Debug for DisplayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayHandle")
            .field("pid", &self.child.id())
            .field("marker", &self.marker)
            .field("exited", &self.exited)
            .finish()
    }
}
