use crate::identity::SessionEnv;
use anyhow::{Context, Result, bail};
use nix::{
    sys::{prctl, signal::Signal},
    unistd::{execv, execve},
};
use std::{
    convert::Infallible,
    ffi::{CString, OsStr, OsString},
    io,
    os::unix::{ffi::OsStrExt, process::CommandExt},
    path::{Path, PathBuf},
    process::{Child, Command},
};
use tracing::debug;

/// Replaces the current process image. There is no way back: on success nothing
/// after [`Exec::replace`] runs, not even destructors.
#[derive(Debug)]
pub struct Exec {
    program: PathBuf,
    argv0: OsString,
    args: Vec<OsString>,
    env: Option<SessionEnv>,
}

impl Exec {
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        let program = program.as_ref().to_path_buf();

        Self {
            argv0: program.clone().into_os_string(),
            program,
            args: Vec::new(),
            env: None,
        }
    }

    pub fn arg0<S: AsRef<OsStr>>(mut self, argv0: S) -> Self {
        self.argv0 = argv0.as_ref().to_os_string();
        self
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }

    /// Use `env` instead of inheriting the environment of this process.
    pub fn env(mut self, env: &SessionEnv) -> Self {
        self.env = Some(env.clone());
        self
    }

    /// Performs the exec. Only returns if the kernel refused it.
    pub fn replace(self) -> Result<Infallible> {
        let path = to_cstring(self.program.as_os_str())?;
        let argv = std::iter::once(&self.argv0)
            .chain(self.args.iter())
            .map(|arg| to_cstring(arg))
            .collect::<Result<Vec<_>>>()?;

        debug!("exec {:?} {:?}", self.program, &argv[1..]);

        let result = match &self.env {
            Some(env) => execve(&path, &argv, &env.to_cstrings()?),
            None => execv(&path, &argv),
        };

        result.with_context(|| format!("Failed to exec {}", self.program.display()))
    }
}

fn to_cstring(value: &OsStr) -> Result<CString> {
    CString::new(value.as_bytes()).with_context(|| format!("{value:?} contains a NUL byte"))
}

/// Runs a helper to completion; a non-zero exit is an error.
pub fn run_checked(command: &mut Command, what: &str) -> Result<()> {
    let status = command
        .status()
        .with_context(|| format!("Failed to run {what}"))?;

    if !status.success() {
        bail!("{what} failed: {status}");
    }

    Ok(())
}

/// Spawns a background child that receives SIGTERM once this process dies.
///
/// The parent-death signal survives our own exec, so children outlive the
/// bootstrap but not the launcher that replaces it.
pub fn spawn_background(command: &mut Command, what: &str) -> Result<Child> {
    // SAFETY: the closure only issues a prctl syscall, which is async-signal-safe.
    unsafe {
        command.pre_exec(|| {
            prctl::set_pdeathsig(Signal::SIGTERM).map_err(io::Error::from)
        });
    }

    let child = command
        .spawn()
        .with_context(|| format!("Failed to start {what}"))?;

    debug!("{what} started with pid {}", child.id());
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_checked_reports_status() {
        assert!(run_checked(Command::new("/bin/sh").args(["-c", "exit 0"]), "ok").is_ok());

        let error = run_checked(Command::new("/bin/sh").args(["-c", "exit 4"]), "helper")
            .unwrap_err()
            .to_string();
        assert!(error.starts_with("helper failed"), "{error}");
    }

    #[test]
    fn test_run_checked_missing_program() {
        assert!(run_checked(&mut Command::new("/nonexistent/helper"), "helper").is_err());
    }

    #[test]
    fn test_spawn_background() -> Result<()> {
        let mut child = spawn_background(Command::new("/bin/sh").args(["-c", "exit 0"]), "sh")?;
        assert!(child.wait()?.success());
        Ok(())
    }

    #[test]
    fn test_exec_missing_target_returns_error() {
        let result = Exec::new("/nonexistent/ibcstart.sh")
            .arg("-g")
            .arg("981")
            .env(&SessionEnv::default())
            .replace();

        assert!(result.is_err());
    }
}
