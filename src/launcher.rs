use crate::{
    config::Config,
    identity::SessionEnv,
    process::{self, Exec},
};
use anyhow::Result;
use std::{
    convert::Infallible,
    path::PathBuf,
    process::Command,
};
use tracing::info;

/// Final stage: paints the root window, starts the window manager and execs
/// the gateway launcher script.
#[derive(Debug)]
pub struct Launcher {
    display: String,
    root_color: String,
    root_painter: PathBuf,
    window_manager: PathBuf,
    start_script: PathBuf,
}

impl Launcher {
    pub fn new(config: &Config) -> Self {
        Self {
            display: config.display.name(),
            root_color: config.display.root_color.clone(),
            root_painter: PathBuf::from("xsetroot"),
            window_manager: PathBuf::from("openbox"),
            start_script: config.paths.start_script.clone(),
        }
    }

    #[cfg(test)]
    pub fn with_programs<P: Into<PathBuf>>(mut self, root_painter: P, window_manager: P) -> Self {
        self.root_painter = root_painter.into();
        self.window_manager = window_manager.into();
        self
    }

    /// The launcher script invocation for `version`.
    pub fn exec_target(&self, version: &str, env: &SessionEnv) -> Exec {
        Exec::new(&self.start_script).arg("-g").arg(version).env(env)
    }

    /// Never returns on success.
    pub fn handoff(&self, env: &mut SessionEnv, version: &str) -> Result<Infallible> {
        env.set("DISPLAY", &self.display);

        process::run_checked(
            env.apply(&mut Command::new(&self.root_painter))
                .args(["-solid", self.root_color.as_str()]),
            "root window painter",
        )?;

        // Never awaited; the launcher inherits it across the exec.
        process::spawn_background(
            env.apply(&mut Command::new(&self.window_manager)),
            "window manager",
        )?;

        info!(
            "Handing off to {} -g {version}",
            self.start_script.display()
        );
        self.exec_target(version, env).replace()
    }
}
