use crate::{identity::SessionEnv, utils};
use anyhow::{Context, Result, anyhow, bail};
use rand::{TryRngCore, rngs::OsRng};
use std::{
    ffi::OsString,
    fmt,
    fs::OpenOptions,
    io::Write,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};
use tracing::{debug, info};

/// Display-session password, hex encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionSecret(String);

impl SessionSecret {
    pub const RANDOM_BYTES: usize = 16;

    /// Draws fresh bytes from the OS entropy source.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; Self::RANDOM_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|error| anyhow!("Failed to read OS entropy: {error}"))?;
        Ok(Self(hex::encode(bytes)))
    }

    /// Uses `supplied` when present, otherwise generates a secret.
    pub fn supplied_or_generate(supplied: Option<&str>) -> Result<Self> {
        match supplied {
            Some(value) if !value.is_empty() => Ok(Self(value.to_string())),
            _ => Self::generate(),
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionSecret(..)")
    }
}

/// Hashes the secret into the display server's password file.
#[derive(Debug)]
pub struct SecretProvisioner {
    dir: PathBuf,
    file_name: OsString,
    helper: PathBuf,
    helper_args: Vec<OsString>,
}

impl SecretProvisioner {
    pub fn new<P: AsRef<Path>>(secret_file: P) -> Result<Self> {
        let secret_file = secret_file.as_ref();
        let dir = secret_file
            .parent()
            .ok_or_else(|| anyhow!("{} has no parent directory", secret_file.display()))?;
        let file_name = secret_file
            .file_name()
            .ok_or_else(|| anyhow!("{} has no file name", secret_file.display()))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            file_name: file_name.to_os_string(),
            helper: PathBuf::from("vncpasswd"),
            helper_args: vec![OsString::from("-f")],
        })
    }

    /// Replace the password helper (`vncpasswd -f`).
    #[cfg(test)]
    pub fn with_helper<P, I, S>(mut self, helper: P, args: I) -> Self
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.helper = helper.as_ref().to_path_buf();
        self.helper_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn secret_file(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// Writes the password file. The secrets directory ends up owner-only
    /// whether or not the helper succeeds.
    pub fn provision(&self, secret: &SessionSecret, env: &SessionEnv) -> Result<PathBuf> {
        utils::create_directory_recursive(&self.dir, 0o700)?;

        let written = self.write_secret(secret, env);
        let restricted = utils::restrict_to_owner(&self.dir);

        let path = written?;
        restricted.context("Failed to restrict secrets directory")?;

        info!("Display password written to {}", path.display());
        Ok(path)
    }

    fn write_secret(&self, secret: &SessionSecret, env: &SessionEnv) -> Result<PathBuf> {
        let path = self.secret_file();

        let output = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let mut child = env
            .apply(&mut Command::new(&self.helper))
            .args(&self.helper_args)
            .stdin(Stdio::piped())
            .stdout(output)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.helper.display()))?;

        // Dropping stdin closes the pipe so the helper sees EOF.
        let streamed = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(secret.expose().as_bytes()),
            None => Ok(()),
        };

        let status = child
            .wait()
            .with_context(|| format!("Failed to wait for {}", self.helper.display()))?;

        if !status.success() {
            bail!(
                "{} failed ({status}); refusing to start an unauthenticated display",
                self.helper.display()
            );
        }

        streamed.context("Failed to stream password to helper")?;

        debug!("{} exited with {status}", self.helper.display());
        Ok(path)
    }
}
