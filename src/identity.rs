use anyhow::{Context, Result, anyhow};
use nix::unistd::{Gid, Uid, User, geteuid};
use std::{
    collections::BTreeMap,
    ffi::{CString, OsStr, OsString},
    os::unix::ffi::OsStrExt,
    path::PathBuf,
    process::Command,
};

/// User-database entry the session runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    pub uid: Uid,
    pub gid: Gid,
    pub home: PathBuf,
    pub shell: PathBuf,
    pub username: String,
}

impl RunIdentity {
    /// Resolves the entry for the effective uid.
    pub fn current() -> Result<Self> {
        Self::from_uid(geteuid())
    }

    pub fn from_uid(uid: Uid) -> Result<Self> {
        User::from_uid(uid)
            .with_context(|| format!("Failed to query user database for uid {uid}"))?
            .map(Self::from)
            .ok_or_else(|| anyhow!("No user database entry for uid {uid}"))
    }

    pub fn from_name(name: &str) -> Result<Self> {
        User::from_name(name)
            .with_context(|| format!("Failed to query user database for {name:?}"))?
            .map(Self::from)
            .ok_or_else(|| anyhow!("No user database entry for {name:?}"))
    }
}

impl From<User> for RunIdentity {
    fn from(user: User) -> Self {
        Self {
            uid: user.uid,
            gid: user.gid,
            home: user.dir,
            shell: user.shell,
            username: user.name,
        }
    }
}

/// Environment handed to every child, captured once at startup.
#[derive(Debug, Clone, Default)]
pub struct SessionEnv {
    vars: BTreeMap<OsString, OsString>,
}

impl SessionEnv {
    pub fn capture() -> Self {
        Self::from_vars(std::env::vars_os())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    /// Points `USER`, `LOGNAME`, `HOME` and `SHELL` at `identity`.
    pub fn apply_identity(&mut self, identity: &RunIdentity) {
        self.set("USER", &identity.username);
        self.set("LOGNAME", &identity.username);
        self.set("HOME", &identity.home);
        self.set("SHELL", &identity.shell);
    }

    pub fn set<K: AsRef<OsStr>, V: AsRef<OsStr>>(&mut self, key: K, value: V) {
        self.vars
            .insert(key.as_ref().to_os_string(), value.as_ref().to_os_string());
    }

    /// Sets `key` only when it is absent.
    pub fn set_default<K: AsRef<OsStr>, V: AsRef<OsStr>>(&mut self, key: K, value: V) {
        self.vars
            .entry(key.as_ref().to_os_string())
            .or_insert_with(|| value.as_ref().to_os_string());
    }

    /// Returns the value of `key` when it is set and valid UTF-8.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(OsStr::new(key)).and_then(|value| value.to_str())
    }

    /// Replaces the environment of `command` with this one.
    pub fn apply<'a>(&self, command: &'a mut Command) -> &'a mut Command {
        command.env_clear().envs(&self.vars)
    }

    /// `KEY=VALUE` strings for `execve`.
    pub fn to_cstrings(&self) -> Result<Vec<CString>> {
        self.vars
            .iter()
            .map(|(key, value)| {
                let mut entry = key.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                CString::new(entry).with_context(|| {
                    format!("Environment variable {:?} contains a NUL byte", key)
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> RunIdentity {
        RunIdentity {
            uid: Uid::from_raw(1000),
            gid: Gid::from_raw(1000),
            home: PathBuf::from("/home/tws"),
            shell: PathBuf::from("/bin/bash"),
            username: "tws".to_string(),
        }
    }

    #[test]
    fn test_current_identity_resolves() -> Result<()> {
        let identity = RunIdentity::current()?;
        assert_eq!(identity.uid, geteuid());
        assert!(!identity.username.is_empty());
        Ok(())
    }

    #[test]
    fn test_apply_identity_overrides_stale_values() {
        let mut env = SessionEnv::from_vars([("USER", "root"), ("HOME", "/root"), ("PATH", "/bin")]);
        env.apply_identity(&identity());

        assert_eq!(env.get("USER"), Some("tws"));
        assert_eq!(env.get("LOGNAME"), Some("tws"));
        assert_eq!(env.get("HOME"), Some("/home/tws"));
        assert_eq!(env.get("SHELL"), Some("/bin/bash"));
        assert_eq!(env.get("PATH"), Some("/bin"));
    }

    #[test]
    fn test_set_default_keeps_existing() {
        let mut env = SessionEnv::from_vars([("TZ", "UTC")]);
        env.set_default("TZ", "America/New_York");
        env.set_default("LANG", "C.UTF-8");

        assert_eq!(env.get("TZ"), Some("UTC"));
        assert_eq!(env.get("LANG"), Some("C.UTF-8"));
    }

    #[test]
    fn test_children_see_only_session_env() -> Result<()> {
        let env = SessionEnv::from_vars([("DISPLAY", ":7")]);
        let output = env
            .apply(Command::new("/bin/sh").args(["-c", "printf %s \"$DISPLAY\""]))
            .output()?;

        assert_eq!(String::from_utf8(output.stdout)?, ":7");
        Ok(())
    }

    #[test]
    fn test_cstrings() -> Result<()> {
        let env = SessionEnv::from_vars([("A", "1"), ("B", "x=y")]);
        let entries = env.to_cstrings()?;

        assert_eq!(entries, vec![CString::new("A=1")?, CString::new("B=x=y")?]);
        Ok(())
    }
}
