use crate::capabilities::has_any_permitted_capabilities;
use anyhow::{Context, Result, bail};
use nix::unistd::{Gid, Uid, getegid, geteuid, getuid};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PrivilegeLevel {
    Root,
    Rootless,
    Setuid,
    RootlessWithCapabilities,
}

/// Identity of the process at startup, captured before any privilege change.
#[derive(Debug, Clone, Copy)]
pub struct GlobalContext {
    ruid: Uid,
    euid: Uid,
    egid: Gid,
    level: PrivilegeLevel,
}

impl GlobalContext {
    /// Probe the ids and capabilities of the running process
    pub fn detect() -> Result<Self> {
        let ruid = getuid();
        let euid = geteuid();
        let egid = getegid();

        let level = if ruid != euid {
            if !euid.is_root() {
                bail!(
                    "FATAL: setuid binary must elevate to root (euid=0), but got euid={}",
                    euid
                );
            }
            PrivilegeLevel::Setuid
        } else if euid.is_root() {
            PrivilegeLevel::Root
        } else if has_any_permitted_capabilities()
            .context("Failed to probe permitted capabilities")?
        {
            PrivilegeLevel::RootlessWithCapabilities
        } else {
            PrivilegeLevel::Rootless
        };

        Ok(Self {
            ruid,
            euid,
            egid,
            level,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_level(level: PrivilegeLevel) -> Self {
        Self {
            ruid: getuid(),
            euid: geteuid(),
            egid: getegid(),
            level,
        }
    }

    #[inline]
    pub fn ruid(&self) -> Uid {
        self.ruid
    }

    #[inline]
    pub fn euid(&self) -> Uid {
        self.euid
    }

    #[inline]
    pub fn egid(&self) -> Gid {
        self.egid
    }

    #[inline]
    pub fn privilege_level(&self) -> PrivilegeLevel {
        self.level
    }
}

pub(crate) const ROOTLESS_WITH_CAPABILITY_WARNING: &str = "Detected permitted capabilities without root privileges. \
File capabilities (setcap) are not used for the privilege drop; continuing as the current user.";
