use crate::{
    config::Config,
    context::{GlobalContext, PrivilegeLevel, ROOTLESS_WITH_CAPABILITY_WARNING},
    identity::RunIdentity,
    log_capability_snapshot,
    process::Exec,
};
use anyhow::{Context, Result, anyhow, bail};
use nix::unistd::{Gid, Uid, geteuid, initgroups, setgid, setuid};
use std::{convert::Infallible, env, ffi::CString, os::unix::fs::lchown, path::Path};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Phase one of startup. A root process hands the home tree to the service
/// account and re-executes itself as that account; this call then never
/// returns. Unprivileged processes fall through untouched.
///
/// A setuid start is refused: the home path and account come from the
/// caller's arguments and environment, which must not steer a root chown.
pub fn bootstrap(context: &GlobalContext, config: &Config) -> Result<()> {
    match context.privilege_level() {
        PrivilegeLevel::Root => {
            let target = RunIdentity::from_name(&config.general.service_user)?;
            match restart_as(&target, &config.paths.home)? {}
        }

        PrivilegeLevel::Setuid => bail!(
            "Refusing to run setuid (ruid {}, euid {}); start as root instead",
            context.ruid(),
            context.euid()
        ),

        PrivilegeLevel::RootlessWithCapabilities => {
            warn!("{}", ROOTLESS_WITH_CAPABILITY_WARNING);
            Ok(())
        }

        PrivilegeLevel::Rootless => Ok(()),
    }
}

fn restart_as(target: &RunIdentity, home: &Path) -> Result<Infallible> {
    if target.uid.is_root() {
        bail!(
            "Service account {:?} is root; refusing to re-exec into the same identity",
            target.username
        );
    }

    info!(
        "Handing {} to {} ({}:{})",
        home.display(),
        target.username,
        target.uid,
        target.gid
    );
    chown_recursive(home, target.uid, target.gid)?;

    drop_privileges(target)?;
    log_capability_snapshot!("after privilege drop");

    reexec_self()
}

/// Re-owns every entry below `root`, like `chown -R`. Symlinks are re-owned themselves, never followed.
pub fn chown_recursive(root: &Path, uid: Uid, gid: Gid) -> Result<()> {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;

        lchown(entry.path(), Some(uid.as_raw()), Some(gid.as_raw()))
            .with_context(|| format!("Failed to chown {}", entry.path().display()))?;
    }

    Ok(())
}

/// Switches groups first, while we are still allowed to, then the uid.
fn drop_privileges(target: &RunIdentity) -> Result<()> {
    let name = CString::new(target.username.as_str())
        .with_context(|| format!("Invalid user name {:?}", target.username))?;

    initgroups(&name, target.gid)
        .with_context(|| format!("Failed to initialize groups for {}", target.username))?;
    setgid(target.gid).with_context(|| format!("Failed to set gid {}", target.gid))?;
    setuid(target.uid).with_context(|| format!("Failed to set uid {}", target.uid))?;

    let current = geteuid();
    if current != target.uid {
        bail!(
            "Privilege drop failed: expected euid {}, got {}",
            target.uid,
            current
        );
    }

    Ok(())
}

/// Replaces this process with a fresh copy of the same program and arguments.
/// The environment is inherited.
fn reexec_self() -> Result<Infallible> {
    let exe = env::current_exe().context("Failed to locate the running executable")?;
    let mut args = env::args_os();
    let argv0 = args
        .next()
        .ok_or_else(|| anyhow!("Empty argument vector"))?;

    info!("Restarting {} as uid {}", exe.display(), geteuid());
    Exec::new(exe).arg0(argv0).args(args).replace()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use nix::unistd::getegid;
    use std::{
        fs::{self, File},
        os::unix::fs::{MetadataExt, symlink},
    };

    #[test]
    fn test_unprivileged_start_is_noop() -> Result<()> {
        let home = tempfile::tempdir()?;
        let home_arg = home.path().to_string_lossy().into_owned();
        let config = Config::try_parse_from([
            "gatewayd",
            "--service-user",
            "nobody-here",
            "--home",
            home_arg.as_str(),
        ])?;

        for level in [
            PrivilegeLevel::Rootless,
            PrivilegeLevel::RootlessWithCapabilities,
        ] {
            bootstrap(&GlobalContext::with_level(level), &config)?;
        }

        Ok(())
    }

    #[test]
    fn test_setuid_start_is_refused_before_chown() -> Result<()> {
        let home = tempfile::tempdir()?;
        let owned = home.path().join("owned");
        File::create(&owned)?;
        let before = fs::symlink_metadata(&owned)?;

        let home_arg = home.path().to_string_lossy().into_owned();
        let user = RunIdentity::current()?.username;
        let config = Config::try_parse_from([
            "gatewayd",
            "--service-user",
            user.as_str(),
            "--home",
            home_arg.as_str(),
        ])?;

        let error = bootstrap(&GlobalContext::with_level(PrivilegeLevel::Setuid), &config)
            .unwrap_err()
            .to_string();
        assert!(error.contains("setuid"), "{error}");

        let after = fs::symlink_metadata(&owned)?;
        assert_eq!((after.uid(), after.gid()), (before.uid(), before.gid()));
        assert_eq!(after.ctime(), before.ctime());

        Ok(())
    }

    #[test]
    fn test_chown_recursive_to_self() -> Result<()> {
        let home = tempfile::tempdir()?;
        let nested = home.path().join("Jts").join("profileA");
        fs::create_dir_all(&nested)?;
        File::create(nested.join("tws.xml"))?;
        symlink("/nonexistent/target", home.path().join("dangling"))?;

        chown_recursive(home.path(), geteuid(), getegid())?;

        let metadata = fs::metadata(nested.join("tws.xml"))?;
        assert_eq!(metadata.uid(), geteuid().as_raw());
        assert_eq!(metadata.gid(), getegid().as_raw());

        Ok(())
    }

    #[test]
    fn test_chown_missing_tree_is_fatal() {
        let result = chown_recursive(
            Path::new("/nonexistent/home/tws"),
            geteuid(),
            getegid(),
        );
        assert!(result.is_err());
    }
}
