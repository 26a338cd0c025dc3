use crate::{profile, utils};
use anyhow::{Context, Result, anyhow, bail};
use glob::Pattern;
use std::{
    fs,
    path::{Component, Path, PathBuf},
};
use tracing::{debug, info};

const REGISTRY_FILE: &str = "jts.ini";
const SETTINGS_FILE: &str = "tws.xml";

/// Copies the optional `jts.ini` and `tws.xml` from `conf_dir` into `jts_dir`.
///
/// Each asset is skipped when it is absent. `tws.xml` lands in the active
/// profile directory named by the registry.
pub fn stage_assets(conf_dir: &Path, jts_dir: &Path) -> Result<()> {
    let registry = conf_dir.join(REGISTRY_FILE);
    let settings = conf_dir.join(SETTINGS_FILE);

    if registry.is_file() {
        copy_asset(&registry, &jts_dir.join(REGISTRY_FILE))?;
    } else {
        debug!("No {} to stage", registry.display());
    }

    if settings.is_file() {
        let profile = profile::read_profile_dir(&registry)?;
        info!("Found profile directory: {profile}");

        let profile_dir = jts_dir.join(profile_component(&profile)?);
        utils::create_directory_recursive(&profile_dir, 0o755)?;
        copy_asset(&settings, &profile_dir.join(SETTINGS_FILE))?;
    } else {
        debug!("No {} to stage", settings.display());
    }

    Ok(())
}

/// The profile must name a directory directly below the settings root.
fn profile_component(profile: &str) -> Result<&Path> {
    let path = Path::new(profile);
    let mut components = path.components();

    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(path),
        _ => bail!("Profile directory {profile:?} must be a single relative path component"),
    }
}

fn copy_asset(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        utils::create_directory_recursive(parent, 0o755)?;
    }

    fs::copy(from, to)
        .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;

    debug!("Copied {} to {}", from.display(), to.display());
    Ok(())
}

/// Installed gateway version: the first three-character directory under `<jts_dir>/ibgateway`.
pub fn resolve_version(jts_dir: &Path) -> Result<String> {
    let base = jts_dir.join("ibgateway");
    let base = base
        .to_str()
        .ok_or_else(|| anyhow!("{} is not valid UTF-8", base.display()))?;
    let pattern = format!("{}/???", Pattern::escape(base));

    let mut candidates: Vec<PathBuf> = glob::glob(&pattern)
        .with_context(|| format!("Invalid version pattern {pattern}"))?
        .filter_map(Result::ok)
        .filter(|path| path.is_dir())
        .collect();
    candidates.sort();

    let version = candidates
        .first()
        .and_then(|path| path.file_name())
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("No gateway installation found under {base}"))?
        .to_string();

    info!("Found gateway version: {version}");
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stages_registry_and_profile_settings() -> Result<()> {
        let conf = tempfile::tempdir()?;
        let home = tempfile::tempdir()?;
        let jts = home.path().join("Jts");

        fs::write(
            conf.path().join("jts.ini"),
            "[Logon]\nUsernameToDirectory=profileA,profileB\n",
        )?;
        fs::write(conf.path().join("tws.xml"), "<xml/>")?;

        stage_assets(conf.path(), &jts)?;

        assert!(jts.join("jts.ini").is_file());
        assert_eq!(fs::read_to_string(jts.join("profileA").join("tws.xml"))?, "<xml/>");
        assert!(!jts.join("profileB").exists());

        Ok(())
    }

    #[test]
    fn test_profile_outside_settings_root_is_rejected() -> Result<()> {
        let conf = tempfile::tempdir()?;
        let home = tempfile::tempdir()?;
        let outside = tempfile::tempdir()?;
        let jts = home.path().join("Jts");
        fs::write(conf.path().join("tws.xml"), "<xml/>")?;

        for profile in [
            outside.path().to_string_lossy().into_owned(),
            "../escaped".to_string(),
            "a/b".to_string(),
        ] {
            fs::write(
                conf.path().join("jts.ini"),
                format!("[Logon]\nUsernameToDirectory={profile}\n"),
            )?;
            assert!(stage_assets(conf.path(), &jts).is_err(), "{profile}");
        }

        assert!(!outside.path().join("tws.xml").exists());
        assert!(!home.path().join("escaped").exists());
        Ok(())
    }

    #[test]
    fn test_missing_assets_are_skipped() -> Result<()> {
        let conf = tempfile::tempdir()?;
        let home = tempfile::tempdir()?;
        let jts = home.path().join("Jts");

        stage_assets(conf.path(), &jts)?;

        assert!(!jts.exists());
        Ok(())
    }

    #[test]
    fn test_settings_without_registry_is_an_error() -> Result<()> {
        let conf = tempfile::tempdir()?;
        let home = tempfile::tempdir()?;
        fs::write(conf.path().join("tws.xml"), "<xml/>")?;

        assert!(stage_assets(conf.path(), &home.path().join("Jts")).is_err());
        Ok(())
    }

    #[test]
    fn test_resolve_version() -> Result<()> {
        let home = tempfile::tempdir()?;
        let jts = home.path().join("Jts");
        let gateway = jts.join("ibgateway");

        fs::create_dir_all(gateway.join("981"))?;
        fs::create_dir_all(gateway.join("1019"))?;
        fs::write(gateway.join("abc"), "not a directory")?;

        assert_eq!(resolve_version(&jts)?, "981");
        Ok(())
    }

    #[test]
    fn test_resolve_version_without_installation() -> Result<()> {
        let home = tempfile::tempdir()?;
        assert!(resolve_version(&home.path().join("Jts")).is_err());
        Ok(())
    }
}
