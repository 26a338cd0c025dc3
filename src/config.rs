use anyhow::{Result, anyhow, bail};
use clap::{Args, Parser};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

const HEADING_GENERAL: &str = "General";
const HEADING_PATHS: &str = "Paths";
const HEADING_DISPLAY: &str = "Display";
const HEADING_GATEWAY: &str = "Gateway";

#[derive(Parser, Debug, Clone)]
#[command(name = "gatewayd", about = "Headless Trading Gateway Bootstrap")]
pub struct Config {
    #[command(flatten)]
    pub general: GeneralOptions,

    #[command(flatten)]
    pub paths: PathOptions,

    #[command(flatten)]
    pub display: DisplayOptions,

    #[command(flatten)]
    pub gateway: GatewayOptions,
}

impl Config {
    /// Desktop name advertised by the display server.
    pub fn desktop_name(&self) -> String {
        match &self.display.desktop_name {
            Some(name) => name.clone(),
            None => format!(
                "tws-{}-{}",
                self.gateway.trading_mode,
                self.gateway.username.as_deref().unwrap_or("default")
            ),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct GeneralOptions {
    #[arg(
        long,
        env = "SERVICE_USER",
        default_value = "tws",
        help = "Unprivileged account the session runs as",
        help_heading = HEADING_GENERAL
    )]
    pub service_user: String,

    #[arg(
        long,
        env = "TZ",
        default_value = "America/New_York",
        help = "Timezone exported to the session",
        help_heading = HEADING_GENERAL
    )]
    pub timezone: String,

    #[arg(
        long,
        env = "VNC_QUIET_SECRET",
        help = "Do not log the display password",
        help_heading = HEADING_GENERAL
    )]
    pub quiet_secret: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PathOptions {
    #[arg(
        long,
        env = "SERVICE_HOME",
        default_value = "/home/tws",
        help = "Home tree handed over to the service account",
        help_heading = HEADING_PATHS
    )]
    pub home: PathBuf,

    #[arg(
        long,
        env = "CONF_DIR",
        default_value = "/conf",
        help = "Directory holding optional jts.ini / tws.xml assets",
        help_heading = HEADING_PATHS
    )]
    pub conf_dir: PathBuf,

    #[arg(
        long,
        env = "IBC_START_SCRIPT",
        default_value = "/opt/ibc/scripts/ibcstart.sh",
        help = "Gateway launcher script",
        help_heading = HEADING_PATHS
    )]
    pub start_script: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct DisplayOptions {
    #[arg(
        long = "display",
        env = "DISPLAY_NUMBER",
        default_value_t = 0,
        help = "X display number",
        help_heading = HEADING_DISPLAY
    )]
    pub number: u32,

    #[arg(
        long,
        env = "VNC_GEOMETRY",
        default_value = "1920x1080",
        value_parser = validate_geometry,
        help = "Screen geometry <WIDTH>x<HEIGHT>",
        help_heading = HEADING_DISPLAY
    )]
    pub geometry: String,

    #[arg(
        long,
        env = "VNC_DEPTH",
        default_value_t = 24,
        help = "Color depth",
        help_heading = HEADING_DISPLAY
    )]
    pub depth: u8,

    #[arg(
        long,
        env = "VNC_NAME",
        help = "Desktop name (default: tws-<trading mode>-<username>)",
        help_heading = HEADING_DISPLAY
    )]
    pub desktop_name: Option<String>,

    #[arg(
        long,
        env = "VNC_PASSWORD",
        hide_env_values = true,
        help = "Display password (generated when unset)",
        help_heading = HEADING_DISPLAY
    )]
    pub password: Option<String>,

    #[arg(
        long,
        env = "X11_ROOT_COLOR",
        default_value = "#473C8B",
        help = "Root window background color",
        help_heading = HEADING_DISPLAY
    )]
    pub root_color: String,

    #[arg(
        long,
        env = "DISPLAY_READY_TIMEOUT_MS",
        default_value_t = 30_000,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Give up waiting for the display server after this many milliseconds",
        help_heading = HEADING_DISPLAY
    )]
    pub ready_timeout_ms: u64,

    #[arg(
        long,
        env = "DISPLAY_POLL_INTERVAL_MS",
        default_value_t = 50,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Readiness poll interval in milliseconds",
        help_heading = HEADING_DISPLAY
    )]
    pub poll_interval_ms: u64,
}

impl DisplayOptions {
    /// Value for `DISPLAY`, e.g. `:0`.
    pub fn name(&self) -> String {
        format!(":{}", self.number)
    }

    /// Socket the server creates once it accepts connections.
    pub fn marker_path(&self) -> PathBuf {
        PathBuf::from(format!("/tmp/.X11-unix/X{}", self.number))
    }

    pub fn lock_path(&self) -> PathBuf {
        PathBuf::from(format!("/tmp/.X{}-lock", self.number))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Args, Debug, Clone)]
pub struct GatewayOptions {
    #[arg(
        long,
        env = "IBC_TRADING_MODE",
        default_value = "live",
        help = "Trading mode (live or paper)",
        help_heading = HEADING_GATEWAY
    )]
    pub trading_mode: String,

    #[arg(
        long,
        env = "IBC_USERNAME",
        hide_env_values = true,
        help = "Gateway login, also used in the default desktop name",
        help_heading = HEADING_GATEWAY
    )]
    pub username: Option<String>,

    #[arg(
        long,
        env = "JVM_HEAP_SIZE",
        help = "Replace the -Xmx directive with this heap size (e.g. 4096m)",
        help_heading = HEADING_GATEWAY
    )]
    pub jvm_heap_size: Option<String>,
}

impl GatewayOptions {
    /// Values for the launcher config keys that also exist as options.
    /// These take precedence over the environment snapshot.
    pub fn lookup(&self, var: &str) -> Option<&str> {
        match var {
            "IBC_TRADING_MODE" => Some(self.trading_mode.as_str()),
            "IBC_USERNAME" => self.username.as_deref(),
            _ => None,
        }
    }
}

/// File locations under the service account's home.
#[derive(Debug, Clone)]
pub struct Layout {
    home: PathBuf,
}

impl Layout {
    pub fn new<P: AsRef<Path>>(home: P) -> Self {
        Self {
            home: home.as_ref().to_path_buf(),
        }
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.home.join(".vnc")
    }

    pub fn secret_file(&self) -> PathBuf {
        self.secrets_dir().join("passwd")
    }

    pub fn jts_dir(&self) -> PathBuf {
        self.home.join("Jts")
    }

    pub fn ibc_config(&self) -> PathBuf {
        self.home.join("ibc").join("config.ini")
    }

    pub fn vm_options(&self, version: &str) -> PathBuf {
        self.jts_dir()
            .join("ibgateway")
            .join(version)
            .join("ibgateway.vmoptions")
    }
}

fn validate_geometry(input: &str) -> Result<String> {
    let (width, height) = input
        .split_once('x')
        .ok_or_else(|| anyhow!("expected <WIDTH>x<HEIGHT>, got {input:?}"))?;

    let width = width.parse::<u32>()?;
    let height = height.parse::<u32>()?;

    if width == 0 || height == 0 {
        bail!("geometry must be non-zero, got {input:?}");
    }

    Ok(input.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::ConfigDocument;

    #[test]
    fn test_geometry_validation() {
        assert!(validate_geometry("1920x1080").is_ok());
        assert!(validate_geometry("1920").is_err());
        assert!(validate_geometry("0x1080").is_err());
        assert!(validate_geometry("axb").is_err());
    }

    #[test]
    fn test_cli_overrides() -> Result<()> {
        let config = Config::try_parse_from([
            "gatewayd",
            "--display",
            "3",
            "--trading-mode",
            "paper",
            "--username",
            "alice",
            "--geometry",
            "1280x720",
        ])?;

        assert_eq!(config.display.name(), ":3");
        assert_eq!(config.display.geometry, "1280x720");
        assert_eq!(config.display.marker_path(), PathBuf::from("/tmp/.X11-unix/X3"));
        assert_eq!(config.display.lock_path(), PathBuf::from("/tmp/.X3-lock"));
        assert_eq!(config.desktop_name(), "tws-paper-alice");

        Ok(())
    }

    #[test]
    fn test_gateway_options_reach_launcher_config() -> Result<()> {
        let config =
            Config::try_parse_from(["gatewayd", "--trading-mode", "paper", "--username", "alice"])?;
        let document = ConfigDocument::render(|var| config.gateway.lookup(var));

        assert_eq!(config.desktop_name(), "tws-paper-alice");
        assert_eq!(document.get("TradingMode"), Some("paper"));
        assert_eq!(document.get("IbLoginId"), Some("alice"));
        Ok(())
    }

    #[test]
    fn test_options_take_precedence_over_snapshot() -> Result<()> {
        let config = Config::try_parse_from(["gatewayd", "--trading-mode", "paper"])?;
        let snapshot = |var: &str| match var {
            "IBC_TRADING_MODE" => Some("live"),
            "IBC_USERNAME" => Some("bob"),
            _ => None,
        };
        let document =
            ConfigDocument::render(|var| config.gateway.lookup(var).or_else(|| snapshot(var)));

        assert_eq!(document.get("TradingMode"), Some("paper"));
        // Unset option falls through to the snapshot
        assert_eq!(document.get("IbLoginId"), Some("bob"));
        Ok(())
    }

    #[test]
    fn test_rejects_zero_wait_settings() {
        assert!(Config::try_parse_from(["gatewayd", "--ready-timeout-ms", "0"]).is_err());
        assert!(Config::try_parse_from(["gatewayd", "--poll-interval-ms", "0"]).is_err());
        assert!(Config::try_parse_from(["gatewayd", "--poll-interval-ms", "1"]).is_ok());
    }

    #[test]
    fn test_explicit_desktop_name_wins() -> Result<()> {
        let config = Config::try_parse_from(["gatewayd", "--desktop-name", "desk"])?;
        assert_eq!(config.desktop_name(), "desk");
        Ok(())
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert!(Config::try_parse_from(["gatewayd", "--geometry", "wide"]).is_err());
    }

    #[test]
    fn test_layout() {
        let layout = Layout::new("/home/tws");
        assert_eq!(layout.secret_file(), PathBuf::from("/home/tws/.vnc/passwd"));
        assert_eq!(layout.ibc_config(), PathBuf::from("/home/tws/ibc/config.ini"));
        assert_eq!(
            layout.vm_options("981"),
            PathBuf::from("/home/tws/Jts/ibgateway/981/ibgateway.vmoptions")
        );
    }
}
