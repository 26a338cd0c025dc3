use crate::utils;
use anyhow::{Context, Result};
use std::{fmt, fs, path::Path};
use tracing::info;

/// Where a key's value comes from.
#[derive(Debug, Clone, Copy)]
enum Source {
    /// Environment variable, with the value used when it is unset.
    Env(&'static str, &'static str),
    Fixed(&'static str),
}

/// Every key of the launcher config, in output order.
const ENTRIES: &[(&str, Source)] = &[
    ("FIX", Source::Env("IBC_FIX", "no")),
    ("IbLoginId", Source::Env("IBC_USERNAME", "")),
    ("IbPassword", Source::Env("IBC_PASSWORD", "")),
    ("FIXLoginId", Source::Env("IBC_FIX_USERNAME", "")),
    ("FIXPassword", Source::Env("IBC_FIX_PASSWORD", "")),
    ("TradingMode", Source::Env("IBC_TRADING_MODE", "live")),
    ("IbDir", Source::Fixed("")),
    ("SendTWSLogsToConsole", Source::Env("IBC_SEND_TWS_LOGS_TO_CONSOLE", "yes")),
    ("StoreSettingsOnServer", Source::Env("IBC_STORE_SETTINGS_ON_SERVER", "no")),
    ("MinimizeMainWindow", Source::Env("IBC_MINIMIZE_MAIN_WINDOW", "no")),
    ("MaximizeMainWindow", Source::Env("IBC_MAXIMIZE_MAIN_WINDOW", "yes")),
    (
        "ExistingSessionDetectedAction",
        Source::Env("IBC_EXISTING_SESSION_DETECTED", "manual"),
    ),
    (
        "AcceptIncomingConnectionAction",
        Source::Env("IBC_ACCEPT_INCOMING_CONNECTION", "accept"),
    ),
    ("ShowAllTrades", Source::Env("IBC_SHOW_ALL_TRADES", "no")),
    ("OverrideTwsApiPort", Source::Fixed("")),
    ("ReadOnlyLogin", Source::Env("IBC_READONLY_LOGIN", "no")),
    ("ReadOnlyApi", Source::Env("IBC_READONLY_API", "")),
    (
        "AcceptNonBrokerageAccountWarning",
        Source::Env("IBC_ACCEPT_NON_BROKERAGE_WARNING", "yes"),
    ),
    ("IbAutoClosedown", Source::Env("IBC_AUTO_CLOSEDOWN", "yes")),
    ("ClosedownAt", Source::Env("IBC_CLOSEDOWN_AT", "")),
    ("AllowBlindTrading", Source::Env("IBC_ALLOW_BLIND_TRADING", "no")),
    (
        "DismissPasswordExpiryWarning",
        Source::Env("IBC_DISMISS_PASSWORD_EXPIRY", "no"),
    ),
    (
        "DismissNSEComplianceNotice",
        Source::Env("IBC_DISMISS_NSE_COMPLIANCE", "yes"),
    ),
    ("SaveTwsSettingsAt", Source::Fixed("")),
    ("CommandServerPort", Source::Fixed("7462")),
    ("ControlFrom", Source::Env("IBC_CONTROL_FROM", "172.17.0.1")),
    ("BindAddress", Source::Fixed("")),
    ("CommandPrompt", Source::Env("IBC_COMMAND_PROMPT", "IBC> ")),
    ("SuppressInfoMessages", Source::Env("IBC_SUPPRESS_INFO_MESSAGES", "yes")),
    ("LogComponents", Source::Env("IBC_LOG_COMPONENTS", "never")),
];

/// Flat `Key=Value` document read by the gateway launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDocument {
    entries: Vec<(&'static str, String)>,
}

impl ConfigDocument {
    /// Renders every key, looking overrides up with `lookup`.
    pub fn render<'a, F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let entries = ENTRIES
            .iter()
            .map(|(key, source)| {
                let value = match *source {
                    Source::Env(var, default) => lookup(var).unwrap_or(default),
                    Source::Fixed(value) => value,
                };
                (*key, value.to_string())
            })
            .collect();

        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            utils::create_directory_recursive(parent, 0o755)?;
        }

        fs::write(path, self.to_string())
            .with_context(|| format!("Failed to write {}", path.display()))?;

        info!("Wrote {} ({} keys)", path.display(), self.entries.len());
        Ok(())
    }
}

impl fmt::Display for ConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.entries {
            writeln!(f, "{key}={value}")?;
        }
        Ok(())
    }
}
