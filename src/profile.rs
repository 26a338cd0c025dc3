use anyhow::{Context, Result, anyhow, bail};
use std::{fs, path::Path};

const LOGON_SECTION: &str = "Logon";
const PROFILE_KEY: &str = "usernametodirectory";

/// Parsed INI document. Section names are case-sensitive, keys are not.
#[derive(Debug, Default)]
pub struct IniDocument {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl IniDocument {
    pub fn parse(text: &str) -> Result<Self> {
        let mut document = Self::default();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[') {
                let name = name
                    .strip_suffix(']')
                    .ok_or_else(|| anyhow!("line {}: unterminated section header", index + 1))?;
                document.sections.push((name.trim().to_string(), Vec::new()));
                continue;
            }

            let (key, value) = line
                .split_once(['=', ':'])
                .ok_or_else(|| anyhow!("line {}: expected key=value", index + 1))?;

            let Some((_, entries)) = document.sections.last_mut() else {
                bail!("line {}: key outside of any section", index + 1);
            };

            entries.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
        }

        Ok(document)
    }

    /// Last value of `key` in `section`.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();

        self.sections
            .iter()
            .filter(|(name, _)| name == section)
            .flat_map(|(_, entries)| entries.iter())
            .filter(|(name, _)| *name == key)
            .map(|(_, value)| value.as_str())
            .last()
    }
}

/// Active profile directory: first entry of `Logon/UsernameToDirectory`.
pub fn active_profile_dir(registry: &IniDocument) -> Result<String> {
    let value = registry
        .get(LOGON_SECTION, PROFILE_KEY)
        .ok_or_else(|| anyhow!("[{LOGON_SECTION}] {PROFILE_KEY} is not set"))?;

    match value.split(',').next().map(str::trim) {
        Some(first) if !first.is_empty() => Ok(first.to_string()),
        _ => bail!("[{LOGON_SECTION}] {PROFILE_KEY} is empty"),
    }
}

pub fn read_profile_dir(path: &Path) -> Result<String> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read profile registry {}", path.display()))?;
    let registry = IniDocument::parse(&text)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    active_profile_dir(&registry).with_context(|| format!("In {}", path.display()))
}
