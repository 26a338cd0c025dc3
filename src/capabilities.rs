use anyhow::{Context, Result};
use caps::{CapSet, CapsHashSet};

/// Represents the current state of process capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    pub effective: CapsHashSet,
    pub permitted: CapsHashSet,
    pub inheritable: CapsHashSet,
    pub bounding: CapsHashSet,
    pub ambient: CapsHashSet,
}

impl CapabilitySnapshot {
    /// Get the current snapshot of all capability sets
    pub fn current() -> Result<Self> {
        Ok(Self {
            effective: read_capability_set(CapSet::Effective)
                .context("Failed to read effective capabilities")?,
            permitted: read_capability_set(CapSet::Permitted)
                .context("Failed to read permitted capabilities")?,
            inheritable: read_capability_set(CapSet::Inheritable)
                .context("Failed to read inheritable capabilities")?,
            bounding: read_capability_set(CapSet::Bounding)
                .context("Failed to read bounding capabilities")?,
            ambient: read_capability_set(CapSet::Ambient)
                .context("Failed to read ambient capabilities")?,
        })
    }
}

impl std::fmt::Display for CapabilitySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Capabilities - ")?;
        write!(f, "Effective: {}, ", self.effective.len())?;
        write!(f, "Permitted: {}, ", self.permitted.len())?;
        write!(f, "Inheritable: {}, ", self.inheritable.len())?;
        write!(f, "Bounding: {}, ", self.bounding.len())?;
        write!(f, "Ambient: {}", self.ambient.len())
    }
}

#[macro_export]
macro_rules! log_capability_snapshot {
    ($label:expr) => {{
        use $crate::capabilities::CapabilitySnapshot;
        match CapabilitySnapshot::current() {
            Ok(snapshot) => tracing::debug!("{}: {}", $label, snapshot),
            Err(error) => tracing::debug!("{}: unavailable ({:#})", $label, error),
        }
    }};
    () => {{
        $crate::log_capability_snapshot!("capability snapshot")
    }};
}

fn read_capability_set(cap_set: CapSet) -> Result<CapsHashSet> {
    caps::read(None, cap_set).context(format!("Failed to read {:?} capability set", cap_set))
}

pub(crate) fn has_any_permitted_capabilities() -> Result<bool> {
    let capabilities = read_capability_set(CapSet::Permitted)?;
    Ok(!capabilities.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_display_counts_sets() -> Result<()> {
        let snapshot = CapabilitySnapshot::current()?;
        let rendered = snapshot.to_string();

        assert!(rendered.starts_with("Capabilities - "));
        assert!(rendered.contains(&format!("Permitted: {}", snapshot.permitted.len())));

        Ok(())
    }
}
