//! Engine configuration
//!
//! Read once at engine start from `res_hook.toml` next to the payload. The
//! `[settings]` table also accepts the legacy INI spelling
//! (`[Settings]` / `Width=1280` / `Enabled=1`), which happens to be valid TOML.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::{info, warn};

use crate::address::StaticAddress;
use crate::error::ConfigError;
use crate::process::WaitPolicy;
use crate::scanner::ScanConfig;

pub const CONFIG_FILE: &str = "res_hook.toml";

/// Largest client dimension we accept
const MAX_DIMENSION: u32 = 16384;

/// Desired client resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResolutionTarget {
    #[serde(alias = "Width")]
    pub width: u32,
    #[serde(alias = "Height")]
    pub height: u32,
    #[serde(alias = "Enabled", deserialize_with = "bool_or_int")]
    pub enabled: bool,
}

impl Default for ResolutionTarget {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsBackend {
    #[default]
    D3d9,
    Ddraw,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TargetSection {
    pub exe: String,
    pub window_class: Option<String>,
    pub backend: GraphicsBackend,
    /// Link-time address of the width cell; height follows it
    pub width_address: Option<usize>,
    pub height_address: Option<usize>,
}

impl Default for TargetSection {
    fn default() -> Self {
        Self {
            exe: "Peggle.exe".to_string(),
            window_class: Some("PeggleClass".to_string()),
            backend: GraphicsBackend::D3d9,
            width_address: Some(0x0055_E034),
            height_address: Some(0x0055_E038),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScanSection {
    pub enabled: bool,
    /// Link-time addresses that held the cell in other builds
    pub known_addresses: Vec<usize>,
    /// Signature of the apply-settings function, e.g. `"55 8B EC ?? 8B 0D"`
    pub apply_signature: Option<String>,
    pub max_candidates: usize,
    pub settle_ms: u64,
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            enabled: true,
            known_addresses: Vec::new(),
            apply_signature: None,
            max_candidates: 4096,
            settle_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WindowSection {
    pub interval_ms: u64,
    pub attach_wait_ms: u64,
    pub attach_poll_ms: u64,
}

impl Default for WindowSection {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            attach_wait_ms: 10_000,
            attach_poll_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(alias = "Settings")]
    pub settings: ResolutionTarget,
    pub target: TargetSection,
    pub scan: ScanSection,
    pub window: WindowSection,
}

impl EngineConfig {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`. A missing file is the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load, falling back to defaults on any error
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to load config {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [("width", self.settings.width), ("height", self.settings.height)] {
            if value == 0 || value > MAX_DIMENSION {
                return Err(ConfigError::Invalid {
                    key,
                    message: format!("{value} is outside 1..={MAX_DIMENSION}"),
                });
            }
        }
        if self.scan.max_candidates == 0 {
            return Err(ConfigError::Invalid {
                key: "max_candidates",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            max_candidates: self.scan.max_candidates,
            settle: Duration::from_millis(self.scan.settle_ms),
        }
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            max_wait: Duration::from_millis(self.window.attach_wait_ms),
            poll: Duration::from_millis(self.window.attach_poll_ms),
            ..WaitPolicy::default()
        }
    }

    pub fn enforce_interval(&self) -> Duration {
        Duration::from_millis(self.window.interval_ms.max(1))
    }

    /// Width and height cells, when both are configured
    pub fn static_cells(&self) -> Option<(StaticAddress, StaticAddress)> {
        Some((
            StaticAddress::new(self.target.width_address?),
            StaticAddress::new(self.target.height_address?),
        ))
    }

    pub fn known_addresses(&self) -> impl Iterator<Item = StaticAddress> + '_ {
        self.scan.known_addresses.iter().copied().map(StaticAddress::new)
    }
}

fn bool_or_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::parse("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.settings.width, 1280);
        assert_eq!(config.settings.height, 720);
        assert!(config.settings.enabled);
        assert_eq!(config.target.exe, "Peggle.exe");
        assert_eq!(
            config.static_cells(),
            Some((StaticAddress::new(0x0055_E034), StaticAddress::new(0x0055_E038)))
        );
    }

    #[test]
    fn test_legacy_ini_spelling() {
        let config = EngineConfig::parse("[Settings]\nWidth=1920\nHeight=1080\nEnabled=0\n").unwrap();
        assert_eq!(
            config.settings,
            ResolutionTarget {
                width: 1920,
                height: 1080,
                enabled: false,
            }
        );
    }

    #[test]
    fn test_full_document() {
        let config = EngineConfig::parse(
            r#"
            [settings]
            width = 1600
            height = 900
            enabled = true

            [target]
            exe = "PeggleNights.exe"
            backend = "ddraw"
            width_address = 0x0056_0010

            [scan]
            known_addresses = [0x0055_E040, 0x0055_F000]
            apply_signature = "55 8B EC ?? 8B 0D"
            max_candidates = 64
            settle_ms = 20

            [window]
            interval_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.target.backend, GraphicsBackend::Ddraw);
        assert_eq!(config.target.window_class.as_deref(), Some("PeggleClass"));
        assert_eq!(config.scan_config().max_candidates, 64);
        assert_eq!(config.scan_config().settle, Duration::from_millis(20));
        assert_eq!(config.enforce_interval(), Duration::from_millis(250));
        assert_eq!(config.known_addresses().count(), 2);
        assert_eq!(
            config.static_cells().map(|(w, _)| w),
            Some(StaticAddress::new(0x0056_0010))
        );
    }

    #[test]
    fn test_rejects_bad_dimensions() {
        let err = EngineConfig::parse("[settings]\nwidth = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "width", .. }));

        let err = EngineConfig::parse("[settings]\nheight = 99999\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "height", .. }));
    }

    #[test]
    fn test_missing_and_malformed_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        assert_eq!(EngineConfig::load(&path).unwrap(), EngineConfig::default());

        fs::write(&path, "[settings\nwidth = ").unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(ConfigError::Parse(_))));
        assert_eq!(EngineConfig::load_or_default(&path), EngineConfig::default());

        fs::write(&path, "[settings]\nwidth = 800\nheight = 600\n").unwrap();
        assert_eq!(EngineConfig::load_or_default(&path).settings.width, 800);
    }
}
