//! Passthrough configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassthroughConfig {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub bluetooth: BluetoothSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    #[serde(default = "GeneralSettings::default_log_level")]
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl GeneralSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// Adapter selection override
///
/// When both ids are set, only that exact device is used and its interface
/// class is not checked.
///
/// # Example Configuration
/// ```toml
/// [usb]
/// vendor_id = "0x057e"
/// product_id = "0x0305"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsbSettings {
    #[serde(default, with = "usb_id_serde", skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<u16>,
    #[serde(default, with = "usb_id_serde", skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,
}

/// Custom serde module for USB ids given as integers or "0x1234" strings
mod usb_id_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(u16),
        Text(String),
    }

    pub fn serialize<S>(id: &Option<u16>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match id {
            Some(id) => serializer.serialize_str(&format!("{:#06x}", id)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<RawId>::deserialize(deserializer)? {
            Some(RawId::Number(n)) => Ok(Some(n)),
            Some(RawId::Text(s)) => parse_id(&s).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }

    /// Parse "0x057e", "057e" or a decimal id
    pub fn parse_id(s: &str) -> Result<u16, String> {
        let s = s.trim();
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16),
            None if s.bytes().any(|b| b.is_ascii_alphabetic()) => u16::from_str_radix(s, 16),
            None => s.parse(),
        };
        parsed.map_err(|_| format!("Invalid USB id '{}'", s))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BluetoothSettings {
    /// Learned pairings, `aa:bb:cc:dd:ee:ff=<32 hex digits>` separated by commas
    #[serde(default)]
    pub link_keys: String,
    /// How long the sync button must be held to count as a long press
    #[serde(default = "BluetoothSettings::default_sync_button_hold_ms")]
    pub sync_button_hold_ms: u64,
    /// Timeout for interrupt and bulk transfers
    #[serde(default = "BluetoothSettings::default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    /// Timeout for control transfers and synchronous HCI commands
    #[serde(default = "BluetoothSettings::default_control_timeout_ms")]
    pub control_timeout_ms: u64,
}

impl Default for BluetoothSettings {
    fn default() -> Self {
        Self {
            link_keys: String::new(),
            sync_button_hold_ms: Self::default_sync_button_hold_ms(),
            transfer_timeout_ms: Self::default_transfer_timeout_ms(),
            control_timeout_ms: Self::default_control_timeout_ms(),
        }
    }
}

impl BluetoothSettings {
    fn default_sync_button_hold_ms() -> u64 {
        10_000
    }

    fn default_transfer_timeout_ms() -> u64 {
        200
    }

    fn default_control_timeout_ms() -> u64 {
        1000
    }

    pub fn sync_button_hold(&self) -> Duration {
        Duration::from_millis(self.sync_button_hold_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

impl PassthroughConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/bt-passthrough/config.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: PassthroughConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("bt-passthrough").join("config.toml")
        } else {
            PathBuf::from(".config/bt-passthrough/config.toml")
        }
    }

    /// Exact vendor/product override, when both are configured
    pub fn device_override(&self) -> Option<(u16, u16)> {
        self.usb.vendor_id.zip(self.usb.product_id)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.usb.vendor_id.is_some() != self.usb.product_id.is_some() {
            return Err(anyhow!(
                "USB override needs both vendor_id and product_id, or neither"
            ));
        }

        let bt = &self.bluetooth;
        if bt.transfer_timeout_ms == 0 || bt.control_timeout_ms == 0 {
            return Err(anyhow!("Transfer timeouts must be greater than 0"));
        }

        Ok(())
    }
}
