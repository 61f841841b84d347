use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::warn;
use serde::{Deserialize, Serialize};

/// Per-device acquisition geometry, mirrored to the "DeviceConfig" scope.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceConfig {
    pub image_width: u16,
    pub image_height: u16,
    pub capture_type: u8,
    pub lane_seq: u8,
    pub channel_mode: u8,
    pub invert_pn: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            image_width: 1920,
            image_height: 1080,
            capture_type: 0x39,
            lane_seq: 0,
            channel_mode: 0,
            invert_pn: 0,
        }
    }
}

/// Persisted main settings ("FX3Tool / MainSettings" scope).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub video_width: Option<u16>,
    pub video_height: Option<u16>,
    pub video_format: Option<u8>,
    pub command_dir: Option<PathBuf>,
    pub device: DeviceConfig,
}

impl Settings {
    pub fn config_path() -> Option<PathBuf> {
        home::home_dir().map(|home| home.join(".fx3stream").join("settings.json"))
    }

    /// Load from the home directory, falling back to defaults when the file
    /// is missing or unreadable.
    pub fn load() -> Settings {
        let Some(path) = Self::config_path() else {
            warn!("home directory not available, using default settings");
            return Settings::default();
        };
        match Self::load_from(&path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("settings not loaded ({e:#}), using defaults");
                Settings::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Settings> {
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path().context("home directory not available")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = Settings {
            video_width: Some(2048),
            video_height: Some(2048),
            video_format: Some(0x3a),
            command_dir: Some(PathBuf::from("/opt/fx3/commands")),
            device: DeviceConfig {
                image_width: 2048,
                image_height: 2048,
                capture_type: 0x3a,
                lane_seq: 1,
                channel_mode: 2,
                invert_pn: 1,
            },
        };
        settings.save_to(&path).unwrap();

        assert_eq!(Settings::load_from(&path).unwrap(), settings);
    }

    #[test]
    fn missing_file_is_an_error_but_load_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Settings::load_from(&dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        fs::write(&path, br#"{"videoWidth": 640}"#).unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.video_width, Some(640));
        assert_eq!(settings.video_height, None);
        assert_eq!(settings.device, DeviceConfig::default());
    }
}
