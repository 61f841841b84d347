pub mod convert;
pub mod manager;
pub mod writer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

pub use convert::Converter;
pub use manager::FileManager;
pub use writer::{AsyncWriter, FileWriter, StdWriter};

pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_AUTO_SPLIT_SECS: u64 = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileFormat {
    Raw,
    Bmp,
    Tiff,
    Png,
    Csv,
    Custom,
}

impl FileFormat {
    pub fn as_int(self) -> u8 {
        match self {
            FileFormat::Raw => 0,
            FileFormat::Bmp => 1,
            FileFormat::Tiff => 2,
            FileFormat::Png => 3,
            FileFormat::Csv => 4,
            FileFormat::Custom => 5,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "raw" => Some(FileFormat::Raw),
            "bmp" => Some(FileFormat::Bmp),
            "tiff" | "tif" => Some(FileFormat::Tiff),
            "png" => Some(FileFormat::Png),
            "csv" => Some(FileFormat::Csv),
            "custom" => Some(FileFormat::Custom),
            _ => None,
        }
    }
}

/// Everything the save path needs to know, set before `start_saving`.
///
/// The free-form `options` map carries at least `width`, `height` and
/// `format` (the wire pixel format code) for the image converters, plus
/// the split limits.
#[derive(Clone, Debug)]
pub struct SaveParameters {
    pub base_path: PathBuf,
    pub format: FileFormat,
    pub auto_naming: bool,
    pub file_prefix: String,
    pub create_subfolder: bool,
    pub append_timestamp: bool,
    pub compression_level: u8,
    pub save_metadata: bool,
    pub options: HashMap<String, serde_json::Value>,
}

impl Default for SaveParameters {
    fn default() -> Self {
        let mut options = HashMap::new();
        options.insert("width".into(), serde_json::json!(1920));
        options.insert("height".into(), serde_json::json!(1080));
        options.insert("format".into(), serde_json::json!(0x39));
        options.insert("max_file_size".into(), serde_json::json!(DEFAULT_MAX_FILE_SIZE));
        options.insert("auto_split_time".into(), serde_json::json!(DEFAULT_AUTO_SPLIT_SECS));

        SaveParameters {
            base_path: PathBuf::from("."),
            format: FileFormat::Raw,
            auto_naming: true,
            file_prefix: "capture".into(),
            create_subfolder: false,
            append_timestamp: false,
            compression_level: 6,
            save_metadata: true,
            options,
        }
    }
}

impl SaveParameters {
    fn option_u64(&self, key: &str, default: u64) -> u64 {
        self.options.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
    }

    pub fn width(&self) -> u16 {
        self.option_u64("width", 1920) as u16
    }

    pub fn height(&self) -> u16 {
        self.option_u64("height", 1080) as u16
    }

    pub fn format_code(&self) -> u8 {
        self.option_u64("format", 0x39) as u8
    }

    pub fn max_file_size(&self) -> u64 {
        self.option_u64("max_file_size", DEFAULT_MAX_FILE_SIZE)
    }

    pub fn auto_split_secs(&self) -> u64 {
        self.option_u64("auto_split_time", DEFAULT_AUTO_SPLIT_SECS)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveStatus {
    Idle,
    Saving,
    Paused,
    Completed,
    Error,
}

#[derive(Clone, Debug)]
pub struct SaveStatistics {
    pub total_bytes: u64,
    pub file_count: u32,
    /// Smoothed write rate in MB/s (EWMA, alpha 0.3).
    pub save_rate_mbps: f64,
    pub current_file_bytes: u64,
    pub current_file_start: Option<Instant>,
    pub current_file_name: String,
    pub save_path: PathBuf,
    pub status: SaveStatus,
    pub last_error: Option<String>,
}

impl Default for SaveStatistics {
    fn default() -> Self {
        SaveStatistics {
            total_bytes: 0,
            file_count: 0,
            save_rate_mbps: 0.0,
            current_file_bytes: 0,
            current_file_start: None,
            current_file_name: String::new(),
            save_path: PathBuf::new(),
            status: SaveStatus::Idle,
            last_error: None,
        }
    }
}
