use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UsbError {
    #[error("no FX3 device found (vid 0x{vid:04x} pid 0x{pid:04x})")]
    NoDevice { vid: u16, pid: u16 },
    #[error("device found but failed to open: {0}")]
    OpenFailed(#[source] rusb::Error),
    #[error("descriptor validation failed: {0}")]
    ValidationFailed(String),
    #[error("bulk endpoints missing on alt-interface 0")]
    EndpointsMissing,
    #[error("bulk transfer failed: {0}")]
    Transfer(#[source] rusb::Error),
    #[error("short command write: sent {sent} of {expected} bytes")]
    ShortCommandWrite { sent: usize, expected: usize },
    #[error("endpoint is not open")]
    NotOpen,
}

impl UsbError {
    /// The underlying libusb code, when there is one.
    pub fn last_error_code(&self) -> Option<rusb::Error> {
        match self {
            UsbError::OpenFailed(e) | UsbError::Transfer(e) => Some(*e),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("command template {name} missing in {dir}")]
    MissingTemplate { name: &'static str, dir: PathBuf },
    #[error("command template {name} is {size} bytes, expected exactly {expected}")]
    BadTemplateSize {
        name: &'static str,
        size: u64,
        expected: usize,
    },
    #[error("failed to read command template {name}: {source}")]
    Io {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("no command templates loaded")]
    NotLoaded,
}

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error(transparent)]
    Unpack(#[from] util::raw::UnpackError),
    #[error("unsupported pixel format code 0x{0:02x}")]
    UnsupportedFormat(u8),
    #[error("image encoding failed: {0}")]
    ImageEncode(String),
    #[error("csv encoding failed: {0}")]
    CsvEncode(String),
    #[error("empty packet")]
    EmptyPacket,
}

#[derive(Error, Debug)]
pub enum SaveError {
    #[error("saving is already running")]
    AlreadyRunning,
    #[error("saving is not running")]
    NotRunning,
    #[error("save path is not writable: {0}")]
    PathNotWritable(PathBuf),
    #[error("writer cannot be swapped while saving")]
    Busy,
    #[error("a range read is already in flight")]
    ReadInFlight,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
