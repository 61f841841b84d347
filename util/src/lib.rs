pub mod packet;
pub mod raw;
pub mod ring;
pub mod state;
pub mod stats;

use thiserror::Error;

pub const USB_VID: u16 = 0x04b4;
pub const USB_PID: u16 = 0x00f1;

pub const MAX_FRAME_DIMENSION: u16 = 4096;

/// Wire pixel formats as reported by the sensor front end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Raw8,
    Raw10,
    Raw12,
}

impl PixelFormat {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x38 => Some(PixelFormat::Raw8),
            0x39 => Some(PixelFormat::Raw10),
            0x3a => Some(PixelFormat::Raw12),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            PixelFormat::Raw8 => 0x38,
            PixelFormat::Raw10 => 0x39,
            PixelFormat::Raw12 => 0x3a,
        }
    }

    pub fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Raw8 => 8,
            PixelFormat::Raw10 => 10,
            PixelFormat::Raw12 => 12,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Raw8 => "RAW8",
            PixelFormat::Raw10 => "RAW10",
            PixelFormat::Raw12 => "RAW12",
        }
    }

    /// Packed byte count of one full frame on the wire.
    pub fn frame_bytes(self, width: u16, height: u16) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Raw8 => pixels,
            PixelFormat::Raw10 => pixels * 5 / 4,
            PixelFormat::Raw12 => pixels * 3 / 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquisitionParams {
    pub width: u16,
    pub height: u16,
    pub format: PixelFormat,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("invalid width {0}, must be 1..={MAX_FRAME_DIMENSION}")]
    Width(u16),
    #[error("invalid height {0}, must be 1..={MAX_FRAME_DIMENSION}")]
    Height(u16),
    #[error("unsupported pixel format code 0x{0:02x}")]
    Format(u8),
}

impl AcquisitionParams {
    pub fn new(width: u16, height: u16, format_code: u8) -> Result<Self, ParamError> {
        let format = PixelFormat::from_code(format_code).ok_or(ParamError::Format(format_code))?;
        let params = AcquisitionParams {
            width,
            height,
            format,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ParamError> {
        if self.width == 0 || self.width > MAX_FRAME_DIMENSION {
            return Err(ParamError::Width(self.width));
        }
        if self.height == 0 || self.height > MAX_FRAME_DIMENSION {
            return Err(ParamError::Height(self.height));
        }
        Ok(())
    }

    pub fn frame_bytes(&self) -> usize {
        self.format.frame_bytes(self.width, self.height)
    }
}
