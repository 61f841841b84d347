use thiserror::Error;

use crate::PixelFormat;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnpackError {
    #[error("insufficient data for {format}: need {needed} bytes, got {got}")]
    InsufficientData {
        format: &'static str,
        needed: usize,
        got: usize,
    },
}

/// Unpack a wire payload into one 8-bit grayscale pixel per byte,
/// row-major. Higher bit depths are downsampled by dropping LSBs.
pub fn unpack(
    format: PixelFormat,
    data: &[u8],
    width: u16,
    height: u16,
) -> Result<Vec<u8>, UnpackError> {
    match format {
        PixelFormat::Raw8 => unpack_raw8(data, width, height),
        PixelFormat::Raw10 => unpack_raw10(data, width, height),
        PixelFormat::Raw12 => unpack_raw12(data, width, height),
    }
}

pub fn unpack_raw8(data: &[u8], width: u16, height: u16) -> Result<Vec<u8>, UnpackError> {
    let needed = width as usize * height as usize;
    if data.len() < needed {
        return Err(UnpackError::InsufficientData {
            format: "RAW8",
            needed,
            got: data.len(),
        });
    }
    Ok(data[..needed].to_vec())
}

/// RAW10 packs 4 pixels into 5 bytes: bytes 0..3 carry the high 8 bits of
/// pixels 0..3, byte 4 carries the four 2-bit LSB pairs at bit positions
/// [1:0], [3:2], [5:4], [7:6].
pub fn unpack_raw10(data: &[u8], width: u16, height: u16) -> Result<Vec<u8>, UnpackError> {
    let pixels = width as usize * height as usize;
    let needed = pixels * 5 / 4;
    if data.len() < needed {
        return Err(UnpackError::InsufficientData {
            format: "RAW10",
            needed,
            got: data.len(),
        });
    }

    let mut out = Vec::with_capacity(pixels);
    for group in 0..pixels / 4 {
        let src = group * 5;
        let lsbs = data[src + 4];
        for i in 0..4 {
            let value = ((data[src + i] as u16) << 2) | ((lsbs >> (i * 2)) & 0x03) as u16;
            out.push((value >> 2) as u8);
        }
    }
    // A width that is not a multiple of 4 leaves a partial trailing group.
    let remainder = pixels % 4;
    if remainder != 0 {
        let src = (pixels / 4) * 5;
        let lsbs = *data.get(src + 4).unwrap_or(&0);
        for i in 0..remainder {
            let value = ((data[src + i] as u16) << 2) | ((lsbs >> (i * 2)) & 0x03) as u16;
            out.push((value >> 2) as u8);
        }
    }
    Ok(out)
}

/// RAW12 packs 2 pixels into 3 bytes: bytes 0 and 1 carry the high 8 bits,
/// byte 2 carries the 4-bit LSBs (high nibble pixel 0, low nibble pixel 1).
pub fn unpack_raw12(data: &[u8], width: u16, height: u16) -> Result<Vec<u8>, UnpackError> {
    let pixels = width as usize * height as usize;
    let needed = pixels * 3 / 2;
    if data.len() < needed {
        return Err(UnpackError::InsufficientData {
            format: "RAW12",
            needed,
            got: data.len(),
        });
    }

    let mut out = Vec::with_capacity(pixels);
    for pair in 0..pixels / 2 {
        let src = pair * 3;
        let lsbs = data[src + 2];
        let pixel0 = ((data[src] as u16) << 4) | ((lsbs >> 4) & 0x0f) as u16;
        let pixel1 = ((data[src + 1] as u16) << 4) | (lsbs & 0x0f) as u16;
        out.push((pixel0 >> 4) as u8);
        out.push((pixel1 >> 4) as u8);
    }
    if pixels % 2 != 0 {
        let src = (pixels / 2) * 3;
        let lsbs = *data.get(src + 2).unwrap_or(&0);
        let pixel = ((data[src] as u16) << 4) | ((lsbs >> 4) & 0x0f) as u16;
        out.push((pixel >> 4) as u8);
    }
    Ok(out)
}
