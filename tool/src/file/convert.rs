use std::io::Cursor;
use std::sync::Arc;

use image::codecs::bmp::BmpEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::tiff::TiffEncoder;
use image::{ColorType, ImageEncoder};
use util::packet::{DataPacket, DataPacketBatch};
use util::PixelFormat;

use super::SaveParameters;
use crate::error::ConvertError;

/// Pure packet-to-bytes conversion. Implementations are side-effect free;
/// the file manager owns all I/O.
pub trait Converter: Send + Sync {
    fn convert(&self, packet: &DataPacket, params: &SaveParameters) -> Result<Vec<u8>, ConvertError>;

    fn convert_batch(
        &self,
        batch: &DataPacketBatch,
        params: &SaveParameters,
    ) -> Result<Vec<u8>, ConvertError> {
        let mut out = Vec::new();
        for packet in &batch.packets {
            out.extend_from_slice(&self.convert(packet, params)?);
        }
        Ok(out)
    }

    fn file_extension(&self) -> &'static str;
}

/// Identity passthrough; batches are concatenated without copies in between.
pub struct RawConverter;

impl Converter for RawConverter {
    fn convert(&self, packet: &DataPacket, _params: &SaveParameters) -> Result<Vec<u8>, ConvertError> {
        if packet.data.is_empty() {
            return Err(ConvertError::EmptyPacket);
        }
        Ok(packet.data.to_vec())
    }

    fn convert_batch(
        &self,
        batch: &DataPacketBatch,
        _params: &SaveParameters,
    ) -> Result<Vec<u8>, ConvertError> {
        let mut out = Vec::with_capacity(batch.total_bytes());
        for packet in &batch.packets {
            out.extend_from_slice(&packet.data);
        }
        Ok(out)
    }

    fn file_extension(&self) -> &'static str {
        "raw"
    }
}

fn gray_pixels(packet: &DataPacket, params: &SaveParameters) -> Result<Vec<u8>, ConvertError> {
    if packet.data.is_empty() {
        return Err(ConvertError::EmptyPacket);
    }
    let code = params.format_code();
    let format = PixelFormat::from_code(code).ok_or(ConvertError::UnsupportedFormat(code))?;
    Ok(util::raw::unpack(format, &packet.data, params.width(), params.height())?)
}

pub struct BmpConverter;

impl Converter for BmpConverter {
    fn convert(&self, packet: &DataPacket, params: &SaveParameters) -> Result<Vec<u8>, ConvertError> {
        let pixels = gray_pixels(packet, params)?;
        let mut out = Cursor::new(Vec::new());
        BmpEncoder::new(&mut out)
            .encode(
                &pixels,
                params.width() as u32,
                params.height() as u32,
                ColorType::L8,
            )
            .map_err(|e| ConvertError::ImageEncode(e.to_string()))?;
        Ok(out.into_inner())
    }

    fn file_extension(&self) -> &'static str {
        "bmp"
    }
}

pub struct TiffConverter;

impl Converter for TiffConverter {
    fn convert(&self, packet: &DataPacket, params: &SaveParameters) -> Result<Vec<u8>, ConvertError> {
        let pixels = gray_pixels(packet, params)?;
        let mut out = Cursor::new(Vec::new());
        TiffEncoder::new(&mut out)
            .write_image(
                &pixels,
                params.width() as u32,
                params.height() as u32,
                ColorType::L8,
            )
            .map_err(|e| ConvertError::ImageEncode(e.to_string()))?;
        Ok(out.into_inner())
    }

    fn file_extension(&self) -> &'static str {
        "tiff"
    }
}

pub struct PngConverter;

fn png_compression(level: u8) -> CompressionType {
    // The container only distinguishes three effort classes; the 0-9 knob
    // is clamped onto them.
    match level.min(9) {
        0..=2 => CompressionType::Fast,
        3..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

impl Converter for PngConverter {
    fn convert(&self, packet: &DataPacket, params: &SaveParameters) -> Result<Vec<u8>, ConvertError> {
        let pixels = gray_pixels(packet, params)?;
        let mut out = Vec::new();
        PngEncoder::new_with_quality(
            &mut out,
            png_compression(params.compression_level),
            FilterType::Adaptive,
        )
        .write_image(
            &pixels,
            params.width() as u32,
            params.height() as u32,
            ColorType::L8,
        )
        .map_err(|e| ConvertError::ImageEncode(e.to_string()))?;
        Ok(out)
    }

    fn file_extension(&self) -> &'static str {
        "png"
    }
}

/// Emits one CSV row of packet metadata per packet; the payload itself is
/// not representable in CSV and belongs in a RAW file.
pub struct CsvMetadataConverter;

const CSV_HEADER: [&str; 8] = [
    "Timestamp",
    "Size",
    "Width",
    "Height",
    "Format",
    "CaptureTime",
    "BatchId",
    "PacketInBatch",
];

fn format_timestamp(nanos: u64) -> String {
    chrono::DateTime::from_timestamp((nanos / 1_000_000_000) as i64, (nanos % 1_000_000_000) as u32)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

fn csv_row(
    writer: &mut csv::Writer<Vec<u8>>,
    packet: &DataPacket,
    params: &SaveParameters,
    capture_time: &str,
) -> Result<(), ConvertError> {
    writer
        .write_record([
            format_timestamp(packet.timestamp),
            packet.size().to_string(),
            params.width().to_string(),
            params.height().to_string(),
            format!("0x{:02x}", params.format_code()),
            capture_time.to_string(),
            packet.batch_id.to_string(),
            packet.packets_in_batch.to_string(),
        ])
        .map_err(|e| ConvertError::CsvEncode(e.to_string()))
}

fn csv_finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, ConvertError> {
    writer
        .into_inner()
        .map_err(|e| ConvertError::CsvEncode(e.to_string()))
}

impl Converter for CsvMetadataConverter {
    fn convert(&self, packet: &DataPacket, params: &SaveParameters) -> Result<Vec<u8>, ConvertError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(CSV_HEADER)
            .map_err(|e| ConvertError::CsvEncode(e.to_string()))?;
        let capture_time = chrono::Local::now().to_rfc3339();
        csv_row(&mut writer, packet, params, &capture_time)?;
        csv_finish(writer)
    }

    fn convert_batch(
        &self,
        batch: &DataPacketBatch,
        params: &SaveParameters,
    ) -> Result<Vec<u8>, ConvertError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(CSV_HEADER)
            .map_err(|e| ConvertError::CsvEncode(e.to_string()))?;
        let capture_time = chrono::Local::now().to_rfc3339();
        for packet in &batch.packets {
            csv_row(&mut writer, packet, params, &capture_time)?;
        }
        csv_finish(writer)
    }

    fn file_extension(&self) -> &'static str {
        "csv"
    }
}

/// The built-in converter set. `Custom` has no built-in; one must be
/// registered with the file manager.
pub fn builtin(format: super::FileFormat) -> Option<Arc<dyn Converter>> {
    use super::FileFormat::*;
    match format {
        Raw => Some(Arc::new(RawConverter)),
        Bmp => Some(Arc::new(BmpConverter)),
        Tiff => Some(Arc::new(TiffConverter)),
        Png => Some(Arc::new(PngConverter)),
        Csv => Some(Arc::new(CsvMetadataConverter)),
        Custom => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileFormat;

    fn params(width: u16, height: u16, code: u8) -> SaveParameters {
        let mut p = SaveParameters::default();
        p.options.insert("width".into(), serde_json::json!(width));
        p.options.insert("height".into(), serde_json::json!(height));
        p.options.insert("format".into(), serde_json::json!(code));
        p
    }

    fn packet(bytes: &[u8]) -> DataPacket {
        DataPacket::new(Arc::from(bytes.to_vec().into_boxed_slice()), 1, 1)
    }

    #[test]
    fn raw_is_identity() {
        let p = packet(&[1, 2, 3, 4]);
        let out = RawConverter.convert(&p, &params(2, 2, 0x38)).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[test]
    fn raw_batch_concatenates() {
        let batch = DataPacketBatch {
            batch_id: 1,
            packets: vec![packet(&[1, 2]), packet(&[3, 4, 5])],
        };
        let out = RawConverter.convert_batch(&batch, &params(1, 1, 0x38)).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn bmp_has_container_signature() {
        let frame = vec![128u8; 16];
        let out = BmpConverter.convert(&packet(&frame), &params(4, 4, 0x38)).unwrap();
        assert_eq!(&out[0..2], b"BM");
    }

    #[test]
    fn png_has_container_signature() {
        let frame = vec![10u8; 16];
        let out = PngConverter.convert(&packet(&frame), &params(4, 4, 0x38)).unwrap();
        assert_eq!(&out[0..4], &[0x89, b'P', b'N', b'G']);
    }

    #[test]
    fn tiff_has_container_signature() {
        let frame = vec![200u8; 16];
        let out = TiffConverter.convert(&packet(&frame), &params(4, 4, 0x38)).unwrap();
        assert!(&out[0..2] == b"II" || &out[0..2] == b"MM");
    }

    #[test]
    fn image_conversion_rejects_short_frames() {
        let err = BmpConverter
            .convert(&packet(&[0u8; 5]), &params(4, 4, 0x38))
            .unwrap_err();
        assert!(matches!(err, ConvertError::Unpack(_)));
    }

    #[test]
    fn raw10_frame_converts() {
        // 4x1 RAW10 frame: one 5-byte group.
        let out = BmpConverter
            .convert(&packet(&[0xab, 0xcd, 0xef, 0x12, 0x00]), &params(4, 1, 0x39))
            .unwrap();
        assert_eq!(&out[0..2], b"BM");
    }

    #[test]
    fn csv_batch_emits_row_per_packet() {
        let batch = DataPacketBatch {
            batch_id: 9,
            packets: vec![packet(&[0; 8]), packet(&[0; 8]), packet(&[0; 8])],
        };
        let out = CsvMetadataConverter
            .convert_batch(&batch, &params(4, 2, 0x38))
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.trim_end().lines().collect();
        assert_eq!(lines.len(), 4); // header + 3 rows
        assert!(lines[0].starts_with("Timestamp,"));
        assert!(lines[1].contains(",9,"));
    }

    #[test]
    fn builtin_covers_everything_but_custom() {
        for format in [
            FileFormat::Raw,
            FileFormat::Bmp,
            FileFormat::Tiff,
            FileFormat::Png,
            FileFormat::Csv,
        ] {
            assert!(builtin(format).is_some());
        }
        assert!(builtin(FileFormat::Custom).is_none());
    }

    #[test]
    fn compression_clamps_to_container_range() {
        assert!(matches!(png_compression(0), CompressionType::Fast));
        assert!(matches!(png_compression(5), CompressionType::Default));
        assert!(matches!(png_compression(9), CompressionType::Best));
        assert!(matches!(png_compression(200), CompressionType::Best));
    }
}
