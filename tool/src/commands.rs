use std::fs;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use log::info;
use util::AcquisitionParams;

use crate::error::CommandError;
use crate::usb_endpoint::COMMAND_FRAME_LEN;

/// Byte offsets patched into a rendered command frame.
const OFFSET_WIDTH: usize = 80;
const OFFSET_HEIGHT: usize = 84;
const OFFSET_LANE_SEQ: usize = 88;
const OFFSET_CAPTURE_TYPE: usize = 92;
const OFFSET_CHANNEL_MODE: usize = 0x48;
const OFFSET_INVERT_PN: usize = 0x4c;

/// Sentinel pair that requests an all-zero frame.
const CHANNEL_SPECIAL: u8 = 0xfe;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Start,
    FrameSize,
    End,
}

impl CommandKind {
    pub const ALL: [CommandKind; 3] = [CommandKind::Start, CommandKind::FrameSize, CommandKind::End];

    pub fn file_name(self) -> &'static str {
        match self {
            CommandKind::Start => "CMD_START",
            CommandKind::FrameSize => "CMD_FRAME_SIZE",
            CommandKind::End => "CMD_END",
        }
    }

    fn index(self) -> usize {
        match self {
            CommandKind::Start => 0,
            CommandKind::FrameSize => 1,
            CommandKind::End => 2,
        }
    }
}

/// Runtime parameters overlaid onto a template at send time.
#[derive(Clone, Copy, Debug)]
pub struct RenderParams {
    pub acquisition: AcquisitionParams,
    pub lane_seq: u8,
    pub channel_mode: u8,
    pub invert_pn: u8,
}

impl RenderParams {
    pub fn new(acquisition: AcquisitionParams) -> Self {
        RenderParams {
            acquisition,
            lane_seq: 0,
            channel_mode: 0,
            invert_pn: 0,
        }
    }
}

/// Loads the three named command templates from a directory and renders
/// send-ready 512-byte frames from them.
pub struct CommandCodec {
    dir: PathBuf,
    templates: [Box<[u8; COMMAND_FRAME_LEN]>; 3],
}

fn load_template(dir: &Path, kind: CommandKind) -> Result<Box<[u8; COMMAND_FRAME_LEN]>, CommandError> {
    let path = dir.join(kind.file_name());
    if !path.is_file() {
        return Err(CommandError::MissingTemplate {
            name: kind.file_name(),
            dir: dir.to_path_buf(),
        });
    }

    let bytes = fs::read(&path).map_err(|source| CommandError::Io {
        name: kind.file_name(),
        source,
    })?;

    if bytes.len() != COMMAND_FRAME_LEN {
        return Err(CommandError::BadTemplateSize {
            name: kind.file_name(),
            size: bytes.len() as u64,
            expected: COMMAND_FRAME_LEN,
        });
    }

    let mut frame = Box::new([0u8; COMMAND_FRAME_LEN]);
    frame.copy_from_slice(&bytes);
    Ok(frame)
}

impl CommandCodec {
    /// Load all three templates; fails if any is missing or not exactly
    /// 512 bytes.
    pub fn load_from_dir(dir: &Path) -> Result<Self, CommandError> {
        let templates = [
            load_template(dir, CommandKind::Start)?,
            load_template(dir, CommandKind::FrameSize)?,
            load_template(dir, CommandKind::End)?,
        ];
        info!("loaded command templates from {}", dir.display());
        Ok(CommandCodec {
            dir: dir.to_path_buf(),
            templates,
        })
    }

    /// Check a directory without keeping the templates.
    pub fn validate(dir: &Path) -> Result<(), CommandError> {
        for kind in CommandKind::ALL {
            load_template(dir, kind)?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Render a send-ready frame: template bytes with the runtime
    /// parameters patched in at their fixed offsets.
    pub fn render(&self, kind: CommandKind, params: &RenderParams) -> Box<[u8; COMMAND_FRAME_LEN]> {
        let mut frame = self.templates[kind.index()].clone();

        if params.channel_mode == CHANNEL_SPECIAL && params.invert_pn == CHANNEL_SPECIAL {
            // Special channel case: the device expects an all-zero frame.
            frame.fill(0);
            return frame;
        }

        let acquisition = params.acquisition;
        let width_field =
            acquisition.width * 3 + u16::from(acquisition.format == util::PixelFormat::Raw10);

        BigEndian::write_u16(&mut frame[OFFSET_WIDTH..OFFSET_WIDTH + 2], width_field);
        BigEndian::write_u16(&mut frame[OFFSET_HEIGHT..OFFSET_HEIGHT + 2], acquisition.height);

        frame[OFFSET_LANE_SEQ] = params.lane_seq;
        frame[OFFSET_LANE_SEQ + 1] = params.lane_seq;
        frame[OFFSET_CAPTURE_TYPE] = acquisition.format.code();
        frame[OFFSET_CAPTURE_TYPE + 1] = acquisition.format.code();

        frame[OFFSET_CHANNEL_MODE] = (params.channel_mode << 4) | params.channel_mode;
        frame[OFFSET_INVERT_PN] = params.invert_pn;

        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use util::PixelFormat;

    fn template_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (i, kind) in CommandKind::ALL.iter().enumerate() {
            let frame = vec![i as u8 + 1; COMMAND_FRAME_LEN];
            fs::write(dir.path().join(kind.file_name()), frame).unwrap();
        }
        dir
    }

    fn render_params(width: u16, height: u16, code: u8) -> RenderParams {
        RenderParams::new(AcquisitionParams::new(width, height, code).unwrap())
    }

    #[test]
    fn validate_accepts_complete_directory() {
        let dir = template_dir();
        CommandCodec::validate(dir.path()).unwrap();
    }

    #[test]
    fn validate_rejects_missing_template() {
        let dir = template_dir();
        fs::remove_file(dir.path().join("CMD_END")).unwrap();
        let err = CommandCodec::validate(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            CommandError::MissingTemplate { name: "CMD_END", .. }
        ));
    }

    #[test]
    fn validate_rejects_wrong_size() {
        let dir = template_dir();
        fs::write(dir.path().join("CMD_START"), vec![0u8; 511]).unwrap();
        let err = CommandCodec::validate(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            CommandError::BadTemplateSize {
                name: "CMD_START",
                size: 511,
                ..
            }
        ));
    }

    #[test]
    fn render_patches_fixed_offsets() {
        let dir = template_dir();
        let codec = CommandCodec::load_from_dir(dir.path()).unwrap();
        let mut params = render_params(1920, 1080, 0x39);
        params.lane_seq = 0x0a;
        params.channel_mode = 0x03;
        params.invert_pn = 0x01;

        let frame = codec.render(CommandKind::FrameSize, &params);

        // width * 3 + 1 for RAW10, big-endian
        let width_field = 1920u16 * 3 + 1;
        assert_eq!(frame[80], (width_field >> 8) as u8);
        assert_eq!(frame[81], (width_field & 0xff) as u8);
        assert_eq!(frame[84], (1080u16 >> 8) as u8);
        assert_eq!(frame[85], (1080u16 & 0xff) as u8);
        assert_eq!(frame[88], 0x0a);
        assert_eq!(frame[89], 0x0a);
        assert_eq!(frame[92], 0x39);
        assert_eq!(frame[93], 0x39);
        assert_eq!(frame[0x48], 0x33);
        assert_eq!(frame[0x4c], 0x01);

        // Untouched bytes keep the template content.
        assert_eq!(frame[0], 2);
        assert_eq!(frame[511], 2);
    }

    #[rstest]
    #[case(0x38, 0)]
    #[case(0x39, 1)]
    #[case(0x3a, 0)]
    fn width_field_raw10_bias(#[case] code: u8, #[case] bias: u16) {
        let dir = template_dir();
        let codec = CommandCodec::load_from_dir(dir.path()).unwrap();
        let params = render_params(100, 100, code);
        let frame = codec.render(CommandKind::Start, &params);
        let expected = 100u16 * 3 + bias;
        assert_eq!(BigEndian::read_u16(&frame[80..82]), expected);
    }

    #[test]
    fn special_channel_pair_zero_fills() {
        let dir = template_dir();
        let codec = CommandCodec::load_from_dir(dir.path()).unwrap();
        let mut params = render_params(640, 480, 0x38);
        params.channel_mode = 0xfe;
        params.invert_pn = 0xfe;

        let frame = codec.render(CommandKind::Start, &params);
        assert!(frame.iter().all(|&b| b == 0));
    }

    #[test]
    fn format_matches_capture_type() {
        let dir = template_dir();
        let codec = CommandCodec::load_from_dir(dir.path()).unwrap();
        let frame = codec.render(CommandKind::Start, &render_params(64, 64, 0x3a));
        assert_eq!(frame[92], PixelFormat::Raw12.code());
    }
}
