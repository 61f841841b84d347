use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use fx3stream::commands::{CommandCodec, CommandKind, RenderParams};
use fx3stream::coordinator::ChannelConfig;
use fx3stream::file::{FileFormat, FileManager, SaveParameters};
use fx3stream::process::DataSink;
use fx3stream::settings::Settings;
use fx3stream::{DeviceCoordinator, Event, EventBus};
use log::info;
use pretty_hex::{HexConfig, PrettyHex};
use util::state::AppState;
use util::{AcquisitionParams, PixelFormat};

#[derive(Parser, Debug)]
#[command(author, about, long_about = None)]
struct Args {
    /// Directory containing CMD_START, CMD_FRAME_SIZE and CMD_END
    #[arg(short, long)]
    commands: Option<PathBuf>,

    /// Frame width in pixels
    #[arg(long)]
    width: Option<u16>,

    /// Frame height in pixels
    #[arg(long)]
    height: Option<u16>,

    /// Wire pixel format: raw8, raw10 or raw12
    #[arg(short, long)]
    format: Option<String>,

    /// Save captured data into this directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output file format: raw, bmp, tiff, png or csv
    #[arg(long, default_value = "raw")]
    save_format: String,

    /// File name prefix for saved captures
    #[arg(long, default_value = "capture")]
    prefix: String,

    /// Create a yyyy-mm-dd subfolder below the output directory
    #[arg(long)]
    subfolder: bool,

    /// Append a timestamp to each file name
    #[arg(long)]
    timestamp: bool,

    /// Container compression level 0-9
    #[arg(long, default_value_t = 6)]
    compression: u8,

    /// Split output files beyond this size in MiB
    #[arg(long)]
    max_file_mb: Option<u64>,

    /// Split output files beyond this duration in seconds
    #[arg(long)]
    split_secs: Option<u64>,

    /// Use the buffered synchronous writer instead of the async writer
    #[arg(long)]
    std_writer: bool,

    /// Print the rendered command frames and exit
    #[arg(long)]
    dump_commands: bool,

    /// List the supported save formats and exit
    #[arg(long)]
    list_formats: bool,

    /// Persist width/height/format/command directory as new defaults
    #[arg(long)]
    save_settings: bool,

    /// Stream a previously captured file back instead of the device
    #[arg(long)]
    replay: Option<PathBuf>,
}

fn parse_format(name: &str) -> anyhow::Result<PixelFormat> {
    match name.to_ascii_lowercase().as_str() {
        "raw8" | "0x38" => Ok(PixelFormat::Raw8),
        "raw10" | "0x39" => Ok(PixelFormat::Raw10),
        "raw12" | "0x3a" => Ok(PixelFormat::Raw12),
        other => bail!("unknown pixel format {other:?}, expected raw8, raw10 or raw12"),
    }
}

fn dump_commands(dir: &PathBuf, params: AcquisitionParams) -> anyhow::Result<()> {
    let codec = CommandCodec::load_from_dir(dir)?;
    let render = RenderParams::new(params);

    let cfg = HexConfig {
        title: false,
        ascii: false,
        width: 16,
        group: 4,
        ..HexConfig::default()
    };

    for kind in CommandKind::ALL {
        let frame = codec.render(kind, &render);
        println!("--- {} ---", kind.file_name());
        println!("{:?}", frame.hex_conf(cfg));
    }
    Ok(())
}

fn replay(manager: &FileManager, path: &PathBuf) -> anyhow::Result<()> {
    manager
        .start_loading(path)
        .with_context(|| format!("loading {}", path.display()))?;

    let mut packets = 0u64;
    let mut bytes = 0u64;
    loop {
        while let Some(packet) = manager.next_packet() {
            packets += 1;
            bytes += packet.size() as u64;
        }
        if !manager.has_more_packets() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    println!("{}: {packets} packets, {bytes} bytes", path.display());
    Ok(())
}

fn save_parameters(args: &Args, params: AcquisitionParams) -> anyhow::Result<SaveParameters> {
    let format = FileFormat::parse(&args.save_format)
        .with_context(|| format!("unknown save format {:?}", args.save_format))?;

    let mut save = SaveParameters {
        base_path: args.output.clone().unwrap_or_else(|| PathBuf::from(".")),
        format,
        auto_naming: true,
        file_prefix: args.prefix.clone(),
        create_subfolder: args.subfolder,
        append_timestamp: args.timestamp,
        compression_level: args.compression.min(9),
        save_metadata: true,
        ..SaveParameters::default()
    };

    save.options.insert("width".into(), params.width.into());
    save.options.insert("height".into(), params.height.into());
    save.options.insert("format".into(), params.format.code().into());
    if let Some(mb) = args.max_file_mb {
        save.options
            .insert("max_file_size".into(), (mb * 1024 * 1024).into());
    }
    if let Some(secs) = args.split_secs {
        save.options.insert("auto_split_time".into(), secs.into());
    }
    Ok(save)
}

fn subscribe_status(events: &EventBus) {
    events.subscribe(Arc::new(|event| match event {
        Event::StateChanged { old, new, reason } => {
            println!("state: {old} -> {new} ({reason})");
        }
        Event::StatsUpdated {
            total_bytes,
            rate_mbps,
            elapsed_ms,
        } => {
            println!(
                "acquired {:.1} MiB at {rate_mbps:.1} MB/s ({:.1} s)",
                *total_bytes as f64 / (1024.0 * 1024.0),
                *elapsed_ms as f64 / 1000.0
            );
        }
        Event::SaveProgressUpdated(stats) => {
            println!(
                "saved {:.1} MiB into {} file(s) at {:.1} MB/s",
                stats.total_bytes as f64 / (1024.0 * 1024.0),
                stats.file_count,
                stats.save_rate_mbps
            );
        }
        Event::SaveCompleted { path, total_bytes } => {
            println!("save completed: {} bytes under {}", total_bytes, path.display());
        }
        Event::AcquisitionError(message) | Event::SaveError(message) | Event::LoadError(message) => {
            eprintln!("error: {message}");
        }
        _ => {}
    }));
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let settings = Settings::load();

    let width = args
        .width
        .or(settings.video_width)
        .unwrap_or(settings.device.image_width);
    let height = args
        .height
        .or(settings.video_height)
        .unwrap_or(settings.device.image_height);
    let format = match &args.format {
        Some(name) => parse_format(name)?,
        None => PixelFormat::from_code(
            settings.video_format.unwrap_or(settings.device.capture_type),
        )
        .unwrap_or(PixelFormat::Raw10),
    };
    let params = AcquisitionParams::new(width, height, format.code())
        .map_err(|e| anyhow::anyhow!("invalid acquisition parameters: {e}"))?;

    let command_dir = args.commands.clone().or(settings.command_dir.clone());

    if args.save_settings {
        let updated = Settings {
            video_width: Some(width),
            video_height: Some(height),
            video_format: Some(format.code()),
            command_dir: command_dir.clone(),
            device: settings.device,
        };
        updated.save()?;
        info!("settings saved");
    }

    let events = EventBus::new();
    let manager = FileManager::new(events.clone());

    if args.list_formats {
        println!("supported save formats: {}", manager.supported_formats().join(", "));
        events.shutdown();
        return Ok(());
    }

    if args.dump_commands {
        let dir = command_dir.context("--dump-commands needs a command directory")?;
        let result = dump_commands(&dir, params);
        events.shutdown();
        return result;
    }

    if let Some(path) = &args.replay {
        subscribe_status(&events);
        let result = replay(&manager, path);
        events.shutdown();
        return result;
    }

    // Live capture path from here on.
    let command_dir = command_dir.context("a command directory is required, pass --commands")?;

    subscribe_status(&events);

    let coordinator = DeviceCoordinator::new(events.clone());
    coordinator.set_channel_config(ChannelConfig {
        lane_seq: settings.device.lane_seq,
        channel_mode: settings.device.channel_mode,
        invert_pn: settings.device.invert_pn,
    });
    let saving = args.output.is_some();
    if saving {
        manager.set_save_parameters(save_parameters(&args, params)?);
        manager
            .set_use_async_writer(!args.std_writer)
            .expect("writer swap before start");
        coordinator.add_sink(Arc::clone(&manager) as Arc<dyn DataSink>);
    }

    coordinator.on_device_arrival();
    if coordinator.state() == AppState::DeviceError {
        bail!("unable to open the FX3 device");
    }

    coordinator
        .load_commands(&command_dir)
        .context("loading command templates")?;

    if saving {
        manager.start_saving()?;
    }

    coordinator
        .start_transfer(params.width, params.height, params.format.code())
        .context("starting transfer")?;
    println!(
        "transferring {}x{} {} (ctrl-c to stop)",
        params.width,
        params.height,
        params.format.name()
    );

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::Release);
        })
        .context("installing ctrl-c handler")?;
    }

    while !interrupted.load(Ordering::Acquire) {
        if !coordinator.is_running() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    if coordinator.is_running() {
        coordinator.stop_transfer()?;
    }
    if saving && manager.is_saving() {
        let stats = manager.stop_saving()?;
        println!(
            "capture finished: {} bytes in {} file(s)",
            stats.total_bytes, stats.file_count
        );
    }

    let failed = coordinator.state() == AppState::DeviceError;
    coordinator.prepare_for_shutdown();
    events.shutdown();

    if failed {
        bail!("transfer ended with a device error");
    }
    Ok(())
}
