use std::path::PathBuf;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use frame_bus::config::DecodePolicy;
use frame_bus::frame::PixelFormat;
use frame_bus::sink::DeliveryPolicy;

use crate::config::{AppConfig, DeviceConfig};

const EXAMPLE: &str = "Example:\n  cam-relay 192.168.1.20 8554 /dev/video10";

pub fn command() -> Command {
    Command::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .after_help(EXAMPLE)
        .arg(
            Arg::new("host")
                .value_name("HOST")
                .help("Address of the phone streaming H.264")
                .required(true),
        )
        .arg(
            Arg::new("port")
                .value_name("PORT")
                .help("TCP port of the stream")
                .value_parser(value_parser!(u16).range(1..))
                .required(true),
        )
        .arg(
            Arg::new("device")
                .value_name("DEVICE")
                .help("Virtual camera device to write frames to, e.g. /dev/video10")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("width")
                .long("width")
                .value_name("PIXELS")
                .help("Virtual camera width [default: 1280]")
                .value_parser(value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("height")
                .long("height")
                .value_name("PIXELS")
                .help("Virtual camera height [default: 720]")
                .value_parser(value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("device-format")
                .long("device-format")
                .value_name("FORMAT")
                .help("Pixel format written to the virtual camera [default: rgb24]")
                .value_parser(["rgb24", "yuyv"]),
        )
        .arg(
            Arg::new("device-policy")
                .long("device-policy")
                .value_name("POLICY")
                .help("What to do when the camera falls behind [default: drop-oldest]")
                .value_parser(["block", "drop-oldest", "drop-newest"]),
        )
        .arg(
            Arg::new("preview-addr")
                .long("preview-addr")
                .value_name("ADDR")
                .help("Listen address of the MJPEG preview [default: 127.0.0.1:8080]"),
        )
        .arg(
            Arg::new("preview-quality")
                .long("preview-quality")
                .value_name("QUALITY")
                .help("JPEG quality of the preview, clamped to 10-100 [default: 60]")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("no-preview")
                .long("no-preview")
                .help("Do not serve the preview")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("queue-depth")
                .long("queue-depth")
                .value_name("FRAMES")
                .help("Per-sink queue depth [default: 4]")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("decode-policy")
                .long("decode-policy")
                .value_name("POLICY")
                .help("Reaction to a corrupt bitstream [default: resync]")
                .value_parser(["resync", "abort"]),
        )
        .arg(
            Arg::new("read-timeout-ms")
                .long("read-timeout-ms")
                .value_name("MS")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("connect-timeout-ms")
                .long("connect-timeout-ms")
                .value_name("MS")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("stall-timeout-ms")
                .long("stall-timeout-ms")
                .value_name("MS")
                .help("How long a blocking sink may stall the stream before it is dropped")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("JSON config file; command line options override it")
                .value_parser(value_parser!(PathBuf)),
        )
}

/// Builds the effective configuration: defaults, then the config file, then
/// the command line.
pub fn app_config(matches: &ArgMatches) -> anyhow::Result<AppConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    if let Some(host) = matches.get_one::<String>("host") {
        config.host = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.port = *port;
    }

    if let Some(path) = matches.get_one::<PathBuf>("device") {
        config.device.get_or_insert_with(DeviceConfig::default).path = path.clone();
    }
    if let Some(device) = config.device.as_mut() {
        if let Some(width) = matches.get_one::<u32>("width") {
            device.width = *width;
        }
        if let Some(height) = matches.get_one::<u32>("height") {
            device.height = *height;
        }
        if let Some(format) = matches.get_one::<String>("device-format") {
            device.format = match format.as_str() {
                "yuyv" => PixelFormat::Yuyv422,
                _ => PixelFormat::Rgb24,
            };
        }
        if let Some(policy) = matches.get_one::<String>("device-policy") {
            device.policy = policy.parse::<DeliveryPolicy>()?;
        }
    }

    if matches.get_flag("no-preview") {
        config.preview.enabled = false;
    }
    if let Some(addr) = matches.get_one::<String>("preview-addr") {
        config.preview.addr = addr.clone();
    }
    if let Some(quality) = matches.get_one::<u32>("preview-quality") {
        config.preview.set_quality(*quality);
    }

    let pipeline = &mut config.pipeline;
    if let Some(depth) = matches.get_one::<usize>("queue-depth") {
        pipeline.queue_depth = *depth;
    }
    if let Some(policy) = matches.get_one::<String>("decode-policy") {
        pipeline.decode_policy = policy.parse::<DecodePolicy>()?;
    }
    if let Some(ms) = matches.get_one::<u64>("read-timeout-ms") {
        pipeline.read_timeout_ms = *ms;
    }
    if let Some(ms) = matches.get_one::<u64>("connect-timeout-ms") {
        pipeline.connect_timeout_ms = *ms;
    }
    if let Some(ms) = matches.get_one::<u64>("stall-timeout-ms") {
        pipeline.stall_timeout_ms = *ms;
    }

    config.validate()?;
    Ok(config)
}
