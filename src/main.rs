use std::process::ExitCode;

use anyhow::Context;
use frame_bus::codec::Codec;
use frame_bus::pipeline::{Pipeline, PipelineReport};
use frame_bus::sink::{DeliveryPolicy, SinkRegistration};
use frame_bus::source::TcpSource;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::sink::{DeviceSink, PreviewSink, PreviewSurface};

mod api;
mod cli;
mod config;
mod sink;

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("frame_bus", log::LevelFilter::Info)
        .filter_module("cam_relay", log::LevelFilter::Info)
        .filter_module("hyper", log::LevelFilter::Warn)
        .parse_default_env()
        .init();
}

#[cfg(feature = "ffmpeg")]
fn open_codec() -> anyhow::Result<Box<dyn Codec>> {
    Ok(Box::new(frame_bus::codec::ffmpeg::FfmpegCodec::h264()?))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_codec() -> anyhow::Result<Box<dyn Codec>> {
    anyhow::bail!("built without an H.264 decoder, rebuild with `--features ffmpeg`")
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let matches = cli::command().get_matches();
    let config = match cli::app_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {:#}\n", e);
            let _ = cli::command().print_help();
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(report) if report.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> anyhow::Result<PipelineReport> {
    frame_bus::init()?;
    let codec = open_codec()?;

    let cancel = CancellationToken::new();
    let pipeline = Pipeline::new(config.pipeline.clone(), codec, cancel.clone());
    let handle = pipeline.handle();

    // the preview keeps serving /status until the pipeline has finished
    let server_cancel = CancellationToken::new();
    if config.preview.enabled {
        let surface = PreviewSurface::new(server_cancel.child_token());
        let state = api::AppState {
            surface: surface.clone(),
            pipeline: handle.clone(),
        };
        match api::start_preview_server(&config.preview.addr, state, server_cancel.clone()).await {
            Ok(_) => {
                let sink = PreviewSink::new(surface, config.preview.quality());
                pipeline.add_sink(
                    SinkRegistration::new(sink)
                        .policy(DeliveryPolicy::DropOldest)
                        .queue_depth(1),
                )?;
            }
            Err(e) => log::error!("continuing without preview: {:#}", e),
        }
    }

    if let Some(device) = &config.device {
        match DeviceSink::open(&device.path, device.width, device.height, device.format) {
            Ok(sink) => {
                pipeline.add_sink(SinkRegistration::new(sink).policy(device.policy))?;
            }
            Err(e) => log::error!("continuing without virtual device: {:#}", e),
        }
    }

    let addr = config.remote_addr();
    let connect_timeout = config.pipeline.connect_timeout();
    let read_timeout = config.pipeline.read_timeout();
    let mut task = tokio::task::spawn_blocking(move || {
        pipeline.run(|| TcpSource::connect(&addr, connect_timeout, read_timeout))
    });

    let report = loop {
        tokio::select! {
            res = &mut task => {
                break res.context("pipeline task")?;
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted, stopping");
                cancel.cancel();
            },
        }
    };
    server_cancel.cancel();

    log::info!(
        "received {} bytes in {:.1}s ({:.1} KiB/s), {} frames decoded, {} distributed",
        report.bytes_read,
        report.elapsed.as_secs_f64(),
        report.bandwidth_kib(),
        report.frames_decoded,
        report.frames_distributed
    );
    if report.resyncs > 0 {
        log::warn!("recovered from {} corrupt units", report.resyncs);
    }
    if !report.is_success() {
        log::error!("stream ended: {}", report.state);
    }
    Ok(report)
}
