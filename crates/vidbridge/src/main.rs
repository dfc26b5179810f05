//! vidbridge - transcode a file through a WebAssembly engine module.
//!
//! Usage:
//!     vidbridge --module ffmpeg.wasm clip.mov --format webm --video-codec vp9
//!     vidbridge --module ffmpeg.wasm clip.mov -o out.mp4 --resolution 720p

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::info;
use vidbridge::{BridgeConfig, TranscodeBridge, WasmEngine, WasmEngineConfig};
use vidbridge_core::options::{mime_type, output_file_name};
use vidbridge_core::TranscodeOptions;

#[derive(Parser, Debug)]
#[command(name = "vidbridge")]
#[command(about = "Transcode media through a WebAssembly engine module")]
#[command(version)]
struct Args {
    /// Input media file
    input: PathBuf,

    /// Output file (defaults to the input name with the new extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Engine module (.wasm)
    #[arg(short, long)]
    module: PathBuf,

    /// Bridge configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output container format
    #[arg(short, long, default_value = "mp4")]
    format: String,

    #[arg(long, default_value = "h264")]
    video_codec: String,

    #[arg(long, default_value = "aac")]
    audio_codec: String,

    /// Video bitrate, passed to the engine as given
    #[arg(long, default_value_t = 1_000_000)]
    video_bitrate: i32,

    /// Audio bitrate, passed to the engine as given
    #[arg(long, default_value_t = 128_000)]
    audio_bitrate: i32,

    /// same, WIDTHxHEIGHT, 360p, 480p, 720p or 1080p; passed to the engine as given
    #[arg(long, default_value = "same")]
    resolution: String,

    /// Log level filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn default_output(input: &Path, format: &str) -> PathBuf {
    let name = input.file_name().and_then(|n| n.to_str());
    input.with_file_name(output_file_name(name, format))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    vidbridge::logging::init_with_filter(&args.log_level);

    let config = match &args.config {
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig::default(),
    };
    let engine_config = WasmEngineConfig::new(&args.module);
    let bridge = TranscodeBridge::new(config, move || {
        WasmEngine::from_config(&engine_config)
            .map(|engine| Box::new(engine) as Box<dyn vidbridge_core::Engine>)
    });

    let _progress = bridge.set_progress_callback(|percent| eprint!("\rprogress: {percent:5.1}%"));
    let _logger = bridge.set_logger_callback(|line| tracing::debug!(engine = line));

    let input = tokio::fs::read(&args.input).await?;
    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&args.input, &args.format));
    let options = TranscodeOptions::new(&args.format)
        .video_codec(&args.video_codec)
        .audio_codec(&args.audio_codec)
        .bitrates(args.video_bitrate, args.audio_bitrate)
        .resolution(args.resolution.clone());

    info!(
        input = %args.input.display(),
        bytes = input.len(),
        "transcoding"
    );
    let output = bridge.transcode(input, options).await;
    eprintln!();
    let output = output?;

    tokio::fs::write(&output_path, &output).await?;
    info!(
        output = %output_path.display(),
        bytes = output.len(),
        mime = mime_type(&args.format),
        "done"
    );
    Ok(())
}
