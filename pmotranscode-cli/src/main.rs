//! `pmotranscode`: inspect profiles, run transcodes and manage the cache
//! from the command line, with the same configuration as the server.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use pmoconfig::Config;
use pmostream::{CountWriter, copy_range};
use pmotranscode::{
    PassthroughTranscoder, ProcessTranscoder, Profile, TranscodeConfigExt, TranscodeError, Transcoder,
    expected_output_size, resolve,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, Registry, prelude::*};

#[derive(Parser)]
#[command(name = "pmotranscode")]
#[command(about = "Transcode audio files with the PMOMusic profiles and cache")]
struct Cli {
    /// Configuration directory (default: $PMOMUSIC_CONFIG, ./.pmomusic, ~/.pmomusic)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the available profiles
    Profiles,

    /// Show the command line and cache key of a request
    Key {
        profile: String,
        file: PathBuf,
        /// Bitrate in kbit/s, overriding the profile default
        #[arg(long)]
        bitrate: Option<u32>,
        /// Start offset in seconds
        #[arg(long, default_value_t = 0.0)]
        seek: f64,
        /// Source duration in seconds, to print the expected output size
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Transcode a file to stdout or to a file
    Transcode {
        profile: String,
        file: PathBuf,
        /// Output file (stdout when absent)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Bitrate in kbit/s, overriding the profile default
        #[arg(long)]
        bitrate: Option<u32>,
        /// Start offset in seconds
        #[arg(long, default_value_t = 0.0)]
        seek: f64,
        /// Bytes of output to skip
        #[arg(long, default_value_t = 0)]
        start: u64,
        /// Bytes of output to write, zero padded (0 copies everything)
        #[arg(long, default_value_t = 0)]
        length: u64,
        /// Run the encoder without the cache
        #[arg(long)]
        no_cache: bool,
        /// Copy the source file unmodified
        #[arg(long)]
        raw: bool,
    },

    /// Run one cache eviction pass
    Eject,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_config(cli.config.as_deref().unwrap_or(""))?;
    init_tracing(&config);

    match cli.command {
        Command::Profiles => list_profiles(&config),
        Command::Key {
            profile,
            file,
            bitrate,
            seek,
            duration,
        } => {
            let profile = select_profile(&config, &profile, bitrate, seek)?;
            show_key(&profile, &file, duration)
        }
        Command::Transcode {
            profile,
            file,
            output,
            bitrate,
            seek,
            start,
            length,
            no_cache,
            raw,
        } => {
            let profile = select_profile(&config, &profile, bitrate, seek)?;
            let transcoder: Arc<dyn Transcoder> = if raw {
                Arc::new(PassthroughTranscoder::new())
            } else if no_cache {
                Arc::new(ProcessTranscoder::new())
            } else {
                config.create_caching_transcoder()?
            };
            transcode(transcoder, &profile, &file, output, start, length).await
        }
        Command::Eject => {
            let report = config.create_caching_transcoder()?.eject().await?;
            println!(
                "removed {} entries, freed {} bytes, {} bytes remaining",
                report.removed, report.freed_bytes, report.remaining_bytes
            );
            Ok(())
        }
    }
}

/// Logs go to stderr, keeping stdout for transcoded bytes. Setting
/// `host.logger.enable_console: false` silences them.
fn init_tracing(config: &Config) {
    let level = config
        .get_log_min_level()
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase();
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let enable_console = config.get_log_enable_console().unwrap_or(true);

    let console = enable_console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
    });
    let _ = Registry::default().with(env_filter).with(console).try_init();
}

fn list_profiles(config: &Config) -> Result<()> {
    let registry = config.create_profile_registry()?;
    for (name, profile) in registry.iter() {
        println!(
            "{:<14} {:<12} {:<5} {:>4}k",
            name,
            profile.mime(),
            profile.suffix(),
            profile.bitrate()
        );
    }
    Ok(())
}

fn select_profile(config: &Config, name: &str, bitrate: Option<u32>, seek: f64) -> Result<Profile> {
    let registry = config.create_profile_registry()?;
    let mut profile = registry
        .lookup(name)
        .ok_or_else(|| anyhow!("unknown profile {name:?}"))?;
    if let Some(bitrate) = bitrate {
        profile = profile.with_bitrate(bitrate);
    }
    let seek = Duration::try_from_secs_f64(seek).with_context(|| format!("invalid seek {seek}"))?;
    Ok(profile.with_seek(seek))
}

fn show_key(profile: &Profile, file: &std::path::Path, duration: Option<f64>) -> Result<()> {
    let command = resolve(profile, &std::path::absolute(file)?)?;
    println!("command: {command}");
    println!("key:     {}", command.cache_key());
    if let Some(secs) = duration {
        let duration = Duration::try_from_secs_f64(secs).with_context(|| format!("invalid duration {secs}"))?;
        println!("size:    <= {} bytes", expected_output_size(profile, duration));
    }
    Ok(())
}

async fn transcode(
    transcoder: Arc<dyn Transcoder>,
    profile: &Profile,
    file: &std::path::Path,
    output: Option<PathBuf>,
    start: u64,
    length: u64,
) -> Result<()> {
    let input = std::path::absolute(file)?;
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping transcode");
            on_interrupt.cancel();
        }
    });

    let mut stream = transcoder.transcode(profile, &input, cancel).await?;
    info!(origin = %stream.origin(), input = %input.display(), "Transcoding");

    let sink: Box<dyn AsyncWrite + Unpin + Send> = match &output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };
    let mut out = CountWriter::new(sink);

    let result = copy_range(&mut out, &mut stream, start, length).await;
    drop(stream);
    out.shutdown().await?;
    result.map_err(TranscodeError::from)?;

    info!(bytes = out.count(), "Transcode finished");
    Ok(())
}
