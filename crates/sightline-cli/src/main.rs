use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sightline_core::IdentityStore;
use sightline_engine::EngineConfig;
use sightline_hw::frame::is_dark_frame;
use sightline_hw::{Camera, Frame, FrameSource, V4l2Opener};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Fraction of near-black pixels above which a sampled frame counts as dark.
const DARK_FRAME_FRACTION: f32 = 0.95;
const SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "sightline", version, about = "Sightline live face recognition CLI")]
struct Cli {
    /// TOML config file (SIGHTLINE_* environment variables still apply)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List enrolled identities
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Remove an identity and all of its embeddings
    Remove {
        /// Identity name
        name: String,
    },
    /// Show configuration and gallery status
    Status,
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics
    Test {
        /// How long to sample frames
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::resolve(cli.config.as_deref()).context("failed to load config")?;
    tracing::debug!(
        camera = %config.camera_device,
        gallery = %config.gallery_path.display(),
        "config resolved"
    );

    match cli.command {
        Commands::List { json } => list(&config, json),
        Commands::Remove { name } => remove(&config, &name),
        Commands::Status => status(&config),
        Commands::Devices => {
            devices();
            Ok(())
        }
        Commands::Test { seconds } => camera_test(&config, Duration::from_secs(seconds)).await,
    }
}

fn list(config: &EngineConfig, json: bool) -> Result<()> {
    let gallery = IdentityStore::open(&config.gallery_path).snapshot();

    if json {
        let entries: Vec<_> = gallery
            .iter()
            .map(|(name, embeddings)| serde_json::json!({ "name": name, "embeddings": embeddings.len() }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if gallery.is_empty() {
        println!("No identities enrolled");
        return Ok(());
    }
    println!("{:<24} EMBEDDINGS", "NAME");
    for (name, embeddings) in gallery.iter() {
        println!("{name:<24} {}", embeddings.len());
    }
    Ok(())
}

fn remove(config: &EngineConfig, name: &str) -> Result<()> {
    let store = IdentityStore::open(&config.gallery_path);
    let removed = store
        .delete(name)
        .with_context(|| format!("failed to update {}", config.gallery_path.display()))?;
    if !removed {
        bail!("no identity named {name:?}");
    }
    println!("Removed {name}");
    Ok(())
}

fn status(config: &EngineConfig) -> Result<()> {
    let store = IdentityStore::open(&config.gallery_path);
    let status = serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "camera_device": config.camera_device,
        "resolution": [config.capture_width, config.capture_height],
        "gallery_path": config.gallery_path.display().to_string(),
        "identities": store.len(),
        "embeddings": store.embedding_count(),
        "confidence_threshold": config.confidence_threshold,
        "recognition_threshold": config.recognition_threshold,
        "detection_enabled": config.detection_enabled,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn devices() {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
        return;
    }
    for dev in devices {
        println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
    }
}

async fn camera_test(config: &EngineConfig, duration: Duration) -> Result<()> {
    println!(
        "Sampling {} for {}s...",
        config.camera_device,
        duration.as_secs()
    );

    let opener = V4l2Opener::new(
        config.camera_device.clone(),
        config.capture_width,
        config.capture_height,
    );
    let source = FrameSource::with_backoff(opener, config.backoff());
    source.start().context("failed to start frame source")?;

    let started = Instant::now();
    let mut samples = 0u32;
    let mut dark = 0u32;
    let mut brightness_sum = 0.0f32;
    let mut resolution = None;
    let mut last_sequence = None;

    while started.elapsed() < duration {
        tokio::time::sleep(SAMPLE_INTERVAL).await;
        let Some(frame) = source.get_frame() else {
            continue;
        };
        if last_sequence == Some(frame.sequence) {
            continue;
        }
        last_sequence = Some(frame.sequence);
        resolution = Some((frame.width(), frame.height()));
        samples += 1;
        brightness_sum += frame.avg_brightness();
        if is_dark_sample(&frame) {
            dark += 1;
        }
    }

    let stats = source.stats();
    source.stop();

    match resolution {
        Some((width, height)) => println!("Resolution:     {width}x{height}"),
        None => println!("Resolution:     (no frames)"),
    }
    println!("Frames captured: {}", stats.frames_captured);
    println!("Device opens:    {}", stats.opens);
    println!("Reconnects:      {}", stats.reconnects);
    if samples > 0 {
        println!("Avg brightness:  {:.1}", brightness_sum / samples as f32);
        println!("Dark samples:    {dark}/{samples}");
    }

    if stats.frames_captured == 0 {
        bail!("no frames captured from {}", config.camera_device);
    }
    Ok(())
}

fn is_dark_sample(frame: &Frame) -> bool {
    is_dark_frame(&frame.image, DARK_FRAME_FRACTION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_test_seconds() {
        let cli = Cli::try_parse_from(["sightline", "test", "--seconds", "2"]).unwrap();
        assert!(matches!(cli.command, Commands::Test { seconds: 2 }));
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_global_config() {
        let cli =
            Cli::try_parse_from(["sightline", "list", "--json", "--config", "/etc/sightline.toml"])
                .unwrap();
        assert!(matches!(cli.command, Commands::List { json: true }));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/sightline.toml")));
    }

    #[test]
    fn test_dark_sample_detection() {
        let black = Frame::new(RgbImage::new(16, 16), 1);
        assert!(is_dark_sample(&black));

        let lit = Frame::new(RgbImage::from_pixel(16, 16, Rgb([140, 140, 140])), 2);
        assert!(!is_dark_sample(&lit));
    }
}
