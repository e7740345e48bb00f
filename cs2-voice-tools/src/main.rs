use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use cs2_voice::{supported_formats, CancelToken, ExtractOptions, Extractor, SteamId};
use env_logger::Env;
use log::warn;

#[derive(Parser)]
#[command(version)]
/// Extracts per-player voice audio from CS2 demos
pub struct Args {
    #[arg(short, long, default_value = ".")]
    /// Directory the audio files are written to
    output_dir: PathBuf,
    #[arg(short, long)]
    /// Overwrite existing audio files
    force: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract voice data from a CS2 demo
    Extract {
        /// Path to the .dem file
        demo: PathBuf,
        #[arg(short, long)]
        /// Only these players, comma separated SteamID64s
        players: Option<String>,
        #[arg(short = 't', long, default_value = "wav")]
        /// Output audio format, see `formats`
        format: String,
    },
    /// List the supported output formats
    Formats,
}

fn parse_player_ids(filter: &str) -> anyhow::Result<Vec<SteamId>> {
    let mut ids = Vec::new();
    let mut invalid = Vec::new();
    for id in filter.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        match id.parse::<SteamId>() {
            Ok(id) => ids.push(id),
            Err(e) => {
                warn!("{e}, skipping");
                invalid.push(id);
            }
        }
    }
    if ids.is_empty() && !invalid.is_empty() {
        bail!("no valid SteamID64s provided, received: {}", invalid.join(", "));
    }
    Ok(ids)
}

fn main() -> anyhow::Result<()> {
    let env = Env::new().default_filter_or("info");
    env_logger::init_from_env(env);
    let args = Args::parse();
    let (demo, players, format) = match args.command {
        Command::Formats => {
            for format in supported_formats() {
                println!("{format}");
            }
            return Ok(());
        }
        Command::Extract {
            demo,
            players,
            format,
        } => (demo, players, format),
    };

    let player_ids = match players {
        Some(filter) => parse_player_ids(&filter)?,
        None => Vec::new(),
    };
    let format = format.to_lowercase();
    if !supported_formats().contains(&format.as_str()) {
        bail!(
            "unsupported format: {format} (supported formats: {})",
            supported_formats().join(", ")
        );
    }
    let output_dir = std::path::absolute(&args.output_dir)
        .with_context(|| format!("couldn't resolve {:?}", args.output_dir))?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).context("couldn't set the Ctrl-C handler")?;
    }

    let filtered = player_ids.len();
    let options = ExtractOptions {
        demo_path: demo,
        output_dir: output_dir.clone(),
        force_overwrite: args.force,
        player_ids,
        format: format.clone(),
    };
    let report = Extractor::new(options)
        .cancel(cancel)
        .run()
        .context("voice extraction failed")?;
    for player in report.failed() {
        warn!("no audio written for {} ({:?})", player.steam_id, player.path);
    }

    let mut msg = format!("Voice data extraction complete. Files saved to: {output_dir:?}");
    if filtered > 0 {
        msg += &format!(" (filtered to {filtered} players)");
    }
    if format != "wav" {
        msg += &format!(" (format: {format})");
    }
    println!("{msg}");
    Ok(())
}
