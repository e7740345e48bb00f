use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::{error, info, warn};
use rayon::prelude::*;
use thiserror::Error;

use crate::{
    cancel::CancelToken,
    decoder::{decode_track, default_provider, CodecProvider, DecodeError, PacketWarning},
    demo::{DemoError, DemoReader},
    output::{encoder_for, supported_formats, write_output, EncodeError, FormatEncoder},
    player::SteamId,
    timeline::{pad_timeline, Timebase},
    tracks::{PlayerTrack, TrackAssembler, TrackError},
    voice::VoicePackets,
};

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Unsupported output format {0:?}, supported are: {1}")]
    UnsupportedFormat(String, String),
    #[error("Demo {0:?} does not exist")]
    DemoNotFound(PathBuf),
    #[error("IO error on {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Error reading demo: {0}")]
    Demo(DemoError),
    #[error(transparent)]
    Tracks(#[from] TrackError),
    #[error("Extraction was cancelled")]
    Cancelled,
}

impl From<DemoError> for ExtractError {
    fn from(e: DemoError) -> Self {
        match e {
            DemoError::Cancelled => ExtractError::Cancelled,
            e => ExtractError::Demo(e),
        }
    }
}

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("Decoding failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("Writing output failed: {0}")]
    Encode(#[from] EncodeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOptions {
    pub demo_path: PathBuf,
    pub output_dir: PathBuf,
    pub force_overwrite: bool,
    /// empty means every player
    pub player_ids: Vec<SteamId>,
    pub format: String,
}

impl ExtractOptions {
    pub fn new<D: Into<PathBuf>, O: Into<PathBuf>>(demo_path: D, output_dir: O) -> Self {
        Self {
            demo_path: demo_path.into(),
            output_dir: output_dir.into(),
            force_overwrite: false,
            player_ids: Vec::new(),
            format: "wav".into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PlayerStats {
    pub packets: usize,
    pub gaps: usize,
    pub resets: usize,
    pub duplicates: usize,
    pub corrupt_packets: usize,
    pub warnings: Vec<PacketWarning>,
}

#[derive(Debug)]
pub struct PlayerResult {
    pub steam_id: SteamId,
    pub name: Option<String>,
    pub path: PathBuf,
    pub outcome: Result<PlayerStats, PlayerError>,
}

#[derive(Debug)]
pub struct ExtractReport {
    pub players: Vec<PlayerResult>,
    pub voice_frames: u64,
    pub dropped_unresolved: u64,
    pub discarded_filtered: u64,
    pub timebase: Timebase,
}

impl ExtractReport {
    pub fn written(&self) -> impl Iterator<Item = &PlayerResult> {
        self.players.iter().filter(|p| p.outcome.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &PlayerResult> {
        self.players.iter().filter(|p| p.outcome.is_err())
    }
}

/// Runs the whole pipeline: read the demo, split the voice by player,
/// then decode, pad and write every player in parallel.
pub struct Extractor<'a> {
    options: ExtractOptions,
    provider: Option<&'a dyn CodecProvider>,
    cancel: CancelToken,
}

impl<'a> Extractor<'a> {
    pub fn new(options: ExtractOptions) -> Self {
        Self {
            options,
            provider: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn codec(mut self, provider: &'a dyn CodecProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run(&self) -> Result<ExtractReport, ExtractError> {
        match self.provider {
            Some(provider) => self.run_with(provider),
            None => {
                let provider = default_provider();
                self.run_with(provider.as_ref())
            }
        }
    }

    fn check_demo(&self) -> Result<(), ExtractError> {
        let path = &self.options.demo_path;
        let io_error = |source| ExtractError::Io {
            path: path.clone(),
            source,
        };
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => Ok(()),
            Ok(_) => Err(io_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a file",
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ExtractError::DemoNotFound(path.clone()))
            }
            Err(e) => Err(io_error(e)),
        }
    }

    fn run_with(&self, provider: &dyn CodecProvider) -> Result<ExtractReport, ExtractError> {
        let options = &self.options;
        let encoder = encoder_for(&options.format).ok_or_else(|| {
            ExtractError::UnsupportedFormat(options.format.clone(), supported_formats().join(", "))
        })?;
        self.check_demo()?;
        fs::create_dir_all(&options.output_dir).map_err(|source| ExtractError::Io {
            path: options.output_dir.clone(),
            source,
        })?;

        let mut reader = DemoReader::open(&options.demo_path)?.with_cancel(self.cancel.clone());
        let mut assembler = TrackAssembler::new(options.player_ids.iter().copied());
        let mut packets = VoicePackets::new(&mut reader);
        for packet in packets.by_ref() {
            assembler.push(packet?);
        }
        let stats = packets.stats();
        let summary = reader.summary();
        let discarded_filtered = assembler.discarded();
        let tracks = assembler.finish(reader.players().known_players())?;
        drop(reader);

        let timebase = Timebase::new(
            summary.start_tick,
            summary.end_tick,
            summary.tick_rate,
            provider.sample_rate(),
        );
        info!(
            "{:?}: ticks {}..{} at {} tps, {} voice frames, {} tracks",
            options.demo_path,
            timebase.start_tick,
            timebase.end_tick,
            timebase.tick_rate,
            stats.voice_frames,
            tracks.len()
        );
        if stats.dropped_unresolved > 0 {
            warn!(
                "{} voice packets could not be attributed to a player",
                stats.dropped_unresolved
            );
        }

        let players: Vec<PlayerResult> = tracks
            .into_par_iter()
            .map(|track| self.process(track, provider, encoder, &timebase))
            .collect();
        if self.cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        for player in &players {
            match &player.outcome {
                Ok(stats) => {
                    for w in &stats.warnings {
                        warn!(
                            "{}: packet at tick {} (byte {}) replaced with silence: {}",
                            player.steam_id, w.tick, w.sequence, w.error
                        );
                    }
                }
                Err(e) => error!("{}: {e}", player.steam_id),
            }
        }
        let report = ExtractReport {
            players,
            voice_frames: stats.voice_frames,
            dropped_unresolved: stats.dropped_unresolved,
            discarded_filtered,
            timebase,
        };
        info!(
            "wrote {} of {} players to {:?}",
            report.written().count(),
            report.players.len(),
            options.output_dir
        );
        Ok(report)
    }

    fn process(
        &self,
        track: PlayerTrack,
        provider: &dyn CodecProvider,
        encoder: &dyn FormatEncoder,
        timebase: &Timebase,
    ) -> PlayerResult {
        let path = self
            .options
            .output_dir
            .join(format!("{}.{}", track.steam_id, encoder.extension()));
        let outcome = self.render(&track, provider, encoder, timebase, &path);
        PlayerResult {
            steam_id: track.steam_id,
            name: track.name,
            path,
            outcome,
        }
    }

    fn render(
        &self,
        track: &PlayerTrack,
        provider: &dyn CodecProvider,
        encoder: &dyn FormatEncoder,
        timebase: &Timebase,
        path: &Path,
    ) -> Result<PlayerStats, PlayerError> {
        // checked up front so a refused player costs no decoding
        if !self.options.force_overwrite && path.exists() {
            return Err(EncodeError::FileExists(path.to_path_buf()).into());
        }
        let decoded = decode_track(track, provider, &self.cancel)?;
        let buffer = pad_timeline(track.steam_id, &decoded.blocks, timebase);
        write_output(encoder, &buffer, path, self.options.force_overwrite)?;
        Ok(PlayerStats {
            packets: track.packets.len(),
            gaps: track.gaps,
            resets: decoded.resets,
            duplicates: track.duplicates,
            corrupt_packets: decoded.warnings.len(),
            warnings: decoded.warnings,
        })
    }
}

/// Extracts every selected player's voice with the default codec.
pub fn extract_voice_data(options: &ExtractOptions) -> Result<ExtractReport, ExtractError> {
    Extractor::new(options.clone()).run()
}
