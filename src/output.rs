use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use binrw::BinWriterExt;
use thiserror::Error;

use crate::timeline::DenseAudioBuffer;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Output file {0:?} already exists")]
    FileExists(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Binrw error: {0}")]
    BinRw(#[from] binrw::Error),
    #[error("{samples} samples are too long for a WAV file")]
    TooLong { samples: usize },
    #[error("ffmpeg error: {0}")]
    Ffmpeg(String),
}

pub trait FormatEncoder: Send + Sync {
    fn name(&self) -> &'static str;
    fn extension(&self) -> &'static str;
    /// `file` is open for writing at `path`
    fn encode(
        &self,
        buffer: &DenseAudioBuffer,
        file: &mut File,
        path: &Path,
    ) -> Result<(), EncodeError>;
}

#[binrw::binwrite]
#[bw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    #[bw(magic = b"RIFF")]
    pub filesize: u32,
    #[bw(magic = b"WAVEfmt ")]
    pub fmt_size: u32,
    pub audio_format: u16,
    pub channel_count: u16,
    pub sampling_rate: u32,
    pub bytes_per_second: u32,
    pub bytes_per_sample: u16,
    pub bits_per_sample: u16,
    #[bw(magic = b"data")]
    pub data_size: u32,
}

impl WavHeader {
    pub fn byte_len() -> u32 {
        44
    }

    /// 16 bit PCM
    pub fn new(channels: u16, sample_rate: u32, samples: usize) -> Result<Self, EncodeError> {
        let too_long = || EncodeError::TooLong { samples };
        let data_size = samples
            .checked_mul(2)
            .and_then(|size| u32::try_from(size).ok())
            .filter(|size| size.checked_add(Self::byte_len() - 8).is_some())
            .ok_or_else(too_long)?;
        let bytes_per_sample = channels * 2;
        Ok(Self {
            filesize: data_size + Self::byte_len() - 8,
            fmt_size: 16,
            audio_format: 1,
            channel_count: channels,
            sampling_rate: sample_rate,
            bytes_per_second: sample_rate * bytes_per_sample as u32,
            bytes_per_sample,
            bits_per_sample: 16,
            data_size,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WavEncoder;

impl FormatEncoder for WavEncoder {
    fn name(&self) -> &'static str {
        "wav"
    }

    fn extension(&self) -> &'static str {
        "wav"
    }

    fn encode(
        &self,
        buffer: &DenseAudioBuffer,
        file: &mut File,
        _path: &Path,
    ) -> Result<(), EncodeError> {
        let header = WavHeader::new(buffer.channels, buffer.sample_rate, buffer.samples.len())?;
        let mut out = BufWriter::new(file);
        out.write_le(&header)?;
        out.write_le(&buffer.samples)?;
        out.flush()?;
        Ok(())
    }
}

/// headerless s16le
#[derive(Debug, Default, Clone, Copy)]
pub struct PcmEncoder;

impl FormatEncoder for PcmEncoder {
    fn name(&self) -> &'static str {
        "pcm"
    }

    fn extension(&self) -> &'static str {
        "pcm"
    }

    fn encode(
        &self,
        buffer: &DenseAudioBuffer,
        file: &mut File,
        _path: &Path,
    ) -> Result<(), EncodeError> {
        let mut out = BufWriter::new(file);
        out.write_le(&buffer.samples)?;
        out.flush()?;
        Ok(())
    }
}

pub fn encoders() -> Vec<&'static dyn FormatEncoder> {
    #[allow(unused_mut)]
    let mut list: Vec<&'static dyn FormatEncoder> = vec![&WavEncoder, &PcmEncoder];
    #[cfg(feature = "ffmpeg")]
    list.extend(crate::ffmpeg::encoders());
    list
}

pub fn supported_formats() -> Vec<&'static str> {
    encoders().iter().map(|e| e.name()).collect()
}

pub fn encoder_for(name: &str) -> Option<&'static dyn FormatEncoder> {
    encoders().into_iter().find(|e| e.name() == name)
}

/// Encodes into a temporary file next to `dest` and moves it into place,
/// `dest` is never left half written.
pub fn write_output(
    encoder: &dyn FormatEncoder,
    buffer: &DenseAudioBuffer,
    dest: &Path,
    force_overwrite: bool,
) -> Result<(), EncodeError> {
    if !force_overwrite && dest.exists() {
        return Err(EncodeError::FileExists(dest.to_path_buf()));
    }
    let dir = match dest.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".cs2-voice-")
        .suffix(&format!(".{}", encoder.extension()))
        .tempfile_in(dir)?;
    let tmp_path = tmp.path().to_path_buf();
    encoder.encode(buffer, tmp.as_file_mut(), &tmp_path)?;
    tmp.as_file().sync_all()?;
    if force_overwrite {
        tmp.persist(dest).map_err(|e| e.error)?;
    } else {
        tmp.persist_noclobber(dest).map_err(|e| {
            if e.error.kind() == io::ErrorKind::AlreadyExists {
                EncodeError::FileExists(dest.to_path_buf())
            } else {
                e.error.into()
            }
        })?;
    }
    Ok(())
}
