use thiserror::Error;

use crate::{cancel::CancelToken, tracks::PlayerTrack, voice::VoicePacket};

#[cfg(feature = "opus")]
use audiopus::{coder::Decoder as OpusDecoder, Channels, SampleRate};

pub const OPUS_SAMPLE_RATE: u32 = 48000;
// 120ms at 48kHz, the longest frame opus allows
const MAX_OPUS_FRAME_SAMPLES: usize = 5760;
const STEAM_ID_LEN: usize = 8;
const STEAM_CRC_LEN: usize = 4;
const STEAM_DEFAULT_RATE: u32 = 24000;
// longest stretch of audio a single packet may describe
const MAX_PACKET_SECONDS: u32 = 10;

/// payload types inside a Steam voice packet
mod steam {
    pub const SILENCE: u8 = 0;
    pub const OPUS_PLC: u8 = 6;
    pub const SAMPLE_RATE: u8 = 11;
    pub const RESET_CHUNK: u16 = 0xFFFF;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceFormat {
    Steam,
    Engine,
    Opus,
    Unknown(i32),
}

impl From<i32> for VoiceFormat {
    fn from(value: i32) -> Self {
        match value {
            0 => VoiceFormat::Steam,
            1 => VoiceFormat::Engine,
            2 => VoiceFormat::Opus,
            other => VoiceFormat::Unknown(other),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Opus error: {0}")]
    Opus(String),
    #[error("Corrupt voice payload: {0}")]
    Corrupt(String),
    #[error("Unsupported voice format {0:?}")]
    UnsupportedFormat(VoiceFormat),
    #[error("Unsupported Steam voice payload type {0}")]
    UnsupportedPayload(u8),
    #[error("No voice codec available: {0}")]
    Unavailable(&'static str),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Codec failure: {0}")]
    Codec(#[from] CodecError),
    #[error("Decoding was cancelled")]
    Cancelled,
}

/// One stateful decoder instance, fed the frames of a single player in order.
pub trait FrameCodec {
    /// appends the decoded mono samples of `frame` to `out`
    fn decode(&mut self, frame: &[u8], out: &mut Vec<i16>) -> Result<(), CodecError>;
    fn reset(&mut self) -> Result<(), CodecError>;
    /// how many samples `frame` would decode to, if that can be told without decoding
    fn expected_samples(&self, frame: &[u8]) -> Option<usize>;
}

pub trait CodecProvider: Sync {
    fn sample_rate(&self) -> u32;
    fn create(&self) -> Result<Box<dyn FrameCodec>, CodecError>;
}

/// Samples in an opus packet at `sample_rate`, from its TOC byte.
pub fn opus_packet_samples(packet: &[u8], sample_rate: u32) -> Option<usize> {
    let toc = *packet.first()?;
    let config = toc >> 3;
    // frame length in samples at 48kHz
    let frame_len = match config {
        0..=11 => [480, 960, 1920, 2880][(config % 4) as usize],
        12..=15 => [480, 960][(config % 2) as usize],
        _ => [120, 240, 480, 960][(config % 4) as usize],
    };
    let frames = match toc & 0x3 {
        0 => 1,
        1 | 2 => 2,
        _ => (*packet.get(1)? & 0x3F) as usize,
    };
    let total = frames * frame_len;
    if total > MAX_OPUS_FRAME_SAMPLES {
        return None;
    }
    Some(total * sample_rate as usize / OPUS_SAMPLE_RATE as usize)
}

#[cfg(feature = "opus")]
pub struct OpusCodec {
    decoder: OpusDecoder,
    scratch: Vec<i16>,
}

#[cfg(feature = "opus")]
impl OpusCodec {
    pub fn new() -> Result<Self, CodecError> {
        Ok(Self {
            decoder: Self::make_decoder()?,
            scratch: vec![0; MAX_OPUS_FRAME_SAMPLES],
        })
    }

    fn make_decoder() -> Result<OpusDecoder, CodecError> {
        OpusDecoder::new(SampleRate::Hz48000, Channels::Mono)
            .map_err(|e| CodecError::Opus(format!("{e:?}")))
    }
}

#[cfg(feature = "opus")]
impl FrameCodec for OpusCodec {
    fn decode(&mut self, frame: &[u8], out: &mut Vec<i16>) -> Result<(), CodecError> {
        let decoded = self
            .decoder
            .decode(Some(frame), &mut self.scratch, false)
            .map_err(|e| CodecError::Opus(format!("{e:?}")))?;
        out.extend_from_slice(&self.scratch[..decoded]);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        self.decoder = Self::make_decoder()?;
        Ok(())
    }

    fn expected_samples(&self, frame: &[u8]) -> Option<usize> {
        opus_packet_samples(frame, OPUS_SAMPLE_RATE)
    }
}

/// libopus, mono at 48kHz
#[cfg(feature = "opus")]
#[derive(Debug, Default, Clone, Copy)]
pub struct OpusCodecProvider;

#[cfg(feature = "opus")]
impl CodecProvider for OpusCodecProvider {
    fn sample_rate(&self) -> u32 {
        OPUS_SAMPLE_RATE
    }

    fn create(&self) -> Result<Box<dyn FrameCodec>, CodecError> {
        Ok(Box::new(OpusCodec::new()?))
    }
}

/// stands in when the crate is built without a voice codec
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableCodecProvider;

impl CodecProvider for UnavailableCodecProvider {
    fn sample_rate(&self) -> u32 {
        OPUS_SAMPLE_RATE
    }

    fn create(&self) -> Result<Box<dyn FrameCodec>, CodecError> {
        Err(CodecError::Unavailable("built without the opus feature"))
    }
}

pub fn default_provider() -> Box<dyn CodecProvider> {
    #[cfg(feature = "opus")]
    return Box::new(OpusCodecProvider);
    #[cfg(not(feature = "opus"))]
    return Box::new(UnavailableCodecProvider);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmBlock {
    pub start_tick: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketWarning {
    pub tick: u32,
    pub sequence: u64,
    pub error: CodecError,
}

#[derive(Debug, Default)]
pub struct DecodedTrack {
    pub blocks: Vec<PcmBlock>,
    pub warnings: Vec<PacketWarning>,
    pub resets: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit<'a> {
    Frame(&'a [u8]),
    Silence(usize),
    Reset,
}

fn split_opus<'a>(payload: &'a [u8], offsets: &[u32]) -> Result<Vec<Unit<'a>>, CodecError> {
    let mut units = Vec::with_capacity(offsets.len().max(1));
    let mut start = 0usize;
    for &end in offsets {
        let end = end as usize;
        if end < start || end > payload.len() {
            return Err(CodecError::Corrupt(format!(
                "frame offset {end} outside {start}..={}",
                payload.len()
            )));
        }
        if end > start {
            units.push(Unit::Frame(&payload[start..end]));
        }
        start = end;
    }
    if start < payload.len() {
        units.push(Unit::Frame(&payload[start..]));
    }
    Ok(units)
}

struct SteamCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SteamCursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos + len;
        let bytes = self.data.get(self.pos..end).ok_or_else(|| {
            CodecError::Corrupt(format!("Steam voice record overruns at byte {}", self.pos))
        })?;
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn done(&self) -> bool {
        self.pos >= self.data.len()
    }
}

fn max_packet_samples(sample_rate: u32) -> usize {
    sample_rate as usize * MAX_PACKET_SECONDS as usize
}

/// steamid, records, crc
fn split_steam(payload: &[u8], out_rate: u32) -> Result<Vec<Unit<'_>>, CodecError> {
    if payload.len() < STEAM_ID_LEN + STEAM_CRC_LEN {
        return Err(CodecError::Corrupt(format!(
            "Steam voice packet of {} bytes is too short",
            payload.len()
        )));
    }
    let mut cursor = SteamCursor {
        data: &payload[STEAM_ID_LEN..payload.len() - STEAM_CRC_LEN],
        pos: 0,
    };
    let mut units = Vec::new();
    let mut rate = STEAM_DEFAULT_RATE;
    let limit = max_packet_samples(out_rate) as u64;
    let mut silence = 0u64;
    while !cursor.done() {
        match cursor.u8()? {
            steam::SAMPLE_RATE => {
                rate = cursor.u16()?.max(1).into();
            }
            steam::OPUS_PLC => {
                let len = cursor.u16()? as usize;
                let mut chunks = SteamCursor {
                    data: cursor.take(len)?,
                    pos: 0,
                };
                while !chunks.done() {
                    let chunk_len = chunks.u16()?;
                    if chunk_len == steam::RESET_CHUNK {
                        units.push(Unit::Reset);
                        continue;
                    }
                    let _seq = chunks.u16()?;
                    units.push(Unit::Frame(chunks.take(chunk_len as usize)?));
                }
            }
            steam::SILENCE => {
                let samples = cursor.u16()? as u64;
                let count = samples * out_rate as u64 / rate as u64;
                silence += count;
                if silence > limit {
                    return Err(CodecError::Corrupt(format!(
                        "{samples} silent samples at {rate} Hz exceed {MAX_PACKET_SECONDS}s per packet"
                    )));
                }
                units.push(Unit::Silence(count as usize));
            }
            other => return Err(CodecError::UnsupportedPayload(other)),
        }
    }
    Ok(units)
}

/// Decoder state for one player's track.
pub struct VoiceDecoder {
    codec: Box<dyn FrameCodec>,
    sample_rate: u32,
}

impl VoiceDecoder {
    pub fn new(provider: &dyn CodecProvider) -> Result<Self, CodecError> {
        Ok(Self {
            codec: provider.create()?,
            sample_rate: provider.sample_rate(),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.codec.reset()
    }

    fn split<'p>(&self, packet: &'p VoicePacket) -> Result<Vec<Unit<'p>>, CodecError> {
        match packet.format {
            VoiceFormat::Opus => split_opus(&packet.payload, &packet.frame_offsets),
            VoiceFormat::Steam => split_steam(&packet.payload, self.sample_rate),
            other => Err(CodecError::UnsupportedFormat(other)),
        }
    }

    pub fn decode_packet(&mut self, packet: &VoicePacket) -> Result<PcmBlock, CodecError> {
        let units = self.split(packet)?;
        let mut samples = Vec::new();
        for unit in units {
            match unit {
                Unit::Frame(frame) => self.codec.decode(frame, &mut samples)?,
                Unit::Silence(count) => samples.resize(samples.len() + count, 0),
                Unit::Reset => self.codec.reset()?,
            }
        }
        Ok(self.block(packet.tick, samples))
    }

    /// what a packet that failed to decode is replaced with
    pub fn silence_for(&self, packet: &VoicePacket) -> PcmBlock {
        let fallback = (self.sample_rate / 50) as usize;
        let count = match self.split(packet) {
            Ok(units) if !units.is_empty() => units
                .iter()
                .map(|unit| match unit {
                    Unit::Frame(frame) => self.codec.expected_samples(frame).unwrap_or(fallback),
                    Unit::Silence(count) => *count,
                    Unit::Reset => 0,
                })
                .sum::<usize>()
                .min(max_packet_samples(self.sample_rate)),
            _ => fallback,
        };
        self.block(packet.tick, vec![0; count])
    }

    fn block(&self, start_tick: u32, samples: Vec<i16>) -> PcmBlock {
        PcmBlock {
            start_tick,
            sample_rate: self.sample_rate,
            channels: 1,
            samples,
        }
    }
}

/// Decodes all packets of a track in order, one block per packet.
pub fn decode_track(
    track: &PlayerTrack,
    provider: &dyn CodecProvider,
    cancel: &CancelToken,
) -> Result<DecodedTrack, DecodeError> {
    let mut decoder = VoiceDecoder::new(provider)?;
    let mut out = DecodedTrack {
        blocks: Vec::with_capacity(track.packets.len()),
        ..Default::default()
    };
    let mut prev: Option<&VoicePacket> = None;
    for packet in &track.packets {
        if cancel.is_cancelled() {
            return Err(DecodeError::Cancelled);
        }
        if prev.is_some_and(|prev| !packet.continues(prev)) {
            decoder.reset()?;
            out.resets += 1;
        }
        let block = match decoder.decode_packet(packet) {
            Ok(block) => block,
            Err(error) => {
                out.warnings.push(PacketWarning {
                    tick: packet.tick,
                    sequence: packet.sequence,
                    error,
                });
                decoder.silence_for(packet)
            }
        };
        out.blocks.push(block);
        prev = Some(packet);
    }
    Ok(out)
}
