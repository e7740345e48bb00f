use crate::{decoder::PcmBlock, player::SteamId};

/// Maps demo ticks to sample offsets on the shared output timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebase {
    pub start_tick: u32,
    pub end_tick: u32,
    pub tick_rate: u32,
    pub sample_rate: u32,
}

impl Timebase {
    pub fn new(start_tick: u32, end_tick: u32, tick_rate: u32, sample_rate: u32) -> Self {
        Self {
            start_tick,
            end_tick: end_tick.max(start_tick),
            tick_rate: tick_rate.max(1),
            sample_rate,
        }
    }

    /// ticks before the start map to 0
    pub fn sample_offset(&self, tick: u32) -> usize {
        let ticks = tick.saturating_sub(self.start_tick) as u64;
        (ticks * self.sample_rate as u64 / self.tick_rate as u64) as usize
    }

    pub fn total_samples(&self) -> usize {
        self.sample_offset(self.end_tick)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenseAudioBuffer {
    pub steam_id: SteamId,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl DenseAudioBuffer {
    pub fn silent(steam_id: SteamId, timebase: &Timebase) -> Self {
        Self {
            steam_id,
            sample_rate: timebase.sample_rate,
            channels: 1,
            samples: vec![0; timebase.total_samples()],
        }
    }
}

/// Places every block at the offset of its start tick. Where blocks overlap
/// the earlier one is cut off, anything outside the timeline is dropped.
pub fn pad_timeline(steam_id: SteamId, blocks: &[PcmBlock], timebase: &Timebase) -> DenseAudioBuffer {
    let mut out = DenseAudioBuffer::silent(steam_id, timebase);
    let total = out.samples.len();
    let mut order: Vec<&PcmBlock> = blocks.iter().collect();
    order.sort_by_key(|b| b.start_tick);
    for (i, block) in order.iter().enumerate() {
        let offset = timebase.sample_offset(block.start_tick);
        let limit = order
            .get(i + 1)
            .map(|next| timebase.sample_offset(next.start_tick))
            .unwrap_or(total)
            .min(total);
        if offset >= limit {
            continue;
        }
        let len = block.samples.len().min(limit - offset);
        out.samples[offset..offset + len].copy_from_slice(&block.samples[..len]);
    }
    out
}
