use std::{collections::VecDeque, io::Read};

use crate::{
    decoder::VoiceFormat,
    demo::{DemoError, DemoReader, FrameKind, VoiceMessage},
    player::{PlayerTable, SteamId},
};

const MAX_PENDING: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoicePacket {
    pub steam_id: SteamId,
    pub slot: i32,
    pub tick: u32,
    pub section: u32,
    /// byte offset of `payload` in the player's voice stream
    pub sequence: u64,
    pub format: VoiceFormat,
    pub payload: Vec<u8>,
    /// end offsets of the individual codec frames in `payload`
    pub frame_offsets: Vec<u32>,
}

impl VoicePacket {
    fn from_message(steam_id: SteamId, msg: VoiceMessage) -> Self {
        Self {
            steam_id,
            slot: msg.slot,
            tick: msg.tick,
            section: msg.audio.section_number,
            sequence: msg.audio.sequence_bytes.max(0) as u64,
            format: VoiceFormat::from(msg.audio.format),
            payload: msg.audio.voice_data,
            frame_offsets: msg.audio.packet_offsets,
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence + self.payload.len() as u64
    }

    /// `self` directly follows `prev` in the same section
    pub fn continues(&self, prev: &VoicePacket) -> bool {
        self.section == prev.section && self.sequence == prev.next_sequence()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractorStats {
    pub voice_frames: u64,
    pub dropped_unresolved: u64,
}

/// Voice packets of a demo, attributed to a player when they are read.
pub struct VoicePackets<'r, R> {
    reader: &'r mut DemoReader<R>,
    ready: VecDeque<VoicePacket>,
    pending: VecDeque<VoiceMessage>,
    stats: ExtractorStats,
    done: bool,
}

impl<'r, R: Read> VoicePackets<'r, R> {
    pub fn new(reader: &'r mut DemoReader<R>) -> Self {
        Self {
            reader,
            ready: VecDeque::new(),
            pending: VecDeque::new(),
            stats: ExtractorStats::default(),
            done: false,
        }
    }

    pub fn stats(&self) -> ExtractorStats {
        self.stats
    }

    fn resolve(table: &PlayerTable, msg: &VoiceMessage) -> Option<SteamId> {
        if msg.xuid != 0 {
            return Some(SteamId(msg.xuid));
        }
        u32::try_from(msg.slot)
            .ok()
            .and_then(|slot| table.resolve(slot))
            .map(|p| p.steam_id)
    }

    fn retry_pending(&mut self) {
        let table = self.reader.players();
        let mut still_pending = VecDeque::with_capacity(self.pending.len());
        for msg in self.pending.drain(..) {
            match Self::resolve(table, &msg) {
                Some(steam_id) => self.ready.push_back(VoicePacket::from_message(steam_id, msg)),
                None => still_pending.push_back(msg),
            }
        }
        self.pending = still_pending;
    }

    fn advance(&mut self) -> Result<(), DemoError> {
        let Some(frame) = self.reader.next_frame()? else {
            self.done = true;
            self.stats.dropped_unresolved += self.pending.len() as u64;
            self.pending.clear();
            return Ok(());
        };
        match frame.kind {
            FrameKind::Voice(msg) => {
                self.stats.voice_frames += 1;
                match Self::resolve(self.reader.players(), &msg) {
                    Some(steam_id) => {
                        self.ready.push_back(VoicePacket::from_message(steam_id, msg))
                    }
                    None => {
                        if self.pending.len() >= MAX_PENDING {
                            self.pending.pop_front();
                            self.stats.dropped_unresolved += 1;
                        }
                        self.pending.push_back(msg);
                    }
                }
            }
            FrameKind::PlayerInfo(_) if !self.pending.is_empty() => self.retry_pending(),
            _ => {}
        }
        Ok(())
    }
}

impl<R: Read> Iterator for VoicePackets<'_, R> {
    type Item = Result<VoicePacket, DemoError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(packet) = self.ready.pop_front() {
                return Some(Ok(packet));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.advance() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}
