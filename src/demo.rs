use std::{
    collections::VecDeque,
    fs::File,
    io::{self, BufReader, Read},
    path::Path,
};

use binrw::{io::NoSeek, BinReaderExt};
use prost::Message;
use thiserror::Error;

use crate::{
    bits::{BitError, BitReader},
    cancel::CancelToken,
    player::{PlayerIdentity, PlayerTable, SteamId},
    stringtable::{StringTableEntry, StringTableError, StringTables, USERINFO_TABLE},
    structs::{
        command, svc, DemoFileHeader, DemoFileInfo, DemoFullPacket, DemoHeader, DemoPacket,
        DemoStringTables, PlayerInfo, SvcCreateStringTable, SvcServerInfo, SvcUpdateStringTable,
        SvcVoiceData, VoiceAudio, CSGO_MAGIC, DEMO_MAGIC, SOURCE2_V1_MAGIC,
    },
};

pub const DEFAULT_TICK_RATE: u32 = 64;
// ticks of frames written before the game starts
const SIGNON_TICK: u32 = u32::MAX;
const MAX_FRAME_SIZE: u64 = 256 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum DemoError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed demo at offset {offset}: {reason}")]
    Malformed { offset: u64, reason: String },
    #[error("Demo ends in the middle of a frame at offset {offset}")]
    Truncated { offset: u64 },
    #[error("Unsupported demo version: {0}")]
    UnsupportedVersion(String),
    #[error("Reading the demo was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoiceMessage {
    pub slot: i32,
    /// account id sent along with the voice, 0 if the server left it out
    pub xuid: u64,
    pub tick: u32,
    pub audio: VoiceAudio,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlayerUpdate {
    /// snapshots replace the whole table
    pub replace_all: bool,
    pub slots: Vec<(u32, Option<PlayerIdentity>)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameKind {
    Voice(VoiceMessage),
    PlayerInfo(PlayerUpdate),
    ServerInfo { tick_rate: u32 },
    Generic(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DemoFrame {
    pub tick: u32,
    pub kind: FrameKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemoSummary {
    pub start_tick: u32,
    pub end_tick: u32,
    pub tick_rate: u32,
    pub frames: u64,
}

/// Forward-only reader over a CS2 demo. Frames are parsed lazily, the
/// player table reflects exactly the frames returned so far.
pub struct DemoReader<R> {
    reader: R,
    offset: u64,
    queue: VecDeque<DemoFrame>,
    players: PlayerTable,
    tables: StringTables,
    cancel: Option<CancelToken>,
    finished: bool,
    start_tick: Option<u32>,
    end_tick: u32,
    tick_rate: u32,
    frames: u64,
}

impl DemoReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DemoError> {
        let f = File::open(path)?;
        Self::new(BufReader::new(f))
    }
}

impl<R: Read> DemoReader<R> {
    pub fn new(mut reader: R) -> Result<Self, DemoError> {
        let header: DemoHeader = match NoSeek::new(&mut reader).read_le() {
            Ok(header) => header,
            Err(binrw::Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(DemoError::Malformed {
                    offset: 0,
                    reason: "file is shorter than the demo header".into(),
                })
            }
            Err(binrw::Error::Io(e)) => return Err(e.into()),
            Err(e) => {
                return Err(DemoError::Malformed {
                    offset: 0,
                    reason: e.to_string(),
                })
            }
        };
        match &header.magic {
            m if m == DEMO_MAGIC => {}
            m if m == CSGO_MAGIC || m == SOURCE2_V1_MAGIC => {
                return Err(DemoError::UnsupportedVersion(
                    String::from_utf8_lossy(&m[..7]).into_owned(),
                ))
            }
            m => {
                return Err(DemoError::Malformed {
                    offset: 0,
                    reason: format!("unknown magic {m:02x?}"),
                })
            }
        }
        Ok(Self {
            reader,
            offset: DemoHeader::byte_len().into(),
            queue: VecDeque::new(),
            players: PlayerTable::default(),
            tables: StringTables::default(),
            cancel: None,
            finished: false,
            start_tick: None,
            end_tick: 0,
            tick_rate: DEFAULT_TICK_RATE,
            frames: 0,
        })
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn resolve_player(&self, slot: u32) -> Option<&PlayerIdentity> {
        self.players.resolve(slot)
    }

    pub fn players(&self) -> &PlayerTable {
        &self.players
    }

    pub fn known_players(&self) -> impl Iterator<Item = (&SteamId, &PlayerIdentity)> {
        self.players.known_players().iter()
    }

    /// tick bounds and rate of everything read so far
    pub fn summary(&self) -> DemoSummary {
        let start_tick = self.start_tick.unwrap_or(0);
        DemoSummary {
            start_tick,
            end_tick: self.end_tick.max(start_tick),
            tick_rate: self.tick_rate,
            frames: self.frames,
        }
    }

    pub fn next_frame(&mut self) -> Result<Option<DemoFrame>, DemoError> {
        loop {
            if let Some(frame) = self.queue.pop_front() {
                self.apply(&frame);
                return Ok(Some(frame));
            }
            if self.finished {
                return Ok(None);
            }
            if let Err(e) = self.read_container_frame() {
                self.finished = true;
                return Err(e);
            }
        }
    }

    fn apply(&mut self, frame: &DemoFrame) {
        match &frame.kind {
            FrameKind::PlayerInfo(update) => {
                if update.replace_all {
                    self.players.clear();
                }
                for (slot, identity) in &update.slots {
                    self.players.set(*slot, identity.clone());
                }
            }
            FrameKind::ServerInfo { tick_rate } => self.tick_rate = *tick_rate,
            _ => {}
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> DemoError {
        DemoError::Malformed {
            offset: self.offset,
            reason: reason.into(),
        }
    }

    /// `Ok(None)` only for a clean EOF before the first byte when `at_frame_start`
    fn read_varint(&mut self, at_frame_start: bool) -> Result<Option<u32>, DemoError> {
        let mut result = 0u32;
        for i in 0..5 {
            let mut byte = [0u8];
            match self.reader.read_exact(&mut byte) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    if at_frame_start && i == 0 {
                        return Ok(None);
                    }
                    return Err(DemoError::Truncated {
                        offset: self.offset,
                    });
                }
                Err(e) => return Err(e.into()),
            }
            self.offset += 1;
            result |= ((byte[0] & 0x7F) as u32) << (7 * i);
            if byte[0] & 0x80 == 0 {
                return Ok(Some(result));
            }
        }
        Err(self.malformed("varint longer than 5 bytes"))
    }

    fn read_container_frame(&mut self) -> Result<(), DemoError> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(DemoError::Cancelled);
        }
        let Some(raw_command) = self.read_varint(true)? else {
            self.finished = true;
            return Ok(());
        };
        let raw_tick = self.read_varint(false)?.unwrap_or_default();
        let size = self.read_varint(false)?.unwrap_or_default() as u64;
        if size > MAX_FRAME_SIZE {
            return Err(self.malformed(format!("frame size {size} is implausible")));
        }
        let mut payload = Vec::new();
        let read = (&mut self.reader).take(size).read_to_end(&mut payload)?;
        self.offset += read as u64;
        if (read as u64) < size {
            return Err(DemoError::Truncated {
                offset: self.offset,
            });
        }
        self.frames += 1;

        let cmd = raw_command & !command::IS_COMPRESSED;
        if raw_command & command::IS_COMPRESSED != 0 {
            payload = snap::raw::Decoder::new()
                .decompress_vec(&payload)
                .map_err(|e| self.malformed(format!("snappy: {e}")))?;
        }
        let tick = if raw_tick == SIGNON_TICK {
            0
        } else {
            self.start_tick.get_or_insert(raw_tick);
            self.end_tick = self.end_tick.max(raw_tick);
            raw_tick
        };

        match cmd {
            command::STOP => {
                self.finished = true;
            }
            command::FILE_HEADER => {
                let header: DemoFileHeader = self.decode(&payload)?;
                if !header.demo_file_stamp.starts_with("PBDEMS") {
                    return Err(DemoError::UnsupportedVersion(header.demo_file_stamp));
                }
            }
            command::FILE_INFO => {
                let info: DemoFileInfo = self.decode(&payload)?;
                if info.playback_ticks > 0 {
                    let end = self
                        .start_tick
                        .unwrap_or(0)
                        .saturating_add(info.playback_ticks as u32);
                    self.end_tick = self.end_tick.max(end);
                }
            }
            command::STRING_TABLES => {
                let tables: DemoStringTables = self.decode(&payload)?;
                self.queue_snapshot(tick, &tables)?;
                return Ok(());
            }
            command::PACKET | command::SIGNON_PACKET => {
                let packet: DemoPacket = self.decode(&payload)?;
                return self.parse_packet(tick, &packet.data);
            }
            command::FULL_PACKET => {
                let full: DemoFullPacket = self.decode(&payload)?;
                if let Some(tables) = &full.string_table {
                    self.queue_snapshot(tick, tables)?;
                }
                if let Some(packet) = &full.packet {
                    self.parse_packet(tick, &packet.data)?;
                }
                return Ok(());
            }
            _ => {}
        }
        self.queue.push_back(DemoFrame {
            tick,
            kind: FrameKind::Generic(cmd),
        });
        Ok(())
    }

    fn decode<M: Message + Default>(&self, payload: &[u8]) -> Result<M, DemoError> {
        M::decode(payload).map_err(|e| self.malformed(e.to_string()))
    }

    fn queue_snapshot(&mut self, tick: u32, tables: &DemoStringTables) -> Result<(), DemoError> {
        for table in tables.tables.iter().filter(|t| t.table_name == USERINFO_TABLE) {
            let mut update = PlayerUpdate {
                replace_all: true,
                slots: Vec::new(),
            };
            for (slot, item) in table.items.iter().enumerate() {
                if item.data.is_empty() {
                    continue;
                }
                let info: PlayerInfo = self.decode(&item.data)?;
                update
                    .slots
                    .push((slot as u32, PlayerIdentity::from_info(slot as u32, &info)));
            }
            self.queue.push_back(DemoFrame {
                tick,
                kind: FrameKind::PlayerInfo(update),
            });
        }
        Ok(())
    }

    fn queue_userinfo_entries(
        &mut self,
        tick: u32,
        entries: Vec<StringTableEntry>,
    ) -> Result<(), DemoError> {
        let mut update = PlayerUpdate::default();
        for entry in entries {
            // key-only changes leave the player as is
            let Some(value) = entry.value else {
                continue;
            };
            let identity = if value.is_empty() {
                None
            } else {
                let info: PlayerInfo = self.decode(&value)?;
                PlayerIdentity::from_info(entry.index, &info)
            };
            update.slots.push((entry.index, identity));
        }
        if !update.slots.is_empty() {
            self.queue.push_back(DemoFrame {
                tick,
                kind: FrameKind::PlayerInfo(update),
            });
        }
        Ok(())
    }

    fn parse_packet(&mut self, tick: u32, data: &[u8]) -> Result<(), DemoError> {
        let mut r = BitReader::new(data);
        let bits = |e: BitError| e.to_string();
        while r.bits_remaining() > 8 {
            let msg_type = r.read_ubitvar().map_err(|e| self.malformed(bits(e)))?;
            let size = r.read_varint32().map_err(|e| self.malformed(bits(e)))?;
            let msg = r
                .read_bytes(size as usize)
                .map_err(|e| self.malformed(bits(e)))?;
            match msg_type {
                svc::SERVER_INFO => {
                    let info: SvcServerInfo = self.decode(&msg)?;
                    if info.tick_interval > 0.0 {
                        let tick_rate = (1.0 / info.tick_interval).round().max(1.0) as u32;
                        self.queue.push_back(DemoFrame {
                            tick,
                            kind: FrameKind::ServerInfo { tick_rate },
                        });
                    }
                }
                svc::CREATE_STRING_TABLE => {
                    let create: SvcCreateStringTable = self.decode(&msg)?;
                    let entries = self
                        .tables
                        .create(&create)
                        .map_err(|e| self.table_error(e))?;
                    if let Some(entries) = entries {
                        self.queue_userinfo_entries(tick, entries)?;
                    }
                }
                svc::UPDATE_STRING_TABLE => {
                    let update: SvcUpdateStringTable = self.decode(&msg)?;
                    let entries = self
                        .tables
                        .update(&update)
                        .map_err(|e| self.table_error(e))?;
                    if let Some(entries) = entries {
                        self.queue_userinfo_entries(tick, entries)?;
                    }
                }
                svc::VOICE_DATA => {
                    let voice: SvcVoiceData = self.decode(&msg)?;
                    let voice_tick = if voice.tick != 0 { voice.tick } else { tick };
                    self.queue.push_back(DemoFrame {
                        tick: voice_tick,
                        kind: FrameKind::Voice(VoiceMessage {
                            slot: voice.client,
                            xuid: voice.xuid,
                            tick: voice_tick,
                            audio: voice.audio.unwrap_or_default(),
                        }),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn table_error(&self, e: StringTableError) -> DemoError {
        self.malformed(e.to_string())
    }
}

impl<R: Read> Iterator for DemoReader<R> {
    type Item = Result<DemoFrame, DemoError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}
