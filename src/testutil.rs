//! Builders for synthetic demos and a tiny deterministic codec, used by the tests.

use prost::Message;

use crate::{
    decoder::{CodecError, CodecProvider, FrameCodec},
    stringtable::{TableFormat, USERINFO_TABLE},
    structs::{
        command, svc, DemoFileHeader, DemoFileInfo, DemoFullPacket, DemoPacket, DemoStringTables,
        PlayerInfo, StringTableItem, StringTableSnapshot, SvcCreateStringTable, SvcServerInfo,
        SvcUpdateStringTable, SvcVoiceData, VoiceAudio, DEMO_MAGIC,
    },
};

const SIGNON_TICK: u32 = u32::MAX;

/// LSB-first counterpart of `BitReader`
#[derive(Debug, Default)]
pub struct BitWriter {
    data: Vec<u8>,
    bits: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bits(&mut self, value: u32, count: usize) {
        for i in 0..count {
            if self.bits % 8 == 0 {
                self.data.push(0);
            }
            if (value >> i) & 1 == 1 {
                let last = self.data.len() - 1;
                self.data[last] |= 1 << (self.bits % 8);
            }
            self.bits += 1;
        }
    }

    pub fn write_bit(&mut self, bit: bool) {
        self.write_bits(bit as u32, 1);
    }

    pub fn write_ubitvar(&mut self, value: u32) {
        if value < 16 {
            self.write_bits(value, 6);
        } else if value < 256 {
            self.write_bits((value & 15) | 0x10, 6);
            self.write_bits(value >> 4, 4);
        } else if value < 4096 {
            self.write_bits((value & 15) | 0x20, 6);
            self.write_bits(value >> 4, 8);
        } else {
            self.write_bits((value & 15) | 0x30, 6);
            self.write_bits(value >> 4, 28);
        }
    }

    pub fn write_varint32(&mut self, mut value: u32) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.write_bits(byte as u32, 8);
                return;
            }
            self.write_bits((byte | 0x80) as u32, 8);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.write_bits(*b as u32, 8);
        }
    }

    /// appends the null terminator
    pub fn write_string(&mut self, s: &[u8]) {
        self.write_bytes(s);
        self.write_bits(0, 8);
    }

    pub fn finish(self) -> Vec<u8> {
        self.data
    }
}

pub fn varint(mut value: u32, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub struct RawTableEntry {
    pub index: u32,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl RawTableEntry {
    pub fn new(index: u32, key: &[u8], value: Option<Vec<u8>>) -> Self {
        Self {
            index,
            key: key.to_vec(),
            value,
        }
    }
}

/// entries must be in ascending index order, values are never compressed
pub fn encode_table_entries(entries: &[RawTableEntry], format: &TableFormat) -> Vec<u8> {
    let mut w = BitWriter::new();
    let mut last: i64 = -1;
    for entry in entries {
        let index = entry.index as i64;
        if index == last + 1 {
            w.write_bit(true);
        } else {
            w.write_bit(false);
            w.write_varint32((index - last - 1) as u32);
        }
        last = index;
        w.write_bit(true);
        w.write_bit(false);
        w.write_string(&entry.key);
        match &entry.value {
            Some(value) => {
                w.write_bit(true);
                if format.user_data_fixed_size {
                    let mut left = format.user_data_size_bits as usize;
                    for b in value {
                        let n = left.min(8);
                        w.write_bits(*b as u32, n);
                        left -= n;
                    }
                } else {
                    if format.flags & 1 != 0 {
                        w.write_bit(false);
                    }
                    if format.varint_bit_counts {
                        w.write_ubitvar(value.len() as u32);
                    } else {
                        w.write_bits(value.len() as u32, 17);
                    }
                    w.write_bytes(value);
                }
            }
            None => w.write_bit(false),
        }
    }
    w.finish()
}

fn userinfo_entries(entries: &[(u32, Option<PlayerInfo>)]) -> Vec<RawTableEntry> {
    let mut raw: Vec<_> = entries
        .iter()
        .map(|(slot, info)| {
            let value = info.as_ref().map(PlayerInfo::encode_to_vec).unwrap_or_default();
            RawTableEntry::new(*slot, slot.to_string().as_bytes(), Some(value))
        })
        .collect();
    raw.sort_by_key(|e| e.index);
    raw
}

fn encode_net_messages(messages: Vec<(u32, Vec<u8>)>) -> Vec<u8> {
    let mut w = BitWriter::new();
    for (msg_type, bytes) in messages {
        w.write_ubitvar(msg_type);
        w.write_varint32(bytes.len() as u32);
        w.write_bytes(&bytes);
    }
    w.finish()
}

fn userinfo_snapshot(entries: &[(u32, Option<PlayerInfo>)]) -> DemoStringTables {
    let len = entries.iter().map(|(slot, _)| *slot as usize + 1).max().unwrap_or(0);
    let mut items = vec![StringTableItem::default(); len];
    for (slot, info) in entries {
        items[*slot as usize] = StringTableItem {
            str: slot.to_string().into_bytes(),
            data: info.as_ref().map(PlayerInfo::encode_to_vec).unwrap_or_default(),
        };
    }
    DemoStringTables {
        tables: vec![StringTableSnapshot {
            table_name: USERINFO_TABLE.into(),
            items,
            table_flags: 0,
        }],
    }
}

pub fn player_info(steamid: u64, name: &str) -> PlayerInfo {
    PlayerInfo {
        name: name.as_bytes().to_vec(),
        xuid: steamid,
        steamid,
        ..Default::default()
    }
}

/// an opus voice message as the server sends it
pub fn voice_message(
    slot: i32,
    xuid: u64,
    section: u32,
    sequence_bytes: i32,
    payload: &[u8],
) -> SvcVoiceData {
    SvcVoiceData {
        client: slot,
        xuid,
        audio: Some(VoiceAudio {
            format: 2,
            voice_data: payload.to_vec(),
            sequence_bytes,
            section_number: section,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Writes a demo file frame by frame.
pub struct DemoBuilder {
    out: Vec<u8>,
    compress: bool,
    tables_created: i32,
    userinfo_table: Option<i32>,
}

impl DemoBuilder {
    pub fn new() -> Self {
        Self::with_stamp("PBDEMS_v2")
    }

    pub fn with_stamp(stamp: &str) -> Self {
        let mut out = DEMO_MAGIC.to_vec();
        out.extend_from_slice(&[0; 8]);
        let mut demo = Self {
            out,
            compress: false,
            tables_created: 0,
            userinfo_table: None,
        };
        let header = DemoFileHeader {
            demo_file_stamp: stamp.to_string(),
            map_name: "de_test".into(),
            ..Default::default()
        };
        demo.frame(command::FILE_HEADER, SIGNON_TICK, header.encode_to_vec());
        demo
    }

    pub fn compress(&mut self, compress: bool) -> &mut Self {
        self.compress = compress;
        self
    }

    pub fn frame(&mut self, cmd: u32, tick: u32, payload: Vec<u8>) -> &mut Self {
        let (cmd, payload) = if self.compress {
            let packed = snap::raw::Encoder::new()
                .compress_vec(&payload)
                .expect("snappy");
            (cmd | command::IS_COMPRESSED, packed)
        } else {
            (cmd, payload)
        };
        varint(cmd, &mut self.out);
        varint(tick, &mut self.out);
        varint(payload.len() as u32, &mut self.out);
        self.out.extend_from_slice(&payload);
        self
    }

    pub fn packet_with(&mut self, tick: u32, messages: Vec<(u32, Vec<u8>)>) -> &mut Self {
        let packet = DemoPacket {
            data: encode_net_messages(messages),
        };
        self.frame(command::PACKET, tick, packet.encode_to_vec())
    }

    pub fn server_info(&mut self, tick: u32, tick_rate: u32) -> &mut Self {
        let info = SvcServerInfo {
            tick_interval: 1.0 / tick_rate as f32,
            map_name: "de_test".into(),
            ..Default::default()
        };
        self.packet_with(tick, vec![(svc::SERVER_INFO, info.encode_to_vec())])
    }

    pub fn create_userinfo(
        &mut self,
        tick: u32,
        entries: &[(u32, Option<PlayerInfo>)],
    ) -> &mut Self {
        let data = encode_table_entries(&userinfo_entries(entries), &TableFormat::default());
        let create = SvcCreateStringTable {
            name: USERINFO_TABLE.into(),
            num_entries: entries.len() as i32,
            string_data: data,
            ..Default::default()
        };
        self.userinfo_table = Some(self.tables_created);
        self.tables_created += 1;
        self.packet_with(
            tick,
            vec![(svc::CREATE_STRING_TABLE, create.encode_to_vec())],
        )
    }

    pub fn userinfo_update_message(&self, entries: &[(u32, Option<PlayerInfo>)]) -> (u32, Vec<u8>) {
        let update = SvcUpdateStringTable {
            table_id: self.userinfo_table.unwrap_or(0),
            num_changed_entries: entries.len() as i32,
            string_data: encode_table_entries(&userinfo_entries(entries), &TableFormat::default()),
        };
        (svc::UPDATE_STRING_TABLE, update.encode_to_vec())
    }

    pub fn update_userinfo(
        &mut self,
        tick: u32,
        entries: &[(u32, Option<PlayerInfo>)],
    ) -> &mut Self {
        let msg = self.userinfo_update_message(entries);
        self.packet_with(tick, vec![msg])
    }

    pub fn string_table_snapshot(
        &mut self,
        tick: u32,
        entries: &[(u32, Option<PlayerInfo>)],
    ) -> &mut Self {
        let tables = userinfo_snapshot(entries);
        self.frame(command::STRING_TABLES, tick, tables.encode_to_vec())
    }

    /// snapshot of the userinfo table plus one packet in a single frame
    pub fn full_packet(
        &mut self,
        tick: u32,
        entries: &[(u32, Option<PlayerInfo>)],
        messages: Vec<(u32, Vec<u8>)>,
    ) -> &mut Self {
        let full = DemoFullPacket {
            string_table: Some(userinfo_snapshot(entries)),
            packet: Some(DemoPacket {
                data: encode_net_messages(messages),
            }),
        };
        self.frame(command::FULL_PACKET, tick, full.encode_to_vec())
    }

    pub fn voice_net_message(msg: &SvcVoiceData) -> (u32, Vec<u8>) {
        (svc::VOICE_DATA, msg.encode_to_vec())
    }

    pub fn voice(&mut self, tick: u32, msg: SvcVoiceData) -> &mut Self {
        self.packet_with(tick, vec![Self::voice_net_message(&msg)])
    }

    pub fn file_info(&mut self, tick: u32, playback_ticks: u32) -> &mut Self {
        let info = DemoFileInfo {
            playback_ticks: playback_ticks as i32,
            playback_time: playback_ticks as f32 / 64.0,
            ..Default::default()
        };
        self.frame(command::FILE_INFO, tick, info.encode_to_vec())
    }

    pub fn stop(&mut self, tick: u32) -> &mut Self {
        self.frame(command::STOP, tick, Vec::new())
    }

    pub fn finish(&self) -> Vec<u8> {
        self.out.clone()
    }
}

pub enum SteamRecord {
    SampleRate(u16),
    /// `None` is a codec reset chunk
    Frames(Vec<Option<Vec<u8>>>),
    Silence(u16),
    Raw(Vec<u8>),
}

pub fn steam_voice_payload(records: &[SteamRecord]) -> Vec<u8> {
    let mut out = 76561198000000001u64.to_le_bytes().to_vec();
    for record in records {
        match record {
            SteamRecord::SampleRate(rate) => {
                out.push(11);
                out.extend_from_slice(&rate.to_le_bytes());
            }
            SteamRecord::Frames(chunks) => {
                let mut body = Vec::new();
                for (seq, chunk) in chunks.iter().enumerate() {
                    match chunk {
                        Some(data) => {
                            body.extend_from_slice(&(data.len() as u16).to_le_bytes());
                            body.extend_from_slice(&(seq as u16).to_le_bytes());
                            body.extend_from_slice(data);
                        }
                        None => body.extend_from_slice(&0xFFFFu16.to_le_bytes()),
                    }
                }
                out.push(6);
                out.extend_from_slice(&(body.len() as u16).to_le_bytes());
                out.extend(body);
            }
            SteamRecord::Silence(samples) => {
                out.push(0);
                out.extend_from_slice(&samples.to_le_bytes());
            }
            SteamRecord::Raw(bytes) => out.extend_from_slice(bytes),
        }
    }
    // crc, not checked
    out.extend_from_slice(&[0; 4]);
    out
}

pub const DELTA_SAMPLE_RATE: u32 = 8000;
pub const DELTA_SAMPLES_PER_BYTE: usize = 25;

/// Each byte is a signed step of the output level, held for 25 samples.
/// The level carries over between frames until `reset`, frames starting
/// with 0x80 are rejected.
#[derive(Debug, Default)]
pub struct DeltaCodec {
    level: i16,
}

impl FrameCodec for DeltaCodec {
    fn decode(&mut self, frame: &[u8], out: &mut Vec<i16>) -> Result<(), CodecError> {
        if frame.first().map_or(true, |b| *b == 0x80) {
            return Err(CodecError::Corrupt("bad delta frame".into()));
        }
        for b in frame {
            self.level = self.level.saturating_add(*b as i8 as i16 * 100);
            out.extend(std::iter::repeat(self.level).take(DELTA_SAMPLES_PER_BYTE));
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        self.level = 0;
        Ok(())
    }

    fn expected_samples(&self, frame: &[u8]) -> Option<usize> {
        Some(frame.len() * DELTA_SAMPLES_PER_BYTE)
    }
}

pub struct DeltaProvider;

impl CodecProvider for DeltaProvider {
    fn sample_rate(&self) -> u32 {
        DELTA_SAMPLE_RATE
    }

    fn create(&self) -> Result<Box<dyn FrameCodec>, CodecError> {
        Ok(Box::new(DeltaCodec::default()))
    }
}
