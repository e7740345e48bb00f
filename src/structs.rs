use binrw::binrw;

// note: the container is a 16 byte header followed by varint framed commands,
// most command payloads are protobuf messages

pub const DEMO_MAGIC: &[u8; 8] = b"PBDEMS2\0";
pub const CSGO_MAGIC: &[u8; 8] = b"HL2DEMO\0";
pub const SOURCE2_V1_MAGIC: &[u8; 8] = b"PBUFDEM\0";

#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone)]
pub struct DemoHeader {
    pub magic: [u8; 8],
    pub file_info_offset: i32,
    pub spawn_groups_offset: i32,
}

impl DemoHeader {
    pub fn byte_len() -> u32 {
        16
    }
}

/// container commands, `EDemoCommands`
pub mod command {
    pub const STOP: u32 = 0;
    pub const FILE_HEADER: u32 = 1;
    pub const FILE_INFO: u32 = 2;
    pub const SYNC_TICK: u32 = 3;
    pub const STRING_TABLES: u32 = 6;
    pub const PACKET: u32 = 7;
    pub const SIGNON_PACKET: u32 = 8;
    pub const FULL_PACKET: u32 = 13;
    pub const IS_COMPRESSED: u32 = 64;
}

/// net message ids inside packets, `SVC_Messages`
pub mod svc {
    pub const SERVER_INFO: u32 = 40;
    pub const CREATE_STRING_TABLE: u32 = 44;
    pub const UPDATE_STRING_TABLE: u32 = 45;
    pub const VOICE_DATA: u32 = 47;
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DemoFileHeader {
    #[prost(string, tag = "1")]
    pub demo_file_stamp: String,
    #[prost(int32, tag = "2")]
    pub network_protocol: i32,
    #[prost(string, tag = "5")]
    pub map_name: String,
    #[prost(int32, tag = "13")]
    pub build_num: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DemoFileInfo {
    #[prost(float, tag = "1")]
    pub playback_time: f32,
    #[prost(int32, tag = "2")]
    pub playback_ticks: i32,
    #[prost(int32, tag = "3")]
    pub playback_frames: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DemoPacket {
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DemoFullPacket {
    #[prost(message, optional, tag = "1")]
    pub string_table: Option<DemoStringTables>,
    #[prost(message, optional, tag = "2")]
    pub packet: Option<DemoPacket>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DemoStringTables {
    #[prost(message, repeated, tag = "1")]
    pub tables: Vec<StringTableSnapshot>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StringTableSnapshot {
    #[prost(string, tag = "1")]
    pub table_name: String,
    #[prost(message, repeated, tag = "2")]
    pub items: Vec<StringTableItem>,
    #[prost(int32, tag = "4")]
    pub table_flags: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StringTableItem {
    #[prost(bytes = "vec", tag = "1")]
    pub str: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SvcServerInfo {
    #[prost(int32, tag = "12")]
    pub player_slot: i32,
    #[prost(float, tag = "13")]
    pub tick_interval: f32,
    #[prost(string, tag = "15")]
    pub map_name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SvcCreateStringTable {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int32, tag = "2")]
    pub num_entries: i32,
    #[prost(bool, tag = "3")]
    pub user_data_fixed_size: bool,
    #[prost(int32, tag = "4")]
    pub user_data_size: i32,
    #[prost(int32, tag = "5")]
    pub user_data_size_bits: i32,
    #[prost(int32, tag = "6")]
    pub flags: i32,
    #[prost(bytes = "vec", tag = "7")]
    pub string_data: Vec<u8>,
    #[prost(int32, tag = "8")]
    pub uncompressed_size: i32,
    #[prost(bool, tag = "9")]
    pub data_compressed: bool,
    #[prost(bool, tag = "10")]
    pub using_varint_bitcounts: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SvcUpdateStringTable {
    #[prost(int32, tag = "1")]
    pub table_id: i32,
    #[prost(int32, tag = "2")]
    pub num_changed_entries: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub string_data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SvcVoiceData {
    #[prost(message, optional, tag = "1")]
    pub audio: Option<VoiceAudio>,
    #[prost(int32, tag = "2")]
    pub client: i32,
    #[prost(bool, tag = "3")]
    pub proximity: bool,
    #[prost(fixed64, tag = "4")]
    pub xuid: u64,
    #[prost(int32, tag = "5")]
    pub audible_mask: i32,
    #[prost(uint32, tag = "6")]
    pub tick: u32,
    #[prost(int32, tag = "7")]
    pub passthrough: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VoiceAudio {
    #[prost(int32, tag = "1")]
    pub format: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub voice_data: Vec<u8>,
    #[prost(int32, tag = "3")]
    pub sequence_bytes: i32,
    #[prost(uint32, tag = "4")]
    pub section_number: u32,
    #[prost(uint32, tag = "5")]
    pub sample_rate: u32,
    #[prost(uint32, tag = "6")]
    pub uncompressed_sample_offset: u32,
    #[prost(uint32, tag = "7")]
    pub num_packets: u32,
    #[prost(uint32, repeated, tag = "8")]
    pub packet_offsets: Vec<u32>,
    #[prost(float, tag = "9")]
    pub voice_level: f32,
}

/// value of a `userinfo` string table entry
#[derive(Clone, PartialEq, prost::Message)]
pub struct PlayerInfo {
    // not always valid UTF-8
    #[prost(bytes = "vec", tag = "1")]
    pub name: Vec<u8>,
    #[prost(fixed64, tag = "2")]
    pub xuid: u64,
    #[prost(int32, tag = "3")]
    pub userid: i32,
    #[prost(fixed64, tag = "4")]
    pub steamid: u64,
    #[prost(bool, tag = "5")]
    pub fakeplayer: bool,
    #[prost(bool, tag = "6")]
    pub ishltv: bool,
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use binrw::{BinReaderExt, BinWriterExt};
    use prost::Message;

    use super::{DemoHeader, PlayerInfo, SvcVoiceData, VoiceAudio, DEMO_MAGIC};

    #[test]
    pub fn check_byte_lens() {
        let mut buf = Vec::new();
        let header = DemoHeader {
            magic: *DEMO_MAGIC,
            ..Default::default()
        };
        Cursor::new(&mut buf).write_le(&header).unwrap();
        assert_eq!(DemoHeader::byte_len() as usize, buf.len());
        assert_eq!(&buf[..8], DEMO_MAGIC);
        let back: DemoHeader = Cursor::new(&buf).read_le().unwrap();
        assert_eq!(back.magic, *DEMO_MAGIC);
    }

    #[test]
    pub fn voice_data_field_layout() {
        // xuid is fixed64 on the wire, tag 4 wire type 1
        let msg = SvcVoiceData {
            xuid: 76561198000000001,
            audio: Some(VoiceAudio {
                packet_offsets: vec![10, 20],
                ..Default::default()
            }),
            ..Default::default()
        };
        let bytes = msg.encode_to_vec();
        assert!(bytes.windows(1).any(|b| b[0] == (4 << 3 | 1)));
        assert_eq!(SvcVoiceData::decode(&bytes[..]).unwrap(), msg);

        let info = PlayerInfo {
            name: b"\xFFbad utf8".to_vec(),
            steamid: 76561198000000002,
            ..Default::default()
        };
        let back = PlayerInfo::decode(&info.encode_to_vec()[..]).unwrap();
        assert_eq!(back.name, info.name);
    }
}
