use thiserror::Error;

use crate::{
    bits::{BitError, BitReader},
    structs::{SvcCreateStringTable, SvcUpdateStringTable},
};

pub const USERINFO_TABLE: &str = "userinfo";
const KEY_HISTORY_SIZE: usize = 32;
const FLAG_MAY_COMPRESS: i32 = 0x1;

#[derive(Error, Debug)]
pub enum StringTableError {
    #[error("string table data: {0}")]
    Bits(#[from] BitError),
    #[error("string table snappy data: {0}")]
    Snappy(#[from] snap::Error),
    #[error("Update for unknown string table {0}")]
    UnknownTable(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringTableEntry {
    pub index: u32,
    pub key: Option<Vec<u8>>,
    // None means unchanged, Some(empty) means cleared
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct TableFormat {
    pub user_data_fixed_size: bool,
    pub user_data_size_bits: u32,
    pub flags: i32,
    pub varint_bit_counts: bool,
}

#[derive(Debug, Clone)]
struct TableInfo {
    name: String,
    format: TableFormat,
}

/// Tracks the tables created so far, updates refer to them by creation order.
/// Only the `userinfo` table's entries are decoded.
#[derive(Debug, Default)]
pub struct StringTables {
    tables: Vec<TableInfo>,
}

impl StringTables {
    pub fn create(
        &mut self,
        msg: &SvcCreateStringTable,
    ) -> Result<Option<Vec<StringTableEntry>>, StringTableError> {
        let format = TableFormat {
            user_data_fixed_size: msg.user_data_fixed_size,
            user_data_size_bits: msg.user_data_size_bits.max(0) as u32,
            flags: msg.flags,
            varint_bit_counts: msg.using_varint_bitcounts,
        };
        self.tables.push(TableInfo {
            name: msg.name.clone(),
            format,
        });
        if msg.name != USERINFO_TABLE {
            return Ok(None);
        }
        let data = if msg.data_compressed {
            snap::raw::Decoder::new().decompress_vec(&msg.string_data)?
        } else {
            msg.string_data.clone()
        };
        let format = &self.tables[self.tables.len() - 1].format;
        parse_entries(&data, msg.num_entries.max(0) as usize, format).map(Some)
    }

    pub fn update(
        &mut self,
        msg: &SvcUpdateStringTable,
    ) -> Result<Option<Vec<StringTableEntry>>, StringTableError> {
        let table = usize::try_from(msg.table_id)
            .ok()
            .and_then(|id| self.tables.get(id))
            .ok_or(StringTableError::UnknownTable(msg.table_id))?;
        if table.name != USERINFO_TABLE {
            return Ok(None);
        }
        parse_entries(
            &msg.string_data,
            msg.num_changed_entries.max(0) as usize,
            &table.format,
        )
        .map(Some)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

pub fn parse_entries(
    data: &[u8],
    num_entries: usize,
    format: &TableFormat,
) -> Result<Vec<StringTableEntry>, StringTableError> {
    let mut r = BitReader::new(data);
    // every entry takes at least one bit
    let mut entries = Vec::with_capacity(num_entries.min(data.len() * 8));
    let mut index: i64 = -1;
    let mut history: Vec<Vec<u8>> = Vec::with_capacity(KEY_HISTORY_SIZE + 1);
    for _ in 0..num_entries {
        if r.read_bit()? {
            index += 1;
        } else {
            index += r.read_varint32()? as i64 + 1;
        }

        let key = if r.read_bit()? {
            let key = if r.read_bit()? {
                // prefix of a recent key plus a new suffix
                let pos = r.read_bits(5)? as usize;
                let size = r.read_bits(5)? as usize;
                let mut key = match history.get(pos) {
                    Some(base) => base[..size.min(base.len())].to_vec(),
                    None => Vec::new(),
                };
                key.extend(r.read_string()?);
                key
            } else {
                r.read_string()?
            };
            history.push(key.clone());
            if history.len() > KEY_HISTORY_SIZE {
                history.remove(0);
            }
            Some(key)
        } else {
            None
        };

        let value = if r.read_bit()? {
            let mut compressed = false;
            let bit_size = if format.user_data_fixed_size {
                format.user_data_size_bits as usize
            } else {
                if format.flags & FLAG_MAY_COMPRESS != 0 {
                    compressed = r.read_bit()?;
                }
                if format.varint_bit_counts {
                    r.read_ubitvar()? as usize * 8
                } else {
                    r.read_bits(17)? as usize * 8
                }
            };
            let raw = r.read_bits_as_bytes(bit_size)?;
            if compressed {
                Some(snap::raw::Decoder::new().decompress_vec(&raw)?)
            } else {
                Some(raw)
            }
        } else {
            None
        };

        entries.push(StringTableEntry {
            index: index.max(0) as u32,
            key,
            value,
        });
    }
    Ok(entries)
}
