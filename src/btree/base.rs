// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::bitmap::Bitmap;
use crate::coding::{Decode, Encode};
use crate::{Error, Revision};
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io::{Read, Write};
use varint_rs::VarintWriter;

/// Magic bytes of a base file; the last byte is the format version.
pub const MAGIC_BYTES: [u8; 4] = [b'M', b'I', b'C', 1];

/// Compact descriptor of one committed table revision.
///
/// Two of these alternate per table; a commit always overwrites the slot
/// *not* holding the newest revision, so a crash mid-commit leaves the
/// previous revision intact.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BaseFile {
    /// Revision this descriptor belongs to
    pub revision: Revision,

    /// Block size the table was created with
    pub block_size: u32,

    /// Root block number
    pub root: u32,

    /// Height of the tree (0 = the root is a leaf)
    pub level: u8,

    /// Number of key/tag pairs in the table
    pub entry_count: u64,

    /// Highest block number ever allocated
    pub last_block: u32,

    /// Liveness map of this revision's blocks
    pub bitmap: Bitmap,
}

impl Encode for BaseFile {
    fn encode_into<W: Write>(&self, writer: &mut W) -> crate::Result<()> {
        writer.write_all(&MAGIC_BYTES)?;
        writer.write_u32_varint(self.revision)?;
        writer.write_u32::<LE>(self.block_size)?;
        writer.write_u32::<LE>(self.root)?;
        writer.write_u8(self.level)?;
        writer.write_u64::<LE>(self.entry_count)?;
        writer.write_u32::<LE>(self.last_block)?;

        let bitmap = self.bitmap.as_bytes();

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<LE>(bitmap.len() as u32)?;
        writer.write_all(bitmap)?;

        Ok(())
    }
}

impl Decode for BaseFile {
    fn decode_from<R: Read>(reader: &mut R) -> crate::Result<Self> {
        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;

        if magic != MAGIC_BYTES {
            return Err(Error::Corrupt("invalid base file magic"));
        }

        let revision = read_u32_varint(reader)?;
        let block_size = reader.read_u32::<LE>()?;
        let root = reader.read_u32::<LE>()?;
        let level = reader.read_u8()?;
        let entry_count = reader.read_u64::<LE>()?;
        let last_block = reader.read_u32::<LE>()?;

        let bitmap_len = reader.read_u32::<LE>()? as usize;
        let mut bitmap = vec![0u8; bitmap_len];
        reader.read_exact(&mut bitmap)?;

        Ok(Self {
            revision,
            block_size,
            root,
            level,
            entry_count,
            last_block,
            bitmap: Bitmap::from_bytes(bitmap),
        })
    }
}

fn read_u32_varint<R: Read>(reader: &mut R) -> crate::Result<u32> {
    let mut shift = 0u32;
    let mut value = 0u32;

    loop {
        let part = reader.read_u8()?;
        let low = u32::from(part & 0x7f);

        if shift >= 32 || (low != 0 && low >> (32 - shift).min(31) != 0) {
            return Err(Error::Corrupt("base file revision out of range"));
        }

        value |= low << shift;
        shift += 7;

        if part & 0x80 == 0 {
            return Ok(value);
        }
    }
}
