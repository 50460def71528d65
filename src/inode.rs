/// Reference: https://www.nongnu.org/ext2-doc/ext2.html#inode-table
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const EXT2_S_IFMT: u16 = 0o170000;
const EXT2_S_IFDIR: u16 = 0o040000;
const EXT2_S_IFREG: u16 = 0o100000;

/// Number of direct block pointers in `i_block`.
pub const NUM_DIRECT_BLOCKS: usize = 12;

/// Classic 128-byte ext2 inode record. A deletion time of zero means the
/// inode has not been deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inode {
    pub i_num: u32,
    pub i_mode: u16,
    pub i_uid: u16,
    pub i_size: u32,
    pub i_atime: u32,
    pub i_ctime: u32,
    pub i_mtime: u32,
    pub i_dtime: u32,
    pub i_atime_h: String,
    pub i_ctime_h: String,
    pub i_mtime_h: String,
    pub i_dtime_h: String,
    pub i_gid: u16,
    pub i_links_count: u16,
    pub i_blocks: u32,
    pub i_flags: u32,
    pub i_block: [u32; 15],
    pub i_generation: u32,
}

fn format_time(seconds: u32) -> String {
    Utc.timestamp_opt(seconds as i64, 0)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

impl Inode {
    pub fn from_bytes(i_num: u32, data: &[u8]) -> Result<Self, String> {
        if data.len() < 128 {
            return Err(format!("Not enough bytes to parse inode {}", i_num));
        }
        let le_u16 = |offset: usize| -> u16 {
            u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap())
        };
        let le_u32 = |offset: usize| -> u32 {
            u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
        };

        let i_atime = le_u32(0x08);
        let i_ctime = le_u32(0x0C);
        let i_mtime = le_u32(0x10);
        let i_dtime = le_u32(0x14);

        let mut i_block = [0u32; 15];
        for (i, slot) in i_block.iter_mut().enumerate() {
            *slot = le_u32(0x28 + i * 4);
        }

        Ok(Inode {
            i_num,
            i_mode: le_u16(0x00),
            i_uid: le_u16(0x02),
            i_size: le_u32(0x04),
            i_atime,
            i_ctime,
            i_mtime,
            i_dtime,
            i_atime_h: format_time(i_atime),
            i_ctime_h: format_time(i_ctime),
            i_mtime_h: format_time(i_mtime),
            i_dtime_h: format_time(i_dtime),
            i_gid: le_u16(0x18),
            i_links_count: le_u16(0x1A),
            i_blocks: le_u32(0x1C),
            i_flags: le_u32(0x20),
            i_block,
            i_generation: le_u32(0x64),
        })
    }

    /// The zeroed record that reading inode number 0 yields.
    pub fn empty() -> Self {
        Inode {
            i_num: 0,
            i_mode: 0,
            i_uid: 0,
            i_size: 0,
            i_atime: 0,
            i_ctime: 0,
            i_mtime: 0,
            i_dtime: 0,
            i_atime_h: format_time(0),
            i_ctime_h: format_time(0),
            i_mtime_h: format_time(0),
            i_dtime_h: format_time(0),
            i_gid: 0,
            i_links_count: 0,
            i_blocks: 0,
            i_flags: 0,
            i_block: [0u32; 15],
            i_generation: 0,
        }
    }

    /// Check if this inode is a directory (S_IFDIR).
    pub fn is_dir(&self) -> bool {
        (self.i_mode & EXT2_S_IFMT) == EXT2_S_IFDIR
    }

    /// Check if this inode is a regular file (S_IFREG).
    pub fn is_regular_file(&self) -> bool {
        (self.i_mode & EXT2_S_IFMT) == EXT2_S_IFREG
    }

    /// The twelve direct data-block pointers.
    pub fn direct_blocks(&self) -> &[u32] {
        &self.i_block[..NUM_DIRECT_BLOCKS]
    }

    pub fn single_indirect(&self) -> u32 {
        self.i_block[12]
    }

    pub fn double_indirect(&self) -> u32 {
        self.i_block[13]
    }

    pub fn triple_indirect(&self) -> u32 {
        self.i_block[14]
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}
