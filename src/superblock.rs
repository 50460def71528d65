/// Reference: https://www.nongnu.org/ext2-doc/ext2.html#superblock
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const EXT2_SUPER_MAGIC: u16 = 0xEF53;

/// Classic ext2 superblock, read from byte offset 1024 of the image.
#[derive(Debug, Serialize, Deserialize)]
pub struct Superblock {
    pub s_inodes_count: u32,
    pub s_blocks_count: u32,
    pub s_r_blocks_count: u32,
    pub s_free_blocks_count: u32,
    pub s_free_inodes_count: u32,
    pub s_first_data_block: u32,
    pub s_log_block_size: u32,
    pub s_blocks_per_group: u32,
    pub s_inodes_per_group: u32,
    pub s_mtime: u32,
    pub s_wtime: u32,
    pub s_mnt_count: u16,
    pub s_max_mnt_count: u16,
    pub s_magic: u16,
    pub s_state: u16,
    pub s_errors: u16,
    pub s_minor_rev_level: u16,
    pub s_lastcheck: u32,
    pub s_checkinterval: u32,
    pub s_creator_os: u32,
    pub s_rev_level: u32,
    pub s_first_ino: u32,
    pub s_inode_size: u16,
}

impl Superblock {
    pub fn from_bytes(data: &[u8]) -> Result<Self, String> {
        if data.len() < 0x5A {
            return Err("Not enough bytes to parse superblock".to_string());
        }
        let le_u16 = |offset: usize| -> u16 {
            u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap())
        };
        let le_u32 = |offset: usize| -> u32 {
            u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
        };

        let s_magic = le_u16(0x38);
        if s_magic != EXT2_SUPER_MAGIC {
            return Err(format!("Invalid ext2 magic number: 0x{:x}", s_magic));
        }

        let s_blocks_per_group = le_u32(0x20);
        let s_inodes_per_group = le_u32(0x28);
        if s_blocks_per_group == 0 || s_inodes_per_group == 0 {
            return Err("Superblock declares an empty block-group geometry".to_string());
        }

        Ok(Self {
            s_inodes_count: le_u32(0x00),
            s_blocks_count: le_u32(0x04),
            s_r_blocks_count: le_u32(0x08),
            s_free_blocks_count: le_u32(0x0C),
            s_free_inodes_count: le_u32(0x10),
            s_first_data_block: le_u32(0x14),
            s_log_block_size: le_u32(0x18),
            s_blocks_per_group,
            s_inodes_per_group,
            s_mtime: le_u32(0x2C),
            s_wtime: le_u32(0x30),
            s_mnt_count: le_u16(0x34),
            s_max_mnt_count: le_u16(0x36),
            s_magic,
            s_state: le_u16(0x3A),
            s_errors: le_u16(0x3C),
            s_minor_rev_level: le_u16(0x3E),
            s_lastcheck: le_u32(0x40),
            s_checkinterval: le_u32(0x44),
            s_creator_os: le_u32(0x48),
            s_rev_level: le_u32(0x4C),
            s_first_ino: le_u32(0x54),
            s_inode_size: le_u16(0x58),
        })
    }

    pub fn block_size(&self) -> u64 {
        1024 << self.s_log_block_size
    }

    pub fn blocks_count(&self) -> u64 {
        self.s_blocks_count as u64
    }

    pub fn blocks_per_group(&self) -> u64 {
        self.s_blocks_per_group as u64
    }

    /// Number of block groups, `ceil(block_count / blocks_per_group)`.
    pub fn group_count(&self) -> u32 {
        let per_group = self.s_blocks_per_group as u64;
        ((self.s_blocks_count as u64 + per_group - 1) / per_group) as u32
    }

    pub fn inodes_per_group(&self) -> u32 {
        self.s_inodes_per_group
    }

    /// Revision-0 images leave `s_inode_size` at zero; the record size is
    /// the classic 128 bytes there.
    pub fn inode_size(&self) -> usize {
        if self.s_rev_level == 0 || self.s_inode_size == 0 {
            128
        } else {
            self.s_inode_size as usize
        }
    }

    pub fn first_data_block(&self) -> u32 {
        self.s_first_data_block
    }

    pub fn to_json(&self) -> Value {
        json!({
            "inodes_count": self.s_inodes_count,
            "blocks_count": self.s_blocks_count,
            "free_blocks_count": self.s_free_blocks_count,
            "free_inodes_count": self.s_free_inodes_count,
            "first_data_block": self.s_first_data_block,
            "log_block_size": self.s_log_block_size,
            "blocks_per_group": self.s_blocks_per_group,
            "inodes_per_group": self.s_inodes_per_group,
            "inode_size": self.inode_size(),
            "group_count": self.group_count(),
            "magic": format!("0x{:04x}", self.s_magic),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_superblock() -> Vec<u8> {
        let mut data = vec![0u8; 1024];
        data[0x00..0x04].copy_from_slice(&64u32.to_le_bytes()); // inodes_count
        data[0x04..0x08].copy_from_slice(&512u32.to_le_bytes()); // blocks_count
        data[0x14..0x18].copy_from_slice(&1u32.to_le_bytes()); // first_data_block
        data[0x18..0x1C].copy_from_slice(&0u32.to_le_bytes()); // log_block_size
        data[0x20..0x24].copy_from_slice(&8192u32.to_le_bytes()); // blocks_per_group
        data[0x28..0x2C].copy_from_slice(&64u32.to_le_bytes()); // inodes_per_group
        data[0x38..0x3A].copy_from_slice(&0xEF53u16.to_le_bytes()); // magic
        data[0x4C..0x50].copy_from_slice(&1u32.to_le_bytes()); // rev_level
        data[0x58..0x5A].copy_from_slice(&128u16.to_le_bytes()); // inode_size
        data
    }

    #[test]
    fn parses_classic_geometry() {
        let sb = Superblock::from_bytes(&raw_superblock()).unwrap();
        assert_eq!(sb.block_size(), 1024);
        assert_eq!(sb.group_count(), 1);
        assert_eq!(sb.inodes_per_group(), 64);
        assert_eq!(sb.inode_size(), 128);
        assert_eq!(sb.first_data_block(), 1);
        assert_eq!(sb.to_json()["magic"], "0xef53");
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = raw_superblock();
        data[0x38] = 0x00;
        assert!(Superblock::from_bytes(&data).is_err());
    }

    #[test]
    fn revision_zero_inode_size_defaults_to_128() {
        let mut data = raw_superblock();
        data[0x4C..0x50].copy_from_slice(&0u32.to_le_bytes());
        data[0x58..0x5A].copy_from_slice(&0u16.to_le_bytes());
        let sb = Superblock::from_bytes(&data).unwrap();
        assert_eq!(sb.inode_size(), 128);
    }

    #[test]
    fn group_count_rounds_up() {
        let mut data = raw_superblock();
        data[0x04..0x08].copy_from_slice(&8193u32.to_le_bytes());
        let sb = Superblock::from_bytes(&data).unwrap();
        assert_eq!(sb.group_count(), 2);
    }
}
