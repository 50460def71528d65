//! Builds minimal single-group ext2 images in memory: 1 KiB blocks, 32
//! classic 128-byte inodes, group descriptor table in block 2, inode table
//! in blocks 5..9. Data blocks are free from block 21 on.

use std::io::Cursor;

pub const BLOCK_SIZE: usize = 1024;
pub const ROOT_INODE: u32 = 2;

pub const FT_REG: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const DIR_MODE: u16 = 0o040_755;
pub const FILE_MODE: u16 = 0o100_644;

const TOTAL_BLOCKS: u32 = 64;
const INODES: u32 = 32;
const INODE_TABLE_BLOCK: u32 = 5;
const INODE_SIZE: usize = 128;

fn put_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[derive(Debug, Default, Clone)]
pub struct InodeSpec {
    pub mode: u16,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub blocks: Vec<u32>,
    pub single_indirect: u32,
    pub double_indirect: u32,
    pub triple_indirect: u32,
}

pub struct ImageBuilder {
    data: Vec<u8>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        let mut data = vec![0u8; TOTAL_BLOCKS as usize * BLOCK_SIZE];

        let sb = BLOCK_SIZE; // superblock at byte 1024
        put_u32(&mut data, sb + 0x00, INODES);
        put_u32(&mut data, sb + 0x04, TOTAL_BLOCKS);
        put_u32(&mut data, sb + 0x14, 1); // first_data_block
        put_u32(&mut data, sb + 0x18, 0); // log_block_size => 1 KiB
        put_u32(&mut data, sb + 0x20, 8192); // blocks_per_group
        put_u32(&mut data, sb + 0x28, INODES); // inodes_per_group
        put_u16(&mut data, sb + 0x38, 0xEF53);
        put_u32(&mut data, sb + 0x4C, 1); // rev_level
        put_u16(&mut data, sb + 0x58, INODE_SIZE as u16);

        let gd = 2 * BLOCK_SIZE; // group descriptor table
        put_u32(&mut data, gd + 0x00, 3); // block bitmap
        put_u32(&mut data, gd + 0x04, 4); // inode bitmap
        put_u32(&mut data, gd + 0x08, INODE_TABLE_BLOCK);

        ImageBuilder { data }
    }

    pub fn inode(&mut self, num: u32, spec: &InodeSpec) -> &mut Self {
        assert!((1..=INODES).contains(&num));
        assert!(spec.blocks.len() <= 12);
        let base = INODE_TABLE_BLOCK as usize * BLOCK_SIZE + (num as usize - 1) * INODE_SIZE;
        put_u16(&mut self.data, base + 0x00, spec.mode);
        put_u32(
            &mut self.data,
            base + 0x04,
            (spec.blocks.len() * BLOCK_SIZE) as u32,
        );
        put_u32(&mut self.data, base + 0x08, spec.atime);
        put_u32(&mut self.data, base + 0x0C, spec.ctime);
        put_u32(&mut self.data, base + 0x10, spec.mtime);
        put_u32(&mut self.data, base + 0x14, spec.dtime);
        put_u16(&mut self.data, base + 0x1A, 1); // links_count
        for (i, block) in spec.blocks.iter().enumerate() {
            put_u32(&mut self.data, base + 0x28 + i * 4, *block);
        }
        put_u32(&mut self.data, base + 0x58, spec.single_indirect);
        put_u32(&mut self.data, base + 0x5C, spec.double_indirect);
        put_u32(&mut self.data, base + 0x60, spec.triple_indirect);
        self
    }

    pub fn block(&mut self, num: u32, content: &[u8]) -> &mut Self {
        assert!(num < TOTAL_BLOCKS);
        assert!(content.len() <= BLOCK_SIZE);
        let base = num as usize * BLOCK_SIZE;
        self.data[base..base + content.len()].copy_from_slice(content);
        self
    }

    pub fn pointer_block(&mut self, num: u32, pointers: &[u32]) -> &mut Self {
        let mut content = vec![0u8; BLOCK_SIZE];
        for (i, pointer) in pointers.iter().enumerate() {
            put_u32(&mut content, i * 4, *pointer);
        }
        self.block(num, &content)
    }

    pub fn corrupt_magic(&mut self) -> &mut Self {
        put_u16(&mut self.data, BLOCK_SIZE + 0x38, 0xBEEF);
        self
    }

    pub fn build(&self) -> Cursor<Vec<u8>> {
        Cursor::new(self.data.clone())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Live,
    Ghost,
}

/// Lays out one directory data block. Live entries chain through their
/// record lengths; a ghost is written into the slack of the nearest live
/// record before it, exactly where a deleted entry's residue survives. The
/// last live record's length spans to the end of the block.
pub struct DirBlockBuilder {
    items: Vec<(Slot, u32, u8, String)>,
}

fn aligned_size(name_len: usize) -> usize {
    (8 + name_len + 3) & !3
}

fn write_record(buf: &mut [u8], offset: usize, inode: u32, rec_len: u16, ftype: u8, name: &str) {
    put_u32(buf, offset, inode);
    put_u16(buf, offset + 4, rec_len);
    buf[offset + 6] = name.len() as u8;
    buf[offset + 7] = ftype;
    buf[offset + 8..offset + 8 + name.len()].copy_from_slice(name.as_bytes());
}

impl DirBlockBuilder {
    pub fn new() -> Self {
        DirBlockBuilder { items: Vec::new() }
    }

    pub fn entry(mut self, inode: u32, ftype: u8, name: &str) -> Self {
        self.items.push((Slot::Live, inode, ftype, name.to_string()));
        self
    }

    pub fn ghost(mut self, inode: u32, ftype: u8, name: &str) -> Self {
        self.items.push((Slot::Ghost, inode, ftype, name.to_string()));
        self
    }

    pub fn build(self) -> Vec<u8> {
        assert!(
            matches!(self.items.first(), Some((Slot::Live, ..))),
            "a ghost needs a live record in front of it"
        );

        let mut positions = Vec::with_capacity(self.items.len());
        let mut cursor = 0usize;
        for (_, _, _, name) in &self.items {
            positions.push(cursor);
            cursor += aligned_size(name.len());
        }
        assert!(cursor <= BLOCK_SIZE, "directory block overflow");

        let mut buf = vec![0u8; BLOCK_SIZE];
        for (i, (_, inode, ftype, name)) in self.items.iter().enumerate() {
            let rec_len = aligned_size(name.len()) as u16;
            write_record(&mut buf, positions[i], *inode, rec_len, *ftype, name);
        }

        // Stitch the live chain over any ghost residue between records.
        let live: Vec<usize> = (0..self.items.len())
            .filter(|&i| self.items[i].0 == Slot::Live)
            .collect();
        for (k, &i) in live.iter().enumerate() {
            let next = live.get(k + 1).map(|&j| positions[j]).unwrap_or(BLOCK_SIZE);
            put_u16(&mut buf, positions[i] + 4, (next - positions[i]) as u16);
        }

        buf
    }
}
