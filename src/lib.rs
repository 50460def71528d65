use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};

pub mod direntry;
pub mod groupdescriptor;
pub mod history;
pub mod inode;
pub mod superblock;

use direntry::{carve_slack, DirEntry, GhostEntry, EXT2_FT_DIR};
use groupdescriptor::{GroupDescriptor, GROUP_DESCRIPTOR_SIZE};
use history::{EntryRecord, ReferenceIndex};
use inode::Inode;
use log::{debug, info, warn};
use superblock::Superblock;

/// The root directory always lives at this inode number.
pub const EXT2_ROOT_INODE: u32 = 2;

const SUPERBLOCK_OFFSET: u64 = 0x400;
const SUPERBLOCK_SIZE: usize = 0x400;

/// One line of the directory-tree snapshot, in traversal order.
///
/// Ghost entries render with the `inode:name` pair parenthesized; directories
/// carry a trailing slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub depth: usize,
    pub inode: u32,
    pub name: String,
    pub is_dir: bool,
    pub ghost: bool,
}

impl fmt::Display for TreeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = if self.is_dir { "/" } else { "" };
        for _ in 0..self.depth {
            write!(f, "-")?;
        }
        if self.ghost {
            write!(f, " ({}:{}{})", self.inode, self.name, suffix)
        } else {
            write!(f, " {}:{}{}", self.inode, self.name, suffix)
        }
    }
}

/// Write the tree snapshot, one entry per line.
pub fn render_tree<W: Write>(entries: &[TreeEntry], out: &mut W) -> io::Result<()> {
    for entry in entries {
        writeln!(out, "{}", entry)?;
    }
    Ok(())
}

/// Result of a full walk: the printable tree and the per-inode reference
/// index the action inference engine consumes.
#[derive(Debug)]
pub struct Exploration {
    pub tree: Vec<TreeEntry>,
    pub index: ReferenceIndex,
    // Directory inodes on the current recursion stack, to break cycles that
    // ghost references in corrupted images can form.
    visiting: Vec<u32>,
}

/// Struct representing an ext2 filesystem image.
pub struct Ext2Fs<T: Read + Seek> {
    pub superblock: Superblock,
    bgd_table: Vec<GroupDescriptor>,
    body: T,
    strict_names: bool,
}

impl<T: Read + Seek> Ext2Fs<T> {
    /// Create a new Ext2Fs instance given any type that implements `Read`
    /// and `Seek`. Reads and validates the superblock, then the group
    /// descriptor table; both failures are fatal.
    pub fn new(mut body: T) -> Result<Self, String> {
        body.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))
            .map_err(|e| e.to_string())?;
        let mut sb_buf = vec![0u8; SUPERBLOCK_SIZE];
        body.read_exact(&mut sb_buf).map_err(|e| e.to_string())?;
        let superblock = Superblock::from_bytes(&sb_buf)?;
        info!("ext2 image: {}", superblock.to_json());

        // The descriptor table sits in the block right after the superblock.
        let table_block = superblock.first_data_block() as u64 + 1;
        let group_count = superblock.group_count() as usize;
        body.seek(SeekFrom::Start(table_block * superblock.block_size()))
            .map_err(|e| e.to_string())?;
        let mut table_buf = vec![0u8; group_count * GROUP_DESCRIPTOR_SIZE];
        body.read_exact(&mut table_buf)
            .map_err(|e| format!("Failed to read group descriptor table: {}", e))?;

        let mut bgd_table = Vec::with_capacity(group_count);
        for chunk in table_buf.chunks_exact(GROUP_DESCRIPTOR_SIZE) {
            bgd_table.push(GroupDescriptor::from_bytes(chunk)?);
        }

        Ok(Ext2Fs {
            superblock,
            bgd_table,
            body,
            strict_names: false,
        })
    }

    /// Reject ghost candidates whose names fall outside printable ASCII.
    pub fn set_strict_names(&mut self, strict: bool) {
        self.strict_names = strict;
    }

    /// Helper to read one filesystem block into a Vec.
    pub fn read_block(&mut self, block_num: u32) -> Result<Vec<u8>, Box<dyn Error>> {
        if block_num as u64 >= self.superblock.blocks_count() {
            return Err(format!("Requested block {} is out of range", block_num).into());
        }
        let block_size = self.superblock.block_size();
        self.body
            .seek(SeekFrom::Start(block_num as u64 * block_size))?;
        let mut buf = vec![0u8; block_size as usize];
        self.body.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read a particular inode by number. Inode numbers are 1-based; number
    /// zero reads as an all-zero record.
    pub fn get_inode(&mut self, inode_num: u32) -> Result<Inode, Box<dyn Error>> {
        if inode_num == 0 {
            return Ok(Inode::empty());
        }

        let inodes_per_group = self.superblock.inodes_per_group();
        let group = (inode_num - 1) / inodes_per_group;
        let index = (inode_num - 1) % inodes_per_group;
        if group as usize >= self.bgd_table.len() {
            return Err(format!("Inode {} maps to invalid group {}", inode_num, group).into());
        }

        let inode_size = self.superblock.inode_size();
        let inodes_per_block = self.superblock.block_size() as usize / inode_size;
        if inodes_per_block == 0 {
            return Err(format!(
                "Inode size {} exceeds block size {}",
                inode_size,
                self.superblock.block_size()
            )
            .into());
        }

        let table_block = self.bgd_table[group as usize].bg_inode_table();
        let block = self.read_block(table_block + index / inodes_per_block as u32)?;
        let offset = (index as usize % inodes_per_block) * inode_size;
        if offset + 128 > block.len() {
            return Err(format!("Inode {} record overruns its table block", inode_num).into());
        }
        let inode = Inode::from_bytes(inode_num, &block[offset..offset + 128])?;
        Ok(inode)
    }

    /// Walk the whole directory tree from the root, collecting the printable
    /// snapshot and every live and ghost reference per inode.
    pub fn explore(&mut self) -> Result<Exploration, Box<dyn Error>> {
        let mut out = Exploration {
            tree: Vec::new(),
            index: ReferenceIndex::new(),
            visiting: Vec::new(),
        };

        // Nothing references the root by name; seed it so the history gets
        // its creation event.
        let root = self.get_inode(EXT2_ROOT_INODE)?;
        out.index.record(
            EXT2_ROOT_INODE,
            &root,
            EntryRecord {
                full_path: "/".to_string(),
                name: "root".to_string(),
                parent_inode: EXT2_ROOT_INODE,
                ghost: false,
            },
        );

        self.walk_directory(&mut out, EXT2_ROOT_INODE, 1, "", "root", false);
        Ok(out)
    }

    fn walk_directory(
        &mut self,
        out: &mut Exploration,
        inode_num: u32,
        depth: usize,
        path: &str,
        name: &str,
        ghost: bool,
    ) {
        let inode = match self.get_inode(inode_num) {
            Ok(inode) => inode,
            Err(err) => {
                warn!("skipping directory inode {}: {}", inode_num, err);
                return;
            }
        };

        // Entries whose file type claimed "directory" but whose inode mode
        // disagrees are inert.
        if !inode.is_dir() {
            return;
        }

        if out.visiting.contains(&inode_num) {
            warn!("directory cycle at inode {}, not descending again", inode_num);
            return;
        }

        out.tree.push(TreeEntry {
            depth,
            inode: inode_num,
            name: name.to_string(),
            is_dir: true,
            ghost,
        });

        out.visiting.push(inode_num);
        for block_num in self.collect_directory_blocks(&inode) {
            match self.read_block(block_num) {
                Ok(block) => {
                    self.process_block(out, &block, depth + 1, path, inode_num, ghost);
                }
                Err(err) => {
                    warn!(
                        "skipping block {} of directory inode {}: {}",
                        block_num, inode_num, err
                    );
                }
            }
        }
        out.visiting.pop();
    }

    /// Data blocks of a directory inode, in on-disk order: direct blocks up
    /// to the first zero, then the single, double and triple indirect trees,
    /// stopping at the first zero pointer on every level.
    fn collect_directory_blocks(&mut self, inode: &Inode) -> Vec<u32> {
        let mut blocks = Vec::new();
        for &block in inode.direct_blocks() {
            if block == 0 {
                break;
            }
            blocks.push(block);
        }
        if inode.single_indirect() != 0 {
            self.collect_indirect_blocks(inode.single_indirect(), 1, &mut blocks);
        }
        if inode.double_indirect() != 0 {
            self.collect_indirect_blocks(inode.double_indirect(), 2, &mut blocks);
        }
        if inode.triple_indirect() != 0 {
            self.collect_indirect_blocks(inode.triple_indirect(), 3, &mut blocks);
        }
        blocks
    }

    /// Recursively collect data-block numbers below an indirect pointer
    /// block. level=1 => singly-indirect, 2 => doubly, 3 => triply.
    fn collect_indirect_blocks(&mut self, block_num: u32, level: u32, results: &mut Vec<u32>) {
        let block = match self.read_block(block_num) {
            Ok(block) => block,
            Err(err) => {
                warn!("skipping indirect block {}: {}", block_num, err);
                return;
            }
        };
        for chunk in block.chunks_exact(4) {
            let ptr = u32::from_le_bytes(chunk.try_into().unwrap());
            if ptr == 0 {
                break;
            }
            if level == 1 {
                results.push(ptr);
            } else {
                self.collect_indirect_blocks(ptr, level - 1, results);
            }
        }
    }

    /// Walk the live record chain of one directory block, carving each
    /// record's slack for ghost residue, then emit: live children first
    /// (directories recurse), ghosts after.
    fn process_block(
        &mut self,
        out: &mut Exploration,
        block: &[u8],
        depth: usize,
        path: &str,
        dir_inode: u32,
        in_ghost: bool,
    ) {
        let mut offset = 0usize;
        let mut active_inodes: HashSet<u32> = HashSet::new();
        let mut active_entries: Vec<(String, u32, bool)> = Vec::new();
        let mut all_ghosts: Vec<GhostEntry> = Vec::new();

        while offset < block.len() {
            let entry = match DirEntry::from_bytes(&block[offset..]) {
                Some(entry) => entry,
                None => break,
            };
            if entry.rec_len == 0 {
                break;
            }

            if entry.inode != 0 && !entry.is_dot() {
                active_inodes.insert(entry.inode);
                match self.get_inode(entry.inode) {
                    Ok(data) => {
                        out.index.record(
                            entry.inode,
                            &data,
                            EntryRecord {
                                full_path: full_path(path, &entry.name),
                                name: entry.name.clone(),
                                parent_inode: dir_inode,
                                ghost: false,
                            },
                        );
                        active_entries.push((
                            entry.name.clone(),
                            entry.inode,
                            entry.file_type == EXT2_FT_DIR,
                        ));
                    }
                    Err(err) => {
                        warn!("skipping entry '{}' (inode {}): {}", entry.name, entry.inode, err);
                    }
                }
            }

            // Ghosts are checked against the live inodes seen so far in this
            // block; a residue record whose inode is still referenced here
            // was never lost.
            let slack = entry.slack_len();
            if slack > 0 {
                let slack_start = offset + DirEntry::aligned_size(entry.name_len);
                for ghost in carve_slack(block, slack_start, slack, self.strict_names) {
                    if active_inodes.contains(&ghost.inode) {
                        continue;
                    }
                    match self.get_inode(ghost.inode) {
                        Ok(data) => {
                            debug!(
                                "ghost entry '{}' (inode {}) in directory inode {}",
                                ghost.name, ghost.inode, dir_inode
                            );
                            out.index.record(
                                ghost.inode,
                                &data,
                                EntryRecord {
                                    full_path: full_path(path, &ghost.name),
                                    name: ghost.name.clone(),
                                    parent_inode: dir_inode,
                                    ghost: true,
                                },
                            );
                            all_ghosts.push(ghost);
                        }
                        Err(err) => {
                            warn!(
                                "skipping ghost entry '{}' (inode {}): {}",
                                ghost.name, ghost.inode, err
                            );
                        }
                    }
                }
            }

            offset += entry.rec_len as usize;
        }

        for (name, child, is_dir) in active_entries {
            if is_dir {
                let child_path = child_prefix(path, &name);
                self.walk_directory(out, child, depth, &child_path, &name, in_ghost);
            } else if !in_ghost {
                // Live files under a ghost directory are not part of the
                // live tree; they stay in the index only.
                out.tree.push(TreeEntry {
                    depth,
                    inode: child,
                    name,
                    is_dir: false,
                    ghost: false,
                });
            }
        }

        for ghost in all_ghosts {
            if ghost.file_type == EXT2_FT_DIR {
                let child_path = child_prefix(path, &ghost.name);
                self.walk_directory(out, ghost.inode, depth, &child_path, &ghost.name, true);
            } else {
                out.tree.push(TreeEntry {
                    depth,
                    inode: ghost.inode,
                    name: ghost.name,
                    is_dir: false,
                    ghost: true,
                });
            }
        }
    }
}

fn full_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        format!("/{}", name)
    } else {
        format!("/{}/{}", prefix, name)
    }
}

fn child_prefix(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}
