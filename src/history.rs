//! Per-inode reference index and the action inference engine.
//!
//! The walk records every live and ghost sighting of each inode. From that,
//! plus the inode's own four clocks and the clocks of the directories the
//! sightings point into, the engine reconstructs a best-effort sequence of
//! `mkdir`/`touch`/`rmdir`/`rm`/`mv` operations. The correlation rules are
//! deliberately lossy; anything they cannot pin down renders as `?`.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Seek, Write};

use crate::inode::Inode;
use crate::Ext2Fs;

/// One sighting of an inode inside some directory block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub full_path: String,
    pub name: String,
    pub parent_inode: u32,
    pub ghost: bool,
}

/// Everything known about one inode after the walk: a snapshot of its
/// on-disk record plus every sighting, in discovery order.
#[derive(Debug, Clone)]
pub struct InodeRecord {
    pub inode_data: Inode,
    pub entries: Vec<EntryRecord>,
}

/// Mapping from inode number to its record, in ascending inode order.
#[derive(Debug, Default)]
pub struct ReferenceIndex {
    map: BTreeMap<u32, InodeRecord>,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first sighting snapshots the inode data; later sightings only
    /// append.
    pub fn record(&mut self, inode_num: u32, data: &Inode, entry: EntryRecord) {
        self.map
            .entry(inode_num)
            .or_insert_with(|| InodeRecord {
                inode_data: data.clone(),
                entries: Vec::new(),
            })
            .entries
            .push(entry);
    }

    pub fn get(&self, inode_num: u32) -> Option<&InodeRecord> {
        self.map.get(&inode_num)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &InodeRecord)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Mkdir,
    Touch,
    Rmdir,
    Rm,
    Mv,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Mkdir => "mkdir",
            ActionKind::Touch => "touch",
            ActionKind::Rmdir => "rmdir",
            ActionKind::Rm => "rm",
            ActionKind::Mv => "mv",
        };
        f.write_str(name)
    }
}

/// One inferred operation. A timestamp of zero means the time is unknown;
/// empty argument paths and zero directory inodes are unknown too, and all
/// three render as `?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub timestamp: u32,
    pub kind: ActionKind,
    pub args: Vec<String>,
    pub affected_dirs: Vec<u32>,
    pub affected_inodes: Vec<u32>,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.timestamp == 0 {
            write!(f, "? {} [", self.kind)?;
        } else {
            write!(f, "{} {} [", self.timestamp, self.kind)?;
        }
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            if arg.is_empty() {
                write!(f, "?")?;
            } else {
                write!(f, "{}", arg)?;
            }
        }
        write!(f, "] [")?;
        for (i, dir) in self.affected_dirs.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            if *dir == 0 {
                write!(f, "?")?;
            } else {
                write!(f, "{}", dir)?;
            }
        }
        write!(f, "] [")?;
        for (i, inode) in self.affected_inodes.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            if *inode == 0 {
                write!(f, "?")?;
            } else {
                write!(f, "{}", inode)?;
            }
        }
        write!(f, "]")
    }
}

/// Write the action log, one action per line.
pub fn render_actions<W: Write>(actions: &[Action], out: &mut W) -> io::Result<()> {
    for action in actions {
        writeln!(out, "{}", action)?;
    }
    Ok(())
}

/// Roles the sightings of one inode play in its history.
#[derive(Debug, Default)]
struct Classification {
    live_count: usize,
    ghost_count: usize,
    /// The live sighting, when the inode is still linked somewhere.
    live: Option<EntryRecord>,
    /// The sighting believed to hold the inode's creation name.
    creation: Option<EntryRecord>,
    /// The sighting believed to hold the final name before removal.
    deletion: Option<EntryRecord>,
    /// An intermediate ghost marking a rename hop.
    other_ghost: Option<EntryRecord>,
}

/// Access and modification time of the directory a sighting points into.
/// An unreadable parent degrades to zeroed clocks, which never match the
/// exact-equality rules below.
fn parent_times<T: Read + Seek>(fs: &mut Ext2Fs<T>, entry: &EntryRecord) -> (u32, u32) {
    match fs.get_inode(entry.parent_inode) {
        Ok(parent) => (parent.i_atime, parent.i_mtime),
        Err(err) => {
            warn!("cannot read parent inode {}: {}", entry.parent_inode, err);
            (0, 0)
        }
    }
}

/// Pick the sighting that holds the creation name: an exact match of the
/// parent's mtime against the inode's atime wins; failing that, a ghost
/// whose parent atime precedes the inode's atime, but only when exactly one
/// sighting qualifies.
fn find_creation<T: Read + Seek>(
    fs: &mut Ext2Fs<T>,
    record: &InodeRecord,
    ghosts_only: bool,
) -> Option<EntryRecord> {
    let atime = record.inode_data.i_atime;
    let mut potential = None;
    let mut qualifying = 0;
    for entry in &record.entries {
        if ghosts_only && !entry.ghost {
            continue;
        }
        let (parent_atime, parent_mtime) = parent_times(fs, entry);
        if parent_mtime == atime {
            return Some(entry.clone());
        }
        if parent_atime < atime {
            qualifying += 1;
            potential = Some(entry.clone());
        }
    }
    if qualifying == 1 {
        potential
    } else {
        None
    }
}

/// Pick the sighting that held the name at removal: exact match of the
/// parent's mtime against the inode's dtime, else the unique sighting whose
/// parent was modified after the deletion.
fn find_deletion<T: Read + Seek>(fs: &mut Ext2Fs<T>, record: &InodeRecord) -> Option<EntryRecord> {
    let dtime = record.inode_data.i_dtime;
    let mut potential = None;
    let mut qualifying = 0;
    for entry in &record.entries {
        let (_, parent_mtime) = parent_times(fs, entry);
        if parent_mtime == dtime {
            return Some(entry.clone());
        }
        if parent_mtime > dtime {
            qualifying += 1;
            potential = Some(entry.clone());
        }
    }
    if qualifying == 1 {
        potential
    } else {
        None
    }
}

/// The last sighting other than `exclude`, used once one end of a rename
/// chain is pinned and the other follows by elimination.
fn last_other(
    record: &InodeRecord,
    exclude: &EntryRecord,
    ghosts_only: bool,
) -> Option<EntryRecord> {
    record
        .entries
        .iter()
        .filter(|e| (!ghosts_only || e.ghost) && *e != exclude)
        .last()
        .cloned()
}

fn classify<T: Read + Seek>(fs: &mut Ext2Fs<T>, record: &InodeRecord) -> Classification {
    let mut classification = Classification::default();
    for entry in &record.entries {
        if entry.ghost {
            classification.ghost_count += 1;
        } else {
            classification.live_count += 1;
            classification.live = Some(entry.clone());
        }
    }

    let data = &record.inode_data;
    match (classification.ghost_count, classification.live_count) {
        (0, 1) => classification.creation = classification.live.clone(),
        (1, 1) => {
            classification.creation = record.entries.iter().find(|e| e.ghost).cloned();
        }
        (2, 1) => {
            classification.creation = find_creation(fs, record, true);
            if let Some(creation) = classification.creation.clone() {
                classification.other_ghost = last_other(record, &creation, true);
            } else {
                // Failing the creation rules, try to pin the rename hop:
                // its parent's mtime matches either the live parent's mtime
                // or the inode's ctime.
                let live_mtime = classification
                    .live
                    .as_ref()
                    .map(|live| parent_times(fs, live).1)
                    .unwrap_or(0);
                for entry in &record.entries {
                    if !entry.ghost {
                        continue;
                    }
                    let (_, parent_mtime) = parent_times(fs, entry);
                    if parent_mtime == live_mtime || parent_mtime == data.i_ctime {
                        classification.other_ghost = Some(entry.clone());
                        break;
                    }
                }
                if let Some(other) = classification.other_ghost.clone() {
                    classification.creation = last_other(record, &other, true);
                }
            }
        }
        (ghosts, 1) if ghosts > 2 => {
            classification.creation = find_creation(fs, record, true);
        }
        (1, 0) => {
            // A single ghost holds both the first and the last name.
            classification.creation = record.entries.first().cloned();
            classification.deletion = classification.creation.clone();
        }
        (2, 0) => {
            classification.creation = find_creation(fs, record, false);
            if let Some(creation) = classification.creation.clone() {
                classification.deletion = last_other(record, &creation, true);
            } else {
                classification.deletion = find_deletion(fs, record);
                if let Some(deletion) = classification.deletion.clone() {
                    classification.creation = last_other(record, &deletion, false);
                }
            }
        }
        (ghosts, 0) if ghosts > 2 => {
            classification.creation = find_creation(fs, record, true);
            classification.deletion = find_deletion(fs, record);
        }
        // Anything else (hard links, empty records) stays unresolved.
        _ => {}
    }

    classification
}

fn path_of(entry: &Option<EntryRecord>) -> String {
    entry
        .as_ref()
        .map(|e| e.full_path.clone())
        .unwrap_or_default()
}

fn dir_of(entry: &Option<EntryRecord>) -> u32 {
    entry.as_ref().map(|e| e.parent_inode).unwrap_or(0)
}

/// Convert the reference index into a timestamp-ordered action log.
///
/// Parent-directory clocks are read back through `fs`; the index itself is
/// not mutated.
pub fn infer_actions<T: Read + Seek>(fs: &mut Ext2Fs<T>, index: &ReferenceIndex) -> Vec<Action> {
    let mut actions = Vec::new();

    for (&inode_num, record) in index.iter() {
        let info = classify(fs, record);
        let data = &record.inode_data;
        let is_dir = data.is_dir();

        // Every inode gets exactly one creation event, stamped with its
        // access time.
        actions.push(Action {
            timestamp: data.i_atime,
            kind: if is_dir {
                ActionKind::Mkdir
            } else {
                ActionKind::Touch
            },
            args: vec![path_of(&info.creation)],
            affected_dirs: vec![dir_of(&info.creation)],
            affected_inodes: vec![inode_num],
        });

        if info.ghost_count == 0 {
            continue;
        }

        if data.i_dtime != 0 {
            actions.push(Action {
                timestamp: data.i_dtime,
                kind: if is_dir { ActionKind::Rmdir } else { ActionKind::Rm },
                args: vec![path_of(&info.deletion)],
                affected_dirs: vec![dir_of(&info.deletion)],
                affected_inodes: vec![inode_num],
            });

            if info.ghost_count == 2 && info.creation.is_some() && info.deletion.is_some() {
                if let (Some(creation), Some(deletion)) = (&info.creation, &info.deletion) {
                    actions.push(Action {
                        timestamp: 0,
                        kind: ActionKind::Mv,
                        args: vec![creation.full_path.clone(), deletion.full_path.clone()],
                        affected_dirs: vec![creation.parent_inode, deletion.parent_inode],
                        affected_inodes: vec![inode_num],
                    });
                }
            } else if info.ghost_count > 1 && info.creation.is_none() {
                if let Some(deletion) = &info.deletion {
                    // The final hop is known; every other ghost left for
                    // somewhere unknown.
                    actions.push(Action {
                        timestamp: 0,
                        kind: ActionKind::Mv,
                        args: vec!["?".to_string(), deletion.full_path.clone()],
                        affected_dirs: vec![0, deletion.parent_inode],
                        affected_inodes: vec![inode_num],
                    });
                    for entry in &record.entries {
                        if entry.ghost && entry != deletion {
                            actions.push(Action {
                                timestamp: 0,
                                kind: ActionKind::Mv,
                                args: vec![entry.full_path.clone(), "?".to_string()],
                                affected_dirs: vec![entry.parent_inode, 0],
                                affected_inodes: vec![inode_num],
                            });
                        }
                    }
                } else {
                    for entry in &record.entries {
                        if entry.ghost && parent_times(fs, entry).1 != data.i_dtime {
                            actions.push(Action {
                                timestamp: 0,
                                kind: ActionKind::Mv,
                                args: vec![entry.full_path.clone(), "?".to_string()],
                                affected_dirs: vec![entry.parent_inode, 0],
                                affected_inodes: vec![inode_num],
                            });
                        }
                    }
                }
            }
        } else if info.ghost_count == 1 && info.live_count == 1 {
            // One rename from the ghost name to the live one. The inode's
            // ctime carries it only when distinct from its mtime.
            if let (Some(ghost), Some(live)) =
                (record.entries.iter().find(|e| e.ghost), &info.live)
            {
                let timestamp = if data.i_ctime != data.i_mtime {
                    data.i_ctime
                } else {
                    0
                };
                actions.push(Action {
                    timestamp,
                    kind: ActionKind::Mv,
                    args: vec![ghost.full_path.clone(), live.full_path.clone()],
                    affected_dirs: vec![ghost.parent_inode, live.parent_inode],
                    affected_inodes: vec![inode_num],
                });
            }
        } else if info.ghost_count == 2 && info.creation.is_some() && info.other_ghost.is_some() {
            if let (Some(creation), Some(other), Some(live)) =
                (&info.creation, &info.other_ghost, &info.live)
            {
                actions.push(Action {
                    timestamp: 0,
                    kind: ActionKind::Mv,
                    args: vec![creation.full_path.clone(), other.full_path.clone()],
                    affected_dirs: vec![creation.parent_inode, other.parent_inode],
                    affected_inodes: vec![inode_num],
                });

                let other_mtime = parent_times(fs, other).1;
                let live_mtime = parent_times(fs, live).1;
                let timestamp = if other_mtime == live_mtime || other_mtime == data.i_ctime {
                    other_mtime
                } else if data.i_ctime != data.i_mtime {
                    data.i_ctime
                } else {
                    0
                };
                actions.push(Action {
                    timestamp,
                    kind: ActionKind::Mv,
                    args: vec![other.full_path.clone(), live.full_path.clone()],
                    affected_dirs: vec![other.parent_inode, live.parent_inode],
                    affected_inodes: vec![inode_num],
                });
            }
        } else if let Some(live) = &info.live {
            // Several ghosts against one live name: pair each ghost whose
            // parent mtime lines up with the live parent or the inode ctime;
            // the rest leave for an unknown destination.
            let live_mtime = parent_times(fs, live).1;
            let mut matched_live = false;
            for entry in &record.entries {
                if !entry.ghost {
                    continue;
                }
                let (_, parent_mtime) = parent_times(fs, entry);
                if parent_mtime == live_mtime || parent_mtime == data.i_ctime {
                    matched_live = true;
                    actions.push(Action {
                        timestamp: parent_mtime,
                        kind: ActionKind::Mv,
                        args: vec![entry.full_path.clone(), live.full_path.clone()],
                        affected_dirs: vec![entry.parent_inode, live.parent_inode],
                        affected_inodes: vec![inode_num],
                    });
                } else {
                    actions.push(Action {
                        timestamp: 0,
                        kind: ActionKind::Mv,
                        args: vec![entry.full_path.clone(), "?".to_string()],
                        affected_dirs: vec![entry.parent_inode, 0],
                        affected_inodes: vec![inode_num],
                    });
                }
            }
            if !matched_live {
                let timestamp = if data.i_ctime != data.i_mtime {
                    data.i_ctime
                } else {
                    0
                };
                actions.push(Action {
                    timestamp,
                    kind: ActionKind::Mv,
                    args: vec!["?".to_string(), live.full_path.clone()],
                    affected_dirs: vec![0, live.parent_inode],
                    affected_inodes: vec![inode_num],
                });
            }
        }
        // A ghost-only inode without a deletion stamp gives no anchor to
        // hang a move on; only its creation event is emitted.
    }

    // Unknown (zero) timestamps sort to the front; the sort is stable, so
    // per-inode emission order survives inside equal stamps.
    actions.sort_by_key(|action| action.timestamp);
    actions
}
