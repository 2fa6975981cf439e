//! zonekv - Compaction Picking
//! Chooses which sorted files to merge into the next level.
//!
//! ## Leveled Strategy
//! - Level 0 holds whole flushed memtables and may overlap; deeper levels hold
//!   disjoint key ranges and grow ten times per level
//! - A level whose score (file count for level 0, bytes over budget deeper)
//!   reaches 1 is compacted first, rotating through its key space with a
//!   per-level compact pointer
//! - Otherwise a table that used up its seek budget is compacted
//! - A compaction whose single input overlaps nothing below is a trivial move

use std::sync::Arc;

use crate::types::InternalKey;

use super::version::{FileMetaData, Version, VersionEdit, VersionSet, NUM_LEVELS};

/// Output files stop growing once they overlap this many bytes of level+2.
fn max_grandparent_overlap(max_file_size: u64) -> u64 {
    10 * max_file_size
}

/// Upper bound of a compaction after growing its level inputs.
fn expanded_compaction_limit(max_file_size: u64) -> u64 {
    25 * max_file_size
}

/// Smallest and largest internal key over `files`.
fn key_range<'a>(files: impl IntoIterator<Item = &'a Arc<FileMetaData>>) -> Option<(InternalKey, InternalKey)> {
    let mut range: Option<(InternalKey, InternalKey)> = None;
    for file in files {
        range = Some(match range {
            None => (file.smallest.clone(), file.largest.clone()),
            Some((smallest, largest)) => (
                smallest.min(file.smallest.clone()),
                largest.max(file.largest.clone()),
            ),
        });
    }
    range
}

/// Pull in files of the same level that continue the largest user key of
/// `inputs`, so no older version of that key stays behind a newer one moved
/// down a level.
fn add_boundary_inputs(level_files: &[Arc<FileMetaData>], inputs: &mut Vec<Arc<FileMetaData>>) {
    let Some((_, mut largest)) = key_range(inputs.iter()) else {
        return;
    };
    loop {
        let next = level_files
            .iter()
            .filter(|f| f.smallest > largest && f.smallest.user_key == largest.user_key)
            .min_by(|a, b| a.smallest.cmp(&b.smallest));
        match next {
            Some(file) => {
                largest = file.largest.clone();
                inputs.push(Arc::clone(file));
            }
            None => return,
        }
    }
}

fn total_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

/// One planned merge of `inputs[0]` (at `level`) with `inputs[1]` (at `level + 1`).
pub struct Compaction {
    pub level: usize,
    pub inputs: [Vec<Arc<FileMetaData>>; 2],
    pub input_version: Arc<Version>,
    pub edit: VersionEdit,
    pub max_output_file_size: u64,
    /// Compact pointer of `level` before this compaction moved it.
    pub previous_pointer: Option<InternalKey>,
    pub manual: bool,
    grandparents: Vec<Arc<FileMetaData>>,
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,
    /// Per level, the first file that may still contain the key being checked.
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    fn new(level: usize, version: Arc<Version>, max_file_size: u64) -> Self {
        Self {
            level,
            inputs: [Vec::new(), Vec::new()],
            input_version: version,
            edit: VersionEdit::new(),
            max_output_file_size: max_file_size,
            previous_pointer: None,
            manual: false,
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    pub fn input_bytes(&self) -> u64 {
        total_size(&self.inputs[0]) + total_size(&self.inputs[1])
    }

    /// A single input file that can move down a level without rewriting.
    pub fn is_trivial_move(&self) -> bool {
        self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && total_size(&self.grandparents) <= max_grandparent_overlap(self.max_output_file_size)
    }

    /// Record the deletion of every input in the edit.
    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for file in &self.inputs[which] {
                self.edit.delete_file(self.level + which, file.number);
            }
        }
    }

    /// True when no level below the output level can hold `user_key`, so a
    /// deletion marker for it may be dropped.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        for level in self.level + 2..NUM_LEVELS {
            let files = self.input_version.files(level);
            while self.level_ptrs[level] < files.len() {
                let file = &files[self.level_ptrs[level]];
                if user_key <= file.largest.user_key.as_slice() {
                    if user_key >= file.smallest.user_key.as_slice() {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// Whether the current output should end before `key` because it already
    /// overlaps too much of level+2.
    pub fn should_stop_before(&mut self, key: &InternalKey) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && *key > self.grandparents[self.grandparent_index].largest
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;
        if self.overlapped_bytes > max_grandparent_overlap(self.max_output_file_size) {
            self.overlapped_bytes = 0;
            return true;
        }
        false
    }

    /// Largest key of the level inputs; manual compactions resume after it.
    pub fn input0_largest(&self) -> Option<InternalKey> {
        key_range(&self.inputs[0]).map(|(_, largest)| largest)
    }
}

impl VersionSet {
    /// Size-triggered compaction first, then seek-triggered.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let version = self.current();
        let mut compaction = if version.compaction_score >= 1.0 {
            let level = version.compaction_level;
            let mut c = Compaction::new(level, Arc::clone(&version), self.max_file_size);
            let pointer = self.compact_pointers[level].clone();
            let first = version
                .files(level)
                .iter()
                .find(|f| pointer.as_ref().map_or(true, |p| f.largest > *p))
                .or_else(|| version.files(level).first())?;
            c.inputs[0].push(Arc::clone(first));
            c
        } else if let Some((level, file)) = version.file_to_compact() {
            let mut c = Compaction::new(level, Arc::clone(&version), self.max_file_size);
            c.inputs[0].push(file);
            c
        } else {
            return None;
        };

        if compaction.level == 0 {
            let (smallest, largest) = key_range(&compaction.inputs[0])?;
            compaction.inputs[0] = version.overlapping_inputs(
                0,
                Some(&smallest.user_key),
                Some(&largest.user_key),
            );
        }
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Compaction of `level` files overlapping `[begin, end]`, or `None` if
    /// the level has nothing there.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Option<Compaction> {
        if level + 1 >= NUM_LEVELS {
            return None;
        }
        let version = self.current();
        let mut inputs = version.overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }
        // Deeper levels are compacted a bounded chunk at a time.
        if level > 0 {
            let limit = self.max_file_size;
            let mut total = 0;
            let mut keep = inputs.len();
            for (index, file) in inputs.iter().enumerate() {
                total += file.size;
                if total >= limit {
                    keep = index + 1;
                    break;
                }
            }
            inputs.truncate(keep);
        }
        let mut compaction = Compaction::new(level, version, self.max_file_size);
        compaction.manual = true;
        compaction.inputs[0] = inputs;
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let level = c.level;
        let version = Arc::clone(&c.input_version);
        add_boundary_inputs(version.files(level), &mut c.inputs[0]);
        let Some((smallest, largest)) = key_range(&c.inputs[0]) else {
            return;
        };
        c.inputs[1] =
            version.overlapping_inputs(level + 1, Some(&smallest.user_key), Some(&largest.user_key));
        add_boundary_inputs(version.files(level + 1), &mut c.inputs[1]);
        let (mut all_start, mut all_limit) =
            key_range(c.inputs[0].iter().chain(c.inputs[1].iter())).unwrap_or((smallest.clone(), largest.clone()));
        let mut largest = largest;

        // Grow the level inputs if that does not pull in more level+1 files.
        if !c.inputs[1].is_empty() {
            let mut expanded0 = version.overlapping_inputs(
                level,
                Some(&all_start.user_key),
                Some(&all_limit.user_key),
            );
            add_boundary_inputs(version.files(level), &mut expanded0);
            let inputs1_size = total_size(&c.inputs[1]);
            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + total_size(&expanded0) < expanded_compaction_limit(c.max_output_file_size)
            {
                if let Some((new_start, new_limit)) = key_range(&expanded0) {
                    let mut expanded1 = version.overlapping_inputs(
                        level + 1,
                        Some(&new_start.user_key),
                        Some(&new_limit.user_key),
                    );
                    add_boundary_inputs(version.files(level + 1), &mut expanded1);
                    if expanded1.len() == c.inputs[1].len() {
                        log::debug!(
                            "Expanding compaction at level {}: {}+{} to {}+{} files",
                            level,
                            c.inputs[0].len(),
                            c.inputs[1].len(),
                            expanded0.len(),
                            expanded1.len()
                        );
                        largest = new_limit;
                        c.inputs[0] = expanded0;
                        c.inputs[1] = expanded1;
                        if let Some((start, limit)) =
                            key_range(c.inputs[0].iter().chain(c.inputs[1].iter()))
                        {
                            all_start = start;
                            all_limit = limit;
                        }
                    }
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            c.grandparents = version.overlapping_inputs(
                level + 2,
                Some(&all_start.user_key),
                Some(&all_limit.user_key),
            );
        }

        // Next compaction of this level starts after this one.
        c.previous_pointer = self.compact_pointers[level].replace(largest.clone());
        c.edit.compact_pointers.push((level, largest));
    }

    /// Undo the pointer move of a compaction that did not complete.
    pub fn revert_compact_pointer(&mut self, c: &Compaction) {
        self.compact_pointers[c.level] = c.previous_pointer.clone();
    }

    /// Levels that hold files overlapping `[begin, end]`, deepest excluded.
    pub fn levels_overlapping(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Vec<usize> {
        let version = self.current();
        (0..NUM_LEVELS - 1)
            .filter(|level| version.overlaps_level(*level, begin, end))
            .collect()
    }
}
