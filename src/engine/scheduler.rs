//! zonekv - Background Scheduling
//! Decides which background job starts next.
//!
//! Two slots exist: the compaction worker runs flushes, compactions and table
//! zone defragmentation one at a time; the defragmentation worker moves values
//! out of sparse value files independently. The decision itself is the pure
//! function [`next_action`], fed by a snapshot of engine state.

/// What a worker slot is busy with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Activity {
    #[default]
    Idle,
    Flushing,
    Compacting,
    DefragmentingFiles,
    DefragmentingValues,
}

/// Job to start next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Write the immutable MemTable to level 0.
    Flush,
    /// Run a manual or picked compaction.
    Compact,
    /// Reclaim fragmented table zones.
    DefragmentFiles,
    /// Empty the sparsest value file.
    DefragmentValues,
    /// Nothing can or needs to start now.
    Wait,
}

impl Action {
    pub fn activity(self) -> Activity {
        match self {
            Action::Flush => Activity::Flushing,
            Action::Compact => Activity::Compacting,
            Action::DefragmentFiles => Activity::DefragmentingFiles,
            Action::DefragmentValues => Activity::DefragmentingValues,
            Action::Wait => Activity::Idle,
        }
    }

    /// Whether the job runs on the compaction worker.
    pub fn uses_compaction_slot(self) -> bool {
        matches!(self, Action::Flush | Action::Compact | Action::DefragmentFiles)
    }
}

/// Scheduling state kept by the engine between decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerState {
    /// Job of the compaction worker.
    pub compaction_slot: Activity,
    /// Job of the defragmentation worker.
    pub value_slot: Activity,
    /// Under high disk usage, compaction and defragmentation take turns;
    /// set after a compaction was started.
    pub defrag_turn: bool,
}

impl SchedulerState {
    /// Record that `action` was dispatched.
    pub fn start(&mut self, action: Action) {
        match action {
            Action::Wait => {}
            Action::DefragmentValues => {
                self.value_slot = Activity::DefragmentingValues;
                self.defrag_turn = false;
            }
            Action::DefragmentFiles => {
                self.compaction_slot = Activity::DefragmentingFiles;
                self.defrag_turn = false;
            }
            Action::Compact => {
                self.compaction_slot = Activity::Compacting;
                self.defrag_turn = true;
            }
            Action::Flush => self.compaction_slot = Activity::Flushing,
        }
    }

    /// Record that the job started by `action` ended.
    pub fn finish(&mut self, action: Action) {
        if action.uses_compaction_slot() {
            self.compaction_slot = Activity::Idle;
        } else if action == Action::DefragmentValues {
            self.value_slot = Activity::Idle;
        }
    }

    pub fn is_busy(&self) -> bool {
        self.compaction_slot != Activity::Idle || self.value_slot != Activity::Idle
    }
}

/// Engine facts a decision depends on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerMetrics {
    pub shutting_down: bool,
    /// A background error that stops all scheduling is recorded.
    pub halted: bool,
    pub imm_pending: bool,
    pub manual_compaction: bool,
    pub needs_compaction: bool,
    /// No write arrived for a while.
    pub idle: bool,
    pub high_disk_usage: bool,
    pub good_superblocks: usize,
    /// Table zones below the live-ratio threshold.
    pub fragmented_zones: usize,
    /// Some closed value file is sparse enough to defragment.
    pub value_candidate: bool,
}

impl SchedulerMetrics {
    fn may_defragment(&self) -> bool {
        (self.idle || self.high_disk_usage) && self.good_superblocks > 1
    }

    fn files_fragmented(&self) -> bool {
        self.fragmented_zones >= 2
    }
}

/// Choose the next job given the current slots and engine facts.
pub fn next_action(state: &SchedulerState, metrics: &SchedulerMetrics) -> Action {
    if metrics.shutting_down || metrics.halted {
        return Action::Wait;
    }
    let values_free = state.value_slot == Activity::Idle;
    let value_job = values_free && metrics.value_candidate && metrics.may_defragment();

    if state.compaction_slot != Activity::Idle {
        return if value_job {
            Action::DefragmentValues
        } else {
            Action::Wait
        };
    }
    if metrics.imm_pending {
        return Action::Flush;
    }
    let compaction_due = metrics.manual_compaction || metrics.needs_compaction;
    let defrag_first = !compaction_due || (metrics.high_disk_usage && state.defrag_turn);
    if defrag_first && metrics.may_defragment() {
        if metrics.files_fragmented() {
            return Action::DefragmentFiles;
        }
        if value_job {
            return Action::DefragmentValues;
        }
    }
    if compaction_due {
        return Action::Compact;
    }
    Action::Wait
}
