//! zonekv - Space Reclamation
//! Deletes files no version needs any more, compacts fragmented table zones
//! and empties sparse value files by rewriting their live values.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{FileNumber, ValueRecord, ValueReference};
use crate::zoned::{FileId, FileKind};

use super::batch::WriteBatch;
use super::value::ValueMover;
use super::write::WriteRequest;
use super::{EngineInner, EngineState};

impl EngineInner {
    /// Delete tables, logs, manifests and value files nothing references.
    pub(crate) fn collect_obsolete_files(&self, state: &mut EngineState) {
        let store = &self.ctx.store;
        let live_tables = state.versions.live_tables();
        let referenced_values = state.versions.referenced_value_files();
        let flushed_log = state.versions.log_number();
        let manifest = state.versions.manifest_number();

        let mut doomed: Vec<FileId> = Vec::new();
        for number in store.list_files(FileKind::Table) {
            if !live_tables.contains(&number) && !state.pending_outputs.contains(&number) {
                self.ctx.tables.evict(number);
                doomed.push(FileId::table(number));
            }
        }
        for number in store.list_files(FileKind::Log) {
            if number < flushed_log && number != state.log_number {
                doomed.push(FileId::log(number));
            }
        }
        for number in store.list_files(FileKind::Manifest) {
            if Some(number) != manifest {
                doomed.push(FileId::manifest(number));
            }
        }
        for number in store.list_files(FileKind::Value) {
            let keep = state.versions.value_file_stats().contains_key(&number)
                || referenced_values.contains(&number)
                || state.pending_outputs.contains(&number)
                || self.ctx.values.is_writable(number);
            if !keep {
                self.ctx.values.remove_readable(number);
                state.moved_value_files.remove(&number);
                self.metrics.record_value_file_reclaimed();
                log::info!("Reclaiming value file {}", number);
                doomed.push(FileId::value(number));
            }
        }

        for id in doomed {
            match store.delete(id) {
                Ok(()) => log::debug!("Deleted obsolete {:?}", id),
                Err(err) => log::warn!("Deleting obsolete {:?} failed: {}", id, err),
            }
        }
    }

    /// Compact table zones whose live fraction fell below the threshold.
    pub(crate) fn defragment_files(&self) -> Result<()> {
        let reclaimed = self
            .ctx
            .store
            .defragment(self.ctx.config.defrag_live_ratio, &self.shutdown)?;
        self.metrics.record_zones_reclaimed(reclaimed);
        log::info!("Table defragmentation reclaimed {} zone(s)", reclaimed);
        Ok(())
    }

    /// Closed value file with the lowest live fraction below the threshold.
    pub(crate) fn value_defrag_candidate(&self, state: &EngineState) -> Option<FileNumber> {
        let threshold = self.ctx.config.defrag_live_ratio;
        state
            .versions
            .value_file_stats()
            .iter()
            .filter(|(number, stats)| {
                stats.total > 0
                    && !stats.fully_deleted()
                    && stats.live_ratio() < threshold
                    && !state.moved_value_files.contains(*number)
                    && !self.ctx.values.is_writable(**number)
            })
            .min_by(|a, b| a.1.live_ratio().total_cmp(&b.1.live_ratio()))
            .map(|(number, _)| *number)
    }

    /// Move every live value out of the sparsest value file. The file is
    /// deleted once compactions drop the references the moves superseded.
    pub(crate) fn defragment_values(&self) -> Result<()> {
        let candidate = {
            let state = self.state.lock();
            self.value_defrag_candidate(&state)
        };
        let Some(number) = candidate else {
            return Err(Error::NotAttempted("no sparse value file".into()));
        };
        let mover = ValueMover::new(Arc::clone(&self.ctx.values), number);
        let result = mover.run(&self.shutdown, |key, reference| self.rewrite_value(key, reference));

        let mut state = self.state.lock();
        match result {
            Ok(stats) => {
                state.moved_value_files.insert(number);
                self.metrics.record_values_moved(stats.moved);
                Ok(())
            }
            Err(Error::ShuttingDown) => Err(Error::ShuttingDown),
            // Dropped from the catalog while being read: nothing left to move.
            Err(err) if !state.versions.value_file_stats().contains_key(&number) => {
                log::debug!("Value file {} vanished during defragmentation: {}", number, err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Write `key` again with its current value, unless the key was updated
    /// since the value at `reference` was stored. Returns whether it moved.
    fn rewrite_value(&self, key: &[u8], reference: &ValueReference) -> Result<bool> {
        let (view, sequence) = self.read_view();
        let current = self.lookup(&view, key, sequence)?;
        if current != Some(ValueRecord::External(*reference)) {
            return Ok(false);
        }
        let value = self
            .ctx
            .values
            .get_readable(reference.file_number)?
            .read(reference)?;
        let mut batch = WriteBatch::new();
        batch.put_if(key.to_vec(), value, *reference);
        // The write leader checks the reference again, so a racing update wins.
        let applied = self.write_request(WriteRequest::Batch(batch), false)?;
        Ok(applied > 0)
    }
}
