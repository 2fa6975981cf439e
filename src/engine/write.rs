//! zonekv - Write Path
//! Writers queue up; the writer at the front becomes the leader, coalesces the
//! batches behind it into one WAL record, applies them to the MemTable and
//! hands every coalesced writer its result.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::MutexGuard;

use crate::error::{Error, Result};
use crate::types::{Key, ValueRecord};
use crate::zoned::FileId;

use super::batch::WriteBatch;
use super::memtable::MemTable;
use super::wal::LogWriter;
use super::{EngineInner, EngineState};

/// A group starting with a small batch only grows by this much.
const SMALL_BATCH: usize = 128 * 1024;

pub(crate) enum WriteRequest {
    Batch(WriteBatch),
    /// Freeze the active MemTable even if it has room left.
    SwitchMemtable,
}

struct PendingWrite {
    ticket: u64,
    request: Option<WriteRequest>,
    durable: bool,
}

/// FIFO of waiting writers plus results handed back by leaders.
#[derive(Default)]
pub(crate) struct WriteQueue {
    next_ticket: u64,
    pending: VecDeque<PendingWrite>,
    finished: HashMap<u64, Result<usize>>,
}

/// Requests a leader took from the queue.
enum Group {
    Switch,
    Batches {
        batches: Vec<WriteBatch>,
        durable: bool,
    },
}

impl WriteQueue {
    /// Take the front request and as many followers as fit into one group.
    /// Returns the group and the ticket of its last member.
    fn take_group(&mut self, max_coalesced: usize) -> Option<(Group, u64)> {
        let front = self.pending.front_mut()?;
        let durable = front.durable;
        let first = match front.request.take()? {
            WriteRequest::SwitchMemtable => return Some((Group::Switch, front.ticket)),
            WriteRequest::Batch(batch) => batch,
        };
        let mut last_ticket = front.ticket;
        let mut size = first.approximate_size();
        let max_size = if size <= SMALL_BATCH {
            (size + SMALL_BATCH).min(max_coalesced)
        } else {
            max_coalesced
        };
        let mut batches = vec![first];
        for follower in self.pending.iter_mut().skip(1) {
            // A durable write never rides in a group that will not be synced.
            if follower.durable && !durable {
                break;
            }
            let Some(WriteRequest::Batch(batch)) = &follower.request else {
                break;
            };
            if size + batch.approximate_size() > max_size {
                break;
            }
            size += batch.approximate_size();
            if let Some(WriteRequest::Batch(batch)) = follower.request.take() {
                batches.push(batch);
            }
            last_ticket = follower.ticket;
        }
        Some((Group::Batches { batches, durable }, last_ticket))
    }
}

impl EngineInner {
    /// Queue `request` and wait for it to be applied. For a batch, returns how
    /// many of its entries were applied; conditional entries whose expectation
    /// failed are skipped.
    pub(crate) fn write_request(&self, request: WriteRequest, durable: bool) -> Result<usize> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        let mut queue = self.writers.lock();
        let ticket = queue.next_ticket;
        queue.next_ticket += 1;
        queue.pending.push_back(PendingWrite {
            ticket,
            request: Some(request),
            durable,
        });
        loop {
            if let Some(result) = queue.finished.remove(&ticket) {
                return result;
            }
            if queue.pending.front().map(|p| p.ticket) == Some(ticket) {
                break;
            }
            self.writers_cv.wait(&mut queue);
        }

        let Some((group, last_ticket)) = queue.take_group(self.ctx.config.max_coalesced_write) else {
            return Err(Error::InvalidArgument("write queue lost a request".into()));
        };
        drop(queue);
        let results = match group {
            Group::Switch => self.switch_request().map(|()| vec![0]),
            Group::Batches { batches, durable } => self.lead_write(batches, durable),
        };

        let mut queue = self.writers.lock();
        let mut own = Err(Error::ShuttingDown);
        let mut index = 0;
        while let Some(member) = queue.pending.pop_front() {
            let result = match &results {
                Ok(applied) => Ok(applied.get(index).copied().unwrap_or(0)),
                Err(err) => Err(err.clone()),
            };
            index += 1;
            if member.ticket == ticket {
                own = result;
            } else {
                queue.finished.insert(member.ticket, result);
            }
            if member.ticket == last_ticket {
                break;
            }
        }
        self.writers_cv.notify_all();
        own
    }

    fn switch_request(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.make_room(&mut state, true)
    }

    /// Apply a group of batches as one WAL record. Returns the applied entry
    /// count of every batch, in order.
    fn lead_write(&self, batches: Vec<WriteBatch>, durable: bool) -> Result<Vec<usize>> {
        let mut state = self.state.lock();
        self.make_room(&mut state, false)?;
        let last_sequence = state.versions.last_sequence();
        let mem = Arc::clone(&state.mem);
        drop(state);

        let mut applied = Vec::with_capacity(batches.len());
        let mut merged = WriteBatch::new();
        let mut written: HashSet<Key> = HashSet::new();
        for mut batch in batches {
            if batch.has_conditions() {
                self.check_conditions(&mut batch, &written, last_sequence)?;
            }
            written.extend(batch.entries().iter().map(|e| e.key.clone()));
            applied.push(batch.len());
            merged.append(&batch);
        }
        if merged.is_empty() {
            return Ok(applied);
        }

        merged.set_sequence(last_sequence + 1);
        let record = merged.encode();
        let logged = {
            let mut log = self.log.lock();
            log.add_record(&record)
                .and_then(|()| if durable { log.sync() } else { Ok(()) })
        };
        if let Err(err) = logged {
            let mut state = self.state.lock();
            self.record_background_error(&mut state, err.clone());
            return Err(err);
        }
        mem.apply(&merged);
        self.state
            .lock()
            .versions
            .set_last_sequence(last_sequence + merged.len() as u64);
        self.metrics.record_group_commit();
        Ok(applied)
    }

    /// Drop conditional entries whose key was written earlier in the group or
    /// no longer points at the expected value reference.
    fn check_conditions(
        &self,
        batch: &mut WriteBatch,
        written: &HashSet<Key>,
        sequence: u64,
    ) -> Result<()> {
        let (view, _) = self.read_view();
        let mut keep = Vec::with_capacity(batch.len());
        for entry in batch.entries() {
            let ok = match &entry.expected {
                None => true,
                Some(_) if written.contains(&entry.key) => false,
                Some(expected) => {
                    let current = self.lookup(&view, &entry.key, sequence)?;
                    current == Some(ValueRecord::External(*expected))
                }
            };
            keep.push(ok);
        }
        let mut flags = keep.into_iter();
        batch.retain(|_| flags.next().unwrap_or(false));
        Ok(())
    }

    /// Ensure the active MemTable can take a write, stalling or switching to a
    /// new MemTable and WAL as needed. With `force` a non-empty MemTable is
    /// switched even if it has room.
    pub(crate) fn make_room(
        &self,
        state: &mut MutexGuard<'_, EngineState>,
        force: bool,
    ) -> Result<()> {
        let config = &self.ctx.config;
        let mut allow_delay = !force;
        let mut force = force;
        loop {
            if self.is_shutting_down() {
                return Err(Error::ShuttingDown);
            }
            if let Some(err) = &state.bg_error {
                if err.halts_background() {
                    return Err(err.clone());
                }
            }
            if let Err(err @ Error::FatalCorruption(_)) = self.ctx.store.superblock_status() {
                return Err(err);
            }
            let level0 = state.versions.num_level_files(0);
            if allow_delay && level0 >= config.l0_slowdown_trigger {
                // Spread the delay over many writes instead of stalling one.
                let excess = (level0 - config.l0_slowdown_trigger + 1) as u64;
                let delay = Duration::from_millis((10 * excess).min(500));
                self.metrics.record_slowdown();
                MutexGuard::unlocked(state, || std::thread::sleep(delay));
                allow_delay = false;
            } else if !force
                && state.mem.size() <= config.write_buffer_size
                && state.mem.table_size() as u64 <= config.max_file_size
            {
                break;
            } else if state.imm.is_some() || level0 >= config.l0_stop_trigger {
                if let Some(err) = &state.bg_error {
                    if err.is_no_space() {
                        return Err(err.clone());
                    }
                }
                log::debug!(
                    "Write stalled: imm pending {}, {} level-0 files",
                    state.imm.is_some(),
                    level0
                );
                self.metrics.record_stall();
                self.maybe_schedule(state);
                self.bg_cv.wait_for(state, config.background_tick);
            } else if force && state.mem.is_empty() {
                break;
            } else {
                self.switch_memtable(state)?;
                force = false;
                self.maybe_schedule(state);
            }
        }
        Ok(())
    }

    /// Freeze the active MemTable and start a new one backed by a new WAL.
    fn switch_memtable(&self, state: &mut EngineState) -> Result<()> {
        let number = self.ctx.numbers.next();
        let writer = LogWriter::create(Arc::clone(&self.ctx.store), FileId::log(number))?;
        let old = std::mem::replace(&mut *self.log.lock(), writer);
        // The frozen MemTable lives only in the old log until it is flushed.
        if let Err(err) = old.sync().and_then(|()| old.close()) {
            log::warn!("Closing log {} failed: {}", old.id().number, err);
        }
        let frozen = std::mem::replace(
            &mut state.mem,
            Arc::new(MemTable::new(self.ctx.config.value_threshold)),
        );
        log::debug!(
            "Switched to log {}: frozen MemTable holds {} entries, {} bytes",
            number,
            frozen.len(),
            frozen.size()
        );
        state.imm = Some(frozen);
        state.log_number = number;
        self.has_imm.store(true, Ordering::Release);
        Ok(())
    }
}
