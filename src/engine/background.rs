//! zonekv - Background Workers
//! Two threads run background jobs: the compaction worker (flush, compaction,
//! table zone defragmentation) and the value worker (value file
//! defragmentation). Jobs are dispatched over channels by `maybe_schedule`;
//! the compaction worker also wakes on a tick so idle-time work gets started.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::error::{Error, Result};

use super::scheduler::{next_action, Action, SchedulerMetrics};
use super::{EngineInner, EngineState};

pub(crate) enum Work {
    Run(Action),
    Shutdown,
}

/// Senders to both workers.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    compaction: Sender<Work>,
    values: Sender<Work>,
}

impl Dispatcher {
    pub fn channels() -> (Self, Receiver<Work>, Receiver<Work>) {
        let (compaction, compaction_rx) = crossbeam_channel::unbounded();
        let (values, values_rx) = crossbeam_channel::unbounded();
        (Self { compaction, values }, compaction_rx, values_rx)
    }

    /// Hand `action` to the worker owning its slot.
    fn send(&self, action: Action) -> bool {
        let tx = if action.uses_compaction_slot() {
            &self.compaction
        } else {
            &self.values
        };
        tx.send(Work::Run(action)).is_ok()
    }

    fn shutdown(&self) {
        let _ = self.compaction.send(Work::Shutdown);
        let _ = self.values.send(Work::Shutdown);
    }
}

pub(crate) struct Workers {
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    pub fn spawn(
        inner: &Arc<EngineInner>,
        compaction_rx: Receiver<Work>,
        values_rx: Receiver<Work>,
    ) -> Result<Self> {
        let this = Arc::clone(inner);
        let compaction = std::thread::Builder::new()
            .name("zonekv-compaction".into())
            .spawn(move || compaction_worker(this, compaction_rx))?;
        let this = Arc::clone(inner);
        let values = std::thread::Builder::new()
            .name("zonekv-values".into())
            .spawn(move || value_worker(this, values_rx))?;
        Ok(Self {
            handles: vec![compaction, values],
        })
    }

    /// Ask both workers to exit and wait for them.
    pub fn stop(self, dispatch: &Dispatcher) {
        dispatch.shutdown();
        for handle in self.handles {
            if handle.join().is_err() {
                log::error!("A background worker panicked");
            }
        }
    }
}

fn compaction_worker(inner: Arc<EngineInner>, rx: Receiver<Work>) {
    let ticker = crossbeam_channel::tick(inner.ctx.config.background_tick);
    loop {
        crossbeam_channel::select! {
            recv(rx) -> work => match work {
                Ok(Work::Run(action)) => inner.run_job(action),
                Ok(Work::Shutdown) | Err(_) => break,
            },
            recv(ticker) -> _ => inner.schedule(),
        }
    }
    log::debug!("Compaction worker stopped");
}

fn value_worker(inner: Arc<EngineInner>, rx: Receiver<Work>) {
    for work in rx.iter() {
        match work {
            Work::Run(action) => inner.run_job(action),
            Work::Shutdown => break,
        }
    }
    log::debug!("Value worker stopped");
}

impl EngineInner {
    /// Start whatever background jobs the current state calls for.
    pub(crate) fn schedule(&self) {
        let mut state = self.state.lock();
        self.maybe_schedule(&mut state);
    }

    pub(crate) fn maybe_schedule(&self, state: &mut EngineState) {
        loop {
            let metrics = self.scheduler_metrics(state);
            let action = next_action(&state.scheduler, &metrics);
            if action == Action::Wait {
                return;
            }
            state.scheduler.start(action);
            if !self.dispatch.send(action) {
                state.scheduler.finish(action);
                return;
            }
            log::trace!("Scheduled {:?}", action);
        }
    }

    fn scheduler_metrics(&self, state: &EngineState) -> SchedulerMetrics {
        let config = &self.ctx.config;
        let store = &self.ctx.store;
        SchedulerMetrics {
            shutting_down: self.is_shutting_down(),
            halted: state
                .bg_error
                .as_ref()
                .is_some_and(|err| err.halts_background()),
            imm_pending: state.imm.is_some(),
            manual_compaction: state.manual.as_ref().is_some_and(|m| !m.done),
            needs_compaction: state.versions.current().needs_compaction(),
            idle: self.last_write.lock().elapsed() >= config.idle_after,
            high_disk_usage: store.is_high_disk_usage(config.high_disk_usage_ratio),
            good_superblocks: store.good_superblocks(),
            fragmented_zones: store.fragmented_table_zones(config.defrag_live_ratio).len(),
            value_candidate: self.value_defrag_candidate(state).is_some(),
        }
    }

    pub(crate) fn run_job(&self, action: Action) {
        let result = if self.is_shutting_down() {
            Err(Error::ShuttingDown)
        } else {
            match action {
                Action::Flush => self.flush_imm(),
                Action::Compact => self.background_compaction(),
                Action::DefragmentFiles => self.defragment_files(),
                Action::DefragmentValues => self.defragment_values(),
                Action::Wait => Ok(()),
            }
        };
        self.finish_job(action, result);
    }

    fn finish_job(&self, action: Action, result: Result<()>) {
        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                let recovered = action.uses_compaction_slot()
                    && state.bg_error.as_ref().is_some_and(Error::is_no_space);
                if recovered {
                    log::info!("{:?} succeeded, clearing out-of-space error", action);
                    state.bg_error = None;
                }
            }
            Err(Error::ShuttingDown) => {}
            Err(err) => self.record_background_error(&mut state, err),
        }
        match self.ctx.store.superblock_status() {
            Err(err @ Error::FatalCorruption(_)) => self.record_background_error(&mut state, err),
            Err(err) if state.bg_error.is_none() => self.record_background_error(&mut state, err),
            _ => {}
        }
        state.scheduler.finish(action);
        self.bg_cv.notify_all();
        self.maybe_schedule(&mut state);
    }

    /// Keep `err` as the background error unless a halting one is already
    /// recorded. Skipped work is not an error.
    pub(crate) fn record_background_error(&self, state: &mut EngineState, err: Error) {
        if err.is_not_attempted() {
            return;
        }
        self.metrics.record_background_error();
        if err.halts_background() {
            log::error!("Background error, stopping background work: {}", err);
        } else {
            log::warn!("Background error: {}", err);
        }
        let replace = state
            .bg_error
            .as_ref()
            .map_or(true, |current| !current.halts_background());
        if replace {
            state.bg_error = Some(err);
        }
        self.bg_cv.notify_all();
    }
}
