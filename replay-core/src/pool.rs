//! Parallel block-range task pool.
//!
//! One producer thread walks the substate store in `(block, tx)` order and
//! feeds raw records into a bounded channel; worker threads decode and run
//! the task. Decoding on the worker side parallelizes deserialization cost.
//! The first task error is latched and dispatch ceases; in-flight workers
//! finish their current task and the pool returns the latched error. With a
//! single worker, tasks run in exactly the order the store yields them.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::info;

use crate::{
    replay::ReplayError,
    store::{RawSubstate, SubstateDb},
    substate::{MessageKind, Substate},
};

/// Task executed per `(block, tx)` pair. The last argument is the shared
/// VM-time counter, in nanoseconds.
pub type TaskFn = dyn Fn(u64, u32, &Substate, &AtomicU64) -> Result<(), ReplayError> + Send + Sync;

/// Pool tuning and transaction skip filters.
#[derive(Debug, Clone)]
pub struct TaskPoolConfig {
    pub workers: usize,
    pub skip_transfer_txs: bool,
    pub skip_call_txs: bool,
    pub skip_create_txs: bool,
    /// Cadence of informational progress lines.
    pub progress_interval: Duration,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            skip_transfer_txs: false,
            skip_call_txs: false,
            skip_create_txs: false,
            progress_interval: Duration::from_secs(10),
        }
    }
}

/// Dispatches one task per stored substate over an inclusive block range.
pub struct TaskPool {
    name: String,
    task: Box<TaskFn>,
    first_block: u64,
    last_block: u64,
    db: Arc<SubstateDb>,
    config: TaskPoolConfig,
    vm_duration_nanos: Arc<AtomicU64>,
    interrupted: Arc<AtomicBool>,
}

impl TaskPool {
    pub fn new(
        name: impl Into<String>,
        task: Box<TaskFn>,
        first_block: u64,
        last_block: u64,
        db: Arc<SubstateDb>,
        config: TaskPoolConfig,
    ) -> Self {
        Self {
            name: name.into(),
            task,
            first_block,
            last_block,
            db,
            config,
            vm_duration_nanos: Arc::new(AtomicU64::new(0)),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Net time spent inside the interpreter across all workers so far.
    pub fn vm_duration(&self) -> Duration {
        Duration::from_nanos(self.vm_duration_nanos.load(Ordering::Relaxed))
    }

    /// Flag observed between dispatches; setting it (e.g. from a SIGINT
    /// handler) makes the pool surface a cancellation error after draining.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    fn should_skip(&self, substate: &Substate) -> bool {
        match substate.message.kind() {
            MessageKind::Transfer => self.config.skip_transfer_txs,
            MessageKind::Call => self.config.skip_call_txs,
            MessageKind::Create => self.config.skip_create_txs,
        }
    }

    /// Runs the pool to completion and returns the first latched error, if
    /// any.
    pub fn execute(&self) -> Result<(), ReplayError> {
        let workers = self.config.workers.max(1);
        let started = Instant::now();
        info!(
            "[{}] blocks {} to {}, {} workers",
            self.name, self.first_block, self.last_block, workers
        );

        let (sender, receiver) = crossbeam_channel::bounded::<RawSubstate>(workers * 2);
        let stop = AtomicBool::new(false);
        let first_error: Mutex<Option<ReplayError>> = Mutex::new(None);
        let tasks_done = AtomicU64::new(0);

        let latch = |err: ReplayError| {
            let mut slot = first_error.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
            stop.store(true, Ordering::SeqCst);
        };

        thread::scope(|scope| {
            for _ in 0..workers {
                let receiver = receiver.clone();
                let stop = &stop;
                let latch = &latch;
                let tasks_done = &tasks_done;
                scope.spawn(move || {
                    while let Ok(raw) = receiver.recv() {
                        // Dispatch has ceased; drain without executing.
                        if stop.load(Ordering::SeqCst) {
                            continue;
                        }
                        let substate = match raw.decode() {
                            Ok(substate) => substate,
                            Err(err) => {
                                latch(err.into());
                                continue;
                            }
                        };
                        if self.should_skip(&substate) {
                            tasks_done.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        if let Err(err) =
                            (self.task)(raw.block, raw.tx, &substate, &self.vm_duration_nanos)
                        {
                            // The diff is the diagnostic of a mismatch; one
                            // contiguous write per report.
                            if let ReplayError::Mismatch { report, .. } = &err {
                                print!("{report}");
                            }
                            latch(err);
                            continue;
                        }
                        tasks_done.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
            drop(receiver);

            // Producer: walk the range on this thread, in order.
            let range = match self.db.range(self.first_block, self.last_block) {
                Ok(range) => range,
                Err(err) => {
                    latch(err.into());
                    drop(sender);
                    return;
                }
            };

            let mut last_report = Instant::now();
            for item in range {
                if self.interrupted.load(Ordering::SeqCst) {
                    latch(ReplayError::Cancelled);
                    break;
                }
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let raw = match item {
                    Ok(raw) => raw,
                    Err(err) => {
                        latch(err.into());
                        break;
                    }
                };

                let current_block = raw.block;
                if sender.send(raw).is_err() {
                    break;
                }

                if last_report.elapsed() >= self.config.progress_interval {
                    let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
                    let blocks = current_block.saturating_sub(self.first_block) + 1;
                    info!(
                        "[{}] block {}, {} transactions, {:.1} blocks/s, net VM time {:?}",
                        self.name,
                        current_block,
                        tasks_done.load(Ordering::Relaxed),
                        blocks as f64 / elapsed,
                        self.vm_duration(),
                    );
                    last_report = Instant::now();
                }
            }
            drop(sender);
        });

        match first_error.into_inner() {
            Some(err) => Err(err),
            None => {
                info!(
                    "[{}] done: {} transactions in {:.1?}, net VM time {:?}",
                    self.name,
                    tasks_done.load(Ordering::Relaxed),
                    started.elapsed(),
                    self.vm_duration(),
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substate::{Message, Substate};
    use alloy_primitives::{Address, Bytes};
    use std::collections::BTreeSet;

    fn transfer_substate() -> Substate {
        Substate {
            message: Message {
                to: Some(Address::repeat_byte(0x0b)),
                ..Message::default()
            },
            ..Substate::default()
        }
    }

    fn call_substate() -> Substate {
        Substate {
            message: Message {
                to: Some(Address::repeat_byte(0x0b)),
                data: Bytes::from_static(&[0x01]),
                ..Message::default()
            },
            ..Substate::default()
        }
    }

    fn create_substate() -> Substate {
        Substate {
            message: Message {
                to: None,
                ..Message::default()
            },
            ..Substate::default()
        }
    }

    fn seeded_store() -> (tempfile::TempDir, Arc<SubstateDb>) {
        let dir = tempfile::tempdir().unwrap();
        let db = SubstateDb::open(dir.path().join("substates.redb")).unwrap();
        db.put_substate(10, 0, &transfer_substate()).unwrap();
        db.put_substate(10, 1, &call_substate()).unwrap();
        db.put_substate(11, 0, &create_substate()).unwrap();
        db.put_substate(12, 0, &transfer_substate()).unwrap();
        (dir, Arc::new(db))
    }

    fn visited_with(workers: usize) -> BTreeSet<(u64, u32)> {
        let (_dir, db) = seeded_store();
        let visited = Arc::new(Mutex::new(BTreeSet::new()));
        let sink = visited.clone();

        let pool = TaskPool::new(
            "test",
            Box::new(move |block, tx, _substate, _vm| {
                sink.lock().insert((block, tx));
                Ok(())
            }),
            10,
            12,
            db,
            TaskPoolConfig {
                workers,
                ..TaskPoolConfig::default()
            },
        );
        pool.execute().unwrap();

        let snapshot = visited.lock().clone();
        snapshot
    }

    #[test]
    fn visits_every_task_in_range() {
        let visited = visited_with(1);
        assert_eq!(
            visited,
            BTreeSet::from([(10, 0), (10, 1), (11, 0), (12, 0)])
        );
    }

    #[test]
    fn worker_count_does_not_change_the_task_set() {
        assert_eq!(visited_with(1), visited_with(4));
    }

    #[test]
    fn first_error_is_latched_and_dispatch_ceases() {
        let (_dir, db) = seeded_store();

        let pool = TaskPool::new(
            "test",
            Box::new(|block, tx, _substate, _vm| {
                if (block, tx) == (10, 1) {
                    Err(ReplayError::Argument("boom".into()))
                } else {
                    Ok(())
                }
            }),
            10,
            12,
            db,
            TaskPoolConfig {
                workers: 1,
                ..TaskPoolConfig::default()
            },
        );

        let err = pool.execute().unwrap_err();
        assert!(matches!(err, ReplayError::Argument(_)));
    }

    #[test]
    fn skip_filters_classify_messages() {
        let (_dir, db) = seeded_store();
        let visited = Arc::new(Mutex::new(BTreeSet::new()));
        let sink = visited.clone();

        let pool = TaskPool::new(
            "test",
            Box::new(move |block, tx, _substate, _vm| {
                sink.lock().insert((block, tx));
                Ok(())
            }),
            10,
            12,
            db,
            TaskPoolConfig {
                workers: 1,
                skip_transfer_txs: true,
                skip_create_txs: true,
                ..TaskPoolConfig::default()
            },
        );
        pool.execute().unwrap();

        // Only the call transaction survives the filters.
        assert_eq!(*visited.lock(), BTreeSet::from([(10, 1)]));
    }

    #[test]
    fn interrupt_surfaces_cancellation() {
        let (_dir, db) = seeded_store();
        let pool = TaskPool::new(
            "test",
            Box::new(|_, _, _, _| Ok(())),
            10,
            12,
            db,
            TaskPoolConfig {
                workers: 1,
                ..TaskPoolConfig::default()
            },
        );
        pool.interrupt_handle().store(true, Ordering::SeqCst);

        let err = pool.execute().unwrap_err();
        assert!(matches!(err, ReplayError::Cancelled));
    }

    #[test]
    fn empty_range_succeeds() {
        let (_dir, db) = seeded_store();
        let pool = TaskPool::new(
            "test",
            Box::new(|_, _, _, _| Ok(())),
            100,
            200,
            db,
            TaskPoolConfig::default(),
        );
        pool.execute().unwrap();
    }
}
