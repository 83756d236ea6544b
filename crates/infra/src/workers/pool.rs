//! Fixed-size worker pool.
//!
//! Every slot owns one OS thread and runs one assignment at a time. The
//! dispatcher reserves a slot *before* claiming a job, so a claimed job
//! always has a worker waiting for it.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, error, info};

use cadence_core::{Clock, WorkerId};

use crate::store::{ExecutionStore, JobStore};

use super::executor::JobExecutor;
use super::worker::{Assignment, WorkerContext, run_assignment};

struct Slot {
    worker_id: WorkerId,
    busy: AtomicBool,
    sender: Mutex<Option<mpsc::Sender<Assignment>>>,
}

struct PoolShared {
    slots: Vec<Arc<Slot>>,
    closed: AtomicBool,
}

/// Cloneable view of the pool used to reserve slots.
#[derive(Clone)]
pub struct SlotAllocator {
    shared: Arc<PoolShared>,
}

impl SlotAllocator {
    /// Reserve an idle slot, or `None` when all are busy or the pool is closed.
    pub fn try_reserve(&self) -> Option<Reservation> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.shared.slots.iter().find_map(|slot| {
            slot.busy
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .ok()
                .map(|_| Reservation {
                    slot: slot.clone(),
                    assigned: false,
                })
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    /// Slots currently reserved or running an assignment.
    pub fn active(&self) -> usize {
        self.shared
            .slots
            .iter()
            .filter(|slot| slot.busy.load(Ordering::SeqCst))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// An idle slot held for one assignment. Dropping it unassigned frees the slot.
pub struct Reservation {
    slot: Arc<Slot>,
    assigned: bool,
}

impl Reservation {
    pub fn worker_id(&self) -> &WorkerId {
        &self.slot.worker_id
    }

    /// Hand the assignment to the reserved worker.
    ///
    /// Gives the assignment back when the pool has been closed.
    pub fn assign(mut self, assignment: Assignment) -> Result<(), Assignment> {
        let Ok(sender) = self.slot.sender.lock() else {
            return Err(assignment);
        };
        let Some(tx) = sender.as_ref() else {
            return Err(assignment);
        };
        tx.send(assignment).map_err(|mpsc::SendError(a)| a)?;
        drop(sender);
        self.assigned = true;
        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.assigned {
            self.slot.busy.store(false, Ordering::SeqCst);
        }
    }
}

/// Worker threads plus the shared slot table.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    joins: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one).
    pub fn start<S>(
        size: usize,
        store: S,
        executor: Arc<dyn JobExecutor>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self>
    where
        S: ExecutionStore + JobStore + 'static,
    {
        let size = size.max(1);
        let prefix = WorkerId::new_pool_prefix();
        let ctx = Arc::new(WorkerContext {
            store,
            executor,
            clock,
        });

        let mut slots = Vec::with_capacity(size);
        let mut joins = Vec::with_capacity(size);
        for index in 0..size {
            let (tx, rx) = mpsc::channel::<Assignment>();
            let slot = Arc::new(Slot {
                worker_id: WorkerId::for_slot(&prefix, index),
                busy: AtomicBool::new(false),
                sender: Mutex::new(Some(tx)),
            });

            let worker_slot = slot.clone();
            let worker_ctx = ctx.clone();
            let join = thread::Builder::new()
                .name(format!("cadence-worker-{index}"))
                .spawn(move || worker_loop(worker_slot, rx, worker_ctx))?;

            slots.push(slot);
            joins.push(join);
        }

        info!(workers = size, pool = %prefix, "worker pool started");
        Ok(Self {
            shared: Arc::new(PoolShared {
                slots,
                closed: AtomicBool::new(false),
            }),
            joins,
        })
    }

    pub fn slots(&self) -> SlotAllocator {
        SlotAllocator {
            shared: self.shared.clone(),
        }
    }

    /// Stop accepting work, let in-flight assignments finish, join all workers.
    pub fn shutdown(self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        for slot in &self.shared.slots {
            match slot.sender.lock() {
                Ok(mut sender) => {
                    sender.take();
                }
                Err(poisoned) => {
                    poisoned.into_inner().take();
                }
            }
        }

        for join in self.joins {
            if join.join().is_err() {
                error!("worker thread panicked");
            }
        }
        info!("worker pool drained");
    }
}

fn worker_loop<S>(slot: Arc<Slot>, rx: mpsc::Receiver<Assignment>, ctx: Arc<WorkerContext<S>>)
where
    S: ExecutionStore + JobStore,
{
    debug!(worker_id = %slot.worker_id, "worker started");
    while let Ok(assignment) = rx.recv() {
        run_assignment(&ctx, assignment);
        slot.busy.store(false, Ordering::SeqCst);
    }
    debug!(worker_id = %slot.worker_id, "worker stopped");
}
