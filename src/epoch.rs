//! Epoch-based reclamation
//!
//! Cells removed from the index and buffers replaced by a resize cannot be
//! freed while a concurrent transaction might still be reading them. They
//! are instead retired: handed to the epoch manager together with the
//! global epoch at retirement, and reclaimed only once every thread has
//! moved at least two epochs past that point.
//!
//! Each thread that runs transactions owns a slot in a fixed descriptor
//! array: its published epoch (0 while no transaction is in flight) and a
//! queue of `(epoch, callback)` pairs in ascending epoch order. A
//! background advancer periodically clamps the global epoch to the oldest
//! active transaction, bumps it, and fires callbacks whose retirement
//! epoch is at least two behind the new global epoch — the gap guarantees
//! no active transaction still holds a reference from before retirement.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Once;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config::{EPOCH_TICK, MAX_THREADS};

type Callback = Box<dyn FnOnce() + Send>;

// ============================================================================
// Thread registration
// ============================================================================

thread_local! {
    static THREAD_ID: std::cell::Cell<usize> = const { std::cell::Cell::new(usize::MAX) };
}

/// The calling thread's slot index, assigned on first use.
///
/// Panics once more than [`MAX_THREADS`] distinct threads have run
/// transactions.
pub fn thread_id() -> usize {
    THREAD_ID.with(|id| {
        let cur = id.get();
        if cur != usize::MAX {
            return cur;
        }
        let assigned = epoch_manager().next_thread.fetch_add(1, Ordering::Relaxed);
        assert!(
            assigned < MAX_THREADS,
            "more than {} threads registered with the epoch manager",
            MAX_THREADS
        );
        id.set(assigned);
        assigned
    })
}

// ============================================================================
// Epoch manager
// ============================================================================

struct ThreadSlot {
    /// Epoch published at transaction begin; 0 while idle.
    epoch: AtomicU64,
    /// Deferred reclamation callbacks, ascending by retirement epoch.
    callbacks: Mutex<Vec<(u64, Callback)>>,
}

impl ThreadSlot {
    fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            callbacks: Mutex::new(Vec::new()),
        }
    }
}

static EPOCH: Lazy<EpochManager> = Lazy::new(EpochManager::new);

/// Get the global epoch manager.
pub fn epoch_manager() -> &'static EpochManager {
    &EPOCH
}

/// Process-global epoch state and per-thread retirement queues.
pub struct EpochManager {
    global: AtomicU64,
    slots: Vec<ThreadSlot>,
    next_thread: AtomicUsize,
    advancer: Once,
    /// Callbacks enqueued but not yet fired
    pending: AtomicU64,
    /// Callbacks fired
    reclaimed: AtomicU64,
}

impl EpochManager {
    fn new() -> Self {
        Self {
            // epoch 0 means "idle" in thread slots, so the clock starts at 1
            global: AtomicU64::new(1),
            slots: (0..MAX_THREADS).map(|_| ThreadSlot::new()).collect(),
            next_thread: AtomicUsize::new(0),
            advancer: Once::new(),
            pending: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        }
    }

    /// Current global epoch.
    pub fn global_epoch(&self) -> u64 {
        self.global.load(Ordering::SeqCst)
    }

    /// Publish the calling thread's epoch: a transaction is beginning.
    pub fn enter(&self) {
        let g = self.global.load(Ordering::SeqCst);
        self.slots[thread_id()].epoch.store(g, Ordering::SeqCst);
    }

    /// Clear the calling thread's epoch: its transaction ended.
    pub fn exit(&self) {
        self.slots[thread_id()].epoch.store(0, Ordering::SeqCst);
    }

    /// Defer `f` until two epochs have passed with no transaction still
    /// active from the current one.
    pub fn retire(&self, f: impl FnOnce() + Send + 'static) {
        let enqueue_epoch = self.global.load(Ordering::SeqCst);
        let slot = &self.slots[thread_id()];
        slot.callbacks.lock().push((enqueue_epoch, Box::new(f)));
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    /// One advancer step: clamp to the oldest active transaction, bump the
    /// global epoch, and fire every callback retired at least two epochs
    /// before the new value.
    pub fn advance(&self) {
        let mut g = self.global.load(Ordering::SeqCst);
        for slot in &self.slots {
            let e = slot.epoch.load(Ordering::SeqCst);
            if e != 0 && e < g {
                g = e;
            }
        }
        let new_global = g + 1;
        self.global.store(new_global, Ordering::SeqCst);

        for slot in &self.slots {
            // queues are epoch-ascending, so draining stops at the first
            // entry that is too recent
            let due: Vec<Callback> = {
                let mut queue = slot.callbacks.lock();
                let split = queue
                    .iter()
                    .position(|(e, _)| e + 2 > new_global)
                    .unwrap_or(queue.len());
                queue.drain(..split).map(|(_, f)| f).collect()
            };
            // run outside the queue lock: a callback may itself retire
            let fired = due.len() as u64;
            for f in due {
                f();
            }
            if fired > 0 {
                self.pending.fetch_sub(fired, Ordering::Relaxed);
                self.reclaimed.fetch_add(fired, Ordering::Relaxed);
            }
        }
    }

    /// Spawn the background advancer thread. Idempotent.
    pub fn spawn_advancer(&'static self) {
        self.advancer.call_once(|| {
            std::thread::Builder::new()
                .name("opal-epoch".into())
                .spawn(move || loop {
                    std::thread::sleep(EPOCH_TICK);
                    self.advance();
                })
                .expect("failed to spawn epoch advancer");
        });
    }

    /// Callbacks enqueued but not yet reclaimed.
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    /// Callbacks reclaimed so far.
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Tests
// ============================================================================
