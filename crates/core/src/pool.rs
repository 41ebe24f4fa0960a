//! Build and search compute pools
//!
//! Two pools serve the index layer: one for build units, one for per-row
//! search tasks. They are bundled in [`ThreadPools`] and handed to index
//! nodes at construction. [`ThreadPools::global`] provides a lazily created
//! process-wide pair.
//!
//! ## Failure model
//!
//! A task that returns an error or panics never poisons the pool. Panics
//! are captured and reported as [`IndexError::InnerEngine`]. Batches are
//! awaited to completion before the first error (in submission order) is
//! returned; no partial results escape.
//!
//! ## Compute threads
//!
//! Work running inside a unit may consult [`max_compute_threads`] to decide
//! how much inner parallelism it may use. Row tasks are pinned to one
//! compute thread so that row-level fan-out does not oversubscribe the pool.

use std::any::Any;
use std::cell::Cell;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use crate::error::{IndexError, Result};

thread_local! {
    static MAX_COMPUTE_THREADS: Cell<usize> = Cell::new(0);
}

/// Compute-thread limit of the current unit, `None` when unrestricted
pub fn max_compute_threads() -> Option<usize> {
    let n = MAX_COMPUTE_THREADS.with(|c| c.get());
    if n == 0 {
        None
    } else {
        Some(n)
    }
}

/// Restricts inner compute threads for the lifetime of the guard
///
/// The limit is thread-local; the guard restores the previous limit when
/// dropped and cannot be sent to another thread.
pub struct ScopedComputeThreads {
    previous: usize,
    _not_send: PhantomData<*const ()>,
}

impl ScopedComputeThreads {
    /// Limit inner compute threads to `threads` (at least one)
    pub fn new(threads: usize) -> Self {
        let previous = MAX_COMPUTE_THREADS.with(|c| c.replace(threads.max(1)));
        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ScopedComputeThreads {
    fn drop(&mut self) {
        MAX_COMPUTE_THREADS.with(|c| c.set(self.previous));
    }
}

/// A named rayon pool with error- and panic-aware task helpers
pub struct ComputePool {
    name: String,
    pool: ThreadPool,
}

impl std::fmt::Debug for ComputePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePool")
            .field("name", &self.name)
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl ComputePool {
    /// Create a pool with `num_threads` workers (at least one)
    pub fn new(name: &str, num_threads: usize) -> Result<Self> {
        let prefix = name.to_string();
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(move |i| format!("{}-{}", prefix, i))
            .build()
            .map_err(|e| IndexError::InnerEngine(format!("failed to create pool {}: {}", name, e)))?;
        debug!(target: "stratavec::pool", pool = name, threads = num_threads.max(1), "Created compute pool");
        Ok(Self {
            name: name.to_string(),
            pool,
        })
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of worker threads
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Submit a detached unit of work
    ///
    /// Do not wait on the returned handle from inside this pool's own
    /// workers; the waiting worker would block a slot the task may need.
    pub fn submit<T, F>(&self, work: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::new(TaskSlot {
            result: Mutex::new(None),
            ready: Condvar::new(),
        });
        let task_slot = Arc::clone(&slot);
        self.pool.spawn(move || {
            let outcome = catch_task(work);
            *task_slot.result.lock() = Some(outcome);
            task_slot.ready.notify_all();
        });
        TaskHandle { slot }
    }

    /// Run one unit of work on the pool and wait for it
    pub fn run<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send,
        T: Send,
    {
        self.pool.install(|| catch_task(work))
    }

    /// Run one task per row and wait for all of them
    ///
    /// Each task is limited to a single compute thread. Results come back
    /// in task order; if any task failed, the first failure is returned
    /// once every task has finished.
    pub fn run_rows<'a, T, F>(&self, tasks: Vec<F>) -> Result<Vec<T>>
    where
        F: FnOnce() -> Result<T> + Send + 'a,
        T: Send,
    {
        let mut slots: Vec<Option<Result<T>>> = Vec::with_capacity(tasks.len());
        slots.resize_with(tasks.len(), || None);

        self.pool.scope(|s| {
            for (task, slot) in tasks.into_iter().zip(slots.iter_mut()) {
                s.spawn(move |_| {
                    let _threads = ScopedComputeThreads::new(1);
                    *slot = Some(catch_task(task));
                });
            }
        });

        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                Some(Ok(value)) => out.push(value),
                Some(Err(e)) => return Err(e),
                None => return Err(IndexError::InnerEngine("row task did not run".into())),
            }
        }
        Ok(out)
    }
}

struct TaskSlot<T> {
    result: Mutex<Option<Result<T>>>,
    ready: Condvar,
}

/// Handle to a unit submitted with [`ComputePool::submit`]
pub struct TaskHandle<T> {
    slot: Arc<TaskSlot<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the unit finishes
    pub fn wait(self) -> Result<T> {
        let mut guard = self.slot.result.lock();
        loop {
            if let Some(outcome) = guard.take() {
                return outcome;
            }
            self.slot.ready.wait(&mut guard);
        }
    }
}

/// Wait for every handle; return all values or the first error
pub fn await_all<T>(handles: Vec<TaskHandle<T>>) -> Result<Vec<T>> {
    let mut values = Vec::with_capacity(handles.len());
    let mut first_error = None;
    for handle in handles {
        match handle.wait() {
            Ok(value) => values.push(value),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

fn catch_task<T>(work: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(outcome) => outcome,
        Err(payload) => Err(IndexError::InnerEngine(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", s)
    } else {
        "task panicked".to_string()
    }
}

/// Build and search pools shared by index nodes
#[derive(Debug, Clone)]
pub struct ThreadPools {
    build: Arc<ComputePool>,
    search: Arc<ComputePool>,
}

static GLOBAL_POOLS: OnceCell<ThreadPools> = OnceCell::new();

impl ThreadPools {
    /// Create a dedicated pair of pools
    pub fn new(build_threads: usize, search_threads: usize) -> Result<Self> {
        Ok(Self {
            build: Arc::new(ComputePool::new("stratavec-build", build_threads)?),
            search: Arc::new(ComputePool::new("stratavec-search", search_threads)?),
        })
    }

    /// Process-wide pools sized to the available parallelism
    pub fn global() -> Result<Self> {
        GLOBAL_POOLS
            .get_or_try_init(|| {
                let threads = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                info!(target: "stratavec::pool", threads, "Initializing global compute pools");
                ThreadPools::new(threads, threads)
            })
            .map(Clone::clone)
    }

    /// Pool for build units
    pub fn build(&self) -> &ComputePool {
        &self.build
    }

    /// Pool for per-row search tasks
    pub fn search(&self) -> &ComputePool {
        &self.search
    }
}
