//! A multithreaded runtime that hosts one replica of a pipeline per worker
//! thread.

use crate::error::DetailedError;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::{
    backtrace::Backtrace,
    borrow::Cow,
    cell::{Cell, RefCell},
    fmt::{self, Debug, Display, Formatter},
    panic::{self, PanicHookInfo},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::{Builder, JoinHandle},
};
use thiserror::Error;
use tracing::{debug, error};
use typedmap::TypedDashMap;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Error)]
pub enum RuntimeError {
    /// One or more worker threads terminated unexpectedly.  Sorted by
    /// worker index.
    #[error("{} worker thread(s) panicked: {}", .panics.len(), summary(.panics))]
    WorkerPanic { panics: Vec<WorkerPanicInfo> },
}

fn summary(panics: &[WorkerPanicInfo]) -> String {
    panics
        .iter()
        .map(|panic| panic.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl DetailedError for RuntimeError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::WorkerPanic { .. } => Cow::from("WorkerPanic"),
        }
    }
}

thread_local! {
    // The runtime that owns this worker thread, `None` for other threads.
    static RUNTIME: RefCell<Option<Runtime>> = const { RefCell::new(None) };

    // 0 outside of a runtime.
    static WORKER_INDEX: Cell<usize> = const { Cell::new(0) };
}

pub struct LocalStoreMarker;

/// Data store shared by all workers in a runtime.
pub type LocalStore = TypedDashMap<LocalStoreMarker>;

/// A panic in a worker thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerPanicInfo {
    worker: usize,
    message: Option<String>,
    // `file:line:column`
    location: Option<String>,
    backtrace: String,
}

impl Display for WorkerPanicInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "worker {}", self.worker)?;
        if let Some(location) = &self.location {
            write!(f, " at {location}")?;
        }
        write!(f, ": {}", self.message.as_deref().unwrap_or("(no message)"))
    }
}

impl WorkerPanicInfo {
    fn capture(worker: usize, info: &PanicHookInfo) -> Self {
        let payload = info.payload();
        let message = payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()));

        Self {
            worker,
            message,
            location: info.location().map(|location| location.to_string()),
            backtrace: Backtrace::force_capture().to_string(),
        }
    }

    // A worker that died without passing through the panic hook, which
    // happens when another hook replaced ours.
    fn unrecorded(worker: usize) -> Self {
        Self {
            worker,
            message: None,
            location: None,
            backtrace: String::new(),
        }
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn backtrace(&self) -> &str {
        &self.backtrace
    }
}

struct RuntimeInner {
    workers: usize,
    store: LocalStore,
    kill_signal: AtomicBool,
    worker_sequence_numbers: Vec<AtomicUsize>,
    panics: Mutex<Vec<WorkerPanicInfo>>,
}

impl Debug for RuntimeInner {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeInner")
            .field("workers", &self.workers)
            .finish()
    }
}

impl RuntimeInner {
    fn new(workers: usize) -> Self {
        Self {
            workers,
            store: TypedDashMap::new(),
            kill_signal: AtomicBool::new(false),
            worker_sequence_numbers: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
            panics: Mutex::new(Vec::new()),
        }
    }
}

// Installed once per process on top of whatever hook was there before.
// Panics in threads that don't belong to a runtime only reach the previous
// hook.
static PANIC_HOOK: Lazy<()> = Lazy::new(|| {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        previous(info);
        RUNTIME.with(|runtime| {
            if let Ok(runtime) = runtime.try_borrow() {
                if let Some(runtime) = runtime.as_ref() {
                    runtime.record_panic(info);
                }
            }
        });
    }));
});

/// A multithreaded runtime that runs `N` replicas of a pipeline in parallel
/// worker threads.
///
/// Every worker builds the same pipeline.  Stages that need state shared
/// by all replicas at the same pipeline position, like the grouping stage,
/// find it in the runtime's [`LocalStore`] under an id drawn from
/// [`Runtime::sequence_next`].  Because each worker builds its stages in the
/// same order, the replicas of a stage draw the same id.
#[repr(transparent)]
#[derive(Clone, Debug)]
pub struct Runtime(Arc<RuntimeInner>);

impl Runtime {
    /// Creates a new runtime with `workers` worker threads, runs a clone of
    /// `pipeline` in each of them, and returns a handle to the runtime.
    ///
    /// # Examples
    /// ```
    /// use grouping::{record, GroupingConfig, GroupingOperator, Runtime, VecSource};
    ///
    /// let hruntime = Runtime::run(4, || {
    ///     // This closure runs within each worker thread.
    ///     let source = VecSource::new(vec![record! { "w" => Runtime::worker_index() as i64 % 2 }]);
    ///     let mut stage = GroupingOperator::new(GroupingConfig::new(["w"]), source).unwrap();
    ///     while let Some(_group) = stage.next().unwrap() {}
    /// });
    ///
    /// // Wait for all worker threads to terminate.
    /// hruntime.join().unwrap();
    /// ```
    pub fn run<F>(workers: usize, pipeline: F) -> RuntimeHandle
    where
        F: FnOnce() + Clone + Send + 'static,
    {
        assert_ne!(workers, 0, "a runtime needs at least one worker");

        Lazy::force(&PANIC_HOOK);
        let runtime = Self(Arc::new(RuntimeInner::new(workers)));

        let workers = (0..workers)
            .map(|worker_index| {
                let runtime = runtime.clone();
                let pipeline = pipeline.clone();
                Builder::new()
                    .name(format!("grouping-worker-{worker_index}"))
                    .spawn(move || {
                        // Set the worker's runtime handle and index
                        WORKER_INDEX.set(worker_index);
                        RUNTIME.with(|rt| *rt.borrow_mut() = Some(runtime));

                        debug!("worker {worker_index} started");
                        pipeline();
                        debug!("worker {worker_index} finished");
                    })
                    .unwrap_or_else(|error| {
                        panic!("failed to spawn worker thread {worker_index}: {error}");
                    })
            })
            .collect::<Vec<_>>();

        RuntimeHandle::new(runtime, workers)
    }

    /// Returns a reference to the multithreaded runtime that
    /// manages the current worker thread, or `None` if the thread
    /// runs without a runtime.
    #[allow(clippy::self_named_constructors)]
    pub fn runtime() -> Option<Runtime> {
        RUNTIME.with(|rt| rt.borrow().clone())
    }

    fn inner(&self) -> &RuntimeInner {
        &self.0
    }

    /// Returns 0-based index of the current worker thread within its runtime.
    /// For threads that run without a runtime, this method returns `0`.
    pub fn worker_index() -> usize {
        WORKER_INDEX.get()
    }

    /// Returns the number of workers in the current thread's runtime, or 1
    /// if this thread is not in a [Runtime].
    pub fn num_workers() -> usize {
        RUNTIME.with(|rt| {
            rt.borrow()
                .as_ref()
                .map_or(1, |runtime| runtime.inner().workers)
        })
    }

    /// Returns reference to the data store shared by all workers within the
    /// runtime.
    ///
    /// The [`LocalStore`] type is an alias to [`TypedDashMap`], a
    /// concurrent map type that can store key/value pairs of different
    /// types.  See `typedmap` crate documentation for details.
    pub fn local_store(&self) -> &LocalStore {
        &self.inner().store
    }

    /// A per-worker sequential counter.
    ///
    /// This method can be used to generate unique identifiers that will be the
    /// same across all worker threads.  Repeated calls to this function
    /// from the same worker generate numbers 0, 1, 2, ...
    pub fn sequence_next(&self) -> usize {
        self.inner().worker_sequence_numbers[Self::worker_index()].fetch_add(1, Ordering::Relaxed)
    }

    /// `true` if the current worker thread has received a kill signal
    /// and should exit asap.  Stages check it between records.
    pub fn kill_in_progress() -> bool {
        RUNTIME.with(|runtime| {
            runtime
                .borrow()
                .as_ref()
                .map(|runtime| runtime.inner().kill_signal.load(Ordering::SeqCst))
                .unwrap_or(false)
        })
    }

    // Runs inside the panic hook, so it must not panic itself.
    fn record_panic(&self, info: &PanicHookInfo) {
        let panic = WorkerPanicInfo::capture(Self::worker_index(), info);
        match self.inner().panics.lock() {
            Ok(mut panics) => panics.push(panic),
            Err(_) => error!("lost panic report: {panic}"),
        }
    }

    fn panics(&self) -> Vec<WorkerPanicInfo> {
        self.inner()
            .panics
            .lock()
            .map(|panics| panics.clone())
            .unwrap_or_default()
    }
}

/// Handle returned by `Runtime::run`.
#[derive(Debug)]
pub struct RuntimeHandle {
    runtime: Runtime,
    workers: Vec<JoinHandle<()>>,
}

impl RuntimeHandle {
    fn new(runtime: Runtime, workers: Vec<JoinHandle<()>>) -> Self {
        Self { runtime, workers }
    }

    /// Returns reference to the runtime.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Terminate the runtime and all worker threads.
    ///
    /// Signals all workers to exit and waits for them.  Stages observe the
    /// signal between records; a record that is being counted or a seal in
    /// progress completes first.
    pub fn kill(self) -> Result<(), RuntimeError> {
        self.kill_async();
        self.join()
    }

    // Signals all worker threads to exit, and returns immediately without
    // waiting for them to exit.
    pub fn kill_async(&self) {
        self.runtime
            .inner()
            .kill_signal
            .store(true, Ordering::SeqCst);
    }

    /// Wait for all workers in the runtime to terminate.
    ///
    /// The calling thread blocks until all worker threads have terminated.
    /// Returns [`RuntimeError::WorkerPanic`] if any of them panicked.
    pub fn join(self) -> Result<(), RuntimeError> {
        // Join every thread, even after one of them failed.
        let failed = self
            .workers
            .into_iter()
            .enumerate()
            .filter_map(|(worker, handle)| handle.join().is_err().then_some(worker))
            .collect::<Vec<_>>();

        self.runtime.local_store().clear();

        if failed.is_empty() {
            return Ok(());
        }

        let recorded = self.runtime.panics();
        let panics = failed
            .into_iter()
            .map(|worker| {
                recorded
                    .iter()
                    .find(|panic| panic.worker == worker)
                    .cloned()
                    .unwrap_or_else(|| WorkerPanicInfo::unrecorded(worker))
            })
            .collect();
        Err(RuntimeError::WorkerPanic { panics })
    }

    /// Panics recorded so far, in the order they happened.
    pub fn panics(&self) -> Vec<WorkerPanicInfo> {
        self.runtime.panics()
    }

    /// Returns true if any worker has panicked.
    pub fn panicked(&self) -> bool {
        !self.panics().is_empty()
    }
}
