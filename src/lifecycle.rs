use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::adapters::adapter::LoadableAdapter;
use crate::error::{AdapterError, AttachError, LoadError};
use crate::status::{LoadSnapshot, LoadStatus};
use crate::trace::{debug, trace, warning};

type Callback = Box<dyn FnOnce(Result<(), LoadError>) + Send + 'static>;

/// Someone waiting for the outcome of a load attempt.
enum Completion {
    Callback(Callback),
    Handle(oneshot::Sender<Result<(), LoadError>>),
}

impl Completion {
    fn complete(self, result: Result<(), LoadError>) {
        match self {
            Completion::Callback(callback) => {
                // A panicking callback must not take the driver or later completions down
                if panic::catch_unwind(AssertUnwindSafe(move || callback(result))).is_err() {
                    warning!("load completion callback panicked");
                }
            }
            // Receiver may have been dropped, nobody is listening then
            Completion::Handle(sender) => {
                let _ = sender.send(result);
            }
        }
    }
}

enum Command {
    Attach(Weak<dyn LoadableAdapter>),
    Load {
        retrying: bool,
        completion: Completion,
    },
    Cancel,
    Finished {
        attempt: u64,
        outcome: Result<(), AdapterError>,
    },
    Flush(oneshot::Sender<()>),
}

struct Shared {
    name: Box<str>,
    attached: AtomicBool,
    snapshot: watch::Sender<LoadSnapshot>,
}

/// Asynchronous load lifecycle of one deferred resource.
///
/// The lifecycle tracks [`LoadStatus`] and [`LoadError`] and drives a [`LoadableAdapter`]
/// that does the actual work. It is a cheap handle: clones share the same state. State is
/// owned by a driver task spawned on construction, every operation is a message to it, so
/// nothing here blocks and all completions are delivered from the driver, in the order they
/// were registered.
///
/// The driver stops when the last handle is dropped. Pending completions then resolve with
/// [`LoadError::Closed`].
#[derive(Clone)]
pub struct LoadLifecycle {
    commands: UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl LoadLifecycle {
    /// Create a lifecycle with no adapter attached.
    ///
    /// # Panics
    /// Panics when called outside of a Tokio runtime, see [`LoadLifecycle::with_runtime`].
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_runtime(name, &Handle::current())
    }

    /// Create a lifecycle whose driver runs on the given runtime.
    pub fn with_runtime(name: impl Into<String>, runtime: &Handle) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(LoadSnapshot::default());
        let shared = Arc::new(Shared {
            name: name.into().into_boxed_str(),
            attached: AtomicBool::new(false),
            snapshot,
        });

        let driver = Driver {
            shared: shared.clone(),
            commands: commands.downgrade(),
            adapter: None,
            status: LoadStatus::NotLoaded,
            error: None,
            next_attempt: 0,
            current_attempt: None,
            attempt_task: None,
            pending: Vec::new(),
        };
        runtime.spawn(driver.run(receiver));

        LoadLifecycle { commands, shared }
    }

    /// Create a lifecycle already wired to `adapter`.
    ///
    /// # Panics
    /// Panics when called outside of a Tokio runtime.
    pub fn with_adapter<A: LoadableAdapter>(name: impl Into<String>, adapter: &Arc<A>) -> Self {
        let lifecycle = Self::new(name);
        lifecycle.shared.attached.store(true, Ordering::Release);
        lifecycle.send(Command::Attach(Arc::downgrade(adapter) as Weak<dyn LoadableAdapter>));
        lifecycle
    }

    /// Wire `adapter` to this lifecycle. Only one adapter can ever be attached.
    ///
    /// The lifecycle keeps a weak reference. The adapter immediately receives the current
    /// status and error through its notification hooks.
    pub fn attach<A: LoadableAdapter>(&self, adapter: &Arc<A>) -> Result<(), AttachError> {
        if self.shared.attached.swap(true, Ordering::AcqRel) {
            return Err(AttachError::AlreadyAttached);
        }
        self.send(Command::Attach(Arc::downgrade(adapter) as Weak<dyn LoadableAdapter>));
        Ok(())
    }

    /// Load the resource unless it is already loaded.
    ///
    /// Calls made while an attempt is in flight join that attempt.
    pub fn load(&self) -> LoadHandle {
        self.request(false)
    }

    /// Like [`LoadLifecycle::load`], reporting the outcome to `on_complete` instead.
    pub fn load_with<F>(&self, on_complete: F)
    where
        F: FnOnce(Result<(), LoadError>) + Send + 'static,
    {
        self.send(Command::Load {
            retrying: false,
            completion: Completion::Callback(Box::new(on_complete)),
        });
    }

    /// Start a new attempt whatever the current status is.
    ///
    /// The adapter is told it is retrying and must drop any previous work. Completions still
    /// waiting on a superseded attempt resolve together with this one.
    pub fn retry_load(&self) -> LoadHandle {
        self.request(true)
    }

    /// Like [`LoadLifecycle::retry_load`], reporting the outcome to `on_complete` instead.
    pub fn retry_load_with<F>(&self, on_complete: F)
    where
        F: FnOnce(Result<(), LoadError>) + Send + 'static,
    {
        self.send(Command::Load {
            retrying: true,
            completion: Completion::Callback(Box::new(on_complete)),
        });
    }

    /// Ask the adapter to cancel the in-flight attempt. Does nothing unless loading.
    pub fn cancel_load(&self) {
        self.send(Command::Cancel);
    }

    /// Wait until every operation issued on this lifecycle so far has been processed.
    pub async fn flush(&self) {
        let (sender, receiver) = oneshot::channel();
        self.send(Command::Flush(sender));
        let _ = receiver.await;
    }

    /// Status as of the last processed operation.
    pub fn status(&self) -> LoadStatus {
        self.shared.snapshot.borrow().status
    }

    /// Error as of the last processed operation. Only set while [`LoadStatus::FailedToLoad`].
    pub fn error(&self) -> Option<LoadError> {
        self.shared.snapshot.borrow().error.clone()
    }

    pub fn snapshot(&self) -> LoadSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    /// Subscribe to status and error changes.
    pub fn subscribe(&self) -> watch::Receiver<LoadSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    fn request(&self, retrying: bool) -> LoadHandle {
        let (sender, receiver) = oneshot::channel();
        self.send(Command::Load {
            retrying,
            completion: Completion::Handle(sender),
        });
        LoadHandle { receiver }
    }

    fn send(&self, command: Command) {
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            warning!(name = %self.shared.name, "load lifecycle driver is gone");
            if let Command::Load { completion, .. } = command {
                completion.complete(Err(LoadError::Closed));
            }
        }
    }
}

impl Debug for LoadLifecycle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.shared.snapshot.borrow();
        f.debug_struct("LoadLifecycle")
            .field("name", &self.shared.name)
            .field("status", &snapshot.status)
            .field("error", &snapshot.error)
            .finish()
    }
}

/// Outcome of a `load` or `retry_load` call.
///
/// Dropping the handle does not cancel the load.
pub struct LoadHandle {
    receiver: oneshot::Receiver<Result<(), LoadError>>,
}

impl Future for LoadHandle {
    type Output = Result<(), LoadError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(LoadError::Closed)))
    }
}

/// Owner of the lifecycle state. Processes commands one at a time.
struct Driver {
    shared: Arc<Shared>,
    commands: WeakUnboundedSender<Command>,
    adapter: Option<Weak<dyn LoadableAdapter>>,
    status: LoadStatus,
    error: Option<LoadError>,
    next_attempt: u64,
    // None once the current attempt has been resolved
    current_attempt: Option<u64>,
    attempt_task: Option<JoinHandle<()>>,
    pending: Vec<Completion>,
}

impl Driver {
    async fn run(mut self, mut receiver: UnboundedReceiver<Command>) {
        while let Some(command) = receiver.recv().await {
            match command {
                Command::Attach(adapter) => self.attach(adapter),
                Command::Load {
                    retrying,
                    completion,
                } => self.load(retrying, completion),
                Command::Cancel => self.cancel(),
                Command::Finished { attempt, outcome } => self.finish_attempt(attempt, outcome),
                Command::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!(name = %self.shared.name, "all lifecycle handles dropped, stopping driver");
    }

    fn live_adapter(&self) -> Option<Arc<dyn LoadableAdapter>> {
        self.adapter.as_ref().and_then(Weak::upgrade)
    }

    fn attach(&mut self, adapter: Weak<dyn LoadableAdapter>) {
        debug!(name = %self.shared.name, "adapter attached");
        self.adapter = Some(adapter);
        if let Some(adapter) = self.live_adapter() {
            adapter.on_status_changed(self.status);
            adapter.on_error_changed(self.error.as_ref());
        }
    }

    fn load(&mut self, retrying: bool, completion: Completion) {
        if !retrying {
            match self.status {
                LoadStatus::Loaded => return completion.complete(Ok(())),
                LoadStatus::Loading => {
                    trace!(name = %self.shared.name, "joining in-flight attempt");
                    self.pending.push(completion);
                    return;
                }
                LoadStatus::NotLoaded | LoadStatus::FailedToLoad => {}
            }
        }
        self.pending.push(completion);
        self.begin_attempt(retrying);
    }

    fn begin_attempt(&mut self, retrying: bool) {
        if let Some(task) = self.attempt_task.take() {
            task.abort();
        }
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        self.current_attempt = Some(attempt);
        self.transition(LoadStatus::Loading, None);

        let Some(adapter) = self.live_adapter() else {
            warning!(name = %self.shared.name, attempt, "load requested with no adapter attached");
            self.resolve(Err(LoadError::NoAdapter));
            return;
        };

        debug!(name = %self.shared.name, attempt, retrying, "starting load attempt");
        let future = adapter.start_loading(retrying);
        let commands = self.commands.clone();
        self.attempt_task = Some(tokio::spawn(async move {
            let outcome = future.await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Finished { attempt, outcome });
            }
        }));
    }

    fn cancel(&mut self) {
        if !self.status.is_loading() {
            trace!(name = %self.shared.name, status = %self.status, "nothing to cancel");
            return;
        }

        let report_cancellation = match self.live_adapter() {
            Some(adapter) => adapter.cancel_loading(),
            None => true,
        };
        if report_cancellation {
            debug!(name = %self.shared.name, attempt = ?self.current_attempt, "load cancelled");
            if let Some(task) = self.attempt_task.take() {
                task.abort();
            }
            self.resolve(Err(LoadError::Cancelled));
        } else {
            debug!(name = %self.shared.name, "adapter resolves cancellation itself");
        }
    }

    fn finish_attempt(&mut self, attempt: u64, outcome: Result<(), AdapterError>) {
        if self.current_attempt != Some(attempt) {
            debug!(name = %self.shared.name, attempt, "ignoring stale completion");
            return;
        }
        self.attempt_task = None;
        self.resolve(outcome.map_err(LoadError::from));
    }

    /// Settle the current attempt and hand the result to everyone waiting on it.
    fn resolve(&mut self, result: Result<(), LoadError>) {
        self.current_attempt = None;
        match &result {
            Ok(()) => {
                debug!(name = %self.shared.name, "loaded");
                self.transition(LoadStatus::Loaded, None)
            }
            Err(error) => {
                debug!(name = %self.shared.name, %error, "failed to load");
                self.transition(LoadStatus::FailedToLoad, Some(error.clone()))
            }
        }
        for completion in mem::take(&mut self.pending) {
            completion.complete(result.clone());
        }
    }

    fn transition(&mut self, status: LoadStatus, error: Option<LoadError>) {
        debug_assert!(
            self.status.can_transition_to(status),
            "invalid load status transition {} -> {}",
            self.status,
            status
        );
        debug_assert_eq!(error.is_some(), status == LoadStatus::FailedToLoad);

        let status_changed = self.status != status;
        let error_changed = self.error.is_some() || error.is_some();
        if !status_changed && !error_changed {
            return;
        }

        self.status = status;
        self.error = error;
        self.shared.snapshot.send_replace(LoadSnapshot {
            status,
            error: self.error.clone(),
        });

        if let Some(adapter) = self.live_adapter() {
            if status_changed {
                adapter.on_status_changed(status);
            }
            if error_changed {
                adapter.on_error_changed(self.error.as_ref());
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if let Some(task) = self.attempt_task.take() {
            task.abort();
        }
        for completion in mem::take(&mut self.pending) {
            completion.complete(Err(LoadError::Closed));
        }
    }
}
