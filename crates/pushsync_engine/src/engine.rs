//! The engine facade handed to the host application.

use crate::config::EngineConfig;
use crate::directory::DirectoryApi;
use crate::dispatcher::{project_interests, Dispatcher};
use crate::error::{EngineError, EngineResult};
use crate::events::EventSink;
use crate::queue::JobQueue;
use crate::store::{DeviceState, DeviceStateStore, FileStateStore};
use crate::token::TokenProvider;
use parking_lot::{Condvar, Mutex, RwLock};
use pushsync_protocol::{validate_interest, validate_interests, DeviceMetadata, InterestSet, Job};
use pushsync_storage::{FileBackend, StorageBackend};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

enum Signal {
    Wake,
    Shutdown,
}

#[derive(Debug, Default)]
struct WorkerStatus {
    busy: bool,
    backlog: usize,
}

// Lock order: status before queue.
struct Shared {
    queue: Arc<Mutex<JobQueue>>,
    state: Arc<RwLock<DeviceState>>,
    status: Mutex<WorkerStatus>,
    idle: Condvar,
    stopped: AtomicBool,
}

/// Client-side sync engine for one directory instance.
///
/// Every mutating call validates its input, appends a job to the durable
/// queue and returns. A single worker thread drains the queue against the
/// directory, so calls never block on the network.
///
/// # Example
///
/// ```rust,no_run
/// use pushsync_engine::{EngineConfig, MockDirectory, NoopEventSink, SyncEngine};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let dir = std::env::temp_dir().join("pushsync-doc");
/// let engine = SyncEngine::open(
///     EngineConfig::new("instance-1"),
///     MockDirectory::new(),
///     &dir,
///     Arc::new(NoopEventSink),
///     None,
/// )
/// .unwrap();
///
/// engine.subscribe("donuts").unwrap();
/// engine.start("push-token").unwrap();
/// engine.wait_idle(Duration::from_secs(5)).unwrap();
/// assert!(engine.device_id().is_some());
/// ```
pub struct SyncEngine {
    shared: Arc<Shared>,
    signals: Sender<Signal>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Creates an engine over explicit storage and starts its worker.
    ///
    /// Jobs left in the queue by a previous run are handled right away.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue or the device state cannot be loaded.
    pub fn new<A, S>(
        config: EngineConfig,
        api: A,
        store: S,
        queue_backend: Box<dyn StorageBackend>,
        events: Arc<dyn EventSink>,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> EngineResult<Self>
    where
        A: DirectoryApi + 'static,
        S: DeviceStateStore + 'static,
    {
        let instance_id = config.instance_id.clone();
        let queue = Arc::new(Mutex::new(JobQueue::open(queue_backend)?));
        let dispatcher = Dispatcher::new(
            config,
            api,
            Box::new(store),
            Arc::clone(&queue),
            events,
            token_provider,
        )?;

        let shared = Arc::new(Shared {
            queue,
            state: dispatcher.published_state(),
            status: Mutex::new(WorkerStatus {
                busy: true,
                ..WorkerStatus::default()
            }),
            idle: Condvar::new(),
            stopped: AtomicBool::new(false),
        });

        let (signals, receiver) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!("pushsync-{instance_id}"))
            .spawn(move || run_worker(dispatcher, &receiver, &worker_shared))
            .map_err(|e| {
                error!(error = %e, "could not start sync worker");
                EngineError::WorkerStopped
            })?;

        info!(instance_id = %instance_id, "sync engine started");
        Ok(Self {
            shared,
            signals,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Creates an engine keeping its queue and state files in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be opened or loaded.
    pub fn open<A>(
        config: EngineConfig,
        api: A,
        dir: &Path,
        events: Arc<dyn EventSink>,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> EngineResult<Self>
    where
        A: DirectoryApi + 'static,
    {
        let backend = FileBackend::open_with_create_dirs(&config.queue_path(dir))?;
        let store = FileStateStore::open(&config.state_path(dir))?;
        Self::new(config, api, store, Box::new(backend), events, token_provider)
    }

    /// Registers the device with `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the job cannot be queued.
    pub fn start(&self, token: &str) -> EngineResult<()> {
        self.start_with_prior_ids(token, Vec::new())
    }

    /// Registers the device, naming ids this installation used before so
    /// the directory can carry their interests over.
    ///
    /// # Errors
    ///
    /// Returns an error if the job cannot be queued.
    pub fn start_with_prior_ids(
        &self,
        token: &str,
        known_prior_ids: Vec<String>,
    ) -> EngineResult<()> {
        self.enqueue(Job::Start {
            token: token.to_string(),
            known_prior_ids,
        })
    }

    /// Reports a new push token.
    ///
    /// # Errors
    ///
    /// Returns an error if the job cannot be queued.
    pub fn refresh_token(&self, new_token: &str) -> EngineResult<()> {
        self.enqueue(Job::RefreshToken {
            new_token: new_token.to_string(),
        })
    }

    /// Adds an interest.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInterest`] for a bad name, or an error
    /// if the job cannot be queued.
    pub fn subscribe(&self, name: &str) -> EngineResult<()> {
        validate_interest(name)?;
        self.enqueue(Job::Subscribe {
            name: name.to_string(),
        })
    }

    /// Removes an interest.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInterest`] for a bad name, or an error
    /// if the job cannot be queued.
    pub fn unsubscribe(&self, name: &str) -> EngineResult<()> {
        validate_interest(name)?;
        self.enqueue(Job::Unsubscribe {
            name: name.to_string(),
        })
    }

    /// Replaces the whole interest set.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInterest`] for the first bad name, or
    /// an error if the job cannot be queued.
    pub fn set_subscriptions<I, S>(&self, interests: I) -> EngineResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let interests: InterestSet = interests.into_iter().map(Into::into).collect();
        validate_interests(&interests)?;
        self.enqueue(Job::SetSubscriptions { interests })
    }

    /// Forgets the device and registers a fresh one with the same token.
    ///
    /// # Errors
    ///
    /// Returns an error if the jobs cannot be queued.
    pub fn clear_all_state(&self) -> EngineResult<()> {
        let mut queue = self.shared.queue.lock();
        let mut token = self.shared.state.read().token.clone();
        for entry in queue.entries() {
            match &entry.job {
                Job::Start { token: t, .. } | Job::RefreshToken { new_token: t } => {
                    token = Some(t.clone());
                }
                _ => {}
            }
        }

        self.push(&mut queue, Job::Stop)?;
        if let Some(token) = token {
            self.push(
                &mut queue,
                Job::Start {
                    token,
                    known_prior_ids: Vec::new(),
                },
            )?;
        }
        Ok(())
    }

    /// Binds the device to `user_id`.
    ///
    /// The outcome is reported through a `UserIdBound` event.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidUserId`] for an empty id, or
    /// [`EngineError::IdentityConflict`] if the device is bound, or about
    /// to be bound, to a different user.
    pub fn set_user_id(&self, user_id: &str) -> EngineResult<()> {
        let job = Job::SetUserId {
            user_id: user_id.to_string(),
        };
        job.validate()?;

        let mut queue = self.shared.queue.lock();
        let mut bound = self.shared.state.read().user_id.clone();
        for entry in queue.entries() {
            match &entry.job {
                Job::Stop => bound = None,
                Job::SetUserId { user_id: queued } if bound.is_none() => {
                    bound = Some(queued.clone());
                }
                _ => {}
            }
        }

        if let Some(bound) = bound {
            if bound != user_id {
                return Err(EngineError::IdentityConflict {
                    bound,
                    requested: user_id.to_string(),
                });
            }
        }
        self.push(&mut queue, job)
    }

    /// Reports that the host application booted with `metadata`.
    ///
    /// # Errors
    ///
    /// Returns an error if the job cannot be queued.
    pub fn application_start(&self, metadata: DeviceMetadata) -> EngineResult<()> {
        self.enqueue(Job::ApplicationStart { metadata })
    }

    /// Unregisters the device and forgets all state.
    ///
    /// # Errors
    ///
    /// Returns an error if the job cannot be queued.
    pub fn stop(&self) -> EngineResult<()> {
        self.enqueue(Job::Stop)
    }

    /// Interest set including changes still waiting in the queue.
    pub fn interests(&self) -> InterestSet {
        let queue = self.shared.queue.lock();
        let stored = self.shared.state.read().interests.clone();
        project_interests(&stored, queue.entries().map(|e| &e.job))
    }

    /// Directory id of the device, once registered.
    pub fn device_id(&self) -> Option<String> {
        self.shared.state.read().device_id.clone()
    }

    /// User the device is bound to.
    pub fn user_id(&self) -> Option<String> {
        self.shared.state.read().user_id.clone()
    }

    /// Copy of the persisted device state.
    pub fn state(&self) -> DeviceState {
        self.shared.state.read().clone()
    }

    /// Number of jobs in the queue, including ones held until start.
    pub fn pending_jobs(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Blocks until the worker has handled every job it can.
    ///
    /// Jobs held back until the device starts do not count.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] if that takes longer than
    /// `timeout`, or [`EngineError::WorkerStopped`] after shutdown.
    pub fn wait_idle(&self, timeout: Duration) -> EngineResult<()> {
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.status.lock();
        loop {
            if self.shared.stopped.load(Ordering::Acquire) {
                return Err(EngineError::WorkerStopped);
            }
            if !status.busy && self.shared.queue.lock().len() <= status.backlog {
                return Ok(());
            }
            if self.shared.idle.wait_until(&mut status, deadline).timed_out() {
                return Err(EngineError::Timeout);
            }
        }
    }

    /// Stops the worker after the job it is handling. Queued jobs stay in
    /// the queue for the next run.
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = self.signals.send(Signal::Shutdown);
        if worker.join().is_err() {
            error!("sync worker panicked");
        }
    }

    fn enqueue(&self, job: Job) -> EngineResult<()> {
        let mut queue = self.shared.queue.lock();
        self.push(&mut queue, job)
    }

    fn push(&self, queue: &mut JobQueue, job: Job) -> EngineResult<()> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(EngineError::WorkerStopped);
        }
        let kind = job.kind();
        let seq = queue.push(job)?;
        debug!(seq, job = kind.as_str(), "job queued");
        self.signals
            .send(Signal::Wake)
            .map_err(|_| EngineError::WorkerStopped)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("pending_jobs", &self.pending_jobs())
            .finish_non_exhaustive()
    }
}

fn run_worker<A: DirectoryApi>(
    mut dispatcher: Dispatcher<A>,
    signals: &Receiver<Signal>,
    shared: &Shared,
) {
    debug!("sync worker running");
    loop {
        shared.status.lock().busy = true;
        loop {
            match dispatcher.process_next() {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    error!(error = %err, "job handling failed, waiting for next wake-up");
                    break;
                }
            }
        }
        {
            let mut status = shared.status.lock();
            status.busy = false;
            status.backlog = dispatcher.backlog();
        }
        shared.idle.notify_all();

        match signals.recv() {
            Ok(Signal::Wake) => {}
            Ok(Signal::Shutdown) | Err(_) => break,
        }
    }

    shared.stopped.store(true, Ordering::Release);
    shared.status.lock().busy = false;
    shared.idle.notify_all();
    debug!("sync worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::events::{BindingError, MemoryEventSink};
    use crate::mock::{MockDirectory, Op};
    use crate::store::MemoryStateStore;
    use pushsync_storage::InMemoryBackend;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        mock: Arc<MockDirectory>,
        events: MemoryEventSink,
        engine: SyncEngine,
    }

    fn fixture() -> Fixture {
        let mock = Arc::new(MockDirectory::new());
        let events = MemoryEventSink::new();
        let provider: Arc<dyn TokenProvider> =
            Arc::new(|user: &str| -> Result<String, String> { Ok(format!("bearer-{user}")) });
        let config = EngineConfig::new("instance").with_retry(
            RetryConfig::default()
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(2)),
        );
        let engine = SyncEngine::new(
            config,
            Arc::clone(&mock),
            MemoryStateStore::new(),
            Box::new(InMemoryBackend::new()),
            Arc::new(events.clone()),
            Some(provider),
        )
        .unwrap();

        Fixture {
            mock,
            events,
            engine,
        }
    }

    fn set(names: &[&str]) -> InterestSet {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn start_and_subscribe_reach_directory() {
        let f = fixture();
        f.engine.start("tok-1").unwrap();
        f.engine.subscribe("donuts").unwrap();
        f.engine.wait_idle(WAIT).unwrap();

        assert_eq!(f.engine.device_id().as_deref(), Some("device-1"));
        assert_eq!(f.engine.interests(), set(&["donuts"]));
        assert_eq!(f.mock.device_interests("device-1"), Some(set(&["donuts"])));
        assert_eq!(f.engine.pending_jobs(), 0);
    }

    #[test]
    fn invalid_interest_is_rejected_synchronously() {
        let f = fixture();
        let err = f.engine.subscribe("white space").unwrap_err();
        assert!(matches!(err, EngineError::InvalidInterest { .. }));

        let err = f.engine.set_subscriptions(["ok", ""]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInterest { .. }));
        assert_eq!(f.engine.pending_jobs(), 0);
    }

    #[test]
    fn interests_include_queued_changes() {
        let f = fixture();
        f.engine.subscribe("a").unwrap();
        f.engine.subscribe("b").unwrap();
        f.engine.unsubscribe("a").unwrap();
        assert_eq!(f.engine.interests(), set(&["b"]));

        f.engine.wait_idle(WAIT).unwrap();
        assert_eq!(f.engine.interests(), set(&["b"]));
        assert_eq!(f.engine.pending_jobs(), 3);
        assert_eq!(f.mock.call_count(), 0);
    }

    #[test]
    fn conflicting_user_is_rejected_before_queueing() {
        let f = fixture();
        f.engine.set_user_id("alice").unwrap();
        f.engine.set_user_id("alice").unwrap();

        let err = f.engine.set_user_id("bob").unwrap_err();
        assert!(matches!(
            err,
            EngineError::IdentityConflict { ref bound, ref requested }
                if bound == "alice" && requested == "bob"
        ));

        f.engine.stop().unwrap();
        f.engine.set_user_id("bob").unwrap();
    }

    #[test]
    fn empty_user_id_is_rejected_before_queueing() {
        let f = fixture();
        f.engine.start("tok-1").unwrap();
        let err = f.engine.set_user_id("").unwrap_err();
        assert!(matches!(err, EngineError::InvalidUserId { .. }));

        f.engine.set_user_id("alice").unwrap();
        f.engine.wait_idle(WAIT).unwrap();

        assert_eq!(f.mock.ops(), vec![Op::Register, Op::SetUser]);
        assert_eq!(f.engine.user_id().as_deref(), Some("alice"));
        assert_eq!(f.events.bindings(), vec![("alice".to_string(), None)]);
    }

    #[test]
    fn bound_user_is_reported() {
        let f = fixture();
        f.engine.start("tok-1").unwrap();
        f.engine.set_user_id("alice").unwrap();
        f.engine.wait_idle(WAIT).unwrap();

        assert_eq!(f.engine.user_id().as_deref(), Some("alice"));
        assert_eq!(f.events.bindings(), vec![("alice".to_string(), None)]);
        assert!(matches!(
            f.engine.set_user_id("bob"),
            Err(EngineError::IdentityConflict { .. })
        ));
    }

    #[test]
    fn stop_before_start_reports_discarded_binding() {
        let f = fixture();
        f.engine.set_user_id("alice").unwrap();
        f.engine.stop().unwrap();
        f.engine.wait_idle(WAIT).unwrap();

        assert_eq!(
            f.events.bindings(),
            vec![("alice".to_string(), Some(BindingError::Discarded))]
        );
        assert_eq!(f.engine.pending_jobs(), 0);
    }

    #[test]
    fn clear_all_state_registers_a_fresh_device() {
        let f = fixture();
        f.engine.start("tok-1").unwrap();
        f.engine.subscribe("a").unwrap();
        f.engine.wait_idle(WAIT).unwrap();
        f.mock.clear_calls();

        f.engine.clear_all_state().unwrap();
        assert!(f.engine.interests().is_empty());
        f.engine.wait_idle(WAIT).unwrap();

        assert_eq!(f.mock.ops(), vec![Op::Delete, Op::Register]);
        assert_eq!(f.engine.device_id().as_deref(), Some("device-2"));
        assert_eq!(f.engine.state().token.as_deref(), Some("tok-1"));
        assert!(f.engine.interests().is_empty());
    }

    #[test]
    fn shutdown_rejects_new_jobs_and_keeps_queue() {
        let f = fixture();
        f.engine.shutdown();
        f.engine.shutdown();

        assert!(matches!(
            f.engine.subscribe("a"),
            Err(EngineError::WorkerStopped)
        ));
        assert!(matches!(
            f.engine.wait_idle(WAIT),
            Err(EngineError::WorkerStopped)
        ));
    }
}
