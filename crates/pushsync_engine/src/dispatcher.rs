//! Reconciliation dispatcher.
//!
//! The dispatcher owns the device state and is the only thing that mutates
//! it or removes jobs from the queue. It handles one job per call to
//! [`Dispatcher::process_next`].
//!
//! ## Unstarted devices
//!
//! Until a registration succeeds there is no device id to talk to. Interest
//! jobs and user bindings are applied locally and kept at the head of the
//! queue as a *backlog*. A `Start` (or `RefreshToken`) registers, folds the
//! backlog's interest changes over the directory's initial set, sends one
//! corrective replace if needed, binds buffered users, then pops the whole
//! backlog together with itself. A `Stop` drops the backlog.
//!
//! ## Started devices
//!
//! Every job is handled against the directory and popped once handled,
//! whatever the outcome. A 404 on a device-scoped call triggers recreation:
//! register again with the last known token, push the local interests and
//! reissue the failed call once.

use crate::config::EngineConfig;
use crate::directory::{DirectoryApi, RetryingClient};
use crate::error::{ApiError, ApiResult, EngineResult};
use crate::events::{BindingError, EventSink, SyncEvent};
use crate::queue::{JobQueue, QueueEntry};
use crate::store::{DeviceState, DeviceStateStore};
use crate::token::{fetch_with_timeout, TokenProvider};
use parking_lot::{Mutex, RwLock};
use pushsync_protocol::{interests_hash, DeviceMetadata, InterestSet, Job};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Drains the job queue against the directory.
pub struct Dispatcher<A: DirectoryApi> {
    config: EngineConfig,
    client: RetryingClient<A>,
    store: Box<dyn DeviceStateStore>,
    state: DeviceState,
    published: Arc<RwLock<DeviceState>>,
    queue: Arc<Mutex<JobQueue>>,
    events: Arc<dyn EventSink>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    /// Metadata of the running application, refreshed by `ApplicationStart`.
    metadata: DeviceMetadata,
    /// Number of entries at the queue head kept for the next `Start`.
    backlog: usize,
    /// Bearer tokens fetched for buffered `SetUserId` jobs, by queue seq.
    fetched_tokens: HashMap<u64, String>,
}

impl<A: DirectoryApi> Dispatcher<A> {
    /// Creates a dispatcher, loading the stored device state.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored state cannot be loaded.
    pub fn new(
        config: EngineConfig,
        api: A,
        store: Box<dyn DeviceStateStore>,
        queue: Arc<Mutex<JobQueue>>,
        events: Arc<dyn EventSink>,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> EngineResult<Self> {
        let state = store.load()?;
        let client = RetryingClient::new(api, config.retry.clone());
        let metadata = config.metadata.clone();

        Ok(Self {
            published: Arc::new(RwLock::new(state.clone())),
            config,
            client,
            store,
            state,
            queue,
            events,
            token_provider,
            metadata,
            backlog: 0,
            fetched_tokens: HashMap::new(),
        })
    }

    /// Current device state.
    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Handle to the last persisted state, for readers on other threads.
    pub fn published_state(&self) -> Arc<RwLock<DeviceState>> {
        Arc::clone(&self.published)
    }

    /// Number of head entries held back until the device starts.
    pub fn backlog(&self) -> usize {
        self.backlog
    }

    /// The wrapped directory.
    pub fn api(&self) -> &A {
        self.client.api()
    }

    /// Handles the next unhandled job.
    ///
    /// Returns false if there was nothing to do.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue or the state store fails. The job then
    /// stays queued and is handled again from scratch.
    pub fn process_next(&mut self) -> EngineResult<bool> {
        let entry = self.queue.lock().get(self.backlog).cloned();
        let Some(entry) = entry else {
            return Ok(false);
        };

        debug!(
            seq = entry.seq,
            job = %entry.job,
            started = self.state.is_started(),
            "handling job"
        );

        if self.state.is_started() {
            self.handle_started(&entry)?;
            self.finish(entry.seq)?;
        } else {
            self.handle_unstarted(&entry)?;
        }
        Ok(true)
    }

    /// Handles jobs until none is left. Returns how many were handled.
    ///
    /// # Errors
    ///
    /// Stops at the first queue or store failure.
    pub fn run_until_idle(&mut self) -> EngineResult<usize> {
        let mut handled = 0;
        while self.process_next()? {
            handled += 1;
        }
        Ok(handled)
    }

    // Unstarted

    fn handle_unstarted(&mut self, entry: &QueueEntry) -> EngineResult<()> {
        match &entry.job {
            Job::Subscribe { .. } | Job::Unsubscribe { .. } | Job::SetSubscriptions { .. } => {
                if let Err(err) = entry.job.validate() {
                    warn!(seq = entry.seq, error = %err, "dropping job with invalid interest");
                    return self.discard(entry.seq);
                }
                let mut next = self.state.interests.clone();
                if entry.job.apply_to(&mut next) {
                    self.state.interests = next;
                    self.persist()?;
                    self.emit_interests();
                }
                self.backlog += 1;
                Ok(())
            }
            Job::SetUserId { user_id } => {
                if !self.binding_is_valid(&entry.job, user_id) {
                    return self.discard(entry.seq);
                }
                self.buffer_binding(entry.seq, user_id)
            }
            Job::ApplicationStart { metadata } => {
                debug!("device not started, nothing to reconcile");
                self.metadata = metadata.clone();
                self.discard(entry.seq)
            }
            Job::Stop => self.drop_backlog(),
            Job::Start {
                token,
                known_prior_ids,
            } => self.start(entry.seq, token, known_prior_ids),
            Job::RefreshToken { new_token } => self.start(entry.seq, new_token, &[]),
        }
    }

    fn buffer_binding(&mut self, seq: u64, user_id: &str) -> EngineResult<()> {
        let bound = self
            .state
            .user_id
            .clone()
            .or_else(|| self.buffered_user());

        match bound {
            Some(bound) if bound != user_id => {
                warn!(bound = %bound, requested = user_id, "user binding conflicts with pending binding");
                self.emit_binding(user_id, Some(BindingError::Conflict { bound }));
                self.discard(seq)
            }
            // Resolved as already bound once the first binding lands.
            Some(_) => {
                self.backlog += 1;
                Ok(())
            }
            None => match self.fetch_user_token(user_id) {
                Ok(token) => {
                    self.fetched_tokens.insert(seq, token);
                    self.backlog += 1;
                    Ok(())
                }
                Err(err) => {
                    warn!(user_id, error = %err, "could not fetch user token");
                    self.emit_binding(user_id, Some(err));
                    self.discard(seq)
                }
            },
        }
    }

    fn buffered_user(&self) -> Option<String> {
        self.queue
            .lock()
            .entries()
            .take(self.backlog)
            .find_map(|e| match &e.job {
                Job::SetUserId { user_id } => Some(user_id.clone()),
                _ => None,
            })
    }

    fn drop_backlog(&mut self) -> EngineResult<()> {
        let dropped = {
            let mut queue = self.queue.lock();
            let mut dropped = Vec::with_capacity(self.backlog + 1);
            for _ in 0..=self.backlog {
                if let Some(entry) = queue.pop()? {
                    dropped.push(entry);
                }
            }
            dropped
        };
        info!(dropped = dropped.len().saturating_sub(1), "stop before start, discarding pending jobs");

        self.backlog = 0;
        self.fetched_tokens.clear();
        for entry in &dropped {
            if let Job::SetUserId { user_id } = &entry.job {
                self.emit_binding(user_id, Some(BindingError::Discarded));
            }
        }
        self.reset()
    }

    fn start(&mut self, seq: u64, token: &str, known_prior_ids: &[String]) -> EngineResult<()> {
        let backlog: Vec<QueueEntry> = self
            .queue
            .lock()
            .entries()
            .take(self.backlog)
            .cloned()
            .collect();
        let metadata = self.metadata.clone();

        let registration = match self.client.with_retry("register", |api| {
            api.register(token, known_prior_ids, &metadata)
        }) {
            Ok(registration) => registration,
            Err(err) => {
                warn!(error = %err, pending = backlog.len(), "registration failed, abandoning start");
                self.queue.lock().remove(seq)?;
                return Ok(());
            }
        };
        info!(device_id = %registration.device_id, "device registered");

        let seed = registration.initial_interests;
        let mut folded = seed.clone();
        for entry in &backlog {
            entry.job.apply_to(&mut folded);
        }
        let changed = folded != self.state.interests;

        self.state.device_id = Some(registration.device_id.clone());
        self.state.token = Some(token.to_string());
        self.state.interests = folded.clone();
        self.state.confirmed_metadata = Some(metadata);
        self.state.confirmed_interests_hash = None;

        if folded == seed {
            self.state.confirmed_interests_hash = Some(interests_hash(&seed));
        } else {
            let device_id = registration.device_id;
            match self.client.with_retry("replace_subscriptions", |api| {
                api.replace_subscriptions(&device_id, &folded)
            }) {
                Ok(()) => self.state.confirmed_interests_hash = Some(interests_hash(&folded)),
                Err(err) => warn!(error = %err, "could not push buffered interests"),
            }
        }
        self.persist()?;
        if changed {
            self.emit_interests();
        }

        for entry in &backlog {
            if let Job::SetUserId { user_id } = &entry.job {
                let cached = self.fetched_tokens.remove(&entry.seq);
                self.bind_user(user_id, cached)?;
            }
        }

        {
            let mut queue = self.queue.lock();
            for _ in 0..=self.backlog {
                queue.pop()?;
            }
        }
        self.backlog = 0;
        self.fetched_tokens.clear();
        Ok(())
    }

    // Started

    fn handle_started(&mut self, entry: &QueueEntry) -> EngineResult<()> {
        match &entry.job {
            Job::Start { token, .. } => self.refresh_token(token),
            Job::RefreshToken { new_token } => self.refresh_token(new_token),
            Job::Subscribe { .. } | Job::Unsubscribe { .. } | Job::SetSubscriptions { .. } => {
                self.change_interests(&entry.job)
            }
            Job::ApplicationStart { metadata } => self.reconcile(metadata),
            Job::SetUserId { user_id } => {
                let cached = self.fetched_tokens.remove(&entry.seq);
                if !self.binding_is_valid(&entry.job, user_id) {
                    return Ok(());
                }
                self.bind_user(user_id, cached)
            }
            Job::Stop => self.stop(),
        }
    }

    fn refresh_token(&mut self, token: &str) -> EngineResult<()> {
        if self.state.token.as_deref() == Some(token) {
            debug!("token unchanged");
            return Ok(());
        }
        let Some(device_id) = self.state.device_id.clone() else {
            return Ok(());
        };

        match self
            .client
            .with_retry("refresh_token", |api| api.refresh_token(&device_id, token))
        {
            Ok(()) => {
                self.state.token = Some(token.to_string());
                self.persist()
            }
            Err(ApiError::DeviceNotFound) => {
                if !self.recreate_with(token.to_string())? {
                    warn!(device_id = %device_id, "keeping the old token until recreation succeeds");
                }
                Ok(())
            }
            Err(err) => {
                warn!(device_id = %device_id, error = %err, "token refresh failed");
                Ok(())
            }
        }
    }

    fn change_interests(&mut self, job: &Job) -> EngineResult<()> {
        if let Err(err) = job.validate() {
            warn!(job = %job, error = %err, "dropping job with invalid interest");
            return Ok(());
        }

        let previous = self.state.interests.clone();
        let mut next = previous.clone();
        if !job.apply_to(&mut next) {
            debug!(job = %job, "interest set unchanged");
            return Ok(());
        }
        self.state.interests = next;
        self.emit_interests();

        let outcome = self.call_device("interest change", true, |api, device_id| match job {
            Job::Subscribe { name } => api.subscribe(device_id, name),
            Job::Unsubscribe { name } => api.unsubscribe(device_id, name),
            Job::SetSubscriptions { interests } => api.replace_subscriptions(device_id, interests),
            _ => Ok(()),
        })?;

        match outcome {
            Ok(()) => {
                let was_confirmed = self.state.confirmed_interests_hash.as_deref()
                    == Some(interests_hash(&previous).as_str());
                if was_confirmed {
                    self.state.confirmed_interests_hash =
                        Some(interests_hash(&self.state.interests));
                }
            }
            Err(err @ ApiError::BadRequest { .. }) => {
                warn!(job = %job, error = %err, "directory rejected interest change, dropping");
            }
            Err(err) => {
                warn!(job = %job, error = %err, "interest change failed, dropping");
            }
        }
        self.persist()
    }

    fn reconcile(&mut self, metadata: &DeviceMetadata) -> EngineResult<()> {
        self.metadata = metadata.clone();
        let Some(device_id) = self.state.device_id.clone() else {
            return Ok(());
        };

        if self.state.confirmed_metadata.as_ref() != Some(metadata) {
            match self.client.once(|api| api.set_metadata(&device_id, metadata)) {
                Ok(()) => {
                    self.state.confirmed_metadata = Some(metadata.clone());
                    self.persist()?;
                }
                Err(ApiError::DeviceNotFound) => {
                    // Recreation reports metadata and pushes interests.
                    return self.recreate().map(|_| ());
                }
                Err(err) => warn!(error = %err, "metadata update failed"),
            }
        }

        let interests = self.state.interests.clone();
        let hash = interests_hash(&interests);
        if self.state.confirmed_interests_hash.as_deref() != Some(hash.as_str()) {
            match self
                .client
                .once(|api| api.replace_subscriptions(&device_id, &interests))
            {
                Ok(()) => {
                    self.state.confirmed_interests_hash = Some(hash);
                    self.persist()?;
                }
                Err(ApiError::DeviceNotFound) => {
                    return self.recreate().map(|_| ());
                }
                Err(err) => warn!(error = %err, "interest reconciliation failed"),
            }
        }
        Ok(())
    }

    fn binding_is_valid(&self, job: &Job, user_id: &str) -> bool {
        match job.validate() {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "dropping invalid user binding");
                self.emit_binding(user_id, Some(BindingError::InvalidUserId(err.to_string())));
                false
            }
        }
    }

    fn bind_user(&mut self, user_id: &str, cached_token: Option<String>) -> EngineResult<()> {
        match self.state.user_id.clone() {
            Some(bound) if bound == user_id => {
                debug!(user_id, "user already bound");
                self.emit_binding(user_id, None);
                return Ok(());
            }
            Some(bound) => {
                warn!(bound = %bound, requested = user_id, "user binding conflict");
                self.emit_binding(user_id, Some(BindingError::Conflict { bound }));
                return Ok(());
            }
            None => {}
        }

        let token = match cached_token {
            Some(token) => token,
            None => match self.fetch_user_token(user_id) {
                Ok(token) => token,
                Err(err) => {
                    warn!(user_id, error = %err, "could not fetch user token");
                    self.emit_binding(user_id, Some(err));
                    return Ok(());
                }
            },
        };

        let outcome =
            self.call_device("set_user", true, |api, device_id| api.set_user(device_id, &token))?;
        match outcome {
            Ok(()) => {
                info!(user_id, "user bound");
                self.state.user_id = Some(user_id.to_string());
                self.persist()?;
                self.emit_binding(user_id, None);
            }
            Err(err) => {
                warn!(user_id, error = %err, "user binding failed");
                let reason = match err.root() {
                    ApiError::TooManyDevices(reason) => BindingError::TooManyDevices(reason.clone()),
                    ApiError::TokenRejected { reason, .. } => {
                        BindingError::TokenRejected(reason.clone())
                    }
                    _ => BindingError::Failed(err.to_string()),
                };
                self.emit_binding(user_id, Some(reason));
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> EngineResult<()> {
        if let Some(device_id) = self.state.device_id.clone() {
            if let Err(err) = self.client.once(|api| api.delete(&device_id)) {
                debug!(device_id = %device_id, error = %err, "device delete failed, ignoring");
            }
            info!(device_id = %device_id, "device stopped");
        }
        self.fetched_tokens.clear();
        self.reset()
    }

    // Shared

    /// Calls the directory for the current device, recreating it on 404.
    ///
    /// The outer result carries storage failures, the inner one the
    /// directory outcome of the last call made.
    fn call_device<F>(
        &mut self,
        operation: &'static str,
        retry: bool,
        call: F,
    ) -> EngineResult<ApiResult<()>>
    where
        F: Fn(&A, &str) -> ApiResult<()>,
    {
        let Some(device_id) = self.state.device_id.clone() else {
            return Ok(Err(ApiError::DeviceNotFound));
        };

        let first = self.invoke(operation, retry, &device_id, &call);
        if !first.as_ref().is_err_and(ApiError::is_device_not_found) {
            return Ok(first);
        }

        warn!(device_id = %device_id, operation, "device not found, recreating");
        if !self.recreate()? {
            return Ok(first);
        }
        let Some(device_id) = self.state.device_id.clone() else {
            return Ok(first);
        };
        Ok(self.invoke(operation, retry, &device_id, &call))
    }

    fn invoke<F>(&self, operation: &'static str, retry: bool, device_id: &str, call: &F) -> ApiResult<()>
    where
        F: Fn(&A, &str) -> ApiResult<()>,
    {
        if retry {
            self.client
                .with_retry(operation, |api| call(api, device_id))
        } else {
            self.client.once(|api| call(api, device_id))
        }
    }

    /// Registers a fresh device after the old one vanished.
    ///
    /// Local interests are kept and pushed to the new device; the user
    /// binding is dropped. Returns false if registration failed.
    fn recreate(&mut self) -> EngineResult<bool> {
        let Some(token) = self.state.token.clone() else {
            warn!("cannot recreate device without a token");
            return Ok(false);
        };
        self.recreate_with(token)
    }

    /// Registers a new device with `token`. The token is stored only once
    /// the registration succeeds.
    fn recreate_with(&mut self, token: String) -> EngineResult<bool> {
        let metadata = self.metadata.clone();

        let registration = match self
            .client
            .with_retry("register", |api| api.register(&token, &[], &metadata))
        {
            Ok(registration) => registration,
            Err(err) => {
                warn!(error = %err, "device recreation failed");
                return Ok(false);
            }
        };
        info!(
            old = ?self.state.device_id,
            new = %registration.device_id,
            "device recreated"
        );

        self.state.device_id = Some(registration.device_id.clone());
        self.state.token = Some(token);
        self.state.user_id = None;
        self.state.confirmed_metadata = Some(metadata);
        self.state.confirmed_interests_hash = None;

        let interests = self.state.interests.clone();
        if interests == registration.initial_interests {
            self.state.confirmed_interests_hash = Some(interests_hash(&interests));
        } else {
            match self.client.with_retry("replace_subscriptions", |api| {
                api.replace_subscriptions(&registration.device_id, &interests)
            }) {
                Ok(()) => self.state.confirmed_interests_hash = Some(interests_hash(&interests)),
                Err(err) => warn!(error = %err, "could not restore interests after recreation"),
            }
        }
        self.persist()?;
        Ok(true)
    }

    fn fetch_user_token(&self, user_id: &str) -> Result<String, BindingError> {
        let provider = self
            .token_provider
            .as_ref()
            .ok_or(BindingError::NoTokenProvider)?;
        fetch_with_timeout(provider, user_id, self.config.token_provider_timeout)
    }

    fn reset(&mut self) -> EngineResult<()> {
        let had_interests = !self.state.interests.is_empty();
        self.state = DeviceState::default();
        self.persist()?;
        if had_interests {
            self.emit_interests();
        }
        Ok(())
    }

    fn discard(&mut self, seq: u64) -> EngineResult<()> {
        self.queue.lock().remove(seq)?;
        Ok(())
    }

    fn finish(&mut self, seq: u64) -> EngineResult<()> {
        let mut queue = self.queue.lock();
        if queue.peek().map(|e| e.seq) == Some(seq) {
            queue.pop()?;
        } else {
            queue.remove(seq)?;
        }
        Ok(())
    }

    fn persist(&mut self) -> EngineResult<()> {
        self.store.save(&self.state)?;
        *self.published.write() = self.state.clone();
        Ok(())
    }

    fn emit_interests(&self) {
        self.events
            .on_event(SyncEvent::SubscriptionsChanged(self.state.interests.clone()));
    }

    fn emit_binding(&self, user_id: &str, error: Option<BindingError>) {
        self.events.on_event(SyncEvent::UserIdBound {
            user_id: user_id.to_string(),
            error,
        });
    }
}

/// Folds queued interest jobs over `base`. A `Stop` resets to empty.
pub(crate) fn project_interests<'a, I>(base: &InterestSet, jobs: I) -> InterestSet
where
    I: IntoIterator<Item = &'a Job>,
{
    let mut projected = base.clone();
    for job in jobs {
        match job {
            Job::Stop => projected.clear(),
            other => {
                other.apply_to(&mut projected);
            }
        }
    }
    projected
}
