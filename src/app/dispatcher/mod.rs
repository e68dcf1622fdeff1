use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_stream::wrappers::ReceiverStream;

use crate::app::request::{InferenceRequest, RequestId};
use crate::app::stream::{self, GenerationSession, SessionControl, TokenEvent};
use crate::core::{Event, EventBus, ModelLease, ModelManager};
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverloadPolicy {
    /// Fail with `OverloadError` as soon as every slot is taken.
    Reject,
    /// Wait in arrival order for a slot, bounded by the queue timeout.
    Block,
}

impl std::str::FromStr for OverloadPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(OverloadPolicy::Reject),
            "block" => Ok(OverloadPolicy::Block),
            other => Err(format!("unknown overload policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_sessions: usize,
    pub policy: OverloadPolicy,
    pub queue_timeout: Duration,
    pub max_queued: usize,
    pub event_buffer: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1,
            policy: OverloadPolicy::Reject,
            queue_timeout: Duration::from_secs(30),
            max_queued: 16,
            event_buffer: 64,
        }
    }
}

impl DispatcherConfig {
    pub fn max_sessions(mut self, n: usize) -> Self {
        self.max_sessions = n.max(1);
        self
    }

    pub fn policy(mut self, policy: OverloadPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    pub fn max_queued(mut self, n: usize) -> Self {
        self.max_queued = n;
        self
    }

    pub fn event_buffer(mut self, n: usize) -> Self {
        self.event_buffer = n.max(1);
        self
    }
}

/// Ordered token events of one admitted request.
pub struct TokenStream {
    request_id: RequestId,
    inner: ReceiverStream<TokenEvent>,
}

impl TokenStream {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

impl Stream for TokenStream {
    type Item = TokenEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TokenEvent>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

type LiveSessions = Arc<Mutex<HashMap<RequestId, Arc<SessionControl>>>>;

/// Admits inference requests into a bounded pool of generation slots and runs
/// each one on its own blocking worker.
pub struct Dispatcher {
    models: Arc<ModelManager>,
    config: DispatcherConfig,
    slots: Arc<Semaphore>,
    waiting: AtomicUsize,
    next_id: AtomicU64,
    live: LiveSessions,
}

impl Dispatcher {
    pub fn new(models: Arc<ModelManager>, config: DispatcherConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_sessions.max(1)));
        Self {
            models,
            config,
            slots,
            waiting: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn models(&self) -> &Arc<ModelManager> {
        &self.models
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Validates and admits a request. Returns once a slot is held; tokens
    /// arrive on the returned stream.
    pub async fn submit(&self, request: InferenceRequest) -> Result<TokenStream> {
        request.validate()?;
        self.models.ensure_ready(request.handle)?;

        let permit = self.admit().await?;
        // The handle may have gone away while we waited for a slot.
        let lease = self.models.lease(request.handle)?;

        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let control = SessionControl::new();
        self.live.lock().insert(request_id, Arc::clone(&control));

        let (tx, rx) = mpsc::channel(self.config.event_buffer);
        tracing::debug!(
            "Admitted request {} on handle {} ({} prompt chars)",
            request_id,
            request.handle,
            request.prompt.len()
        );
        self.models.event_bus().publish(Event::GenerationStarted {
            request_id,
            handle: request.handle,
        });

        let job = Job {
            session: GenerationSession::new(request_id, request.prompt, request.params, control),
            lease,
            permit,
            tx,
            live: Arc::clone(&self.live),
            events: Arc::clone(self.models.event_bus()),
        };
        tokio::task::spawn_blocking(move || job.run());

        Ok(TokenStream {
            request_id,
            inner: ReceiverStream::new(rx),
        })
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        let overload = CoreError::Overload { capacity: self.config.max_sessions };

        if let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() {
            return Ok(permit);
        }
        if self.config.policy == OverloadPolicy::Reject {
            return Err(overload);
        }

        let waiting = WaitingGuard::enter(&self.waiting);
        if waiting.position >= self.config.max_queued {
            tracing::debug!("Queue full ({} waiting), rejecting", waiting.position);
            return Err(overload);
        }

        match tokio::time::timeout(self.config.queue_timeout, Arc::clone(&self.slots).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) | Err(_) => Err(overload),
        }
    }

    /// Signals cancellation. True when a live session acknowledged it; that
    /// session's stream is then guaranteed to end with `cancelled`.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        let acknowledged = self
            .live
            .lock()
            .get(&request_id)
            .map(|control| control.cancel())
            .unwrap_or(false);
        if acknowledged {
            tracing::debug!("Cancellation requested for {}", request_id);
        }
        acknowledged
    }

    pub fn cancel_all(&self) -> usize {
        self.live.lock().values().filter(|c| c.cancel()).count()
    }

    pub fn active_sessions(&self) -> usize {
        self.live.lock().len()
    }
}

struct WaitingGuard<'a> {
    counter: &'a AtomicUsize,
    position: usize,
}

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let position = counter.fetch_add(1, Ordering::SeqCst);
        Self { counter, position }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything a worker owns for one generation.
struct Job {
    session: GenerationSession,
    lease: ModelLease,
    permit: OwnedSemaphorePermit,
    tx: mpsc::Sender<TokenEvent>,
    live: LiveSessions,
    events: Arc<EventBus>,
}

impl Job {
    fn run(self) {
        let Job { session, lease, permit, tx, live, events } = self;
        let request_id = session.request_id;
        let control = Arc::clone(&session.control);
        let runtime = Arc::clone(lease.runtime());

        let (last, tokens) = {
            let mut guard = runtime.blocking_lock();
            // Another session may have faulted or reloaded the handle while
            // this one waited for the runtime.
            if let Err(err) = lease.ensure_ready() {
                tracing::debug!("Request {} refused: {}", request_id, err);
                (Some(stream::refuse(&session, err.to_string())), 0)
            } else {
                let mut generation = stream::run(session, &mut **guard, lease.config().seed);
                let mut last = None;

                for event in generation.by_ref() {
                    if event.is_final {
                        last = Some(event);
                        break;
                    }
                    if tx.blocking_send(event).is_err() {
                        // Nobody is listening any more.
                        control.cancel();
                    }
                }

                if let Some(fault) = generation.fault() {
                    tracing::warn!("Request {} failed: {}", request_id, fault.message);
                    // Marked while the runtime is still held, so no queued
                    // worker can start on it first.
                    if !fault.recoverable {
                        lease.mark_faulted(&fault.message);
                    }
                }
                (last, generation.generated_tokens())
            }
        };

        // Release the handle and the slot before the final event goes out, so
        // a host reacting to it can unload or resubmit immediately.
        drop(lease);
        live.lock().remove(&request_id);
        drop(permit);

        if let Some(event) = last {
            let reason = event.finish_reason.map(|r| r.as_str()).unwrap_or("unknown");
            tracing::debug!("Request {} finished: {} after {} tokens", request_id, reason, tokens);
            events.publish(Event::GenerationFinished {
                request_id,
                tokens,
                reason: reason.to_string(),
            });
            let _ = tx.blocking_send(event);
        }
    }
}
