use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::error::ClientError;
use crate::http::bucket::{self, Bucket, BucketUpdate, RateLimitScope};
use crate::http::request::{RestRequest, RestResponse};
use crate::http::RestTransport;
use crate::task::{TaskFuture, TaskOutcome, TaskState};

/// Upper bound on one blocking wait for new submissions. Bounded so that
/// bucket resets and parked work are re-examined even when nothing new
/// arrives.
const WORKER_POLL: Duration = Duration::from_millis(500);

pub(crate) enum SchedulerMessage {
    Submit(QueuedRequest),
    /// A drain timer fired: move parked requests back onto the queue.
    ReleaseParked,
}

pub(crate) struct QueuedRequest {
    pub request: RestRequest,
    pub future: TaskFuture<RestResponse>,
    pub retries: u32,
}

/// Read-only snapshot of scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub queued: usize,
    pub parked: usize,
    pub global_active: bool,
}

#[derive(Default)]
pub(crate) struct SchedulerShared {
    queued: AtomicUsize,
    parked: AtomicUsize,
    global_active: AtomicBool,
}

impl SchedulerShared {
    pub fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            queued: self.queued.load(Ordering::SeqCst),
            parked: self.parked.load(Ordering::SeqCst),
            global_active: self.global_active.load(Ordering::SeqCst),
        }
    }
}

/// Single-writer dispatch loop serializing outbound requests against
/// per-route and global rate-limit state.
///
/// Exactly one of these runs per client. Callers enqueue from any task;
/// only this worker touches bucket state or executes requests, so effects
/// on one bucket land in the order the worker processed them. Requests a
/// bucket cannot admit yet are skipped and retried on a later pass, never
/// blocking the loop.
pub(crate) struct RequestScheduler {
    rx: mpsc::UnboundedReceiver<SchedulerMessage>,
    /// Kept for drain timers, which only ever message the worker.
    tx: mpsc::UnboundedSender<SchedulerMessage>,
    transport: Arc<dyn RestTransport>,
    /// Keyed by route bucket key, plus `shared:<id>` entries for server
    /// buckets spanning several routes. Written only by this worker.
    buckets: Arc<DashMap<String, Bucket>>,
    route_buckets: HashMap<String, String>,
    bucket_routes: HashMap<String, HashSet<String>>,
    queue: VecDeque<QueuedRequest>,
    /// Requests held back by an active global window.
    parked: VecDeque<QueuedRequest>,
    global_until: Option<Instant>,
    global_retry_delay: Duration,
    /// A drain timer is in flight; parked work will be revisited.
    drain_armed: bool,
    max_retries: u32,
    global_batch_size: usize,
    shared: Arc<SchedulerShared>,
    stop: watch::Receiver<bool>,
}

impl RequestScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::UnboundedReceiver<SchedulerMessage>,
        tx: mpsc::UnboundedSender<SchedulerMessage>,
        transport: Arc<dyn RestTransport>,
        buckets: Arc<DashMap<String, Bucket>>,
        shared: Arc<SchedulerShared>,
        max_retries: u32,
        global_batch_size: usize,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            rx,
            tx,
            transport,
            buckets,
            route_buckets: HashMap::new(),
            bucket_routes: HashMap::new(),
            queue: VecDeque::new(),
            parked: VecDeque::new(),
            global_until: None,
            global_retry_delay: Duration::from_secs(1),
            drain_armed: false,
            max_retries,
            global_batch_size,
            shared,
            stop,
        }
    }

    pub async fn run(mut self) {
        let mut stop = self.stop.clone();
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => self.accept(message),
                    // every submitter dropped: stop
                    None => break,
                },
                // stop flag set, or the owning client dropped
                _ = stop.changed() => break,
                // poll tick: a bucket or the global window may have reset
                _ = tokio::time::sleep(WORKER_POLL) => {}
            }
            while let Ok(message) = self.rx.try_recv() {
                self.accept(message);
            }
            self.process_queue().await;
            self.publish_stats();
        }

        let abandoned = self.queue.len() + self.parked.len();
        if abandoned > 0 {
            tracing::debug!(abandoned, "scheduler stopping with requests in flight");
        }
        for item in self.queue.drain(..).chain(self.parked.drain(..)) {
            item.future
                .complete(TaskOutcome::Failure(ClientError::Canceled));
        }
    }

    fn accept(&mut self, message: SchedulerMessage) {
        match message {
            SchedulerMessage::Submit(item) => self.queue.push_back(item),
            SchedulerMessage::ReleaseParked => self.release_parked(),
        }
    }

    fn global_active(&self) -> bool {
        matches!(self.global_until, Some(until) if Instant::now() < until)
    }

    async fn process_queue(&mut self) {
        for mut entry in self.buckets.iter_mut() {
            entry.queue_size = 0;
        }

        let mut pass = std::mem::take(&mut self.queue);
        while let Some(item) = pass.pop_front() {
            if item.future.state() == TaskState::Canceled {
                continue;
            }

            if item.request.route.global && self.global_active() {
                self.parked.push_back(item);
                if !self.drain_armed {
                    let remaining = self
                        .global_until
                        .map(|until| until.saturating_duration_since(Instant::now()))
                        .unwrap_or(self.global_retry_delay);
                    self.arm_release_timer(remaining);
                }
                continue;
            }

            let route_key = item.request.route.bucket_key();
            let now = chrono::Utc::now().timestamp();

            // shared-resource buckets gate first, then the route's own
            let shared_key = self.shared_key_for(&route_key);
            let blocked_on = if !self.bucket_accepts(shared_key.as_deref(), now) {
                shared_key.clone()
            } else if !self.bucket_accepts(Some(route_key.as_str()), now) {
                Some(route_key.clone())
            } else {
                None
            };
            if let Some(key) = blocked_on {
                if let Some(mut bucket) = self.buckets.get_mut(&key) {
                    bucket.queue_size += 1;
                }
                // skip and move on; the next pass retries it
                self.queue.push_back(item);
                continue;
            }

            if let Some(key) = shared_key.as_deref() {
                if let Some(mut bucket) = self.buckets.get_mut(key) {
                    bucket.acquire(now);
                }
            }
            if let Some(mut bucket) = self.buckets.get_mut(&route_key) {
                bucket.acquire(now);
            }

            self.execute(item).await;
        }
    }

    /// The route's shared-resource bucket key, present only when its
    /// server bucket id is known to span more than one route.
    fn shared_key_for(&self, route_key: &str) -> Option<String> {
        let id = self.route_buckets.get(route_key)?;
        let routes = self.bucket_routes.get(id)?;
        (routes.len() > 1).then(|| shared_key(id))
    }

    fn bucket_accepts(&self, key: Option<&str>, now: i64) -> bool {
        let Some(key) = key else { return true };
        match self.buckets.get(key) {
            Some(bucket) => bucket.can_accept(now),
            // no bucket yet: admit, the first response will teach us
            None => true,
        }
    }

    async fn execute(&mut self, mut item: QueuedRequest) {
        let route_key = item.request.route.bucket_key();
        tracing::trace!(route = %route_key, "executing request");

        let response = match self.transport.send(&item.request).await {
            Ok(response) => response,
            Err(e) => {
                // request-local failure; the connection and other
                // requests are unaffected
                item.future.complete(TaskOutcome::Failure(e));
                return;
            }
        };

        let update = bucket::parse_update(&response);

        if response.is_rate_limited() {
            let retry_after = bucket::parse_retry_after(&response);
            match bucket::parse_scope(&response) {
                RateLimitScope::Global => {
                    let delay = Duration::from_millis(retry_after.saturating_mul(1000));
                    tracing::warn!(retry_after, "globally rate limited");
                    self.global_until = Some(Instant::now() + delay);
                    self.global_retry_delay = delay;
                    let moved = self.global_batch_size.min(self.queue.len());
                    for _ in 0..moved {
                        if let Some(queued) = self.queue.pop_front() {
                            self.parked.push_back(queued);
                        }
                    }
                    self.arm_release_timer(delay);
                    self.requeue(item, retry_after, true);
                }
                RateLimitScope::PerResource => {
                    tracing::debug!(route = %route_key, retry_after, "bucket rate limited");
                    if let Some(update) = &update {
                        self.apply_update(&route_key, update);
                    }
                    self.requeue(item, retry_after, false);
                }
            }
            return;
        }

        // headers are present on every response for a rate-limited route;
        // apply them unconditionally
        if let Some(update) = &update {
            self.apply_update(&route_key, update);
        }

        if response.is_success() {
            item.future.complete(TaskOutcome::Success(response));
        } else {
            item.future.complete(TaskOutcome::Failure(ClientError::Server {
                status: response.status,
                body: response.body,
            }));
        }
    }

    fn requeue(&mut self, mut item: QueuedRequest, retry_after: u64, global: bool) {
        item.retries += 1;
        if item.retries > self.max_retries {
            tracing::warn!(
                retries = item.retries,
                route = %item.request.route.bucket_key(),
                "retry ceiling reached, failing request"
            );
            item.future
                .complete(TaskOutcome::Failure(ClientError::RateLimited {
                    retry_after,
                    global,
                }));
            return;
        }
        if global {
            self.parked.push_back(item);
        } else {
            self.queue.push_back(item);
        }
    }

    /// Move up to one batch of parked requests back onto the submission
    /// queue. Anything left parked gets a fresh timer: a leaky drain, not
    /// a thundering herd.
    fn release_parked(&mut self) {
        self.drain_armed = false;
        if self.parked.is_empty() {
            return;
        }
        let batch = self.global_batch_size.min(self.parked.len());
        for _ in 0..batch {
            if let Some(item) = self.parked.pop_front() {
                self.queue.push_back(item);
            }
        }
        tracing::debug!(
            released = batch,
            still_parked = self.parked.len(),
            "releasing rate-limited requests"
        );
        if !self.parked.is_empty() {
            self.arm_release_timer(self.global_retry_delay);
        }
    }

    fn arm_release_timer(&mut self, delay: Duration) {
        self.drain_armed = true;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SchedulerMessage::ReleaseParked);
        });
    }

    fn apply_update(&mut self, route_key: &str, update: &BucketUpdate) {
        self.buckets
            .entry(route_key.to_string())
            .or_insert_with(Bucket::assumed)
            .apply(update);

        let Some(id) = &update.bucket_id else { return };

        let previous = self
            .route_buckets
            .insert(route_key.to_string(), id.clone());
        if let Some(previous) = previous {
            if previous != *id {
                self.forget_route(&previous, route_key);
            }
        }

        let routes = self.bucket_routes.entry(id.clone()).or_default();
        routes.insert(route_key.to_string());
        if routes.len() > 1 {
            self.buckets
                .entry(shared_key(id))
                .or_insert_with(Bucket::assumed)
                .apply(update);
        }
    }

    /// The route moved to a different server bucket; retire its membership
    /// in the old one and mark the old shared entry stale once empty.
    fn forget_route(&mut self, bucket_id: &str, route_key: &str) {
        let Some(routes) = self.bucket_routes.get_mut(bucket_id) else {
            return;
        };
        routes.remove(route_key);
        if routes.is_empty() {
            self.bucket_routes.remove(bucket_id);
            if let Some(mut stale) = self.buckets.get_mut(&shared_key(bucket_id)) {
                stale.deleted = true;
            }
        }
    }

    fn publish_stats(&self) {
        self.shared.queued.store(self.queue.len(), Ordering::SeqCst);
        self.shared.parked.store(self.parked.len(), Ordering::SeqCst);
        self.shared
            .global_active
            .store(self.global_active(), Ordering::SeqCst);
    }
}

fn shared_key(bucket_id: &str) -> String {
    format!("shared:{bucket_id}")
}
