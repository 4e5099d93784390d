pub mod bucket;
pub mod request;
pub mod scheduler;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::gateway::GatewayUrlResolver;
use crate::task::{TaskFuture, TaskOutcome};
use bucket::Bucket;
use request::{RestRequest, RestResponse, Route};
use scheduler::{QueuedRequest, RequestScheduler, SchedulerMessage, SchedulerShared, SchedulerStats};

/// HTTP transport boundary. Implementations must expose response headers
/// so bucket state can be extracted from them.
#[async_trait]
pub trait RestTransport: Send + Sync {
    async fn send(&self, request: &RestRequest) -> Result<RestResponse, ClientError>;
}

/// Production transport over reqwest.
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl ReqwestTransport {
    /// `token` carries its auth prefix (`"Bot xxx"` or `"Bearer xxx"`).
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.api_url.clone(), config.token.clone())
    }
}

#[async_trait]
impl RestTransport for ReqwestTransport {
    async fn send(&self, request: &RestRequest) -> Result<RestResponse, ClientError> {
        let url = format!("{}{}", self.base_url, request.route.path);
        let mut builder = self
            .client
            .request(request.route.method.clone(), &url)
            .header("Authorization", &self.token);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await.unwrap_or_default();

        Ok(RestResponse {
            status,
            headers,
            body,
        })
    }
}

/// Submission handle onto the request scheduler. Cheap to clone; usable
/// from any task.
#[derive(Clone)]
pub struct Rest {
    tx: mpsc::UnboundedSender<SchedulerMessage>,
    buckets: Arc<DashMap<String, Bucket>>,
    shared: Arc<SchedulerShared>,
}

impl Rest {
    /// Enqueue a request. The returned future resolves when the scheduler
    /// has executed it under rate-limit constraints; cancel it before
    /// execution to withdraw the request.
    pub fn submit(&self, request: RestRequest) -> TaskFuture<RestResponse> {
        let future = TaskFuture::new();
        let queued = QueuedRequest {
            request,
            future: future.clone(),
            retries: 0,
        };
        if self.tx.send(SchedulerMessage::Submit(queued)).is_err() {
            future.complete(TaskOutcome::Failure(ClientError::Canceled));
        }
        future
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.snapshot()
    }

    /// Snapshot of one bucket by key, for observability.
    pub fn bucket(&self, key: &str) -> Option<Bucket> {
        self.buckets.get(key).map(|bucket| bucket.clone())
    }
}

/// Spawn the scheduler worker. The stop watch ends the worker; pending
/// requests fail with `Canceled`.
pub fn spawn_scheduler(
    config: &ClientConfig,
    transport: Arc<dyn RestTransport>,
    stop: watch::Receiver<bool>,
) -> (Rest, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let buckets = Arc::new(DashMap::new());
    let shared = Arc::new(SchedulerShared::default());
    let scheduler = RequestScheduler::new(
        rx,
        tx.clone(),
        transport,
        Arc::clone(&buckets),
        Arc::clone(&shared),
        config.max_retries,
        config.global_batch_size,
        stop,
    );
    let task = tokio::spawn(scheduler.run());
    (
        Rest {
            tx,
            buckets,
            shared,
        },
        task,
    )
}

#[derive(Deserialize)]
struct GatewayUrlData {
    url: String,
}

#[derive(Deserialize)]
struct GatewayUrlBody {
    data: GatewayUrlData,
}

/// Default gateway URL resolver: asks the REST surface where the socket
/// lives and delivers the answer through a task future.
pub struct RestGatewayUrlResolver {
    transport: Arc<dyn RestTransport>,
}

impl RestGatewayUrlResolver {
    pub fn new(transport: Arc<dyn RestTransport>) -> Self {
        Self { transport }
    }
}

impl GatewayUrlResolver for RestGatewayUrlResolver {
    fn resolve(&self) -> TaskFuture<String> {
        let future = TaskFuture::new();
        let handle = future.clone();
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let request = RestRequest::new(Route::gateway());
            let outcome = match transport.send(&request).await {
                Ok(response) if response.is_success() => {
                    match response.json::<GatewayUrlBody>() {
                        Ok(body) => TaskOutcome::Success(body.data.url),
                        Err(e) => TaskOutcome::Failure(e),
                    }
                }
                Ok(response) => TaskOutcome::Failure(ClientError::Server {
                    status: response.status,
                    body: response.body,
                }),
                Err(e) => TaskOutcome::Failure(e),
            };
            handle.complete(outcome);
        });
        future
    }
}
