use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::gateway::sequencer::DispatchSequencer;
use crate::gateway::transport::{json_decoder, FrameDecoder, GatewayTransport, TungsteniteTransport};
use crate::gateway::{ConnectionStatus, GatewayConnection, GatewayUrlResolver};
use crate::http::request::{RestRequest, RestResponse};
use crate::http::{
    spawn_scheduler, ReqwestTransport, Rest, RestGatewayUrlResolver, RestTransport,
};
use crate::task::TaskFuture;

pub type EventHandler = Box<dyn Fn(&str, &serde_json::Value) + Send + Sync>;

/// Client facade tying the pieces together: one gateway connection, one
/// dispatch processor, one request scheduler.
///
/// Create it inside a tokio runtime; background tasks spawn immediately,
/// the gateway connects on `start`. Dropping the client stops everything.
pub struct Client {
    config: Arc<ClientConfig>,
    rest: Rest,
    sequencer: Arc<DispatchSequencer>,
    handlers: Arc<Mutex<Vec<EventHandler>>>,
    gateway_transport: Arc<dyn GatewayTransport>,
    resolver: Arc<dyn GatewayUrlResolver>,
    decoder: FrameDecoder,
    status_tx: watch::Sender<ConnectionStatus>,
    status_rx: watch::Receiver<ConnectionStatus>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    gateway_task: Mutex<Option<JoinHandle<Result<(), ClientError>>>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            gateway_transport: None,
            rest_transport: None,
            resolver: None,
            decoder: None,
        }
    }

    /// Open the gateway connection and keep it alive until `disconnect`.
    pub fn start(&self) {
        let mut slot = self.gateway_task.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            tracing::warn!("client already started");
            return;
        }
        let connection = GatewayConnection::new(
            Arc::clone(&self.config),
            Arc::clone(&self.gateway_transport),
            Arc::clone(&self.resolver),
            self.decoder.clone(),
            Arc::clone(&self.sequencer),
            self.status_tx.clone(),
            self.shutdown_rx.clone(),
        );
        *slot = Some(tokio::spawn(connection.run()));
    }

    /// Tear down the connection and the scheduler. In-flight request
    /// futures fail with `Canceled`.
    pub fn disconnect(&self, reason: &str) {
        tracing::info!(reason, "disconnecting");
        let _ = self.shutdown_tx.send(true);
    }

    /// Enqueue a REST request on the rate-limited scheduler.
    pub fn submit(&self, request: RestRequest) -> TaskFuture<RestResponse> {
        self.rest.submit(request)
    }

    pub fn rest(&self) -> &Rest {
        &self.rest
    }

    /// Register an event handler. Handlers run sequentially on the
    /// dispatch task, in registration order, strictly in sequence order
    /// of the events; a panicking handler is logged and skipped.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&str, &serde_json::Value) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(handler));
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Wait until the connection reaches `target`. Errors if the client
    /// shuts down first.
    pub async fn wait_for_status(&self, target: ConnectionStatus) -> Result<(), ClientError> {
        let mut rx = self.status_rx.clone();
        loop {
            if *rx.borrow_and_update() == target {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(ClientError::Closed {
                    code: None,
                    reason: "client stopped".to_string(),
                });
            }
        }
    }

    /// Await the gateway task after `disconnect`, surfacing a fatal
    /// connection error if one ended it.
    pub async fn join(&self) -> Result<(), ClientError> {
        let task = {
            let mut slot = self.gateway_task.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        match task {
            Some(task) => task.await.unwrap_or(Ok(())),
            None => Ok(()),
        }
    }
}

pub struct ClientBuilder {
    config: ClientConfig,
    gateway_transport: Option<Arc<dyn GatewayTransport>>,
    rest_transport: Option<Arc<dyn RestTransport>>,
    resolver: Option<Arc<dyn GatewayUrlResolver>>,
    decoder: Option<FrameDecoder>,
}

impl ClientBuilder {
    pub fn gateway_transport(mut self, transport: Arc<dyn GatewayTransport>) -> Self {
        self.gateway_transport = Some(transport);
        self
    }

    pub fn rest_transport(mut self, transport: Arc<dyn RestTransport>) -> Self {
        self.rest_transport = Some(transport);
        self
    }

    pub fn url_resolver(mut self, resolver: Arc<dyn GatewayUrlResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn frame_decoder(mut self, decoder: FrameDecoder) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn build(self) -> Client {
        let config = Arc::new(self.config);
        let rest_transport = self
            .rest_transport
            .unwrap_or_else(|| Arc::new(ReqwestTransport::from_config(&config)));
        let gateway_transport = self
            .gateway_transport
            .unwrap_or_else(|| Arc::new(TungsteniteTransport));
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(RestGatewayUrlResolver::new(Arc::clone(&rest_transport))));
        let decoder = self.decoder.unwrap_or_else(json_decoder);

        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (rest, _scheduler_task) =
            spawn_scheduler(&config, rest_transport, shutdown_rx.clone());

        let sequencer = Arc::new(DispatchSequencer::new(config.sequencer_capacity));
        let handlers: Arc<Mutex<Vec<EventHandler>>> = Arc::new(Mutex::new(Vec::new()));
        let _processor_task = spawn_dispatch_processor(
            Arc::clone(&sequencer),
            Arc::clone(&handlers),
            shutdown_rx.clone(),
        );

        Client {
            config,
            rest,
            sequencer,
            handlers,
            gateway_transport,
            resolver,
            decoder,
            status_tx,
            status_rx,
            shutdown_tx,
            shutdown_rx,
            gateway_task: Mutex::new(None),
        }
    }
}

/// The single consumer draining the sequencer. Event handlers run here,
/// sequentially, so application code never sees two events concurrently
/// or out of order even though ingestion happens on the connection task.
fn spawn_dispatch_processor(
    sequencer: Arc<DispatchSequencer>,
    handlers: Arc<Mutex<Vec<EventHandler>>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<()>();
    sequencer.set_processor(move || {
        let _ = notify_tx.send(());
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                notice = notify_rx.recv() => {
                    if notice.is_none() {
                        break;
                    }
                    while let Some(event) = sequencer.pull() {
                        let handlers = handlers.lock().unwrap_or_else(|e| e.into_inner());
                        for handler in handlers.iter() {
                            let result = catch_unwind(AssertUnwindSafe(|| {
                                handler(&event.event_type, &event.data)
                            }));
                            if result.is_err() {
                                tracing::error!(
                                    event_type = %event.event_type,
                                    "panic in event handler"
                                );
                            }
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
