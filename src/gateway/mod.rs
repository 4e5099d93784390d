pub mod events;
pub mod heartbeat;
pub mod intents;
pub mod sequencer;
pub mod session;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use tokio::sync::{mpsc, watch};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::task::{TaskFuture, TaskOutcome};
use events::{
    close_code, DispatchEvent, GatewayMessage, HelloData, IdentifyData, InvalidSessionData,
    Opcode, ResumeData,
};
use heartbeat::{spawn_heartbeat, HeartbeatMonitor};
use sequencer::DispatchSequencer;
use session::Session;
use transport::{FrameDecoder, GatewaySocket, GatewayTransport, SocketMessage};

/// Resolves the socket URL ahead of a connection attempt. The connection
/// consumes the result only through the task/future primitive; how the
/// lookup happens (HTTP, cache, constant) is the caller's business.
pub trait GatewayUrlResolver: Send + Sync {
    fn resolve(&self) -> TaskFuture<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    AwaitingHello,
    Identifying,
    Resuming,
    Active,
    Reconnecting,
}

/// How one connection attempt ended.
enum LoopOutcome {
    /// Deliberate stop; do not reconnect.
    Shutdown,
    /// Transient failure; reconnect, resuming when the session allows it.
    Reconnect,
    /// Unrecoverable; stop the reconnect loop and surface the error.
    Fatal(ClientError),
}

/// What to do with one handled frame.
enum FrameAction {
    Continue,
    /// Send a reply frame (immediate heartbeat answer).
    Send(String),
    Finish(LoopOutcome),
}

/// Exponential reconnect backoff with jitter, reset after a successful
/// handshake.
struct ReconnectBackoff {
    attempt: u32,
    cap: Duration,
}

impl ReconnectBackoff {
    fn new(cap: Duration) -> Self {
        Self { attempt: 0, cap }
    }

    fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(6);
        self.attempt = self.attempt.saturating_add(1);
        let full = Duration::from_secs(1 << exp).min(self.cap);
        let ms = full.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(ms / 2..=ms))
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// The gateway connection state machine: connect, identify-or-resume,
/// heartbeat, opcode dispatch, reconnect.
///
/// Owns the session and the dispatch sequencer. Runs as one task; the
/// frame handler is the only place session state mutates.
pub struct GatewayConnection {
    config: Arc<ClientConfig>,
    transport: Arc<dyn GatewayTransport>,
    resolver: Arc<dyn GatewayUrlResolver>,
    decoder: FrameDecoder,
    sequencer: Arc<DispatchSequencer>,
    session: Session,
    status_tx: watch::Sender<ConnectionStatus>,
    shutdown: watch::Receiver<bool>,
    handshake_ok: bool,
}

impl GatewayConnection {
    pub fn new(
        config: Arc<ClientConfig>,
        transport: Arc<dyn GatewayTransport>,
        resolver: Arc<dyn GatewayUrlResolver>,
        decoder: FrameDecoder,
        sequencer: Arc<DispatchSequencer>,
        status_tx: watch::Sender<ConnectionStatus>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            transport,
            resolver,
            decoder,
            sequencer,
            session: Session::default(),
            status_tx,
            shutdown,
            handshake_ok: false,
        }
    }

    /// Drive the connection until shutdown or a fatal error. Returns the
    /// fatal error if one ended the loop.
    pub async fn run(mut self) -> Result<(), ClientError> {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_secs(self.config.reconnect_cap_secs));
        let result = loop {
            if *self.shutdown.borrow() {
                break Ok(());
            }

            self.handshake_ok = false;
            let outcome = self.connect_once().await;
            if self.handshake_ok {
                backoff.reset();
            }

            match outcome {
                Ok(LoopOutcome::Shutdown) => break Ok(()),
                Ok(LoopOutcome::Fatal(e)) => {
                    tracing::error!("gateway connection failed permanently: {e}");
                    break Err(e);
                }
                Ok(LoopOutcome::Reconnect) => {
                    tracing::info!(
                        resumable = self.session.resumable,
                        "gateway connection lost, reconnecting"
                    );
                }
                Err(e) => {
                    tracing::warn!("gateway connection attempt failed: {e}");
                }
            }

            // missing sequences will never arrive on the next socket
            self.sequencer.reset();
            self.set_status(ConnectionStatus::Reconnecting);

            let delay = backoff.next_delay();
            tracing::debug!(delay_ms = delay.as_millis() as u64, "backing off");
            let mut shutdown = self.shutdown.clone();
            if *shutdown.borrow() {
                break Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break Ok(()),
            }
        };
        self.set_status(ConnectionStatus::Disconnected);
        result
    }

    async fn connect_once(&mut self) -> Result<LoopOutcome, ClientError> {
        self.set_status(ConnectionStatus::Connecting);

        let url = match self.config.gateway_url.clone() {
            Some(url) => url,
            None => match &*self.resolver.resolve().await? {
                TaskOutcome::Success(url) => url.clone(),
                TaskOutcome::Failure(e) => {
                    return Err(ClientError::Socket(format!(
                        "gateway URL resolution failed: {e}"
                    )))
                }
            },
        };

        let mut socket = self.transport.connect(&url).await?;
        self.set_status(ConnectionStatus::AwaitingHello);

        let heartbeat_interval = self.await_hello(&mut socket).await?;

        let frame = match self.session.resume_state() {
            Some((session_id, seq)) => {
                self.set_status(ConnectionStatus::Resuming);
                tracing::debug!(seq, "resuming session");
                self.resume_frame(session_id, seq)?
            }
            None => {
                self.set_status(ConnectionStatus::Identifying);
                tracing::debug!("identifying");
                self.identify_frame()?
            }
        };
        socket.send_text(frame).await?;

        let monitor = Arc::new(HeartbeatMonitor::new());
        if let Some(seq) = self.session.last_sequence {
            monitor.observe_sequence(seq);
        }
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (missed_tx, mut missed_rx) = mpsc::unbounded_channel();
        let (hb_shutdown_tx, hb_shutdown_rx) = watch::channel(false);
        let heartbeat_task = spawn_heartbeat(
            heartbeat_interval,
            self.config.missed_heartbeat_limit,
            Arc::clone(&monitor),
            outbound_tx,
            missed_tx,
            hb_shutdown_rx,
        );

        let mut shutdown = self.shutdown.clone();
        // a disconnect issued during the handshake would predate this
        // clone's version marker and never fire `changed`
        if *shutdown.borrow() {
            let _ = hb_shutdown_tx.send(true);
            let _ = heartbeat_task.await;
            let _ = socket.close().await;
            return Ok(LoopOutcome::Shutdown);
        }
        let outcome = loop {
            tokio::select! {
                message = socket.next_message() => match message {
                    None => {
                        // read side gone; abort the write side before the
                        // next attempt
                        let _ = socket.close().await;
                        break Ok(LoopOutcome::Reconnect);
                    }
                    Some(Err(e)) => {
                        tracing::warn!("socket error: {e}");
                        let _ = socket.close().await;
                        break Ok(LoopOutcome::Reconnect);
                    }
                    Some(Ok(message)) => match self.handle_message(message, &monitor) {
                        FrameAction::Continue => {}
                        FrameAction::Send(frame) => {
                            if let Err(e) = socket.send_text(frame).await {
                                tracing::warn!("send failed: {e}");
                                break Ok(LoopOutcome::Reconnect);
                            }
                        }
                        FrameAction::Finish(outcome) => {
                            let _ = socket.close().await;
                            break Ok(outcome);
                        }
                    },
                },
                Some(frame) = outbound_rx.recv() => {
                    if let Err(e) = socket.send_text(frame).await {
                        tracing::warn!("heartbeat send failed: {e}");
                        break Ok(LoopOutcome::Reconnect);
                    }
                }
                Some(()) = missed_rx.recv() => {
                    tracing::warn!("heartbeat ack overdue, recycling connection");
                    let _ = socket.close().await;
                    break Ok(LoopOutcome::Reconnect);
                }
                _ = shutdown.changed() => {
                    let _ = socket.close().await;
                    break Ok(LoopOutcome::Shutdown);
                }
            }
        };

        // stop the timer before the socket handle drops so no heartbeat
        // is ever written to a dead connection
        let _ = hb_shutdown_tx.send(true);
        let _ = heartbeat_task.await;

        outcome
    }

    /// Wait for the server's HELLO and extract the heartbeat interval.
    /// A HELLO without an interval is fatal to this attempt: the
    /// connection cannot be kept alive without one.
    async fn await_hello(
        &mut self,
        socket: &mut Box<dyn GatewaySocket>,
    ) -> Result<Duration, ClientError> {
        let timeout = Duration::from_secs(self.config.hello_timeout_secs);
        loop {
            let message = tokio::time::timeout(timeout, socket.next_message())
                .await
                .map_err(|_| ClientError::Protocol("timed out waiting for HELLO".to_string()))?
                .ok_or_else(|| ClientError::Socket("closed before HELLO".to_string()))??;

            if let SocketMessage::Close { code, reason } = message {
                return Err(ClientError::Closed { code, reason });
            }
            let frame = match (self.decoder)(&message)? {
                Some(frame) => frame,
                None => continue,
            };
            if frame.op != Opcode::Hello as u8 {
                tracing::warn!(op = frame.op, "expected HELLO, dropping frame");
                continue;
            }
            let hello: HelloData = match frame.data {
                Some(data) => serde_json::from_value(data)?,
                None => return Err(ClientError::Protocol("HELLO without data".to_string())),
            };
            let interval = hello.heartbeat_interval.ok_or_else(|| {
                ClientError::Protocol("HELLO missing heartbeat_interval".to_string())
            })?;
            return Ok(Duration::from_millis(interval));
        }
    }

    fn handle_message(
        &mut self,
        message: SocketMessage,
        monitor: &Arc<HeartbeatMonitor>,
    ) -> FrameAction {
        if let SocketMessage::Close { code, reason } = &message {
            tracing::info!(?code, %reason, "server closed connection");
            if let Some(code) = code {
                if close_code::is_fatal(*code) {
                    return FrameAction::Finish(LoopOutcome::Fatal(ClientError::Closed {
                        code: Some(*code),
                        reason: reason.clone(),
                    }));
                }
            }
            return FrameAction::Finish(LoopOutcome::Reconnect);
        }

        let frame = match (self.decoder)(&message) {
            Ok(Some(frame)) => frame,
            Ok(None) => return FrameAction::Continue,
            Err(e) => {
                // malformed frames are dropped, not fatal
                tracing::warn!("dropping malformed frame: {e}");
                return FrameAction::Continue;
            }
        };

        let opcode = match Opcode::from_u8(frame.op) {
            Some(opcode) => opcode,
            None => {
                tracing::warn!(op = frame.op, "unknown opcode, dropping frame");
                return FrameAction::Continue;
            }
        };

        match opcode {
            Opcode::Dispatch => self.handle_dispatch(frame, monitor),
            Opcode::Heartbeat => {
                // answer immediately, outside the timer cadence
                FrameAction::Send(monitor.frame())
            }
            Opcode::HeartbeatAck => {
                monitor.ack();
                FrameAction::Continue
            }
            Opcode::Reconnect => {
                tracing::info!("server requested reconnect");
                FrameAction::Finish(LoopOutcome::Reconnect)
            }
            Opcode::InvalidSession => {
                let resumable = frame
                    .data
                    .and_then(|d| serde_json::from_value::<InvalidSessionData>(d).ok())
                    .map(|d| d.resumable)
                    .unwrap_or(false);
                tracing::warn!(resumable, "session invalidated by server");
                if !resumable {
                    self.session.invalidate();
                }
                FrameAction::Finish(LoopOutcome::Reconnect)
            }
            Opcode::Hello => {
                tracing::debug!("unexpected HELLO mid-session, dropping");
                FrameAction::Continue
            }
            Opcode::Identify | Opcode::Resume => {
                tracing::warn!(op = frame.op, "client-only opcode from server, dropping");
                FrameAction::Continue
            }
        }
    }

    fn handle_dispatch(
        &mut self,
        frame: GatewayMessage,
        monitor: &Arc<HeartbeatMonitor>,
    ) -> FrameAction {
        let sequence = match frame.seq {
            Some(seq) => seq,
            None => {
                tracing::warn!("DISPATCH without sequence, dropping");
                return FrameAction::Continue;
            }
        };
        let event_type = match frame.event_type {
            Some(event_type) => event_type,
            None => {
                tracing::warn!(seq = sequence, "DISPATCH without type, dropping");
                return FrameAction::Continue;
            }
        };

        // sequence bookkeeping must land before the sequencer sees the
        // payload, so a backlogged consumer cannot stall resumes
        self.session.observe_sequence(sequence);
        monitor.observe_sequence(sequence);

        match event_type.as_str() {
            "ready" => {
                match frame
                    .data
                    .as_ref()
                    .and_then(|d| d.get("session_id"))
                    .and_then(|v| v.as_str())
                {
                    Some(session_id) => {
                        tracing::info!(session_id, "session established");
                        self.session.establish(session_id.to_string());
                    }
                    None => tracing::warn!("ready event without session_id"),
                }
                self.handshake_ok = true;
                self.set_status(ConnectionStatus::Active);
            }
            "resumed" => {
                tracing::info!(seq = sequence, "session resumed");
                self.handshake_ok = true;
                self.set_status(ConnectionStatus::Active);
            }
            _ => {}
        }

        let event = DispatchEvent {
            sequence,
            event_type,
            data: frame.data.unwrap_or(serde_json::Value::Null),
        };
        match self.sequencer.push(event) {
            Ok(_) => FrameAction::Continue,
            Err(e) => {
                // capacity misconfiguration or a wedged consumer; events
                // are being lost and hiding that would be worse
                tracing::error!("{e}");
                FrameAction::Finish(LoopOutcome::Fatal(e))
            }
        }
    }

    fn identify_frame(&self) -> Result<String, ClientError> {
        let data = IdentifyData {
            token: self.config.token.clone(),
            properties: self.config.properties.clone(),
            intents: self.config.intents,
            compress: self.config.compress,
            large_threshold: self.config.large_threshold,
            shard: self.config.shard,
            presence: self.config.presence.clone(),
        };
        Ok(json!({
            "op": Opcode::Identify as u8,
            "data": serde_json::to_value(&data)?
        })
        .to_string())
    }

    fn resume_frame(&self, session_id: String, seq: u64) -> Result<String, ClientError> {
        let data = ResumeData {
            token: self.config.token.clone(),
            session_id,
            seq,
        };
        Ok(json!({
            "op": Opcode::Resume as u8,
            "data": serde_json::to_value(&data)?
        })
        .to_string())
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_respects_cap() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(8));
        let first = backoff.next_delay();
        assert!(first <= Duration::from_secs(1));
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            last = backoff.next_delay();
            assert!(last <= Duration::from_secs(8));
        }
        // deep into the sequence the delay sits in the capped band
        assert!(last >= Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(60));
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_secs(1));
    }
}
