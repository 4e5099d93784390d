use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::ClientError;
use crate::gateway::events::GatewayMessage;

/// One message off the wire, already stripped of transport framing.
#[derive(Debug)]
pub enum SocketMessage {
    Text(String),
    Binary(Vec<u8>),
    Close { code: Option<u16>, reason: String },
}

/// Duplex gateway socket. `next` returning `None` means the read side is
/// closed; callers abort the write side via `close` before reconnecting.
#[async_trait]
pub trait GatewaySocket: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ClientError>;
    async fn next_message(&mut self) -> Option<Result<SocketMessage, ClientError>>;
    async fn close(&mut self) -> Result<(), ClientError>;
}

/// Socket factory, injected so tests can substitute their own transport.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn GatewaySocket>, ClientError>;
}

/// Decodes one socket message into a gateway frame. `Ok(None)` means the
/// message carries no frame (e.g. an unsupported binary encoding the
/// caller opted to skip).
pub type FrameDecoder =
    Arc<dyn Fn(&SocketMessage) -> Result<Option<GatewayMessage>, ClientError> + Send + Sync>;

/// Default decoder: JSON text frames, binary refused.
pub fn json_decoder() -> FrameDecoder {
    Arc::new(|message| match message {
        SocketMessage::Text(text) => Ok(Some(serde_json::from_str(text)?)),
        SocketMessage::Binary(_) => Err(ClientError::Protocol(
            "binary frame without a binary decoder".to_string(),
        )),
        SocketMessage::Close { .. } => Ok(None),
    })
}

/// Production transport over tokio-tungstenite.
pub struct TungsteniteTransport;

#[async_trait]
impl GatewayTransport for TungsteniteTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn GatewaySocket>, ClientError> {
        let (socket, _response) = connect_async(url).await?;
        let (sink, stream) = socket.split();
        Ok(Box::new(TungsteniteSocket { sink, stream }))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TungsteniteSocket {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl GatewaySocket for TungsteniteSocket {
    async fn send_text(&mut self, text: String) -> Result<(), ClientError> {
        self.sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<SocketMessage, ClientError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(Ok(SocketMessage::Text(text.as_str().to_string())))
                }
                Ok(Message::Binary(bytes)) => {
                    return Some(Ok(SocketMessage::Binary(bytes.to_vec())))
                }
                Ok(Message::Close(frame)) => {
                    let (code, reason) = match frame {
                        Some(frame) => {
                            (Some(u16::from(frame.code)), frame.reason.to_string())
                        }
                        None => (None, String::new()),
                    };
                    return Some(Ok(SocketMessage::Close { code, reason }));
                }
                // tungstenite answers pings internally on flush
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        self.sink.close().await?;
        Ok(())
    }
}
