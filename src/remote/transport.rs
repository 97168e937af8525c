//! Duplex text-frame transport underneath a [`Socket`](super::socket::Socket).
//!
//! The socket logic only sees [`FrameChannel`]s handed out by a [`Connector`],
//! so reconnects and heartbeats can be driven against an in-memory channel.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

#[async_trait]
pub trait FrameChannel: Send {
    /// Next text frame. `None` once the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<String>>;

    async fn send(&mut self, text: String) -> Result<()>;

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel, optionally pinning the TCP connection to `host`
    /// while keeping the configured URL for the TLS handshake.
    async fn connect(&self, host: Option<&str>) -> Result<Box<dyn FrameChannel>>;
}

/// WebSocket connector for the virtual-games proxy.
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url).context("Invalid websocket URL")?;
        Ok(WsConnector { url })
    }

    /// `scheme://host:port` of the proxy, as echoed in every request envelope.
    pub fn origin(&self) -> String {
        origin_of(&self.url)
    }
}

pub fn origin_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port_or_known_default() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, host: Option<&str>) -> Result<Box<dyn FrameChannel>> {
        let stream = match host {
            Some(host) => {
                let port = self.url.port_or_known_default().unwrap_or(443);
                let tcp = TcpStream::connect((host, port))
                    .await
                    .with_context(|| format!("TCP connect to {}:{} failed", host, port))?;
                let (ws, _) = tokio_tungstenite::client_async_tls(self.url.as_str(), tcp)
                    .await
                    .context("Websocket handshake failed")?;
                ws
            }
            None => {
                let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
                    .await
                    .context("Websocket handshake failed")?;
                ws
            }
        };
        Ok(Box::new(WsChannel { stream }))
    }
}

struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FrameChannel for WsChannel {
    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.stream.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Server closed websocket: {:?}", frame);
                    return None;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Some(Err(e.into())),
                None => return None,
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .context("Websocket send failed")
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
