use crate::error::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::debug;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Close code 1000: a deliberate end of the session.
    Normal,
    /// Any other code, or the stream ending without a close frame.
    Abnormal(Option<u16>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Closed(CloseKind),
}

/// Opens push sockets. Swapped for a scripted connector in tests.
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn PushSocket>>;
}

#[async_trait]
pub trait PushSocket: Send {
    async fn next_frame(&mut self) -> Result<Inbound>;

    /// Sends a normal close frame; errors are not interesting at this point.
    async fn close(&mut self, reason: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn PushSocket>> {
        let (stream, _response) = connect_async(url.as_str()).await?;
        Ok(Box::new(WsSocket { stream }))
    }
}

struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushSocket for WsSocket {
    async fn next_frame(&mut self) -> Result<Inbound> {
        while let Some(msg) = self.stream.next().await {
            match msg? {
                Message::Text(text) => return Ok(Inbound::Text(text)),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Ok(Inbound::Text(text)),
                    Err(_) => debug!("ignoring non-UTF-8 binary push frame"),
                },
                Message::Close(frame) => return Ok(Inbound::Closed(close_kind(frame.as_ref()))),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
        Ok(Inbound::Closed(CloseKind::Abnormal(None)))
    }

    async fn close(&mut self, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_owned().into(),
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            debug!("push socket close: {e}");
        }
    }
}

fn close_kind(frame: Option<&CloseFrame<'_>>) -> CloseKind {
    match frame {
        Some(f) if f.code == CloseCode::Normal => CloseKind::Normal,
        Some(f) => CloseKind::Abnormal(Some(u16::from(f.code))),
        None => CloseKind::Abnormal(None),
    }
}
