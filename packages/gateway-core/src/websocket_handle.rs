use std::sync::Arc;

use anyhow::{Context, Result};
use cleat_client_protocol::encoding::OutgoingFrame;
use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::Upgraded;
use hyper_tungstenite::HyperWebsocket;
use hyper_tungstenite::tungstenite::Message as WsMessage;
use hyper_tungstenite::tungstenite::protocol::CloseFrame;
use hyper_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio_tungstenite::WebSocketStream;

pub type WebSocketReceiver = futures_util::stream::SplitStream<WebSocketStream<TokioIo<Upgraded>>>;

type WebSocketSender =
	futures_util::stream::SplitSink<WebSocketStream<TokioIo<Upgraded>>, WsMessage>;

/// Handle over an upgraded client socket.
///
/// The write half is shared: the session loop, event broadcasts, liveness
/// pings, and rejection closes all send through clones of the handle. The
/// read half is claimed exactly once, by whichever loop owns the session.
#[derive(Clone)]
pub struct WebSocketHandle {
	ws_tx: Arc<tokio::sync::Mutex<WebSocketSender>>,
	ws_rx: Arc<Mutex<Option<WebSocketReceiver>>>,
}

impl WebSocketHandle {
	pub async fn new(websocket: HyperWebsocket) -> Result<Self> {
		let (ws_tx, ws_rx) = websocket.await?.split();

		Ok(Self {
			ws_tx: Arc::new(tokio::sync::Mutex::new(ws_tx)),
			ws_rx: Arc::new(Mutex::new(Some(ws_rx))),
		})
	}

	/// Claims the read half. A socket has exactly one reader; a second claim
	/// is a routing bug and fails.
	pub fn take_receiver(&self) -> Result<WebSocketReceiver> {
		self.ws_rx
			.lock()
			.take()
			.context("websocket reader already claimed")
	}

	pub async fn send(&self, message: WsMessage) -> Result<()> {
		self.ws_tx.lock().await.send(message).await?;
		Ok(())
	}

	/// Sends an encoded protocol frame in the message kind its encoding
	/// travels as: text for json, binary for cbor and bare.
	pub async fn send_frame(&self, frame: &OutgoingFrame) -> Result<()> {
		let message = match frame {
			OutgoingFrame::Text(text) => WsMessage::Text(text.clone().into()),
			OutgoingFrame::Binary(buf) => WsMessage::Binary(buf.clone().into()),
		};
		self.send(message).await
	}

	/// Liveness probe; the pong comes back on the session's read loop.
	pub async fn ping(&self) -> Result<()> {
		self.send(WsMessage::Ping(Vec::new().into())).await
	}

	/// Best-effort close; errors are ignored since the peer may already be
	/// gone.
	pub async fn close(&self) {
		let _ = self.ws_tx.lock().await.send(WsMessage::Close(None)).await;
	}

	/// Rejects the session, carrying a `group.code` from the error taxonomy
	/// as the close reason so clients can tell why they were dropped.
	pub async fn close_with_code(&self, code_path: String) {
		let _ = self
			.ws_tx
			.lock()
			.await
			.send(WsMessage::Close(Some(CloseFrame {
				code: CloseCode::Policy,
				reason: code_path.into(),
			})))
			.await;
	}
}
