pub mod subprotocol;
mod websocket_handle;

pub use websocket_handle::{WebSocketHandle, WebSocketReceiver};
