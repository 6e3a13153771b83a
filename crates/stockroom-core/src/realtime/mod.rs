//! Server push handling
//!
//! - `message`: the JSON envelope carried by every websocket frame
//! - `channel`: the reconnecting websocket task
//! - `ingestor`: applies push events to the working list and cache

pub mod channel;
pub mod ingestor;
pub mod message;

pub use channel::{
    spawn_channel, ChannelCommand, ChannelConfig, ChannelEvent, ChannelHandle, ConnectionStatus,
};
pub use ingestor::RealtimeIngestor;
pub use message::{Envelope, MessageError, RealtimeEvent};
