//! Real-time sync: the broadcast hub fans committed state changes out to
//! every connected push channel, and the protocol module defines the JSON
//! frames exchanged over HTTP and WebSocket.

pub mod hub;
pub mod protocol;

pub use hub::{BroadcastHub, DeliveryReport, SubscriberId, Subscription};
pub use protocol::{ClientMessage, FetchResponse, PushEvent, ReplaceResponse};
