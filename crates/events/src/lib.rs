//! Push channels for tandem sessions.
//!
//! - [`Topic`] names a channel: `match:{id}` carries match row updates,
//!   `session:{id}` carries presence and participant row updates.
//! - [`ChannelEvent`] is the envelope every channel carries.
//! - [`PushChannels`] is the subscribe/publish seam the client engine uses.
//! - [`ChannelHub`] is the in-process implementation backed by
//!   `tokio::sync::broadcast`, which also implements the store's
//!   [`ChangeFeed`](tandem_core::feed::ChangeFeed).
//! - [`ClientFrame`] / [`ServerFrame`] carry the channels over a websocket.

pub mod frame;
pub mod hub;
pub mod topic;

pub use frame::{ClientFrame, ServerFrame};
pub use hub::{ChannelError, ChannelHub, PushChannels};
pub use topic::{ChannelEvent, Topic};
