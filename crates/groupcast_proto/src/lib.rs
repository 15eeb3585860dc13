//! Shared types and collaborator seams for the channel subsystem.

mod channel;
mod channel_error;
mod rpc;
pub mod util;

pub use channel::{Delivery, Membership, RelocationEntry};
pub use channel_error::ChannelError;
pub use rpc::{ChannelServerDirectory, ChannelServerRpc, Liveness, SessionTransport};
