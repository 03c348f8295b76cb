//! # parley-shared
//!
//! Types shared by the Parley store and server: identifier newtypes,
//! conversation and room references, and the real-time wire protocol.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use types::{ConnectionId, ConversationRef, DirectPair, GroupId, MessageId, RoomId, UserId};
