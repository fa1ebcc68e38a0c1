pub mod core;
pub mod errors;
pub mod reader;
pub mod session;
pub mod sync;
pub mod writer;

#[cfg(test)]
mod tests;

pub use crate::errors::{AttachError, ShmemLibError};
pub use crate::reader::{ChatMessage, Received};
pub use crate::session::{ChatSession, SessionConfig};

pub const MAX_MESSAGE_SIZE: usize = crate::core::MAX_MESSAGE_SIZE;
pub const MAX_SENDER_SIZE: usize = crate::core::MAX_SENDER_SIZE;
