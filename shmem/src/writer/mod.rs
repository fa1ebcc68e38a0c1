use std::cmp;

use log::{debug, warn};

use super::core::*;
use super::errors::ShmemLibError;

/// Cuts `name` to at most `max` bytes without splitting a character.
pub fn truncate_name(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Publishes into a room's mailbox under one sender name.
pub struct MessageWriter {
    sender: String,
}

impl MessageWriter {
    pub fn new(display_name: &str) -> MessageWriter {
        let sender = truncate_name(display_name, MAX_SENDER_SIZE);
        if sender.len() < display_name.len() {
            warn!(
                "display name truncated from {} to {} bytes",
                display_name.len(),
                sender.len()
            );
        }
        MessageWriter {
            sender: sender.to_string(),
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Overwrites the single slot and wakes every waiting reader.
    ///
    /// Messages longer than `MAX_MESSAGE_SIZE` are clipped. Returns the new
    /// sequence number.
    pub fn publish(&self, mailbox: &Mailbox, message: &[u8]) -> Result<u64, ShmemLibError> {
        let length = cmp::min(message.len(), MAX_MESSAGE_SIZE);
        if length < message.len() {
            warn!("message truncated from {} to {} bytes", message.len(), length);
        }
        let sender = self.sender.as_bytes();

        let mut state = mailbox.lock().map_err(ShmemLibError::Lock)?;
        state.message[..length].copy_from_slice(&message[..length]);
        state.message_len = length;
        state.sender[..sender.len()].copy_from_slice(sender);
        state.sender_len = sender.len();
        state.sequence = state.sequence.wrapping_add(1);
        let sequence = state.sequence;
        state.notify_all().map_err(ShmemLibError::Lock)?;
        drop(state);

        debug!("published #{} ({} bytes) as {:?}", sequence, length, self.sender);
        Ok(sequence)
    }
}
