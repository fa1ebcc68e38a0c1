use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::debug;

use super::core::*;
use super::errors::ShmemLibError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub sequence: u64,
    pub sender: String,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Received {
    Message(ChatMessage),
    Stopped,
}

/// Reads the latest message from a mailbox.
///
/// Keeps this process's own high-water mark. The mailbox holds one slot, so
/// a reader that wakes late sees only the newest message and skips anything
/// published in between.
pub struct MessageReader {
    last_seen: AtomicU64,
}

impl Default for MessageReader {
    fn default() -> Self {
        MessageReader::new()
    }
}

impl MessageReader {
    pub fn new() -> MessageReader {
        MessageReader {
            last_seen: AtomicU64::new(0),
        }
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen.load(Ordering::Acquire)
    }

    /// Blocks until the mailbox carries a sequence newer than the last one
    /// consumed, or until `stop` is set and the signal is broadcast.
    pub fn receive(&self, mailbox: &Mailbox, stop: &AtomicBool) -> Result<Received, ShmemLibError> {
        let last_seen = self.last_seen();
        let mut state = mailbox.lock().map_err(ShmemLibError::Lock)?;
        while state.sequence <= last_seen && !stop.load(Ordering::SeqCst) {
            state.wait().map_err(ShmemLibError::Lock)?;
        }
        if stop.load(Ordering::SeqCst) {
            return Ok(Received::Stopped);
        }

        let message = ChatMessage {
            sequence: state.sequence,
            sender: String::from_utf8_lossy(state.sender()).into_owned(),
            text: String::from_utf8_lossy(state.message()).into_owned(),
        };
        self.last_seen.store(state.sequence, Ordering::Release);
        drop(state);

        debug!("received #{} from {:?}", message.sequence, message.sender);
        Ok(Received::Message(message))
    }
}
