use std::io::{self, BufRead, Write};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use serde_derive::{Deserialize, Serialize};

use super::core::*;
use super::errors::{AttachError, ShmemLibError};
use super::reader::{ChatMessage, MessageReader, Received};
use super::writer::MessageWriter;

// Bounds the create/open retry when an owner vanishes between our failed
// exclusive create and our open.
const ATTACH_ATTEMPTS: usize = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub shmem: ShmemConfig,
    pub quit_command: String,
    pub exec_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            shmem: ShmemConfig::default(),
            quit_command: ":quit".to_string(),
            exec_prefix: "!".to_string(),
        }
    }
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

struct Attachment {
    room_id: String,
    mailbox: Mailbox,
    writer: MessageWriter,
}

/// One process's membership in a chat room.
///
/// Dropping the session unmaps the mailbox; if this process created the
/// room, the room's name is removed as well.
pub struct ChatSession {
    cfg: SessionConfig,
    attachment: OnceCell<Attachment>,
    reader: MessageReader,
    stop_requested: AtomicBool,
}

impl Default for ChatSession {
    fn default() -> Self {
        ChatSession::new(SessionConfig::default())
    }
}

impl ChatSession {
    pub fn new(cfg: SessionConfig) -> ChatSession {
        ChatSession {
            cfg,
            attachment: OnceCell::new(),
            reader: MessageReader::new(),
            stop_requested: AtomicBool::new(false),
        }
    }

    /// Joins `room_id`, creating it if no other process has.
    ///
    /// Exactly one of any number of racing processes wins the exclusive
    /// create and becomes the owner; the rest open the existing region.
    pub fn attach(&self, room_id: &str, display_name: &str) -> Result<(), AttachError> {
        if self.attachment.get().is_some() {
            return Err(AttachError::AlreadyAttached);
        }
        let mailbox = self.create_or_open(room_id)?;
        let is_owner = mailbox.is_owner();
        let attachment = Attachment {
            room_id: room_id.to_string(),
            mailbox,
            writer: MessageWriter::new(display_name),
        };
        // Lost a race with another attach on this same session; dropping
        // the attachment rolls the mapping back.
        self.attachment
            .set(attachment)
            .map_err(|_| AttachError::AlreadyAttached)?;
        info!(
            "attached to room {:?} as {:?} ({})",
            room_id,
            self.display_name().unwrap_or_default(),
            if is_owner { "owner" } else { "peer" }
        );
        Ok(())
    }

    /// `attach` reduced to a status code: `0` on success, otherwise the
    /// negative code of the failed step.
    pub fn attach_status(&self, room_id: &str, display_name: &str) -> i32 {
        match self.attach(room_id, display_name) {
            Ok(()) => AttachError::SUCCESS,
            Err(e) => e.code(),
        }
    }

    fn create_or_open(&self, room_id: &str) -> Result<Mailbox, AttachError> {
        let cfg = &self.cfg.shmem;
        let mut attempt = 1;
        loop {
            if let Some(mailbox) = Mailbox::create(cfg, room_id)? {
                return Ok(mailbox);
            }
            match Mailbox::open(cfg, room_id) {
                Err(AttachError::RegionOpen(ref e))
                    if e.raw_os_error() == Some(libc::ENOENT) && attempt < ATTACH_ATTEMPTS =>
                {
                    debug!("room {:?} vanished before open, retrying", room_id);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn attachment(&self) -> Result<&Attachment, ShmemLibError> {
        self.attachment.get().ok_or(ShmemLibError::NotAttached)
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.get().is_some()
    }

    pub fn is_owner(&self) -> bool {
        self.attachment
            .get()
            .map(|a| a.mailbox.is_owner())
            .unwrap_or(false)
    }

    pub fn room_id(&self) -> Option<&str> {
        self.attachment.get().map(|a| a.room_id.as_str())
    }

    pub fn display_name(&self) -> Option<&str> {
        self.attachment.get().map(|a| a.writer.sender())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.cfg
    }

    pub fn publish(&self, text: &str) -> Result<u64, ShmemLibError> {
        self.publish_bytes(text.as_bytes())
    }

    /// Publishes raw bytes; input that is not UTF-8 is sent unchanged.
    pub fn publish_bytes(&self, message: &[u8]) -> Result<u64, ShmemLibError> {
        let attachment = self.attachment()?;
        attachment.writer.publish(&attachment.mailbox, message)
    }

    /// Blocks for the next message, or returns `Stopped` once
    /// `request_stop` has been called.
    pub fn receive(&self) -> Result<Received, ShmemLibError> {
        let attachment = self.attachment()?;
        self.reader.receive(&attachment.mailbox, &self.stop_requested)
    }

    /// Makes every current and future `receive` on this session return
    /// `Stopped`. Idempotent.
    pub fn request_stop(&self) -> Result<(), ShmemLibError> {
        self.stop_requested.store(true, Ordering::SeqCst);
        match self.attachment.get() {
            Some(a) => a.mailbox.notify_all().map_err(ShmemLibError::Lock),
            None => Ok(()),
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Removes the room's name now if this process owns it. Used when the
    /// process is about to exit without running destructors.
    pub fn release_room(&self) {
        if let Some(a) = self.attachment.get() {
            a.mailbox.region().unlink();
        }
    }

    /// Runs `command` through `sh -c` and publishes its standard output.
    ///
    /// Multi-line output is joined with `" | "` so it travels as one line.
    /// Returns `None` when the command cannot be spawned or fails; nothing
    /// is published then.
    pub fn exec_and_publish(&self, command: &str) -> Result<Option<u64>, ShmemLibError> {
        let output = match Command::new("sh").arg("-c").arg(command).output() {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to run command {:?}: {}", command, e);
                return Ok(None);
            }
        };
        if !output.status.success() {
            warn!("command {:?} exited with {}", command, output.status);
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let text = stdout
            .lines()
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" | ");
        self.publish(&text).map(Some)
    }

    pub fn run(&self) -> Result<(), ShmemLibError> {
        let stdin = io::stdin();
        self.run_with(stdin.lock(), io::stdout())
    }

    /// Runs the publish loop on the calling thread and the subscribe loop on
    /// a second thread until `input` ends or the quit command is read, then
    /// stops and joins the subscriber.
    pub fn run_with<R, W>(&self, input: R, output: W) -> Result<(), ShmemLibError>
    where
        R: BufRead,
        W: Write + Send,
    {
        self.attachment()?;
        thread::scope(|s| {
            let subscriber = s.spawn(move || self.subscribe_loop(output));
            let published = self.publish_loop(input);
            let stopped = self.request_stop();
            let subscribed = subscriber
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
            published.and(stopped).and(subscribed)
        })
    }

    fn publish_loop<R: BufRead>(&self, mut input: R) -> Result<(), ShmemLibError> {
        let quit_command = self.cfg.quit_command.as_bytes();
        let exec_prefix = self.cfg.exec_prefix.as_bytes();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if input.read_until(b'\n', &mut buf)? == 0 {
                debug!("end of input");
                break;
            }
            let line = strip_line_ending(&buf);
            if line == quit_command {
                debug!("quit command read");
                break;
            }
            match line.strip_prefix(exec_prefix) {
                Some(command) if !exec_prefix.is_empty() => {
                    self.exec_and_publish(&String::from_utf8_lossy(command))?;
                }
                _ => {
                    self.publish_bytes(line)?;
                }
            }
        }
        Ok(())
    }

    fn subscribe_loop<W: Write>(&self, mut output: W) -> Result<(), ShmemLibError> {
        loop {
            match self.receive()? {
                Received::Message(message) => {
                    self.surface(&message, &mut output)?;
                }
                Received::Stopped => return Ok(()),
            }
        }
    }

    /// Writes a received message unless this session sent it.
    pub fn surface<W: Write>(&self, message: &ChatMessage, output: &mut W) -> io::Result<bool> {
        if Some(message.sender.as_str()) == self.display_name() {
            return Ok(false);
        }
        writeln!(output, "[{}] {}", message.sender, message.text)?;
        output.flush()?;
        Ok(true)
    }
}
