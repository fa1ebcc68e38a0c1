use std::{
    error::Error,
    sync::atomic::{AtomicBool, Ordering as AtomicOrdering},
    thread,
    time::Duration,
};

use crate::{
    core::tests::unique_room,
    reader::Received,
    session::ChatSession,
};

#[derive(Debug, Clone, PartialEq)]
struct TornReadTestMessage {
    id: u64,
    data: Vec<u8>,
}

impl TornReadTestMessage {
    fn new(id: u64, size: usize) -> Self {
        let val = b'a' + (id % 26) as u8;
        TornReadTestMessage {
            id,
            data: vec![val; size],
        }
    }

    fn to_text(&self) -> String {
        let mut text = format!("{:020}:", self.id);
        text.push_str(std::str::from_utf8(&self.data).unwrap_or_default());
        text
    }

    fn from_text(text: &str) -> Option<Self> {
        let bytes = text.as_bytes();
        if bytes.len() < 21 || bytes[20] != b':' {
            return None;
        }
        let id = std::str::from_utf8(&bytes[0..20]).ok()?.parse().ok()?;
        Some(TornReadTestMessage {
            id,
            data: bytes[21..].to_vec(),
        })
    }

    fn is_consistent(&self) -> bool {
        let expected_val = b'a' + (self.id % 26) as u8;
        self.data.iter().all(|&byte| byte == expected_val)
    }
}

#[test]
fn test_torn_read_test_message_encoding() {
    let original = TornReadTestMessage::new(12345, 32);
    let decoded = TornReadTestMessage::from_text(&original.to_text()).expect("decode failed");
    assert_eq!(original, decoded);
    assert!(decoded.is_consistent());

    let mut inconsistent = original.clone();
    inconsistent.data[0] = inconsistent.data[0].wrapping_add(1);
    assert!(!inconsistent.is_consistent());
    assert!(TornReadTestMessage::from_text("short").is_none());
}

#[test]
fn test_reader_never_observes_torn_message() -> Result<(), Box<dyn Error>> {
    let room = unique_room("torn");
    let writer = ChatSession::default();
    writer.attach(&room, "writer")?;
    let reader = ChatSession::default();
    reader.attach(&room, "reader")?;

    let stop_flag = AtomicBool::new(false);

    let (messages_written, (consistent_reads, torn_reads)) = thread::scope(|s| {
        let writer_thread = s.spawn(|| {
            let mut message_id_counter = 0_u64;
            while !stop_flag.load(AtomicOrdering::Relaxed) {
                message_id_counter += 1;
                // Sizes vary so that a torn copy would mix two lengths.
                let size = 1 + (message_id_counter as usize * 977) % 8192;
                let msg = TornReadTestMessage::new(message_id_counter, size);
                writer.publish(&msg.to_text()).unwrap();
            }
            message_id_counter
        });

        let reader_thread = s.spawn(|| {
            let mut consistent_reads = 0_usize;
            let mut torn_reads = 0_usize;
            let mut last_id = 0_u64;
            loop {
                match reader.receive().unwrap() {
                    Received::Message(m) => {
                        match TornReadTestMessage::from_text(&m.text) {
                            Some(msg) if msg.is_consistent() && msg.id > last_id => {
                                last_id = msg.id;
                                consistent_reads += 1;
                            }
                            _ => torn_reads += 1,
                        }
                    }
                    Received::Stopped => break,
                }
            }
            (consistent_reads, torn_reads)
        });

        thread::sleep(Duration::from_millis(500));
        stop_flag.store(true, AtomicOrdering::Relaxed);
        let messages_written = writer_thread.join().unwrap();
        reader.request_stop().unwrap();
        (messages_written, reader_thread.join().unwrap())
    });

    assert!(messages_written > 0);
    assert!(consistent_reads > 0, "reader did not observe any message");
    assert!(consistent_reads as u64 <= messages_written);
    assert_eq!(torn_reads, 0);
    Ok(())
}
