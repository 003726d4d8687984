//! Keyboard queue
//!
//! Bounded single-producer/single-consumer byte FIFO between the host input
//! thread and the execution thread. The producer never blocks: bytes that
//! arrive while the queue is full are dropped.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use log::{debug, warn};

/// Ctrl-A, the host escape prefix
pub const ESCAPE: u8 = 0x01;

/// Consumer side, owned by the bus
pub struct KeyboardQueue {
    rx: Receiver<u8>,
    tx: Sender<u8>,
}

/// Producer side, handed to the input source
#[derive(Clone)]
pub struct KeyboardSender {
    tx: Sender<u8>,
}

impl KeyboardQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity.max(1));
        KeyboardQueue { rx, tx }
    }

    pub fn sender(&self) -> KeyboardSender {
        KeyboardSender {
            tx: self.tx.clone(),
        }
    }

    pub fn has_data(&self) -> bool {
        !self.rx.is_empty()
    }

    pub fn try_pop(&self) -> Option<u8> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl KeyboardSender {
    /// Queue one byte. Returns false if it was dropped.
    pub fn send(&self, byte: u8) -> bool {
        match self.tx.try_send(byte) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("keyboard queue full, dropping 0x{:02x}", byte);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Copy host input into the queue until EOF, an error, or `Ctrl-A x`,
/// which raises `stop`. `Ctrl-A Ctrl-A` sends a literal Ctrl-A.
pub fn pump_input<R: Read>(mut input: R, sender: &KeyboardSender, stop: &AtomicBool) {
    let mut escaped = false;
    let mut buf = [0u8; 64];
    while !stop.load(Ordering::Relaxed) {
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("input closed: {}", e);
                break;
            }
        };
        for &byte in &buf[..n] {
            if escaped {
                escaped = false;
                match byte {
                    b'x' | b'X' => {
                        stop.store(true, Ordering::Relaxed);
                        return;
                    }
                    ESCAPE => {
                        sender.send(ESCAPE);
                    }
                    _ => {}
                }
            } else if byte == ESCAPE {
                escaped = true;
            } else {
                sender.send(byte);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_fifo_order_and_empty() {
        let q = KeyboardQueue::new(4);
        assert!(!q.has_data());
        assert_eq!(q.try_pop(), None);

        let tx = q.sender();
        assert!(tx.send(b'a'));
        assert!(tx.send(b'b'));
        assert!(q.has_data());
        assert_eq!(q.try_pop(), Some(b'a'));
        assert_eq!(q.try_pop(), Some(b'b'));
        assert!(q.is_empty());
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let q = KeyboardQueue::new(2);
        let tx = q.sender();
        assert!(tx.send(1));
        assert!(tx.send(2));
        assert!(!tx.send(3));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_producer_on_another_thread() {
        let q = KeyboardQueue::new(16);
        let tx = q.sender();
        std::thread::spawn(move || {
            for b in b"hello" {
                tx.send(*b);
            }
        })
        .join()
        .unwrap();
        let got: Vec<u8> = std::iter::from_fn(|| q.try_pop()).collect();
        assert_eq!(got, b"hello");
    }

    #[test]
    fn test_pump_escape_sequences() {
        let q = KeyboardQueue::new(16);
        let stop = AtomicBool::new(false);
        pump_input(
            Cursor::new(b"ab\x01\x01c\x01xzz".to_vec()),
            &q.sender(),
            &stop,
        );
        assert!(stop.load(Ordering::Relaxed));
        let got: Vec<u8> = std::iter::from_fn(|| q.try_pop()).collect();
        assert_eq!(got, b"ab\x01c");
    }

    #[test]
    fn test_pump_stops_at_eof() {
        let q = KeyboardQueue::new(16);
        let stop = AtomicBool::new(false);
        pump_input(Cursor::new(b"ok".to_vec()), &q.sender(), &stop);
        assert!(!stop.load(Ordering::Relaxed));
        assert_eq!(q.len(), 2);
    }
}
