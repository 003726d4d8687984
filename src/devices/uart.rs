//! UART (8250/16550 subset)
//!
//! Only the data register and the line status register do anything.
//! Transmitted bytes collect in a buffer the orchestrator drains after each
//! batch; received bytes come from the keyboard queue.

use super::keyboard::KeyboardQueue;

pub const UART_BASE: u32 = 0x1000_0000;

// Register offsets
const UART_DATA: u32 = 0; // RBR (read) / THR (write)
const UART_LSR: u32 = 5;

// Line Status Register bits
const LSR_DATA_READY: u32 = 0x01;
const LSR_TX_EMPTY: u32 = 0x20;
const LSR_TRANSMITTER_EMPTY: u32 = 0x40;

pub struct Uart {
    /// Output to host
    tx_buffer: Vec<u8>,
}

impl Default for Uart {
    fn default() -> Self {
        Self::new()
    }
}

impl Uart {
    pub fn new() -> Self {
        Uart {
            tx_buffer: Vec::new(),
        }
    }

    pub fn load(&mut self, offset: u32, keyboard: &KeyboardQueue) -> u32 {
        match offset {
            UART_DATA => keyboard.try_pop().map_or(0, u32::from),
            UART_LSR => {
                let ready = if keyboard.has_data() {
                    LSR_DATA_READY
                } else {
                    0
                };
                LSR_TX_EMPTY | LSR_TRANSMITTER_EMPTY | ready
            }
            _ => 0,
        }
    }

    pub fn store(&mut self, offset: u32, value: u32) {
        if offset == UART_DATA {
            self.tx_buffer.push(value as u8);
        }
    }

    /// Console sink shared with the debug CSR channel
    pub fn output(&mut self) -> &mut Vec<u8> {
        &mut self.tx_buffer
    }

    /// Drain everything transmitted since the last call
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transmit_one_byte() {
        let mut uart = Uart::new();
        uart.store(UART_DATA, 0x141);
        uart.store(3, 0x42);
        assert_eq!(uart.take_output(), vec![0x41]);
        assert!(uart.take_output().is_empty());
    }

    #[test]
    fn test_status_reflects_keyboard() {
        let mut uart = Uart::new();
        let kb = KeyboardQueue::new(4);
        assert_eq!(uart.load(UART_LSR, &kb), 0x60);
        assert_eq!(uart.load(UART_DATA, &kb), 0);

        kb.sender().send(b'q');
        assert_eq!(uart.load(UART_LSR, &kb) & 1, 1);
        assert_eq!(uart.load(UART_DATA, &kb), b'q' as u32);
        assert_eq!(uart.load(UART_LSR, &kb), 0x60);
    }
}
