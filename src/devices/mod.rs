//! Devices module
//!
//! UART, debug console CSRs, keyboard queue and the device tree template

pub mod debug;
pub mod dtb;
mod keyboard;
mod uart;

pub use dtb::DeviceTree;
pub use keyboard::{pump_input, KeyboardQueue, KeyboardSender};
pub use uart::{Uart, UART_BASE};
