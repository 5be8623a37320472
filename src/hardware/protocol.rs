//! Bridge wire protocol between the host and the coprocessor.
//!
//! Commands are written to a port's socket as short byte frames:
//!
//! ```text
//! ┌────────┬──────────────────────┐
//! │ OPCODE │ ARGS (0-3 bytes)     │   TX / RX carry a length byte and payload
//! └────────┴──────────────────────┘
//! ```
//!
//! Replies are a stream of sentinel bytes. ACK, NACK, HIGH and LOW answer a
//! request on their own; DATA is followed by the number of bytes the request
//! asked for. Bytes at or above `MIN_ASYNC` are unsolicited: a pin-change byte
//! (`0xC0 | level << 3 | line`) or a UART receive frame (`0xD0`, length,
//! payload).

use crate::error::TransportError;
use crate::hardware::{Parity, Pull, Trigger, UartConfig};

/// Command opcodes.
pub mod cmd {
    pub const NOP: u8 = 0x00;
    pub const FLUSH: u8 = 0x01;
    pub const ECHO: u8 = 0x02;
    pub const GPIO_IN: u8 = 0x03;
    pub const GPIO_HIGH: u8 = 0x04;
    pub const GPIO_LOW: u8 = 0x05;
    pub const GPIO_INT: u8 = 0x08;
    pub const ENABLE_I2C: u8 = 0x0C;
    pub const DISABLE_I2C: u8 = 0x0D;
    pub const ENABLE_UART: u8 = 0x0E;
    pub const DISABLE_UART: u8 = 0x0F;
    pub const TX: u8 = 0x10;
    pub const RX: u8 = 0x11;
    pub const TXRX: u8 = 0x12;
    pub const START: u8 = 0x13;
    pub const STOP: u8 = 0x14;
    pub const GPIO_INPUT: u8 = 0x16;
    pub const ANALOG_READ: u8 = 0x18;
    pub const ANALOG_WRITE: u8 = 0x19;
    pub const GPIO_PULL: u8 = 0x1A;
    pub const PWM_DUTY_CYCLE: u8 = 0x1B;
    pub const PWM_PERIOD: u8 = 0x1C;
}

/// Reply sentinels.
pub mod reply {
    pub const ACK: u8 = 0x80;
    pub const NACK: u8 = 0x81;
    pub const HIGH: u8 = 0x82;
    pub const LOW: u8 = 0x83;
    pub const DATA: u8 = 0x84;

    pub const MIN_ASYNC: u8 = 0xA0;
    /// 0xC0 to 0xCF: line in the low three bits, level in bit 3
    pub const ASYNC_PIN_CHANGE_N: u8 = 0xC0;
    pub const ASYNC_UART_RX: u8 = 0xD0;
}

/// Coprocessor core clock.
pub const CORE_CLOCK_HZ: u32 = 48_000_000;
/// Largest payload carried by a single TX or RX frame.
pub const MAX_CHUNK: usize = 255;
const PWM_PRESCALERS: [u32; 8] = [1, 2, 4, 8, 16, 64, 256, 1024];

pub fn gpio_in(line: u8) -> [u8; 2] {
    [cmd::GPIO_IN, line]
}

pub fn analog_read(line: u8) -> [u8; 2] {
    [cmd::ANALOG_READ, line]
}

/// DAC output, a 10-bit value split big-endian.
pub fn analog_write(value: u16) -> [u8; 3] {
    let value = value.min(1023);
    [cmd::ANALOG_WRITE, (value >> 8) as u8, (value & 0xff) as u8]
}

pub fn gpio_level(line: u8, high: bool) -> [u8; 2] {
    [if high { cmd::GPIO_HIGH } else { cmd::GPIO_LOW }, line]
}

pub fn gpio_input(line: u8) -> [u8; 2] {
    [cmd::GPIO_INPUT, line]
}

pub fn gpio_pull(line: u8, pull: Pull) -> [u8; 2] {
    let mode = match pull {
        Pull::Down => 0,
        Pull::Up => 1,
        Pull::None => 2,
    };
    [cmd::GPIO_PULL, line | (mode << 4)]
}

pub fn gpio_interrupt(line: u8, trigger: Option<Trigger>) -> [u8; 2] {
    let mode = match trigger {
        None => 0,
        Some(Trigger::Rise) => 1,
        Some(Trigger::Fall) => 2,
        Some(Trigger::Change) => 3,
    };
    [cmd::GPIO_INT, line | (mode << 4)]
}

/// Prescaler index and period register for a PWM carrier frequency.
pub fn pwm_timing(hz: u32) -> Option<(u8, u16)> {
    if hz == 0 {
        return None;
    }
    PWM_PRESCALERS.iter().enumerate().find_map(|(i, &prescaler)| {
        let period = CORE_CLOCK_HZ / (prescaler * hz);
        (period > 0 && period <= u16::MAX as u32).then_some((i as u8, period as u16))
    })
}

pub fn pwm_period(prescaler_index: u8, period: u16) -> [u8; 4] {
    [
        cmd::PWM_PERIOD,
        prescaler_index << 4,
        (period >> 8) as u8,
        (period & 0xff) as u8,
    ]
}

pub fn pwm_duty_cycle(line: u8, duty: f64, period: u16) -> [u8; 4] {
    let ticks = (duty.clamp(0.0, 1.0) * period as f64).round() as u16;
    [cmd::PWM_DUTY_CYCLE, line, (ticks >> 8) as u8, (ticks & 0xff) as u8]
}

/// Baud register for an I2C clock frequency.
pub fn i2c_enable(frequency: u32) -> [u8; 2] {
    let baud = (CORE_CLOCK_HZ / (2 * frequency.max(1))).saturating_sub(5);
    [cmd::ENABLE_I2C, baud.clamp(1, 255) as u8]
}

pub fn start(address: u8, read: bool) -> [u8; 2] {
    [cmd::START, (address << 1) | read as u8]
}

pub fn stop() -> [u8; 1] {
    [cmd::STOP]
}

/// TX frames for a payload, split into chunks the coprocessor accepts.
pub fn tx(data: &[u8]) -> Vec<Vec<u8>> {
    data.chunks(MAX_CHUNK)
        .map(|chunk| {
            let mut frame = Vec::with_capacity(chunk.len() + 2);
            frame.push(cmd::TX);
            frame.push(chunk.len() as u8);
            frame.extend_from_slice(chunk);
            frame
        })
        .collect()
}

pub fn rx(len: u8) -> [u8; 2] {
    [cmd::RX, len]
}

pub fn uart_enable(config: &UartConfig) -> [u8; 4] {
    let ratio = 16.0 * config.baud as f64 / CORE_CLOCK_HZ as f64;
    let baud = (65536.0 * (1.0 - ratio)).clamp(0.0, u16::MAX as f64) as u16;
    let parity = match config.parity {
        Parity::None => 0,
        Parity::Odd => 1,
        Parity::Even => 2,
    };
    let mode = (config.data_bits.saturating_sub(5) & 0x07)
        | (parity << 3)
        | ((config.stop_bits.saturating_sub(1) & 0x01) << 5);
    [cmd::ENABLE_UART, (baud >> 8) as u8, (baud & 0xff) as u8, mode]
}

pub fn uart_disable() -> [u8; 1] {
    [cmd::DISABLE_UART]
}

/// One unit decoded from the reply stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    Status(u8),
    Data(Vec<u8>),
    PinChange { line: u8, level: bool },
    UartRx(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParseState {
    Idle,
    Data { remaining: usize },
    UartLength,
    UartData { remaining: usize },
}

/// Incremental decoder for a port's reply stream.
#[derive(Debug, Clone)]
pub struct ReplyParser {
    state: ParseState,
    buffer: Vec<u8>,
}

impl Default for ReplyParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::Idle,
            buffer: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.state = ParseState::Idle;
        self.buffer.clear();
    }

    /// Feeds one byte. `expected` is the DATA length of the oldest pending
    /// request, if any.
    pub fn feed(&mut self, byte: u8, expected: Option<usize>) -> Result<Option<Parsed>, TransportError> {
        match self.state {
            ParseState::Idle => match byte {
                reply::ACK | reply::NACK | reply::HIGH | reply::LOW => Ok(Some(Parsed::Status(byte))),
                reply::DATA => match expected {
                    Some(0) => Ok(Some(Parsed::Data(Vec::new()))),
                    Some(remaining) => {
                        self.buffer.clear();
                        self.state = ParseState::Data { remaining };
                        Ok(None)
                    }
                    None => Err(TransportError::UnexpectedReply(byte)),
                },
                b if (reply::ASYNC_PIN_CHANGE_N..reply::ASYNC_UART_RX).contains(&b) => {
                    Ok(Some(Parsed::PinChange {
                        line: b & 0x07,
                        level: b & 0x08 != 0,
                    }))
                }
                reply::ASYNC_UART_RX => {
                    self.state = ParseState::UartLength;
                    Ok(None)
                }
                // Unknown async sentinels are skipped
                b if b >= reply::MIN_ASYNC => Ok(None),
                b => Err(TransportError::UnexpectedReply(b)),
            },
            ParseState::Data { remaining } => {
                self.buffer.push(byte);
                if remaining == 1 {
                    self.state = ParseState::Idle;
                    Ok(Some(Parsed::Data(std::mem::take(&mut self.buffer))))
                } else {
                    self.state = ParseState::Data { remaining: remaining - 1 };
                    Ok(None)
                }
            }
            ParseState::UartLength => {
                if byte == 0 {
                    self.state = ParseState::Idle;
                } else {
                    self.buffer.clear();
                    self.state = ParseState::UartData { remaining: byte as usize };
                }
                Ok(None)
            }
            ParseState::UartData { remaining } => {
                self.buffer.push(byte);
                if remaining == 1 {
                    self.state = ParseState::Idle;
                    Ok(Some(Parsed::UartRx(std::mem::take(&mut self.buffer))))
                } else {
                    self.state = ParseState::UartData { remaining: remaining - 1 };
                    Ok(None)
                }
            }
        }
    }
}
