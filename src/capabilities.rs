// src/capabilities.rs - Operating modes and the static per-pin capability table
use serde::Serialize;
use std::fmt;

use crate::address::{PIN_COUNT, PortName, to_port_identity};

/// Operating mode of a pin. Discriminants are the Firmata mode codes used by
/// the host automation framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Mode {
    Input = 0x00,
    Output = 0x01,
    Analog = 0x02,
    Pwm = 0x03,
    Servo = 0x04,
    I2c = 0x06,
    Serial = 0x0A,
}

impl Mode {
    pub const ALL: [Mode; 7] = [
        Mode::Input,
        Mode::Output,
        Mode::Analog,
        Mode::Pwm,
        Mode::Servo,
        Mode::I2c,
        Mode::Serial,
    ];

    /// Looks up a Firmata mode code; unrecognized codes yield `None`.
    pub fn from_code(code: u8) -> Option<Mode> {
        Self::ALL.into_iter().find(|mode| mode.code() == code)
    }

    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            Mode::Input => "INPUT",
            Mode::Output => "OUTPUT",
            Mode::Analog => "ANALOG",
            Mode::Pwm => "PWM",
            Mode::Servo => "SERVO",
            Mode::I2c => "I2C",
            Mode::Serial => "SERIAL",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Canonical indices of pins with an ADC channel.
pub const ANALOG_PINS: [usize; 10] = [4, 7, 8, 9, 10, 11, 12, 13, 14, 15];
/// Canonical indices of pins that accept `pwmWrite`.
pub const PWM_PINS: [usize; 5] = [5, 6, 13, 14, 15];
/// Canonical indices of pins that accept `servoWrite`.
pub const SERVO_PINS: [usize; 4] = [5, 6, 13, 14];
/// B7 drives the DAC; its output is written as a raw 10-bit value.
pub const DAC_PIN: usize = 15;
/// Port-local lines that can raise change interrupts.
pub const INTERRUPT_LINES: [u8; 4] = [2, 5, 6, 7];

/// Static capabilities of one canonical pin. Fixed at startup, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PinCapabilities {
    pub index: usize,
    pub port: PortName,
    pub line: u8,
    pub supported_modes: &'static [Mode],
    pub analog_channel: Option<u8>,
    /// Whether the line can raise edge interrupts
    pub interrupt: bool,
    /// Lines 0 and 1 of each GPIO port are electrically inverted
    pub inverted: bool,
    /// Whether an internal pull resistor can be selected
    pub pull: bool,
}

impl PinCapabilities {
    pub fn supports(&self, mode: Mode) -> bool {
        self.supported_modes.contains(&mode)
    }

    pub fn is_indicator(&self) -> bool {
        self.port == PortName::L
    }
}

use Mode::*;

const MODE_DEFS: [(&[Mode], Option<u8>); PIN_COUNT] = [
    // Port A
    (&[Input, Output, I2c], None),
    (&[Input, Output, I2c], None),
    (&[Input, Output], None),
    (&[Input, Output], None),
    (&[Input, Output, Analog], Some(0)),
    (&[Input, Output, Pwm, Servo, Serial], None),
    (&[Input, Output, Pwm, Servo, Serial], None),
    (&[Input, Output, Analog], Some(1)),
    // Port B
    (&[Input, Output, Analog, I2c], Some(2)),
    (&[Input, Output, Analog, I2c], Some(3)),
    (&[Input, Output, Analog], Some(4)),
    (&[Input, Output, Analog], Some(5)),
    (&[Input, Output, Analog], Some(6)),
    (&[Input, Output, Analog, Pwm, Servo, Serial], Some(7)),
    (&[Input, Output, Analog, Pwm, Servo, Serial], Some(8)),
    (&[Input, Output, Analog, Pwm], Some(9)),
    // LEDs
    (&[Output], None),
    (&[Output], None),
    (&[Output], None),
    (&[Output], None),
];

/// Capability entry for a canonical index, if it names a pin.
pub fn capabilities(index: usize) -> Option<PinCapabilities> {
    let (modes, analog_channel) = *MODE_DEFS.get(index)?;
    let identity = to_port_identity(index as i64);
    let port = identity.port?;
    let line = identity.index as u8;
    let basic = port.is_gpio() && line < 2;
    Some(PinCapabilities {
        index,
        port,
        line,
        supported_modes: modes,
        analog_channel,
        interrupt: port.is_gpio() && INTERRUPT_LINES.contains(&line),
        inverted: basic,
        pull: port.is_gpio() && !basic,
    })
}

/// The full capability table, in canonical order.
pub fn capability_table() -> Vec<PinCapabilities> {
    (0..PIN_COUNT).filter_map(capabilities).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_codes() {
        assert_eq!(Mode::from_code(0), Some(Mode::Input));
        assert_eq!(Mode::from_code(4), Some(Mode::Servo));
        assert_eq!(Mode::from_code(10), Some(Mode::Serial));
        assert_eq!(Mode::from_code(5), None);
        assert_eq!(Mode::from_code(0xff), None);
    }

    #[test]
    fn test_table_shape() {
        let table = capability_table();
        assert_eq!(table.len(), PIN_COUNT);
        for index in ANALOG_PINS {
            assert!(table[index].supports(Mode::Analog));
            assert!(table[index].analog_channel.is_some());
        }
        for index in SERVO_PINS {
            assert!(table[index].supports(Mode::Servo));
        }
        assert!(!table[DAC_PIN].supports(Mode::Servo));
        assert!(table[16..].iter().all(|caps| caps.is_indicator() && !caps.pull));
    }

    #[test]
    fn test_basic_lines_have_no_pull() {
        for index in [0, 1, 8, 9] {
            let caps = capabilities(index).unwrap();
            assert!(caps.inverted);
            assert!(!caps.pull);
        }
        assert!(capabilities(2).unwrap().pull);
        assert!(capabilities(10).unwrap().pull);
    }

    #[test]
    fn test_interrupt_lines() {
        let interrupt: Vec<usize> = capability_table()
            .into_iter()
            .filter(|caps| caps.interrupt)
            .map(|caps| caps.index)
            .collect();
        assert_eq!(interrupt, vec![2, 5, 6, 7, 10, 13, 14, 15]);
        assert!(capabilities(20).is_none());
    }
}
