// src/pin.rs - Per-pin mode state machine, writes and the read exchange
use serde::Serialize;

use crate::address::PortName;
use crate::capabilities::{DAC_PIN, Mode, PinCapabilities, capabilities};
use crate::error::{IoError, TransportError};
use crate::hardware::protocol::{self, reply};
use crate::hardware::{Line, Pull, Reply, Transport};

/// Custom servo pulse range in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServoRange {
    pub min: u32,
    pub max: u32,
}

impl Default for ServoRange {
    fn default() -> Self {
        Self { min: 600, max: 2400 }
    }
}

/// Kind of sample a read exchange returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    Digital,
    Analog,
}

/// A prepared read: the cached frame plus where to send it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub port: PortName,
    pub frame: [u8; 2],
    pub kind: ReadKind,
}

impl ReadRequest {
    /// One request/response exchange. Digital reads are corked so nothing
    /// else is spliced between the query and its reply.
    pub async fn exchange(&self, transport: &dyn Transport) -> Result<u16, TransportError> {
        let pending = match self.kind {
            ReadKind::Digital => {
                transport.cork(self.port);
                let pending = transport.exchange(self.port, &self.frame, 0);
                transport.uncork(self.port);
                pending
            }
            ReadKind::Analog => transport.exchange(self.port, &self.frame, 2),
        };
        let reply = pending.await.map_err(|_| TransportError::Closed)??;
        decode(self.kind, &reply)
    }
}

/// Decodes a read reply: HIGH/LOW to 1/0, or a little-endian raw ADC value
/// to its 10-bit reading.
pub fn decode(kind: ReadKind, reply: &Reply) -> Result<u16, TransportError> {
    match (kind, reply) {
        (ReadKind::Digital, Reply::Status(status)) => Ok((*status == reply::HIGH) as u16),
        (ReadKind::Analog, Reply::Data(data)) if data.len() >= 2 => {
            Ok(u16::from_le_bytes([data[0], data[1]]) >> 2)
        }
        (_, Reply::Status(status)) => Err(TransportError::UnexpectedReply(*status)),
        (_, Reply::Data(_)) => Err(TransportError::UnexpectedReply(reply::DATA)),
    }
}

/// Snapshot of one pin's observable state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PinSnapshot {
    pub index: usize,
    pub name: String,
    pub mode: Option<Mode>,
    pub value: f64,
    pub supported_modes: Vec<Mode>,
    pub analog_channel: Option<u8>,
    pub interrupt: bool,
}

#[derive(Debug, Clone)]
pub struct Pin {
    caps: PinCapabilities,
    mode: Option<Mode>,
    value: f64,
    read: Option<ReadRequest>,
    servo: Option<ServoRange>,
}

impl Pin {
    /// Creates the pin for a canonical index. GPIO pins start with no mode;
    /// indicator pins start as low outputs. No transport side effect is issued.
    pub fn new(index: usize) -> Option<Self> {
        let caps = capabilities(index)?;
        let mode = caps.is_indicator().then_some(Mode::Output);
        Some(Self {
            caps,
            mode,
            value: 0.0,
            read: None,
            servo: None,
        })
    }

    pub fn capabilities(&self) -> &PinCapabilities {
        &self.caps
    }

    pub fn index(&self) -> usize {
        self.caps.index
    }

    pub fn line(&self) -> Line {
        Line::new(self.caps.port, self.caps.line)
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn set_value(&mut self, value: f64) {
        self.value = value;
    }

    pub fn is_analog_input(&self) -> bool {
        self.mode == Some(Mode::Analog)
    }

    pub fn is_pwm(&self) -> bool {
        matches!(self.mode, Some(Mode::Pwm | Mode::Servo))
    }

    pub fn is_servo(&self) -> bool {
        self.mode == Some(Mode::Servo)
    }

    pub fn servo_range(&self) -> ServoRange {
        self.servo.unwrap_or_default()
    }

    pub fn set_servo_range(&mut self, range: ServoRange) {
        self.servo = Some(range);
    }

    /// Mode transition. Input and analog configure the line as an input;
    /// output, PWM and servo configure it as an output. Indicator lines are
    /// fixed outputs and never get a side effect.
    pub fn set_mode(&mut self, mode: Mode, transport: &dyn Transport) -> Result<(), TransportError> {
        if !self.caps.is_indicator() {
            match mode {
                Mode::Input | Mode::Analog => transport.configure_input(self.line())?,
                Mode::Output | Mode::Pwm | Mode::Servo => transport.configure_output(self.line())?,
                Mode::I2c | Mode::Serial => {}
            }
        }
        if self.mode != Some(mode) {
            tracing::debug!("Pin {} mode {:?} -> {}", self.line(), self.mode, mode);
            // Digital and analog reads use different frames
            self.read = None;
        }
        self.mode = Some(mode);
        Ok(())
    }

    /// Writes a value in the pin's current output domain: a duty fraction
    /// (or a raw 10-bit DAC value) in PWM/servo modes, a level otherwise. In
    /// INPUT mode the level selects the pull resistor instead.
    pub fn write(&mut self, value: f64, transport: &dyn Transport) -> Result<(), IoError> {
        if self.is_pwm() {
            if self.caps.index == DAC_PIN {
                transport.write(self.caps.port, &protocol::analog_write(value as u16))?;
            } else {
                transport.pwm_duty_cycle(self.line(), value)?;
            }
        } else {
            let high = value != 0.0;
            if self.mode == Some(Mode::Input) {
                if !self.caps.pull {
                    return Err(IoError::UnsupportedOperation(format!(
                        "pin {} does not support a configurable pull-up or pull-down",
                        self.line()
                    )));
                }
                transport.set_pull(self.line(), Pull::from_level(high))?;
            } else {
                transport.write_level(self.line(), high)?;
            }
        }
        self.value = value;
        Ok(())
    }

    /// The read frame for the current mode, built on first use and reused by
    /// every later poll.
    pub fn read_request(&mut self) -> ReadRequest {
        let caps = &self.caps;
        let analog = self.mode == Some(Mode::Analog);
        *self.read.get_or_insert_with(|| {
            let (frame, kind) = if analog {
                (protocol::analog_read(caps.line), ReadKind::Analog)
            } else {
                (protocol::gpio_in(caps.line), ReadKind::Digital)
            };
            ReadRequest {
                port: caps.port,
                frame,
                kind,
            }
        })
    }

    pub fn snapshot(&self) -> PinSnapshot {
        PinSnapshot {
            index: self.caps.index,
            name: format!("{}", self.line()),
            mode: self.mode,
            value: self.value,
            supported_modes: self.caps.supported_modes.to_vec(),
            analog_channel: self.caps.analog_channel,
            interrupt: self.caps.interrupt,
        }
    }
}
