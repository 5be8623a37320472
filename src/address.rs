//! # Pin and bus addressing
//!
//! Every pin on the board has a single canonical index:
//!
//! | Group | Canonical indices | Symbolic names |
//! |-------|-------------------|----------------|
//! | Port A | 0..=7   | `A0`..`A7` |
//! | Port B | 8..=15  | `B0`..`B7` |
//! | LEDs   | 16..=19 | `L0`..`L3` |
//!
//! Symbolic names are case-insensitive and may carry one `_` or `-` between
//! the letter and the digit (`a_3`, `B-7`). Numeric strings are treated as
//! canonical indices and rejected by range, not by type.
//!
//! ```rust
//! use tessel_io::address::{to_pin_index, to_port_identity, PortName};
//! assert_eq!(to_pin_index("b_2"), Some(10));
//! assert_eq!(to_pin_index("20"), None);
//! assert_eq!(to_port_identity(17).port, Some(PortName::L));
//! ```

use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;

/// Total number of addressable pins (two GPIO ports plus the LED group).
pub const PIN_COUNT: usize = 20;

/// I2C bus number wired to port A.
pub const I2C_BUS_A: u8 = 4;
/// I2C bus number wired to port B.
pub const I2C_BUS_B: u8 = 2;

/// A named group of pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum PortName {
    A,
    B,
    /// Onboard indicator LEDs
    L,
}

impl PortName {
    pub const ALL: [PortName; 3] = [PortName::A, PortName::B, PortName::L];

    /// Canonical index of this port's first pin.
    pub const fn offset(self) -> usize {
        match self {
            PortName::A => 0,
            PortName::B => 8,
            PortName::L => 16,
        }
    }

    /// Number of pins in this group.
    pub const fn width(self) -> usize {
        match self {
            PortName::A | PortName::B => 8,
            PortName::L => 4,
        }
    }

    pub const fn label(self) -> char {
        match self {
            PortName::A => 'A',
            PortName::B => 'B',
            PortName::L => 'L',
        }
    }

    /// True for the two GPIO ports that have a bridge socket.
    pub const fn is_gpio(self) -> bool {
        !matches!(self, PortName::L)
    }

    pub fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'A' => Some(PortName::A),
            'B' => Some(PortName::B),
            'L' => Some(PortName::L),
            _ => None,
        }
    }

    /// Parses a whole port label such as `"a"` or `"B"`.
    pub fn parse(value: &str) -> Option<Self> {
        let mut chars = value.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(letter), None) => Self::from_letter(letter),
            _ => None,
        }
    }

    fn from_index(index: usize) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|port| index >= port.offset() && index < port.offset() + port.width())
    }
}

impl fmt::Display for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Anything a caller may pass where a pin is expected.
#[derive(Debug, Clone, PartialEq)]
pub enum PinRef {
    /// Absent value (null / undefined / false in the host framework)
    Unset,
    Index(i64),
    Name(String),
}

impl From<&str> for PinRef {
    fn from(value: &str) -> Self {
        PinRef::Name(value.to_string())
    }
}

impl From<String> for PinRef {
    fn from(value: String) -> Self {
        PinRef::Name(value)
    }
}

impl From<&String> for PinRef {
    fn from(value: &String) -> Self {
        PinRef::Name(value.clone())
    }
}

macro_rules! pin_ref_from_int {
    ($($ty:ty),*) => {
        $(impl From<$ty> for PinRef {
            fn from(value: $ty) -> Self {
                PinRef::Index(value as i64)
            }
        })*
    };
}

pin_ref_from_int!(i8, i16, i32, i64, u8, u16, u32, usize);

impl<T: Into<PinRef>> From<Option<T>> for PinRef {
    fn from(value: Option<T>) -> Self {
        value.map_or(PinRef::Unset, Into::into)
    }
}

impl fmt::Display for PinRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinRef::Unset => write!(f, "<unset>"),
            PinRef::Index(index) => write!(f, "{}", index),
            PinRef::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Port and port-local index of a canonical pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PinIdentity {
    pub port: Option<PortName>,
    pub index: i8,
}

impl PinIdentity {
    /// Identity of every index that does not name a pin.
    pub const UNRESOLVED: PinIdentity = PinIdentity { port: None, index: -1 };

    pub fn is_resolved(&self) -> bool {
        self.port.is_some()
    }
}

/// Resolves a canonical index, numeric string or symbolic name to a canonical
/// pin index. `None` corresponds to the host framework's `-1`.
pub fn to_pin_index(value: impl Into<PinRef>) -> Option<usize> {
    match value.into() {
        PinRef::Unset => None,
        PinRef::Index(index) => in_range(index),
        PinRef::Name(name) => {
            let trimmed = name.trim();
            if let Ok(number) = trimmed.parse::<f64>() {
                if !number.is_finite() || number.fract() != 0.0 {
                    return None;
                }
                return in_range(number as i64);
            }
            from_symbolic(trimmed)
        }
    }
}

fn in_range(index: i64) -> Option<usize> {
    usize::try_from(index).ok().filter(|&i| i < PIN_COUNT)
}

fn from_symbolic(name: &str) -> Option<usize> {
    let mut chars = name.chars();
    let port = PortName::from_letter(chars.next()?)?;
    let mut rest = chars.as_str();
    if let Some(stripped) = rest.strip_prefix(['_', '-']) {
        rest = stripped;
    }
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let local: usize = rest.parse().ok()?;
    if local >= port.width() {
        return None;
    }
    in_range((port.offset() + local) as i64)
}

/// Maps a canonical index to its port identity. Results are computed once for
/// the whole table.
pub fn to_port_identity(index: i64) -> PinIdentity {
    static IDENTITIES: OnceLock<[PinIdentity; PIN_COUNT]> = OnceLock::new();
    let table = IDENTITIES.get_or_init(|| {
        let mut table = [PinIdentity::UNRESOLVED; PIN_COUNT];
        for (index, slot) in table.iter_mut().enumerate() {
            if let Some(port) = PortName::from_index(index) {
                *slot = PinIdentity {
                    port: Some(port),
                    index: (index - port.offset()) as i8,
                };
            }
        }
        table
    });
    match in_range(index) {
        Some(i) => table[i],
        None => PinIdentity::UNRESOLVED,
    }
}

/// Inverse of [`to_pin_index`] for valid indices: `10 -> "B2"`.
pub fn to_symbolic_name(index: usize) -> Option<String> {
    let identity = to_port_identity(index as i64);
    identity
        .port
        .map(|port| format!("{}{}", port.label(), identity.index))
}

/// A port letter or a bus number, as accepted by the I2C helpers.
#[derive(Debug, Clone, PartialEq)]
pub enum BusRef {
    Name(String),
    Number(i64),
}

impl fmt::Display for BusRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusRef::Name(name) => write!(f, "{}", name),
            BusRef::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for BusRef {
    fn from(value: &str) -> Self {
        BusRef::Name(value.to_string())
    }
}

impl From<String> for BusRef {
    fn from(value: String) -> Self {
        BusRef::Name(value)
    }
}

impl From<PortName> for BusRef {
    fn from(value: PortName) -> Self {
        BusRef::Name(value.label().to_string())
    }
}

impl From<i32> for BusRef {
    fn from(value: i32) -> Self {
        BusRef::Number(value as i64)
    }
}

impl From<i64> for BusRef {
    fn from(value: i64) -> Self {
        BusRef::Number(value)
    }
}

impl From<u8> for BusRef {
    fn from(value: u8) -> Self {
        BusRef::Number(value as i64)
    }
}

/// Port letter or bus number to the I2C bus number. The LED group and unknown
/// values have no bus.
pub fn to_i2c_bus(value: impl Into<BusRef>) -> Option<u8> {
    to_i2c_port(value).map(|port| match port {
        PortName::A => I2C_BUS_A,
        _ => I2C_BUS_B,
    })
}

/// Port letter or bus number to the port owning that I2C bus.
pub fn to_i2c_port(value: impl Into<BusRef>) -> Option<PortName> {
    match value.into() {
        BusRef::Name(name) => match PortName::parse(&name)? {
            PortName::L => None,
            port => Some(port),
        },
        BusRef::Number(n) if n == I2C_BUS_A as i64 => Some(PortName::A),
        BusRef::Number(n) if n == I2C_BUS_B as i64 => Some(PortName::B),
        BusRef::Number(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbolic_names_all_spellings() {
        for i in 0..8 {
            assert_eq!(to_pin_index(format!("A{}", i)), Some(i));
            assert_eq!(to_pin_index(format!("b{}", i)), Some(i + 8));
            assert_eq!(to_pin_index(format!("a_{}", i)), Some(i));
            assert_eq!(to_pin_index(format!("B-{}", i)), Some(i + 8));
            if i < 4 {
                assert_eq!(to_pin_index(format!("l{}", i)), Some(i + 16));
                assert_eq!(to_pin_index(format!("L_{}", i)), Some(i + 16));
            }
        }
    }

    #[test]
    fn test_numeric_values_rejected_by_range() {
        for j in 0..20 {
            assert_eq!(to_pin_index(j), Some(j as usize));
            assert_eq!(to_pin_index(j.to_string()), Some(j as usize));
        }
        for j in 1..20i64 {
            assert_eq!(to_pin_index(-j), None);
            assert_eq!(to_pin_index(j + 20), None);
        }
        assert_eq!(to_pin_index("20"), None);
        assert_eq!(to_pin_index("-3"), None);
        assert_eq!(to_pin_index("4.5"), None);
    }

    #[test]
    fn test_invalid_names() {
        assert_eq!(to_pin_index(PinRef::Unset), None);
        assert_eq!(to_pin_index(None::<&str>), None);
        assert_eq!(to_pin_index(""), None);
        assert_eq!(to_pin_index("c1"), None);
        assert_eq!(to_pin_index("L4"), None);
        assert_eq!(to_pin_index("A8"), None);
        assert_eq!(to_pin_index("A"), None);
        assert_eq!(to_pin_index("A__1"), None);
    }

    #[test]
    fn test_port_identity() {
        assert_eq!(to_port_identity(0), PinIdentity { port: Some(PortName::A), index: 0 });
        assert_eq!(to_port_identity(15), PinIdentity { port: Some(PortName::B), index: 7 });
        assert_eq!(to_port_identity(19), PinIdentity { port: Some(PortName::L), index: 3 });
        assert_eq!(to_port_identity(-1), PinIdentity::UNRESOLVED);
        assert_eq!(to_port_identity(20), PinIdentity::UNRESOLVED);
    }

    #[test]
    fn test_symbolic_round_trip() {
        for i in 0..PIN_COUNT {
            let name = to_symbolic_name(i).unwrap();
            let resolved = to_pin_index(name.as_str()).unwrap();
            assert_eq!(to_port_identity(resolved as i64), to_port_identity(i as i64));
        }
        assert_eq!(to_symbolic_name(20), None);
    }

    #[test]
    fn test_i2c_bus_mapping() {
        assert_eq!(to_i2c_bus("A"), Some(4));
        assert_eq!(to_i2c_bus("b"), Some(2));
        assert_eq!(to_i2c_bus(4), Some(4));
        assert_eq!(to_i2c_bus(2), Some(2));
        assert_eq!(to_i2c_bus("L"), None);
        assert_eq!(to_i2c_bus("C"), None);
        assert_eq!(to_i2c_bus(0), None);

        assert_eq!(to_i2c_port("a"), Some(PortName::A));
        assert_eq!(to_i2c_port(2), Some(PortName::B));
        assert_eq!(to_i2c_port("L"), None);
        assert_eq!(to_i2c_port(0), None);

        for port in [PortName::A, PortName::B] {
            let bus = to_i2c_bus(port).unwrap();
            assert_eq!(to_i2c_port(bus), Some(port));
        }
    }
}
