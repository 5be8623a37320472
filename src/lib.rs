//! Pin addressing, mode state machine and polling engine for a two-port
//! Tessel 2 style board, driven over a coprocessor bridge.
//!
//! Start with [`Board::new`] over a [`hardware::Transport`]: the bridge
//! transport on hardware, or [`simulator::SimTransport`] off it.

pub mod address;
pub mod board;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod events;
pub mod hardware;
pub mod pin;
pub mod scheduler;
pub mod simulator;

pub use board::{Board, BoardOptions, I2cOptions, SerialOptions, ServoOptions};
pub use error::{IoError, TransportError};
pub use events::{Channel, Payload};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a std mutex, recovering the data if a listener panicked while it was
/// held.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
