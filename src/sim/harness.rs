//! CLI entry point for the simulation harness: drives a board against the
//! in-memory transport with random input levels and logs every change.

use clap::Parser;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tessel_io::address::to_pin_index;
use tessel_io::capabilities::{ANALOG_PINS, Mode};
use tessel_io::simulator::SimTransport;
use tessel_io::{Board, BoardOptions};

/// Simulation Harness CLI
#[derive(Parser, Debug)]
#[command(name = "sim-harness", about = "Board simulation harness for exercising read loops.")]
pub struct Cli {
    /// Pins to watch (digital, or analog for ADC-capable pins with --analog)
    #[arg(long, value_delimiter = ',', default_value = "a2,a5,b2")]
    pins: Vec<String>,

    /// Sample ADC-capable pins as analog inputs
    #[arg(long)]
    analog: bool,

    /// How long to run
    #[arg(long, default_value_t = 1000)]
    duration_ms: u64,

    /// Sampling interval in milliseconds
    #[arg(long, default_value_t = 20)]
    interval: u32,

    /// Log verbosity
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(cli.log_level).init();

    let sim = Arc::new(SimTransport::new());
    let board = Board::new(
        sim.clone(),
        BoardOptions {
            name: Some("sim-harness".to_string()),
            sampling_interval: cli.interval,
            ..BoardOptions::default()
        },
    );
    board.ready().await;

    let samples = Arc::new(AtomicUsize::new(0));
    let mut watched = Vec::new();
    for pin in &cli.pins {
        let Some(index) = to_pin_index(pin.as_str()) else {
            tracing::warn!("Skipping unknown pin {}", pin);
            continue;
        };
        let analog = cli.analog && ANALOG_PINS.contains(&index);
        let counter = samples.clone();
        let name = pin.clone();
        let callback = move |value: u16| {
            counter.fetch_add(1, Ordering::Relaxed);
            tracing::info!("{} -> {}", name, value);
        };
        let result = if analog {
            board
                .pin_mode(index, Mode::Analog)
                .and_then(|board| board.analog_read(index, callback))
        } else {
            board
                .pin_mode(index, Mode::Input)
                .and_then(|board| board.digital_read(index, callback))
        };
        match result {
            Ok(_) => watched.push((index, analog)),
            Err(e) => tracing::error!("Cannot watch {}: {}", pin, e),
        }
    }

    let deadline = tokio::time::Instant::now() + Duration::from_millis(cli.duration_ms);
    let mut rng = rand::rng();
    while tokio::time::Instant::now() < deadline {
        for &(index, analog) in &watched {
            if analog {
                sim.set_analog(index, rng.random_range(0..1024));
            } else if rng.random_bool(0.2) {
                sim.set_level(index, rng.random_bool(0.5));
            }
        }
        tokio::time::sleep(Duration::from_millis(cli.interval as u64)).await;
    }

    tracing::info!(
        "Delivered {} samples from {} pins in {} ms",
        samples.load(Ordering::Relaxed),
        watched.len(),
        cli.duration_ms
    );
}
