// src/main.rs - Command-line host for a board
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use tessel_io::capabilities::{ANALOG_PINS, Mode, capability_table};
use tessel_io::hardware::Transport;
use tessel_io::config::{self, Config, TransportKind};
use tessel_io::simulator::SimTransport;
use tessel_io::{Board, Channel, Payload};

#[derive(Parser, Debug)]
#[command(name = "tessel-io", about = "Drive the pins of a Tessel 2 style board.")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the in-memory simulator instead of the configured transport
    #[arg(long)]
    sim: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the pin capability table as JSON
    Pins,
    /// Sample a digital input once
    DigitalRead { pin: String },
    /// Drive a digital output
    DigitalWrite { pin: String, value: i64 },
    /// Sample an analog input once
    AnalogRead { pin: String },
    /// Write a PWM value in 0-255
    PwmWrite { pin: String, value: f64 },
    /// Position a servo in degrees (or microseconds from 544)
    ServoWrite { pin: String, value: f64 },
    /// Print samples until interrupted
    Watch {
        pin: String,
        #[arg(long)]
        analog: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    if let Command::Pins = cli.command {
        println!("{}", serde_json::to_string_pretty(&capability_table())?);
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            config::load_config(&path.to_string_lossy())?
        }
        None => Config::default(),
    };
    if cli.sim {
        config.transport.kind = TransportKind::Sim;
    }

    let transport: Arc<dyn Transport> = if config.transport.kind == TransportKind::Sim {
        let sim = Arc::new(SimTransport::new());
        for index in ANALOG_PINS {
            sim.set_analog(index, 512);
        }
        sim
    } else {
        config.transport.open().await.map_err(|e| {
            tracing::error!("Failed to open {:?} transport: {}", config.transport.kind, e);
            e
        })?
    };
    run(Board::new(transport, config.board_options()), cli.command).await
}

async fn run(
    board: Board,
    command: Command,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    board.ready().await;
    tracing::info!("Connected to {}", board.name());

    match command {
        Command::Pins => {}
        Command::DigitalRead { pin } => {
            board.pin_mode(pin.as_str(), Mode::Input)?;
            let value = first_sample(&board, &pin, false).await?;
            println!("{}", value);
        }
        Command::AnalogRead { pin } => {
            board.pin_mode(pin.as_str(), Mode::Analog)?;
            let value = first_sample(&board, &pin, true).await?;
            println!("{}", value);
        }
        Command::DigitalWrite { pin, value } => {
            board.pin_mode(pin.as_str(), Mode::Output)?.digital_write(pin.as_str(), value)?;
        }
        Command::PwmWrite { pin, value } => {
            board.pin_mode(pin.as_str(), Mode::Pwm)?.pwm_write(pin.as_str(), value)?;
        }
        Command::ServoWrite { pin, value } => {
            board.pin_mode(pin.as_str(), Mode::Servo)?.servo_write(pin.as_str(), value)?;
        }
        Command::Watch { pin, analog } => {
            let name = pin.clone();
            if analog {
                board
                    .pin_mode(pin.as_str(), Mode::Analog)?
                    .analog_read(pin.as_str(), move |value| println!("{} {}", name, value))?;
            } else {
                board
                    .pin_mode(pin.as_str(), Mode::Input)?
                    .digital_read(pin.as_str(), move |value| println!("{} {}", name, value))?;
            }
            board.on(Channel::Error, |payload| {
                if let Payload::Error(e) = payload {
                    eprintln!("error: {}", e);
                }
            });
            tokio::signal::ctrl_c().await?;
        }
    }
    Ok(())
}

/// Waits for one sample. Digital reads only report changes, so the first
/// sample is taken from the pin's cached value when nothing changes within
/// two sampling intervals.
async fn first_sample(
    board: &Board,
    pin: &str,
    analog: bool,
) -> Result<u16, Box<dyn std::error::Error + Send + Sync + 'static>> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let callback = move |value: u16| {
        let _ = tx.send(value);
    };
    if analog {
        board.analog_read(pin, callback)?;
    } else {
        board.digital_read(pin, callback)?;
    }
    let wait = std::time::Duration::from_millis(board.sampling_interval() as u64 * 2);
    match tokio::time::timeout(wait, rx.recv()).await {
        Ok(Some(value)) => Ok(value),
        _ => Ok(board.pin(pin).map_or(0, |snapshot| snapshot.value as u16)),
    }
}
