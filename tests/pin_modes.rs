// Mode transitions, digital writes and pull selection against the simulator

use std::sync::Arc;

use tessel_io::address::PortName;
use tessel_io::capabilities::Mode;
use tessel_io::hardware::{Line, Pull};
use tessel_io::simulator::{SimOp, SimTransport};
use tessel_io::{Board, BoardOptions, IoError};

fn board() -> (Arc<SimTransport>, Board) {
    let sim = Arc::new(SimTransport::new());
    let board = Board::new(sim.clone(), BoardOptions::default());
    (sim, board)
}

const A3: Line = Line::new(PortName::A, 3);

#[tokio::test]
async fn test_construction_has_no_side_effects() {
    let (sim, board) = board();
    assert!(sim.ops().is_empty());

    let pins = board.pins();
    assert_eq!(pins.len(), 20);
    assert!(pins[..16].iter().all(|pin| pin.mode.is_none() && pin.value == 0.0));
    assert!(pins[16..].iter().all(|pin| pin.mode == Some(Mode::Output)));
}

#[tokio::test]
async fn test_output_modes_configure_output_once_per_call() {
    let (sim, board) = board();
    board.pin_mode("a3", Mode::Output).unwrap();
    assert_eq!(sim.ops(), vec![SimOp::ConfigureOutput(A3)]);

    board.pin_mode("A_3", Mode::Pwm).unwrap();
    board.pin_mode(3, Mode::Servo).unwrap();
    assert_eq!(sim.count(|op| *op == SimOp::ConfigureOutput(A3)), 3);
    assert_eq!(sim.count(|op| matches!(op, SimOp::ConfigureInput(_))), 0);
    assert_eq!(board.pin("a3").unwrap().mode, Some(Mode::Servo));
}

#[tokio::test]
async fn test_input_modes_configure_input() {
    let (sim, board) = board();
    board.pin_mode("b2", Mode::Input).unwrap();
    board.pin_mode("b-2", Mode::Analog).unwrap();
    assert_eq!(
        sim.ops(),
        vec![
            SimOp::ConfigureInput(Line::new(PortName::B, 2)),
            SimOp::ConfigureInput(Line::new(PortName::B, 2)),
        ]
    );
}

#[tokio::test]
async fn test_bus_modes_and_indicators_have_no_side_effect() {
    let (sim, board) = board();
    board.pin_mode("a0", Mode::I2c).unwrap();
    board.pin_mode("a5", Mode::Serial).unwrap();
    board.pin_mode("l1", Mode::Output).unwrap();
    assert!(sim.ops().is_empty());
    assert_eq!(board.pin("a0").unwrap().mode, Some(Mode::I2c));
}

#[tokio::test]
async fn test_unresolved_pin_or_mode_is_ignored() {
    let (sim, board) = board();
    assert!(board.pin_mode("z9", Mode::Output).is_ok());
    assert!(board.pin_mode(20, Mode::Output).is_ok());
    assert!(board.pin_mode(None::<&str>, Mode::Output).is_ok());
    assert!(board.pin_mode_code("a3", 0x05).is_ok());
    assert!(sim.ops().is_empty());

    board.pin_mode_code("a3", 0x01).unwrap();
    assert_eq!(sim.ops(), vec![SimOp::ConfigureOutput(A3)]);
}

#[tokio::test]
async fn test_digital_write_clamps_level() {
    let (sim, board) = board();
    board.pin_mode("a3", Mode::Output).unwrap();
    sim.clear_ops();

    board.digital_write("a3", 7).unwrap();
    assert_eq!(board.pin("a3").unwrap().value, 1.0);
    board.digital_write("a3", -2).unwrap();
    assert_eq!(board.pin("a3").unwrap().value, 0.0);
    assert_eq!(sim.ops(), vec![SimOp::Level(A3, true), SimOp::Level(A3, false)]);
}

#[tokio::test]
async fn test_write_on_input_selects_pull() {
    let (sim, board) = board();
    board.pin_mode("a2", Mode::Input).unwrap();
    sim.clear_ops();

    board.digital_write("a2", 1).unwrap();
    board.digital_write("a2", 0).unwrap();
    let a2 = Line::new(PortName::A, 2);
    assert_eq!(sim.ops(), vec![SimOp::Pull(a2, Pull::Up), SimOp::Pull(a2, Pull::Down)]);
}

#[tokio::test]
async fn test_basic_lines_reject_pull() {
    let (sim, board) = board();
    for pin in ["a0", "a1", "b0", "b1"] {
        board.pin_mode(pin, Mode::Input).unwrap();
        let result = board.digital_write(pin, 1);
        assert!(matches!(result, Err(IoError::UnsupportedOperation(_))), "{pin}");
    }
    assert_eq!(sim.count(|op| matches!(op, SimOp::Pull(..) | SimOp::Level(..))), 0);
    assert_eq!(board.pin("a0").unwrap().value, 0.0);
}

#[tokio::test]
async fn test_indicator_write() {
    let (sim, board) = board();
    board.digital_write("l2", 1).unwrap();
    assert_eq!(sim.ops(), vec![SimOp::Level(Line::new(PortName::L, 2), true)]);
}

#[tokio::test]
async fn test_write_to_unknown_pin() {
    let (_sim, board) = board();
    assert!(matches!(board.digital_write("c4", 1), Err(IoError::UnsupportedPin(_))));
    assert!(matches!(board.pwm_write(42, 10), Err(IoError::UnsupportedPin(_))));
}
