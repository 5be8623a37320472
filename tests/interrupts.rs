// Change interrupts and unsolicited pin notifications

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use tessel_io::address::PortName;
use tessel_io::hardware::{Line, Trigger};
use tessel_io::simulator::{SimOp, SimTransport};
use tessel_io::{Board, BoardOptions, Channel, IoError};

fn board() -> (Arc<SimTransport>, Board) {
    let sim = Arc::new(SimTransport::new());
    let board = Board::new(sim.clone(), BoardOptions::default());
    (sim, board)
}

fn watch(board: &Board, pin: &str) -> Arc<Mutex<Vec<u16>>> {
    let levels = Arc::new(Mutex::new(Vec::new()));
    let sink = levels.clone();
    board
        .on_pin_change(pin, move |level| sink.lock().unwrap().push(level))
        .unwrap();
    levels
}

#[tokio::test]
async fn test_arms_each_line_once() {
    let (sim, board) = board();
    let _ = watch(&board, "a2");
    let _ = watch(&board, "A2");
    let _ = watch(&board, "b7");

    assert_eq!(
        sim.ops(),
        vec![
            SimOp::Interrupt(Line::new(PortName::A, 2), Some(Trigger::Change)),
            SimOp::Interrupt(Line::new(PortName::B, 7), Some(Trigger::Change)),
        ]
    );
    assert_eq!(board.listener_count(Channel::PinChange(2)), 2);
}

#[tokio::test(start_paused = true)]
async fn test_notification_delivers_level() {
    let (sim, board) = board();
    let levels = watch(&board, "a5");

    sim.pin_change(5, true);
    sim.pin_change(5, false);
    sleep(Duration::from_millis(1)).await;

    assert_eq!(*levels.lock().unwrap(), vec![1, 0]);
    assert_eq!(board.pin("a5").unwrap().value, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_unarmed_lines_are_ignored() {
    let (sim, board) = board();
    let levels = watch(&board, "a6");
    let seen = Arc::new(Mutex::new(0));
    let counter = seen.clone();
    board.on(Channel::PinChange(10), move |_| *counter.lock().unwrap() += 1);

    sim.pin_change(10, true);
    sleep(Duration::from_millis(1)).await;

    assert_eq!(*seen.lock().unwrap(), 0);
    assert!(levels.lock().unwrap().is_empty());
    assert_eq!(board.pin("b2").unwrap().value, 0.0);
}

#[tokio::test]
async fn test_pins_without_interrupts_are_rejected() {
    let (sim, board) = board();
    for pin in ["a0", "a3", "b4", "l1", "q2"] {
        let result = board.on_pin_change(pin, |_| {});
        assert!(matches!(result, Err(IoError::UnsupportedPin(_))), "{pin}");
    }
    assert!(sim.ops().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_remove_disarms() {
    let (sim, board) = board();
    let levels = watch(&board, "b2");
    board.remove_pin_change("b2").unwrap();
    board.remove_pin_change("b2").unwrap();

    let b2 = Line::new(PortName::B, 2);
    assert_eq!(sim.count(|op| *op == SimOp::Interrupt(b2, None)), 1);
    assert_eq!(board.listener_count(Channel::PinChange(10)), 0);

    sim.pin_change(10, true);
    sleep(Duration::from_millis(1)).await;
    assert!(levels.lock().unwrap().is_empty());
}
