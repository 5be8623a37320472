// Read loops, cadence and PWM/servo output against the simulator

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, sleep};

use tessel_io::address::PortName;
use tessel_io::capabilities::Mode;
use tessel_io::hardware::Line;
use tessel_io::hardware::protocol::cmd;
use tessel_io::simulator::{SimOp, SimTransport};
use tessel_io::{Board, BoardOptions, Channel, IoError, ServoOptions, TransportError};

fn board() -> (Arc<SimTransport>, Board) {
    let sim = Arc::new(SimTransport::new());
    let board = Board::new(sim.clone(), BoardOptions::default());
    (sim, board)
}

fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl FnMut(T) + Send + 'static) {
    let values = Arc::new(Mutex::new(Vec::new()));
    let sink = values.clone();
    (values, move |value| sink.lock().unwrap().push(value))
}

fn duties(sim: &SimTransport, line: Line) -> Vec<f64> {
    sim.ops()
        .into_iter()
        .filter_map(|op| match op {
            SimOp::DutyCycle(l, duty) if l == line => Some(duty),
            _ => None,
        })
        .collect()
}

fn frequencies(sim: &SimTransport) -> Vec<u32> {
    sim.ops()
        .into_iter()
        .filter_map(|op| match op {
            SimOp::Frequency(hz) => Some(hz),
            _ => None,
        })
        .collect()
}

fn assert_close(actual: f64, expected: f64) {
    assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
}

#[tokio::test(start_paused = true)]
async fn test_digital_read_reports_changes_only() {
    let (sim, board) = board();
    sim.set_level(2, true);
    let (values, callback) = recorder();
    board.pin_mode("a2", Mode::Input).unwrap().digital_read("a2", callback).unwrap();

    sleep(Duration::from_millis(110)).await;
    assert_eq!(*values.lock().unwrap(), vec![1]);
    // Polling itself continues every tick
    assert!(sim.count(|op| *op == SimOp::Exchange(PortName::A, vec![cmd::GPIO_IN, 2], 0)) >= 5);

    sim.set_level(2, false);
    sleep(Duration::from_millis(60)).await;
    assert_eq!(*values.lock().unwrap(), vec![1, 0]);
    assert_eq!(board.pin("a2").unwrap().value, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_digital_read_low_pin_is_silent() {
    let (_sim, board) = board();
    let (values, callback) = recorder();
    board.pin_mode("b3", Mode::Input).unwrap().digital_read("b3", callback).unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(values.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_digital_read_is_corked() {
    let (sim, board) = board();
    board.pin_mode("a2", Mode::Input).unwrap();
    sim.clear_ops();
    board.digital_read("a2", |_| {}).unwrap();
    sleep(Duration::from_millis(1)).await;

    let ops = sim.ops();
    assert_eq!(
        &ops[..3],
        &[
            SimOp::Cork(PortName::A),
            SimOp::Exchange(PortName::A, vec![cmd::GPIO_IN, 2], 0),
            SimOp::Uncork(PortName::A),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_analog_read_reports_every_sample() {
    let (sim, board) = board();
    sim.set_analog(4, 512);
    sim.set_analog(7, 1023);
    let (a4, on_a4) = recorder();
    let (a7, on_a7) = recorder();
    board.pin_mode("a4", Mode::Analog).unwrap().analog_read("a4", on_a4).unwrap();
    board.pin_mode("a7", Mode::Analog).unwrap().analog_read(7, on_a7).unwrap();

    sleep(Duration::from_millis(50)).await;
    let a4 = a4.lock().unwrap().clone();
    assert!(a4.len() >= 2);
    assert!(a4.iter().all(|&value| value == 512));
    assert!(a7.lock().unwrap().iter().all(|&value| value == 1023));
    assert_eq!(board.pin("a4").unwrap().value, 512.0);

    // Analog exchanges are not corked
    assert_eq!(sim.count(|op| matches!(op, SimOp::Cork(_))), 0);
    assert!(sim.count(|op| *op == SimOp::Exchange(PortName::A, vec![cmd::ANALOG_READ, 4], 2)) >= 2);
}

#[tokio::test]
async fn test_analog_read_rejects_non_analog_pins() {
    let (sim, board) = board();
    for pin in ["a0", "a5", "a6", "l0", "z1"] {
        let result = board.analog_read(pin, |_| {});
        assert!(matches!(result, Err(IoError::UnsupportedPin(_))), "{pin}");
    }
    assert!(matches!(board.analog_read(16, |_| {}), Err(IoError::UnsupportedPin(_))));
    assert!(sim.ops().is_empty());
    assert_eq!(board.listener_count(Channel::AnalogRead(5)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cadence_subtracts_exchange_time() {
    let (sim, board) = board();
    sim.set_latency(Duration::from_millis(8));
    sim.set_analog(8, 100);
    let started = Instant::now();
    let (stamps, callback) = recorder();
    let mut callback = callback;
    board
        .pin_mode("b0", Mode::Analog)
        .unwrap()
        .analog_read("b0", move |_| callback(started.elapsed()))
        .unwrap();

    sleep(Duration::from_millis(75)).await;
    let stamps = stamps.lock().unwrap().clone();
    assert_eq!(
        stamps,
        vec![
            Duration::from_millis(8),
            Duration::from_millis(28),
            Duration::from_millis(48),
            Duration::from_millis(68),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_exchange_polls_back_to_back() {
    let (sim, board) = board();
    sim.set_latency(Duration::from_millis(30));
    let started = Instant::now();
    let (stamps, callback) = recorder();
    let mut callback = callback;
    board
        .pin_mode("b1", Mode::Analog)
        .unwrap()
        .analog_read("b1", move |_| callback(started.elapsed()))
        .unwrap();

    sleep(Duration::from_millis(95)).await;
    let stamps = stamps.lock().unwrap().clone();
    assert_eq!(
        stamps,
        vec![Duration::from_millis(30), Duration::from_millis(60), Duration::from_millis(90)]
    );
}

#[tokio::test]
async fn test_sampling_interval_is_clamped() {
    let (_sim, board) = board();
    assert_eq!(board.sampling_interval(), 20);
    assert_eq!(board.set_sampling_interval(1).sampling_interval(), 5);
    assert_eq!(board.set_sampling_interval(100_000).sampling_interval(), 65535);
    assert_eq!(board.set_sampling_interval(250).sampling_interval(), 250);
}

#[tokio::test(start_paused = true)]
async fn test_read_errors_go_to_error_channel() {
    let (sim, board) = board();
    sim.set_read_error(Some(TransportError::Nack));
    let (errors, callback) = recorder();
    let mut callback = callback;
    board.on(Channel::Error, move |payload| {
        if let Some(e) = payload.error() {
            callback(e.clone());
        }
    });
    board.pin_mode("a2", Mode::Input).unwrap().digital_read("a2", |_| {}).unwrap();

    sleep(Duration::from_millis(50)).await;
    let errors = errors.lock().unwrap().clone();
    assert!(errors.len() >= 2);
    assert!(errors.iter().all(|e| *e == TransportError::Nack));
}

#[tokio::test]
async fn test_pwm_write_extremes() {
    let (sim, board) = board();
    let a5 = Line::new(PortName::A, 5);
    board.pin_mode("a5", Mode::Pwm).unwrap();
    board.pwm_write("a5", 0).unwrap().pwm_write("a5", 255).unwrap().pwm_write("a5", 400).unwrap();
    assert_eq!(duties(&sim, a5), vec![0.0, 1.0, 1.0]);
    assert_eq!(frequencies(&sim), vec![490]);

    board.pin_mode("b7", Mode::Pwm).unwrap();
    board.pwm_write("b7", 0).unwrap().analog_write("b7", 255).unwrap();
    assert_eq!(
        sim.count(|op| *op == SimOp::Write(PortName::B, vec![cmd::ANALOG_WRITE, 0, 0])),
        1
    );
    assert_eq!(
        sim.count(|op| *op == SimOp::Write(PortName::B, vec![cmd::ANALOG_WRITE, 0x03, 0xff])),
        1
    );
    // The DAC never touches the shared carrier
    assert_eq!(frequencies(&sim), vec![490]);
    assert_eq!(board.pin("b7").unwrap().value, 1023.0);
}

#[tokio::test]
async fn test_pwm_write_ignores_other_pins() {
    let (sim, board) = board();
    board.pin_mode("a2", Mode::Output).unwrap();
    sim.clear_ops();
    board.pwm_write("a2", 128).unwrap();
    board.servo_write("b7", 90).unwrap();
    assert!(sim.ops().is_empty());
}

#[tokio::test]
async fn test_servo_write_default_and_custom_range() {
    let (sim, board) = board();
    let a6 = Line::new(PortName::A, 6);
    board.pin_mode("a6", Mode::Servo).unwrap();
    board.servo_write("a6", 0).unwrap().servo_write("a6", 180).unwrap();

    board.servo_config(("a6", 1000, 2000)).unwrap();
    board.servo_write("a6", 0).unwrap().servo_write("a6", 180).unwrap();
    board.servo_write("a6", 1500).unwrap();

    let duties = duties(&sim, a6);
    assert_eq!(duties.len(), 5);
    for (actual, expected) in duties.into_iter().zip([0.03, 0.12, 0.05, 0.10, 0.075]) {
        assert_close(actual, expected);
    }
    assert_eq!(frequencies(&sim), vec![50]);
}

#[tokio::test]
async fn test_carrier_frequency_follows_output_family() {
    let (sim, board) = board();
    board.pin_mode("a5", Mode::Pwm).unwrap();
    board.pin_mode("a6", Mode::Servo).unwrap();

    board.pwm_write("a5", 10).unwrap();
    board.servo_write("a6", 10).unwrap();
    board.servo_write("a6", 20).unwrap();
    board.pwm_write("a5", 20).unwrap();
    assert_eq!(frequencies(&sim), vec![490, 50, 490]);
}

#[tokio::test]
async fn test_servo_config_validation() {
    let (_sim, board) = board();
    let missing = |options: ServoOptions| match board.servo_config(options) {
        Err(IoError::MissingArgument(name)) => name,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(missing(ServoOptions::default()), "pin");
    assert_eq!(
        missing(ServoOptions { pin: Some("a5".into()), ..ServoOptions::default() }),
        "min"
    );
    assert_eq!(
        missing(ServoOptions { pin: Some("a5".into()), min: Some(600), max: None }),
        "max"
    );
    assert!(matches!(board.servo_config(("b7", 600, 2400)), Err(IoError::UnsupportedPin(_))));
    assert!(matches!(board.servo_config(("a5", 2400, 600)), Err(IoError::UnsupportedOperation(_))));
    assert!(board.servo_config(("a5", 600, 2400)).is_ok());
}
