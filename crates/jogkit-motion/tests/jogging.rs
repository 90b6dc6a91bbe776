use jogkit_communication::MockDevice;
use jogkit_core::event_bus::{JogStarted, JogStopped, SoftLimitTriggered};
use jogkit_core::{
    Axis, BusEvent, Direction, ErrorKind, MachineStatus, Operation, Position, SoftLimits,
};
use jogkit_motion::MachineController;
use jogkit_settings::Config;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const JOG_CANCEL: u8 = 0x85;

async fn connected() -> (MachineController, MockDevice) {
    let mut config = Config::default();
    config.connection.status_poll_interval_ms = 0;
    config.connection.auto_reconnect = false;
    config.machine.jog_step_interval_ms = 100;

    let device = MockDevice::new();
    let controller = MachineController::new(config, Arc::new(device.factory())).unwrap();
    controller.connect("mock", 115200).await.unwrap();
    device.clear_received();
    (controller, device)
}

fn collect<E: BusEvent>(controller: &MachineController) -> Arc<Mutex<Vec<E>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    controller.on(move |e: &E| sink.lock().push(e.clone()));
    events
}

#[tokio::test(start_paused = true)]
async fn continuous_jog_stops_on_soft_limit() {
    let (controller, device) = connected().await;
    device.set_position(Position::new(280.0, 0.0, 0.0));
    controller.query_status().await.unwrap();
    let triggered = collect::<SoftLimitTriggered>(&controller);
    let stopped = collect::<JogStopped>(&controller);

    // 6000 mm/min at 100 ms per step is 10 mm a step
    controller
        .jog_continuous(Axis::X, Direction::Positive, Some(6000.0))
        .unwrap();
    assert_eq!(controller.get_state().status, Some(MachineStatus::Jog));
    sleep(Duration::from_secs(1)).await;

    let state = controller.get_state();
    assert_eq!(state.position.x, 300.0);
    assert!(state.continuous_axes.is_empty());
    assert_eq!(state.active_operation, None);
    assert_eq!(state.status, Some(MachineStatus::Idle));
    assert_eq!(
        device.lines(),
        vec!["$J=G53 G21 X290.000 F6000", "$J=G53 G21 X300.000 F6000"]
    );

    let triggered = triggered.lock();
    assert_eq!(triggered.len(), 1);
    assert_eq!(triggered[0].limit, 300.0);
    assert_eq!(triggered[0].target, 300.0);
    assert_eq!(stopped.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn continuous_jog_at_limit_is_rejected() {
    let (controller, device) = connected().await;
    device.set_position(Position::new(0.0, 300.0, 0.0));
    controller.query_status().await.unwrap();

    let err = controller
        .jog_continuous(Axis::Y, Direction::Positive, None)
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Bounds);
    assert_eq!(controller.get_state().status, Some(MachineStatus::Idle));
    assert!(controller.get_state().continuous_axes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_jog_is_idempotent() {
    let (controller, device) = connected().await;
    let stopped = collect::<JogStopped>(&controller);

    controller
        .jog_continuous(Axis::X, Direction::Positive, Some(600.0))
        .unwrap();
    sleep(Duration::from_millis(350)).await;
    let travelled = controller.get_state().position.x;
    assert!(travelled > 0.0);

    controller.stop_jog(None).unwrap();
    controller.stop_jog(Some("again")).unwrap();
    sleep(Duration::from_millis(500)).await;

    let state = controller.get_state();
    assert_eq!(state.status, Some(MachineStatus::Idle));
    assert_eq!(state.active_operation, None);
    assert!(state.continuous_axes.is_empty());
    assert_eq!(state.position.x, travelled);
    assert_eq!(device.realtime_bytes(), vec![JOG_CANCEL]);

    let stopped = stopped.lock();
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].reason, "stopped by operator");
}

#[tokio::test(start_paused = true)]
async fn axes_jog_and_stop_independently() {
    let (controller, _device) = connected().await;
    let started = collect::<JogStarted>(&controller);

    controller
        .jog_continuous(Axis::X, Direction::Positive, Some(600.0))
        .unwrap();
    controller
        .jog_continuous(Axis::Y, Direction::Positive, Some(600.0))
        .unwrap();
    let err = controller
        .jog_continuous(Axis::X, Direction::Positive, None)
        .unwrap_err();
    assert!(matches!(
        err,
        jogkit_core::Error::OperationInProgress {
            operation: Operation::ContinuousJog
        }
    ));
    assert_eq!(started.lock().len(), 2);

    sleep(Duration::from_millis(250)).await;
    controller.stop_axis(Axis::X).unwrap();
    let x = controller.get_state().position.x;
    let y = controller.get_state().position.y;
    assert_eq!(controller.get_state().status, Some(MachineStatus::Jog));

    sleep(Duration::from_millis(300)).await;
    let state = controller.get_state();
    assert_eq!(state.position.x, x);
    assert!(state.position.y > y);
    assert_eq!(state.continuous_axes.len(), 1);

    controller.stop_axis(Axis::Y).unwrap();
    let state = controller.get_state();
    assert!(state.continuous_axes.is_empty());
    assert_eq!(state.status, Some(MachineStatus::Idle));
}

#[tokio::test(start_paused = true)]
async fn incremental_jog_blocked_during_continuous_jog() {
    let (controller, _device) = connected().await;
    controller
        .jog_continuous(Axis::Z, Direction::Negative, None)
        .unwrap();

    let err = controller
        .jog_incremental(Axis::X, Direction::Positive, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationInProgress);

    controller.stop_jog(None).unwrap();
    controller
        .jog_incremental(Axis::X, Direction::Positive, None, None)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn disabled_limits_let_jogs_run_free() {
    let (controller, device) = connected().await;
    controller.set_soft_limits(SoftLimits::disabled()).unwrap();

    let position = controller
        .jog_incremental(Axis::X, Direction::Negative, Some(25.0), None)
        .await
        .unwrap();

    assert_eq!(position.x, -25.0);
    assert_eq!(device.position().x, -25.0);
}

#[tokio::test(start_paused = true)]
async fn alarm_during_continuous_jog_stops_it() {
    let (controller, device) = connected().await;
    controller
        .jog_continuous(Axis::X, Direction::Positive, Some(600.0))
        .unwrap();
    sleep(Duration::from_millis(150)).await;

    device.push_line("ALARM:2");
    controller.query_status().await.unwrap();

    let state = controller.get_state();
    assert_eq!(state.status, Some(MachineStatus::Alarm));
    assert!(state.continuous_axes.is_empty());
    assert_eq!(state.active_operation, None);
    assert_eq!(state.alarms[0].code, 2);
}

#[tokio::test]
async fn stopped_incremental_jog_does_not_report_its_target() {
    let (controller, device) = connected().await;
    device.ignore_next_lines(1);

    let jog = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .jog_incremental(Axis::X, Direction::Positive, Some(10.0), None)
                .await
        })
    };
    while device.lines().is_empty() {
        tokio::task::yield_now().await;
    }

    controller.stop_jog(None).unwrap();
    // Acknowledgment of the jog arrives after the stop
    device.push_line("ok");

    let err = jog.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Command);
    let state = controller.get_state();
    assert_eq!(state.position.x, 0.0);
    assert_eq!(state.status, Some(MachineStatus::Idle));
    assert_eq!(state.active_operation, None);
}
