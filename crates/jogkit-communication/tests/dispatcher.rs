use jogkit_communication::{
    Command, CommandDispatcher, CommandQueue, DeviceListener, MockDevice, StatusReport,
    TransportFactory,
};
use jogkit_core::{CommandError, Error, Priority};
use jogkit_settings::DispatcherSettings;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

async fn attached(device: &MockDevice) -> CommandDispatcher {
    let dispatcher = CommandDispatcher::new(DispatcherSettings::default());
    let transport = device.factory().open("mock", 115200).await.unwrap();
    dispatcher.attach(transport).await;
    dispatcher
}

fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Normal),
        Just(Priority::High),
        Just(Priority::Emergency),
    ]
}

proptest! {
    #[test]
    fn queue_pops_by_priority_then_arrival(priorities in prop::collection::vec(priority_strategy(), 0..64)) {
        let mut queue = CommandQueue::new();
        for (index, priority) in priorities.iter().enumerate() {
            queue.push(Command::line(format!("N{}", index)).priority(*priority));
        }

        let mut expected: Vec<(Priority, usize)> = priorities
            .iter()
            .enumerate()
            .map(|(index, priority)| (*priority, index))
            .collect();
        expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut popped = Vec::new();
        while let Some(command) = queue.pop() {
            popped.push(command.text());
        }
        let expected: Vec<String> = expected.iter().map(|(_, i)| format!("N{}", i)).collect();
        prop_assert_eq!(popped, expected);
    }

    #[test]
    fn emergency_overtakes_everything_queued(normals in 0usize..20, lows in 0usize..20) {
        let mut queue = CommandQueue::new();
        for i in 0..normals {
            queue.push(Command::line(format!("N{}", i)));
        }
        for i in 0..lows {
            queue.push(Command::line(format!("L{}", i)).priority(Priority::Low));
        }
        queue.push(Command::line("$X").priority(Priority::Emergency));

        prop_assert_eq!(queue.pop().map(|c| c.text()), Some("$X".to_string()));
    }
}

#[tokio::test]
async fn emergency_runs_before_queued_normal_commands() {
    let device = MockDevice::new();
    let dispatcher = attached(&device).await;
    dispatcher.pause();

    let mut pending = Vec::new();
    for line in ["G0 X1", "G0 X2", "G0 X3"] {
        let dispatcher = dispatcher.clone();
        pending.push(tokio::spawn(async move {
            dispatcher.send_line(line, Priority::Normal).await
        }));
    }
    while dispatcher.len() < 3 {
        tokio::task::yield_now().await;
    }
    assert!(device.lines().is_empty());

    dispatcher.resume();
    dispatcher.send_line("$X", Priority::Emergency).await.unwrap();
    for task in pending {
        task.await.unwrap().unwrap();
    }

    assert_eq!(device.lines(), vec!["$X", "G0 X1", "G0 X2", "G0 X3"]);
}

#[tokio::test]
async fn emergency_bypasses_pause() {
    let device = MockDevice::new();
    let dispatcher = attached(&device).await;
    dispatcher.pause();

    dispatcher
        .send(Command::realtime(0x18).priority(Priority::Emergency))
        .await
        .unwrap();
    assert_eq!(device.realtime_bytes(), vec![0x18]);
    assert!(dispatcher.is_paused());
}

#[tokio::test]
async fn transport_loss_fails_the_whole_queue() {
    let device = MockDevice::new();
    let dispatcher = attached(&device).await;

    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    dispatcher.set_failure_handler(Arc::new(move |_reason: &str| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    dispatcher.pause();
    let mut pending = Vec::new();
    for line in ["G0 X1", "G0 X2", "G0 X3"] {
        let dispatcher = dispatcher.clone();
        pending.push(tokio::spawn(async move {
            dispatcher.send_line(line, Priority::Normal).await
        }));
    }
    while dispatcher.len() < 3 {
        tokio::task::yield_now().await;
    }

    device.drop_link();
    dispatcher.resume();

    for task in pending {
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Fatal { .. }), "{:?}", err);
    }
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert!(!dispatcher.is_attached());
    assert!(dispatcher.enqueue(Command::line("G0 X4")).is_err());
}

#[tokio::test]
async fn cancel_tagged_leaves_other_commands() {
    let device = MockDevice::new();
    let dispatcher = attached(&device).await;
    dispatcher.pause();

    let jog = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.send(Command::line("$J=G53 G21 X1.000 F100").tag("jog")).await })
    };
    let other = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.send_line("G4 P0", Priority::Normal).await })
    };
    while dispatcher.len() < 2 {
        tokio::task::yield_now().await;
    }

    assert!(dispatcher.has_tag("jog"));
    assert_eq!(dispatcher.cancel_tagged("jog", "stopped"), 1);
    dispatcher.resume();

    assert!(jog.await.unwrap().is_err());
    assert!(other.await.unwrap().is_ok());
    assert_eq!(device.lines(), vec!["G4 P0"]);
}

#[derive(Default)]
struct Recorder {
    alarms: Mutex<Vec<u8>>,
    reports: Mutex<Vec<StatusReport>>,
}

impl DeviceListener for Recorder {
    fn on_status_report(&self, report: &StatusReport) {
        self.reports.lock().push(report.clone());
    }

    fn on_alarm(&self, code: u8) {
        self.alarms.lock().push(code);
    }
}

#[tokio::test]
async fn alarms_and_reports_reach_the_listener() {
    let device = MockDevice::new();
    let dispatcher = attached(&device).await;
    let recorder = Arc::new(Recorder::default());
    let weak: Weak<Recorder> = Arc::downgrade(&recorder);
    dispatcher.set_listener(weak);

    device.fail_homing(jogkit_core::Axis::X);
    let err = dispatcher.send_line("$HX", Priority::Normal).await.unwrap_err();
    assert!(matches!(err, Error::Command(CommandError::Rejected { code: 9, .. })));
    assert_eq!(*recorder.alarms.lock(), vec![9]);

    dispatcher.send(Command::realtime(b'?')).await.unwrap();
    assert_eq!(recorder.reports.lock().len(), 1);
}
