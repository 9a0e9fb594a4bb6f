use crate::control::state::{SessionState, StateMachine};
use crate::external::wayland::mock::MockNotifier;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

type CallLog = Arc<Mutex<Vec<&'static str>>>;

fn recorder(log: &CallLog, label: &'static str) -> impl Fn() + Send + Sync + 'static {
    let log = Arc::clone(log);
    move || log.lock().unwrap().push(label)
}

fn noop() {}

/// Registry mirroring the production schedule's shape: two Active
/// timeouts, three Idle timeouts of which one is one-shot.
fn populated_machine(
    notifier: &Arc<MockNotifier>,
    log: &CallLog,
) -> Arc<StateMachine<MockNotifier>> {
    let machine = StateMachine::new(Arc::clone(notifier));
    machine.register(
        SessionState::Active,
        Duration::from_secs(150),
        recorder(log, "dim"),
        recorder(log, "restore"),
    );
    machine.register(
        SessionState::Active,
        Duration::from_secs(180),
        recorder(log, "idle-request"),
        noop,
    );
    machine.register_once(
        SessionState::Idle,
        Duration::from_millis(30),
        noop,
        recorder(log, "first-input-unlock"),
    );
    machine.register(
        SessionState::Idle,
        Duration::from_secs(15),
        recorder(log, "screen-off"),
        recorder(log, "unlock"),
    );
    machine.register(
        SessionState::Idle,
        Duration::from_secs(20),
        recorder(log, "suspend"),
        noop,
    );
    machine
}

#[tokio::test]
async fn entering_a_state_installs_exactly_its_timeouts() {
    let notifier = MockNotifier::new();
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let machine = populated_machine(&notifier, &log);

    machine
        .transition(SessionState::Active, Duration::ZERO, || async { true })
        .await;
    assert_eq!(machine.current(), SessionState::Active);
    assert_eq!(
        notifier.installed_timeouts(),
        vec![Duration::from_secs(150), Duration::from_secs(180)]
    );

    machine
        .transition(SessionState::Idle, Duration::ZERO, || async { true })
        .await;
    assert_eq!(machine.current(), SessionState::Idle);
    assert_eq!(
        notifier.installed_timeouts(),
        vec![
            Duration::from_millis(30),
            Duration::from_secs(15),
            Duration::from_secs(20)
        ]
    );
    // Both Active handles were released on the way out.
    assert_eq!(notifier.release_count(), 2);
}

#[tokio::test]
async fn a_refused_gate_parks_the_machine_in_none() {
    let notifier = MockNotifier::new();
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let machine = populated_machine(&notifier, &log);

    machine
        .transition(SessionState::Active, Duration::ZERO, || async { true })
        .await;
    machine
        .transition(SessionState::Idle, Duration::ZERO, || async { false })
        .await;

    assert_eq!(machine.current(), SessionState::None);
    assert_eq!(notifier.installed_count(), 0);
}

#[tokio::test]
async fn the_gate_observes_the_in_flight_state() {
    let notifier = MockNotifier::new();
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let machine = populated_machine(&notifier, &log);

    let observer = Arc::clone(&machine);
    machine
        .transition(SessionState::Active, Duration::ZERO, move || async move {
            assert_eq!(observer.current(), SessionState::None);
            true
        })
        .await;
    assert_eq!(machine.current(), SessionState::Active);
}

#[tokio::test]
async fn a_stale_resume_is_suppressed_after_leaving_the_state() {
    let notifier = MockNotifier::new();
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let machine = populated_machine(&notifier, &log);

    machine
        .transition(SessionState::Active, Duration::ZERO, || async { true })
        .await;
    // Hold on to the wrapped callbacks as if their events were in flight.
    let stale = notifier.snapshot_resume_callbacks();

    machine
        .transition(SessionState::Idle, Duration::ZERO, || async { true })
        .await;
    for callback in stale {
        callback();
    }
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn resume_in_the_owning_state_reaches_the_callback() {
    let notifier = MockNotifier::new();
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let machine = populated_machine(&notifier, &log);

    machine
        .transition(SessionState::Active, Duration::ZERO, || async { true })
        .await;
    notifier.fire_resume_all();
    assert_eq!(*log.lock().unwrap(), vec!["restore"]);
}

#[tokio::test]
async fn one_shot_entries_fire_at_most_once_per_state_entry() {
    let notifier = MockNotifier::new();
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let machine = populated_machine(&notifier, &log);

    machine
        .transition(SessionState::Idle, Duration::ZERO, || async { true })
        .await;
    let callbacks = notifier.snapshot_resume_callbacks();

    // First resume: the one-shot fires and releases its handle.
    for callback in &callbacks {
        callback();
    }
    {
        let calls = log.lock().unwrap();
        assert_eq!(
            calls.iter().filter(|call| **call == "first-input-unlock").count(),
            1
        );
    }
    assert_eq!(notifier.installed_count(), 2);

    // A second resume of the stale callback stays silent.
    for callback in &callbacks {
        callback();
    }
    let calls = log.lock().unwrap();
    assert_eq!(
        calls.iter().filter(|call| **call == "first-input-unlock").count(),
        1
    );

    drop(calls);
    // Re-entering the state re-arms the one-shot.
    machine
        .transition(SessionState::Idle, Duration::ZERO, || async { true })
        .await;
    notifier.fire_resume_all();
    let calls = log.lock().unwrap();
    assert_eq!(
        calls.iter().filter(|call| **call == "first-input-unlock").count(),
        2
    );
}

#[tokio::test]
async fn failed_installation_does_not_abort_the_transition() {
    let notifier = MockNotifier::new();
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let machine = populated_machine(&notifier, &log);

    notifier.fail_installs(true);
    machine
        .transition(SessionState::Active, Duration::ZERO, || async { true })
        .await;
    assert_eq!(machine.current(), SessionState::Active);
    assert_eq!(notifier.installed_count(), 0);

    // The next entry into the state installs again.
    notifier.fail_installs(false);
    machine
        .transition(SessionState::Active, Duration::ZERO, || async { true })
        .await;
    assert_eq!(notifier.installed_count(), 2);
}

#[tokio::test]
async fn concurrent_transitions_serialize() {
    let notifier = MockNotifier::new();
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let machine = populated_machine(&notifier, &log);

    let to_active = {
        let machine = Arc::clone(&machine);
        tokio::spawn(async move {
            machine
                .transition(SessionState::Active, Duration::ZERO, || async { true })
                .await;
        })
    };
    let to_idle = {
        let machine = Arc::clone(&machine);
        tokio::spawn(async move {
            machine
                .transition(SessionState::Idle, Duration::ZERO, || async { true })
                .await;
        })
    };
    to_active.await.unwrap();
    to_idle.await.unwrap();

    // Whichever transition ran last, the installed handles must equal the
    // final state's registry entries.
    let expected = match machine.current() {
        SessionState::Active => vec![Duration::from_secs(150), Duration::from_secs(180)],
        SessionState::Idle => vec![
            Duration::from_millis(30),
            Duration::from_secs(15),
            Duration::from_secs(20),
        ],
        SessionState::None => panic!("machine parked in None after accepted gates"),
    };
    assert_eq!(notifier.installed_timeouts(), expected);
}

#[tokio::test]
async fn reentering_the_current_state_reinstalls_its_timeouts() {
    let notifier = MockNotifier::new();
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let machine = populated_machine(&notifier, &log);

    machine
        .transition(SessionState::Active, Duration::ZERO, || async { true })
        .await;
    machine
        .transition(SessionState::Active, Duration::ZERO, || async { true })
        .await;
    assert_eq!(machine.current(), SessionState::Active);
    assert_eq!(notifier.installed_count(), 2);
    assert_eq!(notifier.release_count(), 2);
}
