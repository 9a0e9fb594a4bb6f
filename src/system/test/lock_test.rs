use crate::actors::EventSender;
use crate::config::Config;
use crate::system::{
    lock::{LockStatus, LockSupervisor},
    music::MusicSilencer,
    netwatch::{ProbeCallback, TrustProbe},
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, RwLock};

/// A prober that answers each call from a prepared list of outcomes,
/// invoking the callback synchronously.
#[derive(Clone)]
struct ScriptedProbe {
    outcomes: Arc<Mutex<VecDeque<bool>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProbe {
    fn new(outcomes: Vec<bool>) -> ScriptedProbe {
        ScriptedProbe {
            outcomes: Arc::new(Mutex::new(outcomes.into())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TrustProbe for ScriptedProbe {
    fn probe(&self, _addresses: Vec<String>, on_done: ProbeCallback) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcomes.lock().unwrap().pop_front().unwrap_or(false);
        on_done(outcome);
    }
}

fn lock_config(grace: Duration) -> crate::config::SharedConfig {
    Arc::new(RwLock::new(Config {
        idle_grace_duration: grace,
        lock_command: vec!["sleep".to_string(), "30".to_string()],
        trusted_wifi_networks: vec!["aa:bb:cc:dd:ee:ff".to_string()],
        ..Config::default()
    }))
}

async fn expect_status(rx: &mut mpsc::Receiver<LockStatus>, expected: LockStatus) {
    let status = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a lock result");
    assert_eq!(status, Some(expected));
}

#[tokio::test]
async fn idle_lock_unlocks_inside_the_grace_window() {
    let (results, mut rx) = EventSender::bounded(8);
    let probe = ScriptedProbe::new(vec![]);
    let supervisor = LockSupervisor::new(
        lock_config(Duration::from_secs(30)),
        results,
        probe.clone(),
        MusicSilencer::new(None),
    );

    assert!(supervisor.start_as_idle().await);
    // Inside the grace window the stop must not consult the prober.
    assert!(supervisor.try_stop().await);
    expect_status(&mut rx, LockStatus::LockExit).await;
    assert_eq!(probe.calls(), 0);
}

#[tokio::test]
async fn user_lock_requires_trust_proof() {
    let (results, mut rx) = EventSender::bounded(8);
    let probe = ScriptedProbe::new(vec![true]);
    let supervisor = LockSupervisor::new(
        lock_config(Duration::from_secs(30)),
        results,
        probe.clone(),
        MusicSilencer::new(None),
    );

    assert!(supervisor.start_as_user().await);
    // Born past its grace window, so the prober decides.
    assert!(!supervisor.try_stop().await);
    expect_status(&mut rx, LockStatus::LockExit).await;
    assert_eq!(probe.calls(), 1);
}

#[tokio::test]
async fn failed_trust_proof_reports_unlock_failed() {
    let (results, mut rx) = EventSender::bounded(8);
    let probe = ScriptedProbe::new(vec![false, true]);
    let supervisor = LockSupervisor::new(
        lock_config(Duration::from_secs(30)),
        results,
        probe.clone(),
        MusicSilencer::new(None),
    );

    assert!(supervisor.start_as_user().await);
    assert!(!supervisor.try_stop().await);
    expect_status(&mut rx, LockStatus::UnlockFailed).await;

    // The locker is still alive; a later successful proof releases it.
    assert!(!supervisor.try_stop().await);
    expect_status(&mut rx, LockStatus::LockExit).await;
    assert_eq!(probe.calls(), 2);
}

#[tokio::test]
async fn start_is_idempotent_while_a_lock_runs() {
    let (results, mut rx) = EventSender::bounded(8);
    let probe = ScriptedProbe::new(vec![]);
    let supervisor = LockSupervisor::new(
        lock_config(Duration::from_secs(30)),
        results,
        probe.clone(),
        MusicSilencer::new(None),
    );

    assert!(supervisor.start_as_idle().await);
    assert!(supervisor.start_as_idle().await);
    assert!(supervisor.start_as_user().await);

    assert!(supervisor.try_stop().await);
    expect_status(&mut rx, LockStatus::LockExit).await;
    // Only one instance ever existed, so exactly one exit is published.
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn stopping_without_a_running_lock_succeeds() {
    let (results, _rx) = EventSender::bounded(8);
    let probe = ScriptedProbe::new(vec![]);
    let supervisor = LockSupervisor::new(
        lock_config(Duration::from_secs(30)),
        results,
        probe.clone(),
        MusicSilencer::new(None),
    );
    assert!(supervisor.try_stop().await);
    assert_eq!(probe.calls(), 0);
}
