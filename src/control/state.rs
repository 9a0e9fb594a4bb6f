//! The state manager: one authoritative session state, a registry of idle
//! timeouts grouped by owning state, and the transition protocol that swaps
//! one state's timeouts for another's.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::external::wayland::{IdleCallback, IdleHandle, IdleNotify};

/// The logical session state. `None` covers both the bounded in-flight
/// window of a transition and the persistent inhibited state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Active = 0,
    Idle = 1,
    None = 2,
}

impl SessionState {
    fn from_raw(raw: u8) -> SessionState {
        match raw {
            0 => SessionState::Active,
            1 => SessionState::Idle,
            _ => SessionState::None,
        }
    }
}

struct TimeoutEntry {
    state: SessionState,
    timeout: Duration,
    on_idle: IdleCallback,
    on_resume: IdleCallback,
    run_once: bool,
    live: Option<IdleHandle>,
}

/// Owns the current [`SessionState`] and the timeout registry.
///
/// Reads of the state go through a single atomic slot; every write happens
/// inside [`Self::transition`], which is serialized by its own lock so two
/// transitions can never interleave.
pub struct StateMachine<N: IdleNotify> {
    notifier: Arc<N>,
    entries: Mutex<Vec<TimeoutEntry>>,
    current: AtomicU8,
    transition_serial: tokio::sync::Mutex<()>,
}

impl<N: IdleNotify> StateMachine<N> {
    pub fn new(notifier: Arc<N>) -> Arc<StateMachine<N>> {
        Arc::new(StateMachine {
            notifier,
            entries: Mutex::new(Vec::new()),
            current: AtomicU8::new(SessionState::None as u8),
            transition_serial: tokio::sync::Mutex::new(()),
        })
    }

    /// Register a timeout owned by `state`. A live notification exists for
    /// it exactly while `state` is current.
    pub fn register(
        &self,
        state: SessionState,
        timeout: Duration,
        on_idle: impl Fn() + Send + Sync + 'static,
        on_resume: impl Fn() + Send + Sync + 'static,
    ) {
        self.register_entry(state, timeout, Arc::new(on_idle), Arc::new(on_resume), false);
    }

    /// Like [`Self::register`], but the entry releases itself after its
    /// first resume per entry into its state.
    pub fn register_once(
        &self,
        state: SessionState,
        timeout: Duration,
        on_idle: impl Fn() + Send + Sync + 'static,
        on_resume: impl Fn() + Send + Sync + 'static,
    ) {
        self.register_entry(state, timeout, Arc::new(on_idle), Arc::new(on_resume), true);
    }

    fn register_entry(
        &self,
        state: SessionState,
        timeout: Duration,
        on_idle: IdleCallback,
        on_resume: IdleCallback,
        run_once: bool,
    ) {
        self.entries.lock().unwrap().push(TimeoutEntry {
            state,
            timeout,
            on_idle,
            on_resume,
            run_once,
            live: None,
        });
    }

    pub fn current(&self) -> SessionState {
        SessionState::from_raw(self.current.load(Ordering::SeqCst))
    }

    /// The only state mutator.
    ///
    /// Releases every timeout of the present state and parks the machine in
    /// `None`, waits `predelay`, then consults `gate`. Only a true gate
    /// installs the timeouts of `target` and makes it current; a false gate
    /// leaves the machine in `None` and the caller learns the outcome
    /// through the gate's side effects.
    pub async fn transition<F, Fut>(
        self: &Arc<Self>,
        target: SessionState,
        predelay: Duration,
        gate: F,
    ) where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        let _serial = self.transition_serial.lock().await;
        if self.current() == target {
            log::debug!("state {:?} already active, resetting", target);
        }
        {
            let mut entries = self.entries.lock().unwrap();
            let leaving = self.current();
            for entry in entries.iter_mut() {
                if entry.state == leaving {
                    if let Some(handle) = entry.live.take() {
                        self.notifier.release(handle);
                    }
                }
            }
            self.current
                .store(SessionState::None as u8, Ordering::SeqCst);
            log::debug!("released timeouts of state {:?}", leaving);
        }

        if !predelay.is_zero() {
            tokio::time::sleep(predelay).await;
        }

        if !gate().await {
            log::debug!("gate refused transition to {:?}", target);
            return;
        }

        {
            let mut entries = self.entries.lock().unwrap();
            for index in 0..entries.len() {
                if entries[index].state == target {
                    let timeout = entries[index].timeout;
                    let on_idle = Arc::clone(&entries[index].on_idle);
                    let on_resume = self.resume_hook(index);
                    entries[index].live = self.notifier.install(timeout, on_idle, on_resume);
                }
            }
            self.current.store(target as u8, Ordering::SeqCst);
        }
        log::debug!("entered state {:?}", target);
    }

    fn resume_hook(self: &Arc<Self>, index: usize) -> IdleCallback {
        let machine = Arc::clone(self);
        Arc::new(move || machine.handle_resume(index))
    }

    /// Resume-side wrapper around the registered callback. Re-checks the
    /// current state under the registry lock so a resume racing a
    /// transition observes the new state and suppresses itself.
    fn handle_resume(&self, index: usize) {
        let mut entries = self.entries.lock().unwrap();
        let entry = &mut entries[index];
        if self.current() != entry.state {
            return;
        }
        if entry.run_once {
            match entry.live.take() {
                Some(handle) => self.notifier.release(handle),
                // Already fired for this entry into the state.
                None => return,
            }
        }
        let callback = Arc::clone(&entry.on_resume);
        callback();
    }
}
