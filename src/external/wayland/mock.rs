//! A recording [`IdleNotify`] implementation for tests. Installed timeouts
//! never fire on their own; tests trigger them explicitly.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use super::{IdleCallback, IdleHandle, IdleNotify};

struct MockNotification {
    timeout: Duration,
    on_idle: IdleCallback,
    on_resume: IdleCallback,
}

struct MockState {
    next_token: u64,
    installed: HashMap<u64, MockNotification>,
    released: Vec<u64>,
    fail_installs: bool,
}

pub struct MockNotifier {
    state: Mutex<MockState>,
}

impl MockNotifier {
    pub fn new() -> Arc<MockNotifier> {
        Arc::new(MockNotifier {
            state: Mutex::new(MockState {
                next_token: 0,
                installed: HashMap::new(),
                released: Vec::new(),
                fail_installs: false,
            }),
        })
    }

    pub fn fail_installs(&self, fail: bool) {
        self.state.lock().unwrap().fail_installs = fail;
    }

    pub fn installed_count(&self) -> usize {
        self.state.lock().unwrap().installed.len()
    }

    pub fn installed_timeouts(&self) -> Vec<Duration> {
        let mut timeouts: Vec<Duration> = self
            .state
            .lock()
            .unwrap()
            .installed
            .values()
            .map(|notification| notification.timeout)
            .collect();
        timeouts.sort();
        timeouts
    }

    pub fn release_count(&self) -> usize {
        self.state.lock().unwrap().released.len()
    }

    /// Clone the resume callbacks of everything currently installed, in
    /// installation order. Lets a test hold on to a callback across a
    /// release, simulating an event already in flight.
    pub fn snapshot_resume_callbacks(&self) -> Vec<IdleCallback> {
        let state = self.state.lock().unwrap();
        let mut tokens: Vec<&u64> = state.installed.keys().collect();
        tokens.sort();
        tokens
            .into_iter()
            .map(|token| Arc::clone(&state.installed[token].on_resume))
            .collect()
    }

    pub fn fire_idle_all(&self) {
        for callback in self.snapshot_idle_callbacks() {
            callback();
        }
    }

    pub fn fire_resume_all(&self) {
        for callback in self.snapshot_resume_callbacks() {
            callback();
        }
    }

    fn snapshot_idle_callbacks(&self) -> Vec<IdleCallback> {
        let state = self.state.lock().unwrap();
        let mut tokens: Vec<&u64> = state.installed.keys().collect();
        tokens.sort();
        tokens
            .into_iter()
            .map(|token| Arc::clone(&state.installed[token].on_idle))
            .collect()
    }
}

impl IdleNotify for MockNotifier {
    fn install(
        &self,
        timeout: Duration,
        on_idle: IdleCallback,
        on_resume: IdleCallback,
    ) -> Option<IdleHandle> {
        let mut state = self.state.lock().unwrap();
        if state.fail_installs {
            return None;
        }
        state.next_token += 1;
        let token = state.next_token;
        state.installed.insert(
            token,
            MockNotification {
                timeout,
                on_idle,
                on_resume,
            },
        );
        Some(IdleHandle(token))
    }

    fn release(&self, handle: IdleHandle) {
        let mut state = self.state.lock().unwrap();
        state.installed.remove(&handle.0);
        state.released.push(handle.0);
    }
}
