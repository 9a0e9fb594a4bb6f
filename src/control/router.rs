//! The command router: a single consumer demultiplexing lid, idle, user
//! and lock-result events into state transitions and side effects.

use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};

use crate::{
    actors::EventSender,
    config::SharedConfig,
    control::state::{SessionState, StateMachine},
    external::{
        probes::{self, LidProbe},
        wayland::{output_power::OutputPowerManager, IdleNotify},
    },
    system::{
        backlight::BacklightCommand,
        lock::{LockStatus, LockSupervisor},
        netwatch::TrustProbe,
        suspend::Suspender,
    },
};

const USER_LOCK_PREDELAY: Duration = Duration::from_millis(500);

/// Internal events posted by idle timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    TryUnlock,
    IdleRequest,
    TryIdleToSuspend,
}

/// Lid hints arriving over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LidEvent {
    LidClose,
    LidOpen,
}

/// Requests arriving over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRequest {
    Lock,
    Suspend,
    IdleInhibit,
    IdleAllow,
}

/// Cuts display power and queues a backlight restore, in that order, so
/// the restored level is already latent for the next power-on.
#[derive(Clone)]
pub struct ScreenOff {
    outputs: Arc<OutputPowerManager>,
    backlight: EventSender<BacklightCommand>,
}

impl ScreenOff {
    pub fn new(
        outputs: Arc<OutputPowerManager>,
        backlight: EventSender<BacklightCommand>,
    ) -> ScreenOff {
        ScreenOff { outputs, backlight }
    }

    /// Synchronous variant for timeout callbacks on the compositor
    /// dispatch thread.
    pub fn apply(&self) {
        self.outputs.all_off();
        self.backlight.send(BacklightCommand::Restore);
    }

    pub async fn run(&self) {
        self.outputs.off().await;
        self.backlight.send(BacklightCommand::Restore);
    }
}

pub struct Router<N: IdleNotify, P: TrustProbe> {
    pub machine: Arc<StateMachine<N>>,
    pub lock: Arc<LockSupervisor<P>>,
    pub suspender: Arc<dyn Suspender>,
    pub outputs: Arc<OutputPowerManager>,
    pub screen_off: ScreenOff,
    pub lid: LidProbe,
    pub config: SharedConfig,
    pub lock_results: mpsc::Receiver<LockStatus>,
    pub lid_events: mpsc::Receiver<LidEvent>,
    pub idle_events: mpsc::Receiver<IdleEvent>,
    pub user_requests: mpsc::Receiver<UserRequest>,
    pub user_requests_sender: EventSender<UserRequest>,
    pub fatal: mpsc::Receiver<anyhow::Error>,
}

impl<N: IdleNotify, P: TrustProbe> Router<N, P> {
    /// Consume events until a termination signal arrives. Persists the
    /// config on the way out; errors only on a lost compositor connection.
    pub async fn run(mut self) -> Result<()> {
        let mut sigint =
            signal(SignalKind::interrupt()).context("could not install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("could not install SIGTERM handler")?;
        loop {
            tokio::select! {
                Some(status) = self.lock_results.recv() => self.handle_lock_result(status).await,
                Some(event) = self.lid_events.recv() => self.handle_lid_event(event).await,
                Some(event) = self.idle_events.recv() => self.handle_idle_event(event).await,
                Some(request) = self.user_requests.recv() => self.handle_user_request(request).await,
                Some(error) = self.fatal.recv() => {
                    return Err(error.context("compositor connection failed"));
                }
                _ = sigint.recv() => break,
                _ = sigterm.recv() => break,
            }
        }
        log::info!("got shutdown signal");
        self.machine
            .transition(SessionState::None, Duration::ZERO, || async { true })
            .await;
        self.config.read().await.dump().await;
        Ok(())
    }

    async fn handle_lock_result(&self, status: LockStatus) {
        if status == LockStatus::LockExit {
            log::debug!("locker exited");
            self.machine
                .transition(SessionState::Active, Duration::ZERO, || async { true })
                .await;
        }
        self.outputs.on().await;
    }

    async fn handle_lid_event(&self, event: LidEvent) {
        // Bus lid events are hints; act only when the host probe agrees.
        if self.lid.closed() != (event == LidEvent::LidClose) {
            return;
        }
        match event {
            LidEvent::LidOpen => {
                log::debug!("lid opened");
                if self.machine.current() == SessionState::Active {
                    self.outputs.on().await;
                }
            }
            LidEvent::LidClose => {
                log::debug!("lid closed");
                if self.outputs.num_outputs() == 1 {
                    self.user_requests_sender.send(UserRequest::Suspend);
                } else {
                    self.screen_off.run().await;
                }
            }
        }
    }

    async fn handle_idle_event(&self, event: IdleEvent) {
        match event {
            IdleEvent::TryUnlock => {
                log::debug!("unlock attempt from idle resume");
                if !self.lock.try_stop().await {
                    self.outputs.on().await;
                }
            }
            IdleEvent::IdleRequest => {
                let screen_off = self.screen_off.clone();
                let lock = Arc::clone(&self.lock);
                self.machine
                    .transition(SessionState::Idle, Duration::ZERO, move || async move {
                        screen_off.run().await;
                        lock.start_as_idle().await
                    })
                    .await;
            }
            IdleEvent::TryIdleToSuspend => {
                let outputs = Arc::clone(&self.outputs);
                let suspender = Arc::clone(&self.suspender);
                let lock = Arc::clone(&self.lock);
                self.machine
                    .transition(SessionState::Idle, Duration::ZERO, move || async move {
                        // Laptop-only on battery: suspend, then attempt the
                        // unlock on resume. A completed cycle fails the gate
                        // and the machine waits in None; any other outcome
                        // re-arms Idle, so a later dock or AC change is
                        // seen on the next cycle.
                        !(outputs.num_outputs() == 1
                            && probes::on_battery()
                            && suspender.run().await
                            && lock.try_stop().await)
                    })
                    .await;
            }
        }
    }

    async fn handle_user_request(&self, request: UserRequest) {
        log::debug!("user request {:?}", request);
        match request {
            UserRequest::Lock => {
                let screen_off = self.screen_off.clone();
                let lock = Arc::clone(&self.lock);
                self.machine
                    .transition(SessionState::Idle, USER_LOCK_PREDELAY, move || async move {
                        screen_off.run().await;
                        lock.start_as_user().await
                    })
                    .await;
            }
            UserRequest::Suspend => {
                let screen_off = self.screen_off.clone();
                let lock = Arc::clone(&self.lock);
                let suspender = Arc::clone(&self.suspender);
                self.machine
                    .transition(SessionState::Idle, Duration::ZERO, move || async move {
                        screen_off.run().await;
                        !(lock.start_as_idle().await
                            && suspender.run().await
                            && lock.try_stop().await)
                    })
                    .await;
            }
            UserRequest::IdleInhibit => {
                if self.machine.current() == SessionState::Active {
                    self.machine
                        .transition(SessionState::None, Duration::ZERO, || async { true })
                        .await;
                }
            }
            UserRequest::IdleAllow => {
                if self.machine.current() == SessionState::None {
                    self.machine
                        .transition(SessionState::Active, Duration::ZERO, || async { true })
                        .await;
                }
            }
        }
    }
}
