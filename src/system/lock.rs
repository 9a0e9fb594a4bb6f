//! Supervision of the screen locker child: spawning, reaping, and the two
//! unlock paths (grace window and trust proof).

use std::{
    process::Stdio,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use nix::{
    sys::signal::{kill, Signal},
    sys::time::TimeSpec,
    time::{clock_gettime, ClockId},
    unistd::Pid,
};
use tokio::{
    process::Command,
    sync::{mpsc, Mutex},
};

use crate::{
    actors::EventSender,
    config::SharedConfig,
    system::{music::MusicSilencer, netwatch::TrustProbe},
};

/// Outcomes published on the lock-result channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    LockExit,
    UnlockFailed,
}

/// Signal the locker interprets as an unlock request.
const UNLOCK_SIGNAL: Signal = Signal::SIGUSR1;

/// Read the boot clock. The grace window must keep counting across suspend,
/// which rules out the monotonic clock.
fn boot_clock() -> TimeSpec {
    match clock_gettime(ClockId::CLOCK_BOOTTIME) {
        Ok(now) => now,
        Err(e) => {
            log::error!("cannot read CLOCK_BOOTTIME: {}", e);
            std::process::exit(128);
        }
    }
}

fn elapsed_between(later: TimeSpec, earlier: TimeSpec) -> Duration {
    let nanos = (later.tv_sec() - earlier.tv_sec()) * 1_000_000_000
        + (later.tv_nsec() - earlier.tv_nsec());
    if nanos <= 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(nanos as u64)
    }
}

/// Spawns and supervises the locker child. At most one instance exists at a
/// time; `instance` holds its PID, 0 meaning no lock is running.
pub struct LockSupervisor<P: TrustProbe> {
    config: SharedConfig,
    results: EventSender<LockStatus>,
    prober: P,
    music: MusicSilencer,
    start_stop_guard: Mutex<()>,
    instance: AtomicI64,
    grace_begin: StdMutex<TimeSpec>,
    // Single-slot request to the stop listener of the running instance:
    // true asks for the unlock signal, false just lets it retire.
    stop_request: StdMutex<Option<mpsc::Sender<bool>>>,
}

impl<P: TrustProbe> LockSupervisor<P> {
    pub fn new(
        config: SharedConfig,
        results: EventSender<LockStatus>,
        prober: P,
        music: MusicSilencer,
    ) -> Arc<LockSupervisor<P>> {
        Arc::new(LockSupervisor {
            config,
            results,
            prober,
            music,
            start_stop_guard: Mutex::new(()),
            instance: AtomicI64::new(0),
            grace_begin: StdMutex::new(TimeSpec::new(0, 0)),
            stop_request: StdMutex::new(None),
        })
    }

    pub async fn start_as_user(self: &Arc<Self>) -> bool {
        self.start(true).await
    }

    pub async fn start_as_idle(self: &Arc<Self>) -> bool {
        self.start(false).await
    }

    async fn start(self: &Arc<Self>, user_initiated: bool) -> bool {
        if self.instance.load(Ordering::SeqCst) != 0 {
            return true;
        }
        let _guard = self.start_stop_guard.lock().await;

        let (grace, argv) = {
            let config = self.config.read().await;
            (config.idle_grace_duration, config.lock_command.clone())
        };
        {
            let mut grace_begin = self.grace_begin.lock().unwrap();
            *grace_begin = if user_initiated {
                // Born past the grace window; the extra second absorbs the
                // truncation to whole seconds.
                let now = boot_clock();
                TimeSpec::new(now.tv_sec() - grace.as_secs() as i64 - 1, 0)
            } else {
                boot_clock()
            };
        }

        self.music.pause_all().await;

        let mut child = match Command::new(&argv[0])
            .args(&argv[1..])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                log::error!("could not start locker {:?}: {}", argv, e);
                return false;
            }
        };
        let pid = match child.id() {
            Some(pid) => pid as i64,
            None => {
                log::error!("locker exited before it could be supervised");
                return false;
            }
        };
        self.instance.store(pid, Ordering::SeqCst);

        let (stop_sender, mut stop_receiver) = mpsc::channel::<bool>(1);
        *self.stop_request.lock().unwrap() = Some(stop_sender.clone());

        // Reaper: waits on the child, retires the instance and publishes
        // the exit.
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = child.wait().await {
                log::error!("waiting on locker failed: {}", e);
            }
            let _ = stop_sender.try_send(false);
            supervisor.instance.store(0, Ordering::SeqCst);
            supervisor.results.send(LockStatus::LockExit);
        });

        // Stop listener: a single value decides whether this instance gets
        // the unlock signal.
        tokio::spawn(async move {
            if let Some(true) = stop_receiver.recv().await {
                log::debug!("sending unlock signal to locker");
                if let Err(e) = kill(Pid::from_raw(pid as i32), UNLOCK_SIGNAL) {
                    log::error!("could not signal locker: {}", e);
                }
            }
        });
        true
    }

    /// Attempt to stop the running lock.
    ///
    /// Inside the grace window the unlock signal is sent unconditionally
    /// and true is returned. Outside it the trust prober decides
    /// asynchronously; false is returned and the outcome arrives on the
    /// lock-result channel.
    pub async fn try_stop(self: &Arc<Self>) -> bool {
        let instance = self.instance.load(Ordering::SeqCst);
        if instance == 0 {
            return true;
        }

        log::debug!("unlock requested for running locker");
        let _guard = self.start_stop_guard.lock().await;
        let (grace, trusted) = {
            let config = self.config.read().await;
            (
                config.idle_grace_duration,
                config.trusted_wifi_networks.clone(),
            )
        };

        let grace_begin = *self.grace_begin.lock().unwrap();
        if elapsed_between(boot_clock(), grace_begin) < grace {
            log::debug!("inside grace window, unlocking without trust proof");
            self.send_stop_request(true);
            return true;
        }

        let supervisor = Arc::clone(self);
        self.prober.probe(
            trusted,
            Box::new(move |trusted_network_found| {
                // The lock this attempt was aimed at may already be gone.
                if supervisor.instance.load(Ordering::SeqCst) != instance {
                    return;
                }
                if trusted_network_found {
                    supervisor.send_stop_request(true);
                } else {
                    log::debug!("not connected to a trusted network");
                    supervisor.results.send(LockStatus::UnlockFailed);
                }
            }),
        );
        false
    }

    fn send_stop_request(&self, unlock: bool) {
        if let Some(sender) = self.stop_request.lock().unwrap().as_ref() {
            // 1-deep and non-blocking; a duplicate signal is dropped.
            let _ = sender.try_send(unlock);
        }
    }
}
