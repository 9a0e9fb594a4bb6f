//! goidle: a session-level idle manager for Wayland. Watches input
//! idleness, lid, power and network trust, and coordinates screen dimming,
//! display power, a screen locker child and system suspend.

mod actors;
mod config;
mod control;
mod external;
mod system;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::sync::RwLock;

use crate::{
    actors::EventSender,
    config::{Config, SharedConfig},
    control::{
        dbus_controller::DBusController,
        router::{IdleEvent, Router, ScreenOff},
        state::{SessionState, StateMachine},
    },
    external::{
        dbus::ConnectionFactory,
        probes::LidProbe,
        wayland::{idle::WaylandIdleSource, output_power::OutputPowerManager, IdleNotify},
    },
    system::{
        backlight::{self, BacklightCommand},
        lock::LockSupervisor,
        music::MusicSilencer,
        netwatch::ArpProber,
        suspend,
    },
};

const DEFAULT_SEAT: &str = "seat0";

/// First input after entering Idle counts as an unlock attempt; this
/// timeout only has to outlast the transition itself.
const FIRST_INPUT_UNLOCK_TIMEOUT: Duration = Duration::from_millis(30);

fn init_logging() {
    let initial = std::env::var("RUST_LOG")
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(log::LevelFilter::Info);
    // The permissive filter lets the bus methods retune verbosity at
    // runtime through log::set_max_level.
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Trace)
        .format_timestamp_millis()
        .init();
    log::set_max_level(initial);
}

/// Install the idle schedule: what each state arms and what its timeouts do.
fn register_schedule<N: IdleNotify>(
    machine: &Arc<StateMachine<N>>,
    config: &Config,
    idle_events: &EventSender<IdleEvent>,
    backlight: &EventSender<BacklightCommand>,
    screen_off: &ScreenOff,
) {
    machine.register(SessionState::Active, config.timeout_active_dim, {
        let backlight = backlight.clone();
        move || backlight.send(BacklightCommand::Dim)
    }, {
        let backlight = backlight.clone();
        move || backlight.send(BacklightCommand::Restore)
    });

    machine.register(SessionState::Active, config.timeout_active_to_idle, {
        let idle_events = idle_events.clone();
        move || idle_events.send(IdleEvent::IdleRequest)
    }, || {});

    machine.register_once(
        SessionState::Idle,
        FIRST_INPUT_UNLOCK_TIMEOUT,
        || {},
        {
            let idle_events = idle_events.clone();
            move || idle_events.send(IdleEvent::TryUnlock)
        },
    );

    machine.register(SessionState::Idle, config.timeout_idle_backlight_off, {
        let screen_off = screen_off.clone();
        move || screen_off.apply()
    }, {
        let idle_events = idle_events.clone();
        move || idle_events.send(IdleEvent::TryUnlock)
    });

    machine.register(SessionState::Idle, config.timeout_idle_to_suspend, {
        let idle_events = idle_events.clone();
        move || idle_events.send(IdleEvent::TryIdleToSuspend)
    }, || {});
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let outputs = OutputPowerManager::new().context("could not reach the compositor")?;

    let config: SharedConfig = Arc::new(RwLock::new(Config::load(config::config_path())?));

    let mut buses = ConnectionFactory::new();
    let session_bus = match buses.session().await {
        Ok(connection) => Some(connection),
        Err(e) => {
            log::warn!("session bus unavailable: {}", e);
            None
        }
    };
    let system_bus = match buses.system().await {
        Ok(connection) => Some(connection),
        Err(e) => {
            log::warn!("system bus unavailable: {}", e);
            None
        }
    };

    let (idle_source, idle_loop) =
        WaylandIdleSource::connect(DEFAULT_SEAT).context("could not create idle source")?;
    let machine = StateMachine::new(Arc::clone(&idle_source));
    log::info!("starting state manager");

    let (lock_results_sender, lock_results) = EventSender::bounded(8);
    let (idle_events_sender, idle_events) = EventSender::bounded(8);
    let (lid_events_sender, lid_events) = EventSender::bounded(8);
    let (user_requests_sender, user_requests) = EventSender::bounded(8);
    let (fatal_sender, fatal) = EventSender::bounded(1);

    let lid = LidProbe::new();
    let lock = LockSupervisor::new(
        Arc::clone(&config),
        lock_results_sender,
        ArpProber::new(),
        MusicSilencer::new(session_bus.clone()),
    );
    let suspender = {
        let config = config.read().await;
        suspend::create_suspender(system_bus.clone(), config.suspend_command.clone(), lid.clone())
    };
    let backlight = {
        let config = config.read().await;
        backlight::spawn(&config).context("could not set up backlight control")?
    };
    let screen_off = ScreenOff::new(Arc::clone(&outputs), backlight.clone());

    {
        let config = config.read().await;
        register_schedule(
            &machine,
            &config,
            &idle_events_sender,
            &backlight,
            &screen_off,
        );
    }

    let controller = DBusController {
        config: Arc::clone(&config),
        outputs: Arc::clone(&outputs),
        user_requests: user_requests_sender.clone(),
        lid_events: lid_events_sender.clone(),
        backlight: backlight.clone(),
    };
    let _bus_handle = match controller.spawn().await {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("could not acquire the bus name: {}", e);
            std::process::exit(1);
        }
    };

    machine
        .transition(SessionState::Active, Duration::ZERO, || async { true })
        .await;

    std::thread::spawn(move || idle_loop.run(fatal_sender));

    let router = Router {
        machine,
        lock,
        suspender,
        outputs,
        screen_off,
        lid,
        config,
        lock_results,
        lid_events,
        idle_events,
        user_requests,
        user_requests_sender,
        fatal,
    };
    router.run().await
}
