//! Client of the compositor's ext-idle-notify-v1 protocol.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use thiserror::Error;
use wayland_client::{
    delegate_noop,
    protocol::{wl_registry, wl_seat},
    Connection, Dispatch, EventQueue, QueueHandle,
};
use wayland_protocols::ext::idle_notify::v1::client::{
    ext_idle_notification_v1::{self, ExtIdleNotificationV1},
    ext_idle_notifier_v1::ExtIdleNotifierV1,
};

use super::{IdleCallback, IdleHandle, IdleNotify};
use crate::actors::EventSender;

#[derive(Debug, Error)]
pub enum IdleSourceError {
    #[error("could not connect to the compositor: {0}")]
    Connect(#[from] wayland_client::ConnectError),

    #[error("compositor error during setup: {0}")]
    Setup(#[from] wayland_client::DispatchError),

    #[error("compositor does not advertise ext_idle_notifier_v1")]
    NotifierMissing,

    #[error("no usable seat found")]
    NoSeat,
}

struct LiveNotification {
    notification: ExtIdleNotificationV1,
    on_idle: IdleCallback,
    on_resume: IdleCallback,
}

type LiveMap = Arc<Mutex<HashMap<u64, LiveNotification>>>;

struct SeatEntry {
    seat: wl_seat::WlSeat,
    name: Option<String>,
}

/// Registers idle timeouts with the compositor and routes their events to
/// the installed callbacks. Requests may be issued from any thread; events
/// are delivered on the [`IdleEventLoop`] dispatch thread.
pub struct WaylandIdleSource {
    connection: Connection,
    queue_handle: QueueHandle<IdleDispatch>,
    notifier: ExtIdleNotifierV1,
    seat: wl_seat::WlSeat,
    live: LiveMap,
    next_token: AtomicU64,
}

/// The dispatch side of a [`WaylandIdleSource`], to be run on its own
/// thread.
pub struct IdleEventLoop {
    queue: EventQueue<IdleDispatch>,
    dispatch: IdleDispatch,
}

struct IdleDispatch {
    live: LiveMap,
    seats: Vec<SeatEntry>,
    notifier: Option<ExtIdleNotifierV1>,
}

impl WaylandIdleSource {
    /// Connect and discover the idle notifier and a default seat, preferring
    /// the seat named `preferred_seat`, else the first named seat.
    pub fn connect(
        preferred_seat: &str,
    ) -> Result<(Arc<WaylandIdleSource>, IdleEventLoop), IdleSourceError> {
        let connection = Connection::connect_to_env()?;
        let mut queue = connection.new_event_queue();
        let queue_handle = queue.handle();
        let _registry = connection.display().get_registry(&queue_handle, ());

        let live: LiveMap = Arc::new(Mutex::new(HashMap::new()));
        let mut dispatch = IdleDispatch {
            live: Arc::clone(&live),
            seats: Vec::new(),
            notifier: None,
        };
        // First roundtrip announces the globals, second delivers seat names.
        queue.roundtrip(&mut dispatch)?;
        queue.roundtrip(&mut dispatch)?;

        let notifier = dispatch
            .notifier
            .clone()
            .ok_or(IdleSourceError::NotifierMissing)?;
        let seat = Self::select_seat(&dispatch.seats, preferred_seat)?;
        log::debug!("idle notifier bound");

        let source = Arc::new(WaylandIdleSource {
            connection,
            queue_handle,
            notifier,
            seat,
            live,
            next_token: AtomicU64::new(0),
        });
        Ok((source, IdleEventLoop { queue, dispatch }))
    }

    fn select_seat(
        seats: &[SeatEntry],
        preferred: &str,
    ) -> Result<wl_seat::WlSeat, IdleSourceError> {
        if let Some(entry) = seats.iter().find(|entry| entry.name.as_deref() == Some(preferred)) {
            return Ok(entry.seat.clone());
        }
        seats
            .iter()
            .find(|entry| entry.name.is_some())
            .map(|entry| entry.seat.clone())
            .ok_or(IdleSourceError::NoSeat)
    }
}

impl IdleNotify for WaylandIdleSource {
    fn install(
        &self,
        timeout: Duration,
        on_idle: IdleCallback,
        on_resume: IdleCallback,
    ) -> Option<IdleHandle> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        let notification = self.notifier.get_idle_notification(
            timeout.as_millis() as u32,
            &self.seat,
            &self.queue_handle,
            token,
        );
        self.live.lock().unwrap().insert(
            token,
            LiveNotification {
                notification,
                on_idle,
                on_resume,
            },
        );
        if let Err(e) = self.connection.flush() {
            log::error!("could not flush idle timeout registration: {}", e);
        }
        Some(IdleHandle(token))
    }

    fn release(&self, handle: IdleHandle) {
        let removed = self.live.lock().unwrap().remove(&handle.0);
        match removed {
            None => log::warn!("released an unknown idle notification"),
            Some(live) => {
                live.notification.destroy();
                if let Err(e) = self.connection.flush() {
                    log::error!("could not flush idle timeout release: {}", e);
                }
            }
        }
    }
}

impl IdleEventLoop {
    /// Pump compositor events until the connection breaks. Connection loss
    /// is fatal for the whole session and is forwarded to the router.
    pub fn run(mut self, fatal: EventSender<anyhow::Error>) {
        loop {
            if let Err(e) = self.queue.blocking_dispatch(&mut self.dispatch) {
                log::error!("idle source lost the compositor connection: {}", e);
                fatal.send(anyhow::Error::new(e));
                return;
            }
        }
    }
}

impl Dispatch<wl_registry::WlRegistry, ()> for IdleDispatch {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<IdleDispatch>,
    ) {
        if let wl_registry::Event::Global {
            name,
            interface,
            version,
        } = event
        {
            match interface.as_str() {
                "ext_idle_notifier_v1" => {
                    state.notifier =
                        Some(registry.bind::<ExtIdleNotifierV1, _, _>(name, 1, qh, ()));
                }
                "wl_seat" => {
                    let index = state.seats.len();
                    let seat = registry.bind::<wl_seat::WlSeat, _, _>(
                        name,
                        version.min(7),
                        qh,
                        index,
                    );
                    state.seats.push(SeatEntry { seat, name: None });
                }
                _ => {}
            }
        }
    }
}

impl Dispatch<wl_seat::WlSeat, usize> for IdleDispatch {
    fn event(
        state: &mut Self,
        _: &wl_seat::WlSeat,
        event: wl_seat::Event,
        index: &usize,
        _: &Connection,
        _: &QueueHandle<IdleDispatch>,
    ) {
        if let wl_seat::Event::Name { name } = event {
            state.seats[*index].name = Some(name);
        }
    }
}

impl Dispatch<ExtIdleNotificationV1, u64> for IdleDispatch {
    fn event(
        state: &mut Self,
        _: &ExtIdleNotificationV1,
        event: ext_idle_notification_v1::Event,
        token: &u64,
        _: &Connection,
        _: &QueueHandle<IdleDispatch>,
    ) {
        // The callback may release other handles; it must run with the live
        // map unlocked.
        let callback = {
            let live = state.live.lock().unwrap();
            let entry = match live.get(token) {
                Some(entry) => entry,
                None => return,
            };
            match event {
                ext_idle_notification_v1::Event::Idled => Arc::clone(&entry.on_idle),
                ext_idle_notification_v1::Event::Resumed => Arc::clone(&entry.on_resume),
                _ => return,
            }
        };
        callback();
    }
}

delegate_noop!(IdleDispatch: ExtIdleNotifierV1);
