//! Client of the compositor's wlr-output-power-management protocol.
//!
//! Tracks every discovered output and applies power modes to all of them.
//! A broken compositor connection is recovered by tearing the client down
//! and rediscovering, up to [`MAX_RECONNECT_ATTEMPTS`] times per call.

use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use thiserror::Error;
use wayland_client::{
    backend::WaylandError,
    delegate_noop,
    protocol::{wl_output, wl_registry},
    Connection, Dispatch, EventQueue, QueueHandle, WEnum,
};
use wayland_protocols_wlr::output_power_management::v1::client::{
    zwlr_output_power_manager_v1::ZwlrOutputPowerManagerV1,
    zwlr_output_power_v1::{self, ZwlrOutputPowerV1},
};

const MAX_RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_SPACING: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum PowerError {
    #[error("could not connect to the compositor: {0}")]
    Connect(#[from] wayland_client::ConnectError),

    #[error("compositor error during discovery: {0}")]
    Discovery(#[from] wayland_client::DispatchError),

    #[error("compositor does not advertise zwlr_output_power_manager_v1")]
    ManagerMissing,

    #[error("compositor connection broken")]
    Disconnected,

    #[error("no output named {0}")]
    UnknownOutput(String),

    #[error("compositor transport error: {0}")]
    Transport(String),
}

struct OutputRecord {
    _output: wl_output::WlOutput,
    power: ZwlrOutputPowerV1,
    name: Option<String>,
    powered_on: bool,
}

type Records = Arc<Mutex<HashMap<u32, OutputRecord>>>;

/// Tracks outputs and serializes power-mode mutations. Mode mutations are
/// blocking (they may ride out a reconnect cycle); async callers go through
/// the [`Self::on`]/[`Self::off`]/[`Self::toggle`] wrappers.
pub struct OutputPowerManager {
    records: Records,
    // Held across mode mutations and the reconnect cycle.
    link: Mutex<Connection>,
    generation: Arc<AtomicU64>,
}

struct OpmDispatch {
    records: Records,
    manager: Option<ZwlrOutputPowerManagerV1>,
    // Outputs announced before the manager global.
    pending: Vec<(u32, wl_output::WlOutput)>,
    generation: u64,
}

impl OutputPowerManager {
    pub fn new() -> Result<Arc<OutputPowerManager>, PowerError> {
        let records: Records = Arc::new(Mutex::new(HashMap::new()));
        let generation = Arc::new(AtomicU64::new(1));
        let (connection, queue, dispatch) = establish(&records, 1)?;
        spawn_dispatch(queue, dispatch, Arc::clone(&generation));
        let manager = OutputPowerManager {
            records,
            link: Mutex::new(connection),
            generation,
        };
        log::debug!("output power manager bound, {} outputs", manager.num_outputs());
        Ok(Arc::new(manager))
    }

    /// Number of outputs currently known. One means the laptop panel only.
    pub fn num_outputs(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn all_on(&self) {
        self.set_all(zwlr_output_power_v1::Mode::On)
    }

    pub fn all_off(&self) {
        self.set_all(zwlr_output_power_v1::Mode::Off)
    }

    pub async fn on(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        if let Err(e) = tokio::task::spawn_blocking(move || manager.all_on()).await {
            log::error!("output power task failed: {}", e);
        }
    }

    pub async fn off(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        if let Err(e) = tokio::task::spawn_blocking(move || manager.all_off()).await {
            log::error!("output power task failed: {}", e);
        }
    }

    pub async fn toggle(self: &Arc<Self>, name: &str) -> Result<(), PowerError> {
        let manager = Arc::clone(self);
        let name = name.to_string();
        match tokio::task::spawn_blocking(move || manager.toggle_blocking(&name)).await {
            Ok(result) => result,
            Err(e) => {
                log::error!("output power task failed: {}", e);
                Err(PowerError::Transport(e.to_string()))
            }
        }
    }

    /// Invert the last known mode of the named output.
    pub fn toggle_blocking(&self, name: &str) -> Result<(), PowerError> {
        let link = self.link.lock().unwrap();
        {
            let mut records = self.records.lock().unwrap();
            let record = records
                .values_mut()
                .find(|record| record.name.as_deref() == Some(name))
                .ok_or_else(|| PowerError::UnknownOutput(name.to_string()))?;
            let mode = if record.powered_on {
                zwlr_output_power_v1::Mode::Off
            } else {
                zwlr_output_power_v1::Mode::On
            };
            log::debug!("toggling output {} to {:?}", name, mode);
            record.power.set_mode(mode);
        }
        flush(&link)
    }

    fn set_all(&self, mode: zwlr_output_power_v1::Mode) {
        let mut link = self.link.lock().unwrap();
        let mut reconnects = 0;
        loop {
            match apply_mode(&self.records, &link, mode) {
                Ok(()) => return,
                Err(PowerError::Disconnected) => {
                    if reconnects == MAX_RECONNECT_ATTEMPTS {
                        log::error!(
                            "giving up on output power mode after {} reconnect attempts",
                            reconnects
                        );
                        return;
                    }
                    reconnects += 1;
                    log::warn!(
                        "compositor connection broken, reconnecting (attempt {})",
                        reconnects
                    );
                    match self.reconnect() {
                        Ok(connection) => *link = connection,
                        Err(e) => {
                            log::error!("reconnect failed: {}", e);
                            thread::sleep(RECONNECT_SPACING);
                        }
                    }
                }
                Err(e) => {
                    log::error!("could not set output power mode: {}", e);
                    return;
                }
            }
        }
    }

    fn reconnect(&self) -> Result<Connection, PowerError> {
        // Every record references the dead connection; retire them all and
        // rediscover from scratch.
        self.records.lock().unwrap().clear();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (connection, queue, dispatch) = establish(&self.records, generation)?;
        spawn_dispatch(queue, dispatch, Arc::clone(&self.generation));
        log::info!(
            "reconnected to the compositor, {} outputs rediscovered",
            self.num_outputs()
        );
        Ok(connection)
    }
}

fn establish(
    records: &Records,
    generation: u64,
) -> Result<(Connection, EventQueue<OpmDispatch>, OpmDispatch), PowerError> {
    let connection = Connection::connect_to_env()?;
    let mut queue = connection.new_event_queue();
    let queue_handle = queue.handle();
    let _registry = connection.display().get_registry(&queue_handle, ());
    let mut dispatch = OpmDispatch {
        records: Arc::clone(records),
        manager: None,
        pending: Vec::new(),
        generation,
    };
    // First roundtrip announces the globals, second delivers output names
    // and initial modes.
    queue.roundtrip(&mut dispatch)?;
    queue.roundtrip(&mut dispatch)?;
    if dispatch.manager.is_none() {
        return Err(PowerError::ManagerMissing);
    }
    Ok((connection, queue, dispatch))
}

fn spawn_dispatch(
    mut queue: EventQueue<OpmDispatch>,
    mut dispatch: OpmDispatch,
    current_generation: Arc<AtomicU64>,
) {
    thread::spawn(move || loop {
        if let Err(e) = queue.blocking_dispatch(&mut dispatch) {
            // Quiet exit when a reconnect already superseded this client.
            if current_generation.load(Ordering::SeqCst) == dispatch.generation {
                log::warn!("output power connection lost: {}", e);
            }
            return;
        }
    });
}

fn apply_mode(
    records: &Records,
    connection: &Connection,
    mode: zwlr_output_power_v1::Mode,
) -> Result<(), PowerError> {
    let powers: Vec<ZwlrOutputPowerV1> = records
        .lock()
        .unwrap()
        .values()
        .map(|record| record.power.clone())
        .collect();
    for power in powers {
        power.set_mode(mode);
    }
    flush(connection)
}

fn flush(connection: &Connection) -> Result<(), PowerError> {
    match connection.flush() {
        Ok(()) => Ok(()),
        Err(ref e) if is_disconnect(e) => Err(PowerError::Disconnected),
        Err(e) => Err(PowerError::Transport(e.to_string())),
    }
}

fn is_disconnect(error: &WaylandError) -> bool {
    match error {
        WaylandError::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
        ),
        WaylandError::Protocol(_) => false,
    }
}

impl Dispatch<wl_registry::WlRegistry, ()> for OpmDispatch {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<OpmDispatch>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => match interface.as_str() {
                "wl_output" => {
                    // Version 4 carries the name event used by toggle.
                    let output =
                        registry.bind::<wl_output::WlOutput, _, _>(name, version.min(4), qh, name);
                    if let Some(manager) = &state.manager {
                        let power = manager.get_output_power(&output, qh, name);
                        state.records.lock().unwrap().insert(
                            name,
                            OutputRecord {
                                _output: output,
                                power,
                                name: None,
                                powered_on: true,
                            },
                        );
                    } else {
                        state.pending.push((name, output));
                    }
                }
                "zwlr_output_power_manager_v1" => {
                    let manager =
                        registry.bind::<ZwlrOutputPowerManagerV1, _, _>(name, 1, qh, ());
                    let mut records = state.records.lock().unwrap();
                    for (output_name, output) in state.pending.drain(..) {
                        let power = manager.get_output_power(&output, qh, output_name);
                        records.insert(
                            output_name,
                            OutputRecord {
                                _output: output,
                                power,
                                name: None,
                                powered_on: true,
                            },
                        );
                    }
                    state.manager = Some(manager);
                }
                _ => {}
            },
            wl_registry::Event::GlobalRemove { name } => {
                if let Some(record) = state.records.lock().unwrap().remove(&name) {
                    log::debug!("output {:?} removed", record.name);
                    record.power.destroy();
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_output::WlOutput, u32> for OpmDispatch {
    fn event(
        state: &mut Self,
        _: &wl_output::WlOutput,
        event: wl_output::Event,
        registry_name: &u32,
        _: &Connection,
        _: &QueueHandle<OpmDispatch>,
    ) {
        if let wl_output::Event::Name { name } = event {
            if let Some(record) = state.records.lock().unwrap().get_mut(registry_name) {
                record.name = Some(name);
            }
        }
    }
}

impl Dispatch<ZwlrOutputPowerV1, u32> for OpmDispatch {
    fn event(
        state: &mut Self,
        _: &ZwlrOutputPowerV1,
        event: zwlr_output_power_v1::Event,
        registry_name: &u32,
        _: &Connection,
        _: &QueueHandle<OpmDispatch>,
    ) {
        match event {
            zwlr_output_power_v1::Event::Mode { mode } => {
                if let WEnum::Value(mode) = mode {
                    if let Some(record) =
                        state.records.lock().unwrap().get_mut(registry_name)
                    {
                        record.powered_on = mode == zwlr_output_power_v1::Mode::On;
                    }
                }
            }
            zwlr_output_power_v1::Event::Failed => {
                if let Some(record) = state.records.lock().unwrap().remove(registry_name) {
                    log::warn!("power control failed for output {:?}, retiring", record.name);
                    record.power.destroy();
                }
            }
            _ => {}
        }
    }
}

delegate_noop!(OpmDispatch: ZwlrOutputPowerManagerV1);

#[cfg(test)]
mod test {
    use super::is_disconnect;
    use std::io;
    use wayland_client::backend::WaylandError;

    #[test]
    fn broken_pipe_is_classified_as_disconnect() {
        let broken = WaylandError::Io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(is_disconnect(&broken));
        let reset = WaylandError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(is_disconnect(&reset));
        let other = WaylandError::Io(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(!is_disconnect(&other));
    }
}
