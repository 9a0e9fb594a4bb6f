//! Bounded-time check for a trusted hardware address in the system
//! neighbor table, used as the proof-of-presence gate for unlocking.

use anyhow::{anyhow, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;

const NEIGHBOR_TABLE: &str = "/proc/net/arp";
const NET_CLASS: &str = "/sys/class/net";

/// Entries the kernel has not resolved yet carry this address.
const UNRESOLVED_ADDRESS: &str = "00:00:00:00:00:00";

/// Bytes taken by the neighbor table's header line.
const NEIGHBOR_HEADER_BYTES: usize = 79;

const PROBE_DEADLINE: Duration = Duration::from_secs(10);
const PROBE_EXTENSION: Duration = Duration::from_secs(5);
const TABLE_POLL_INTERVAL: Duration = Duration::from_millis(200);
const RESOLVE_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub type ProbeCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// The seam between the lock supervisor and the network probe, mockable in
/// tests. The callback fires exactly once per running probe; a request that
/// joins a probe already in flight only extends its deadline and its own
/// callback is dropped.
pub trait TrustProbe: Send + Sync + 'static {
    fn probe(&self, addresses: Vec<String>, on_done: ProbeCallback);
}

struct ProbeClock {
    running: bool,
    expiry: Instant,
}

struct ProberInner {
    neighbor_table: PathBuf,
    net_class: PathBuf,
    clock: Mutex<ProbeClock>,
}

/// Polls the neighbor table for one of the trusted addresses within a
/// deadline. At most one poller runs at a time.
#[derive(Clone)]
pub struct ArpProber {
    inner: Arc<ProberInner>,
}

impl ArpProber {
    pub fn new() -> ArpProber {
        Self::with_paths(Path::new(NEIGHBOR_TABLE), Path::new(NET_CLASS))
    }

    pub fn with_paths(neighbor_table: &Path, net_class: &Path) -> ArpProber {
        ArpProber {
            inner: Arc::new(ProberInner {
                neighbor_table: neighbor_table.to_path_buf(),
                net_class: net_class.to_path_buf(),
                clock: Mutex::new(ProbeClock {
                    running: false,
                    expiry: Instant::now(),
                }),
            }),
        }
    }
}

impl TrustProbe for ArpProber {
    fn probe(&self, addresses: Vec<String>, on_done: ProbeCallback) {
        {
            let mut clock = self.inner.clock.lock().unwrap();
            if clock.running {
                clock.expiry += PROBE_EXTENSION;
                log::debug!("probe already running, extended its deadline by 5s");
                return;
            }
            clock.running = true;
            clock.expiry = Instant::now() + PROBE_DEADLINE;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let found = inner.scan(&addresses).await;
            inner.clock.lock().unwrap().running = false;
            on_done(found);
        });
    }
}

impl ProberInner {
    fn expired(&self) -> bool {
        Instant::now() > self.clock.lock().unwrap().expiry
    }

    fn any_wireless_up(&self) -> bool {
        let entries = match fs::read_dir(&self.net_class) {
            Ok(entries) => entries,
            Err(e) => {
                log::error!("could not enumerate network interfaces: {}", e);
                return false;
            }
        };
        entries.flatten().any(|entry| {
            entry.file_name().to_string_lossy().starts_with("wl")
                && entry.path().join("dormant").exists()
        })
    }

    fn table_bytes(&self) -> Vec<u8> {
        match fs::read(&self.neighbor_table) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("could not read neighbor table: {}", e);
                Vec::new()
            }
        }
    }

    async fn scan(&self, addresses: &[String]) -> bool {
        if !self.any_wireless_up() {
            log::debug!("all wireless interfaces are down, cannot look for addresses");
            return false;
        }

        // Wait for the table to grow past its header.
        loop {
            if self.expired() {
                log::debug!("neighbor table still empty at deadline");
                return false;
            }
            if self.table_bytes().len() > NEIGHBOR_HEADER_BYTES {
                break;
            }
            tokio::time::sleep(TABLE_POLL_INTERVAL).await;
        }

        // Wait until every entry has a resolved address.
        let body = loop {
            if self.expired() {
                log::debug!("neighbor table not resolved at deadline");
                return false;
            }
            let bytes = self.table_bytes();
            let offset = NEIGHBOR_HEADER_BYTES.min(bytes.len());
            let body = String::from_utf8_lossy(&bytes[offset..]).into_owned();
            if !body.contains(UNRESOLVED_ADDRESS) {
                break body;
            }
            tokio::time::sleep(RESOLVE_POLL_INTERVAL).await;
        };

        for address in addresses {
            log::debug!("checking for address {}", address);
            if body.contains(address) {
                return true;
            }
        }
        log::debug!("no trusted address present in the neighbor table");
        false
    }
}

/// Hardware address of the first resolved neighbor, normally the gateway.
/// Used to amend the trusted list from the bus.
pub fn gateway_mac() -> Result<String> {
    gateway_mac_from(Path::new(NEIGHBOR_TABLE))
}

pub fn gateway_mac_from(neighbor_table: &Path) -> Result<String> {
    let contents = fs::read_to_string(neighbor_table)?;
    for line in contents.lines() {
        if line.contains("IP address") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 4 {
            return Ok(fields[3].to_string());
        }
    }
    Err(anyhow!("no hardware address in the neighbor table"))
}
