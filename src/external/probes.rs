//! Read-only snapshots of OS-exposed state: laptop lid and AC power.

use std::{
    fs,
    path::{Path, PathBuf},
};

const LID_ROOT: &str = "/proc/acpi/button/lid";
const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

/// Snapshot reader for the ACPI lid switch. The `LID*` directories are
/// discovered once at construction; hosts without a lid always report open.
#[derive(Debug, Clone)]
pub struct LidProbe {
    lid_dirs: Vec<PathBuf>,
}

impl LidProbe {
    pub fn new() -> LidProbe {
        Self::with_root(Path::new(LID_ROOT))
    }

    pub fn with_root(root: &Path) -> LidProbe {
        let mut lid_dirs = Vec::new();
        match fs::read_dir(root) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    if entry.file_name().to_string_lossy().starts_with("LID") {
                        lid_dirs.push(entry.path());
                    }
                }
            }
            Err(e) => log::error!("could not enumerate lid devices: {}", e),
        }
        if lid_dirs.is_empty() {
            log::warn!("no lid devices found, lid will always read as open");
        }
        LidProbe { lid_dirs }
    }

    pub fn closed(&self) -> bool {
        for dir in &self.lid_dirs {
            match fs::read_to_string(dir.join("state")) {
                Ok(state) => {
                    if state.contains("closed") {
                        return true;
                    }
                }
                Err(e) => {
                    log::error!("could not read lid state in {}: {}", dir.display(), e)
                }
            }
        }
        false
    }
}

/// Whether the host currently runs on battery, judged by the first `AC*`
/// power supply's `online` flag. Missing or unreadable supplies count as
/// external power.
pub fn on_battery() -> bool {
    on_battery_at(Path::new(POWER_SUPPLY_ROOT))
}

pub fn on_battery_at(root: &Path) -> bool {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with("AC") {
            return match fs::read_to_string(entry.path().join("online")) {
                Ok(online) => online.trim() == "0",
                Err(_) => false,
            };
        }
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    #[test]
    fn lid_state_reflects_the_acpi_file() {
        let root = tempfile::tempdir().unwrap();
        let lid = root.path().join("LID0");
        fs::create_dir(&lid).unwrap();
        fs::write(lid.join("state"), "state:      open\n").unwrap();
        let probe = LidProbe::with_root(root.path());
        assert!(!probe.closed());
        fs::write(lid.join("state"), "state:      closed\n").unwrap();
        assert!(probe.closed());
    }

    #[test]
    fn missing_lid_reads_as_open() {
        let root = tempfile::tempdir().unwrap();
        let probe = LidProbe::with_root(root.path());
        assert!(!probe.closed());
    }

    #[test]
    fn battery_state_follows_the_ac_online_flag() {
        let root = tempfile::tempdir().unwrap();
        let ac = root.path().join("AC0");
        fs::create_dir(&ac).unwrap();
        fs::write(ac.join("online"), "1\n").unwrap();
        assert!(!on_battery_at(root.path()));
        fs::write(ac.join("online"), "0\n").unwrap();
        assert!(on_battery_at(root.path()));
    }

    #[test]
    fn no_ac_supply_counts_as_external_power() {
        let root = tempfile::tempdir().unwrap();
        assert!(!on_battery_at(root.path()));
    }
}
