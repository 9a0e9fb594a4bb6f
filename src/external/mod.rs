//! Clients of external servers: the compositor protocols, the message
//! buses, and the read-only sysfs/procfs snapshots.

pub mod dbus;
pub mod probes;
pub mod wayland;
