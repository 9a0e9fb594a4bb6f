//! Control layer: the state machine, the command router and the bus
//! surface.

pub mod dbus_controller;
pub mod router;
pub mod state;

#[cfg(test)]
mod test;
