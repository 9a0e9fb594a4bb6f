use log::info;
use zbus;

/// Handles initialization and cloning of [zbus::Connection]s. Connections
/// are internally reference-counted; this factory creates each bus
/// connection once and hands out clones afterwards.
pub struct ConnectionFactory {
    system: Option<zbus::Connection>,
    session: Option<zbus::Connection>,
}

impl ConnectionFactory {
    pub fn new() -> ConnectionFactory {
        ConnectionFactory {
            system: None,
            session: None,
        }
    }

    /// Get a connection to the system bus.
    pub async fn system(&mut self) -> zbus::Result<zbus::Connection> {
        if let Some(connection) = &self.system {
            Ok(connection.clone())
        } else {
            info!("connecting to the system bus");
            let connection = zbus::Connection::system().await?;
            self.system = Some(connection.clone());
            Ok(connection)
        }
    }

    /// Get a connection to the session bus.
    pub async fn session(&mut self) -> zbus::Result<zbus::Connection> {
        if let Some(connection) = &self.session {
            Ok(connection.clone())
        } else {
            info!("connecting to the session bus");
            let connection = zbus::Connection::session().await?;
            self.session = Some(connection.clone());
            Ok(connection)
        }
    }
}
