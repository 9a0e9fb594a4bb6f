//! The session-bus control surface. Every method is a short adapter that
//! posts into the router's channels or amends the configuration.

use crate::{
    actors::{EventSender, Handle},
    config::SharedConfig,
    control::router::{LidEvent, UserRequest},
    external::wayland::output_power::OutputPowerManager,
    system::{backlight::BacklightCommand, netwatch},
};
use std::sync::Arc;

pub const BUS_NAME: &str = "io.github.trbjo.GoIdle";
pub const OBJECT_PATH: &str = "/io/github/trbjo/GoIdle";

pub struct DBusController {
    pub config: SharedConfig,
    pub outputs: Arc<OutputPowerManager>,
    pub user_requests: EventSender<UserRequest>,
    pub lid_events: EventSender<LidEvent>,
    pub backlight: EventSender<BacklightCommand>,
}

impl DBusController {
    /// Acquire the bus name (do-not-queue: a clash is an error) and serve
    /// the control object until the returned handle is dropped.
    pub async fn spawn(self) -> anyhow::Result<Handle> {
        let (handle, mut handle_child) = Handle::new();
        let connection = zbus::ConnectionBuilder::session()?
            .name(BUS_NAME)?
            .serve_at(OBJECT_PATH, self)?
            .build()
            .await?;
        log::debug!("listening on D-Bus at {}", OBJECT_PATH);
        tokio::spawn(async move {
            let connection = connection;
            handle_child.should_terminate().await;
            if let Err(e) = connection
                .object_server()
                .remove::<Self, _>(OBJECT_PATH)
                .await
            {
                log::error!("failed to unregister bus object: {}", e);
            }
            log::debug!("bus controller terminated");
        });
        Ok(handle)
    }
}

#[zbus::dbus_interface(name = "io.github.trbjo.GoIdle")]
impl DBusController {
    async fn suspend(&self) -> zbus::fdo::Result<()> {
        self.user_requests.send(UserRequest::Suspend);
        Ok(())
    }

    async fn lock(&self) -> zbus::fdo::Result<()> {
        self.user_requests.send(UserRequest::Lock);
        Ok(())
    }

    async fn lid_close(&self) -> zbus::fdo::Result<()> {
        self.lid_events.send(LidEvent::LidClose);
        Ok(())
    }

    async fn lid_open(&self) -> zbus::fdo::Result<()> {
        self.lid_events.send(LidEvent::LidOpen);
        Ok(())
    }

    async fn wifi_trust(&self) -> zbus::fdo::Result<()> {
        let address = netwatch::gateway_mac()
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        let mut config = self.config.write().await;
        config.trust_address(address);
        config.dump().await;
        Ok(())
    }

    async fn wifi_distrust(&self) -> zbus::fdo::Result<()> {
        let address = netwatch::gateway_mac()
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        let mut config = self.config.write().await;
        config.distrust_address(&address);
        config.dump().await;
        Ok(())
    }

    async fn log_debug(&self) -> zbus::fdo::Result<()> {
        log::set_max_level(log::LevelFilter::Debug);
        Ok(())
    }

    async fn log_info(&self) -> zbus::fdo::Result<()> {
        log::set_max_level(log::LevelFilter::Info);
        Ok(())
    }

    async fn log_warn(&self) -> zbus::fdo::Result<()> {
        log::set_max_level(log::LevelFilter::Warn);
        Ok(())
    }

    async fn idle_grace_duration(&self, duration: String) -> zbus::fdo::Result<()> {
        let parsed = humantime::parse_duration(&duration)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        log::info!("grace duration set to {}", duration);
        let mut config = self.config.write().await;
        config.idle_grace_duration = parsed;
        config.dump().await;
        Ok(())
    }

    async fn toggle_output(&self, output: String) -> zbus::fdo::Result<()> {
        log::info!("output {} toggled", output);
        self.outputs
            .toggle(&output)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn idle_inhibit(&self) -> zbus::fdo::Result<()> {
        log::debug!("IdleInhibit");
        self.user_requests.send(UserRequest::IdleInhibit);
        Ok(())
    }

    async fn idle_allow(&self) -> zbus::fdo::Result<()> {
        log::debug!("IdleAllow");
        self.user_requests.send(UserRequest::IdleAllow);
        Ok(())
    }

    async fn light_increase(&self) -> zbus::fdo::Result<()> {
        self.backlight.send(BacklightCommand::Increase);
        Ok(())
    }

    async fn light_decrease(&self) -> zbus::fdo::Result<()> {
        self.backlight.send(BacklightCommand::Decrease);
        Ok(())
    }
}
