//! Best-effort pause broadcast to every MPRIS media player on the session
//! bus, sent right before the screen locks.

const MPRIS_PREFIX: &str = "org.mpris.MediaPlayer2.";
const MPRIS_OBJECT_PATH: &str = "/org/mpris/MediaPlayer2";
const MPRIS_PLAYER_INTERFACE: &str = "org.mpris.MediaPlayer2.Player";

pub struct MusicSilencer {
    session_bus: Option<zbus::Connection>,
}

impl MusicSilencer {
    pub fn new(session_bus: Option<zbus::Connection>) -> MusicSilencer {
        MusicSilencer { session_bus }
    }

    /// Pause every registered media player. Every failure is logged and
    /// swallowed; locking must not depend on well-behaved players.
    pub async fn pause_all(&self) {
        let connection = match &self.session_bus {
            Some(connection) => connection,
            None => {
                log::warn!("no session bus connection, cannot pause players");
                return;
            }
        };
        let dbus = match zbus::fdo::DBusProxy::new(connection).await {
            Ok(dbus) => dbus,
            Err(e) => {
                log::error!("could not create bus proxy: {}", e);
                return;
            }
        };
        let names = match dbus.list_names().await {
            Ok(names) => names,
            Err(e) => {
                log::error!("could not list bus names: {}", e);
                return;
            }
        };
        for name in names {
            if !name.as_str().starts_with(MPRIS_PREFIX) {
                continue;
            }
            log::debug!("pausing {}", name.as_str());
            let player = match zbus::Proxy::new(
                connection,
                name.as_str().to_owned(),
                MPRIS_OBJECT_PATH,
                MPRIS_PLAYER_INTERFACE,
            )
            .await
            {
                Ok(player) => player,
                Err(e) => {
                    log::error!("could not reach {}: {}", name.as_str(), e);
                    continue;
                }
            };
            if let Err(e) = player.call_method("Pause", &()).await {
                log::error!("could not pause {}: {}", name.as_str(), e);
            }
        }
    }
}
