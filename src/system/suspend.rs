//! System suspend, preferring the login manager's bus interface with a
//! configurable external command as fallback. Either way the host is put
//! back to sleep for as long as the lid stays closed.

use std::sync::Arc;

use async_trait::async_trait;
use logind_zbus::manager::ManagerProxy;
use tokio::process::Command;
use tokio_stream::StreamExt;

use crate::external::probes::LidProbe;

#[async_trait]
pub trait Suspender: Send + Sync + 'static {
    /// Suspend and block until the host resumes with the lid open. Returns
    /// false on any setup failure, in which case nothing was suspended.
    async fn run(&self) -> bool;
}

pub fn create_suspender(
    system_bus: Option<zbus::Connection>,
    command: Vec<String>,
    lid: LidProbe,
) -> Arc<dyn Suspender> {
    if command.is_empty() {
        Arc::new(LogindSuspender { system_bus, lid })
    } else {
        Arc::new(CommandSuspender { command, lid })
    }
}

struct LogindSuspender {
    system_bus: Option<zbus::Connection>,
    lid: LidProbe,
}

#[async_trait]
impl Suspender for LogindSuspender {
    async fn run(&self) -> bool {
        log::info!("entering suspend");
        let connection = match &self.system_bus {
            Some(connection) => connection,
            None => {
                log::error!("no system bus connection, cannot suspend");
                return false;
            }
        };
        let manager = match ManagerProxy::new(connection).await {
            Ok(manager) => manager,
            Err(e) => {
                log::error!("could not reach the login manager: {}", e);
                return false;
            }
        };
        let mut sleep_signals = match manager.receive_prepare_for_sleep().await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("could not subscribe to sleep signals: {}", e);
                return false;
            }
        };

        loop {
            if let Err(e) = manager.suspend(false).await {
                log::error!("suspend call failed: {}", e);
                return false;
            }
            // Await the resume edge of the signal pair.
            loop {
                let signal = match sleep_signals.next().await {
                    Some(signal) => signal,
                    None => {
                        log::error!("sleep signal stream closed");
                        return false;
                    }
                };
                match signal.args() {
                    Ok(args) if !args.start => {
                        log::info!("resumed from suspend");
                        if self.lid.closed() {
                            log::info!("lid still closed, suspending again");
                            break;
                        }
                        log::info!("exiting suspend");
                        return true;
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("malformed sleep signal: {}", e),
                }
            }
        }
    }
}

struct CommandSuspender {
    command: Vec<String>,
    lid: LidProbe,
}

#[async_trait]
impl Suspender for CommandSuspender {
    async fn run(&self) -> bool {
        log::info!("entering suspend via {:?}", self.command);
        loop {
            let mut child = match Command::new(&self.command[0])
                .args(&self.command[1..])
                .spawn()
            {
                Ok(child) => child,
                Err(e) => {
                    log::error!("could not start suspend command: {}", e);
                    return false;
                }
            };
            if let Err(e) = child.wait().await {
                log::error!("waiting on suspend command failed: {}", e);
                return false;
            }
            if self.lid.closed() {
                log::info!("lid still closed, suspending again");
                continue;
            }
            log::info!("exiting suspend");
            return true;
        }
    }
}
