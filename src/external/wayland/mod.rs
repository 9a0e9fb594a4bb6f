//! Compositor protocol clients. Each client owns its own connection and a
//! dedicated dispatch thread.

pub mod idle;
pub mod output_power;

#[cfg(test)]
pub mod mock;

use std::{sync::Arc, time::Duration};

/// Callback invoked on the compositor dispatch thread when a timeout idles
/// or resumes.
pub type IdleCallback = Arc<dyn Fn() + Send + Sync>;

/// Opaque token identifying one installed idle timeout. The idle source
/// owns the binding from token to notification and callbacks; holders only
/// ever pass the token back for release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdleHandle(pub(crate) u64);

/// The seam between the state machine and the compositor's idle-notification
/// protocol.
pub trait IdleNotify: Send + Sync + 'static {
    /// Install a timeout firing `on_idle` after `timeout` without input and
    /// `on_resume` on the next input after that. Returns None when the
    /// notification could not be created; the caller keeps its entry without
    /// a live handle until the next install.
    fn install(
        &self,
        timeout: Duration,
        on_idle: IdleCallback,
        on_resume: IdleCallback,
    ) -> Option<IdleHandle>;

    /// Destroy an installed timeout. Releasing an unknown or already
    /// released handle only logs.
    fn release(&self, handle: IdleHandle);
}
