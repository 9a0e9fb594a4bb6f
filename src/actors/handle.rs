use tokio::sync::{mpsc, watch};

/// A handle which signals termination to a task and can wait for it to
/// finish its cleanup.
///
/// Dropping the Handle (or calling [`Handle::await_shutdown`]) closes the
/// channel the child observes through [`HandleChild::should_terminate`]. The
/// child in turn signals completion by dropping its [`HandleChild`], which
/// closes the watch channel the Handle waits on.
pub struct Handle {
    terminator: mpsc::Sender<()>,
    done_receiver: watch::Receiver<()>,
}

/// The side of a [`Handle`] owned by the spawned task. Must be kept alive
/// until the task has finished all of its cleanup.
pub struct HandleChild {
    termination_receiver: mpsc::Receiver<()>,
    _done_notifier: watch::Sender<()>,
}

impl Handle {
    pub fn new() -> (Handle, HandleChild) {
        let (terminator, termination_receiver) = mpsc::channel(1);
        let (done_notifier, done_receiver) = watch::channel(());
        (
            Handle {
                terminator,
                done_receiver,
            },
            HandleChild {
                termination_receiver,
                _done_notifier: done_notifier,
            },
        )
    }

    /// Request termination and wait until the child has dropped its
    /// [`HandleChild`].
    pub async fn await_shutdown(self) {
        drop(self.terminator);
        let mut done_receiver = self.done_receiver;
        // The child dropping its watch sender surfaces as an error here.
        let result = done_receiver.changed().await;
        assert!(result.is_err());
    }
}

impl HandleChild {
    /// Resolves once the parent [`Handle`] is dropped or shut down. Meant to
    /// be polled inside a [`tokio::select!`] arm.
    pub async fn should_terminate(&mut self) {
        let received = self.termination_receiver.recv().await;
        assert!(received.is_none());
    }
}
