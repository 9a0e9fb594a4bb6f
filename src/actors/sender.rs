use tokio::sync::mpsc;

/// A sender for level-triggered events that must never block its caller.
///
/// Timeout callbacks run on the compositor dispatch thread and bus method
/// handlers run on the zbus executor; neither may wait for the router. A
/// full queue therefore drops the event: the condition it reports will be
/// re-asserted by the next compositor or bus event, and a full queue means
/// the router is already working through the same conditions.
pub struct EventSender<T> {
    channel: mpsc::Sender<T>,
}

// Derived Clone would require T: Clone.
impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        EventSender {
            channel: self.channel.clone(),
        }
    }
}

impl<T: Send + 'static> EventSender<T> {
    pub fn new(channel: mpsc::Sender<T>) -> EventSender<T> {
        EventSender { channel }
    }

    /// Create a bounded channel and return its sending side pre-wrapped.
    pub fn bounded(capacity: usize) -> (EventSender<T>, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity);
        (EventSender::new(tx), rx)
    }

    pub fn send(&self, event: T) {
        use mpsc::error::TrySendError;
        match self.channel.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::debug!("event channel full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("event channel closed, dropping event");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::EventSender;

    #[tokio::test]
    async fn delivers_in_order() {
        let (sender, mut rx) = EventSender::bounded(4);
        sender.send(1u32);
        sender.send(2);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        let (sender, mut rx) = EventSender::bounded(1);
        sender.send(1u32);
        sender.send(2);
        sender.send(3);
        assert_eq!(rx.recv().await, Some(1));
        assert!(rx.try_recv().is_err());
    }
}
