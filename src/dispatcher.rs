use crate::change::ChangeEvent;
use crate::listener::{Listener, ListenerId};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Fans a namespace's change events out to its registered listeners on a
/// dedicated background task, so that a slow or panicking listener never
/// blocks the repository's `sync()` loop.
///
/// One dispatcher instance is shared across all namespaces; each queued
/// [`ChangeEvent`] already carries its own namespace so a single worker loop
/// suffices.
pub struct ChangeDispatcher {
    listeners: Mutex<Vec<(ListenerId, Arc<dyn Listener>)>>,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl ChangeDispatcher {
    pub fn new() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChangeEvent>();
        let dispatcher = Arc::new(Self {
            listeners: Mutex::new(Vec::new()),
            tx,
        });

        let worker_dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                worker_dispatcher.deliver(&event).await;
            }
        });

        dispatcher
    }

    pub async fn add_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId::next();
        self.listeners.lock().await.push((id, listener));
        id
    }

    pub async fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().await.retain(|(lid, _)| *lid != id);
    }

    /// Enqueues an event for asynchronous delivery. Never blocks the caller;
    /// the channel is unbounded because change events are rare relative to
    /// the sync loop's cadence and callers (the repository) must not stall
    /// on dispatch.
    pub fn dispatch(&self, event: ChangeEvent) {
        if self.tx.send(event).is_err() {
            error!("change dispatcher worker task is gone; event dropped");
        }
    }

    async fn deliver(&self, event: &ChangeEvent) {
        let listeners: Vec<_> = self.listeners.lock().await.iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            let event = event.clone();
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_change(&event)));
            if result.is_err() {
                warn!(
                    namespace = %event.namespace,
                    "listener panicked while handling a change event; isolated and continuing"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingListener(Arc<AtomicUsize>);
    impl Listener for CountingListener {
        fn on_change(&self, _event: &ChangeEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingListener;
    impl Listener for PanickingListener {
        fn on_change(&self, _event: &ChangeEvent) {
            panic!("boom");
        }
    }

    fn empty_event() -> ChangeEvent {
        ChangeEvent {
            namespace: Namespace::new("app", "default", "application"),
            changes: vec![],
        }
    }

    #[tokio::test]
    async fn delivers_to_all_registered_listeners() {
        let dispatcher = ChangeDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        dispatcher
            .add_listener(Arc::new(CountingListener(count.clone())))
            .await;
        dispatcher
            .add_listener(Arc::new(CountingListener(count.clone())))
            .await;

        dispatcher.dispatch(empty_event());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_delivery_to_others() {
        let dispatcher = ChangeDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        dispatcher.add_listener(Arc::new(PanickingListener)).await;
        dispatcher
            .add_listener(Arc::new(CountingListener(count.clone())))
            .await;

        dispatcher.dispatch(empty_event());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn removed_listener_stops_receiving_events() {
        let dispatcher = ChangeDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = dispatcher
            .add_listener(Arc::new(CountingListener(count.clone())))
            .await;
        dispatcher.remove_listener(id).await;

        dispatcher.dispatch(empty_event());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
