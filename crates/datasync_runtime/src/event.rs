//! Topic-based publish/subscribe.

use crate::error::SyncResult;
use crate::timer::TimerService;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An event that can be routed by topic.
pub trait Event: Send + Sync + 'static {
    /// Topic type used for routing.
    type Topic: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// Returns the topic this event is delivered to.
    fn topic(&self) -> Self::Topic;
}

/// Callback invoked for every event posted to a subscribed topic.
pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Identifies one handler registered on an [`EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Publish/subscribe bus.
pub trait EventBus<E: Event>: Send + Sync {
    /// Adds `handler` to `topic` and returns its id.
    fn subscribe(&self, topic: E::Topic, handler: Handler<E>) -> SubscriptionId;

    /// Removes every handler of `topic`.
    fn unsubscribe(&self, topic: E::Topic);

    /// Removes the handler `id` from `topic`, leaving the other handlers
    /// in place. Returns false if it was not registered.
    fn remove_handler(&self, topic: E::Topic, id: SubscriptionId) -> bool;

    /// Delivers `event` asynchronously to the handlers of its topic.
    fn post(&self, event: E) -> SyncResult<()>;
}

/// In-process [`EventBus`] delivering through a [`TimerService`].
///
/// Handlers of one topic see events in post order when the executor runs
/// tasks in submission order; nothing is guaranteed across topics.
pub struct EventCenter<E: Event> {
    executor: Arc<dyn TimerService>,
    handlers: RwLock<HashMap<E::Topic, Vec<(SubscriptionId, Handler<E>)>>>,
    next_id: AtomicU64,
}

impl<E: Event> EventCenter<E> {
    /// Creates an event center running deliveries on `executor`.
    pub fn new(executor: Arc<dyn TimerService>) -> Self {
        Self {
            executor,
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns the number of handlers registered for `topic`.
    pub fn handler_count(&self, topic: E::Topic) -> usize {
        self.handlers.read().get(&topic).map_or(0, Vec::len)
    }
}

impl<E: Event> EventBus<E> for EventCenter<E> {
    fn subscribe(&self, topic: E::Topic, handler: Handler<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().entry(topic).or_default().push((id, handler));
        id
    }

    fn unsubscribe(&self, topic: E::Topic) {
        self.handlers.write().remove(&topic);
    }

    fn remove_handler(&self, topic: E::Topic, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(registered) = handlers.get_mut(&topic) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|(handler_id, _)| *handler_id != id);
        let removed = registered.len() != before;
        if registered.is_empty() {
            handlers.remove(&topic);
        }
        removed
    }

    fn post(&self, event: E) -> SyncResult<()> {
        let topic = event.topic();
        let handlers: Vec<Handler<E>> = match self.handlers.read().get(&topic) {
            Some(handlers) if !handlers.is_empty() => {
                handlers.iter().map(|(_, handler)| Arc::clone(handler)).collect()
            }
            _ => {
                tracing::trace!(?topic, "event dropped, no subscriber");
                return Ok(());
            }
        };
        self.executor.schedule_task(Box::new(move || {
            for handler in &handlers {
                handler(&event);
            }
        }))
    }
}
