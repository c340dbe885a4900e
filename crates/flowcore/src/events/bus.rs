use super::{ExecutionEvent, Topic};
use dashmap::DashMap;
use std::collections::HashSet;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

pub type ObserverId = Uuid;

struct Observer {
    sender: mpsc::UnboundedSender<ExecutionEvent>,
    topics: HashSet<Topic>,
}

/// Receiving side of a connected observer
pub struct Subscription {
    pub observer_id: ObserverId,
    events: mpsc::UnboundedReceiver<ExecutionEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ExecutionEvent> {
        self.events.try_recv().ok()
    }
}

/// Topic-based fan-out of execution events.
///
/// Each observer owns one unbounded channel, so an emit never waits on a slow
/// reader and events of one instance keep their production order per observer.
/// A firehose broadcast channel is kept alongside for local consumers that want
/// everything.
pub struct EventBus {
    firehose: broadcast::Sender<ExecutionEvent>,
    observers: DashMap<ObserverId, Observer>,
    topics: DashMap<Topic, HashSet<ObserverId>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (firehose, _) = broadcast::channel(capacity.max(1));
        Self {
            firehose,
            observers: DashMap::new(),
            topics: DashMap::new(),
        }
    }

    /// Register a new observer with no subscriptions
    pub fn connect(&self) -> Subscription {
        let observer_id = Uuid::new_v4();
        let (sender, events) = mpsc::unbounded_channel();
        self.observers.insert(
            observer_id,
            Observer {
                sender,
                topics: HashSet::new(),
            },
        );
        tracing::debug!(%observer_id, "Observer connected");
        Subscription {
            observer_id,
            events,
        }
    }

    /// Returns false if the observer is not connected
    pub fn subscribe(&self, observer_id: ObserverId, topic: Topic) -> bool {
        let Some(mut observer) = self.observers.get_mut(&observer_id) else {
            return false;
        };
        observer.topics.insert(topic.clone());
        drop(observer);

        tracing::debug!(%observer_id, ?topic, "Subscribed");
        self.topics.entry(topic).or_default().insert(observer_id);
        true
    }

    pub fn unsubscribe(&self, observer_id: ObserverId, topic: &Topic) -> bool {
        let removed = match self.observers.get_mut(&observer_id) {
            Some(mut observer) => observer.topics.remove(topic),
            None => false,
        };
        self.remove_from_topic(observer_id, topic);
        removed
    }

    /// Drop the observer and every subscription it holds. Returns how many were dropped.
    pub fn disconnect(&self, observer_id: ObserverId) -> usize {
        let Some((_, observer)) = self.observers.remove(&observer_id) else {
            return 0;
        };
        for topic in &observer.topics {
            self.remove_from_topic(observer_id, topic);
        }
        tracing::debug!(%observer_id, subscriptions = observer.topics.len(), "Observer disconnected");
        observer.topics.len()
    }

    fn remove_from_topic(&self, observer_id: ObserverId, topic: &Topic) {
        self.topics.remove_if_mut(topic, |_, ids| {
            ids.remove(&observer_id);
            ids.is_empty()
        });
    }

    /// Receive every event regardless of topic
    pub fn subscribe_all(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.firehose.subscribe()
    }

    /// Deliver an event to every observer subscribed to one of its topics, at most once each.
    /// Returns the number of observers reached.
    pub fn emit(&self, event: ExecutionEvent) -> usize {
        let mut recipients = HashSet::new();
        for topic in event.topics() {
            if let Some(ids) = self.topics.get(&topic) {
                recipients.extend(ids.iter().copied());
            }
        }

        let mut delivered = 0;
        for observer_id in recipients {
            let Some(observer) = self.observers.get(&observer_id) else {
                continue;
            };
            match observer.sender.send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::warn!(
                    %observer_id,
                    kind = event.kind(),
                    "Dropping event for closed observer"
                ),
            }
        }

        let _ = self.firehose.send(event);
        delivered
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics.get(topic).map(|ids| ids.len()).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
