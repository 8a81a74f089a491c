use crate::models::{IncomingMessage, PublishParameters};
use crate::topic_filter;
use log::{debug, error, info, trace};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub type MessageCallback = Arc<dyn Fn(&IncomingMessage) + Send + Sync>;

struct Subscriber {
    uid: String,
    topic_filter: String,
    callback: MessageCallback,
}

impl Subscriber {
    fn is_filter_match(&self, topic: &str) -> bool {
        topic_filter::matches(topic, &self.topic_filter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberInfo {
    pub uid: String,
    pub topic_filter: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStatus {
    pub subscribers_count: usize,
    pub retained_count: usize,
    pub inbound_count: u64,
    pub outbound_count: u64,
}

/// Queued message with its recipients, fixed when it was enqueued.
struct Dispatch {
    message: IncomingMessage,
    targets: Vec<String>,
}

/// In-process MQTT hub. Imports publish into it, scripts subscribe to it.
pub struct MessageHub {
    subscribers: Mutex<HashMap<String, Subscriber>>,
    retained: Mutex<HashMap<String, IncomingMessage>>,
    queue: mpsc::UnboundedSender<Dispatch>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Dispatch>>>,
    inbound_count: AtomicU64,
    outbound_count: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking subscriber never holds these locks, recover the data anyway.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MessageHub {
    pub fn new() -> Arc<Self> {
        let (queue, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            retained: Mutex::new(HashMap::new()),
            queue,
            receiver: Mutex::new(Some(receiver)),
            inbound_count: AtomicU64::new(0),
            outbound_count: AtomicU64::new(0),
        })
    }

    /// Spawns the dispatch worker. Returns `None` if it was already started.
    pub fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Option<JoinHandle<()>> {
        let mut receiver = lock(&self.receiver).take()?;
        let hub = self.clone();

        info!("Starting message hub worker...");
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    dispatch = receiver.recv() => match dispatch {
                        Some(dispatch) => hub.process(dispatch),
                        None => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            info!("Message hub worker stopped.");
        }))
    }

    pub fn publish(&self, parameters: PublishParameters) {
        self.inbound_count.fetch_add(1, Ordering::Relaxed);
        let message = IncomingMessage::from(parameters);

        // Lock order: subscribers, then retained. Holding the subscribers lock
        // until the message is queued keeps it from reaching a subscriber both
        // directly and through that subscriber's retained snapshot.
        let subscribers = lock(&self.subscribers);
        if message.retain {
            let mut retained = lock(&self.retained);
            if message.payload.is_empty() {
                retained.remove(&message.topic);
            } else {
                retained.insert(message.topic.clone(), message.clone());
            }
        }

        let targets = subscribers
            .values()
            .filter(|s| s.is_filter_match(&message.topic))
            .map(|s| s.uid.clone())
            .collect();

        trace!("Published MQTT topic '{}'.", message.topic);
        self.enqueue(Dispatch { message, targets });
    }

    pub fn subscribe<F>(&self, uid: &str, topic_filter: &str, callback: F) -> String
    where
        F: Fn(&IncomingMessage) + Send + Sync + 'static,
    {
        let uid = if uid.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            uid.to_string()
        };

        let mut subscribers = lock(&self.subscribers);
        subscribers.insert(
            uid.clone(),
            Subscriber {
                uid: uid.clone(),
                topic_filter: topic_filter.to_string(),
                callback: Arc::new(callback),
            },
        );
        debug!("Subscriber '{}' registered for '{}'.", uid, topic_filter);

        // Deliver matching retained messages, as a broker would on subscribe.
        let mut retained: Vec<IncomingMessage> = lock(&self.retained)
            .values()
            .filter(|m| topic_filter::matches(&m.topic, topic_filter))
            .cloned()
            .collect();
        retained.sort_by(|a, b| a.topic.cmp(&b.topic));
        for message in retained {
            self.enqueue(Dispatch {
                message,
                targets: vec![uid.clone()],
            });
        }
        drop(subscribers);

        uid
    }

    pub fn unsubscribe(&self, uid: &str) {
        if lock(&self.subscribers).remove(uid).is_some() {
            debug!("Subscriber '{}' removed.", uid);
        }
    }

    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        let mut subscribers: Vec<SubscriberInfo> = lock(&self.subscribers)
            .values()
            .map(|s| SubscriberInfo {
                uid: s.uid.clone(),
                topic_filter: s.topic_filter.clone(),
            })
            .collect();
        subscribers.sort_by(|a, b| a.uid.cmp(&b.uid));
        subscribers
    }

    pub fn retained_messages(&self) -> Vec<IncomingMessage> {
        let mut messages: Vec<IncomingMessage> = lock(&self.retained).values().cloned().collect();
        messages.sort_by(|a, b| a.topic.cmp(&b.topic));
        messages
    }

    pub fn status(&self) -> HubStatus {
        HubStatus {
            subscribers_count: lock(&self.subscribers).len(),
            retained_count: lock(&self.retained).len(),
            inbound_count: self.inbound_count.load(Ordering::Relaxed),
            outbound_count: self.outbound_count.load(Ordering::Relaxed),
        }
    }

    fn enqueue(&self, dispatch: Dispatch) {
        if self.queue.send(dispatch).is_err() {
            error!("Message hub worker is gone. Dropping message.");
        }
    }

    fn process(&self, dispatch: Dispatch) {
        let Dispatch { message, targets } = dispatch;

        // Subscribers removed since the publish are skipped.
        let affected: Vec<(String, MessageCallback)> = {
            let subscribers = lock(&self.subscribers);
            targets
                .into_iter()
                .filter_map(|uid| subscribers.get(&uid).map(|s| (uid, s.callback.clone())))
                .collect()
        };

        for (uid, callback) in affected {
            self.try_notify_subscriber(&uid, &callback, &message);
        }
    }

    fn try_notify_subscriber(&self, uid: &str, callback: &MessageCallback, message: &IncomingMessage) {
        match panic::catch_unwind(AssertUnwindSafe(|| callback(message))) {
            Ok(()) => {
                self.outbound_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                error!(
                    "Error while notifying subscriber '{}' about topic '{}'.",
                    uid, message.topic
                );
            }
        }
    }
}

impl fmt::Debug for MessageHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHub")
            .field("status", &self.status())
            .finish()
    }
}
