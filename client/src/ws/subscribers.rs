//! Subscriber registry.
//!
//! Every subscriber sees every published value, in registration order.
//! Callbacks run outside the registry lock, so a callback may subscribe or
//! unsubscribe (itself included) without deadlocking.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::warn;

/// Subscriber identifier. Never reused within a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    entries: Vec<(SubscriberId, Callback<T>)>,
}

struct Shared<T> {
    registry: Mutex<Registry<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Registry<T>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: SubscriberId) -> bool;
}

impl<T: 'static> Detach for Shared<T> {
    fn detach(&self, id: SubscriberId) -> bool {
        let mut registry = self.lock();
        let before = registry.entries.len();
        registry.entries.retain(|(entry_id, _)| *entry_id != id);
        registry.entries.len() != before
    }
}

/// Result of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Callbacks that returned normally.
    pub delivered: usize,
    /// Callbacks that panicked.
    pub failed: usize,
}

/// A set of independent callbacks receiving `T`.
pub struct SubscriberSet<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SubscriberSet<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for SubscriberSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberSet")
            .field("subscribers", &self.shared.lock().entries.len())
            .finish()
    }
}

impl<T: 'static> Default for SubscriberSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> SubscriberSet<T> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry {
                    next_id: 1,
                    entries: Vec::new(),
                }),
            }),
        }
    }

    /// Registers `callback`. It stays registered until the returned handle
    /// is unsubscribed or dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.shared.lock();
            let id = SubscriberId(registry.next_id);
            registry.next_id += 1;
            registry.entries.push((id, Arc::new(callback)));
            id
        };

        let shared: Arc<dyn Detach> = self.shared.clone();
        Subscription {
            id,
            set: Some(Arc::downgrade(&shared)),
        }
    }

    /// Invokes every subscriber with `value`, in registration order.
    ///
    /// A panicking callback is logged and skipped; later callbacks still run.
    pub fn publish(&self, value: &T) -> Delivery {
        let snapshot: Vec<(SubscriberId, Callback<T>)> = self
            .shared
            .lock()
            .entries
            .iter()
            .map(|(id, callback)| (*id, Arc::clone(callback)))
            .collect();

        let mut delivery = Delivery::default();
        for (id, callback) in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(value))) {
                Ok(()) => delivery.delivered += 1,
                Err(cause) => {
                    delivery.failed += 1;
                    warn!(
                        subscriber = %id,
                        cause = panic_message(cause.as_ref()),
                        "Subscriber panicked while handling frame"
                    );
                }
            }
        }
        delivery
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    /// Returns true if nobody is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = cause.downcast_ref::<&str>() {
        message
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Disposer for one subscriber.
///
/// Dropping the handle unsubscribes. Use [`Subscription::detach`] to keep
/// the callback registered for the lifetime of the set.
#[must_use = "dropping a Subscription unsubscribes its callback"]
pub struct Subscription {
    id: SubscriberId,
    set: Option<Weak<dyn Detach>>,
}

impl Subscription {
    /// Returns the subscriber id.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Removes the callback. Safe to call more than once.
    ///
    /// Returns true only on the call that actually removed it.
    pub fn unsubscribe(&self) -> bool {
        self.set
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|set| set.detach(self.id))
    }

    /// Keeps the callback registered after this handle is dropped.
    pub fn detach(mut self) {
        self.set = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
