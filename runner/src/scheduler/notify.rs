use crate::resources::{Locator, ResourceState};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::trace;

/// Events sent to listeners, possibly more than once
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Message {
    StateChanged {
        locator: Locator,
        old: ResourceState,
        new: ResourceState,
    },
    ResourceAdded {
        locator: Locator,
        state: ResourceState,
    },
    ResourceRemoved {
        locator: Locator,
    },
}

pub trait Listener: Send + Sync {
    fn notify(&self, message: &Message);
}

impl<F> Listener for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn notify(&self, message: &Message) {
        self(message)
    }
}

pub type ListenerId = u64;

#[derive(Default)]
pub struct Listeners {
    next: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn Listener>)>>,
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.listeners.read().len())
            .finish()
    }
}

impl Listeners {
    pub fn add(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));

        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener, _)| *listener != id);

        listeners.len() != before
    }

    pub fn notify(&self, message: &Message) {
        trace!(message = ?message, "Notifying listeners");

        // listeners may register others while being notified
        let listeners = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect::<Vec<_>>();
        for listener in listeners {
            listener.notify(message);
        }
    }
}
