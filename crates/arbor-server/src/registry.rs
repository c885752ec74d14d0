//! Realtime fan-out registry.
//!
//! Tracks which live connections are subscribed to which threads and
//! delivers message events to them, each rendered with that connection's
//! own cached private key. One registry is constructed per server instance
//! and handed to request handlers by reference; it is not a process-wide
//! singleton.
//!
//! Locking: the per-connection subscription sets and the global
//! thread-subscriber index are updated together and must never be observed
//! half-updated, so every mutation happens under one exclusive lock.
//! Broadcasts snapshot the subscriber list under the lock, push outside it,
//! and prune failed connections in a second, separately-locked pass. A
//! failed push is the only garbage collection there is: a connection whose
//! receiver is gone is removed from every thread it was subscribed to.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use arbor_shared::protocol::ServerEvent;
use arbor_shared::{PrivateKey, ThreadId, UserId};

pub type ConnectionId = u64;

/// What a connection's task gets back from [`Registry::register`].
pub struct RegisteredConnection {
    pub id: ConnectionId,
    /// Events to forward to the transport, in push order.
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
    /// Sender for the connection's own replies (welcome, pong, errors), so
    /// they interleave in order with broadcast pushes.
    pub sender: mpsc::UnboundedSender<ServerEvent>,
}

/// Snapshot of one subscriber taken at broadcast time.
pub struct RecipientContext {
    pub user_id: UserId,
    pub private_key: Option<PrivateKey>,
}

struct ConnectionEntry {
    user_id: UserId,
    private_key: Option<PrivateKey>,
    sender: mpsc::UnboundedSender<ServerEvent>,
    subscribed: HashSet<ThreadId>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: ConnectionId,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    thread_subscribers: HashMap<ThreadId, HashSet<ConnectionId>>,
}

impl RegistryInner {
    fn remove_connection(&mut self, id: ConnectionId) {
        if let Some(entry) = self.connections.remove(&id) {
            for thread_id in entry.subscribed {
                if let Some(subscribers) = self.thread_subscribers.get_mut(&thread_id) {
                    subscribers.remove(&id);
                    if subscribers.is_empty() {
                        self.thread_subscribers.remove(&thread_id);
                    }
                }
            }
        }
    }
}

/// The registry itself. Cheap to share via `Arc`.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit an authenticated connection with zero subscriptions.
    pub async fn register(
        &self,
        user_id: UserId,
        private_key: Option<PrivateKey>,
    ) -> RegisteredConnection {
        let (sender, events) = mpsc::unbounded_channel();
        let mut inner = self.inner.write().await;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.connections.insert(
            id,
            ConnectionEntry {
                user_id,
                private_key,
                sender: sender.clone(),
                subscribed: HashSet::new(),
            },
        );
        debug!(connection = id, user = %user_id, "connection registered");
        RegisteredConnection { id, events, sender }
    }

    /// Remove a connection from every thread and drop it.
    pub async fn unregister(&self, id: ConnectionId) {
        let mut inner = self.inner.write().await;
        inner.remove_connection(id);
        debug!(connection = id, "connection unregistered");
    }

    /// Add a connection to a thread's subscriber set. Returns `false` when
    /// it was already subscribed (idempotent; the caller then skips the
    /// full-history push).
    pub async fn subscribe(&self, id: ConnectionId, thread_id: ThreadId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.connections.get_mut(&id) else {
            return false;
        };
        if !entry.subscribed.insert(thread_id) {
            return false;
        }
        inner
            .thread_subscribers
            .entry(thread_id)
            .or_default()
            .insert(id);
        true
    }

    /// Remove a connection from a thread's subscriber set. No-op when not
    /// subscribed.
    pub async fn unsubscribe(&self, id: ConnectionId, thread_id: ThreadId) {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.connections.get_mut(&id) else {
            return;
        };
        if entry.subscribed.remove(&thread_id) {
            if let Some(subscribers) = inner.thread_subscribers.get_mut(&thread_id) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    inner.thread_subscribers.remove(&thread_id);
                }
            }
        }
    }

    /// Replace a connection's cached private key (session refresh).
    pub async fn update_private_key(&self, id: ConnectionId, private_key: Option<PrivateKey>) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.connections.get_mut(&id) {
            entry.private_key = private_key;
        }
    }

    /// Push an event to every current subscriber of `thread_id`, rendering
    /// it per recipient. Subscribers whose transport has gone away are
    /// pruned from all their subscriptions.
    pub async fn broadcast<F>(&self, thread_id: ThreadId, render: F)
    where
        F: Fn(&RecipientContext) -> ServerEvent,
    {
        // Snapshot under the read lock; push outside it so one stuck
        // connection can never delay the others.
        let subscribers: Vec<(ConnectionId, RecipientContext, mpsc::UnboundedSender<ServerEvent>)> = {
            let inner = self.inner.read().await;
            let Some(ids) = inner.thread_subscribers.get(&thread_id) else {
                return;
            };
            ids.iter()
                .filter_map(|id| {
                    inner.connections.get(id).map(|entry| {
                        (
                            *id,
                            RecipientContext {
                                user_id: entry.user_id,
                                private_key: entry.private_key.clone(),
                            },
                            entry.sender.clone(),
                        )
                    })
                })
                .collect()
        };

        let mut stale: Vec<ConnectionId> = Vec::new();
        for (id, context, sender) in &subscribers {
            let event = render(context);
            if sender.send(event).is_err() {
                stale.push(*id);
            }
        }

        if !stale.is_empty() {
            let mut inner = self.inner.write().await;
            for id in stale {
                debug!(connection = id, "pruning closed connection");
                inner.remove_connection(id);
            }
        }
    }

    /// Push a deletion notice to every subscriber; no body is included.
    pub async fn broadcast_message_deleted(
        &self,
        thread_id: ThreadId,
        message_id: arbor_shared::MessageId,
    ) {
        self.broadcast(thread_id, |_| ServerEvent::MessageDeleted {
            thread_id,
            message_id,
        })
        .await;
    }

    /// Number of live subscribers of a thread.
    pub async fn subscriber_count(&self, thread_id: ThreadId) -> usize {
        self.inner
            .read()
            .await
            .thread_subscribers
            .get(&thread_id)
            .map_or(0, HashSet::len)
    }

    /// Verify the two sides of the index agree: for every thread, the
    /// subscriber set is exactly the registered connections that list that
    /// thread in their own subscription set.
    #[cfg(test)]
    pub async fn is_consistent(&self) -> bool {
        let inner = self.inner.read().await;

        for (thread_id, subscribers) in &inner.thread_subscribers {
            if subscribers.is_empty() {
                return false;
            }
            for id in subscribers {
                match inner.connections.get(id) {
                    Some(entry) if entry.subscribed.contains(thread_id) => {}
                    _ => return false,
                }
            }
        }
        for (id, entry) in &inner.connections {
            for thread_id in &entry.subscribed {
                match inner.thread_subscribers.get(thread_id) {
                    Some(subscribers) if subscribers.contains(id) => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_shared::MessageId;

    fn message_event(thread_id: ThreadId) -> impl Fn(&RecipientContext) -> ServerEvent {
        move |context| ServerEvent::Error {
            message: format!("rendered for {} in {}", context.user_id, thread_id),
        }
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let registry = Registry::new();
        let conn = registry.register(UserId(1), None).await;

        assert!(registry.subscribe(conn.id, ThreadId(7)).await);
        assert!(!registry.subscribe(conn.id, ThreadId(7)).await);
        assert_eq!(registry.subscriber_count(ThreadId(7)).await, 1);
        assert!(registry.is_consistent().await);
    }

    #[tokio::test]
    async fn test_unregister_clears_all_subscriptions() {
        let registry = Registry::new();
        let conn = registry.register(UserId(1), None).await;
        registry.subscribe(conn.id, ThreadId(1)).await;
        registry.subscribe(conn.id, ThreadId(2)).await;

        registry.unregister(conn.id).await;
        assert_eq!(registry.subscriber_count(ThreadId(1)).await, 0);
        assert_eq!(registry.subscriber_count(ThreadId(2)).await, 0);
        assert!(registry.is_consistent().await);
    }

    #[tokio::test]
    async fn test_broadcast_renders_per_recipient() {
        let registry = Registry::new();
        let mut alice = registry.register(UserId(1), None).await;
        let mut bob = registry.register(UserId(2), None).await;
        registry.subscribe(alice.id, ThreadId(5)).await;
        registry.subscribe(bob.id, ThreadId(5)).await;

        registry.broadcast(ThreadId(5), message_event(ThreadId(5))).await;

        let alice_event = alice.events.recv().await.unwrap();
        let bob_event = bob.events.recv().await.unwrap();
        assert_ne!(alice_event, bob_event);
    }

    #[tokio::test]
    async fn test_dead_subscriber_is_pruned_lazily() {
        let registry = Registry::new();
        let mut live = registry.register(UserId(1), None).await;
        let dead = registry.register(UserId(2), None).await;
        registry.subscribe(live.id, ThreadId(5)).await;
        registry.subscribe(dead.id, ThreadId(5)).await;
        registry.subscribe(dead.id, ThreadId(6)).await;

        // Simulate a closed transport.
        drop(dead.events);

        registry.broadcast(ThreadId(5), message_event(ThreadId(5))).await;

        // The live subscriber still got its event...
        assert!(live.events.recv().await.is_some());
        // ...and the dead one is gone from every thread, not just the
        // broadcast one.
        assert_eq!(registry.subscriber_count(ThreadId(5)).await, 1);
        assert_eq!(registry.subscriber_count(ThreadId(6)).await, 0);
        assert!(registry.is_consistent().await);
    }

    #[tokio::test]
    async fn test_broadcast_to_silent_thread_is_noop() {
        let registry = Registry::new();
        registry
            .broadcast_message_deleted(ThreadId(9), MessageId(1))
            .await;
        assert!(registry.is_consistent().await);
    }

    #[tokio::test]
    async fn test_interleaved_operations_keep_index_consistent() {
        let registry = Registry::new();
        let conns = [
            registry.register(UserId(1), None).await,
            registry.register(UserId(2), None).await,
            registry.register(UserId(3), None).await,
        ];

        for (i, conn) in conns.iter().enumerate() {
            for t in 0..=i as i64 {
                registry.subscribe(conn.id, ThreadId(t)).await;
            }
        }
        registry.unsubscribe(conns[2].id, ThreadId(1)).await;
        registry.unsubscribe(conns[2].id, ThreadId(1)).await; // no-op repeat
        registry.unregister(conns[0].id).await;
        registry.broadcast(ThreadId(0), message_event(ThreadId(0))).await;

        assert!(registry.is_consistent().await);
        assert_eq!(registry.subscriber_count(ThreadId(0)).await, 2);
        assert_eq!(registry.subscriber_count(ThreadId(1)).await, 1);
        assert_eq!(registry.subscriber_count(ThreadId(2)).await, 1);
    }

    #[tokio::test]
    async fn test_events_arrive_in_broadcast_order() {
        let registry = Registry::new();
        let mut conn = registry.register(UserId(1), None).await;
        registry.subscribe(conn.id, ThreadId(3)).await;

        for i in 0..10 {
            registry
                .broadcast(ThreadId(3), move |_| ServerEvent::MessageDeleted {
                    thread_id: ThreadId(3),
                    message_id: MessageId(i),
                })
                .await;
        }

        for i in 0..10 {
            match conn.events.recv().await.unwrap() {
                ServerEvent::MessageDeleted { message_id, .. } => {
                    assert_eq!(message_id, MessageId(i));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
}
