//! Connection registry for sessions, subscriptions and outbound handles.
//!
//! The registry maintains bidirectional mappings: destination → subscribers
//! (for fan-out) and connection → subscriptions (for O(1) cleanup on
//! disconnect), plus the login table binding usernames to connections.
//!
//! # Concurrency
//!
//! Both subscription maps are [`DashMap`]s, so operations on unrelated
//! connections and destinations only contend when they hash to the same
//! shard. The login table sits behind one mutex because "one live connection
//! per username" is a cross-key invariant.
//!
//! Compound operations take their locks in a fixed order: login table, then
//! the connection's shard, then the destination's shard. A connection's own
//! entry is held for the whole of any change to its subscriptions, which is
//! what makes subscribe, unsubscribe and disconnect linearizable per
//! connection. Outbound handles are cloned out of the map before any frame is
//! handed to them, so no map lock is ever held across I/O.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use stompd_proto::Frame;

use crate::error::RegistryError;

/// Process-unique connection identifier, assigned at accept time.
pub type ConnectionId = u64;

/// Outbound side of one connection, as seen by the registry.
///
/// Implemented by each transport's connection handler.
pub trait ConnectionHandle: Send + Sync {
    /// Queue a frame for delivery.
    ///
    /// Returns `false` if the connection no longer accepts frames (closed, or
    /// its final frame was already queued).
    fn send(&self, frame: &Frame) -> bool;

    /// Queue the connection's final frame and refuse any later ones.
    fn finish(&self, frame: &Frame) -> bool;

    /// Close the underlying channel. Must be idempotent.
    fn close(&self);
}

/// Outcome of a login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginResult {
    /// First login for this username; the account was created
    Registered,
    /// Existing account, password matched
    LoggedIn,
    /// Existing account, password did not match
    WrongPassword,
    /// The username is bound to another live connection
    AlreadyLoggedIn,
}

/// Per-connection registry state.
struct ConnectionEntry {
    /// Outbound handle
    handle: Arc<dyn ConnectionHandle>,
    /// Subscription id → destination
    subscriptions: HashMap<String, String>,
    /// Destination → subscription id (reverse index)
    destinations: HashMap<String, String>,
}

/// Login table. Guarded by a single mutex.
#[derive(Debug, Default)]
struct SessionTable {
    /// Username → password (first registration wins)
    passwords: HashMap<String, String>,
    /// Username → bound connection
    active: HashMap<String, ConnectionId>,
    /// Connection → bound username (reverse index)
    by_connection: HashMap<ConnectionId, String>,
}

/// Registry of live connections, subscriptions and login sessions.
///
/// Created once at server start and shared by `Arc` with the transport and
/// every connection's protocol driver.
pub struct ConnectionRegistry {
    /// Connection ID → handle and subscriptions
    connections: DashMap<ConnectionId, ConnectionEntry>,
    /// Destination → subscribed connections with their subscription ids.
    /// Never holds an empty map.
    channels: DashMap<String, HashMap<ConnectionId, String>>,
    /// Login state
    sessions: Mutex<SessionTable>,
    /// Last allocated message id
    last_message_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            channels: DashMap::new(),
            sessions: Mutex::new(SessionTable::default()),
            last_message_id: AtomicU64::new(0),
        }
    }

    /// Register a connection's outbound handle.
    ///
    /// Returns `false` if the id is already registered.
    pub fn register(&self, id: ConnectionId, handle: Arc<dyn ConnectionHandle>) -> bool {
        match self.connections.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ConnectionEntry {
                    handle,
                    subscriptions: HashMap::new(),
                    destinations: HashMap::new(),
                });
                true
            },
        }
    }

    #[cfg(test)]
    fn is_registered(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Tear a connection down: drop its subscriptions, unbind its username,
    /// deregister it and close its handle.
    ///
    /// Idempotent. Returns `false` if the connection was already gone.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let handle = {
            let mut sessions = self.sessions.lock();

            let Entry::Occupied(entry) = self.connections.entry(id) else {
                return false;
            };

            for destination in entry.get().subscriptions.values() {
                self.remove_subscriber(destination, id);
            }

            if let Some(username) = sessions.by_connection.remove(&id) {
                sessions.active.remove(&username);
            }

            entry.remove().handle
        };

        handle.close();
        tracing::debug!(connection_id = id, "connection deregistered");
        true
    }

    /// Tear down every registered connection. Returns how many were removed.
    pub fn disconnect_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter(|id| self.disconnect(*id)).count()
    }

    /// Queue a frame for one connection.
    ///
    /// Returns `false` if the connection is unknown or refused the frame.
    pub fn send_to(&self, id: ConnectionId, frame: &Frame) -> bool {
        self.handle(id).is_some_and(|handle| handle.send(frame))
    }

    /// Queue a connection's final frame. See [`ConnectionHandle::finish`].
    pub fn finish(&self, id: ConnectionId, frame: &Frame) -> bool {
        self.handle(id).is_some_and(|handle| handle.finish(frame))
    }

    /// Deliver to every current subscriber of `destination`.
    ///
    /// Subscribers are snapshotted first; `build` is called once per
    /// subscriber with its subscription id. A subscriber that leaves after the
    /// snapshot is skipped silently. Returns the number of frames queued.
    pub fn send_to_channel<F>(&self, destination: &str, build: F) -> usize
    where
        F: Fn(&str) -> Frame,
    {
        self.subscribers(destination)
            .into_iter()
            .filter(|(id, subscription)| self.send_to(*id, &build(subscription)))
            .count()
    }

    /// Point-in-time copy of a destination's subscribers as
    /// `(connection, subscription id)` pairs.
    pub fn subscribers(&self, destination: &str) -> Vec<(ConnectionId, String)> {
        self.channels
            .get(destination)
            .map(|subscribers| {
                subscribers.iter().map(|(id, subscription)| (*id, subscription.clone())).collect()
            })
            .unwrap_or_default()
    }

    /// Attempt to bind `username` to connection `id`.
    ///
    /// Unknown usernames are registered with `password`. Known usernames must
    /// present the same password and must not be bound to another connection.
    pub fn login(
        &self,
        id: ConnectionId,
        username: &str,
        password: &str,
    ) -> Result<LoginResult, RegistryError> {
        let mut sessions = self.sessions.lock();

        // Checked under the login lock, which disconnect also takes first.
        if !self.connections.contains_key(&id) {
            return Err(RegistryError::UnknownConnection(id));
        }

        let result = match sessions.passwords.get(username).map(|stored| stored == password) {
            Some(false) => return Ok(LoginResult::WrongPassword),
            Some(true) if sessions.active.contains_key(username) => {
                return Ok(LoginResult::AlreadyLoggedIn);
            },
            Some(true) => LoginResult::LoggedIn,
            None => {
                sessions.passwords.insert(username.to_string(), password.to_string());
                LoginResult::Registered
            },
        };

        if let Some(previous) = sessions.by_connection.insert(id, username.to_string()) {
            sessions.active.remove(&previous);
        }
        sessions.active.insert(username.to_string(), id);

        Ok(result)
    }

    #[cfg(test)]
    fn username(&self, id: ConnectionId) -> Option<String> {
        self.sessions.lock().by_connection.get(&id).cloned()
    }

    /// Connection a username is bound to.
    pub fn connection_for_user(&self, username: &str) -> Option<ConnectionId> {
        self.sessions.lock().active.get(username).copied()
    }

    /// Subscribe a connection to a destination under `subscription` id.
    ///
    /// Both indices are updated together or not at all.
    pub fn subscribe(
        &self,
        id: ConnectionId,
        destination: &str,
        subscription: &str,
    ) -> Result<(), RegistryError> {
        let mut entry =
            self.connections.get_mut(&id).ok_or(RegistryError::UnknownConnection(id))?;

        if entry.subscriptions.contains_key(subscription) {
            return Err(RegistryError::DuplicateSubscriptionId { id: subscription.to_string() });
        }

        if entry.destinations.contains_key(destination) {
            return Err(RegistryError::AlreadySubscribed { destination: destination.to_string() });
        }

        self.channels
            .entry(destination.to_string())
            .or_default()
            .insert(id, subscription.to_string());

        entry.subscriptions.insert(subscription.to_string(), destination.to_string());
        entry.destinations.insert(destination.to_string(), subscription.to_string());

        tracing::debug!(connection_id = id, destination, subscription, "subscribed");
        Ok(())
    }

    /// Remove a connection's subscription by id, pruning the destination if it
    /// has no subscribers left.
    ///
    /// Returns the destination the subscription was for.
    pub fn unsubscribe(
        &self,
        id: ConnectionId,
        subscription: &str,
    ) -> Result<String, RegistryError> {
        let mut entry =
            self.connections.get_mut(&id).ok_or(RegistryError::UnknownConnection(id))?;

        let destination = entry
            .subscriptions
            .remove(subscription)
            .ok_or_else(|| RegistryError::SubscriptionNotFound { id: subscription.to_string() })?;
        entry.destinations.remove(&destination);

        self.remove_subscriber(&destination, id);

        tracing::debug!(connection_id = id, destination, subscription, "unsubscribed");
        Ok(destination)
    }

    /// Check if a connection subscribes to a destination.
    pub fn is_subscribed(&self, id: ConnectionId, destination: &str) -> bool {
        self.connections.get(&id).is_some_and(|entry| entry.destinations.contains_key(destination))
    }

    #[cfg(test)]
    fn subscription_id(&self, id: ConnectionId, destination: &str) -> Option<String> {
        self.connections.get(&id).and_then(|entry| entry.destinations.get(destination).cloned())
    }

    /// Number of subscriptions a connection holds.
    pub fn subscription_count(&self, id: ConnectionId) -> usize {
        self.connections.get(&id).map_or(0, |entry| entry.subscriptions.len())
    }

    /// Allocate the next message id. The first id is 1.
    pub fn next_message_id(&self) -> u64 {
        self.last_message_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Total number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of destinations with at least one subscriber.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn handle(&self, id: ConnectionId) -> Option<Arc<dyn ConnectionHandle>> {
        self.connections.get(&id).map(|entry| Arc::clone(&entry.handle))
    }

    /// Drop `id` from a destination, removing the destination once empty.
    fn remove_subscriber(&self, destination: &str, id: ConnectionId) {
        if let Entry::Occupied(mut channel) = self.channels.entry(destination.to_string()) {
            channel.get_mut().remove(&id);
            if channel.get().is_empty() {
                channel.remove();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use super::*;

    #[derive(Default)]
    struct RecordingHandle {
        frames: Mutex<Vec<Frame>>,
        sealed: std::sync::atomic::AtomicBool,
        closed: std::sync::atomic::AtomicBool,
    }

    impl ConnectionHandle for RecordingHandle {
        fn send(&self, frame: &Frame) -> bool {
            if self.sealed.load(Ordering::SeqCst) {
                return false;
            }
            self.frames.lock().push(frame.clone());
            true
        }

        fn finish(&self, frame: &Frame) -> bool {
            let sent = self.send(frame);
            self.sealed.store(true, Ordering::SeqCst);
            sent
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn registry_with(ids: &[ConnectionId]) -> (ConnectionRegistry, Vec<Arc<RecordingHandle>>) {
        let registry = ConnectionRegistry::new();
        let handles = ids
            .iter()
            .map(|id| {
                let handle = Arc::new(RecordingHandle::default());
                assert!(registry.register(*id, handle.clone()));
                handle
            })
            .collect();
        (registry, handles)
    }

    #[test]
    fn register_and_lookup_connection() {
        let (registry, _handles) = registry_with(&[1]);

        assert!(registry.is_registered(1));
        assert!(!registry.is_registered(2));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn register_duplicate_connection_fails() {
        let (registry, _handles) = registry_with(&[1]);

        assert!(!registry.register(1, Arc::new(RecordingHandle::default())));
    }

    #[test]
    fn subscribe_and_lookup() {
        let (registry, _handles) = registry_with(&[1, 2]);

        registry.subscribe(1, "/a", "s1").unwrap();
        registry.subscribe(2, "/a", "s2").unwrap();

        assert!(registry.is_subscribed(1, "/a"));
        assert!(registry.is_subscribed(2, "/a"));
        assert_eq!(registry.subscription_id(1, "/a").as_deref(), Some("s1"));

        let mut subscribers = registry.subscribers("/a");
        subscribers.sort();
        assert_eq!(subscribers, vec![(1, "s1".to_string()), (2, "s2".to_string())]);
    }

    #[test]
    fn subscribe_unregistered_connection_fails() {
        let registry = ConnectionRegistry::new();

        assert_eq!(registry.subscribe(9, "/a", "1"), Err(RegistryError::UnknownConnection(9)));
        assert_eq!(registry.channel_count(), 0);
    }

    #[test]
    fn duplicate_subscription_id_rejected_without_side_effects() {
        let (registry, _handles) = registry_with(&[1]);

        registry.subscribe(1, "/a", "1").unwrap();
        let err = registry.subscribe(1, "/b", "1").unwrap_err();

        assert_eq!(err, RegistryError::DuplicateSubscriptionId { id: "1".to_string() });
        assert!(!registry.is_subscribed(1, "/b"));
        assert!(registry.subscribers("/b").is_empty());
        assert_eq!(registry.channel_count(), 1);
    }

    #[test]
    fn second_subscription_to_same_destination_rejected() {
        let (registry, _handles) = registry_with(&[1]);

        registry.subscribe(1, "/a", "1").unwrap();
        let err = registry.subscribe(1, "/a", "2").unwrap_err();

        assert_eq!(err, RegistryError::AlreadySubscribed { destination: "/a".to_string() });
        assert_eq!(registry.subscription_count(1), 1);
        assert_eq!(registry.subscribers("/a"), vec![(1, "1".to_string())]);
    }

    #[test]
    fn unsubscribe_removes_from_both_maps() {
        let (registry, _handles) = registry_with(&[1]);

        registry.subscribe(1, "/a", "1").unwrap();
        assert_eq!(registry.unsubscribe(1, "1").unwrap(), "/a");

        assert!(!registry.is_subscribed(1, "/a"));
        assert!(registry.subscribers("/a").is_empty());
        assert_eq!(registry.subscription_count(1), 0);
        assert_eq!(registry.channel_count(), 0);
    }

    #[test]
    fn unsubscribe_unknown_id_fails() {
        let (registry, _handles) = registry_with(&[1]);

        assert_eq!(
            registry.unsubscribe(1, "nope"),
            Err(RegistryError::SubscriptionNotFound { id: "nope".to_string() })
        );
    }

    #[test]
    fn unsubscribe_keeps_channel_with_other_subscribers() {
        let (registry, _handles) = registry_with(&[1, 2]);

        registry.subscribe(1, "/a", "1").unwrap();
        registry.subscribe(2, "/a", "1").unwrap();
        registry.unsubscribe(1, "1").unwrap();

        assert_eq!(registry.subscribers("/a"), vec![(2, "1".to_string())]);
    }

    #[test]
    fn disconnect_removes_all_subscriptions() {
        let (registry, handles) = registry_with(&[1, 2]);

        registry.subscribe(1, "/a", "1").unwrap();
        registry.subscribe(1, "/b", "2").unwrap();
        registry.subscribe(2, "/a", "1").unwrap();

        assert!(registry.disconnect(1));

        assert!(!registry.is_registered(1));
        assert_eq!(registry.subscribers("/a"), vec![(2, "1".to_string())]);
        assert!(registry.subscribers("/b").is_empty());
        assert_eq!(registry.channel_count(), 1);
        assert!(handles[0].closed.load(Ordering::SeqCst));
        assert!(!handles[1].closed.load(Ordering::SeqCst));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (registry, _handles) = registry_with(&[1]);

        assert!(registry.disconnect(1));
        assert!(!registry.disconnect(1));
        assert!(!registry.disconnect(42));
    }

    #[test]
    fn first_login_registers_account() {
        let (registry, _handles) = registry_with(&[1]);

        assert_eq!(registry.login(1, "alice", "x"), Ok(LoginResult::Registered));
        assert_eq!(registry.username(1).as_deref(), Some("alice"));
        assert_eq!(registry.connection_for_user("alice"), Some(1));
    }

    #[test]
    fn login_rejects_wrong_password() {
        let (registry, _handles) = registry_with(&[1, 2]);

        registry.login(1, "alice", "x").unwrap();
        registry.disconnect(1);

        assert_eq!(registry.login(2, "alice", "y"), Ok(LoginResult::WrongPassword));
        assert_eq!(registry.username(2), None);
    }

    #[test]
    fn one_connection_per_user() {
        let (registry, _handles) = registry_with(&[1, 2]);

        assert_eq!(registry.login(1, "alice", "x"), Ok(LoginResult::Registered));
        assert_eq!(registry.login(2, "alice", "x"), Ok(LoginResult::AlreadyLoggedIn));
        assert_eq!(registry.connection_for_user("alice"), Some(1));
    }

    #[test]
    fn relogin_after_disconnect_succeeds() {
        let (registry, _handles) = registry_with(&[1, 2]);

        registry.login(1, "alice", "x").unwrap();
        registry.disconnect(1);

        assert_eq!(registry.connection_for_user("alice"), None);
        assert_eq!(registry.login(2, "alice", "x"), Ok(LoginResult::LoggedIn));
    }

    #[test]
    fn login_on_torn_down_connection_fails() {
        let registry = ConnectionRegistry::new();

        assert_eq!(registry.login(5, "alice", "x"), Err(RegistryError::UnknownConnection(5)));
        assert_eq!(registry.connection_for_user("alice"), None);
    }

    #[test]
    fn message_ids_start_at_one_and_increase() {
        let registry = ConnectionRegistry::new();

        assert_eq!(registry.next_message_id(), 1);
        assert_eq!(registry.next_message_id(), 2);
        assert_eq!(registry.next_message_id(), 3);
    }

    #[test]
    fn send_to_unknown_connection_reports_failure() {
        let registry = ConnectionRegistry::new();

        assert!(!registry.send_to(3, &Frame::connected()));
    }

    #[test]
    fn fan_out_uses_each_subscription_id() {
        let (registry, handles) = registry_with(&[1, 2, 3]);

        registry.subscribe(1, "/a", "one").unwrap();
        registry.subscribe(2, "/a", "two").unwrap();
        registry.subscribe(3, "/b", "three").unwrap();

        let sent = registry.send_to_channel("/a", |sub| Frame::message("/a", sub, 7, "hi"));
        assert_eq!(sent, 2);

        let first = handles[0].frames.lock();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].header("subscription"), Some("one"));
        assert_eq!(first[0].header("message-id"), Some("7"));

        assert_eq!(handles[1].frames.lock()[0].header("subscription"), Some("two"));
        assert!(handles[2].frames.lock().is_empty());
    }

    #[test]
    fn finished_connection_refuses_further_frames() {
        let (registry, handles) = registry_with(&[1]);

        assert!(registry.finish(1, &Frame::receipt_for("r")));
        assert!(!registry.send_to(1, &Frame::connected()));
        assert_eq!(handles[0].frames.lock().len(), 1);
    }

    #[test]
    fn concurrent_duplicate_subscription_id_exactly_one_wins() {
        for _ in 0..50 {
            let (registry, _handles) = registry_with(&[1]);
            let registry = Arc::new(registry);
            let barrier = Arc::new(Barrier::new(2));

            let workers: Vec<_> = ["/x", "/y"]
                .into_iter()
                .map(|destination| {
                    let registry = Arc::clone(&registry);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        registry.subscribe(1, destination, "same").is_ok()
                    })
                })
                .collect();

            let wins = workers.into_iter().map(|w| w.join().unwrap_or(false)).filter(|&won| won).count();
            assert_eq!(wins, 1);
            assert_eq!(registry.subscription_count(1), 1);
            assert_eq!(registry.channel_count(), 1);
        }
    }

    #[test]
    fn concurrent_logins_bind_username_once() {
        let registry = Arc::new(ConnectionRegistry::new());
        for id in 1..=8 {
            registry.register(id, Arc::new(RecordingHandle::default()));
        }
        let barrier = Arc::new(Barrier::new(8));

        let workers: Vec<_> = (1..=8)
            .map(|id| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    matches!(registry.login(id, "bob", "pw"), Ok(LoginResult::Registered | LoginResult::LoggedIn))
                })
            })
            .collect();

        let wins = workers.into_iter().map(|w| w.join().unwrap_or(false)).filter(|&won| won).count();
        assert_eq!(wins, 1);
    }
}
