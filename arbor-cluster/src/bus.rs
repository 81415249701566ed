//! In-process cluster bus.
//!
//! Nodes [`join`](InMemoryClusterBus::join) the bus and get a
//! [`BusTransport`] for sending. A node that wants to receive attaches a
//! [`ClusterListener`]; the bus then runs one dispatcher thread for that
//! node which delivers role changes and inbound messages in order.
//!
//! Messages travel as encoded wire bytes and are decoded on the receiving
//! side, so a bus exercises the same codec a networked transport would.
//! Sending never waits for the receiver: a node can broadcast while holding
//! path locks that a peer's handler is about to request.

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arbor_core::ClusterError;

use crate::message::{decode, encode};
use crate::{ClusterListener, ClusterMessage, ClusterRole, ClusterTransport, MessageType};

enum Envelope {
    Message(Vec<u8>),
    Role(ClusterRole),
}

#[derive(Default)]
struct NodeSlot {
    subscriptions: HashSet<MessageType>,
    role: Option<ClusterRole>,
    sender: Option<Sender<Envelope>>,
    worker: Option<JoinHandle<()>>,
}

/// Count of envelopes handed to dispatchers but not yet handled.
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
}

/// Loopback cluster connecting nodes in one process.
pub struct InMemoryClusterBus {
    nodes: Mutex<HashMap<String, NodeSlot>>,
    pending: Arc<Pending>,
    sent: AtomicU64,
    delivered: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl InMemoryClusterBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
            pending: Arc::new(Pending::default()),
            sent: AtomicU64::new(0),
            delivered: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    fn nodes(&self) -> Result<MutexGuard<'_, HashMap<String, NodeSlot>>, ClusterError> {
        self.nodes.lock().map_err(|_| ClusterError::Poisoned)
    }

    /// Register `node_id` and return its sending half. Joining twice hands
    /// out another transport for the same node.
    pub fn join(
        self: &Arc<Self>,
        node_id: impl Into<String>,
    ) -> Result<Arc<BusTransport>, ClusterError> {
        let node_id = node_id.into();
        self.nodes()?.entry(node_id.clone()).or_default();
        tracing::debug!(node_id = %node_id, "Node joined cluster bus");
        Ok(Arc::new(BusTransport {
            bus: Arc::downgrade(self),
            node_id,
        }))
    }

    /// Start delivering to `listener` on a dedicated thread. A role assigned
    /// before attaching is delivered first.
    pub fn attach(
        &self,
        node_id: &str,
        listener: Arc<dyn ClusterListener>,
    ) -> Result<(), ClusterError> {
        let (tx, rx) = mpsc::channel::<Envelope>();
        let pending = Arc::clone(&self.pending);
        let delivered = Arc::clone(&self.delivered);
        let dropped = Arc::clone(&self.dropped);
        let name = node_id.to_string();

        let worker = thread::Builder::new()
            .name(format!("cluster-{}", node_id))
            .spawn(move || {
                for envelope in rx {
                    // A panicking listener loses this envelope, not the dispatcher.
                    let handled = panic::catch_unwind(AssertUnwindSafe(|| match envelope {
                        Envelope::Role(role) => listener.role_changed(role),
                        Envelope::Message(bytes) => match decode(&bytes) {
                            Ok(message) => {
                                listener.cluster_message(message);
                                delivered.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                tracing::warn!(node_id = %name, error = %e, "Dropping undecodable cluster message");
                            }
                        },
                    }));
                    if handled.is_err() {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(node_id = %name, "Cluster listener panicked");
                    }
                    pending.done();
                }
            })
            .map_err(|_| ClusterError::Disconnected {
                node_id: node_id.to_string(),
            })?;

        let previous = {
            let mut nodes = self.nodes()?;
            let slot = nodes.entry(node_id.to_string()).or_default();
            if let Some(role) = slot.role {
                self.pending.add();
                if tx.send(Envelope::Role(role)).is_err() {
                    self.pending.done();
                }
            }
            slot.sender = Some(tx);
            slot.worker.replace(worker)
        };
        // A replaced dispatcher drains what it already has and exits once
        // its sender is gone.
        drop(previous);
        Ok(())
    }

    /// Stop delivering to `node_id` and wait for its dispatcher to finish
    /// what it has already received.
    pub fn detach(&self, node_id: &str) -> Result<(), ClusterError> {
        let worker = {
            let mut nodes = self.nodes()?;
            match nodes.get_mut(node_id) {
                Some(slot) => {
                    slot.sender = None;
                    slot.worker.take()
                }
                None => None,
            }
        };
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                tracing::warn!(node_id = %node_id, "Cluster dispatcher panicked");
            }
        }
        Ok(())
    }

    /// Assign a role to `node_id` and notify its listener.
    pub fn set_role(&self, node_id: &str, role: ClusterRole) -> Result<(), ClusterError> {
        let mut nodes = self.nodes()?;
        let slot = nodes
            .get_mut(node_id)
            .ok_or_else(|| ClusterError::Disconnected {
                node_id: node_id.to_string(),
            })?;
        slot.role = Some(role);
        if let Some(sender) = &slot.sender {
            self.pending.add();
            if sender.send(Envelope::Role(role)).is_err() {
                self.pending.done();
            }
        }
        tracing::info!(node_id = %node_id, role = %role, "Cluster role assigned");
        Ok(())
    }

    pub fn role(&self, node_id: &str) -> Option<ClusterRole> {
        self.nodes().ok()?.get(node_id)?.role
    }

    /// Block until every dispatched envelope has been handled, or `timeout`
    /// passes. Returns whether the bus went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self
            .pending
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = self
                .pending
                .idle
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn subscribe(&self, node_id: &str, message_type: MessageType) -> Result<(), ClusterError> {
        self.nodes()?
            .get_mut(node_id)
            .ok_or_else(|| ClusterError::Disconnected {
                node_id: node_id.to_string(),
            })?
            .subscriptions
            .insert(message_type);
        Ok(())
    }

    fn broadcast(&self, origin: &str, message: &ClusterMessage) -> Result<(), ClusterError> {
        let bytes = encode(message)?;
        let message_type = message.message_type();
        let nodes = self.nodes()?;
        if !nodes.contains_key(origin) {
            return Err(ClusterError::Disconnected {
                node_id: origin.to_string(),
            });
        }
        self.sent.fetch_add(1, Ordering::Relaxed);

        for (node_id, slot) in nodes.iter() {
            if node_id == origin || !slot.subscriptions.contains(&message_type) {
                continue;
            }
            let Some(sender) = &slot.sender else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            self.pending.add();
            if sender.send(Envelope::Message(bytes.clone())).is_err() {
                self.pending.done();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(node_id = %node_id, "Dispatcher gone, message dropped");
            }
        }
        Ok(())
    }
}

impl Drop for InMemoryClusterBus {
    fn drop(&mut self) {
        // Dropping the senders ends every dispatcher loop.
        let nodes = self.nodes.get_mut().unwrap_or_else(PoisonError::into_inner);
        for slot in nodes.values_mut() {
            slot.sender = None;
        }
    }
}

/// Sending half of one node's connection to an [`InMemoryClusterBus`].
pub struct BusTransport {
    bus: Weak<InMemoryClusterBus>,
    node_id: String,
}

impl BusTransport {
    fn bus(&self) -> Result<Arc<InMemoryClusterBus>, ClusterError> {
        self.bus.upgrade().ok_or_else(|| ClusterError::Disconnected {
            node_id: self.node_id.clone(),
        })
    }
}

impl ClusterTransport for BusTransport {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn subscribe(&self, message_type: MessageType) -> Result<(), ClusterError> {
        self.bus()?.subscribe(&self.node_id, message_type)
    }

    fn cluster_message(&self, message: ClusterMessage) -> Result<(), ClusterError> {
        self.bus()?.broadcast(&self.node_id, &message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FlushMessage;
    use arbor_core::RepoPath;

    #[derive(Default)]
    struct Recorder {
        roles: Mutex<Vec<ClusterRole>>,
        messages: Mutex<Vec<ClusterMessage>>,
    }

    impl ClusterListener for Recorder {
        fn role_changed(&self, role: ClusterRole) {
            self.roles.lock().unwrap().push(role);
        }

        fn cluster_message(&self, message: ClusterMessage) {
            self.messages.lock().unwrap().push(message);
        }
    }

    fn flush(origin: &str, path: &str) -> ClusterMessage {
        FlushMessage::new(origin, RepoPath::parse(path).unwrap(), false, "store").into()
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_broadcast_reaches_subscribed_peers_only() {
        let bus = InMemoryClusterBus::new();
        let a = bus.join("a").unwrap();
        let b = bus.join("b").unwrap();
        let c = bus.join("c").unwrap();
        let (ra, rb, rc) = (
            Arc::new(Recorder::default()),
            Arc::new(Recorder::default()),
            Arc::new(Recorder::default()),
        );
        bus.attach("a", ra.clone()).unwrap();
        bus.attach("b", rb.clone()).unwrap();
        bus.attach("c", rc.clone()).unwrap();
        a.subscribe(MessageType::Flush).unwrap();
        b.subscribe(MessageType::Flush).unwrap();
        drop(c);

        a.cluster_message(flush("a", "/x")).unwrap();
        assert!(bus.wait_idle(WAIT));

        assert!(ra.messages.lock().unwrap().is_empty());
        assert_eq!(rb.messages.lock().unwrap().len(), 1);
        assert!(rc.messages.lock().unwrap().is_empty());
        assert_eq!(bus.stats().delivered, 1);
    }

    #[test]
    fn test_messages_arrive_in_order() {
        let bus = InMemoryClusterBus::new();
        let a = bus.join("a").unwrap();
        let b = bus.join("b").unwrap();
        let rb = Arc::new(Recorder::default());
        bus.attach("b", rb.clone()).unwrap();
        b.subscribe(MessageType::Flush).unwrap();

        let paths = ["/1", "/2", "/3", "/4"];
        for path in paths {
            a.cluster_message(flush("a", path)).unwrap();
        }
        assert!(bus.wait_idle(WAIT));

        let received: Vec<String> = rb
            .messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| match m {
                ClusterMessage::Flush(f) => f.path.to_string(),
            })
            .collect();
        assert_eq!(received, paths);
    }

    #[test]
    fn test_role_set_before_attach_is_delivered() {
        let bus = InMemoryClusterBus::new();
        let _b = bus.join("b").unwrap();
        bus.set_role("b", ClusterRole::Replica).unwrap();
        let rb = Arc::new(Recorder::default());
        bus.attach("b", rb.clone()).unwrap();
        bus.set_role("b", ClusterRole::Primary).unwrap();
        assert!(bus.wait_idle(WAIT));
        assert_eq!(
            *rb.roles.lock().unwrap(),
            vec![ClusterRole::Replica, ClusterRole::Primary]
        );
        assert_eq!(bus.role("b"), Some(ClusterRole::Primary));
    }

    struct Fragile {
        calls: Mutex<usize>,
        survived: Mutex<Vec<ClusterMessage>>,
    }

    impl ClusterListener for Fragile {
        fn role_changed(&self, _role: ClusterRole) {}

        fn cluster_message(&self, message: ClusterMessage) {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if call == 1 {
                panic!("listener failed");
            }
            self.survived.lock().unwrap().push(message);
        }
    }

    #[test]
    fn test_panicking_listener_keeps_dispatcher_alive() {
        let bus = InMemoryClusterBus::new();
        let a = bus.join("a").unwrap();
        let b = bus.join("b").unwrap();
        let rb = Arc::new(Fragile {
            calls: Mutex::new(0),
            survived: Mutex::new(Vec::new()),
        });
        bus.attach("b", rb.clone()).unwrap();
        b.subscribe(MessageType::Flush).unwrap();

        a.cluster_message(flush("a", "/first")).unwrap();
        a.cluster_message(flush("a", "/second")).unwrap();
        assert!(bus.wait_idle(WAIT));

        assert_eq!(rb.survived.lock().unwrap().len(), 1);
        let stats = bus.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_unattached_subscriber_drops() {
        let bus = InMemoryClusterBus::new();
        let a = bus.join("a").unwrap();
        let b = bus.join("b").unwrap();
        b.subscribe(MessageType::Flush).unwrap();
        a.cluster_message(flush("a", "/x")).unwrap();
        assert_eq!(bus.stats().dropped, 1);
    }

    #[test]
    fn test_detach_stops_delivery() {
        let bus = InMemoryClusterBus::new();
        let a = bus.join("a").unwrap();
        let b = bus.join("b").unwrap();
        let rb = Arc::new(Recorder::default());
        bus.attach("b", rb.clone()).unwrap();
        b.subscribe(MessageType::Flush).unwrap();

        bus.detach("b").unwrap();
        a.cluster_message(flush("a", "/x")).unwrap();
        assert!(bus.wait_idle(WAIT));
        assert!(rb.messages.lock().unwrap().is_empty());
    }

    #[test]
    fn test_transport_outliving_bus_is_disconnected() {
        let bus = InMemoryClusterBus::new();
        let a = bus.join("a").unwrap();
        drop(bus);
        assert!(matches!(
            a.cluster_message(flush("a", "/x")),
            Err(ClusterError::Disconnected { .. })
        ));
    }
}
