//! Inter-simulation message bus.
//!
//! One bounded multi-producer/single-consumer queue per simulation. Senders
//! choose between fire-and-forget delivery (`wait = false`, drops counted
//! when the queue is full) and consumed-acknowledged delivery (`wait = true`,
//! the call returns once the target thread has dispatched the message).
//! Ordering is FIFO per target; there is no ordering guarantee across
//! targets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_channel::{bounded, Sender, TrySendError};
use tracing::{info, warn};

use tactyl_core::osc::{OscArg, OscMessage, OscSender};
use tactyl_core::value::{SimSet, SimTag};

// ============================================================================
// Messages
// ============================================================================

/// Where a message entered the system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// Arrived on a UDP endpoint; may be re-broadcast to other simulations.
    Network,
    /// Sent by another simulation; applied locally, never re-forwarded.
    Bus,
}

/// An OSC message in flight to a simulation, with optional consumption ack.
#[derive(Debug)]
pub struct Envelope {
    /// The message.
    pub msg: OscMessage,
    /// Where the message entered the system.
    pub origin: Origin,
    /// Signalled by the runner after dispatch.
    pub(crate) ack: Option<Sender<()>>,
}

impl Envelope {
    /// Wrap a message without an acknowledgement channel.
    #[must_use]
    pub fn new(msg: OscMessage, origin: Origin) -> Self {
        Self {
            msg,
            origin,
            ack: None,
        }
    }
}

/// What a simulation queue carries.
#[derive(Debug)]
pub enum SimMessage {
    /// An OSC message to dispatch on the worker thread.
    Osc(Envelope),
    /// Stop the worker loop.
    Stop,
}

// ============================================================================
// Counters
// ============================================================================

/// Shared counters for dropped/erroneous traffic.
///
/// Readers tolerate relaxed ordering; these are diagnostics, not control
/// flow.
#[derive(Debug, Default)]
pub struct BusCounters {
    /// Messages dropped because a queue was full or a target not running.
    pub dropped: AtomicU64,
    /// Ticks a worker missed its deadline.
    pub missed_ticks: AtomicU64,
    /// Messages with an unknown path or mismatched type tag.
    pub protocol_errors: AtomicU64,
    /// Non-finite forces clamped to zero.
    pub nonfinite_forces: AtomicU64,
}

impl BusCounters {
    /// Increment the drop counter.
    pub fn count_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the missed-tick counter.
    pub fn count_missed_tick(&self) {
        self.missed_ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the protocol-error counter.
    pub fn count_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the non-finite-force counter.
    pub fn count_nonfinite_force(&self) {
        self.nonfinite_forces.fetch_add(1, Ordering::Relaxed);
    }

    /// Log a summary of all counters.
    pub fn log_summary(&self) {
        info!(
            dropped = self.dropped.load(Ordering::Relaxed),
            missed_ticks = self.missed_ticks.load(Ordering::Relaxed),
            protocol_errors = self.protocol_errors.load(Ordering::Relaxed),
            nonfinite_forces = self.nonfinite_forces.load(Ordering::Relaxed),
            "bus counters"
        );
    }
}

// ============================================================================
// Router
// ============================================================================

struct Port {
    tx: Sender<SimMessage>,
    running: Arc<AtomicBool>,
}

/// Routes messages between simulations and to the outbound event peer.
///
/// The port table is read-mostly; it only changes when a simulation is
/// started or stopped.
pub struct Router {
    ports: RwLock<HashMap<SimTag, Port>>,
    peer: Option<OscSender>,
    counters: Arc<BusCounters>,
}

impl Router {
    /// Create a router with an optional outbound event peer.
    #[must_use]
    pub fn new(peer: Option<OscSender>) -> Arc<Self> {
        Arc::new(Self {
            ports: RwLock::new(HashMap::new()),
            peer,
            counters: Arc::new(BusCounters::default()),
        })
    }

    /// Shared counters.
    #[must_use]
    pub fn counters(&self) -> Arc<BusCounters> {
        Arc::clone(&self.counters)
    }

    /// Register a simulation's queue. Called by the runner at spawn.
    pub fn register(&self, tag: SimTag, tx: Sender<SimMessage>, running: Arc<AtomicBool>) {
        if let Ok(mut ports) = self.ports.write() {
            ports.insert(tag, Port { tx, running });
        }
    }

    /// Remove a simulation's queue. Idempotent.
    pub fn unregister(&self, tag: SimTag) {
        if let Ok(mut ports) = self.ports.write() {
            ports.remove(&tag);
        }
    }

    /// Whether a simulation is currently running.
    #[must_use]
    pub fn is_running(&self, tag: SimTag) -> bool {
        self.ports
            .read()
            .ok()
            .and_then(|ports| {
                ports
                    .get(&tag)
                    .map(|p| p.running.load(Ordering::Relaxed))
            })
            .unwrap_or(false)
    }

    /// Send a message to one simulation.
    ///
    /// With `wait = true` the call blocks until the target thread has
    /// dispatched the message. With `wait = false` the message is dropped
    /// (and counted) if the queue is full. Returns whether the message was
    /// delivered.
    pub fn sendto(&self, target: SimTag, wait: bool, msg: OscMessage, origin: Origin) -> bool {
        let tx = {
            let Ok(ports) = self.ports.read() else {
                return false;
            };
            match ports.get(&target) {
                Some(port) if port.running.load(Ordering::Relaxed) => port.tx.clone(),
                _ => {
                    self.counters.count_drop();
                    return false;
                }
            }
        };

        if wait {
            let (ack_tx, ack_rx) = bounded(1);
            let envelope = Envelope {
                msg,
                origin,
                ack: Some(ack_tx),
            };
            if tx.send(SimMessage::Osc(envelope)).is_err() {
                self.counters.count_drop();
                return false;
            }
            // The ack sender is dropped unconsumed if the target shuts down
            // while the message is still queued.
            ack_rx.recv().is_ok()
        } else {
            match tx.try_send(SimMessage::Osc(Envelope::new(msg, origin))) {
                Ok(()) => true,
                Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                    self.counters.count_drop();
                    false
                }
            }
        }
    }

    /// Send a copy of a message to every running simulation in `set`.
    pub fn sendtotype(&self, set: SimSet, wait: bool, msg: &OscMessage, origin: Origin) {
        for tag in set.iter() {
            self.sendto(tag, wait, msg.clone(), origin);
        }
    }

    /// Emit an event to the outbound peer.
    pub fn emit(&self, msg: &OscMessage) {
        if let Some(peer) = &self.peer {
            peer.send_lossy(msg);
        }
    }

    /// Report a failed request to the peer and the log.
    pub fn diagnostic(&self, path: &str, reason: &str) {
        warn!("{}: {}", path, reason);
        self.emit(&OscMessage::new(
            "/world/error",
            vec![OscArg::from(path), OscArg::from(reason)],
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Receiver;

    fn register_test_port(router: &Router, tag: SimTag, capacity: usize) -> Receiver<SimMessage> {
        let (tx, rx) = bounded(capacity);
        router.register(tag, tx, Arc::new(AtomicBool::new(true)));
        rx
    }

    fn position_msg(z: f32) -> OscMessage {
        OscMessage::floats("/world/s1/position", &[0.0, 0.0, z])
    }

    #[test]
    fn test_fifo_per_target() {
        let router = Router::new(None);
        let rx = register_test_port(&router, SimTag::Physics, 64);

        for i in 0..10 {
            assert!(router.sendto(SimTag::Physics, false, position_msg(i as f32), Origin::Network));
        }

        for i in 0..10 {
            match rx.recv().unwrap() {
                SimMessage::Osc(env) => {
                    assert!((env.msg.float(2).unwrap() - i as f32).abs() < 1e-6);
                }
                SimMessage::Stop => panic!("unexpected stop"),
            }
        }
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let router = Router::new(None);
        let _rx = register_test_port(&router, SimTag::Physics, 2);

        assert!(router.sendto(SimTag::Physics, false, position_msg(0.0), Origin::Network));
        assert!(router.sendto(SimTag::Physics, false, position_msg(1.0), Origin::Network));
        assert!(!router.sendto(SimTag::Physics, false, position_msg(2.0), Origin::Network));
        assert_eq!(router.counters().dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_send_to_stopped_sim_drops() {
        let router = Router::new(None);
        let (tx, _rx) = bounded(4);
        let running = Arc::new(AtomicBool::new(false));
        router.register(SimTag::Haptics, tx, running);

        assert!(!router.sendto(SimTag::Haptics, false, position_msg(0.0), Origin::Network));
        assert_eq!(router.counters().dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_wait_blocks_until_consumed() {
        let router = Router::new(None);
        let rx = register_test_port(&router, SimTag::Physics, 4);

        let consumer = std::thread::spawn(move || {
            // Simulate the runner: dispatch then ack.
            if let Ok(SimMessage::Osc(env)) = rx.recv() {
                std::thread::sleep(std::time::Duration::from_millis(20));
                if let Some(ack) = &env.ack {
                    let _ = ack.send(());
                }
            }
        });

        let start = std::time::Instant::now();
        assert!(router.sendto(SimTag::Physics, true, position_msg(0.0), Origin::Bus));
        assert!(start.elapsed() >= std::time::Duration::from_millis(20));

        consumer.join().unwrap();
    }

    #[test]
    fn test_sendtotype_copies_to_members_only() {
        let router = Router::new(None);
        let physics_rx = register_test_port(&router, SimTag::Physics, 4);
        let haptics_rx = register_test_port(&router, SimTag::Haptics, 4);
        let visual_rx = register_test_port(&router, SimTag::Visual, 4);

        let set = SimSet::all_except(SimTag::Physics);
        router.sendtotype(set, false, &position_msg(0.5), Origin::Bus);

        assert!(physics_rx.try_recv().is_err());
        assert!(haptics_rx.try_recv().is_ok());
        assert!(visual_rx.try_recv().is_ok());
    }
}
