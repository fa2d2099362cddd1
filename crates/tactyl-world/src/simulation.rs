//! Common simulation loop driver.
//!
//! Each simulation runs on a dedicated worker thread:
//!
//! ```text
//! initialize()
//! while !done:
//!     drain incoming queue (blocking, deadline = next tick)
//!     step()
//! shutdown()
//! ```
//!
//! Self-timed simulations pace themselves by blocking on the queue with a
//! timeout equal to the remaining time to the next tick; a simulation whose
//! device provides its own pacing opts out and drains without sleeping.
//! Running past a deadline counts a missed tick and resynchronizes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, info};

use tactyl_core::error::{SceneError, SimError, SimResult};
use tactyl_core::osc::OscMessage;
use tactyl_core::value::{SimSet, SimTag};

use crate::bus::{BusCounters, Envelope, Origin, Router, SimMessage};
use crate::scene::{Scene, SceneChange};

// ============================================================================
// Context
// ============================================================================

/// Handle to the bus given to a simulation while it runs.
pub struct SimContext {
    /// This simulation's tag.
    pub tag: SimTag,
    /// The cross-simulation router.
    pub router: Arc<Router>,
    counters: Arc<BusCounters>,
}

impl SimContext {
    /// Create a context for a simulation.
    #[must_use]
    pub fn new(tag: SimTag, router: Arc<Router>) -> Self {
        let counters = router.counters();
        Self {
            tag,
            router,
            counters,
        }
    }

    /// Shared counters.
    #[must_use]
    pub fn counters(&self) -> &BusCounters {
        &self.counters
    }

    /// Send a message to one other simulation.
    pub fn sendto(&self, target: SimTag, wait: bool, msg: OscMessage) -> bool {
        self.router.sendto(target, wait, msg, Origin::Bus)
    }

    /// Send a message to a set of simulations.
    pub fn sendtotype(&self, set: SimSet, wait: bool, msg: &OscMessage) {
        self.router.sendtotype(set, wait, msg, Origin::Bus);
    }

    /// Re-broadcast a network-origin message to every other simulation.
    pub fn broadcast_others(&self, msg: &OscMessage) {
        self.router
            .sendtotype(SimSet::all_except(self.tag), false, msg, Origin::Bus);
    }

    /// Emit an event to the outbound peer.
    pub fn emit(&self, msg: &OscMessage) {
        self.router.emit(msg);
    }

    /// Report a failed request.
    pub fn diagnostic(&self, path: &str, reason: &str) {
        self.router.diagnostic(path, reason);
    }
}

/// Route an envelope into a scene and handle forwarding and errors.
///
/// Network-origin messages that dispatched successfully are re-broadcast to
/// the other simulations so every replica stays in step; bus-origin messages
/// are never re-forwarded. Protocol errors are counted and dropped;
/// invariant violations fail the request with a diagnostic to the peer.
pub fn route(scene: &mut Scene, ctx: &SimContext, env: &Envelope) -> Vec<SceneChange> {
    match scene.dispatch(&env.msg) {
        Ok(changes) => {
            if env.origin == Origin::Network {
                ctx.broadcast_others(&env.msg);
            }
            changes
        }
        Err(SceneError::UnknownPath(_) | SceneError::BadTypeTag { .. }) => {
            ctx.counters().count_protocol_error();
            debug!("[{}] dropped {}", ctx.tag.as_str(), env.msg.address);
            Vec::new()
        }
        // A bus-origin update can race an object's destruction; that is not
        // an error worth reporting.
        Err(SceneError::NoSuchObject(_)) if env.origin == Origin::Bus => Vec::new(),
        Err(e) => {
            ctx.diagnostic(&env.msg.address, &e.to_string());
            Vec::new()
        }
    }
}

// ============================================================================
// Simulation Trait
// ============================================================================

/// One simulation loop.
pub trait Simulation: Send + 'static {
    /// Which simulation this is.
    fn tag(&self) -> SimTag;

    /// Target timestep.
    fn timestep(&self) -> Duration;

    /// Whether the loop paces itself. A device-paced loop returns false.
    fn self_timed(&self) -> bool {
        true
    }

    /// One-time setup on the worker thread. Returning false aborts the
    /// loop (the other simulations keep running).
    fn initialize(&mut self, _ctx: &SimContext) -> bool {
        true
    }

    /// Handle one queued message on the worker thread.
    fn dispatch(&mut self, ctx: &SimContext, env: &Envelope);

    /// Advance one tick.
    fn step(&mut self, ctx: &SimContext);

    /// Whether the loop has decided to stop itself (e.g. device failure).
    fn is_done(&self) -> bool {
        false
    }

    /// Teardown on the worker thread after the loop exits.
    fn shutdown(&mut self, _ctx: &SimContext) {}
}

// ============================================================================
// Runner
// ============================================================================

/// Spawns simulation workers.
pub struct SimRunner;

impl SimRunner {
    /// Spawn a simulation on its own worker thread, registering its queue
    /// with the router.
    pub fn spawn<S: Simulation>(
        mut sim: S,
        router: &Arc<Router>,
        capacity: usize,
    ) -> SimResult<SimHandle> {
        let tag = sim.tag();
        let (tx, rx) = bounded(capacity);
        let running = Arc::new(AtomicBool::new(true));

        router.register(tag, tx.clone(), Arc::clone(&running));

        let worker_router = Arc::clone(router);
        let worker_running = Arc::clone(&running);

        let worker = std::thread::Builder::new()
            .name(format!("sim-{}", tag.as_str()))
            .spawn(move || {
                let ctx = SimContext::new(tag, Arc::clone(&worker_router));

                if sim.initialize(&ctx) {
                    info!("[{}] started ({:?} timestep)", tag.as_str(), sim.timestep());
                    Self::run(&mut sim, &ctx, &rx);
                } else {
                    info!("[{}] failed to initialize; loop not started", tag.as_str());
                }

                worker_running.store(false, Ordering::Relaxed);
                worker_router.unregister(tag);

                // Discard anything still queued; dropping the ack sender
                // unblocks any waiting producer.
                while rx.try_recv().is_ok() {}

                sim.shutdown(&ctx);
                info!("[{}] stopped", tag.as_str());
            })
            .map_err(SimError::Spawn)?;

        Ok(SimHandle {
            tag,
            tx,
            running,
            worker: Some(worker),
        })
    }

    fn run<S: Simulation>(
        sim: &mut S,
        ctx: &SimContext,
        rx: &crossbeam_channel::Receiver<SimMessage>,
    ) {
        let dt = sim.timestep();
        let mut next = Instant::now() + dt;
        let mut done = false;

        while !done {
            if sim.self_timed() {
                loop {
                    let now = Instant::now();
                    if now >= next {
                        break;
                    }
                    match rx.recv_timeout(next - now) {
                        Ok(msg) => {
                            if Self::handle(sim, ctx, msg) {
                                done = true;
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => {
                            done = true;
                            break;
                        }
                    }
                }
            } else {
                while let Ok(msg) = rx.try_recv() {
                    if Self::handle(sim, ctx, msg) {
                        done = true;
                        break;
                    }
                }
            }

            if done {
                break;
            }

            sim.step(ctx);

            if sim.is_done() {
                break;
            }

            next += dt;
            let now = Instant::now();
            if sim.self_timed() && now > next {
                ctx.counters().count_missed_tick();
                next = now + dt;
            }
        }
    }

    /// Dispatch one message; returns true when the loop should stop.
    fn handle<S: Simulation>(sim: &mut S, ctx: &SimContext, msg: SimMessage) -> bool {
        match msg {
            SimMessage::Stop => true,
            SimMessage::Osc(env) => {
                sim.dispatch(ctx, &env);
                if let Some(ack) = &env.ack {
                    let _ = ack.send(());
                }
                false
            }
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Owner-side handle to a running simulation.
pub struct SimHandle {
    tag: SimTag,
    tx: Sender<SimMessage>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SimHandle {
    /// This simulation's tag.
    #[must_use]
    pub fn tag(&self) -> SimTag {
        self.tag
    }

    /// Whether the worker is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the worker and wait for it to exit.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let _ = self.tx.send(SimMessage::Stop);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Minimal simulation that records dispatched addresses and tick count.
    struct Probe {
        tag: SimTag,
        addresses: Arc<Mutex<Vec<String>>>,
        ticks: Arc<Mutex<u64>>,
    }

    impl Simulation for Probe {
        fn tag(&self) -> SimTag {
            self.tag
        }

        fn timestep(&self) -> Duration {
            Duration::from_millis(1)
        }

        fn dispatch(&mut self, _ctx: &SimContext, env: &Envelope) {
            self.addresses.lock().unwrap().push(env.msg.address.clone());
        }

        fn step(&mut self, _ctx: &SimContext) {
            *self.ticks.lock().unwrap() += 1;
        }
    }

    #[test]
    fn test_lifecycle_and_ticking() {
        let router = Router::new(None);
        let ticks = Arc::new(Mutex::new(0));
        let probe = Probe {
            tag: SimTag::Physics,
            addresses: Arc::new(Mutex::new(Vec::new())),
            ticks: Arc::clone(&ticks),
        };

        let handle = SimRunner::spawn(probe, &router, 64).unwrap();
        assert!(handle.is_running());
        assert!(router.is_running(SimTag::Physics));

        std::thread::sleep(Duration::from_millis(50));
        handle.stop();

        assert!(!router.is_running(SimTag::Physics));
        assert!(*ticks.lock().unwrap() > 10);
    }

    #[test]
    fn test_messages_arrive_in_send_order() {
        let router = Router::new(None);
        let addresses = Arc::new(Mutex::new(Vec::new()));
        let probe = Probe {
            tag: SimTag::Physics,
            addresses: Arc::clone(&addresses),
            ticks: Arc::new(Mutex::new(0)),
        };

        let handle = SimRunner::spawn(probe, &router, 256).unwrap();

        for i in 0..100 {
            router.sendto(
                SimTag::Physics,
                false,
                OscMessage::floats(&format!("/world/s{i}/position"), &[0.0, 0.0, 0.0]),
                Origin::Network,
            );
        }

        std::thread::sleep(Duration::from_millis(100));
        handle.stop();

        let seen = addresses.lock().unwrap();
        assert_eq!(seen.len(), 100);
        for (i, addr) in seen.iter().enumerate() {
            assert_eq!(addr, &format!("/world/s{i}/position"));
        }
    }

    #[test]
    fn test_route_broadcasts_network_origin_only() {
        let router = Router::new(None);
        let (haptics_tx, haptics_rx) = bounded(16);
        router.register(SimTag::Haptics, haptics_tx, Arc::new(AtomicBool::new(true)));

        let ctx = SimContext::new(SimTag::Physics, Arc::clone(&router));
        let mut scene = Scene::new(SimTag::Physics);

        let create = OscMessage::new(
            "/world/sphere/create",
            vec![
                tactyl_core::osc::OscArg::from("s1"),
                tactyl_core::osc::OscArg::Float(0.0),
                tactyl_core::osc::OscArg::Float(0.0),
                tactyl_core::osc::OscArg::Float(0.0),
            ],
        );

        // Network origin: forwarded.
        let changes = route(
            &mut scene,
            &ctx,
            &Envelope::new(create.clone(), Origin::Network),
        );
        assert_eq!(changes.len(), 1);
        assert!(haptics_rx.try_recv().is_ok());

        // Bus origin: applied locally, not re-forwarded.
        let update = OscMessage::floats("/world/s1/position", &[0.0, 0.0, 0.5]);
        let changes = route(&mut scene, &ctx, &Envelope::new(update, Origin::Bus));
        assert_eq!(changes.len(), 1);
        assert!(haptics_rx.try_recv().is_err());
    }

    #[test]
    fn test_route_counts_protocol_errors() {
        let router = Router::new(None);
        let ctx = SimContext::new(SimTag::Physics, Arc::clone(&router));
        let mut scene = Scene::new(SimTag::Physics);

        let msg = OscMessage::new("/nonsense", vec![]);
        let changes = route(&mut scene, &ctx, &Envelope::new(msg, Origin::Network));
        assert!(changes.is_empty());
        assert_eq!(
            router
                .counters()
                .protocol_errors
                .load(Ordering::Relaxed),
            1
        );
    }
}
