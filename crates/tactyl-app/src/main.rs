//! Tactyl - OSC-controlled interactive dynamics simulator
//!
//! Binds one OSC endpoint per simulation, spawns the physics, haptics and
//! visual loops, and supervises their lifecycle until Ctrl-C.
//!
//! # Usage
//!
//! ```bash
//! # Run with the simulated haptic device and default ports
//! tactyl
//!
//! # Custom ports, gravity enabled
//! tactyl --physics-port 7774 --gravity 0,0,-9.81
//!
//! # Send events to a different peer
//! tactyl --peer 192.168.1.20:7770
//! ```

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use tactyl_core::config::SimConfig;
use tactyl_core::math::Vec3;
use tactyl_core::osc::{OscListener, OscMessage, OscSender};
use tactyl_core::value::SimTag;
use tactyl_haptics::device::{HapticDevice, SimulatedDevice};
use tactyl_haptics::HapticsSim;
use tactyl_physics::PhysicsSim;
use tactyl_world::bus::{Origin, Router};
use tactyl_world::simulation::{SimHandle, SimRunner};
use tactyl_world::VisualSim;

/// OSC-controlled interactive dynamics simulator
#[derive(Parser, Debug)]
#[command(name = "tactyl")]
#[command(author, version, about = "OSC-controlled dynamics simulator with haptic feedback", long_about = None)]
struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Bind address for incoming OSC
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// UDP port of the physics endpoint
    #[arg(long, default_value_t = tactyl_core::config::DEFAULT_PHYSICS_PORT)]
    physics_port: u16,

    /// UDP port of the haptics endpoint
    #[arg(long, default_value_t = tactyl_core::config::DEFAULT_HAPTICS_PORT)]
    haptics_port: u16,

    /// UDP port of the visual endpoint
    #[arg(long, default_value_t = tactyl_core::config::DEFAULT_VISUAL_PORT)]
    visual_port: u16,

    /// Peer address for outgoing events
    #[arg(long, default_value = tactyl_core::config::DEFAULT_PEER)]
    peer: String,

    /// Gravity vector, comma-separated (e.g. "0,0,-9.81")
    #[arg(long, default_value = "0,0,0")]
    gravity: String,

    /// Haptic device: currently only "simulate"
    #[arg(short, long, default_value = "simulate")]
    device: String,
}

/// Lifecycle commands decoded from `/…/enable` messages.
#[derive(Debug)]
enum Control {
    Enable(SimTag, bool),
}

fn parse_gravity(spec: &str) -> anyhow::Result<Vec3> {
    let parts: Vec<f32> = spec
        .split(',')
        .map(|p| p.trim().parse::<f32>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("invalid gravity vector: {spec}"))?;
    if parts.len() != 3 {
        bail!("gravity must have three components: {spec}");
    }
    Ok(Vec3::new(parts[0], parts[1], parts[2]))
}

/// Which lifecycle verb a message is, if any.
fn enable_target(address: &str) -> Option<SimTag> {
    match address {
        "/physics/enable" => Some(SimTag::Physics),
        "/haptics/enable" => Some(SimTag::Haptics),
        "/graphics/enable" => Some(SimTag::Visual),
        _ => None,
    }
}

struct Supervisor {
    config: SimConfig,
    gravity: Vec3,
    device_kind: String,
    router: Arc<Router>,
    handles: Vec<SimHandle>,
}

impl Supervisor {
    fn spawn_sim(&mut self, tag: SimTag) -> anyhow::Result<()> {
        if self.router.is_running(tag) {
            return Ok(());
        }

        let handle = match tag {
            SimTag::Physics => SimRunner::spawn(
                PhysicsSim::new(self.config.physics_timestep(), self.gravity),
                &self.router,
                self.config.queue_capacity,
            )?,
            SimTag::Haptics => {
                let device = self.open_device()?;
                SimRunner::spawn(
                    HapticsSim::new(
                        self.config.haptics_timestep(),
                        self.config.extra_force_ticks(),
                        device,
                    ),
                    &self.router,
                    self.config.queue_capacity,
                )?
            }
            SimTag::Visual => SimRunner::spawn(
                VisualSim::new(self.config.visual_timestep()),
                &self.router,
                self.config.queue_capacity,
            )?,
        };

        self.handles.push(handle);
        Ok(())
    }

    fn open_device(&self) -> anyhow::Result<Box<dyn HapticDevice>> {
        match self.device_kind.as_str() {
            "simulate" => {
                let (mut device, _probe) = SimulatedDevice::new();
                device
                    .open()
                    .map_err(|e| anyhow::anyhow!("failed to open haptic device: {e}"))?;
                Ok(Box::new(device))
            }
            other => bail!("unknown haptic device: {other}"),
        }
    }

    fn stop_sim(&mut self, tag: SimTag) {
        if let Some(index) = self.handles.iter().position(|h| h.tag() == tag) {
            let handle = self.handles.swap_remove(index);
            handle.stop();
            info!("[{}] disabled", tag.as_str());
        }
    }

    fn handle(&mut self, control: Control) {
        match control {
            Control::Enable(tag, true) => {
                if let Err(e) = self.spawn_sim(tag) {
                    warn!("could not enable {}: {}", tag.as_str(), e);
                }
            }
            Control::Enable(tag, false) => self.stop_sim(tag),
        }
    }

    fn shutdown(mut self) {
        for handle in self.handles.drain(..) {
            handle.stop();
        }
    }
}

fn bind_listener(
    config: &SimConfig,
    port: u16,
    tag: SimTag,
    router: &Arc<Router>,
    control_tx: &mpsc::Sender<Control>,
) -> anyhow::Result<OscListener> {
    let endpoint = config.endpoint(port);
    let router = Arc::clone(router);
    let control_tx = control_tx.clone();

    let listener = OscListener::bind(&endpoint, move |msg: OscMessage| {
        if let Some(target) = enable_target(&msg.address) {
            let on = msg.int(0).unwrap_or(1) != 0;
            let _ = control_tx.blocking_send(Control::Enable(target, on));
            return;
        }
        router.sendto(tag, false, msg, Origin::Network);
    })
    .with_context(|| format!("failed to bind OSC endpoint {endpoint}"))?;

    info!("[{}] listening on {}", tag.as_str(), listener.local_addr());
    Ok(listener)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Tactyl v{}", env!("CARGO_PKG_VERSION"));

    let gravity = parse_gravity(&cli.gravity)?;
    let config = SimConfig {
        bind_host: cli.bind,
        physics_port: cli.physics_port,
        haptics_port: cli.haptics_port,
        visual_port: cli.visual_port,
        peer: cli.peer,
        gravity: [gravity.x, gravity.y, gravity.z],
        ..Default::default()
    };

    let peer = OscSender::new(&config.peer)
        .with_context(|| format!("invalid peer address {}", config.peer))?;
    let router = Router::new(Some(peer));

    let mut supervisor = Supervisor {
        config: config.clone(),
        gravity,
        device_kind: cli.device,
        router: Arc::clone(&router),
        handles: Vec::new(),
    };

    // The visual mirror comes up first so the haptics loop can announce its
    // cursor to it during initialization.
    supervisor.spawn_sim(SimTag::Visual)?;
    supervisor.spawn_sim(SimTag::Physics)?;
    supervisor.spawn_sim(SimTag::Haptics)?;

    let (control_tx, mut control_rx) = mpsc::channel(64);
    let listeners = [
        bind_listener(&config, config.physics_port, SimTag::Physics, &router, &control_tx)?,
        bind_listener(&config, config.haptics_port, SimTag::Haptics, &router, &control_tx)?,
        bind_listener(&config, config.visual_port, SimTag::Visual, &router, &control_tx)?,
    ];

    info!("events flow to {}", config.peer);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!("signal handler failed: {}", e);
                    }
                    info!("shutting down");
                    break;
                }
                Some(control) = control_rx.recv() => {
                    supervisor.handle(control);
                }
            }
        }
    });

    for listener in listeners {
        listener.shutdown();
    }
    router.counters().log_summary();
    supervisor.shutdown();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gravity() {
        let g = parse_gravity("0,0,-9.81").unwrap();
        assert!((g.z + 9.81).abs() < 1e-6);
        assert!(parse_gravity("1,2").is_err());
        assert!(parse_gravity("a,b,c").is_err());
    }

    #[test]
    fn test_enable_targets() {
        assert_eq!(enable_target("/physics/enable"), Some(SimTag::Physics));
        assert_eq!(enable_target("/haptics/enable"), Some(SimTag::Haptics));
        assert_eq!(enable_target("/graphics/enable"), Some(SimTag::Visual));
        assert_eq!(enable_target("/world/s1/position"), None);
    }
}
