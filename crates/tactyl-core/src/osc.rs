//! OSC message wrappers and UDP transport.
//!
//! Incoming control traffic arrives on one UDP endpoint per simulation;
//! outgoing events (collisions, force magnitude, diagnostics) flow to a
//! single configurable peer. Wire encoding is delegated to `rosc`; this
//! module wraps it with the small typed surface the rest of the workspace
//! uses.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rosc::{decoder, encoder, OscPacket, OscType};
use tracing::{debug, warn};

use crate::error::{OscError, OscResult};

// ============================================================================
// Message Types
// ============================================================================

/// OSC argument types.
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    /// Float value
    Float(f32),
    /// Integer value
    Int(i32),
    /// String value
    String(String),
    /// Boolean value
    Bool(bool),
    /// Blob (binary data)
    Blob(Vec<u8>),
    /// Double precision float
    Double(f64),
    /// Long integer
    Long(i64),
}

impl From<f32> for OscArg {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<i32> for OscArg {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for OscArg {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for OscArg {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl OscArg {
    fn to_rosc_type(&self) -> OscType {
        match self {
            Self::Float(v) => OscType::Float(*v),
            Self::Int(v) => OscType::Int(*v),
            Self::String(v) => OscType::String(v.clone()),
            Self::Bool(v) => OscType::Bool(*v),
            Self::Blob(v) => OscType::Blob(v.clone()),
            Self::Double(v) => OscType::Double(*v),
            Self::Long(v) => OscType::Long(*v),
        }
    }

    fn from_rosc_type(arg: &OscType) -> Option<Self> {
        match arg {
            OscType::Float(v) => Some(Self::Float(*v)),
            OscType::Int(v) => Some(Self::Int(*v)),
            OscType::String(v) => Some(Self::String(v.clone())),
            OscType::Bool(v) => Some(Self::Bool(*v)),
            OscType::Blob(v) => Some(Self::Blob(v.clone())),
            OscType::Double(v) => Some(Self::Double(*v)),
            OscType::Long(v) => Some(Self::Long(*v)),
            _ => None,
        }
    }

    /// Single-character type tag.
    #[must_use]
    pub fn tag(&self) -> char {
        match self {
            Self::Float(_) => 'f',
            Self::Int(_) => 'i',
            Self::String(_) => 's',
            Self::Bool(_) => 'T',
            Self::Blob(_) => 'b',
            Self::Double(_) => 'd',
            Self::Long(_) => 'h',
        }
    }
}

/// An OSC message: address pattern plus arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    /// OSC address pattern
    pub address: String,
    /// Message arguments
    pub args: Vec<OscArg>,
}

impl OscMessage {
    /// Create a message.
    #[must_use]
    pub fn new(address: impl Into<String>, args: Vec<OscArg>) -> Self {
        Self {
            address: address.into(),
            args,
        }
    }

    /// Create a message carrying only floats.
    #[must_use]
    pub fn floats(address: impl Into<String>, values: &[f32]) -> Self {
        Self::new(
            address,
            values.iter().map(|&v| OscArg::Float(v)).collect(),
        )
    }

    /// Type tag string of the arguments (without the leading comma).
    #[must_use]
    pub fn typetag(&self) -> String {
        self.args.iter().map(OscArg::tag).collect()
    }

    /// Float argument at `index`; integers are widened.
    pub fn float(&self, index: usize) -> OscResult<f32> {
        match self.args.get(index) {
            Some(OscArg::Float(v)) => Ok(*v),
            Some(OscArg::Double(v)) => Ok(*v as f32),
            Some(OscArg::Int(v)) => Ok(*v as f32),
            _ => Err(self.bad_argument(index, "f")),
        }
    }

    /// Integer argument at `index`.
    pub fn int(&self, index: usize) -> OscResult<i32> {
        match self.args.get(index) {
            Some(OscArg::Int(v)) => Ok(*v),
            Some(OscArg::Long(v)) => Ok(*v as i32),
            _ => Err(self.bad_argument(index, "i")),
        }
    }

    /// String argument at `index`.
    pub fn string(&self, index: usize) -> OscResult<&str> {
        match self.args.get(index) {
            Some(OscArg::String(v)) => Ok(v),
            _ => Err(self.bad_argument(index, "s")),
        }
    }

    /// Three consecutive float arguments starting at `index`.
    pub fn vec3(&self, index: usize) -> OscResult<[f32; 3]> {
        Ok([
            self.float(index)?,
            self.float(index + 1)?,
            self.float(index + 2)?,
        ])
    }

    fn bad_argument(&self, index: usize, expected: &'static str) -> OscError {
        OscError::BadArgument {
            address: self.address.clone(),
            index,
            expected,
        }
    }
}

fn convert_message(msg: &rosc::OscMessage) -> OscMessage {
    let args = msg
        .args
        .iter()
        .filter_map(OscArg::from_rosc_type)
        .collect();

    OscMessage {
        address: msg.addr.clone(),
        args,
    }
}

fn flatten_packet(packet: OscPacket, out: &mut Vec<OscMessage>) {
    match packet {
        OscPacket::Message(msg) => out.push(convert_message(&msg)),
        OscPacket::Bundle(bundle) => {
            for content in bundle.content {
                flatten_packet(content, out);
            }
        }
    }
}

// ============================================================================
// Sender
// ============================================================================

/// OSC sender for outgoing events.
pub struct OscSender {
    socket: UdpSocket,
    target: SocketAddr,
}

impl OscSender {
    /// Create a sender bound to an ephemeral local port.
    ///
    /// # Arguments
    ///
    /// * `target` - Target address (e.g., "127.0.0.1:7770")
    pub fn new(target: &str) -> OscResult<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        let target: SocketAddr = target
            .parse()
            .map_err(|_| OscError::InvalidAddress(format!("Invalid target address: {target}")))?;

        Ok(Self { socket, target })
    }

    /// Send a message.
    pub fn send(&self, message: &OscMessage) -> OscResult<()> {
        let msg = rosc::OscMessage {
            addr: message.address.clone(),
            args: message.args.iter().map(OscArg::to_rosc_type).collect(),
        };

        let packet = OscPacket::Message(msg);
        let bytes =
            encoder::encode(&packet).map_err(|e| OscError::Encoding(format!("{e:?}")))?;

        self.socket.send_to(&bytes, self.target)?;
        Ok(())
    }

    /// Send, logging instead of propagating failures. Event emission must
    /// never stall a simulation loop.
    pub fn send_lossy(&self, message: &OscMessage) {
        if let Err(e) = self.send(message) {
            debug!("Dropped outgoing event {}: {}", message.address, e);
        }
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Poll granularity for the listener's shutdown flag.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// A UDP endpoint with a dedicated network thread.
///
/// Decoded messages are handed to the callback in arrival order; the
/// callback must not block (it forwards into a simulation queue). Malformed
/// packets are counted and dropped.
pub struct OscListener {
    local_addr: SocketAddr,
    malformed: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl OscListener {
    /// Bind `addr` and start the network thread.
    ///
    /// # Arguments
    ///
    /// * `addr` - Local address to bind (e.g., "0.0.0.0:7774")
    /// * `on_message` - Called for each decoded message
    pub fn bind<F>(addr: &str, on_message: F) -> OscResult<Self>
    where
        F: Fn(OscMessage) + Send + 'static,
    {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        let local_addr = socket.local_addr()?;

        let malformed = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_malformed = Arc::clone(&malformed);
        let thread_stop = Arc::clone(&stop);

        let worker = std::thread::Builder::new()
            .name(format!("osc-{}", local_addr.port()))
            .spawn(move || {
                Self::run(&socket, &thread_stop, &thread_malformed, on_message);
            })
            .map_err(OscError::Network)?;

        Ok(Self {
            local_addr,
            malformed,
            stop,
            worker: Some(worker),
        })
    }

    fn run<F>(socket: &UdpSocket, stop: &AtomicBool, malformed: &AtomicU64, on_message: F)
    where
        F: Fn(OscMessage),
    {
        let mut buffer = vec![0u8; 65_536];
        let mut messages = Vec::new();

        while !stop.load(Ordering::Relaxed) {
            let len = match socket.recv_from(&mut buffer) {
                Ok((len, _addr)) => len,
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    warn!("OSC receive error: {}", e);
                    continue;
                }
            };

            match decoder::decode_udp(&buffer[..len]) {
                Ok((_, packet)) => {
                    messages.clear();
                    flatten_packet(packet, &mut messages);
                    for msg in messages.drain(..) {
                        on_message(msg);
                    }
                }
                Err(e) => {
                    malformed.fetch_add(1, Ordering::Relaxed);
                    warn!("Malformed OSC packet dropped: {:?}", e);
                }
            }
        }
    }

    /// The address this listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of malformed packets dropped so far.
    #[must_use]
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Stop the network thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for OscListener {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
