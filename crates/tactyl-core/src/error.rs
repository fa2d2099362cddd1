//! Error types shared across the Tactyl workspace.

use thiserror::Error;

// ============================================================================
// OSC Transport Errors
// ============================================================================

/// Errors from the OSC transport layer.
#[derive(Debug, Error)]
pub enum OscError {
    /// Network I/O error
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// OSC encoding error
    #[error("OSC encoding error: {0}")]
    Encoding(String),

    /// OSC decoding error
    #[error("OSC decoding error: {0}")]
    Decoding(String),

    /// Invalid address pattern
    #[error("Invalid OSC address: {0}")]
    InvalidAddress(String),

    /// Argument missing or of the wrong type
    #[error("Bad argument {index} for {address}: expected {expected}")]
    BadArgument {
        /// Address of the offending message
        address: String,
        /// Zero-based argument index
        index: usize,
        /// Expected type tag
        expected: &'static str,
    },
}

/// Result type for OSC operations.
pub type OscResult<T> = Result<T, OscError>;

// ============================================================================
// Scene Errors
// ============================================================================

/// Errors raised while mutating the scene model.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SceneError {
    /// An object or constraint with this name already exists
    #[error("Name already in use: {0}")]
    DuplicateName(String),

    /// No object with this name
    #[error("No such object: {0}")]
    NoSuchObject(String),

    /// No constraint with this name
    #[error("No such constraint: {0}")]
    NoSuchConstraint(String),

    /// A composite child was addressed to a non-composite parent
    #[error("Parent of {child} is not a composite: {parent}")]
    ParentNotComposite {
        /// Parent object name
        parent: String,
        /// Child name as requested
        child: String,
    },

    /// A referenced file could not be found
    #[error("Missing file: {0}")]
    MissingFile(String),

    /// A mesh file existed but could not be parsed
    #[error("Unreadable mesh {path}: {reason}")]
    UnreadableMesh {
        /// Path of the mesh file
        path: String,
        /// Loader diagnostic
        reason: String,
    },

    /// The message path did not name any known verb
    #[error("Unknown path: {0}")]
    UnknownPath(String),

    /// The type tag did not match any overload of the verb
    #[error("Bad type tag {typetag} for {path}")]
    BadTypeTag {
        /// Message path
        path: String,
        /// Received type tag
        typetag: String,
    },

    /// A response verb that is accepted but not implemented
    #[error("Response {0} is not implemented")]
    UnimplementedResponse(String),
}

/// Result type for scene operations.
pub type SceneResult<T> = Result<T, SceneError>;

// ============================================================================
// Simulation Errors
// ============================================================================

/// Errors raised while starting or running a simulation loop.
#[derive(Debug, Error)]
pub enum SimError {
    /// An OSC endpoint could not be bound
    #[error("Failed to bind {endpoint}: {source}")]
    Bind {
        /// Requested bind address
        endpoint: String,
        /// Underlying socket error
        source: std::io::Error,
    },

    /// The haptic device could not be opened
    #[error("Haptic device unavailable: {0}")]
    Device(String),

    /// The physics world could not be constructed
    #[error("Failed to construct physics world: {0}")]
    World(String),

    /// The worker thread could not be spawned
    #[error("Failed to spawn worker: {0}")]
    Spawn(std::io::Error),
}

/// Result type for simulation lifecycle operations.
pub type SimResult<T> = Result<T, SimError>;
