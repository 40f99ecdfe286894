//! Error types for the client engine.
//!
//! One flat enum covers every failure the engine reports. A timed-out or
//! empty receive is deliberately NOT represented here: polling surfaces
//! return `Ok(None)` / `Ok(0)` for "nothing available".

use thiserror::Error;

/// Errors reported by the client engine.
///
/// These errors provide actionable messages for common failure modes when
/// talking to the broker. Transport-level failures are never retried
/// internally; the caller decides whether to `reconnect`.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied argument is unusable, for example an empty event
    /// list. Rejected before anything touches the transport.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The well-known service name is not registered with the directory.
    #[error("Service lookup failed: no endpoint registered as '{0}'. Is the broker running?")]
    LookupFailed(String),

    /// Local setup ran out of room: scheduler registration failed or an
    /// encoded frame exceeded the wire size cap.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The transport rejected an outgoing message.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The transport failed while receiving (channel torn down mid-wait).
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// The operation needs a channel this client does not currently hold.
    #[error("Not connected: {0}")]
    Disconnected(&'static str),

    /// An inbound frame was malformed, or a payload that must be JSON
    /// failed to parse.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A subscription callback returned an error during dispatch.
    #[error("Event callback failed: {0}")]
    CallbackFailed(String),
}
