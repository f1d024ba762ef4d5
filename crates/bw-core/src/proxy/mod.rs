//! Connection Dispatch Primitives
//!
//! Envelopes delivered by the tunnel transport, the bridge listener that
//! feeds them to stream servers, and the buffer pool that bounds per
//! session copy memory.

pub mod envelope;
pub mod listener;
pub mod pool;

pub use envelope::{BoxedIo, ConnectionEnvelope, ExtraInfo, TransportMeta, TunnelIo};
pub use listener::{BackpressurePolicy, BridgeListener, DEFAULT_QUEUE_CAPACITY};
pub use pool::{BufferLease, BufferPool, DEFAULT_BUFFER_SIZE, MIN_BUFFER_SIZE};
