//! Reliable byte streams over an anonymizing tunnel overlay
//!
//! This crate is the per-stream engine of a TCP-like transport running over a
//! high-latency, lossy, multi-path overlay. It turns unordered, independently
//! routed datagrams into ordered, flow-controlled, congestion-controlled,
//! cryptographically authenticated bidirectional byte streams:
//!
//! - a connection state machine driven by datagram flags (SYN, CLOSE, RESET,
//!   ECHO, signatures, offline signatures)
//! - reordering with cumulative ACK plus a selective NACK list
//! - a dual congestion controller (delay-based and loss-based) with adaptive
//!   RTO, jitter-tracked EWMA RTT and rate pacing
//! - retransmission that alternates outbound-tunnel and remote-lease rotation
//!   to survive single-path failures
//! - a per-destination multiplexer with a bounded accept backlog and buffers
//!   for data that races ahead of its SYN
//!
//! # Architecture
//!
//! ```text
//! Application
//!     ↓
//! StreamingDestination (demultiplexing, accept queue)
//!     ↓
//! Stream (reliability, congestion control, signing)
//!     ↓
//! Owner / TunnelPool / RoutingSession (tunnel overlay, out of scope)
//! ```
//!
//! The overlay itself — tunnel construction, lease-set lookup, garlic session
//! management — stays behind the [`routing::Owner`] contract.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use garlic_stream::{StreamingDestination, StreamingConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     // owner wraps the surrounding router runtime
//!     let destination = StreamingDestination::new(owner, 0, false);
//!
//!     // dial out
//!     let stream = destination.create_new_outgoing_stream(remote_lease_set, 80);
//!     stream.send(b"hello").await.unwrap();
//!
//!     // accept an incoming stream
//!     let incoming = destination.accept_stream(Duration::from_secs(30)).await.unwrap();
//!     let mut buf = vec![0u8; 1024];
//!     let n = incoming.receive(&mut buf, Duration::from_secs(30)).await;
//! }
//! ```

pub mod destination;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod routing;
pub mod send_buffer;
pub mod stream;

mod pool;
mod timer;

#[cfg(test)]
mod testutil;

// Re-export main types
pub use destination::{
    Acceptor, StreamingDestination, MAX_PENDING_INCOMING_BACKLOG, PENDING_INCOMING_TIMEOUT,
};
pub use error::{Error, Result};
pub use identity::{IdentHash, Identity, PrivateKeys, SigType, TransientVerifier};
pub use protocol::{Packet, PacketBuilder, MAX_PACKET_SIZE, STREAMING_MTU, STREAMING_MTU_RATCHETS};
pub use routing::{
    Lease, LeaseSet, OutboundTunnel, Owner, RoutingPath, RoutingSession, StreamingConfig,
    TunnelMessageBlock, TunnelPool,
};
pub use send_buffer::{SendBuffer, SendBufferQueue, SendHandler};
pub use stream::{Stream, StreamStatus};
