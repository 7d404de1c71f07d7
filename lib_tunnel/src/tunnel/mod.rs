//! # Tunnel Module
//!
//! The TLS-terminated HTTP/2 server that runs over the carrier, its request
//! dispatch (`CONNECT`, reverse tunnel, synthetic info hosts) and the read
//! helpers that reconcile HTTP/2 framing with an upstream TCP peer.

/// Batching reader for the upstream side of a `CONNECT` tunnel.
pub mod try_reader;

/// Flushing copy loops and the reverse-tunnel response scanner.
pub mod relay;

/// The tunneled HTTP/2 server and its retry loop.
pub mod server;

pub use server::TunnelServer;
pub use try_reader::TryReader;
