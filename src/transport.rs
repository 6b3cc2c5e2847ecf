//! External contracts: the mesh transport and the file sink.
//!
//! The engines never open sockets or touch the destination filesystem;
//! they speak to these two traits. Implementations must be `Send + Sync` —
//! engine handlers run on arbitrary threads and workers send concurrently.
//!
//! Engines never invoke either trait while holding an internal lock, so an
//! implementation is free to call back into the engines (a transport whose
//! send path dispatches loopback traffic, for instance) without deadlock.

use anyhow::Result;

/// Best-effort datagram transport over the mesh.
pub trait Transport: Send + Sync {
    /// Send one datagram to a peer. May fail synchronously; delivery is
    /// never guaranteed either way.
    fn send(&self, peer_id: &str, payload: &[u8], port: u16) -> Result<()>;

    /// Sentinel peer id carried by broadcast traffic. A transfer announced
    /// to this address has no single sender to request retransmissions
    /// from.
    fn broadcast_addr(&self) -> &str;
}

/// Destination for completed transfers.
pub trait PersistenceSink: Send + Sync {
    /// Persist a fully verified file. Called exactly once per successful
    /// transfer, with the sanitized filename.
    fn save(&self, filename: &str, data: &[u8]) -> Result<()>;
}
