//! # Akita Supermodem
//!
//! Loss-tolerant, resumable file transfer for low-bandwidth, lossy,
//! high-latency datagram mesh links.
//!
//! The engine segments a file into numbered pieces, ships them as framed
//! datagrams, detects loss at the receiver, requests retransmission,
//! verifies integrity with per-piece SHA-256 hashes and/or a Merkle root,
//! and reassembles the file. The transport may drop, reorder, or duplicate
//! datagrams; it offers no connection and no acknowledgement primitive.
//!
//! ## Architecture
//!
//! - [`SendEngine`] / [`ReceiveEngine`]: per-peer transfer state machines
//!   behind one coarse lock each. Handlers are synchronous and safe to call
//!   from any thread; outbound messages are computed under the lock and
//!   sent after release.
//! - [`Dispatcher`]: routes decoded inbound frames to the correct engine by
//!   message variant and peer id.
//! - [`Transport`] / [`PersistenceSink`]: contracts for the mesh radio and
//!   the file sink — the engine never touches a socket or the destination
//!   filesystem directly.
//! - A periodic [`Dispatcher::tick`] drives timeouts and scheduled resume
//!   requests; initial piece streaming runs on a worker thread per send
//!   transfer.

pub mod config;
pub mod dispatch;
pub mod hash;
pub mod pacing;
pub mod receiver;
pub mod sanitize;
pub mod sender;
pub mod store;
pub mod transport;
pub mod wire;

pub use config::{Config, AKITA_CONTENT_TYPE};
pub use dispatch::Dispatcher;
pub use hash::{merkle_root, piece_hash, MerkleError};
pub use pacing::PacingController;
pub use receiver::{ReceiveEngine, ReceivePhase, ReceiveStatus};
pub use sanitize::sanitize_filename;
pub use sender::{SendEngine, SendPhase, SendStatus};
pub use store::{PieceBitmap, PieceStore, StoreError};
pub use transport::{PersistenceSink, Transport};
pub use wire::{Acknowledgement, AkitaMessage, FileStart, PieceData, ResumeRequest};
