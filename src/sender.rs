//! Send-side transfer engine.
//!
//! One [`SendEngine`] serves any number of concurrent outbound transfers,
//! one per destination peer, behind a single coarse lock. The engine is a
//! state machine with declarative side-effects: handlers mutate state under
//! the lock and never perform transport I/O while holding it — piece
//! transmission happens on a dedicated worker thread per transfer, which
//! samples the shared state each iteration.
//!
//! Lifecycle: [`SendEngine::start_transfer`] hashes the file (streaming,
//! one piece-size buffer), announces it with a `FileStart`, and spawns the
//! worker. Inbound `ResumeRequest`s merge acknowledgements, schedule
//! retransmissions, and drive the pacing controller. The transfer ends when
//! a resume request reports nothing missing and every piece acknowledged,
//! or fails on persistent send errors, an unreadable file, retry-less
//! silence past the idle window, or cancellation.

use crate::config::{Config, AKITA_CONTENT_TYPE};
use crate::hash::{merkle_root, piece_hash};
use crate::pacing::PacingController;
use crate::store::{piece_count, piece_len, PieceBitmap};
use crate::transport::Transport;
use crate::wire::{self, AkitaMessage, FileStart, PieceData, ResumeRequest};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long an idle worker sleeps before re-sampling the retransmit queue.
const IDLE_POLL: Duration = Duration::from_millis(50);

// ── Per-transfer state ───────────────────────────────────────────────────────

/// Lifecycle phase of a send transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SendPhase {
    /// Worker is streaming pieces and answering resume requests.
    Streaming,
    /// Receiver acknowledged every piece.
    Complete,
    /// Terminal failure: I/O, retries, timeout, or cancellation.
    Failed,
}

struct SendState {
    /// Identity of the worker this state belongs to. A restart replaces
    /// the registry entry under a fresh generation; a stale worker sees
    /// the mismatch on its next sample and exits without touching the
    /// replacement's cursor or queue.
    generation: u64,
    path: PathBuf,
    filename: String,
    total_size: u32,
    piece_size: u32,
    num_pieces: u32,
    acknowledged: PieceBitmap,
    /// Next index of the initial full pass.
    initial_cursor: u32,
    /// Indices awaiting retransmission, in request order.
    retransmit_queue: VecDeque<u32>,
    /// Dedup guard for `retransmit_queue`.
    queued: HashSet<u32>,
    pacing: PacingController,
    send_errors: u32,
    phase: SendPhase,
    last_activity: Instant,
}

/// Snapshot of a send transfer for embedders.
#[derive(Debug, Clone, Serialize)]
pub struct SendStatus {
    pub phase: SendPhase,
    pub num_pieces: u32,
    pub acknowledged_pieces: u32,
    pub pending_retransmits: usize,
    pub current_delay: Duration,
}

type SendRegistry = HashMap<String, SendState>;

// ── Engine ───────────────────────────────────────────────────────────────────

/// Send-side engine: registry of per-peer transfers plus the transport.
pub struct SendEngine {
    config: Config,
    transport: Arc<dyn Transport>,
    transfers: Arc<Mutex<SendRegistry>>,
    /// Source of per-transfer generation tags (see [`SendState::generation`]).
    next_generation: AtomicU64,
}

impl SendEngine {
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            transfers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SendRegistry> {
        lock_registry(&self.transfers)
    }

    /// Begin transferring a file to `peer` with the configured piece size.
    ///
    /// Returns `false` (with a log record, no state change) when the file
    /// cannot be read or the layout is invalid. A transfer already running
    /// to the same peer is replaced.
    pub fn start_transfer(&self, peer: &str, path: &Path) -> bool {
        self.start_transfer_with(peer, path, self.config.piece_size, self.config.use_merkle)
    }

    /// [`start_transfer`](Self::start_transfer) with explicit piece size
    /// and Merkle choice.
    pub fn start_transfer_with(
        &self,
        peer: &str,
        path: &Path,
        piece_size: u32,
        use_merkle: bool,
    ) -> bool {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                warn!(peer = %peer, path = %path.display(), error = %e, "Cannot open file");
                return false;
            }
        };
        let metadata = match file.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %peer, path = %path.display(), error = %e, "Cannot stat file");
                return false;
            }
        };
        if !metadata.is_file() {
            warn!(peer = %peer, path = %path.display(), "Path is not a regular file");
            return false;
        }
        if metadata.len() > u32::MAX as u64 {
            warn!(peer = %peer, path = %path.display(), size = metadata.len(), "File too large for the wire format");
            return false;
        }
        let total_size = metadata.len() as u32;
        if piece_size == 0 && total_size > 0 {
            warn!(peer = %peer, path = %path.display(), "piece_size of zero with a non-empty file");
            return false;
        }

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if filename.is_empty() {
            warn!(peer = %peer, path = %path.display(), "Path has no file name");
            return false;
        }

        let num_pieces = piece_count(total_size, piece_size);

        // Stream the file once with a single piece-size buffer to compute
        // the per-piece hashes. The worker re-reads pieces from disk later.
        let mut piece_hashes = Vec::with_capacity(num_pieces as usize);
        let mut buf = vec![0u8; piece_size as usize];
        for index in 0..num_pieces {
            let len = piece_len(total_size, piece_size, index);
            if let Err(e) = file.read_exact(&mut buf[..len]) {
                warn!(peer = %peer, path = %path.display(), index, error = %e, "Read failed while hashing");
                return false;
            }
            piece_hashes.push(piece_hash(&buf[..len]));
        }

        let root = if use_merkle && num_pieces > 0 {
            merkle_root(&piece_hashes).ok()
        } else {
            None
        };

        let start = FileStart {
            filename: filename.clone(),
            total_size,
            piece_size,
            merkle_root: root.clone(),
            piece_hashes,
        };
        let payload = wire::encode(&AkitaMessage::file_start(start));
        if let Err(e) = self.transport.send(peer, &payload, AKITA_CONTENT_TYPE) {
            warn!(peer = %peer, error = %e, "Failed to send FileStart");
            return false;
        }

        info!(
            peer = %peer,
            file = %filename,
            size = total_size,
            pieces = num_pieces,
            merkle = root.is_some(),
            "Transfer started"
        );

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let state = SendState {
            generation,
            path: path.to_path_buf(),
            filename,
            total_size,
            piece_size,
            num_pieces,
            acknowledged: PieceBitmap::new(num_pieces),
            initial_cursor: 0,
            retransmit_queue: VecDeque::new(),
            queued: HashSet::new(),
            pacing: PacingController::from_config(&self.config),
            send_errors: 0,
            // An empty file has nothing to stream: FileStart alone carries it.
            phase: if num_pieces == 0 {
                SendPhase::Complete
            } else {
                SendPhase::Streaming
            },
            last_activity: Instant::now(),
        };

        self.lock().insert(peer.to_string(), state);

        if num_pieces > 0 {
            self.spawn_worker(peer.to_string(), generation);
        }
        true
    }

    /// Process a resume request from the receiver: merge acknowledgements,
    /// detect completion, schedule retransmissions, feed the pacing
    /// controller. Indices outside the piece range are ignored.
    pub fn handle_resume_request(&self, peer: &str, request: ResumeRequest) {
        let mut registry = self.lock();
        let Some(state) = registry.get_mut(peer) else {
            warn!(peer = %peer, "Resume request without an active transfer, dropping");
            return;
        };
        if state.phase != SendPhase::Streaming {
            debug!(peer = %peer, phase = ?state.phase, "Resume request for finished transfer, ignoring");
            return;
        }

        state.last_activity = Instant::now();

        for &index in &request.acknowledged_indices {
            // set() ignores out-of-range indices
            state.acknowledged.set(index);
        }

        let out_of_range = request
            .missing_indices
            .iter()
            .filter(|i| **i >= state.num_pieces)
            .count();
        if out_of_range > 0 {
            warn!(peer = %peer, count = out_of_range, "Ignoring out-of-range indices in resume request");
        }

        let mut missing: Vec<u32> = request
            .missing_indices
            .iter()
            .copied()
            .filter(|i| *i < state.num_pieces)
            .collect();
        missing.sort_unstable();
        missing.dedup();

        if missing.is_empty() && state.acknowledged.is_complete() {
            info!(peer = %peer, file = %state.filename, "Transfer acknowledged complete");
            state.phase = SendPhase::Complete;
            // The worker exits on its next sample; drop what it no longer needs.
            state.retransmit_queue.clear();
            state.queued.clear();
            return;
        }

        if !missing.is_empty() {
            debug!(peer = %peer, count = missing.len(), "Scheduling retransmissions");
            for index in missing.iter().copied() {
                if state.queued.insert(index) {
                    state.retransmit_queue.push_back(index);
                }
            }
        }

        state.pacing.on_resume_request(!missing.is_empty());
    }

    /// Drive timeouts. Invoked periodically by an external scheduler;
    /// idempotent under repeated invocation.
    pub fn tick(&self) {
        let now = Instant::now();
        let mut registry = self.lock();
        let mut reap = Vec::new();
        for (peer, state) in registry.iter_mut() {
            let idle = now.duration_since(state.last_activity);
            match state.phase {
                SendPhase::Streaming => {
                    if idle >= self.config.send_idle_timeout && !state.acknowledged.is_complete() {
                        error!(
                            peer = %peer,
                            file = %state.filename,
                            "No resume request within the idle window, failing transfer"
                        );
                        state.phase = SendPhase::Failed;
                    }
                }
                SendPhase::Complete | SendPhase::Failed => {
                    if idle >= self.config.send_idle_timeout {
                        reap.push(peer.clone());
                    }
                }
            }
        }
        for peer in reap {
            debug!(peer = %peer, "Reaping finished send transfer");
            registry.remove(&peer);
        }
    }

    /// Cooperatively cancel a transfer. The worker observes the terminal
    /// phase on its next iteration; in-flight sends are not aborted.
    pub fn cancel(&self, peer: &str) {
        let mut registry = self.lock();
        if let Some(state) = registry.get_mut(peer) {
            if state.phase == SendPhase::Streaming {
                info!(peer = %peer, file = %state.filename, "Transfer cancelled");
                state.phase = SendPhase::Failed;
            }
        }
    }

    /// Snapshot of the transfer to `peer`, if one is known.
    pub fn status(&self, peer: &str) -> Option<SendStatus> {
        self.lock().get(peer).map(|state| SendStatus {
            phase: state.phase,
            num_pieces: state.num_pieces,
            acknowledged_pieces: state.acknowledged.count_set(),
            pending_retransmits: state.retransmit_queue.len(),
            current_delay: state.pacing.current_delay(),
        })
    }

    /// Drop all state for a transfer, terminal or not.
    pub fn remove(&self, peer: &str) {
        self.lock().remove(peer);
    }

    fn spawn_worker(&self, peer: String, generation: u64) {
        let transfers = Arc::clone(&self.transfers);
        let transport = Arc::clone(&self.transport);
        let max_send_errors = self.config.max_send_errors;
        let spawned = thread::Builder::new()
            .name(format!("akita-send-{peer}"))
            .spawn(move || stream_pieces(transfers, transport, peer, generation, max_send_errors));
        if let Err(e) = spawned {
            error!(error = %e, "Failed to spawn send worker");
        }
    }
}

// ── Worker ───────────────────────────────────────────────────────────────────

/// Per-transfer worker: streams the initial pass in index order, then
/// serves retransmissions until the transfer reaches a terminal phase.
///
/// Each iteration samples the next index and the pacing delay under the
/// lock, then reads from disk and touches the transport with the lock
/// released. Every registry access checks `generation` first: a restart
/// for the same peer installs a fresh state, and this worker must not
/// mutate the replacement's cursor or queue — nor emit bytes of the old
/// file under the new transfer's indices.
fn stream_pieces(
    transfers: Arc<Mutex<SendRegistry>>,
    transport: Arc<dyn Transport>,
    peer: String,
    generation: u64,
    max_send_errors: u32,
) {
    let (path, piece_size, total_size) = {
        let registry = lock_registry(&transfers);
        match registry.get(&peer) {
            Some(state) if state.generation == generation => {
                (state.path.clone(), state.piece_size, state.total_size)
            }
            _ => return,
        }
    };

    let mut file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            error!(peer = %peer, path = %path.display(), error = %e, "Worker cannot open file");
            fail_transfer(&transfers, &peer, generation);
            return;
        }
    };
    let mut buf = vec![0u8; piece_size as usize];

    loop {
        let (next, delay) = {
            let mut registry = lock_registry(&transfers);
            let Some(state) = registry.get_mut(&peer) else {
                return;
            };
            if state.generation != generation || state.phase != SendPhase::Streaming {
                return;
            }
            let next = if let Some(index) = state.retransmit_queue.pop_front() {
                state.queued.remove(&index);
                Some(index)
            } else if state.initial_cursor < state.num_pieces {
                let index = state.initial_cursor;
                state.initial_cursor += 1;
                Some(index)
            } else {
                None
            };
            (next, state.pacing.current_delay())
        };

        let Some(index) = next else {
            // Initial pass done, nothing queued: wait for resume requests
            // or a terminal transition.
            thread::sleep(IDLE_POLL);
            continue;
        };

        let len = piece_len(total_size, piece_size, index);
        let read = file
            .seek(SeekFrom::Start(index as u64 * piece_size as u64))
            .and_then(|_| file.read_exact(&mut buf[..len]));
        if let Err(e) = read {
            error!(peer = %peer, index, error = %e, "File unreadable mid-transfer, failing");
            fail_transfer(&transfers, &peer, generation);
            return;
        }

        let message = AkitaMessage::piece_data(PieceData {
            piece_index: index,
            data: buf[..len].to_vec(),
        });
        match transport.send(&peer, &wire::encode(&message), AKITA_CONTENT_TYPE) {
            Ok(()) => {
                let mut registry = lock_registry(&transfers);
                let Some(state) = registry.get_mut(&peer) else {
                    return;
                };
                if state.generation != generation {
                    return;
                }
                state.send_errors = 0;
                state.last_activity = Instant::now();
            }
            Err(e) => {
                warn!(peer = %peer, index, error = %e, "Datagram send failed");
                let mut registry = lock_registry(&transfers);
                let Some(state) = registry.get_mut(&peer) else {
                    return;
                };
                if state.generation != generation {
                    return;
                }
                state.send_errors += 1;
                if state.send_errors >= max_send_errors {
                    error!(
                        peer = %peer,
                        errors = state.send_errors,
                        "Consecutive send failures exceeded limit, failing transfer"
                    );
                    state.phase = SendPhase::Failed;
                    return;
                }
                // The piece stays pending and is retried on a later iteration.
                if state.queued.insert(index) {
                    state.retransmit_queue.push_back(index);
                }
            }
        }

        thread::sleep(delay);
    }
}

fn fail_transfer(transfers: &Mutex<SendRegistry>, peer: &str, generation: u64) {
    let mut registry = lock_registry(transfers);
    if let Some(state) = registry.get_mut(peer) {
        if state.generation == generation {
            state.phase = SendPhase::Failed;
        }
    }
}

fn lock_registry(transfers: &Mutex<SendRegistry>) -> MutexGuard<'_, SendRegistry> {
    transfers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Tests ────────────────────────────────────────────────────────────────────
