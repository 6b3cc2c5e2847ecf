//! Receive-side transfer engine.
//!
//! One [`ReceiveEngine`] serves any number of concurrent inbound transfers,
//! one per originating peer, behind a single coarse lock. Handlers follow
//! the same discipline as the sender: all state mutation happens under the
//! lock, all transport and sink I/O after release, so a transport whose
//! send path loops back into the dispatcher cannot deadlock.
//!
//! A transfer moves through `Receiving → Verifying → (Complete | Failed)`:
//! pieces are admitted against the announced layout and hashes, loss is
//! repaired through periodic resume requests driven by [`ReceiveEngine::tick`],
//! and full receipt triggers verification (Merkle root, per-piece hashes,
//! or — with neither announced — nothing) before the assembled file goes to
//! the persistence sink. Broadcast transfers have no sender to ask, so they
//! never emit resume requests and either complete from what arrives or die
//! by idle timeout.

use crate::config::{Config, AKITA_CONTENT_TYPE};
use crate::hash::{merkle_root, piece_hash};
use crate::sanitize::sanitize_filename;
use crate::store::{piece_count, piece_len, PieceStore};
use crate::transport::{PersistenceSink, Transport};
use crate::wire::{self, akita_message::Payload, AkitaMessage, FileStart, PieceData, ResumeRequest};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, error, info, warn};

// ── Per-transfer state ───────────────────────────────────────────────────────

/// Lifecycle phase of a receive transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReceivePhase {
    /// Pieces are arriving; loss is repaired via resume requests.
    Receiving,
    /// All pieces verified; the assembled file is on its way to the sink.
    Verifying,
    /// File verified and persisted.
    Complete,
    /// Terminal failure: retries, timeout, or a failing sink.
    Failed,
}

struct ReceiveState {
    /// Sanitized name handed to the sink.
    filename: String,
    /// Name exactly as announced, kept for duplicate-FileStart detection.
    announced_filename: String,
    total_size: u32,
    piece_size: u32,
    num_pieces: u32,
    /// Per-piece hashes from the announcement; empty when none were sent.
    expected_hashes: Vec<String>,
    merkle_root: Option<String>,
    store: PieceStore,
    per_piece_retry: HashMap<u32, u16>,
    is_broadcast: bool,
    last_request_sent: Option<Instant>,
    last_piece_received: Instant,
    phase: ReceivePhase,
}

impl ReceiveState {
    fn same_announcement(&self, start: &FileStart, is_broadcast: bool) -> bool {
        self.announced_filename == start.filename
            && self.total_size == start.total_size
            && self.piece_size == start.piece_size
            && self.merkle_root == start.merkle_root
            && self.expected_hashes == start.piece_hashes
            && self.is_broadcast == is_broadcast
    }
}

/// Snapshot of a receive transfer for embedders.
#[derive(Debug, Clone, Serialize)]
pub struct ReceiveStatus {
    pub phase: ReceivePhase,
    pub filename: String,
    pub num_pieces: u32,
    pub received_pieces: u32,
    pub missing_pieces: Vec<u32>,
    pub is_broadcast: bool,
}

/// Side-effect computed under the lock, performed after release.
enum Effect {
    Send(Vec<u8>),
    Save { filename: String, data: Vec<u8> },
}

type ReceiveRegistry = HashMap<String, ReceiveState>;

// ── Engine ───────────────────────────────────────────────────────────────────

/// Receive-side engine: registry of per-peer transfers, the transport for
/// resume requests, and the sink for completed files.
pub struct ReceiveEngine {
    config: Config,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn PersistenceSink>,
    transfers: Mutex<ReceiveRegistry>,
}

impl ReceiveEngine {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        Self {
            config,
            transport,
            sink,
            transfers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReceiveRegistry> {
        self.transfers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Process a `FileStart` announcement from `peer`.
    ///
    /// Invalid announcements (bad filename, inconsistent layout, wrong hash
    /// count) are dropped with a warning. A byte-identical announcement for
    /// the running transfer is a no-op; anything else replaces it.
    pub fn handle_file_start(&self, peer: &str, start: FileStart, is_broadcast: bool) {
        let effects = {
            let mut registry = self.lock();
            self.admit_file_start(&mut registry, peer, start, is_broadcast)
        };
        self.perform_effects(peer, effects);
    }

    fn admit_file_start(
        &self,
        registry: &mut ReceiveRegistry,
        peer: &str,
        start: FileStart,
        is_broadcast: bool,
    ) -> Vec<Effect> {
        let Some(filename) = sanitize_filename(&start.filename) else {
            warn!(peer = %peer, filename = %start.filename, "Unusable filename in FileStart, dropping");
            return Vec::new();
        };
        if start.total_size > 0 && start.piece_size == 0 {
            warn!(peer = %peer, "FileStart with piece_size zero for a non-empty file, dropping");
            return Vec::new();
        }
        let num_pieces = piece_count(start.total_size, start.piece_size);
        if !start.piece_hashes.is_empty() && start.piece_hashes.len() != num_pieces as usize {
            warn!(
                peer = %peer,
                hashes = start.piece_hashes.len(),
                pieces = num_pieces,
                "FileStart hash count does not match piece count, dropping"
            );
            return Vec::new();
        }
        if num_pieces > 0 && start.piece_hashes.is_empty() && start.merkle_root.is_none() {
            warn!(peer = %peer, file = %filename, "No integrity information announced, transfer is unverifiable");
        }

        if let Some(existing) = registry.get(peer) {
            if existing.phase == ReceivePhase::Receiving
                && existing.same_announcement(&start, is_broadcast)
            {
                debug!(peer = %peer, "Duplicate FileStart for the running transfer, ignoring");
                return Vec::new();
            }
            info!(peer = %peer, "New FileStart replaces the existing transfer");
        }

        info!(
            peer = %peer,
            file = %filename,
            size = start.total_size,
            pieces = num_pieces,
            broadcast = is_broadcast,
            "Incoming transfer"
        );

        let mut state = ReceiveState {
            filename,
            announced_filename: start.filename,
            total_size: start.total_size,
            piece_size: start.piece_size,
            num_pieces,
            expected_hashes: start.piece_hashes,
            merkle_root: start.merkle_root,
            store: PieceStore::new(num_pieces),
            per_piece_retry: HashMap::new(),
            is_broadcast,
            last_request_sent: None,
            last_piece_received: Instant::now(),
            phase: ReceivePhase::Receiving,
        };

        // An empty file carries no pieces: it is complete on announcement.
        let effects = if num_pieces == 0 {
            state.phase = ReceivePhase::Verifying;
            vec![Effect::Save {
                filename: state.filename.clone(),
                data: Vec::new(),
            }]
        } else {
            Vec::new()
        };

        registry.insert(peer.to_string(), state);
        effects
    }

    /// Process one piece from `peer`. Rejections (unknown transfer, bad
    /// index, duplicate, length or hash mismatch) are logged and dropped —
    /// a rejected piece stays missing and is re-requested later.
    pub fn handle_piece_data(&self, peer: &str, piece: PieceData, is_broadcast: bool) {
        let effects = {
            let mut registry = self.lock();
            let Some(state) = registry.get_mut(peer) else {
                warn!(peer = %peer, index = piece.piece_index, "Piece for unknown transfer, dropping");
                return;
            };
            if state.is_broadcast != is_broadcast {
                warn!(peer = %peer, index = piece.piece_index, "Piece addressing does not match the transfer, dropping");
                return;
            }
            if state.phase != ReceivePhase::Receiving {
                debug!(peer = %peer, index = piece.piece_index, phase = ?state.phase, "Piece for finished transfer, ignoring");
                return;
            }

            let index = piece.piece_index;
            if index >= state.num_pieces {
                warn!(peer = %peer, index, total = state.num_pieces, "Piece index out of range, dropping");
                return;
            }
            if state.store.has(index) {
                debug!(peer = %peer, index, "Duplicate piece, discarding");
                return;
            }
            let expected_len = piece_len(state.total_size, state.piece_size, index);
            if piece.data.len() != expected_len {
                warn!(
                    peer = %peer,
                    index,
                    expected = expected_len,
                    actual = piece.data.len(),
                    "Piece length mismatch, dropping"
                );
                return;
            }
            if !state.expected_hashes.is_empty() {
                let computed = piece_hash(&piece.data);
                if computed != state.expected_hashes[index as usize] {
                    warn!(peer = %peer, index, "Piece hash mismatch, dropping");
                    return;
                }
            }

            if let Err(e) = state.store.put(index, piece.data) {
                warn!(peer = %peer, index, error = %e, "Piece rejected by store");
                return;
            }
            state.last_piece_received = Instant::now();
            state.per_piece_retry.remove(&index);
            debug!(
                peer = %peer,
                index,
                received = state.store.received_count(),
                total = state.num_pieces,
                "Piece stored"
            );

            if state.store.is_complete() {
                self.verify_and_assemble(peer, state)
            } else {
                Vec::new()
            }
        };
        self.perform_effects(peer, effects);
    }

    /// Full receipt: verify integrity, then hand the assembled file off.
    ///
    /// A Merkle mismatch cannot name the bad pieces, so the whole store is
    /// reset and everything re-requested; a per-piece hash mismatch evicts
    /// only the implicated slots.
    fn verify_and_assemble(&self, peer: &str, state: &mut ReceiveState) -> Vec<Effect> {
        if let Some(expected_root) = state.merkle_root.clone() {
            let leaves: Vec<String> = if !state.expected_hashes.is_empty() {
                state.expected_hashes.clone()
            } else {
                state.store.iter_ordered().map(|(_, d)| piece_hash(d)).collect()
            };
            let computed = merkle_root(&leaves).ok();
            if computed.as_deref() != Some(expected_root.as_str()) {
                warn!(
                    peer = %peer,
                    file = %state.filename,
                    expected = %expected_root,
                    "Merkle root mismatch, re-requesting all pieces"
                );
                state.store.clear();
                state.per_piece_retry.clear();
                return self.build_resume_request(peer, state);
            }
        } else if !state.expected_hashes.is_empty() {
            // Admission already gates on these hashes; the re-check keeps
            // the integrity invariant independent of the arrival path.
            let mismatched: Vec<u32> = state
                .store
                .iter_ordered()
                .filter(|(index, data)| {
                    piece_hash(data) != state.expected_hashes[*index as usize]
                })
                .map(|(index, _)| index)
                .collect();
            if !mismatched.is_empty() {
                warn!(
                    peer = %peer,
                    file = %state.filename,
                    count = mismatched.len(),
                    "Piece hash verification failed, re-requesting"
                );
                for index in &mismatched {
                    state.store.remove(*index);
                }
                return self.build_resume_request(peer, state);
            }
        } else {
            debug!(peer = %peer, file = %state.filename, "No integrity information, assembling unverified");
        }

        let acknowledged = state.store.stored_indices();
        let data = state.store.assemble();
        state.store.clear();
        if data.len() != state.total_size as usize {
            error!(
                peer = %peer,
                file = %state.filename,
                expected = state.total_size,
                actual = data.len(),
                "Assembled size mismatch, failing transfer"
            );
            state.phase = ReceivePhase::Failed;
            return Vec::new();
        }

        info!(
            peer = %peer,
            file = %state.filename,
            bytes = data.len(),
            "Transfer verified, persisting"
        );
        state.phase = ReceivePhase::Verifying;

        let mut effects = Vec::new();
        if !state.is_broadcast {
            // Tell the sender everything arrived: empty missing set, full
            // acknowledgement.
            let mut message = AkitaMessage::resume_request(ResumeRequest {
                missing_indices: Vec::new(),
                acknowledged_indices: acknowledged,
            });
            truncate_to_budget(&mut message, self.config.max_datagram_bytes);
            state.last_request_sent = Some(Instant::now());
            effects.push(Effect::Send(wire::encode(&message)));
        }
        effects.push(Effect::Save {
            filename: state.filename.clone(),
            data,
        });
        effects
    }

    /// Build one resume request for the current missing set, bounded to the
    /// datagram budget. Counts one retry against every requested index and
    /// fails the transfer instead of emitting once any index would pass the
    /// cap.
    fn build_resume_request(&self, peer: &str, state: &mut ReceiveState) -> Vec<Effect> {
        if state.is_broadcast || state.phase != ReceivePhase::Receiving {
            return Vec::new();
        }
        let missing = state.store.missing_indices();
        if missing.is_empty() {
            return Vec::new();
        }

        let mut message = AkitaMessage::resume_request(ResumeRequest {
            missing_indices: missing,
            acknowledged_indices: state.store.stored_indices(),
        });
        truncate_to_budget(&mut message, self.config.max_datagram_bytes);
        let Some(Payload::ResumeRequest(request)) = &message.payload else {
            unreachable!("resume request envelope");
        };

        for &index in &request.missing_indices {
            let count = state.per_piece_retry.get(&index).copied().unwrap_or(0) + 1;
            if count > self.config.max_retries {
                error!(
                    peer = %peer,
                    file = %state.filename,
                    index,
                    max_retries = self.config.max_retries,
                    "Piece exceeded the retry limit, failing transfer"
                );
                state.phase = ReceivePhase::Failed;
                state.store.clear();
                state.per_piece_retry.clear();
                return Vec::new();
            }
        }
        for &index in &request.missing_indices {
            *state.per_piece_retry.entry(index).or_insert(0) += 1;
        }

        debug!(
            peer = %peer,
            requested = request.missing_indices.len(),
            acknowledged = request.acknowledged_indices.len(),
            "Requesting retransmission"
        );
        state.last_request_sent = Some(Instant::now());
        vec![Effect::Send(wire::encode(&message))]
    }

    /// Drive timeouts and periodic resume requests. Invoked by an external
    /// scheduler; idempotent under repeated invocation.
    pub fn tick(&self) {
        let now = Instant::now();
        let mut outbound: Vec<(String, Vec<Effect>)> = Vec::new();
        {
            let mut registry = self.lock();
            let mut reap = Vec::new();
            for (peer, state) in registry.iter_mut() {
                let idle = now.duration_since(state.last_piece_received);
                match state.phase {
                    ReceivePhase::Receiving => {
                        if idle >= self.config.receive_idle_timeout {
                            error!(
                                peer = %peer,
                                file = %state.filename,
                                "No pieces within the idle window, failing transfer"
                            );
                            state.phase = ReceivePhase::Failed;
                            state.store.clear();
                            continue;
                        }
                        let due = match state.last_request_sent {
                            None => true,
                            Some(at) => now.duration_since(at) >= self.config.request_interval,
                        };
                        if due {
                            let effects = self.build_resume_request(peer, state);
                            if !effects.is_empty() {
                                outbound.push((peer.clone(), effects));
                            }
                        }
                    }
                    ReceivePhase::Verifying => {}
                    ReceivePhase::Complete | ReceivePhase::Failed => {
                        if idle >= self.config.receive_idle_timeout {
                            reap.push(peer.clone());
                        }
                    }
                }
            }
            for peer in reap {
                debug!(peer = %peer, "Reaping finished receive transfer");
                registry.remove(&peer);
            }
        }
        for (peer, effects) in outbound {
            self.perform_effects(&peer, effects);
        }
    }

    /// Mark a transfer failed. Releases piece buffers immediately.
    pub fn cancel(&self, peer: &str) {
        let mut registry = self.lock();
        if let Some(state) = registry.get_mut(peer) {
            if state.phase == ReceivePhase::Receiving {
                info!(peer = %peer, file = %state.filename, "Transfer cancelled");
                state.phase = ReceivePhase::Failed;
                state.store.clear();
            }
        }
    }

    /// Snapshot of the transfer from `peer`, if one is known.
    pub fn status(&self, peer: &str) -> Option<ReceiveStatus> {
        self.lock().get(peer).map(|state| ReceiveStatus {
            phase: state.phase,
            filename: state.filename.clone(),
            num_pieces: state.num_pieces,
            received_pieces: state.store.received_count(),
            missing_pieces: state.store.missing_indices(),
            is_broadcast: state.is_broadcast,
        })
    }

    /// Drop all state for a transfer, terminal or not.
    pub fn remove(&self, peer: &str) {
        self.lock().remove(peer);
    }

    /// Perform the side-effects computed by a handler, with the lock
    /// released. Sink outcomes are folded back into the transfer state.
    fn perform_effects(&self, peer: &str, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(payload) => {
                    if let Err(e) = self.transport.send(peer, &payload, AKITA_CONTENT_TYPE) {
                        warn!(peer = %peer, error = %e, "Failed to send resume request");
                    }
                }
                Effect::Save { filename, data } => match self.sink.save(&filename, &data) {
                    Ok(()) => {
                        info!(peer = %peer, file = %filename, bytes = data.len(), "File saved");
                        self.settle(peer, ReceivePhase::Complete);
                    }
                    Err(e) => {
                        error!(peer = %peer, file = %filename, error = %e, "Persistence sink failed, payload lost");
                        self.settle(peer, ReceivePhase::Failed);
                    }
                },
            }
        }
    }

    /// Resolve a transfer that was parked in `Verifying` while its save ran.
    fn settle(&self, peer: &str, phase: ReceivePhase) {
        let mut registry = self.lock();
        if let Some(state) = registry.get_mut(peer) {
            if state.phase == ReceivePhase::Verifying {
                state.phase = phase;
                state.store.clear();
            }
        }
    }
}

/// Shrink a resume request until its encoding fits `budget` bytes: the
/// missing list is cut to an ascending prefix (never below one entry), then
/// the acknowledged list. The remainder goes out on a later interval.
fn truncate_to_budget(message: &mut AkitaMessage, budget: usize) {
    loop {
        if wire::encoded_len(message) <= budget {
            return;
        }
        let Some(Payload::ResumeRequest(request)) = &mut message.payload else {
            return;
        };
        if request.missing_indices.len() > 1 {
            request.missing_indices.pop();
        } else if !request.acknowledged_indices.is_empty() {
            request.acknowledged_indices.pop();
        } else {
            // Nothing left to trim; a single-index request over budget can
            // only happen with a pathological configuration.
            warn!(budget, "Resume request cannot fit the datagram budget");
            return;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
