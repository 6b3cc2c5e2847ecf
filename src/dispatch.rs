//! Inbound routing: one place where raw datagrams become engine calls.
//!
//! The dispatcher filters by the well-known port, decodes the envelope, and
//! routes by variant: announcements and pieces to the receive engine,
//! resume requests to the send engine. The reserved `Acknowledgement`
//! variant is accepted and ignored for forward compatibility. Anything
//! malformed is dropped with a warning — inbound traffic can never
//! escalate an error past this boundary.

use crate::config::AKITA_CONTENT_TYPE;
use crate::receiver::ReceiveEngine;
use crate::sender::SendEngine;
use crate::wire::{self, akita_message::Payload};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Routes decoded inbound messages to the transfer engines.
pub struct Dispatcher {
    send_engine: Arc<SendEngine>,
    receive_engine: Arc<ReceiveEngine>,
}

impl Dispatcher {
    pub fn new(send_engine: Arc<SendEngine>, receive_engine: Arc<ReceiveEngine>) -> Self {
        Self {
            send_engine,
            receive_engine,
        }
    }

    pub fn send_engine(&self) -> &Arc<SendEngine> {
        &self.send_engine
    }

    pub fn receive_engine(&self) -> &Arc<ReceiveEngine> {
        &self.receive_engine
    }

    /// Handle one inbound datagram as delivered by the mesh: origin peer,
    /// raw payload, application port, and whether it was addressed to the
    /// broadcast sentinel.
    pub fn handle_packet(&self, peer_id: &str, payload: &[u8], port: u16, is_broadcast: bool) {
        if port != AKITA_CONTENT_TYPE {
            trace!(peer = %peer_id, port, "Datagram on foreign port, ignoring");
            return;
        }

        let message = match wire::decode(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %peer_id, bytes = payload.len(), error = %e, "Undecodable datagram, dropping");
                return;
            }
        };

        match message.payload {
            Some(Payload::FileStart(start)) => {
                self.receive_engine
                    .handle_file_start(peer_id, start, is_broadcast);
            }
            Some(Payload::PieceData(piece)) => {
                self.receive_engine
                    .handle_piece_data(peer_id, piece, is_broadcast);
            }
            Some(Payload::ResumeRequest(request)) => {
                self.send_engine.handle_resume_request(peer_id, request);
            }
            Some(Payload::Acknowledgement(ack)) => {
                // Reserved variant: the protocol bundles acks inside
                // ResumeRequest. Accepted for forward compatibility.
                debug!(peer = %peer_id, index = ack.piece_index, "Standalone acknowledgement ignored");
            }
            None => {
                warn!(peer = %peer_id, "Envelope without a payload, dropping");
            }
        }
    }

    /// Drive both engines' timers. Invoked periodically by an external
    /// scheduler; idempotent under repeated invocation.
    pub fn tick(&self) {
        self.send_engine.tick();
        self.receive_engine.tick();
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::receiver::ReceivePhase;
    use crate::sender::SendPhase;
    use crate::transport::{PersistenceSink, Transport};
    use crate::wire::{Acknowledgement, AkitaMessage, PieceData, ResumeRequest};
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// In-memory mesh endpoint: outbound datagrams pile up in a queue the
    /// test pumps by hand, so every delivery and every loss is explicit.
    struct QueueTransport {
        outbound: Mutex<VecDeque<(String, Vec<u8>, u16)>>,
    }

    impl QueueTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                outbound: Mutex::new(VecDeque::new()),
            })
        }

        fn drain(&self) -> Vec<(String, Vec<u8>, u16)> {
            self.outbound.lock().unwrap().drain(..).collect()
        }

        fn queued(&self) -> usize {
            self.outbound.lock().unwrap().len()
        }
    }

    impl Transport for QueueTransport {
        fn send(&self, peer_id: &str, payload: &[u8], port: u16) -> anyhow::Result<()> {
            self.outbound
                .lock()
                .unwrap()
                .push_back((peer_id.to_string(), payload.to_vec(), port));
            Ok(())
        }

        fn broadcast_addr(&self) -> &str {
            "^all"
        }
    }

    struct CaptureSink {
        saved: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl CaptureSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                saved: Mutex::new(Vec::new()),
            })
        }

        fn files(&self) -> Vec<(String, Vec<u8>)> {
            self.saved.lock().unwrap().clone()
        }
    }

    impl PersistenceSink for CaptureSink {
        fn save(&self, filename: &str, data: &[u8]) -> anyhow::Result<()> {
            self.saved
                .lock()
                .unwrap()
                .push((filename.to_string(), data.to_vec()));
            Ok(())
        }
    }

    /// One mesh node: dispatcher, engines, its transport queue and sink.
    struct Node {
        dispatcher: Dispatcher,
        transport: Arc<QueueTransport>,
        sink: Arc<CaptureSink>,
    }

    impl Node {
        fn new(config: Config) -> Self {
            let transport = QueueTransport::new();
            let sink = CaptureSink::new();
            let send_engine = Arc::new(SendEngine::new(config.clone(), transport.clone()));
            let receive_engine = Arc::new(ReceiveEngine::new(
                config,
                transport.clone(),
                sink.clone(),
            ));
            Self {
                dispatcher: Dispatcher::new(send_engine, receive_engine),
                transport,
                sink,
            }
        }
    }

    /// Deliver everything `from` has queued into `to`, dropping datagrams
    /// whose decoded piece index is in `lose`.
    fn pump(from: &Node, from_id: &str, to: &Node, lose: &[u32]) -> usize {
        let mut delivered = 0;
        for (_, payload, port) in from.transport.drain() {
            if let Ok(message) = wire::decode(&payload) {
                if let Some(Payload::PieceData(piece)) = &message.payload {
                    if lose.contains(&piece.piece_index) {
                        continue;
                    }
                }
            }
            to.dispatcher.handle_packet(from_id, &payload, port, false);
            delivered += 1;
        }
        delivered
    }

    fn fast_config() -> Config {
        Config {
            piece_size: 200,
            initial_delay: Duration::ZERO,
            request_interval: Duration::ZERO,
            ..Config::default()
        }
    }

    fn write_temp_file(name: &str, data: &[u8]) -> PathBuf {
        let dir = std::env::temp_dir().join("akita_test_dispatch");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    fn pattern_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_foreign_port_ignored() {
        let node = Node::new(fast_config());
        let payload = wire::encode(&AkitaMessage::piece_data(PieceData {
            piece_index: 0,
            data: vec![1],
        }));
        node.dispatcher.handle_packet("peer", &payload, 99, false);
        assert!(node.dispatcher.receive_engine().status("peer").is_none());
    }

    #[test]
    fn test_garbage_payload_dropped() {
        let node = Node::new(fast_config());
        node.dispatcher
            .handle_packet("peer", &[0xff, 0xff, 0xff], AKITA_CONTENT_TYPE, false);
        assert!(node.dispatcher.receive_engine().status("peer").is_none());
    }

    #[test]
    fn test_acknowledgement_is_a_noop() {
        let node = Node::new(fast_config());
        let payload = wire::encode(&AkitaMessage {
            payload: Some(Payload::Acknowledgement(Acknowledgement { piece_index: 1 })),
        });
        node.dispatcher
            .handle_packet("peer", &payload, AKITA_CONTENT_TYPE, false);
        assert!(node.dispatcher.send_engine().status("peer").is_none());
        assert!(node.dispatcher.receive_engine().status("peer").is_none());
    }

    #[test]
    fn test_resume_request_for_unknown_peer_dropped() {
        let node = Node::new(fast_config());
        let payload = wire::encode(&AkitaMessage::resume_request(ResumeRequest {
            missing_indices: vec![0],
            acknowledged_indices: vec![],
        }));
        node.dispatcher
            .handle_packet("peer", &payload, AKITA_CONTENT_TYPE, false);
        assert!(node.dispatcher.send_engine().status("peer").is_none());
    }

    // ── End-to-end scenarios ─────────────────────────────────────────────

    #[test]
    fn test_happy_path_no_loss() {
        let data = pattern_bytes(1000);
        let path = write_temp_file("happy.bin", &data);
        let alice = Node::new(fast_config());
        let bob = Node::new(fast_config());

        assert!(alice.dispatcher.send_engine().start_transfer("bob", &path));
        // FileStart plus all five pieces.
        wait_until(|| alice.transport.queued() >= 6);
        assert_eq!(pump(&alice, "alice", &bob, &[]), 6);

        // Receiver verified and saved, and told the sender so.
        assert_eq!(bob.sink.files(), vec![("happy.bin".to_string(), data)]);
        assert_eq!(
            bob.dispatcher.receive_engine().status("alice").unwrap().phase,
            ReceivePhase::Complete
        );

        let outbound = bob.transport.drain();
        assert_eq!(outbound.len(), 1);
        let Some(Payload::ResumeRequest(request)) =
            wire::decode(&outbound[0].1).unwrap().payload
        else {
            panic!("expected the completion resume request");
        };
        assert!(request.missing_indices.is_empty());
        assert_eq!(request.acknowledged_indices, vec![0, 1, 2, 3, 4]);

        alice
            .dispatcher
            .handle_packet("bob", &outbound[0].1, outbound[0].2, false);
        assert_eq!(
            alice.dispatcher.send_engine().status("bob").unwrap().phase,
            SendPhase::Complete
        );
    }

    #[test]
    fn test_single_piece_loss_recovered() {
        let data = pattern_bytes(1000);
        let path = write_temp_file("lossy.bin", &data);
        let alice = Node::new(fast_config());
        let bob = Node::new(fast_config());

        assert!(alice.dispatcher.send_engine().start_transfer("bob", &path));
        wait_until(|| alice.transport.queued() >= 6);
        // Piece 2 is lost on the first pass.
        pump(&alice, "alice", &bob, &[2]);
        assert_eq!(
            bob.dispatcher
                .receive_engine()
                .status("alice")
                .unwrap()
                .missing_pieces,
            vec![2]
        );

        // The request interval elapses; the receiver asks for piece 2.
        bob.dispatcher.tick();
        let outbound = bob.transport.drain();
        assert_eq!(outbound.len(), 1);
        let Some(Payload::ResumeRequest(request)) =
            wire::decode(&outbound[0].1).unwrap().payload
        else {
            panic!("expected a resume request");
        };
        assert_eq!(request.missing_indices, vec![2]);
        assert_eq!(request.acknowledged_indices, vec![0, 1, 3, 4]);

        // Sender retransmits; this time it arrives.
        alice
            .dispatcher
            .handle_packet("bob", &outbound[0].1, outbound[0].2, false);
        wait_until(|| alice.transport.queued() >= 1);
        pump(&alice, "alice", &bob, &[]);

        assert_eq!(bob.sink.files(), vec![("lossy.bin".to_string(), data)]);

        // Completion flows back to the sender.
        let outbound = bob.transport.drain();
        assert_eq!(outbound.len(), 1);
        alice
            .dispatcher
            .handle_packet("bob", &outbound[0].1, outbound[0].2, false);
        assert_eq!(
            alice.dispatcher.send_engine().status("bob").unwrap().phase,
            SendPhase::Complete
        );
    }

    #[test]
    fn test_corrupted_piece_recovered_after_retransmit() {
        let data = pattern_bytes(1000);
        let path = write_temp_file("corrupt.bin", &data);
        let alice = Node::new(fast_config());
        let bob = Node::new(fast_config());

        assert!(alice.dispatcher.send_engine().start_transfer("bob", &path));
        wait_until(|| alice.transport.queued() >= 6);

        // Deliver everything, but flip a byte in piece 3 on the way.
        for (_, payload, port) in alice.transport.drain() {
            let message = wire::decode(&payload).unwrap();
            let tampered = match message.payload {
                Some(Payload::PieceData(mut piece)) if piece.piece_index == 3 => {
                    piece.data[0] ^= 0xff;
                    wire::encode(&AkitaMessage::piece_data(piece))
                }
                _ => payload,
            };
            bob.dispatcher
                .handle_packet("alice", &tampered, port, false);
        }

        // The tampered piece failed its hash check and was never stored.
        let status = bob.dispatcher.receive_engine().status("alice").unwrap();
        assert_eq!(status.phase, ReceivePhase::Receiving);
        assert_eq!(status.missing_pieces, vec![3]);

        // Normal recovery: request, genuine retransmit, completion.
        bob.dispatcher.tick();
        let outbound = bob.transport.drain();
        alice
            .dispatcher
            .handle_packet("bob", &outbound[0].1, outbound[0].2, false);
        wait_until(|| alice.transport.queued() >= 1);
        pump(&alice, "alice", &bob, &[]);
        assert_eq!(bob.sink.files(), vec![("corrupt.bin".to_string(), data)]);
    }

    #[test]
    fn test_retry_exhaustion_abandons_transfer() {
        let config = Config {
            max_retries: 3,
            ..fast_config()
        };
        let data = pattern_bytes(1000);
        let path = write_temp_file("exhausted.bin", &data);
        let alice = Node::new(config.clone());
        let bob = Node::new(config);

        assert!(alice.dispatcher.send_engine().start_transfer("bob", &path));
        wait_until(|| alice.transport.queued() >= 6);
        // Piece 0 is permanently lost; retransmissions are discarded too,
        // so every resume cycle fails.
        pump(&alice, "alice", &bob, &[0]);

        for _ in 0..3 {
            bob.dispatcher.tick();
        }
        assert_eq!(bob.transport.drain().len(), 3);
        assert_eq!(
            bob.dispatcher.receive_engine().status("alice").unwrap().phase,
            ReceivePhase::Receiving
        );

        // The fourth cycle would push piece 0 past the cap: fail instead.
        bob.dispatcher.tick();
        assert_eq!(
            bob.dispatcher.receive_engine().status("alice").unwrap().phase,
            ReceivePhase::Failed
        );
        assert_eq!(bob.transport.queued(), 0);
        assert!(bob.sink.files().is_empty());
    }

    #[test]
    fn test_broadcast_transfer_completes_silently() {
        let data = pattern_bytes(600);
        let path = write_temp_file("bcast.bin", &data);
        let alice = Node::new(fast_config());
        let bob = Node::new(fast_config());

        assert!(alice
            .dispatcher
            .send_engine()
            .start_transfer("^all", &path));
        wait_until(|| alice.transport.queued() >= 4);
        for (_, payload, port) in alice.transport.drain() {
            bob.dispatcher.handle_packet("alice", &payload, port, true);
        }

        assert_eq!(bob.sink.files(), vec![("bcast.bin".to_string(), data)]);
        // No back-channel: the receiver never asked for anything.
        bob.dispatcher.tick();
        assert_eq!(bob.transport.queued(), 0);
    }

    #[test]
    fn test_broadcast_with_loss_idles_out() {
        let config = Config {
            receive_idle_timeout: Duration::ZERO,
            ..fast_config()
        };
        let data = pattern_bytes(600);
        let path = write_temp_file("bcast_lossy.bin", &data);
        let alice = Node::new(fast_config());
        let bob = Node::new(config);

        assert!(alice
            .dispatcher
            .send_engine()
            .start_transfer("^all", &path));
        wait_until(|| alice.transport.queued() >= 4);
        for (_, payload, port) in alice.transport.drain() {
            if let Some(Payload::PieceData(piece)) = &wire::decode(&payload).unwrap().payload {
                if piece.piece_index == 1 {
                    continue;
                }
            }
            bob.dispatcher.handle_packet("alice", &payload, port, true);
        }

        bob.dispatcher.tick();
        assert_eq!(
            bob.dispatcher.receive_engine().status("alice").unwrap().phase,
            ReceivePhase::Failed
        );
        assert_eq!(bob.transport.queued(), 0);
        assert!(bob.sink.files().is_empty());
    }

    #[test]
    fn test_traversal_filename_saved_sanitized() {
        let data = pattern_bytes(200);
        let bob = Node::new(fast_config());

        let start = crate::wire::FileStart {
            filename: "../../etc/passwd".into(),
            total_size: 200,
            piece_size: 200,
            merkle_root: None,
            piece_hashes: vec![crate::hash::piece_hash(&data)],
        };
        let payload = wire::encode(&AkitaMessage::file_start(start));
        bob.dispatcher
            .handle_packet("mallory", &payload, AKITA_CONTENT_TYPE, false);

        let piece = wire::encode(&AkitaMessage::piece_data(PieceData {
            piece_index: 0,
            data: data.clone(),
        }));
        bob.dispatcher
            .handle_packet("mallory", &piece, AKITA_CONTENT_TYPE, false);

        assert_eq!(bob.sink.files(), vec![("etcpasswd".to_string(), data)]);
    }
}
