//! Wire format: the four protocol messages and their envelope.
//!
//! Encoding is standard protocol-buffers binary; field tags are normative
//! and must never be renumbered. Unknown fields are ignored on decode, so
//! old peers interoperate with newer schema revisions.
//!
//! All SHA-256 hashes on the wire are lowercase hex strings of length 64.

use prost::Message;

/// Announces a new transfer: file layout plus integrity information.
///
/// Either `merkle_root` or `piece_hashes` (or both) is expected; a
/// `FileStart` carrying neither marks the transfer as unverifiable.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileStart {
    /// Basename of the file being sent. Sanitized by the receiver before
    /// any use.
    #[prost(string, tag = "1")]
    pub filename: String,
    /// Total file size in bytes.
    #[prost(uint32, tag = "2")]
    pub total_size: u32,
    /// Bytes per piece; every piece except possibly the last has exactly
    /// this length.
    #[prost(uint32, tag = "3")]
    pub piece_size: u32,
    /// Merkle root over the piece-hash tree.
    #[prost(string, optional, tag = "4")]
    pub merkle_root: Option<String>,
    /// Per-piece SHA-256 hashes in index order.
    #[prost(string, repeated, tag = "5")]
    pub piece_hashes: Vec<String>,
}

/// One numbered piece of the file.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PieceData {
    #[prost(uint32, tag = "1")]
    pub piece_index: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

/// Receiver-to-sender report: what is still missing, what has arrived.
///
/// An empty `missing_indices` with a full `acknowledged_indices` signals
/// completion to the sender.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResumeRequest {
    #[prost(uint32, repeated, tag = "1")]
    pub missing_indices: Vec<u32>,
    #[prost(uint32, repeated, tag = "2")]
    pub acknowledged_indices: Vec<u32>,
}

/// Reserved per-piece acknowledgement. The current protocol bundles acks
/// inside [`ResumeRequest`]; this variant is accepted and ignored.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Acknowledgement {
    #[prost(uint32, tag = "1")]
    pub piece_index: u32,
}

/// Envelope: exactly one of the four protocol messages.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AkitaMessage {
    #[prost(oneof = "akita_message::Payload", tags = "1, 2, 3, 4")]
    pub payload: Option<akita_message::Payload>,
}

pub mod akita_message {
    /// The message variants, closed by the schema.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        FileStart(super::FileStart),
        #[prost(message, tag = "2")]
        PieceData(super::PieceData),
        #[prost(message, tag = "3")]
        ResumeRequest(super::ResumeRequest),
        #[prost(message, tag = "4")]
        Acknowledgement(super::Acknowledgement),
    }
}

// ── Encode / decode helpers ──────────────────────────────────────────────────

impl AkitaMessage {
    pub fn file_start(inner: FileStart) -> Self {
        Self {
            payload: Some(akita_message::Payload::FileStart(inner)),
        }
    }

    pub fn piece_data(inner: PieceData) -> Self {
        Self {
            payload: Some(akita_message::Payload::PieceData(inner)),
        }
    }

    pub fn resume_request(inner: ResumeRequest) -> Self {
        Self {
            payload: Some(akita_message::Payload::ResumeRequest(inner)),
        }
    }
}

/// Encode a message for the wire.
pub fn encode(message: &AkitaMessage) -> Vec<u8> {
    message.encode_to_vec()
}

/// Encoded size of a message, used to keep datagrams within the transport
/// budget without actually encoding.
pub fn encoded_len(message: &AkitaMessage) -> usize {
    message.encoded_len()
}

/// Decode a raw datagram payload.
pub fn decode(payload: &[u8]) -> Result<AkitaMessage, prost::DecodeError> {
    AkitaMessage::decode(payload)
}

// ── Tests ────────────────────────────────────────────────────────────────────
