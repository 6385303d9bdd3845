//! Message fragmentation and reassembly
//!
//! Splits oversize payloads into BLE-MTU-sized START/CONTINUE/END
//! fragments and reconstructs them on the receiving side, in any arrival
//! order.

use super::packet::{CodecError, Packet, HEADER_SIZE, MAX_PAYLOAD_SIZE, PEER_ID_SIZE};
use super::{MessageKind, PeerId};
use std::collections::HashMap;
use thiserror::Error;

/// Assumed BLE MTU unless the transport reports otherwise
pub const DEFAULT_MTU: usize = 512;

/// Headroom kept below the MTU for transport framing
pub const SAFETY_MARGIN: usize = 100;

/// Reassembly abandonment window, measured from the first fragment
pub const REASSEMBLY_TIMEOUT_MS: u64 = 60_000;

/// Fragmentation errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FragmentError {
    #[error("fragment metadata does not match reassembly state")]
    MetadataMismatch,

    #[error("reassembly timed out")]
    ReassemblyTimeout,

    #[error("declared total size {0} is not reassemblable")]
    OversizeTotal(u32),
}

/// Per-fragment header carried ahead of each chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentHeader {
    pub message_id: String,
    pub total_size: u32,
    pub fragment_count: u16,
    pub fragment_index: u16,
}

impl FragmentHeader {
    /// Serialized size for a given message id
    pub fn overhead(message_id_len: usize) -> usize {
        1 + message_id_len + 4 + 2 + 2
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::overhead(self.message_id.len()));
        bytes.push(self.message_id.len() as u8);
        bytes.extend_from_slice(self.message_id.as_bytes());
        bytes.extend_from_slice(&self.total_size.to_be_bytes());
        bytes.extend_from_slice(&self.fragment_count.to_be_bytes());
        bytes.extend_from_slice(&self.fragment_index.to_be_bytes());
        bytes
    }

    /// Decode a fragment payload into its header and chunk
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::Truncated("fragment header".into()));
        }
        let id_len = bytes[0] as usize;
        let fixed_end = 1 + id_len + 8;
        if bytes.len() < fixed_end {
            return Err(CodecError::Truncated("fragment header".into()));
        }
        let message_id = String::from_utf8(bytes[1..1 + id_len].to_vec())
            .map_err(|_| CodecError::Truncated("fragment id not utf-8".into()))?;
        let total_size = u32::from_be_bytes(bytes[1 + id_len..1 + id_len + 4].try_into().expect("4 bytes"));
        let fragment_count =
            u16::from_be_bytes(bytes[1 + id_len + 4..1 + id_len + 6].try_into().expect("2 bytes"));
        let fragment_index =
            u16::from_be_bytes(bytes[1 + id_len + 6..fixed_end].try_into().expect("2 bytes"));

        Ok((
            Self {
                message_id,
                total_size,
                fragment_count,
                fragment_index,
            },
            &bytes[fixed_end..],
        ))
    }
}

/// Splits payloads into MTU-sized fragment packets
pub struct Fragmenter {
    mtu: usize,
}

impl Fragmenter {
    pub fn new(mtu: usize) -> Self {
        Self { mtu: mtu.max(200) }
    }

    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu.max(200);
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Usable chunk size per fragment for the current MTU
    fn max_chunk(&self, has_recipient: bool, message_id_len: usize) -> usize {
        let recipient = if has_recipient { PEER_ID_SIZE } else { 0 };
        self.mtu
            .saturating_sub(HEADER_SIZE)
            .saturating_sub(PEER_ID_SIZE)
            .saturating_sub(recipient)
            .saturating_sub(FragmentHeader::overhead(message_id_len))
            .saturating_sub(SAFETY_MARGIN)
            .max(16)
    }

    /// Whether a payload can ride in a single packet of its own kind
    pub fn fits_unfragmented(&self, payload_len: usize, has_recipient: bool) -> bool {
        let recipient = if has_recipient { PEER_ID_SIZE } else { 0 };
        payload_len
            <= self
                .mtu
                .saturating_sub(HEADER_SIZE)
                .saturating_sub(PEER_ID_SIZE)
                .saturating_sub(recipient)
                .saturating_sub(SAFETY_MARGIN)
    }

    /// Build the packets for one outbound message
    ///
    /// Payloads that fit are emitted as a single packet of `kind`;
    /// larger payloads become FRAGMENT_START/CONTINUE/END packets.
    pub fn fragment_message(
        &self,
        kind: MessageKind,
        payload: &[u8],
        sender: PeerId,
        recipient: Option<PeerId>,
        ttl: u8,
        message_id: &str,
        timestamp_ms: u64,
    ) -> Vec<Packet> {
        let build = |kind: MessageKind, body: Vec<u8>| {
            let mut packet = Packet::new(kind, sender, body, timestamp_ms).with_ttl(ttl);
            if let Some(recipient) = recipient {
                packet = packet.with_recipient(recipient);
            }
            packet
        };

        if self.fits_unfragmented(payload.len(), recipient.is_some()) {
            return vec![build(kind, payload.to_vec())];
        }

        let chunk_size = self.max_chunk(recipient.is_some(), message_id.len());
        let count = payload.len().div_ceil(chunk_size);

        tracing::debug!(
            "fragmenting {} bytes into {} chunks of <= {} (mtu {})",
            payload.len(),
            count,
            chunk_size,
            self.mtu
        );

        payload
            .chunks(chunk_size)
            .enumerate()
            .map(|(index, chunk)| {
                let header = FragmentHeader {
                    message_id: message_id.to_string(),
                    total_size: payload.len() as u32,
                    fragment_count: count as u16,
                    fragment_index: index as u16,
                };
                let mut body = header.encode();
                body.extend_from_slice(chunk);

                let frag_kind = if index == 0 {
                    MessageKind::FragmentStart
                } else if index == count - 1 {
                    MessageKind::FragmentEnd
                } else {
                    MessageKind::FragmentContinue
                };
                build(frag_kind, body)
            })
            .collect()
    }
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self::new(DEFAULT_MTU)
    }
}

struct ReassemblyState {
    total_size: u32,
    fragment_count: u16,
    fragments: HashMap<u16, Vec<u8>>,
    first_seen_ms: u64,
}

impl ReassemblyState {
    fn is_complete(&self) -> bool {
        self.fragments.len() == self.fragment_count as usize
    }

    fn reconstruct(&self) -> Option<Vec<u8>> {
        let mut payload = Vec::with_capacity(self.total_size as usize);
        for index in 0..self.fragment_count {
            payload.extend_from_slice(self.fragments.get(&index)?);
        }
        Some(payload)
    }
}

/// Reorders and reconstructs fragmented messages, keyed by message id
#[derive(Default)]
pub struct Reassembler {
    pending: HashMap<String, ReassemblyState>,
}

/// Reassembly accounting
#[derive(Debug, Clone, Copy, Default)]
pub struct ReassemblyStats {
    pub incomplete: usize,
    pub completed: u64,
    pub purged: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one fragment; returns the payload once all pieces arrived
    pub fn absorb(
        &mut self,
        header: FragmentHeader,
        chunk: &[u8],
        now_ms: u64,
    ) -> Result<Option<Vec<u8>>, FragmentError> {
        if header.fragment_count == 0 || header.fragment_index >= header.fragment_count {
            return Err(FragmentError::MetadataMismatch);
        }
        if header.total_size as usize > MAX_PAYLOAD_SIZE {
            return Err(FragmentError::OversizeTotal(header.total_size));
        }

        let state = self
            .pending
            .entry(header.message_id.clone())
            .or_insert_with(|| ReassemblyState {
                total_size: header.total_size,
                fragment_count: header.fragment_count,
                fragments: HashMap::new(),
                first_seen_ms: now_ms,
            });

        if state.total_size != header.total_size || state.fragment_count != header.fragment_count {
            // Conflicting metadata poisons the whole message
            self.pending.remove(&header.message_id);
            return Err(FragmentError::MetadataMismatch);
        }

        state
            .fragments
            .entry(header.fragment_index)
            .or_insert_with(|| chunk.to_vec());

        if !state.is_complete() {
            return Ok(None);
        }

        let state = self
            .pending
            .remove(&header.message_id)
            .expect("state present");
        match state.reconstruct() {
            Some(payload) if payload.len() == state.total_size as usize => {
                tracing::debug!(
                    "reassembled message {} ({} bytes from {} fragments)",
                    header.message_id,
                    payload.len(),
                    state.fragment_count
                );
                Ok(Some(payload))
            }
            _ => Err(FragmentError::MetadataMismatch),
        }
    }

    /// Drop states whose first fragment is older than the timeout
    pub fn purge_expired(&mut self, now_ms: u64) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, state| now_ms.saturating_sub(state.first_seen_ms) < REASSEMBLY_TIMEOUT_MS);
        let purged = before - self.pending.len();
        if purged > 0 {
            tracing::debug!("purged {} expired reassembly states", purged);
        }
        purged
    }

    pub fn incomplete_count(&self) -> usize {
        self.pending.len()
    }
}
