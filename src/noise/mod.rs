//! Noise_XX session layer
//!
//! Mutual-authentication handshakes and AEAD transport between peers,
//! X25519 + ChaCha20-Poly1305 + BLAKE2s via snow.
//!
//! ```text
//! initiator                 responder
//!   -> e
//!   <- e, ee, s, es
//!   -> s, se
//!   [ transport keys established both ways ]
//! ```

pub mod manager;

pub use manager::SessionManager;

use sha2::{Digest, Sha256};
use snow::{Builder, HandshakeState, TransportState};
use thiserror::Error;

/// Concrete Noise suite for every session
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Handshakes older than this are discarded
pub const HANDSHAKE_TIMEOUT_MS: u64 = 30_000;

/// Upper bound on a single Noise message
const MAX_NOISE_MESSAGE: usize = 65_535;

/// Noise errors
#[derive(Error, Debug)]
pub enum NoiseError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("authentication failed")]
    AuthFailed,

    #[error("no established session for peer")]
    NoSession,

    #[error("send counter exhausted, session must be renegotiated")]
    CounterExhausted,
}

/// Which side of the handshake this session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseRole {
    Initiator,
    Responder,
}

/// Externally visible session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    HandshakeInProgress,
    Established,
    Failed,
}

enum Inner {
    Handshake(Box<HandshakeState>),
    Transport(TransportState),
    Failed,
}

/// One peer's Noise session
///
/// Counters mirror the AEAD nonces so exhaustion is refused before the
/// cipher state could ever wrap.
pub struct NoiseSession {
    role: NoiseRole,
    inner: Inner,
    started_at_ms: u64,
    send_counter: u64,
    recv_counter: u64,
    remote_static: Option<[u8; 32]>,
}

impl NoiseSession {
    /// Build the initiating side with our static X25519 private key
    pub fn new_initiator(local_private_key: &[u8], now_ms: u64) -> Result<Self, NoiseError> {
        let state = builder()?
            .local_private_key(local_private_key)
            .build_initiator()
            .map_err(|e| NoiseError::HandshakeFailed(e.to_string()))?;
        Ok(Self {
            role: NoiseRole::Initiator,
            inner: Inner::Handshake(Box::new(state)),
            started_at_ms: now_ms,
            send_counter: 0,
            recv_counter: 0,
            remote_static: None,
        })
    }

    /// Build the responding side with our static X25519 private key
    pub fn new_responder(local_private_key: &[u8], now_ms: u64) -> Result<Self, NoiseError> {
        let state = builder()?
            .local_private_key(local_private_key)
            .build_responder()
            .map_err(|e| NoiseError::HandshakeFailed(e.to_string()))?;
        Ok(Self {
            role: NoiseRole::Responder,
            inner: Inner::Handshake(Box::new(state)),
            started_at_ms: now_ms,
            send_counter: 0,
            recv_counter: 0,
            remote_static: None,
        })
    }

    pub fn role(&self) -> NoiseRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        match &self.inner {
            Inner::Handshake(_) => SessionState::HandshakeInProgress,
            Inner::Transport(_) => SessionState::Established,
            Inner::Failed => SessionState::Failed,
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self.inner, Inner::Transport(_))
    }

    /// Whether an unfinished handshake has outlived its window
    pub fn is_timed_out(&self, now_ms: u64) -> bool {
        matches!(self.inner, Inner::Handshake(_))
            && now_ms.saturating_sub(self.started_at_ms) >= HANDSHAKE_TIMEOUT_MS
    }

    /// Remote static X25519 public key, known once the handshake reveals it
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        self.remote_static
    }

    /// First 8 bytes of SHA-256 over the remote static key
    pub fn fingerprint(&self) -> Option<[u8; 8]> {
        self.remote_static.map(|key| {
            let digest = Sha256::digest(key);
            let mut out = [0u8; 8];
            out.copy_from_slice(&digest[..8]);
            out
        })
    }

    /// Produce the next outbound handshake message
    pub fn write_handshake(&mut self) -> Result<Vec<u8>, NoiseError> {
        let state = match &mut self.inner {
            Inner::Handshake(state) => state,
            _ => return Err(NoiseError::HandshakeFailed("handshake already complete".into())),
        };

        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        let len = match state.write_message(&[], &mut buf) {
            Ok(len) => len,
            Err(e) => {
                self.fail();
                return Err(NoiseError::HandshakeFailed(e.to_string()));
            }
        };
        buf.truncate(len);
        self.capture_remote_static();
        self.maybe_promote()?;
        Ok(buf)
    }

    /// Consume one inbound handshake message
    pub fn read_handshake(&mut self, message: &[u8]) -> Result<(), NoiseError> {
        let state = match &mut self.inner {
            Inner::Handshake(state) => state,
            _ => return Err(NoiseError::HandshakeFailed("handshake already complete".into())),
        };

        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        if let Err(e) = state.read_message(message, &mut buf) {
            self.fail();
            return Err(NoiseError::HandshakeFailed(e.to_string()));
        }
        self.capture_remote_static();
        self.maybe_promote()?;
        Ok(())
    }

    /// Encrypt one transport frame; the counter advances only on success
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if self.send_counter >= u64::MAX - 1 {
            return Err(NoiseError::CounterExhausted);
        }
        let transport = match &mut self.inner {
            Inner::Transport(transport) => transport,
            _ => return Err(NoiseError::NoSession),
        };

        let mut buf = vec![0u8; plaintext.len() + 16];
        let len = transport
            .write_message(plaintext, &mut buf)
            .map_err(|_| NoiseError::AuthFailed)?;
        buf.truncate(len);
        self.send_counter += 1;
        Ok(buf)
    }

    /// Decrypt one transport frame
    ///
    /// Any AEAD failure (tampering, replay, reordering) poisons the
    /// session; peers renegotiate from scratch.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let transport = match &mut self.inner {
            Inner::Transport(transport) => transport,
            _ => return Err(NoiseError::NoSession),
        };

        let mut buf = vec![0u8; ciphertext.len()];
        match transport.read_message(ciphertext, &mut buf) {
            Ok(len) => {
                buf.truncate(len);
                self.recv_counter += 1;
                Ok(buf)
            }
            Err(_) => {
                self.fail();
                Err(NoiseError::AuthFailed)
            }
        }
    }

    pub fn send_counter(&self) -> u64 {
        self.send_counter
    }

    pub fn recv_counter(&self) -> u64 {
        self.recv_counter
    }

    /// Mark the session dead
    pub fn fail(&mut self) {
        self.inner = Inner::Failed;
    }

    fn capture_remote_static(&mut self) {
        if self.remote_static.is_some() {
            return;
        }
        if let Inner::Handshake(state) = &self.inner {
            if let Some(key) = state.get_remote_static() {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(key);
                self.remote_static = Some(arr);
            }
        }
    }

    fn maybe_promote(&mut self) -> Result<(), NoiseError> {
        let finished = matches!(&self.inner, Inner::Handshake(state) if state.is_handshake_finished());
        if !finished {
            return Ok(());
        }

        let inner = std::mem::replace(&mut self.inner, Inner::Failed);
        let Inner::Handshake(state) = inner else {
            return Ok(());
        };
        let transport = state
            .into_transport_mode()
            .map_err(|e| NoiseError::HandshakeFailed(e.to_string()))?;
        self.inner = Inner::Transport(transport);
        Ok(())
    }
}

/// Generate a fresh static X25519 keypair for the configured suite
pub fn generate_static_keypair() -> Result<(Vec<u8>, Vec<u8>), NoiseError> {
    let keypair = builder()?
        .generate_keypair()
        .map_err(|e| NoiseError::HandshakeFailed(e.to_string()))?;
    Ok((keypair.private, keypair.public))
}

fn builder<'a>() -> Result<Builder<'a>, NoiseError> {
    let params = NOISE_PATTERN
        .parse()
        .map_err(|_| NoiseError::HandshakeFailed("invalid noise pattern".into()))?;
    Ok(Builder::new(params))
}
