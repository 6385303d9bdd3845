//! BLE transport contract
//!
//! The mesh core consumes this narrow interface; platform backends
//! (CoreBluetooth, BlueZ, Android) implement it in the host app. The
//! in-memory transport here backs tests and the demo binary.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

/// Default event channel depth
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Radio state as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Off,
    On,
    Unauthorized,
    Unknown,
}

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport not ready")]
    NotReady,

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("peer unreachable")]
    PeerUnreachable,

    #[error("negotiated MTU {0} below minimum")]
    MtuTooSmall(u16),
}

/// A peer surfaced by scanning
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub handle: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Inbound transport events
#[derive(Debug, Clone)]
pub enum TransportEvent {
    DeviceDiscovered(DiscoveredPeer),
    Connected { peer: String },
    Disconnected { peer: String },
    /// Bytes notified by a connected peer
    Notify { peer: String, bytes: Vec<u8> },
    MtuChanged { peer: String, mtu: u16 },
}

/// Platform-agnostic BLE transport
///
/// Writes are best-effort: acceptance by the radio does not imply the
/// remote application saw the bytes.
#[async_trait]
pub trait BleTransport: Send + Sync {
    fn state(&self) -> TransportState;

    async fn start_scan(&self) -> Result<(), TransportError>;
    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn start_advertise(
        &self,
        service_uuid: &str,
        characteristic_uuids: &[String],
    ) -> Result<(), TransportError>;
    async fn stop_advertise(&self) -> Result<(), TransportError>;

    async fn connect(&self, peer: &str) -> Result<(), TransportError>;
    async fn disconnect(&self, peer: &str) -> Result<(), TransportError>;

    /// Write one frame to a connected peer
    async fn write(&self, peer: &str, bytes: &[u8]) -> Result<(), TransportError>;

    /// Subscribe to notifications on a peer characteristic
    async fn subscribe(&self, peer: &str, characteristic: &str) -> Result<(), TransportError>;

    /// Handles of currently connected peers
    async fn connected_peers(&self) -> Vec<String>;

    /// Subscribe to the inbound event stream
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

struct MemoryPeerLink {
    events_tx: broadcast::Sender<TransportEvent>,
    mtu: u16,
}

/// In-process transport: linked instances deliver writes as notify
/// events on the other side
pub struct MemoryTransport {
    handle: String,
    mtu: u16,
    state: RwLock<TransportState>,
    links: RwLock<HashMap<String, MemoryPeerLink>>,
    events_tx: broadcast::Sender<TransportEvent>,
    scanning: AtomicBool,
    advertising: AtomicBool,
}

impl MemoryTransport {
    pub fn new(handle: impl Into<String>, mtu: u16) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            handle: handle.into(),
            mtu,
            state: RwLock::new(TransportState::On),
            links: RwLock::new(HashMap::new()),
            events_tx,
            scanning: AtomicBool::new(false),
            advertising: AtomicBool::new(false),
        })
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Wire two transports together as if a BLE connection came up
    pub async fn link(a: &Arc<MemoryTransport>, b: &Arc<MemoryTransport>) {
        let mtu = a.mtu.min(b.mtu);

        a.links.write().await.insert(
            b.handle.clone(),
            MemoryPeerLink {
                events_tx: b.events_tx.clone(),
                mtu,
            },
        );
        b.links.write().await.insert(
            a.handle.clone(),
            MemoryPeerLink {
                events_tx: a.events_tx.clone(),
                mtu,
            },
        );

        let _ = a.events_tx.send(TransportEvent::Connected {
            peer: b.handle.clone(),
        });
        let _ = a.events_tx.send(TransportEvent::MtuChanged {
            peer: b.handle.clone(),
            mtu,
        });
        let _ = b.events_tx.send(TransportEvent::Connected {
            peer: a.handle.clone(),
        });
        let _ = b.events_tx.send(TransportEvent::MtuChanged {
            peer: a.handle.clone(),
            mtu,
        });
    }

    /// Tear the link down from both sides
    pub async fn unlink(a: &Arc<MemoryTransport>, b: &Arc<MemoryTransport>) {
        a.links.write().await.remove(&b.handle);
        b.links.write().await.remove(&a.handle);
        let _ = a.events_tx.send(TransportEvent::Disconnected {
            peer: b.handle.clone(),
        });
        let _ = b.events_tx.send(TransportEvent::Disconnected {
            peer: a.handle.clone(),
        });
    }

    /// Flip the simulated radio state
    pub async fn set_state(&self, state: TransportState) {
        *self.state.write().await = state;
    }
}

#[async_trait]
impl BleTransport for MemoryTransport {
    fn state(&self) -> TransportState {
        // Reads race harmlessly with set_state; tests flip it while idle
        self.state
            .try_read()
            .map(|state| *state)
            .unwrap_or(TransportState::Unknown)
    }

    async fn start_scan(&self) -> Result<(), TransportError> {
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn start_advertise(
        &self,
        service_uuid: &str,
        _characteristic_uuids: &[String],
    ) -> Result<(), TransportError> {
        if *self.state.read().await != TransportState::On {
            return Err(TransportError::NotReady);
        }
        self.advertising.store(true, Ordering::SeqCst);
        tracing::debug!("{} advertising service {}", self.handle, service_uuid);
        Ok(())
    }

    async fn stop_advertise(&self) -> Result<(), TransportError> {
        self.advertising.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, peer: &str) -> Result<(), TransportError> {
        if self.links.read().await.contains_key(peer) {
            Ok(())
        } else {
            Err(TransportError::PeerUnreachable)
        }
    }

    async fn disconnect(&self, peer: &str) -> Result<(), TransportError> {
        if self.links.write().await.remove(peer).is_some() {
            let _ = self.events_tx.send(TransportEvent::Disconnected {
                peer: peer.to_string(),
            });
        }
        Ok(())
    }

    async fn write(&self, peer: &str, bytes: &[u8]) -> Result<(), TransportError> {
        if *self.state.read().await != TransportState::On {
            return Err(TransportError::NotReady);
        }
        let links = self.links.read().await;
        let link = links.get(peer).ok_or(TransportError::PeerUnreachable)?;

        link.events_tx
            .send(TransportEvent::Notify {
                peer: self.handle.clone(),
                bytes: bytes.to_vec(),
            })
            .map_err(|_| TransportError::WriteFailed("peer event loop gone".to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, peer: &str, _characteristic: &str) -> Result<(), TransportError> {
        if self.links.read().await.contains_key(peer) {
            Ok(())
        } else {
            Err(TransportError::PeerUnreachable)
        }
    }

    async fn connected_peers(&self) -> Vec<String> {
        self.links.read().await.keys().cloned().collect()
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}
