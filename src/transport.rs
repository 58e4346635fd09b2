//! Transport collaborator seam.
//! The radio is external: a reliable, ordered byte channel with a
//! negotiated maximum frame size and asynchronous notifications. Adapters
//! implement [`Transport`] for outbound requests and push [`LinkEvent`]s
//! into the control queue for everything inbound, which replaces the
//! platform's delegate-callback surface with one tagged event stream.

use std::fmt;
use std::time::Instant;

use uuid::Uuid;

/// Stable identifier of a peripheral, assigned by the platform radio stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeripheralId(pub Uuid);

impl PeripheralId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Advertisement as delivered by the radio during a scan pass.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub service_ids: Vec<Uuid>,
    pub rssi: Option<i16>,
}

/// A peripheral retained by the discovery filter. Ephemeral: the set is
/// cleared at the start of every scan pass.
#[derive(Debug, Clone)]
pub struct PeripheralRecord {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub last_seen: Instant,
}

/// Anti-noise predicate for crowded RF environments: keep only candidates
/// advertising the expected service or carrying the expected name fragment.
#[derive(Debug, Clone)]
pub struct ScanFilter {
    pub service_id: Uuid,
    pub name_fragment: String,
}

impl ScanFilter {
    pub fn matches(&self, adv: &Advertisement) -> bool {
        let name_hit = adv
            .name
            .as_deref()
            .map(|name| name.contains(&self.name_fragment))
            .unwrap_or(false);
        name_hit || adv.service_ids.contains(&self.service_id)
    }
}

impl Default for ScanFilter {
    /// Nordic UART service plus the keyboard peripheral's advertised name.
    fn default() -> Self {
        Self {
            service_id: Uuid::from_u128(0x6E40_0001_B5A3_F393_E0A9_E50E_24DC_CA9E),
            name_fragment: "AirType-KB".to_string(),
        }
    }
}

/// Inbound notifications from the transport adapter, one tagged variant per
/// callback of the platform radio API, dispatched on the control thread.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Advertisement seen during an active scan.
    Discovered(Advertisement),
    /// Physical connect succeeded; service discovery is still in flight.
    Connected {
        id: PeripheralId,
        name: Option<String>,
    },
    ConnectFailed {
        id: PeripheralId,
        reason: String,
    },
    /// Link dropped, spontaneously or as the tail of an explicit disconnect.
    Disconnected {
        reason: Option<String>,
    },
    /// Service discovery finished; the channel now accepts frames of at
    /// most `max_frame` bytes.
    LinkReady {
        max_frame: usize,
    },
    /// Notification payload from the peripheral.
    DataReceived(Vec<u8>),
    /// Radio availability flipped (powered on/off, permission revoked).
    AdapterAvailable(bool),
}

#[derive(Debug)]
pub enum TransportError {
    AdapterUnavailable,
    NotConnected,
    SendFailed(String),
    Platform(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::AdapterUnavailable => write!(f, "radio adapter unavailable"),
            TransportError::NotConnected => write!(f, "no open channel"),
            TransportError::SendFailed(msg) => write!(f, "frame send failed: {msg}"),
            TransportError::Platform(msg) => write!(f, "platform radio error: {msg}"),
        }
    }
}

/// Outbound surface of the radio adapter.
///
/// Implementations must return quickly; operations that take time complete
/// asynchronously via [`LinkEvent`]s pushed through the `EventSender` the
/// bridge hands to [`Transport::bind`] at startup.
pub trait Transport: Send + Sync {
    /// Attach the adapter to the control queue. Called once by the bridge
    /// before any other method.
    fn bind(&self, events: crate::scheduler::EventSender);

    fn start_scan(&self, filter: &ScanFilter) -> Result<(), TransportError>;

    fn stop_scan(&self);

    fn connect(&self, id: PeripheralId) -> Result<(), TransportError>;

    fn disconnect(&self);

    /// Send one frame. Ordered, acknowledged delivery is the adapter's
    /// contract; the caller never retries at this layer.
    fn send(&self, frame: &[u8]) -> Result<(), TransportError>;
}
