//! Link state machine: discovery, connection, auto-reconnect, teardown.
//! Owns the transport channel exclusively; every outbound keystroke routes
//! through [`ConnectionManager::deliver`]. Transport failures are absorbed
//! into retries or a surfaced candidate list, never thrown: short of the
//! radio itself going away there is no unrecoverable state here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::codec::{self, CodecError, KeyCommand};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::scheduler::{Scheduler, TimerKind};
use crate::transport::{
    Advertisement, LinkEvent, PeripheralId, PeripheralRecord, ScanFilter, Transport,
    TransportError,
};

/// All possible states of the link lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LinkState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    /// Dropped or failed; a retry timer is (usually) pending.
    PendingRetry,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Idle => write!(f, "Idle"),
            LinkState::Scanning => write!(f, "Scanning"),
            LinkState::Connecting => write!(f, "Connecting"),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::PendingRetry => write!(f, "PendingRetry"),
        }
    }
}

impl LinkState {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: LinkState) -> bool {
        matches!(
            (self, next),
            (LinkState::Idle, LinkState::Scanning)
                | (LinkState::PendingRetry, LinkState::Scanning)
                | (LinkState::Idle, LinkState::Connecting) // direct user pick
                | (LinkState::Scanning, LinkState::Connecting)
                | (LinkState::PendingRetry, LinkState::Connecting)
                | (LinkState::Connecting, LinkState::Connected)
                | (LinkState::Connecting, LinkState::PendingRetry)
                | (LinkState::Connected, LinkState::PendingRetry)
                // Any state can go quiescent (explicit disconnect, radio gone)
                | (_, LinkState::Idle)
        )
    }
}

/// A specific open channel to one peripheral.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    pub id: PeripheralId,
    pub name: Option<String>,
    /// Maximum frame size; conservative default until negotiated.
    pub max_frame: usize,
    /// True once service discovery completed and frames are accepted.
    pub ready: bool,
}

/// Connection tunables. Times follow the reference behavior: a failed
/// connect backs off longer than a spontaneous drop, because a failure
/// suggests something wrong with the peripheral while a drop is often just
/// transient RF interference.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub filter: ScanFilter,
    /// Discovery window before the single-candidate rule is evaluated.
    pub scan_window: Duration,
    /// Retry delay after a failed connect attempt.
    pub connect_retry_delay: Duration,
    /// Retry delay after a spontaneous disconnect.
    pub drop_retry_delay: Duration,
    /// Frame size assumed before negotiation.
    pub default_max_frame: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            filter: ScanFilter::default(),
            scan_window: Duration::from_secs(2),
            connect_retry_delay: Duration::from_secs(2),
            drop_retry_delay: Duration::from_secs(1),
            default_max_frame: 20,
        }
    }
}

/// Candidate entry published to observers.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateInfo {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Snapshot of the link published on every change.
#[derive(Debug, Clone, Serialize)]
pub struct LinkSnapshot {
    pub state: LinkState,
    pub device_name: Option<String>,
    pub auto_connecting: bool,
    pub candidates: Vec<CandidateInfo>,
}

impl Default for LinkSnapshot {
    fn default() -> Self {
        Self {
            state: LinkState::Idle,
            device_name: None,
            auto_connecting: false,
            candidates: Vec::new(),
        }
    }
}

/// Why an outbound command did not reach the transport.
#[derive(Debug)]
pub enum DeliverError {
    /// No ready channel; the caller sees this as a state problem, not a fault.
    NotReady,
    Codec(CodecError),
    Transport(TransportError),
}

impl std::fmt::Display for DeliverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliverError::NotReady => write!(f, "link not ready"),
            DeliverError::Codec(e) => write!(f, "encode rejected: {e}"),
            DeliverError::Transport(e) => write!(f, "transport: {e}"),
        }
    }
}

impl From<CodecError> for DeliverError {
    fn from(e: CodecError) -> Self {
        DeliverError::Codec(e)
    }
}

impl From<TransportError> for DeliverError {
    fn from(e: TransportError) -> Self {
        DeliverError::Transport(e)
    }
}

/// Owns discovery, connection lifecycle, and the outbound frame path.
pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    scheduler: Arc<Scheduler>,
    metrics: Arc<MetricsRegistry>,

    state: LinkState,
    discovered: Vec<PeripheralRecord>,
    handle: Option<LinkHandle>,
    /// Identifier of the last peripheral we bonded to; survives recording
    /// sessions so expected drops reconnect without user input.
    last_connected: Option<PeripheralId>,
    auto_reconnect: bool,
    auto_connecting: bool,
    adapter_available: bool,
    scan_started_at: Option<Instant>,

    snapshot_tx: watch::Sender<LinkSnapshot>,
    snapshot_rx: watch::Receiver<LinkSnapshot>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        scheduler: Arc<Scheduler>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(LinkSnapshot::default());
        Self {
            config,
            transport,
            scheduler,
            metrics,
            state: LinkState::Idle,
            discovered: Vec::new(),
            handle: None,
            last_connected: None,
            auto_reconnect: true,
            auto_connecting: false,
            adapter_available: false,
            scan_started_at: None,
            snapshot_tx,
            snapshot_rx,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// True once service discovery completed and frames are accepted.
    pub fn is_ready(&self) -> bool {
        self.handle.as_ref().map(|h| h.ready).unwrap_or(false)
    }

    /// Subscribe to link snapshots.
    pub fn subscribe(&self) -> watch::Receiver<LinkSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Begin a scan pass. Valid from Idle or PendingRetry; the discovery
    /// set is cleared and the single-candidate window armed.
    pub fn start_scan(&mut self) {
        if !self.adapter_available {
            warn!("scan requested while radio unavailable");
            return;
        }
        if !matches!(self.state, LinkState::Idle | LinkState::PendingRetry) {
            warn!(state = %self.state, "scan request ignored in this state");
            return;
        }
        self.discovered.clear();
        self.auto_connecting = false;
        self.transition(LinkState::Scanning);
        self.scan_started_at = Some(Instant::now());

        if let Err(e) = self.transport.start_scan(&self.config.filter) {
            warn!(error = %e, "scan failed to start");
            self.transition(LinkState::Idle);
            self.publish();
            return;
        }
        self.scheduler
            .arm_timer(TimerKind::ScanWindow, self.config.scan_window);
        self.publish();
    }

    /// Stop an active scan without connecting.
    pub fn stop_scan(&mut self) {
        if self.state != LinkState::Scanning {
            return;
        }
        self.scheduler.disarm_timer(TimerKind::ScanWindow);
        self.transport.stop_scan();
        self.transition(LinkState::Idle);
        self.publish();
    }

    /// Connect to a candidate. Remembers it as the bonded peripheral so
    /// future drops reconnect without user input.
    pub fn connect(&mut self, id: PeripheralId) {
        if matches!(self.state, LinkState::Connected | LinkState::Connecting) {
            warn!(state = %self.state, "connect request ignored in this state");
            return;
        }
        self.scheduler.disarm_timer(TimerKind::ScanWindow);
        self.transport.stop_scan();
        self.auto_reconnect = true;
        self.last_connected = Some(id);
        self.transition(LinkState::Connecting);
        self.publish();

        if let Err(e) = self.transport.connect(id) {
            self.handle_connect_failure(id, e.to_string());
        }
    }

    /// Explicit user disconnect. Disables auto-reconnect first so the
    /// resulting transport disconnect event does not schedule a retry.
    pub fn disconnect(&mut self) {
        self.auto_reconnect = false;
        self.auto_connecting = false;
        self.scheduler.disarm_timer(TimerKind::ScanWindow);
        self.scheduler.disarm_timer(TimerKind::Reconnect);
        if self.state == LinkState::Scanning {
            self.transport.stop_scan();
        }
        if matches!(self.state, LinkState::Connecting | LinkState::Connected) {
            self.transport.disconnect();
        }
        self.handle = None;
        self.transition(LinkState::Idle);
        info!("disconnected by request");
        self.publish();
    }

    /// Dispatch one transport notification into the state machine.
    pub fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Discovered(adv) => self.on_discovered(adv),

            LinkEvent::Connected { id, name } => {
                if self.state != LinkState::Connecting {
                    debug!(peripheral = %id, state = %self.state, "stale connect event ignored");
                    return;
                }
                self.transition(LinkState::Connected);
                self.handle = Some(LinkHandle {
                    id,
                    name: name.clone(),
                    max_frame: self.config.default_max_frame,
                    ready: false,
                });
                self.auto_connecting = false;
                if let Some(started) = self.scan_started_at {
                    self.metrics.record(
                        metric_names::SCAN_TO_CONNECT,
                        started.elapsed().as_micros() as f64,
                    );
                }
                info!(peripheral = %id, name = name.as_deref().unwrap_or("unknown"), "link_connected");
                self.publish();
            }

            LinkEvent::ConnectFailed { id, reason } => {
                self.handle_connect_failure(id, reason);
            }

            LinkEvent::Disconnected { reason } => {
                if self.state == LinkState::Idle {
                    // Tail of an explicit disconnect; already cleaned up.
                    return;
                }
                info!(
                    reason = reason.as_deref().unwrap_or("none"),
                    "link_disconnected"
                );
                self.handle = None;
                self.auto_connecting = false;
                if self.auto_reconnect {
                    self.transition(LinkState::PendingRetry);
                    self.scheduler
                        .arm_timer(TimerKind::Reconnect, self.config.drop_retry_delay);
                } else {
                    self.transition(LinkState::Idle);
                }
                self.publish();
            }

            LinkEvent::LinkReady { max_frame } => {
                if let Some(handle) = self.handle.as_mut() {
                    handle.max_frame = max_frame.max(codec::MIN_FRAME);
                    handle.ready = true;
                    info!(max_frame = handle.max_frame, "link_ready");
                    if let Some(started) = self.scan_started_at.take() {
                        self.metrics.record(
                            metric_names::LINK_READY,
                            started.elapsed().as_micros() as f64,
                        );
                    }
                } else {
                    warn!("link ready without an open handle");
                }
                self.publish();
            }

            LinkEvent::DataReceived(data) => {
                debug!(len = data.len(), "peripheral_notification");
            }

            LinkEvent::AdapterAvailable(true) => {
                self.adapter_available = true;
                info!("radio available");
                // The reference auto-starts scanning as soon as the radio
                // powers on.
                if self.state == LinkState::Idle {
                    self.auto_reconnect = true;
                    self.start_scan();
                }
            }

            LinkEvent::AdapterAvailable(false) => {
                self.adapter_available = false;
                warn!("radio unavailable, going quiescent");
                self.handle = None;
                self.auto_connecting = false;
                self.scheduler.disarm_timer(TimerKind::ScanWindow);
                self.scheduler.disarm_timer(TimerKind::Reconnect);
                self.transition(LinkState::Idle);
                self.publish();
            }
        }
    }

    fn on_discovered(&mut self, adv: Advertisement) {
        if self.state != LinkState::Scanning {
            return;
        }
        if !self.config.filter.matches(&adv) {
            debug!(name = adv.name.as_deref().unwrap_or(""), "advertisement filtered");
            return;
        }

        if let Some(idx) = self.discovered.iter().position(|r| r.id == adv.id) {
            self.discovered[idx].last_seen = Instant::now();
            self.discovered[idx].rssi = adv.rssi;
            return;
        }

        info!(
            peripheral = %adv.id,
            name = adv.name.as_deref().unwrap_or("unknown"),
            "candidate_discovered"
        );
        self.discovered.push(PeripheralRecord {
            id: adv.id,
            name: adv.name,
            rssi: adv.rssi,
            last_seen: Instant::now(),
        });
        self.publish();

        // Previously bonded peripheral: reconnect immediately, regardless
        // of window state or candidate count.
        if self.auto_reconnect && self.last_connected == Some(adv.id) {
            info!(peripheral = %adv.id, "known peripheral found, reconnecting");
            self.connect(adv.id);
        }
    }

    /// Single-candidate rule: the discovery window elapsed.
    pub fn on_scan_window_elapsed(&mut self) {
        if self.state != LinkState::Scanning {
            return;
        }
        if self.discovered.len() == 1 {
            let id = self.discovered[0].id;
            info!(peripheral = %id, "single candidate, auto-connecting");
            self.auto_connecting = true;
            self.publish();
            self.connect(id);
        } else {
            info!(
                candidates = self.discovered.len(),
                "scan window elapsed, awaiting selection"
            );
            self.auto_connecting = false;
            self.publish();
        }
    }

    /// Retry timer fired: re-enter scanning.
    pub fn on_retry_elapsed(&mut self) {
        if self.state != LinkState::PendingRetry {
            return;
        }
        if !self.auto_reconnect || !self.adapter_available {
            return;
        }
        info!("retrying connection");
        self.start_scan();
    }

    fn handle_connect_failure(&mut self, id: PeripheralId, reason: String) {
        warn!(peripheral = %id, reason = %reason, "connect failed");
        self.handle = None;
        self.auto_connecting = false;
        if self.auto_reconnect {
            self.transition(LinkState::PendingRetry);
            self.scheduler
                .arm_timer(TimerKind::Reconnect, self.config.connect_retry_delay);
        } else {
            self.transition(LinkState::Idle);
        }
        self.publish();
    }

    /// Encode one keystroke command and send its frames in order.
    /// Send failures are absorbed here: logged and returned, never
    /// escalated. A genuinely dead link announces itself through a
    /// disconnect event.
    pub fn deliver(&mut self, cmd: KeyCommand<'_>) -> Result<usize, DeliverError> {
        let handle = match self.handle.as_ref() {
            Some(handle) if handle.ready => handle,
            _ => {
                warn!("cannot send, link not ready");
                return Err(DeliverError::NotReady);
            }
        };

        let frames = codec::encode(&cmd, handle.max_frame)?;
        for frame in &frames {
            let send_started = Instant::now();
            if let Err(e) = self.transport.send(frame) {
                warn!(error = %e, "frame send failed");
                return Err(e.into());
            }
            self.metrics.record(
                metric_names::FRAME_SEND,
                send_started.elapsed().as_micros() as f64,
            );
        }
        Ok(frames.len())
    }

    /// Attempt a state transition; same-state requests are no-ops and
    /// invalid edges are logged and skipped.
    fn transition(&mut self, next: LinkState) {
        let current = self.state;
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "invalid link transition");
            return;
        }
        self.state = next;
        info!(from = %current, to = %next, "link_transition");
    }

    fn publish(&self) {
        let snapshot = LinkSnapshot {
            state: self.state,
            device_name: self.handle.as_ref().and_then(|h| h.name.clone()),
            auto_connecting: self.auto_connecting,
            candidates: self
                .discovered
                .iter()
                .map(|r| CandidateInfo {
                    id: r.id.to_string(),
                    name: r.name.clone(),
                    rssi: r.rssi,
                })
                .collect(),
        };
        let _ = self.snapshot_tx.send(snapshot);
    }
}
