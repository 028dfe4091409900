//! Pairing Engine — the sensor enrollment state machine: pending-request
//! table, 30 s timeouts, the operator-acceptance gate, and capability
//! intake.
//!
//! The pairing timeout is a monotonic comparison evaluated by the shared
//! watchdog tick (the same tick that sweeps the transmission reassembler in
//! `reassembler.rs`), not a spawned task per request — see SPEC_FULL §9.
//!
//! This deliberately does not re-implement the original's signed pairing
//! confirmation (RSA-signed characteristic write): the sole acceptance gate
//! is the operator calling `accept`, per SPEC_FULL's resolution of that Open
//! Question. `on_pair_confirmation` is kept for interface completeness but
//! is a no-op in this design — `accept` already completes enrollment
//! synchronously.
//!
//! `PAIRING-CANCELED` and `PAIRING-TIMEOUT` (spec.md §4.E's event list) trace
//! to the original's two-phase pairing (an operator-selected "pairing with"
//! window awaiting the signed confirmation write, superseded by a second
//! `accept` or a 30s timeout). With the signed-confirmation phase removed,
//! `accept` completes synchronously and that window no longer exists, so
//! neither event has a reachable emission site here — the events are kept in
//! the taxonomy for protocol-surface parity, not wired to a synthetic
//! timer.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tokio::sync::{broadcast, RwLock};

use crate::codec::{self, Mac};
use crate::error::{PairingError, ProtocolError};
use crate::events::GatewayEvent;
use crate::registry::{Activity, Datatype, HardwareModel, Registry};

const PENDING_TIMEOUT: Duration = Duration::from_secs(30);

bitflags! {
    /// Byte 0 of the capability announcement payload.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        const AUDIO = 0b0001;
        const TEMPERATURE = 0b0010;
        const VIBRATION = 0b0100;
        const FLUX = 0b1000;
    }
}

impl Capabilities {
    pub fn to_datatypes(self) -> BTreeSet<Datatype> {
        let mut set = BTreeSet::new();
        if self.contains(Capabilities::VIBRATION) {
            set.insert(Datatype::Vibration);
        }
        if self.contains(Capabilities::AUDIO) {
            set.insert(Datatype::Audio);
        }
        if self.contains(Capabilities::TEMPERATURE) {
            set.insert(Datatype::Temperature);
        }
        if self.contains(Capabilities::FLUX) {
            set.insert(Datatype::Flux);
        }
        set
    }
}

/// Decoded capability announcement payload (SPEC_FULL §4.E).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapabilityAnnouncement {
    pub capabilities: Capabilities,
    pub collection_capacity: u32,
    pub hardware_model: HardwareModel,
}

/// Decode the fixed 6-byte capability payload.
pub fn decode_capability_payload(payload: &[u8]) -> Result<CapabilityAnnouncement, ProtocolError> {
    if payload.len() != 6 {
        return Err(ProtocolError::BadCapabilityLength(payload.len()));
    }
    let capabilities = Capabilities::from_bits_truncate(payload[0]);
    let collection_capacity = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
    let hardware_model = HardwareModel::from_code(payload[5]);
    Ok(CapabilityAnnouncement { capabilities, collection_capacity, hardware_model })
}

/// In-memory pending pairing state for one not-yet-enrolled address.
#[derive(Clone, Debug)]
pub struct PairingRequest {
    pub capabilities: Capabilities,
    pub collection_capacity: u32,
    pub announced_model: HardwareModel,
    pub announced_sensors: bool,
    pub is_paired: bool,
    last_activity: Instant,
}

impl PairingRequest {
    fn new() -> Self {
        Self {
            capabilities: Capabilities::empty(),
            collection_capacity: 0,
            announced_model: HardwareModel::Unknown,
            announced_sensors: false,
            is_paired: false,
            last_activity: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

struct PairingState {
    active: bool,
    pending: HashMap<Mac, PairingRequest>,
}

/// Shared, lock-guarded handle to the pairing engine.
#[derive(Clone)]
pub struct PairingEngine {
    state: Arc<RwLock<PairingState>>,
    registry: Registry,
    events: broadcast::Sender<GatewayEvent>,
}

impl PairingEngine {
    pub fn new(registry: Registry, events: broadcast::Sender<GatewayEvent>) -> Self {
        Self { state: Arc::new(RwLock::new(PairingState { active: false, pending: HashMap::new() })), registry, events }
    }

    fn emit(&self, tag_and_arg: impl Into<String>) {
        let _ = self.events.send(GatewayEvent::Msg(tag_and_arg.into()));
    }

    pub async fn enable(&self) {
        self.state.write().await.active = true;
    }

    pub async fn disable(&self) {
        self.state.write().await.active = false;
        self.emit("PAIRING-DISABLED");
    }

    pub async fn is_active(&self) -> bool {
        self.state.read().await.active
    }

    /// Addresses with `announced_sensors == true` — awaiting operator accept.
    pub async fn list_pending(&self) -> Vec<Mac> {
        self.state
            .read()
            .await
            .pending
            .iter()
            .filter(|(_, req)| req.announced_sensors)
            .map(|(addr, _)| *addr)
            .collect()
    }

    /// A BLE connection opened for `address`.
    pub async fn on_connect(&self, address: Mac) {
        if self.registry.get_by_address(&address).await.is_some() {
            self.emit(format!("SENSOR-CONNECTED:{}", codec::mac_to_string(&address)));
            self.registry.touch_last_seen(&address, Activity::Idle).await;
            return;
        }
        let mut state = self.state.write().await;
        // A fresh connect resets any stale pending entry for this address.
        state.pending.insert(address, PairingRequest::new());
    }

    /// The BLE connection for `address` closed.
    pub async fn on_disconnect(&self, address: Mac) {
        let mut state = self.state.write().await;
        if state.pending.remove(&address).is_some() {
            self.emit(format!("SENSOR-DISCONNECTED:{}", codec::mac_to_string(&address)));
        }
    }

    /// The capability-announcement characteristic write arrived.
    pub async fn on_capabilities(&self, address: Mac, payload: &[u8]) -> Result<(), ProtocolError> {
        if self.registry.get_by_address(&address).await.is_some() {
            self.emit(format!("REQUEST-SENSOR-EXISTS:{}", codec::mac_to_string(&address)));
            return Ok(());
        }
        let announcement = decode_capability_payload(payload)?;
        let mut state = self.state.write().await;
        let Some(req) = state.pending.get_mut(&address) else {
            // No pending entry (e.g. connect raced the write) — nothing to
            // update; logged upstream by the caller.
            return Ok(());
        };
        req.capabilities = announcement.capabilities;
        req.collection_capacity = announcement.collection_capacity;
        req.announced_model = announcement.hardware_model;
        req.announced_sensors = true;
        req.touch();
        drop(state);
        self.emit(format!("REQUEST-NEW:{}", codec::mac_to_string(&address)));
        Ok(())
    }

    /// Operator accepts a pending, announced request, completing enrollment.
    pub async fn accept(&self, address: Mac) -> Result<(), PairingError> {
        if !self.is_active().await {
            self.emit("PAIRING-DISABLED");
            return Err(PairingError::Disabled);
        }
        let mut state = self.state.write().await;
        let Some(req) = state.pending.get(&address) else {
            drop(state);
            self.emit(format!("REQUEST-NOT-FOUND:{}", codec::mac_to_string(&address)));
            return Err(PairingError::NotFound(codec::mac_to_string(&address)));
        };
        if !req.announced_sensors {
            drop(state);
            self.emit(format!("REQUEST-NOT-FOUND:{}", codec::mac_to_string(&address)));
            return Err(PairingError::NotFound(codec::mac_to_string(&address)));
        }
        let capabilities = req.capabilities.to_datatypes();
        let capacity = req.collection_capacity as u64;
        let model = req.announced_model;
        state.pending.remove(&address);
        drop(state);

        self.emit(format!("PAIRING-WITH:{}", codec::mac_to_string(&address)));
        self.registry.add(address, capabilities, capacity, model).await;
        self.emit(format!("PAIR-SUCCESS:{}", codec::mac_to_string(&address)));
        Ok(())
    }

    /// Vestigial entry point retained for interface completeness; see the
    /// module doc comment. No-op in this design.
    pub async fn on_pair_confirmation(&self, _address: Mac) {}

    /// Evaluated by the shared watchdog tick. Any pending entry idle for 30s
    /// without a completed accept is dropped with `REQUEST-TIMEOUT`.
    pub async fn sweep_timeouts(&self) {
        let mut state = self.state.write().await;
        let now = Instant::now();
        let expired: Vec<Mac> = state
            .pending
            .iter()
            .filter(|(_, req)| now.duration_since(req.last_activity) >= PENDING_TIMEOUT)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &expired {
            state.pending.remove(addr);
        }
        drop(state);
        for addr in expired {
            self.emit(format!("REQUEST-TIMEOUT:{}", codec::mac_to_string(&addr)));
        }
    }
}
