//! BLE Adapter — advertises the data and config services, and routes GATT
//! callbacks into the Pairing Engine (E), Transmission Reassembler (F), and
//! Settings Server (G).
//!
//! The BLE stack itself is an external collaborator (SPEC_FULL §1). It is
//! modeled here as a `GattHost` trait with the handful of operations a
//! peripheral-role GATT host must supply; `BluerGattHost` is the Linux
//! BlueZ-backed implementation, and `NullGattHost` is a test double. GATT
//! characteristic UUIDs below are carried over verbatim from the original
//! `server/server.go`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, RwLock};

use crate::codec::Mac;
use crate::error::TransportError;
use crate::registry::Datatype;

pub const LOCAL_NAME: &str = "Gateway Server";

pub mod uuids {
    pub const DATA_SERVICE: &str = "2deacc71-7b29-4ff4-8fc2-59461c7a73f5";
    pub const DEBUG_DATA_CHRC: &str = "ad690aaa-cfd4-4b4a-96a6-1110cb6782f6";
    pub const CONTROL_DATA_CHRC: &str = "0b7f9057-38ef-4db5-8e25-64bc66fb1963";
    pub const VIBRATION_DATA_CHRC: &str = "e70ada20-ac8e-45f8-9f5d-593226bb7284";
    pub const FLUX_DATA_CHRC: &str = "68e92ad3-0fb5-4c93-8b99-0d21771576fd";
    pub const AUDIO_DATA_CHRC: &str = "fee1ed78-2a76-490e-8a7c-9b698c9202d1";
    pub const TEMPERATURE_DATA_CHRC: &str = "e64d1230-86ba-46aa-a62d-736d6f58226c";

    pub const CONFIG_SERVICE: &str = "0ffd06bd-5f9c-4583-b852-e92fdbe8e862";
    pub const SETTINGS_CHRC: &str = "4a488208-f3b9-414f-85c7-17eb16c653b0";
    pub const COLLECT_NOW_CHRC: &str = "f6344769-e905-4c4d-a6e8-0aa8b63f1153";
}

/// One routed GATT callback. Read requests carry a `oneshot` reply channel
/// so the event-pump task can answer synchronously from §4.G/§4.H logic
/// without the adapter blocking on it.
pub enum GattEvent {
    Connected(Mac),
    Disconnected(Mac),
    CapabilityWrite(Mac, Vec<u8>),
    DataWrite(Mac, Datatype, Vec<u8>),
    DebugWrite(Mac, Vec<u8>),
    SettingsRead(Mac, oneshot::Sender<Vec<u8>>),
    CollectNowRead(Mac, oneshot::Sender<u8>),
}

/// Operations a peripheral-role GATT host must supply.
#[async_trait::async_trait]
pub trait GattHost: Send + Sync {
    async fn advertise(&self, local_name: &str) -> Result<(), TransportError>;
    async fn stop_advertising(&self);
    /// Push a characteristic-value change so connected clients observe a
    /// notification and re-read the settings characteristic.
    async fn notify_settings_changed(&self);
}

/// Sensors flagged for immediate collection via the control-plane `COLLECT`
/// command; consumed on the next collect-now characteristic read.
#[derive(Clone, Default)]
pub struct CollectFlags {
    flagged: Arc<RwLock<HashSet<Mac>>>,
}

impl CollectFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn flag(&self, address: Mac) {
        self.flagged.write().await.insert(address);
    }

    /// Returns `0x01` exactly once per flagged sensor, `0x00` otherwise.
    pub async fn consume(&self, address: &Mac) -> u8 {
        if self.flagged.write().await.remove(address) {
            0x01
        } else {
            0x00
        }
    }
}

/// Test double that never actually advertises; used by component tests that
/// only need the routing logic around a `GattEvent` stream, not a real
/// radio.
pub struct NullGattHost;

#[async_trait::async_trait]
impl GattHost for NullGattHost {
    async fn advertise(&self, _local_name: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn stop_advertising(&self) {}

    async fn notify_settings_changed(&self) {}
}

/// Linux BlueZ-backed adapter. Wires each GATT characteristic's read/write
/// callback to push a `GattEvent` onto the shared channel, and answers reads
/// through a `oneshot` reply set up per-request.
pub struct BluerGattHost {
    session: bluer::Session,
    adapter: bluer::Adapter,
    events: mpsc::Sender<GattEvent>,
    collect_flags: CollectFlags,
    settings_changed: broadcast::Sender<()>,
    settings_seq: Arc<AtomicU8>,
}

impl BluerGattHost {
    pub async fn connect(events: mpsc::Sender<GattEvent>, collect_flags: CollectFlags) -> Result<Self, TransportError> {
        let session = bluer::Session::new().await.map_err(|e| TransportError::BleUnavailable(e.to_string()))?;
        let adapter = session.default_adapter().await.map_err(|e| TransportError::BleUnavailable(e.to_string()))?;
        adapter.set_powered(true).await.map_err(|e| TransportError::BleUnavailable(e.to_string()))?;
        let (settings_changed, _) = broadcast::channel(8);
        Ok(Self { session, adapter, events, collect_flags, settings_changed, settings_seq: Arc::new(AtomicU8::new(0)) })
    }

    fn data_characteristic(&self, uuid: &str, datatype: Datatype) -> bluer::gatt::local::Characteristic {
        let events = self.events.clone();
        bluer::gatt::local::Characteristic {
            uuid: uuid.parse().expect("UUID constants are valid"),
            write: Some(bluer::gatt::local::CharacteristicWrite {
                write: true,
                write_without_response: true,
                method: bluer::gatt::local::CharacteristicWriteMethod::Fun(Box::new(move |value, request| {
                    let events = events.clone();
                    let address = mac_from_bluer(request.device_address);
                    Box::pin(async move {
                        let _ = events.send(GattEvent::DataWrite(address, datatype, value)).await;
                        Ok(())
                    })
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn debug_characteristic(&self) -> bluer::gatt::local::Characteristic {
        let events = self.events.clone();
        bluer::gatt::local::Characteristic {
            uuid: uuids::DEBUG_DATA_CHRC.parse().expect("UUID constants are valid"),
            write: Some(bluer::gatt::local::CharacteristicWrite {
                write: true,
                write_without_response: true,
                method: bluer::gatt::local::CharacteristicWriteMethod::Fun(Box::new(move |value, request| {
                    let events = events.clone();
                    let address = mac_from_bluer(request.device_address);
                    Box::pin(async move {
                        let _ = events.send(GattEvent::DebugWrite(address, value)).await;
                        Ok(())
                    })
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn settings_characteristic(&self) -> bluer::gatt::local::Characteristic {
        let read_events = self.events.clone();
        let write_events = self.events.clone();
        let settings_changed = self.settings_changed.clone();
        let settings_seq = self.settings_seq.clone();
        bluer::gatt::local::Characteristic {
            uuid: uuids::SETTINGS_CHRC.parse().expect("UUID constants are valid"),
            read: Some(bluer::gatt::local::CharacteristicRead {
                read: true,
                method: bluer::gatt::local::CharacteristicReadMethod::Fun(Box::new(move |request| {
                    let events = read_events.clone();
                    let address = mac_from_bluer(request.device_address);
                    Box::pin(async move {
                        let (tx, rx) = oneshot::channel();
                        let _ = events.send(GattEvent::SettingsRead(address, tx)).await;
                        Ok(rx.await.unwrap_or_else(|_| vec![0x00]))
                    })
                })),
                ..Default::default()
            }),
            write: Some(bluer::gatt::local::CharacteristicWrite {
                write: true,
                write_without_response: true,
                method: bluer::gatt::local::CharacteristicWriteMethod::Fun(Box::new(move |value, request| {
                    let events = write_events.clone();
                    let address = mac_from_bluer(request.device_address);
                    Box::pin(async move {
                        let _ = events.send(GattEvent::CapabilityWrite(address, value)).await;
                        Ok(())
                    })
                })),
                ..Default::default()
            }),
            // `notify_all` (SPEC_FULL §4.G) pushes a characteristic-value
            // change so every connected sensor observes a notification and
            // re-reads its settings frame. The notified value itself carries
            // no payload the sensor needs — only the change matters — so it
            // is a one-byte sequence counter, bumped per `notify_all` call.
            notify: Some(bluer::gatt::local::CharacteristicNotify {
                notify: true,
                method: bluer::gatt::local::CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
                    let mut changed = settings_changed.subscribe();
                    let settings_seq = settings_seq.clone();
                    Box::pin(async move {
                        tokio::spawn(async move {
                            while changed.recv().await.is_ok() {
                                let seq = settings_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
                                if notifier.notify(vec![seq]).await.is_err() {
                                    break;
                                }
                            }
                        });
                    })
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn collect_now_characteristic(&self) -> bluer::gatt::local::Characteristic {
        let collect_flags = self.collect_flags.clone();
        bluer::gatt::local::Characteristic {
            uuid: uuids::COLLECT_NOW_CHRC.parse().expect("UUID constants are valid"),
            read: Some(bluer::gatt::local::CharacteristicRead {
                read: true,
                method: bluer::gatt::local::CharacteristicReadMethod::Fun(Box::new(move |request| {
                    let collect_flags = collect_flags.clone();
                    let address = mac_from_bluer(request.device_address);
                    Box::pin(async move { Ok(vec![collect_flags.consume(&address).await]) })
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// The adapter's single connect/disconnect handler (SPEC_FULL §4.H): a
    /// background task that watches BlueZ device-added/removed events and
    /// each device's `Connected` property, forwarding to the shared
    /// `GattEvent` channel for the pairing engine to consume.
    fn spawn_connection_watcher(&self) {
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let Ok(mut adapter_events) = adapter.discover_devices().await else { return };
            use futures::StreamExt;
            while let Some(event) = adapter_events.next().await {
                if let bluer::AdapterEvent::DeviceAdded(addr) = event {
                    let Ok(device) = adapter.device(addr) else { continue };
                    let events = events.clone();
                    tokio::spawn(async move { watch_device_connection(device, addr, events).await });
                }
            }
        });
    }
}

async fn watch_device_connection(device: bluer::Device, addr: bluer::Address, events: mpsc::Sender<GattEvent>) {
    use futures::StreamExt;
    let Ok(mut changes) = device.events().await else { return };
    let mut was_connected = device.is_connected().await.unwrap_or(false);
    if was_connected {
        let _ = events.send(GattEvent::Connected(addr.0)).await;
    }
    while let Some(bluer::DeviceEvent::PropertyChanged(bluer::DeviceProperty::Connected(now_connected))) = changes.next().await {
        if now_connected && !was_connected {
            let _ = events.send(GattEvent::Connected(addr.0)).await;
        } else if !now_connected && was_connected {
            let _ = events.send(GattEvent::Disconnected(addr.0)).await;
        }
        was_connected = now_connected;
    }
}

#[async_trait::async_trait]
impl GattHost for BluerGattHost {
    async fn advertise(&self, local_name: &str) -> Result<(), TransportError> {
        let data_service = bluer::gatt::local::Service {
            uuid: uuids::DATA_SERVICE.parse().expect("UUID constants are valid"),
            primary: true,
            characteristics: vec![
                self.data_characteristic(uuids::VIBRATION_DATA_CHRC, Datatype::Vibration),
                self.data_characteristic(uuids::FLUX_DATA_CHRC, Datatype::Flux),
                self.data_characteristic(uuids::AUDIO_DATA_CHRC, Datatype::Audio),
                self.data_characteristic(uuids::TEMPERATURE_DATA_CHRC, Datatype::Temperature),
                self.debug_characteristic(),
            ],
            ..Default::default()
        };
        let config_service = bluer::gatt::local::Service {
            uuid: uuids::CONFIG_SERVICE.parse().expect("UUID constants are valid"),
            primary: true,
            characteristics: vec![self.settings_characteristic(), self.collect_now_characteristic()],
            ..Default::default()
        };
        let app = bluer::gatt::local::Application { services: vec![data_service, config_service], ..Default::default() };
        self.adapter
            .serve_gatt_application(app)
            .await
            .map_err(|e| TransportError::AdvertiseFailed(e.to_string()))?;

        let le_advertisement = bluer::adv::Advertisement {
            advertisement_type: bluer::adv::Type::Peripheral,
            local_name: Some(local_name.to_string()),
            service_uuids: [uuids::DATA_SERVICE.parse().expect("UUID constants are valid")].into_iter().collect(),
            ..Default::default()
        };
        self.adapter
            .advertise(le_advertisement)
            .await
            .map_err(|e| TransportError::AdvertiseFailed(e.to_string()))?;

        self.spawn_connection_watcher();
        Ok(())
    }

    async fn stop_advertising(&self) {
        let _ = self.adapter.set_powered(false).await;
    }

    async fn notify_settings_changed(&self) {
        let _ = self.settings_changed.send(());
    }
}

fn mac_from_bluer(address: bluer::Address) -> Mac {
    address.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_flag_is_consumed_once() {
        let flags = CollectFlags::new();
        let address = [1, 2, 3, 4, 5, 6];
        assert_eq!(flags.consume(&address).await, 0);
        flags.flag(address).await;
        assert_eq!(flags.consume(&address).await, 1);
        assert_eq!(flags.consume(&address).await, 0);
    }

    #[tokio::test]
    async fn null_host_advertise_succeeds() {
        let host = NullGattHost;
        assert!(host.advertise(LOCAL_NAME).await.is_ok());
    }
}
