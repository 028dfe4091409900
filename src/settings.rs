//! Settings Server — composes the per-sensor sampling configuration frame
//! on read, and notifies connected sensors to re-read it.
//!
//! `compose_for` is called synchronously from the BLE adapter's settings-
//! characteristic read callback (SPEC_FULL §4.G); it never blocks on I/O.

use crate::codec::{self, Mac};
use crate::registry::{Datatype, Registry};

fn datatype_tag(datatype: Datatype) -> Option<u8> {
    match datatype {
        Datatype::Vibration => Some(0x00),
        Datatype::Audio => Some(0x01),
        Datatype::Temperature => Some(0x02),
        Datatype::Flux => None, // not part of the wire settings frame
    }
}

/// Compose the settings characteristic's read value for `address`. Returns
/// a single `0x00` byte (reject) if the address is not enrolled.
pub async fn compose_for(registry: &Registry, address: &Mac) -> Vec<u8> {
    let Some(sensor) = registry.get_by_address(address).await else {
        return vec![0x00];
    };

    let mut out = Vec::with_capacity(11);
    out.push(if sensor.device_active { 0x01 } else { 0x00 });
    out.extend_from_slice(address);
    let sleep_duration_ms = sensor.wake_up_interval_s.saturating_mul(1000);
    codec::write_u32_le(&mut out, sleep_duration_ms);

    for (datatype, setting) in &sensor.per_type_settings {
        let Some(tag) = datatype_tag(*datatype) else { continue };
        out.push(tag);
        out.push(if setting.active { 0x01 } else { 0x00 });
        let (freq, duration) = if *datatype == Datatype::Temperature {
            (0, 0)
        } else {
            (setting.sampling_frequency_hz, setting.sampling_duration_s)
        };
        codec::write_u32_le(&mut out, freq);
        codec::write_u16_le(&mut out, duration);
    }

    registry.touch_last_seen(address, crate::registry::Activity::Idle).await;
    out
}

/// Handle passed to the BLE adapter so it can push a characteristic-value
/// change to every connected sensor, triggering their settings re-read.
#[async_trait::async_trait]
pub trait SettingsNotifier: Send + Sync {
    async fn notify_all(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HardwareModel;
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn rejects_unknown_address() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(dir.path()).await.unwrap();
        let frame = compose_for(&registry, &[9; 6]).await;
        assert_eq!(frame, vec![0x00]);
    }

    #[tokio::test]
    async fn composes_frame_with_mac_and_sleep_duration() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(dir.path()).await.unwrap();
        let address = [1, 2, 3, 4, 5, 6];
        let caps: BTreeSet<Datatype> = [Datatype::Vibration].into_iter().collect();
        registry.add(address, caps, 4096, HardwareModel::Machmo).await;
        let frame = compose_for(&registry, &address).await;
        assert_eq!(frame[0], 0x00); // device_active defaults to false
        assert_eq!(&frame[1..7], &address);
        let sleep_ms = codec::read_u32_le(&frame[7..11]).unwrap();
        assert_eq!(sleep_ms, 3600 * 1000);
        assert_eq!(frame[11], 0x00); // vibration tag
    }

    #[tokio::test]
    async fn temperature_frequency_and_duration_are_zeroed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(dir.path()).await.unwrap();
        let address = [1, 2, 3, 4, 5, 6];
        let caps: BTreeSet<Datatype> = [Datatype::Temperature].into_iter().collect();
        registry.add(address, caps, 4096, HardwareModel::Machmo).await;
        let frame = compose_for(&registry, &address).await;
        // byte 11 = datatype tag (temperature = 0x02), 12 = active, 13..17 = freq, 17..19 = duration
        assert_eq!(frame[11], 0x02);
        assert_eq!(codec::read_u32_le(&frame[13..17]).unwrap(), 0);
        assert_eq!(codec::read_u16_le(&frame[17..19]).unwrap(), 0);
    }
}
