//! Transmission Reassembler — per-address multi-packet assembly, the idle
//! watchdog, and per-datatype finalization into measurement records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::codec::{self, Mac};
use crate::error::ProtocolError;
use crate::registry::{Datatype, HardwareModel};

const STALE_AFTER: Duration = Duration::from_secs(30);

/// One measurement record, shaped per datatype (SPEC_FULL §9 — a sum type
/// per datatype, not an open map).
#[derive(Debug, Clone, Serialize)]
pub struct MeasurementRecord {
    pub sensor_id: String,
    pub time: DateTime<Utc>,
    pub measurement_type: &'static str,
    pub sampling_frequency: u32,
    pub raw_data: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axis: Option<&'static str>,
}

/// In-memory assembly state for one address. The first packet received
/// while idle is the header (`expected_total_bytes`, `sampling_frequency_hz`);
/// subsequent packets are appended verbatim, in arrival order.
struct Transmission {
    model: HardwareModel,
    datatype: Datatype,
    start_ts: DateTime<Utc>,
    sampling_frequency_hz: u32,
    expected_total_bytes: u32,
    buffer: Vec<u8>,
    last_activity: Instant,
    stale: bool,
}

impl Transmission {
    fn from_header(model: HardwareModel, datatype: Datatype, header: &[u8]) -> Option<Self> {
        if header.len() < 8 {
            return None;
        }
        let expected_total_bytes = codec::read_u32_le(&header[0..4])?;
        let sampling_frequency_hz = codec::read_u32_le(&header[4..8])?;
        Some(Self {
            model,
            datatype,
            start_ts: Utc::now(),
            sampling_frequency_hz,
            expected_total_bytes,
            buffer: Vec::new(),
            last_activity: Instant::now(),
            stale: false,
        })
    }

    fn complete(&self) -> bool {
        self.buffer.len() as u32 >= self.expected_total_bytes
    }
}

/// A fully received transmission, ready for finalization.
pub struct CompletedTransmission {
    pub address: Mac,
    pub model: HardwareModel,
    pub datatype: Datatype,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub sampling_frequency_hz: u32,
    pub buffer: Vec<u8>,
}

/// Shared, lock-guarded handle to the reassembly table.
#[derive(Clone)]
pub struct Reassembler {
    table: Arc<RwLock<HashMap<Mac, Transmission>>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self { table: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Feed one packet. `model` is the enrolled sensor's hardware model
    /// (SPEC_FULL §3 `Transmission.model`), looked up by the caller and
    /// supplied on the header packet — it selects the temperature
    /// conversion branch at finalization. Returns `Some` with the completed
    /// transmission once `received_bytes >= expected_total_bytes`
    /// (SPEC_FULL §4.F).
    pub async fn on_packet(
        &self,
        address: Mac,
        model: HardwareModel,
        datatype: Datatype,
        data: &[u8],
    ) -> Result<Option<CompletedTransmission>, ProtocolError> {
        let mut table = self.table.write().await;
        let needs_header = match table.get(&address) {
            None => true,
            Some(t) => t.stale,
        };

        if needs_header {
            let transmission = Transmission::from_header(model, datatype, data)
                .ok_or(ProtocolError::LengthMismatch { datatype: "header", got: data.len(), unit: 8 })?;
            if transmission.complete() {
                table.remove(&address);
                return Ok(Some(CompletedTransmission {
                    address,
                    model: transmission.model,
                    datatype,
                    start_ts: transmission.start_ts,
                    end_ts: Utc::now(),
                    sampling_frequency_hz: transmission.sampling_frequency_hz,
                    buffer: transmission.buffer,
                }));
            }
            table.insert(address, transmission);
            return Ok(None);
        }

        let transmission = table.get_mut(&address).expect("checked above");
        transmission.buffer.extend_from_slice(data);
        transmission.last_activity = Instant::now();
        if transmission.complete() {
            let transmission = table.remove(&address).expect("checked above");
            return Ok(Some(CompletedTransmission {
                address,
                model: transmission.model,
                datatype: transmission.datatype,
                start_ts: transmission.start_ts,
                end_ts: Utc::now(),
                sampling_frequency_hz: transmission.sampling_frequency_hz,
                buffer: transmission.buffer,
            }));
        }
        Ok(None)
    }

    /// Evaluated every second by the shared watchdog tick (SPEC_FULL §5).
    /// Entries idle for 30s are flagged stale, not deleted — the next
    /// arriving packet for that address transparently starts fresh.
    pub async fn sweep_idle(&self) {
        let mut table = self.table.write().await;
        let now = Instant::now();
        for transmission in table.values_mut() {
            if now.duration_since(transmission.last_activity) >= STALE_AFTER {
                transmission.stale = true;
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.table.read().await.len()
    }

    /// Test-only hook standing in for a real 30s wait: flags `address`'s
    /// entry stale directly, exercising exactly what `sweep_idle` would do
    /// once its threshold elapses, without an actual wall-clock sleep.
    #[cfg(test)]
    async fn force_stale(&self, address: &Mac) {
        if let Some(t) = self.table.write().await.get_mut(address) {
            t.stale = true;
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Finalize a completed transmission into its measurement records, per
/// SPEC_FULL §4.F. A length mismatch is logged by the caller and yields an
/// empty array (no publish).
pub fn finalize(sensor_id: &str, completed: &CompletedTransmission) -> Result<Vec<MeasurementRecord>, ProtocolError> {
    match completed.datatype {
        Datatype::Vibration => finalize_vibration(sensor_id, completed),
        Datatype::Temperature => finalize_temperature(sensor_id, completed),
        Datatype::Audio => finalize_audio(sensor_id, completed, "audio"),
        Datatype::Flux => finalize_audio(sensor_id, completed, "flux"),
    }
}

fn finalize_vibration(sensor_id: &str, completed: &CompletedTransmission) -> Result<Vec<MeasurementRecord>, ProtocolError> {
    let buf = &completed.buffer;
    if buf.len() % 6 != 0 {
        return Err(ProtocolError::LengthMismatch { datatype: "vibration", got: buf.len(), unit: 6 });
    }
    let mut x = Vec::new();
    let mut y = Vec::new();
    let mut z = Vec::new();
    for chunk in buf.chunks_exact(6) {
        x.push(codec::vibration_sample_to_g(i16::from_le_bytes([chunk[0], chunk[1]])));
        y.push(codec::vibration_sample_to_g(i16::from_le_bytes([chunk[2], chunk[3]])));
        z.push(codec::vibration_sample_to_g(i16::from_le_bytes([chunk[4], chunk[5]])));
    }
    let make = |axis: &'static str, raw_data: Vec<f64>| MeasurementRecord {
        sensor_id: sensor_id.to_string(),
        time: completed.end_ts,
        measurement_type: "vibration",
        sampling_frequency: completed.sampling_frequency_hz,
        raw_data,
        axis: Some(axis),
    };
    Ok(vec![make("x", x), make("y", y), make("z", z)])
}

/// Maps an RTD conversion result to the Celsius value used in a measurement
/// record. Returns `None` on a domain error so the caller publishes an
/// empty measurement array instead of a fabricated reading (SPEC_FULL §4.F).
fn temperature_celsius(sensor_id: &str, result: Result<f64, crate::error::NumericDomainError>) -> Option<f64> {
    match result {
        Ok(celsius) => Some(celsius),
        Err(e) => {
            log::warn!("{e}; dropping temperature transmission from {sensor_id}");
            None
        }
    }
}

fn finalize_temperature(sensor_id: &str, completed: &CompletedTransmission) -> Result<Vec<MeasurementRecord>, ProtocolError> {
    let buf = &completed.buffer;
    if buf.len() != 2 {
        return Err(ProtocolError::LengthMismatch { datatype: "temperature", got: buf.len(), unit: 2 });
    }
    let adc_code = i16::from_le_bytes([buf[0], buf[1]]);
    let celsius = if completed.model == HardwareModel::MachmoMini {
        codec::temperature_from_linear_adc(adc_code)
    } else {
        match temperature_celsius(sensor_id, codec::temperature_from_rtd_adc(adc_code)) {
            Some(celsius) => celsius,
            None => return Ok(Vec::new()),
        }
    };
    Ok(vec![MeasurementRecord {
        sensor_id: sensor_id.to_string(),
        time: completed.end_ts,
        measurement_type: "temperature",
        sampling_frequency: completed.sampling_frequency_hz,
        raw_data: vec![celsius],
        axis: None,
    }])
}

fn finalize_audio(sensor_id: &str, completed: &CompletedTransmission, label: &'static str) -> Result<Vec<MeasurementRecord>, ProtocolError> {
    let buf = &completed.buffer;
    if buf.len() % 3 != 0 {
        return Err(ProtocolError::LengthMismatch { datatype: label, got: buf.len(), unit: 3 });
    }
    let mut samples: Vec<f64> = buf
        .chunks_exact(3)
        .map(|c| codec::pack_audio_sample([c[0], c[1], c[2]]) as f64)
        .collect();
    if label == "audio" {
        // Skip the initial run of microphone warm-up silence, bounded to the
        // first 512 samples.
        let scan_limit = samples.len().min(512);
        let first_nonzero = samples[..scan_limit].iter().position(|&s| s != 0.0).unwrap_or(scan_limit);
        samples.drain(0..first_nonzero);
    }
    Ok(vec![MeasurementRecord {
        sensor_id: sensor_id.to_string(),
        time: completed.end_ts,
        measurement_type: label,
        sampling_frequency: completed.sampling_frequency_hz,
        raw_data: samples,
        axis: None,
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Mac {
        [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]
    }

    // S2 — Vibration upload.
    #[tokio::test]
    async fn vibration_upload_completes_on_expected_bytes() {
        let reassembler = Reassembler::new();
        let header = [0x18, 0x00, 0x00, 0x00, 0x40, 0x1F, 0x00, 0x00]; // 24 bytes, 8000 Hz
        assert!(reassembler.on_packet(addr(), HardwareModel::Machmo, Datatype::Vibration, &header).await.unwrap().is_none());
        let sample = [0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
        for _ in 0..3 {
            assert!(reassembler.on_packet(addr(), HardwareModel::Machmo, Datatype::Vibration, &sample).await.unwrap().is_none());
        }
        let completed = reassembler.on_packet(addr(), HardwareModel::Machmo, Datatype::Vibration, &sample).await.unwrap().unwrap();
        assert_eq!(completed.sampling_frequency_hz, 8000);
        let records = finalize("s1", &completed).unwrap();
        assert_eq!(records.len(), 3);
        for record in &records {
            assert_eq!(record.raw_data.len(), 4);
        }
        let x = records.iter().find(|r| r.axis == Some("x")).unwrap();
        assert!((x.raw_data[0] - 0.000244).abs() < 1e-9);
    }

    #[tokio::test]
    async fn zero_length_header_completes_immediately() {
        let reassembler = Reassembler::new();
        let header = [0x00, 0x00, 0x00, 0x00, 0x40, 0x1F, 0x00, 0x00];
        let completed = reassembler.on_packet(addr(), HardwareModel::Machmo, Datatype::Vibration, &header).await.unwrap();
        assert!(completed.is_some());
    }

    #[tokio::test]
    async fn second_header_before_completion_is_appended_not_replaced() {
        let reassembler = Reassembler::new();
        let header = [0x0C, 0x00, 0x00, 0x00, 0x40, 0x1F, 0x00, 0x00]; // 12 bytes expected
        reassembler.on_packet(addr(), HardwareModel::Machmo, Datatype::Vibration, &header).await.unwrap();
        // A second 8-byte chunk arrives before completion — appended as payload.
        let more = [0; 8];
        let completed = reassembler.on_packet(addr(), HardwareModel::Machmo, Datatype::Vibration, &more).await.unwrap();
        assert!(completed.is_none());
        assert_eq!(reassembler.pending_count().await, 1);
    }

    // S3 — Idle-stale recovery: a header + two payload packets sent, then a
    // (simulated) 30s idle period, then a fresh header + full payload.
    // Exactly one completed upload results, for the second header.
    #[tokio::test]
    async fn stale_entry_is_replaced_by_next_header() {
        let reassembler = Reassembler::new();
        let header = [0x0C, 0x00, 0x00, 0x00, 0x40, 0x1F, 0x00, 0x00]; // 12 bytes expected
        reassembler.on_packet(addr(), HardwareModel::Machmo, Datatype::Vibration, &header).await.unwrap();
        reassembler.on_packet(addr(), HardwareModel::Machmo, Datatype::Vibration, &[1, 2, 3, 4]).await.unwrap();
        assert_eq!(reassembler.pending_count().await, 1);

        reassembler.sweep_idle().await; // no real 30s elapsed yet: stays live
        assert_eq!(reassembler.pending_count().await, 1);

        reassembler.force_stale(&addr()).await; // stands in for the watchdog firing at 30s
        let fresh_header = [0x04, 0x00, 0x00, 0x00, 0x40, 0x1F, 0x00, 0x00]; // 4 bytes expected
        assert!(reassembler.on_packet(addr(), HardwareModel::Machmo, Datatype::Vibration, &fresh_header).await.unwrap().is_none());
        let completed = reassembler.on_packet(addr(), HardwareModel::Machmo, Datatype::Vibration, &[9, 9, 9, 9]).await.unwrap().unwrap();
        assert_eq!(completed.buffer, vec![9, 9, 9, 9]); // the stale first partial transmission is gone
        assert_eq!(reassembler.pending_count().await, 0);
    }

    #[tokio::test]
    async fn temperature_requires_exactly_two_bytes() {
        let reassembler = Reassembler::new();
        let header = [0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let completed = reassembler.on_packet(addr(), HardwareModel::Machmo, Datatype::Temperature, &header).await.unwrap();
        assert!(completed.is_none());
        let completed = reassembler.on_packet(addr(), HardwareModel::Machmo, Datatype::Temperature, &[0x10, 0x00]).await.unwrap().unwrap();
        let records = finalize("s1", &completed).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].raw_data.len(), 1);
    }

    #[tokio::test]
    async fn vibration_length_mismatch_is_rejected() {
        let reassembler = Reassembler::new();
        let header = [0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]; // not a multiple of 6
        let completed = reassembler.on_packet(addr(), HardwareModel::Machmo, Datatype::Vibration, &header).await.unwrap().unwrap();
        assert!(finalize("s1", &completed).is_err());
    }

    // machmomini reports temperature as a direct linear scale of the raw ADC
    // code rather than through the RTD Callendar-Van Dusen conversion.
    #[tokio::test]
    async fn machmomini_temperature_uses_linear_conversion() {
        let reassembler = Reassembler::new();
        let header = [0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        reassembler.on_packet(addr(), HardwareModel::MachmoMini, Datatype::Temperature, &header).await.unwrap();
        let adc_code: i16 = 160;
        let completed = reassembler
            .on_packet(addr(), HardwareModel::MachmoMini, Datatype::Temperature, &adc_code.to_le_bytes())
            .await
            .unwrap()
            .unwrap();
        let records = finalize("s1", &completed).unwrap();
        assert_eq!(records[0].raw_data[0], codec::temperature_from_linear_adc(adc_code));
    }

    // A NumericDomainError from the RTD conversion must yield no
    // measurement, never a fabricated reading, for a non-machmomini sensor.
    // No real i16 ADC code drives the CVD/quadratic discriminant negative
    // under these constants, so the error is exercised directly here rather
    // than by searching for a triggering sample.
    #[test]
    fn temperature_domain_error_yields_empty_array_not_raw_adc() {
        let err = crate::error::NumericDomainError { adc_code: i16::MIN };
        assert_eq!(temperature_celsius("s1", Err(err)), None);
    }

    #[test]
    fn audio_trims_leading_silence() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&[0, 0, 0]); // one silent sample
        buffer.extend_from_slice(&[0x00, 0x00, 0x01]); // first real sample
        let completed = CompletedTransmission {
            address: addr(),
            model: HardwareModel::Machmo,
            datatype: Datatype::Audio,
            start_ts: Utc::now(),
            end_ts: Utc::now(),
            sampling_frequency_hz: 22110,
            buffer,
        };
        let records = finalize("s1", &completed).unwrap();
        assert_eq!(records[0].raw_data, vec![1.0]);
    }

    #[test]
    fn flux_does_not_trim_silence() {
        let buffer = vec![0u8; 6]; // two all-zero samples
        let completed = CompletedTransmission {
            address: addr(),
            model: HardwareModel::Machmo,
            datatype: Datatype::Flux,
            start_ts: Utc::now(),
            end_ts: Utc::now(),
            sampling_frequency_hz: 1000,
            buffer,
        };
        let records = finalize("s1", &completed).unwrap();
        assert_eq!(records[0].raw_data.len(), 2);
    }
}
