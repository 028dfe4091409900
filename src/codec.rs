//! Fixed-endian wire codec: MAC/UUID textual and byte forms, header integers,
//! and the RTD temperature conversion.
//!
//! Nothing here touches BLE or the filesystem — pure byte-level encode/decode,
//! the same separation of concerns as the teacher's `comm.rs`.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{NumericDomainError, ProtocolError};

/// A 6-byte physical BLE address.
pub type Mac = [u8; 6];

/// A 128-bit UUID stored as four 32-bit words, matching the gateway's own
/// `data_char_uuid`/`settings_char_uuid` representation.
pub type UuidWords = [u32; 4];

/// Render a MAC as `"HH:HH:HH:HH:HH:HH"`, uppercase, byte 0 first.
pub fn mac_to_string(mac: &Mac) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Parse `"HH:HH:HH:HH:HH:HH"` (case-insensitive) into a 6-byte address.
pub fn mac_from_string(s: &str) -> Result<Mac, ProtocolError> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(ProtocolError::BadMacString(s.to_string()));
    }
    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16).map_err(|_| ProtocolError::BadMacString(s.to_string()))?;
    }
    Ok(mac)
}

/// Encode four 32-bit words as 16 little-endian bytes (within each word).
pub fn uuid_words_to_bytes(words: &UuidWords) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (i, word) in words.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    out
}

/// Decode 16 bytes (little-endian within each 32-bit word) into four words.
pub fn uuid_bytes_to_words(bytes: &[u8; 16]) -> UuidWords {
    let mut words = [0u32; 4];
    for i in 0..4 {
        words[i] = u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
    }
    words
}

/// Render the RFC 4122 8-4-4-4-12 lowercase textual form.
pub fn uuid_words_to_string(words: &UuidWords) -> String {
    let b = uuid_words_to_bytes(words);
    uuid::Uuid::from_bytes(b).hyphenated().to_string()
}

/// Parse an RFC 4122 textual UUID into its four-word representation.
pub fn uuid_string_to_words(s: &str) -> Result<UuidWords, ProtocolError> {
    let parsed = uuid::Uuid::parse_str(s).map_err(|_| ProtocolError::BadUuidString(s.to_string()))?;
    Ok(uuid_bytes_to_words(parsed.as_bytes()))
}

/// Read a little-endian `u32` header field out of a BLE payload.
pub fn read_u32_le(buf: &[u8]) -> Option<u32> {
    let mut cursor = Cursor::new(buf);
    cursor.read_u32::<LittleEndian>().ok()
}

/// Write a little-endian `u32` header field.
pub fn write_u32_le(out: &mut Vec<u8>, value: u32) {
    out.write_u32::<LittleEndian>(value).expect("Vec writes never fail");
}

/// Read a little-endian `u16`.
pub fn read_u16_le(buf: &[u8]) -> Option<u16> {
    let mut cursor = Cursor::new(buf);
    cursor.read_u16::<LittleEndian>().ok()
}

/// Write a little-endian `u16`.
pub fn write_u16_le(out: &mut Vec<u8>, value: u16) {
    out.write_u16::<LittleEndian>(value).expect("Vec writes never fail");
}

/// Decode a 32-bit IEEE-754 little-endian float.
pub fn read_f32_le(buf: &[u8]) -> Option<f32> {
    let mut cursor = Cursor::new(buf);
    cursor.read_f32::<LittleEndian>().ok()
}

const ADC_FS: f64 = 32767.0; // 2^15 - 1
const R_REF: f64 = 1500.0;
const R_0: f64 = 1000.0;
const CVD_A: f64 = 3.9083e-3;
const CVD_B: f64 = -5.775e-7;
const QUAD_A: f64 = -6.1414e-4;
const QUAD_B: f64 = 3.907359803;
const QUAD_C: f64 = 999.9979;

/// Convert a signed 16-bit RTD ADC code to degrees Celsius via the
/// Callendar-Van Dusen equation, falling back to the quadratic approximation
/// below the `R >= 1000` branch point. Fails with `NumericDomainError` if the
/// relevant discriminant is negative.
pub fn temperature_from_rtd_adc(adc_code: i16) -> Result<f64, NumericDomainError> {
    let r = (adc_code as f64 / ADC_FS) * R_REF;
    if r >= 1000.0 {
        let discriminant = CVD_A * CVD_A - 4.0 * CVD_B * (1.0 - r / R_0);
        if discriminant < 0.0 {
            return Err(NumericDomainError { adc_code });
        }
        Ok((-CVD_A + discriminant.sqrt()) / (2.0 * CVD_B))
    } else {
        let discriminant = QUAD_B * QUAD_B - 4.0 * QUAD_A * (QUAD_C - r);
        if discriminant < 0.0 {
            return Err(NumericDomainError { adc_code });
        }
        Ok((-QUAD_B + discriminant.sqrt()) / (2.0 * QUAD_A))
    }
}

/// Direct linear conversion used by the `machmomini` hardware model.
pub fn temperature_from_linear_adc(adc_code: i16) -> f64 {
    adc_code as f64 * 0.0625
}

/// Scale a raw vibration ADC sample (signed 16-bit) to g.
pub fn vibration_sample_to_g(raw: i16) -> f64 {
    raw as f64 * 0.000244
}

/// Pack three bytes into a 24-bit unsigned integer, `(b0 << 16) | (b1 << 8) | b2`.
pub fn pack_audio_sample(b: [u8; 3]) -> u32 {
    (b[0] as u32) << 16 | (b[1] as u32) << 8 | b[2] as u32
}

/// Unpack a 24-bit sample back into its three big-endian-ordered bytes
/// (the inverse of `pack_audio_sample`, used by round-trip tests).
pub fn unpack_audio_sample(sample: u32) -> [u8; 3] {
    [
        ((sample >> 16) & 0xFF) as u8,
        ((sample >> 8) & 0xFF) as u8,
        (sample & 0xFF) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── MAC ──────────────────────────────────────────────────────────

    #[test]
    fn mac_round_trips_through_string() {
        let mac: Mac = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01];
        let s = mac_to_string(&mac);
        assert_eq!(s, "AA:BB:CC:DD:EE:01");
        assert_eq!(mac_from_string(&s).unwrap(), mac);
    }

    #[test]
    fn mac_from_string_rejects_short_input() {
        assert!(mac_from_string("AA:BB").is_err());
    }

    #[test]
    fn mac_from_string_is_case_insensitive() {
        let mac = mac_from_string("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(mac, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    }

    // ── UUID ─────────────────────────────────────────────────────────

    #[test]
    fn uuid_words_round_trip_through_bytes() {
        let words: UuidWords = [0x12345678, 0x9abcdef0, 0x11223344, 0x55667788];
        let bytes = uuid_words_to_bytes(&words);
        assert_eq!(uuid_bytes_to_words(&bytes), words);
    }

    #[test]
    fn uuid_words_round_trip_through_string() {
        let words: UuidWords = [0xdeadbeef, 0x0ba3c5d2, 0x4ff48fc2, 0x59461c7a];
        let s = uuid_words_to_string(&words);
        assert_eq!(uuid_string_to_words(&s).unwrap(), words);
    }

    #[test]
    fn uuid_string_is_rfc4122_lowercase() {
        let words: UuidWords = [0, 0, 0, 0];
        let s = uuid_words_to_string(&words);
        assert_eq!(s, "00000000-0000-0000-0000-000000000000");
    }

    // ── header integers ─────────────────────────────────────────────

    #[test]
    fn header_u32_le_round_trips() {
        let mut buf = Vec::new();
        write_u32_le(&mut buf, 0x00001F40);
        assert_eq!(read_u32_le(&buf), Some(0x00001F40));
    }

    #[test]
    fn header_rejects_short_buffer() {
        assert_eq!(read_u32_le(&[1, 2]), None);
    }

    // ── temperature ──────────────────────────────────────────────────

    #[test]
    fn temperature_rtd_branch_above_1000_ohms() {
        // R = (adc/32767) * 1500 >= 1000 when adc >= 21845
        let t = temperature_from_rtd_adc(25000).unwrap();
        assert!(t.is_finite());
    }

    #[test]
    fn temperature_quadratic_branch_below_1000_ohms() {
        let t = temperature_from_rtd_adc(1000).unwrap();
        assert!(t.is_finite());
    }

    #[test]
    fn temperature_linear_model_is_direct_scale() {
        assert_eq!(temperature_from_linear_adc(160), 10.0);
    }

    // ── vibration / audio ────────────────────────────────────────────

    #[test]
    fn vibration_scale_matches_spec_constant() {
        let g = vibration_sample_to_g(1);
        assert!((g - 0.000244).abs() < 1e-9);
    }

    #[test]
    fn audio_sample_round_trips() {
        let bytes = [0x12, 0x34, 0x56];
        let sample = pack_audio_sample(bytes);
        assert_eq!(sample, 0x00123456);
        assert_eq!(unpack_audio_sample(sample), bytes);
    }
}
