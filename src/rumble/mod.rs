//! Rumble codec for the Joy-Con linear resonant actuators
//!
//! Converts a desired (low frequency, high frequency, amplitude) triple into the
//! 9-byte rumble block carried by output report `0x10`. Both motor channels are
//! addressed with the same four bytes, so bytes 5-8 always mirror bytes 1-4.
//!
//! # Packet Layout
//!
//! ```text
//! [0] 0x00
//! [1] high frequency, low byte
//! [2] high frequency amplitude + high frequency high bit
//! [3] low frequency + low frequency amplitude high byte
//! [4] low frequency amplitude, low byte
//! [5..9] copy of [1..5]
//! ```
//!
//! Frequencies and amplitudes use the controller's logarithmic encoding. The
//! codec is pure: identical inputs always produce identical packets.

use std::fmt;

/// Lowest encodable low-band frequency in Hz
pub const LOW_FREQ_MIN_HZ: f64 = 40.875885;
/// Highest encodable low-band frequency in Hz
pub const LOW_FREQ_MAX_HZ: f64 = 626.286133;
/// Lowest encodable high-band frequency in Hz
pub const HIGH_FREQ_MIN_HZ: f64 = 81.75177;
/// Highest encodable high-band frequency in Hz
pub const HIGH_FREQ_MAX_HZ: f64 = 1252.572266;

/// Frequency used for both bands when nothing else is requested
pub const DEFAULT_FREQ_HZ: f64 = 600.0;

/// Length of an encoded rumble block
pub const RUMBLE_PACKET_LEN: usize = 9;

// Amplitude curve segment boundaries
const VERY_LOW_AMPLITUDE: f64 = 0.117;
const LOW_AMPLITUDE: f64 = 0.23;

/// Flag folded into the low-band amplitude word for odd half-steps
const LOW_AMP_HIGH_BIT: i32 = 0x8000;

/// An encoded, immutable 9-byte rumble block
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RumblePacket([u8; RUMBLE_PACKET_LEN]);

impl RumblePacket {
    /// Canonical stop packet: zero amplitude at 600/600 Hz
    pub fn stop() -> Self {
        encode(DEFAULT_FREQ_HZ, DEFAULT_FREQ_HZ, 0.0)
    }

    pub fn as_bytes(&self) -> &[u8; RUMBLE_PACKET_LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for RumblePacket {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<RumblePacket> for [u8; RUMBLE_PACKET_LEN] {
    fn from(packet: RumblePacket) -> Self {
        packet.0
    }
}

impl fmt::Debug for RumblePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RumblePacket({:02X?})", self.0)
    }
}

/// Encodes a rumble request into a 9-byte packet
///
/// Inputs are clamped to the encodable ranges before conversion, so any finite
/// value produces a valid packet. Callers are expected to filter NaN/Infinity
/// before reaching the codec (see [`crate::stimulation::StimulationConfig`]).
///
/// # Examples
///
/// ```rust
/// use tapendos::rumble::encode;
///
/// let packet = encode(600.0, 600.0, 0.5);
/// assert_eq!(packet.as_bytes()[1..5], packet.as_bytes()[5..9]);
/// ```
pub fn encode(low_freq_hz: f64, high_freq_hz: f64, amplitude: f64) -> RumblePacket {
    let low = low_freq_hz.clamp(LOW_FREQ_MIN_HZ, LOW_FREQ_MAX_HZ);
    let high = high_freq_hz.clamp(HIGH_FREQ_MIN_HZ, HIGH_FREQ_MAX_HZ);
    let amplitude = amplitude.clamp(0.0, 1.0);

    let hf = (round_half_up(32.0 * (high * 0.1).log2()) as i32 - 96) * 4;
    let lf = round_half_up(32.0 * (low * 0.1).log2()) as i32 - 64;

    let mut p = round_half_up(high_amplitude_step(amplitude)) as i32;

    // An even step makes the half-step land on a whole number, which the
    // actuator renders noticeably weaker (audible around amplitude 0.45).
    if p > 0 && p % 2 == 0 {
        p += 1;
    }

    let q = low_amplitude_word(p);

    let mut bytes = [0u8; RUMBLE_PACKET_LEN];
    bytes[1] = (hf & 0xFF) as u8;
    bytes[2] = (p + ((hf >> 8) & 0xFF)) as u8;
    bytes[3] = (lf + (((q as u32) >> 8) & 0xFF) as i32) as u8;
    bytes[4] = (q & 0xFF) as u8;
    bytes.copy_within(1..5, 5);

    RumblePacket(bytes)
}

/// Three-segment logarithmic amplitude curve
fn high_amplitude_step(amplitude: f64) -> f64 {
    if amplitude <= 0.0 {
        return 0.0;
    }

    let base = (amplitude * 1000.0).log2() * 32.0 - 96.0;
    if amplitude < VERY_LOW_AMPLITUDE {
        base / (5.0 - amplitude.powi(2)) - 1.0
    } else if amplitude < LOW_AMPLITUDE {
        base - 92.0
    } else {
        base * 2.0 - 246.0
    }
}

/// Derives the low-band amplitude word from the rounded high-band step
fn low_amplitude_word(p: i32) -> i32 {
    let mut q = f64::from(p) * 0.5;
    let remainder = q % 2.0;
    if remainder > 0.0 {
        q -= 1.0;
    }

    let mut word = ((q.trunc() as i32) >> 1) + 64;
    if remainder > 0.0 {
        word |= LOW_AMP_HIGH_BIT;
    }
    word
}

/// Nearest-integer rounding with halves going up, matching the reference vectors
fn round_half_up(value: f64) -> f64 {
    (value + 0.5).floor()
}

/// Formats an amplitude for display, rounded to two decimals
///
/// Non-finite values are rendered as-is.
pub fn format_amplitude(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    let rounded = (value * 100.0).round() / 100.0;
    rounded.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_encode(low: f64, high: f64, amplitude: f64) -> [u8; RUMBLE_PACKET_LEN] {
        let low = low.clamp(LOW_FREQ_MIN_HZ, LOW_FREQ_MAX_HZ);
        let high = high.clamp(HIGH_FREQ_MIN_HZ, HIGH_FREQ_MAX_HZ);
        let hf = (round_half_up(32.0 * (high * 0.1).log2()) as i32 - 96) * 4;
        let lf = round_half_up(32.0 * (low * 0.1).log2()) as i32 - 64;
        let p = round_half_up(high_amplitude_step(amplitude.clamp(0.0, 1.0))) as i32;
        let q = low_amplitude_word(p);
        let mut bytes = [0u8; RUMBLE_PACKET_LEN];
        bytes[1] = (hf & 0xFF) as u8;
        bytes[2] = (p + ((hf >> 8) & 0xFF)) as u8;
        bytes[3] = (lf + ((q >> 8) & 0xFF)) as u8;
        bytes[4] = (q & 0xFF) as u8;
        bytes.copy_within(1..5, 5);
        bytes
    }

    #[test]
    fn packet_is_nine_bytes_with_mirrored_channels() {
        for amplitude in [0.0, 0.05, 0.1, 0.2, 0.3, 0.45, 0.5, 0.75, 1.0] {
            let packet = encode(320.0, 640.0, amplitude);
            let bytes = packet.as_bytes();
            assert_eq!(bytes.len(), RUMBLE_PACKET_LEN);
            assert_eq!(bytes[0], 0);
            assert_eq!(bytes[1..5], bytes[5..9], "amplitude {amplitude}");
        }
    }

    #[test]
    fn golden_vector_half_amplitude() {
        let packet = encode(600.0, 600.0, 0.5);
        assert_eq!(
            packet.as_bytes(),
            &[0x00, 116, 138, 253, 97, 116, 138, 253, 97]
        );
    }

    #[test]
    fn stop_packet_vector() {
        assert_eq!(
            RumblePacket::stop().as_bytes(),
            &[0x00, 116, 1, 125, 64, 116, 1, 125, 64]
        );
    }

    #[test]
    fn additional_reference_vectors() {
        assert_eq!(
            encode(600.0, 600.0, 1.0).as_bytes(),
            &[0, 116, 202, 253, 113, 116, 202, 253, 113]
        );
        assert_eq!(
            encode(600.0, 600.0, 0.1).as_bytes(),
            &[0, 116, 24, 253, 69, 116, 24, 253, 69]
        );
        assert_eq!(
            encode(600.0, 600.0, 0.2).as_bytes(),
            &[0, 116, 58, 253, 77, 116, 58, 253, 77]
        );
        assert_eq!(
            encode(300.0, 300.0, 0.3).as_bytes(),
            &[0, 244, 89, 221, 85, 244, 89, 221, 85]
        );
        assert_eq!(
            encode(160.0, 320.0, 0.8).as_bytes(),
            &[0, 0, 180, 192, 108, 0, 180, 192, 108]
        );
    }

    #[test]
    fn weak_vibration_correction_changes_packet() {
        let corrected = encode(600.0, 600.0, 0.45);
        assert_eq!(
            corrected.as_bytes(),
            &[0, 116, 128, 253, 95, 116, 128, 253, 95]
        );

        let naive = naive_encode(600.0, 600.0, 0.45);
        assert_eq!(naive, [0, 116, 127, 253, 95, 116, 127, 253, 95]);
        assert_ne!(corrected.as_bytes(), &naive);
    }

    #[test]
    fn amplitude_is_clamped() {
        assert_eq!(encode(600.0, 600.0, -0.5), encode(600.0, 600.0, 0.0));
        assert_eq!(encode(600.0, 600.0, 1.5), encode(600.0, 600.0, 1.0));
    }

    #[test]
    fn frequencies_are_clamped_to_bounds() {
        let too_low = encode(10.0, 10.0, 0.5);
        let at_min = encode(LOW_FREQ_MIN_HZ, HIGH_FREQ_MIN_HZ, 0.5);
        assert_eq!(too_low, at_min);
        assert_eq!(too_low.as_bytes(), &[0, 4, 137, 129, 97, 4, 137, 129, 97]);

        let too_high = encode(1000.0, 2000.0, 0.5);
        let at_max = encode(LOW_FREQ_MAX_HZ, HIGH_FREQ_MAX_HZ, 0.5);
        assert_eq!(too_high, at_max);
        assert_eq!(
            too_high.as_bytes(),
            &[0, 252, 138, 255, 97, 252, 138, 255, 97]
        );
    }

    #[test]
    fn encoding_is_pure() {
        assert_eq!(encode(600.0, 600.0, 0.0), encode(600.0, 600.0, 0.0));
        assert_eq!(encode(250.0, 900.0, 0.6), encode(250.0, 900.0, 0.6));
    }

    #[test]
    fn different_parameters_give_different_packets() {
        let a = encode(300.0, 300.0, 0.3);
        let b = encode(600.0, 600.0, 0.5);
        let c = encode(400.0, 800.0, 0.8);
        assert_ne!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn amplitude_display() {
        assert_eq!(format_amplitude(0.5), "0.5");
        assert_eq!(format_amplitude(0.349), "0.35");
        assert_eq!(format_amplitude(1.0), "1");
        assert_eq!(format_amplitude(f64::NAN), "NaN");
    }
}
