//! Z-Wave serial frame checksum
//!
//! From the Serial API framing rules:
//! 1. Start from 0xFF
//! 2. XOR every byte after SOF (length, type, function, payload, callback id)
//! 3. The result is appended as the last byte of the frame
//!
//! A well-formed frame therefore XORs to zero over bytes `1..=checksum`.

use tracing::trace;

/// Seed of the running XOR
pub const CHECKSUM_SEED: u8 = 0xFF;

/// Calculate the checksum of the bytes that follow SOF
///
/// # Examples
///
/// ```
/// use zwrust_core::checksum;
///
/// // GetVersion request: [len, type, function]
/// let checksum = checksum::calculate(&[0x03, 0x00, 0x15]);
/// assert_eq!(checksum, 0xE9);
/// ```
pub fn calculate(data: &[u8]) -> u8 {
    let checksum = data.iter().fold(CHECKSUM_SEED, |acc, b| acc ^ b);

    trace!(
        len = data.len(),
        checksum = format!("0x{:02X}", checksum),
        "Calculated checksum"
    );

    checksum
}

/// Verify the checksum of a complete frame (SOF included)
///
/// Returns `false` for frames shorter than SOF + length + checksum.
pub fn verify_frame(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }

    frame[1..].iter().fold(CHECKSUM_SEED, |acc, b| acc ^ b) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_checksum_known_frame() {
        // 01 03 00 15 E9 is the canonical GetVersion request
        assert_eq!(calculate(&[0x03, 0x00, 0x15]), 0xE9);
        assert!(verify_frame(&[0x01, 0x03, 0x00, 0x15, 0xE9]));
    }

    #[test]
    fn test_checksum_empty() {
        assert_eq!(calculate(&[]), CHECKSUM_SEED);
    }

    #[test]
    fn test_verify_rejects_corruption() {
        assert!(!verify_frame(&[0x01, 0x03, 0x00, 0x15, 0xE8]));
    }

    #[test]
    fn test_verify_too_short() {
        assert!(!verify_frame(&[0x01, 0x00]));
    }

    proptest! {
        #[test]
        fn prop_appended_checksum_verifies(body in proptest::collection::vec(any::<u8>(), 1..200)) {
            let mut frame = vec![0x01];
            frame.extend_from_slice(&body);
            let checksum = calculate(&body);
            frame.push(checksum);

            prop_assert!(verify_frame(&frame));
        }
    }
}
