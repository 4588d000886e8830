//! RFC-6238 time-based one-time passwords for stored credential entries.
//!
//! Secrets arrive Base32-encoded (RFC 4648 alphabet, case-insensitive,
//! optional trailing padding). Invalid input of any kind produces no token
//! rather than a partial one: the caller shows an empty field instead of a
//! code that would never verify.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use std::time::{Duration, SystemTime};

/// Smallest accepted token length.
pub const MIN_DIGITS: u32 = 6;
/// Largest accepted token length; ten digits pass the truncated value through
/// without modulo reduction.
pub const MAX_DIGITS: u32 = 10;

/// Hash function underlying the HMAC, per the credential entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha1,
    Sha256,
    Sha512,
}

const PADDING: char = '=';

fn is_base32_digit(c: char) -> bool {
    ('2'..='7').contains(&c)
}

fn is_base32_char(c: char) -> bool {
    c.is_ascii_alphabetic() || is_base32_digit(c)
}

/// All characters must come from the Base32 alphabet; padding only at the end.
fn is_valid_key(key: &str) -> bool {
    match key.find(PADDING) {
        Some(at) => {
            key[..at].chars().all(is_base32_char) && key[at..].chars().all(|c| c == PADDING)
        }
        None => key.chars().all(is_base32_char),
    }
}

/// Index of a character in `ABCDEFGHIJKLMNOPQRSTUVWXYZ234567`.
fn base32_value(c: char) -> u32 {
    if c.is_ascii_alphabetic() {
        (c as u32 - 1) % 32
    } else {
        c as u32 - 24
    }
}

/// Greedy Base32 decode: accumulate 5-bit groups, emit whole bytes.
fn decode_base32(key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() * 5 / 8);
    let mut bits: u32 = 0;
    let mut bit_count: u32 = 0;
    for c in key.chars().filter(|&c| c != PADDING) {
        bits = (bits << 5) | base32_value(c);
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }
    out
}

fn hotp_bytes(secret: &[u8], counter: i64, algorithm: HashAlgorithm) -> Vec<u8> {
    let message = counter.to_be_bytes();
    match algorithm {
        HashAlgorithm::Sha1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(secret).expect("any key length");
            mac.update(&message);
            mac.finalize().into_bytes().to_vec()
        }
        HashAlgorithm::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("any key length");
            mac.update(&message);
            mac.finalize().into_bytes().to_vec()
        }
        HashAlgorithm::Sha512 => {
            let mut mac = Hmac::<Sha512>::new_from_slice(secret).expect("any key length");
            mac.update(&message);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// RFC-4226 §5.4 dynamic truncation: the low nibble of the last byte selects
/// a four-byte window whose top bit is masked off.
fn dynamic_truncation(hmac: &[u8]) -> i32 {
    let offset = (hmac[hmac.len() - 1] & 0xf) as usize;
    (i32::from(hmac[offset] & 0x7f) << 24)
        | (i32::from(hmac[offset + 1]) << 16)
        | (i32::from(hmac[offset + 2]) << 8)
        | i32::from(hmac[offset + 3])
}

fn modulo_reduction(bincode: i32, digits: u32) -> i32 {
    if digits == MAX_DIGITS {
        return bincode;
    }
    bincode % 10i32.pow(digits)
}

fn inputs_valid(key: &str, delta_secs: i64, digits: u32, step: Duration) -> bool {
    let mut valid = true;
    if key.is_empty() || !key.chars().any(is_base32_char) {
        tracing::error!("empty shared secret");
        valid = false;
    }
    if !is_valid_key(key) {
        tracing::error!("shared secret contains invalid characters");
        valid = false;
    }
    if !(MIN_DIGITS..=MAX_DIGITS).contains(&digits) {
        tracing::error!(digits, "invalid number of digits");
        valid = false;
    }
    if step.is_zero() {
        tracing::error!("invalid time step");
        valid = false;
    }
    if delta_secs < 0 {
        tracing::error!(delta_secs, "invalid negative time delta");
        valid = false;
    }
    valid
}

/// Generates a TOTP for the seconds elapsed since the time origin.
///
/// Returns the zero-padded token and the time left in the current step, or
/// `None` when any input is invalid.
pub fn generate_totp(
    base32_key: &str,
    delta: Duration,
    digits: u32,
    step: Duration,
    algorithm: HashAlgorithm,
) -> Option<(String, Duration)> {
    let delta_secs = i64::try_from(delta.as_secs()).ok()?;
    if !inputs_valid(base32_key, delta_secs, digits, step) {
        return None;
    }

    let secret = decode_base32(base32_key);
    let counter = delta_secs / step.as_secs() as i64;
    let code = modulo_reduction(
        dynamic_truncation(&hotp_bytes(&secret, counter, algorithm)),
        digits,
    );
    let remaining = step.as_secs() - (delta_secs as u64 % step.as_secs());
    Some((
        format!("{code:0width$}", width = digits as usize),
        Duration::from_secs(remaining),
    ))
}

/// Instant-pair form: evaluates at `t_eval` against the origin `t0`.
pub fn generate_totp_at(
    base32_key: &str,
    digits: u32,
    step: Duration,
    t0: SystemTime,
    t_eval: SystemTime,
    algorithm: HashAlgorithm,
) -> Option<(String, Duration)> {
    let delta = t_eval.duration_since(t0).ok()?;
    generate_totp(base32_key, delta, digits, step, algorithm)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 Appendix B seeds, Base32-encoded per hash width.
    const KEY_SHA1: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";
    const KEY_SHA256: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZA";
    const KEY_SHA512: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ\
                              GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZDGNA";
    const STEP: Duration = Duration::from_secs(30);

    fn token(key: &str, t: u64, algorithm: HashAlgorithm) -> String {
        generate_totp(key, Duration::from_secs(t), 8, STEP, algorithm)
            .expect("valid inputs")
            .0
    }

    #[test]
    fn rfc6238_sha1_vectors() {
        let expected = [
            (59, "94287082"),
            (1111111109, "07081804"),
            (1111111111, "14050471"),
            (1234567890, "89005924"),
            (2000000000, "69279037"),
            (20000000000, "65353130"),
        ];
        for (t, code) in expected {
            assert_eq!(token(KEY_SHA1, t, HashAlgorithm::Sha1), code, "t = {t}");
        }
    }

    #[test]
    fn rfc6238_sha256_vectors() {
        let expected = [
            (59, "46119246"),
            (1111111109, "68084774"),
            (2000000000, "90698825"),
            (20000000000, "77737706"),
        ];
        for (t, code) in expected {
            assert_eq!(token(KEY_SHA256, t, HashAlgorithm::Sha256), code, "t = {t}");
        }
    }

    #[test]
    fn rfc6238_sha512_vectors() {
        let expected = [
            (59, "90693936"),
            (1111111109, "25091201"),
            (2000000000, "38618901"),
            (20000000000, "47863826"),
        ];
        for (t, code) in expected {
            assert_eq!(token(KEY_SHA512, t, HashAlgorithm::Sha512), code, "t = {t}");
        }
    }

    #[test]
    fn expiration_counts_down_within_step() {
        let (_, remaining) = generate_totp(
            KEY_SHA1,
            Duration::from_secs(59),
            8,
            STEP,
            HashAlgorithm::Sha1,
        )
        .unwrap();
        assert_eq!(remaining, Duration::from_secs(1));
    }

    #[test]
    fn lowercase_and_padding_are_accepted() {
        let padded = format!("{}====", KEY_SHA1.to_ascii_lowercase());
        assert_eq!(
            token(&padded, 59, HashAlgorithm::Sha1),
            token(KEY_SHA1, 59, HashAlgorithm::Sha1)
        );
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let t = Duration::from_secs(59);
        // alphabet violation
        assert!(generate_totp("GEZ1", t, 6, STEP, HashAlgorithm::Sha1).is_none());
        // padding in the middle
        assert!(generate_totp("GE==ZD", t, 6, STEP, HashAlgorithm::Sha1).is_none());
        // digit count out of range
        assert!(generate_totp(KEY_SHA1, t, 5, STEP, HashAlgorithm::Sha1).is_none());
        assert!(generate_totp(KEY_SHA1, t, 11, STEP, HashAlgorithm::Sha1).is_none());
        // zero step
        assert!(generate_totp(KEY_SHA1, t, 6, Duration::ZERO, HashAlgorithm::Sha1).is_none());
        // empty key
        assert!(generate_totp("", t, 6, STEP, HashAlgorithm::Sha1).is_none());
    }

    #[test]
    fn origin_in_the_future_is_rejected() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let t_eval = SystemTime::UNIX_EPOCH + Duration::from_secs(50);
        assert!(
            generate_totp_at(KEY_SHA1, 6, STEP, t0, t_eval, HashAlgorithm::Sha1).is_none()
        );
    }
}
