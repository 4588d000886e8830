//! Proof-of-work login helper.
//!
//! When the API rate-limits a login it hands back a challenge token and an
//! easiness value; the client must find a 4-byte prefix such that SHA-256
//! over `prefix ‖ token × 262144` (4 B + 12 MiB) starts with a 32-bit word,
//! read big-endian, at or below the threshold the easiness encodes. The
//! search is embarrassingly parallel: workers stride the nonce space and the
//! first hit wins.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

const TOKEN_BYTES: usize = 48;
const PREFIX_BYTES: usize = 4;
/// 12 MiB / 48 B
const REPEAT: usize = 262_144;
const BUF_SIZE: usize = PREFIX_BYTES + REPEAT * TOKEN_BYTES;

/// Derives the 32-bit difficulty threshold from the easiness byte.
fn threshold_from_easiness(easiness: u8) -> u32 {
    let e = u32::from(easiness);
    (((e & 63) << 1) + 1) << ((e >> 6) * 7 + 3)
}

/// Decodes the challenge token; `None` unless it is exactly 48 bytes.
fn token_bin(token: &str) -> Option<Vec<u8>> {
    let stripped: String = token
        .chars()
        .filter(|&c| c != '=')
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    let bin = URL_SAFE_NO_PAD.decode(stripped).ok()?;
    if bin.len() != TOKEN_BYTES {
        tracing::error!(
            got = bin.len(),
            expected = TOKEN_BYTES,
            "corrupted hashcash token from server"
        );
        return None;
    }
    Some(bin)
}

/// Allocates the working buffer once and tiles the token across it.
fn init_token_area(token: &[u8]) -> Vec<u8> {
    debug_assert_eq!(token.len(), TOKEN_BYTES);
    let mut buf = vec![0u8; BUF_SIZE];
    buf[PREFIX_BYTES..PREFIX_BYTES + TOKEN_BYTES].copy_from_slice(token);

    // double the filled region until the tile area is complete
    let mut filled = TOKEN_BYTES;
    while filled < REPEAT * TOKEN_BYTES {
        let copy = filled.min(REPEAT * TOKEN_BYTES - filled);
        buf.copy_within(
            PREFIX_BYTES..PREFIX_BYTES + copy,
            PREFIX_BYTES + filled,
        );
        filled += copy;
    }
    buf
}

fn sha256_first_word(data: &[u8]) -> u32 {
    let digest = Sha256::digest(data);
    u32::from_be_bytes(digest[..4].try_into().expect("digest is 32 bytes"))
}

/// Searches one stride of the nonce space. Nonces are enumerated in network
/// byte order: `start, start + stride, …`. Returns the Base64 prefix of the
/// first hit, or an empty string when another worker won.
fn gencash_worker(token: &[u8], easiness: u8, start: u32, stride: u32, stop: &AtomicBool) -> String {
    debug_assert!(stride > 0 && start < stride);

    let threshold = threshold_from_easiness(easiness);
    let mut buf = init_token_area(token);

    let mut n = start;
    while !stop.load(Ordering::Relaxed) {
        buf[..PREFIX_BYTES].copy_from_slice(&n.to_be_bytes());

        if sha256_first_word(&buf) <= threshold {
            stop.store(true, Ordering::Relaxed);
            return URL_SAFE_NO_PAD.encode(&buf[..PREFIX_BYTES]);
        }

        n = n.wrapping_add(stride);
    }

    String::new()
}

/// Solves a login challenge. Returns the Base64-encoded 4-byte prefix, or an
/// empty string when the token is malformed.
///
/// The pool size is `min(max_workers, hardware concurrency)`, at least one.
/// The first solution published wins even when several workers land nearly
/// simultaneously; late winners are discarded under the mutex.
pub fn gencash(token: &str, easiness: u8, max_workers: usize) -> String {
    debug_assert!(max_workers > 0);

    let Some(token_bytes) = token_bin(token) else {
        return String::new();
    };

    let hardware = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let workers = max_workers.clamp(1, hardware.max(1)) as u32;

    let stop = Arc::new(AtomicBool::new(false));
    let winner: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
    let token_bytes = Arc::new(token_bytes);

    let mut pool = Vec::with_capacity(workers as usize);
    for w in 0..workers {
        let stop = Arc::clone(&stop);
        let winner = Arc::clone(&winner);
        let token_bytes = Arc::clone(&token_bytes);
        pool.push(std::thread::spawn(move || {
            let local = gencash_worker(&token_bytes, easiness, w, workers, &stop);
            if !local.is_empty() {
                let mut slot = winner.lock();
                if slot.is_empty() {
                    *slot = local;
                }
            }
        }));
    }

    for handle in pool {
        let _ = handle.join();
    }

    let result = winner.lock().clone();
    result
}

/// Offline verification of a candidate prefix against the same buffer.
pub fn validate_hashcash(token: &str, easiness: u8, prefix_b64: &str) -> bool {
    let Ok(prefix) = URL_SAFE_NO_PAD.decode(prefix_b64) else {
        return false;
    };
    if prefix.len() != PREFIX_BYTES {
        tracing::debug!(got = prefix.len(), "rejecting prefix of wrong width");
        return false;
    }
    let Some(token_bytes) = token_bin(token) else {
        return false;
    };

    let mut buf = init_token_area(&token_bytes);
    buf[..PREFIX_BYTES].copy_from_slice(&prefix);

    sha256_first_word(&buf) <= threshold_from_easiness(easiness)
}
