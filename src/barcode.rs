//! Slip barcodes
//! 13 uppercase base-36 characters derived from a keyed hash, printable on
//! thermal tickets and scannable back through `/bets/scan-and-claim`.
//!
//! Derivation: HMAC-SHA256(secret, round_id + "_" + slip_prefix), take the
//! first 8 bytes big-endian as a u64, base-36 uppercase, left-pad to 13.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const BARCODE_LEN: usize = 13;
const ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// First 8 hex chars of the slip UUID's simple form, uppercased.
pub fn slip_prefix(slip_id: &uuid::Uuid) -> String {
    slip_id.simple().to_string()[..8].to_ascii_uppercase()
}

pub fn derive(secret: &[u8], round_id: &str, prefix: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(round_id.as_bytes());
    mac.update(b"_");
    mac.update(prefix.as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut high = [0u8; 8];
    high.copy_from_slice(&digest[..8]);
    base36_upper(u64::from_be_bytes(high))
}

/// Recompute and compare in constant time. Shape is checked first; a
/// malformed candidate fails without leaking timing on the digest.
pub fn verify(secret: &[u8], round_id: &str, prefix: &str, candidate: &str) -> bool {
    if !is_well_formed(candidate) {
        return false;
    }
    ct_eq(derive(secret, round_id, prefix).as_bytes(), candidate.as_bytes())
}

/// `^[0-9A-Z]{13}$`
pub fn is_well_formed(s: &str) -> bool {
    s.len() == BARCODE_LEN
        && s.bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
}

fn base36_upper(mut v: u64) -> String {
    // u64::MAX < 36^13, so 13 digits always suffice.
    let mut buf = [b'0'; BARCODE_LEN];
    for slot in buf.iter_mut().rev() {
        *slot = ALPHABET[(v % 36) as usize];
        v /= 36;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
