//! Content digest and running-chain digest primitives.
//!
//! The primitive is a 256-bit cryptographic hash with fixed 32-byte output.
//! BLAKE3 is the implementation; the on-disk container format fixes this
//! choice and any change requires a version bump of the container header
//! (see `container.rs`).

use std::io::{self, Read};

/// A 256-bit content or chain digest.
pub type Digest = [u8; 32];

/// Hashes a complete in-memory buffer.
pub fn digest(bytes: &[u8]) -> Digest {
    *blake3::hash(bytes).as_bytes()
}

/// Hashes a stream incrementally, for payloads too large to buffer whole.
/// Reads until EOF.
pub fn digest_stream<R: Read>(mut reader: R) -> io::Result<Digest> {
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(*hasher.finalize().as_bytes())
}

/// Renders a digest as 64 lowercase hex characters.
pub fn hex(d: &Digest) -> String {
    let mut s = String::with_capacity(64);
    for byte in d {
        s.push_str(&format!("{byte:02x}"));
    }
    s
}

/// Parses 64 lowercase hex characters back into a digest. Rejects uppercase,
/// odd length, or non-hex input — the external surface only ever accepts
/// fully-rendered lowercase digests.
pub fn from_hex(s: &str) -> Option<Digest> {
    if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return None;
    }
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

/// Genesis chain-head value for a container: `H("MSHB_INIT" || container_name)`.
pub fn genesis(container_name: &str) -> Digest {
    let mut buf = Vec::with_capacity(9 + container_name.len());
    buf.extend_from_slice(b"MSHB_INIT");
    buf.extend_from_slice(container_name.as_bytes());
    digest(&buf)
}

/// Advances a container's running chain head by folding in one appended
/// entry: `chain_hash' = H(chain_hash || entry_digest || le64(offset) || le64(length))`.
pub fn chain_step(prev: &Digest, entry_digest: &Digest, offset: u64, length: u64) -> Digest {
    let mut buf = Vec::with_capacity(32 + 32 + 8 + 8);
    buf.extend_from_slice(prev);
    buf.extend_from_slice(entry_digest);
    buf.extend_from_slice(&offset.to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
    digest(&buf)
}
