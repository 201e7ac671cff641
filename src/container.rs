//! Container (DAT) file: an append-only binary log of `(header, payload)`
//! entries.
//!
//! Entry header layout (110 bytes, all integers little-endian):
//!
//! ```text
//! offset  size  field
//! 0       4     magic = ASCII "MSHB"
//! 4       2     version (u16, current = 1)
//! 6       8     payload_length (u64)
//! 14      64    digest (ASCII hex of the payload digest)
//! 78      32    reserved, must be zero-filled
//! ```
//!
//! Containers are immutable once written other than by append; truncation
//! or rewrite elsewhere in the file is a corruption signal the scanner
//! surfaces as [`SiloError::CorruptHeader`] or [`SiloError::ShortRead`].

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{SiloError, SiloResult};
use crate::hasher;

pub const MAGIC: [u8; 4] = *b"MSHB";
pub const VERSION: u16 = 1;
pub const HEADER_LEN: u64 = 110;
const RESERVED_LEN: usize = 32;
const DIGEST_HEX_LEN: usize = 64;

/// A parsed, validated entry header plus the byte offset at which it begins.
#[derive(Debug, Clone, Copy)]
pub struct EntryHeader {
    pub offset: u64,
    pub version: u16,
    pub payload_length: u64,
    pub digest_hex: [u8; DIGEST_HEX_LEN],
}

impl EntryHeader {
    pub fn digest_hex_str(&self) -> &str {
        // Constructed only from validated ASCII hex bytes in `parse`.
        std::str::from_utf8(&self.digest_hex).expect("digest hex is validated ASCII")
    }
}

fn container_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn parse_header(name: &str, offset: u64, buf: &[u8; HEADER_LEN as usize]) -> SiloResult<EntryHeader> {
    if buf[0..4] != MAGIC {
        return Err(SiloError::CorruptHeader {
            container: name.to_string(),
            offset,
            reason: "magic mismatch".into(),
        });
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != VERSION {
        return Err(SiloError::CorruptHeader {
            container: name.to_string(),
            offset,
            reason: format!("unsupported version {version}"),
        });
    }
    let payload_length = u64::from_le_bytes(buf[6..14].try_into().unwrap());

    let mut digest_hex = [0u8; DIGEST_HEX_LEN];
    digest_hex.copy_from_slice(&buf[14..78]);
    if !digest_hex.iter().all(|b| b.is_ascii_hexdigit()) {
        return Err(SiloError::CorruptHeader {
            container: name.to_string(),
            offset,
            reason: "digest field is not ASCII hex".into(),
        });
    }

    let reserved = &buf[78..110];
    if reserved.iter().any(|b| *b != 0) {
        return Err(SiloError::CorruptHeader {
            container: name.to_string(),
            offset,
            reason: "reserved bytes are non-zero".into(),
        });
    }

    Ok(EntryHeader {
        offset,
        version,
        payload_length,
        digest_hex,
    })
}

/// Walks the file from offset 0, invoking `visitor(header)` for each valid
/// entry header encountered. Stops (returning the triggering error) on the
/// first `CorruptHeader` or `ShortRead`.
pub fn scan<F>(path: &Path, mut visitor: F) -> SiloResult<()>
where
    F: FnMut(&EntryHeader) -> SiloResult<()>,
{
    let name = container_label(path);
    let mut f = File::open(path).map_err(|e| SiloError::io(path, e))?;
    let len = f
        .metadata()
        .map_err(|e| SiloError::io(path, e))?
        .len();

    let mut offset = 0u64;
    while offset < len {
        let mut hdr_buf = [0u8; HEADER_LEN as usize];
        match f.read_exact(&mut hdr_buf) {
            Ok(()) => {}
            Err(_) => {
                return Err(SiloError::ShortRead {
                    container: name.clone(),
                    offset,
                });
            }
        }
        let header = parse_header(&name, offset, &hdr_buf)?;

        // Skip the payload; verify there are enough bytes remaining.
        let payload_end = offset
            .checked_add(HEADER_LEN)
            .and_then(|v| v.checked_add(header.payload_length))
            .ok_or_else(|| SiloError::Internal("offset overflow during scan".into()))?;
        if payload_end > len {
            return Err(SiloError::ShortRead {
                container: name.clone(),
                offset,
            });
        }
        f.seek(SeekFrom::Start(payload_end))
            .map_err(|e| SiloError::io(path, e))?;

        visitor(&header)?;
        offset = payload_end;
    }
    Ok(())
}

/// Seeks to `offset + HEADER_LEN`, reads exactly `length` bytes, and returns
/// them.
pub fn read_entry(path: &Path, offset: u64, length: u64) -> SiloResult<Vec<u8>> {
    let name = container_label(path);
    let mut f = File::open(path).map_err(|e| SiloError::io(path, e))?;
    let payload_offset = offset
        .checked_add(HEADER_LEN)
        .ok_or_else(|| SiloError::Internal("offset overflow in read_entry".into()))?;
    f.seek(SeekFrom::Start(payload_offset))
        .map_err(|e| SiloError::io(path, e))?;

    let mut buf = vec![0u8; length as usize];
    f.read_exact(&mut buf).map_err(|_| SiloError::ShortRead {
        container: name,
        offset,
    })?;
    Ok(buf)
}

/// Opens `path` for append, writes the header (version/length/digest,
/// zero reserved bytes) followed by `payload`, fsyncs the file and its
/// parent directory entry, and returns the byte offset at which the header
/// began.
///
/// A partial write (process killed mid-append) leaves the file longer than
/// the last recorded entry; recovery truncates back to the last known-good
/// offset (see `verifier.rs` / `pipeline.rs`).
pub fn append_entry(path: &Path, entry_digest_hex: &str, payload: &[u8]) -> SiloResult<u64> {
    if entry_digest_hex.len() != DIGEST_HEX_LEN
        || !entry_digest_hex.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return Err(SiloError::Internal(
            "entry_digest_hex must be 64 lowercase hex characters".into(),
        ));
    }

    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .read(true)
        .open(path)
        .map_err(|e| SiloError::io(path, e))?;

    let offset = f.metadata().map_err(|e| SiloError::io(path, e))?.len();

    let mut buf = Vec::with_capacity(HEADER_LEN as usize + payload.len());
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(entry_digest_hex.as_bytes());
    buf.extend_from_slice(&[0u8; RESERVED_LEN]);
    buf.extend_from_slice(payload);

    f.write_all(&buf).map_err(|e| SiloError::io(path, e))?;
    f.sync_all().map_err(|e| SiloError::io(path, e))?;
    sync_parent_dir(path)?;

    Ok(offset)
}

/// Truncates `path` back to `new_len` bytes, for orphaned-bytes recovery
/// after a crash between append and commit. The topic must be quiesced by
/// the caller before invoking this.
pub fn truncate_to(path: &Path, new_len: u64) -> SiloResult<()> {
    let f = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| SiloError::io(path, e))?;
    f.set_len(new_len).map_err(|e| SiloError::io(path, e))?;
    f.sync_all().map_err(|e| SiloError::io(path, e))?;
    sync_parent_dir(path)?;
    Ok(())
}

/// Computes the payload digest for a stored entry and compares it to the
/// header's declared digest.
pub fn verify_payload_digest(path: &Path, header: &EntryHeader) -> SiloResult<bool> {
    let payload = read_entry(path, header.offset, header.payload_length)?;
    let computed = hasher::hex(&hasher::digest(&payload));
    Ok(computed == header.digest_hex_str())
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> SiloResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let dir = File::open(parent).map_err(|e| SiloError::io(parent, e))?;
    dir.sync_all().map_err(|e| SiloError::io(parent, e))?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> SiloResult<()> {
    Ok(())
}
