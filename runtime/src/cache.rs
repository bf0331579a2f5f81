//! Kernel cache: in-memory map keyed by IR text, plus a persistent on-disk
//! tier keyed by content hash.
//!
//! The in-memory key owns its copy of the IR text; equality compares the
//! full text (plus device and extra flags) while hashing reuses a value
//! precomputed from the 128-bit content hash, so lookups never rehash IR.
//!
//! On disk, each fresh compile is written to
//! `<cache_dir>/<backend>-<hash>.bin` with a small versioned header. Any
//! mismatch on read (magic, version, backend, hash, truncation) is a silent
//! miss; a newer build simply recompiles.

use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::path::PathBuf;

use xxhash_rust::xxh3::xxh3_64;

use lanejit_dtype::JitBackend;

use crate::compile::KernelData;

/// A compiled kernel plus backend-specific handles. Kernels stay valid from
/// cache insertion until process teardown.
#[derive(Debug)]
pub struct Kernel {
    pub data: KernelData,
    /// Size of the compiled artifact in bytes (for diagnostics).
    pub artifact_size: u32,
}

/// Key of the in-memory kernel cache.
#[derive(Debug)]
pub struct KernelKey {
    pub text: String,
    pub device: i32,
    pub flags: u64,
    hash: u64,
}

impl KernelKey {
    pub fn new(text: String, device: i32, flags: u64, content_hash: u128) -> Self {
        let hash = compute_hash((content_hash >> 64) as u64, device, flags);
        Self { text, device, flags, hash }
    }
}

/// Combine the high half of the content hash with device id and extra flags.
pub fn compute_hash(hash_high: u64, device: i32, flags: u64) -> u64 {
    let mut bytes = [0u8; 20];
    bytes[0..8].copy_from_slice(&hash_high.to_le_bytes());
    bytes[8..12].copy_from_slice(&device.to_le_bytes());
    bytes[12..20].copy_from_slice(&flags.to_le_bytes());
    xxh3_64(&bytes)
}

impl PartialEq for KernelKey {
    fn eq(&self, other: &Self) -> bool {
        self.device == other.device && self.flags == other.flags && self.text == other.text
    }
}

impl Eq for KernelKey {}

impl Hash for KernelKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

// ---------------------------------------------------------------------------
// On-disk tier
// ---------------------------------------------------------------------------

const MAGIC: [u8; 4] = *b"LJKC";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 4 + 4 + 1 + 16 + 8;

/// Directory of the persistent cache (`$LANEJIT_CACHE_DIR`, else
/// `~/.cache/lanejit`).
pub fn cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LANEJIT_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".cache").join("lanejit")
}

fn artifact_path(backend: JitBackend, content_hash: u128) -> PathBuf {
    cache_dir().join(format!("{}-{content_hash:032x}.bin", backend.name()))
}

/// Look up a compiled artifact on disk. Returns `None` on any mismatch.
pub fn disk_load(backend: JitBackend, content_hash: u128) -> Option<Vec<u8>> {
    let path = artifact_path(backend, content_hash);
    let mut file = std::fs::File::open(&path).ok()?;

    let mut header = [0u8; HEADER_SIZE];
    file.read_exact(&mut header).ok()?;

    let valid = header[0..4] == MAGIC
        && u32::from_le_bytes(header[4..8].try_into().unwrap()) == FORMAT_VERSION
        && header[8] == backend as u8
        && u128::from_le_bytes(header[9..25].try_into().unwrap()) == content_hash;
    if !valid {
        tracing::debug!(path = %path.display(), "stale kernel cache entry; ignoring");
        return None;
    }

    let length = u64::from_le_bytes(header[25..33].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; length];
    file.read_exact(&mut payload).ok()?;
    Some(payload)
}

/// Persist a compiled artifact; failures are logged and otherwise ignored.
pub fn disk_write(backend: JitBackend, content_hash: u128, payload: &[u8]) {
    let dir = cache_dir();
    if let Err(err) = std::fs::create_dir_all(&dir) {
        tracing::warn!(%err, "could not create kernel cache directory");
        return;
    }

    let path = artifact_path(backend, content_hash);
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));

    let write = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        header[8] = backend as u8;
        header[9..25].copy_from_slice(&content_hash.to_le_bytes());
        header[25..33].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        file.write_all(&header)?;
        file.write_all(payload)?;
        std::fs::rename(&tmp, &path)
    };

    if let Err(err) = write() {
        tracing::warn!(%err, path = %path.display(), "could not persist kernel");
        let _ = std::fs::remove_file(&tmp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_equality_is_textual() {
        let a = KernelKey::new("kernel x".into(), 0, 0, 1234);
        let b = KernelKey::new("kernel x".into(), 0, 0, 1234);
        let c = KernelKey::new("kernel y".into(), 0, 0, 1234);
        let d = KernelKey::new("kernel x".into(), 1, 0, 1234);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn compute_hash_mixes_inputs() {
        assert_ne!(compute_hash(1, 0, 0), compute_hash(1, 1, 0));
        assert_ne!(compute_hash(1, 0, 0), compute_hash(1, 0, 2));
    }
}
