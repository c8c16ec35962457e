//! # Multi-Pool Config Cache
//!
//! Remembers, per multi-pool name, which banks it ended up needing, so the
//! next run can pre-create them instead of growing on demand.
//!
//! ## Binary Format
//!
//! All integers little-endian; strings are a `u32` byte length followed by
//! UTF-8 bytes.
//!
//! ```text
//! string  class name  "MultiPoolConfigCache"
//! u32     version     1
//! u32     entry count
//! repeat entry count:
//!     string  allocator name
//!     u32     config count
//!     repeat config count:
//!         u32 block size      (ascending, unique)
//!         u32 block count
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, MemoryResult};

/// Class tag written first in every cache file.
pub const CONFIG_CACHE_CLASS: &str = "MultiPoolConfigCache";

/// Current format version.
pub const CONFIG_CACHE_VERSION: u32 = 1;

/// File name used when the engine configuration does not override it.
pub const DEFAULT_CONFIG_CACHE_FILE: &str = ".multiPoolConfig.dat";

/// Shape of one pool bank.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Bytes per block.
    pub block_size: u32,
    /// Number of blocks.
    pub block_count: u32,
}

impl PoolConfig {
    /// Creates a config.
    #[must_use]
    pub const fn new(block_size: u32, block_count: u32) -> Self {
        Self { block_size, block_count }
    }

    /// Converts in-memory bank dimensions; `None` if either exceeds `u32`.
    #[must_use]
    pub fn from_sizes(block_size: usize, block_count: usize) -> Option<Self> {
        Some(Self {
            block_size: u32::try_from(block_size).ok()?,
            block_count: u32::try_from(block_count).ok()?,
        })
    }
}

/// Sorts by block size and merges duplicates, keeping the larger count.
fn normalize(configs: impl IntoIterator<Item = PoolConfig>) -> Vec<PoolConfig> {
    let mut merged: BTreeMap<u32, u32> = BTreeMap::new();
    for config in configs {
        let count = merged.entry(config.block_size).or_insert(0);
        *count = (*count).max(config.block_count);
    }
    merged
        .into_iter()
        .map(|(block_size, block_count)| PoolConfig { block_size, block_count })
        .collect()
}

/// Allocator name → normalised bank configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MultiPoolConfigCache {
    entries: BTreeMap<String, Vec<PoolConfig>>,
}

impl MultiPoolConfigCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of allocator entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no allocator is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recorded configuration of `name`, ascending by block size.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[PoolConfig]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    /// Iterates entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[PoolConfig])> {
        self.entries.iter().map(|(name, configs)| (name.as_str(), configs.as_slice()))
    }

    /// Merges `configs` into the entry for `name`; per block size the
    /// larger count wins.
    pub fn record(&mut self, name: &str, configs: &[PoolConfig]) {
        let previous = self.entries.remove(name).unwrap_or_default();
        let merged = normalize(previous.into_iter().chain(configs.iter().copied()));
        if !merged.is_empty() {
            self.entries.insert(name.to_owned(), merged);
        }
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Encodes the cache.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::CacheFormat`] if a name or count does not fit
    /// a `u32`.
    pub fn to_bytes(&self) -> MemoryResult<Vec<u8>> {
        let mut writer = ByteWriter::default();
        writer.string(CONFIG_CACHE_CLASS)?;
        writer.u32(CONFIG_CACHE_VERSION);
        writer.len(self.entries.len())?;
        for (name, configs) in &self.entries {
            writer.string(name)?;
            writer.len(configs.len())?;
            for config in configs {
                writer.u32(config.block_size);
                writer.u32(config.block_count);
            }
        }
        Ok(writer.finish())
    }

    /// Decodes a cache, rejecting a foreign class, another version,
    /// truncation and trailing bytes.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::CacheFormat`] describing the first problem.
    pub fn from_bytes(bytes: &[u8]) -> MemoryResult<Self> {
        let mut reader = ByteReader::new(bytes);

        let class = reader.string()?;
        if class != CONFIG_CACHE_CLASS {
            return Err(MemoryError::CacheFormat(format!("unexpected class '{class}'")));
        }
        let version = reader.u32()?;
        if version != CONFIG_CACHE_VERSION {
            return Err(MemoryError::CacheFormat(format!(
                "unsupported version {version}, expected {CONFIG_CACHE_VERSION}"
            )));
        }

        let mut cache = Self::new();
        let entry_count = reader.u32()?;
        for _ in 0..entry_count {
            let name = reader.string()?;
            let config_count = reader.u32()?;
            let mut configs = Vec::new();
            for _ in 0..config_count {
                let block_size = reader.u32()?;
                let block_count = reader.u32()?;
                configs.push(PoolConfig { block_size, block_count });
            }
            cache.record(&name, &configs);
        }

        if reader.remaining() != 0 {
            return Err(MemoryError::CacheFormat(format!(
                "{} trailing bytes",
                reader.remaining()
            )));
        }
        Ok(cache)
    }

    /// Writes the cache to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::CacheIo`] if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> MemoryResult<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        fs::write(path, bytes)
            .map_err(|e| MemoryError::CacheIo(format!("{}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), entries = self.len(), "multi-pool config cache saved");
        Ok(())
    }

    /// Reads a cache from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::CacheIo`] if the file cannot be read and
    /// [`MemoryError::CacheFormat`] if its contents are rejected.
    pub fn load(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).map_err(|e| MemoryError::CacheIo(format!("{}: {e}", path.display())))?;
        Self::from_bytes(&bytes)
    }
}

/// The process-wide cache consulted by multi-pool construction.
pub fn config_cache() -> &'static Mutex<MultiPoolConfigCache> {
    static CACHE: OnceLock<Mutex<MultiPoolConfigCache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(MultiPoolConfigCache::new()))
}

#[derive(Default)]
struct ByteWriter {
    bytes: Vec<u8>,
}

impl ByteWriter {
    fn u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn len(&mut self, len: usize) -> MemoryResult<()> {
        let len = u32::try_from(len)
            .map_err(|_| MemoryError::CacheFormat(format!("length {len} exceeds u32")))?;
        self.u32(len);
        Ok(())
    }

    fn string(&mut self, value: &str) -> MemoryResult<()> {
        self.len(value.len())?;
        self.bytes.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    fn take(&mut self, len: usize) -> MemoryResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(MemoryError::CacheFormat(format!(
                "truncated at byte {}: needed {len}, {} left",
                self.position,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    fn u32(&mut self) -> MemoryResult<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn string(&mut self) -> MemoryResult<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| MemoryError::CacheFormat("string is not valid UTF-8".to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env::temp_dir;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn sample() -> MultiPoolConfigCache {
        let mut cache = MultiPoolConfigCache::new();
        cache.record("Worker 2", &[PoolConfig::new(64, 1024), PoolConfig::new(16, 4096)]);
        cache.record("Main", &[PoolConfig::new(32, 2048)]);
        cache
    }

    #[test]
    fn test_from_sizes_rejects_values_past_u32() {
        assert_eq!(PoolConfig::from_sizes(64, 1024), Some(PoolConfig::new(64, 1024)));
        assert_eq!(
            PoolConfig::from_sizes(u32::MAX as usize, 1),
            Some(PoolConfig::new(u32::MAX, 1))
        );
        #[cfg(target_pointer_width = "64")]
        {
            let four_gib = 1usize << 32;
            assert_eq!(PoolConfig::from_sizes(four_gib, 1), None);
            assert_eq!(PoolConfig::from_sizes(16, four_gib + 16), None);
        }
    }

    #[test]
    fn test_record_normalizes_and_merges_by_max() {
        let mut cache = MultiPoolConfigCache::new();
        cache.record("a", &[PoolConfig::new(64, 10), PoolConfig::new(16, 5), PoolConfig::new(64, 3)]);
        assert_eq!(cache.get("a").unwrap(), &[PoolConfig::new(16, 5), PoolConfig::new(64, 10)]);

        cache.record("a", &[PoolConfig::new(16, 9), PoolConfig::new(128, 1)]);
        assert_eq!(
            cache.get("a").unwrap(),
            &[PoolConfig::new(16, 9), PoolConfig::new(64, 10), PoolConfig::new(128, 1)]
        );
    }

    #[test]
    fn test_encoding_layout() {
        let mut cache = MultiPoolConfigCache::new();
        cache.record("x", &[PoolConfig::new(16, 2)]);
        let bytes = cache.to_bytes().unwrap();

        let class_len = CONFIG_CACHE_CLASS.len();
        assert_eq!(&bytes[..4], &(class_len as u32).to_le_bytes());
        assert_eq!(&bytes[4..4 + class_len], CONFIG_CACHE_CLASS.as_bytes());
        let rest = &bytes[4 + class_len..];
        assert_eq!(&rest[..4], &1u32.to_le_bytes());
        assert_eq!(&rest[4..8], &1u32.to_le_bytes());
        assert_eq!(&rest[8..12], &1u32.to_le_bytes());
        assert_eq!(&rest[12..13], b"x");
        assert_eq!(&rest[13..17], &1u32.to_le_bytes());
        assert_eq!(&rest[17..21], &16u32.to_le_bytes());
        assert_eq!(&rest[21..25], &2u32.to_le_bytes());
        assert_eq!(rest.len(), 25);
    }

    #[test]
    fn test_decode_matches_encoded_cache() {
        let cache = sample();
        let decoded = MultiPoolConfigCache::from_bytes(&cache.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, cache);
    }

    #[test]
    fn test_rejects_corrupt_input() {
        let bytes = sample().to_bytes().unwrap();

        let truncated = &bytes[..bytes.len() - 1];
        assert!(matches!(
            MultiPoolConfigCache::from_bytes(truncated),
            Err(MemoryError::CacheFormat(_))
        ));

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(MultiPoolConfigCache::from_bytes(&trailing).is_err());

        let mut wrong_version = bytes.clone();
        let version_at = 4 + CONFIG_CACHE_CLASS.len();
        wrong_version[version_at] = 2;
        assert!(MultiPoolConfigCache::from_bytes(&wrong_version).is_err());

        let mut wrong_class = bytes;
        wrong_class[4] = b'm';
        assert!(MultiPoolConfigCache::from_bytes(&wrong_class).is_err());
    }

    #[test]
    fn test_save_and_load_file() {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let path = temp_dir().join(format!("ember_config_cache_{nanos}.dat"));

        let cache = sample();
        cache.save(&path).unwrap();
        let loaded = MultiPoolConfigCache::load(&path).unwrap();
        assert_eq!(loaded, cache);

        let _ = fs::remove_file(&path);
        assert!(matches!(
            MultiPoolConfigCache::load(&path),
            Err(MemoryError::CacheIo(_))
        ));
    }
}
