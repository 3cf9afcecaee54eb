//! File-based chunk storage with zstd compression

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::blob::{BlobKey, BlobStore, sanitize};

/// File-based blob storage with zstd compression
///
/// Directory structure:
/// ```text
/// blobs/
///   me@example.com/
///     18/
///       18c2f0a1b2.att.1.0.zst   # chunk 0 of the attachment in part 1
///       18c2f0a1b2.att.1.1.zst   # chunk 1
/// ```
pub struct FileBlobStore {
    root: PathBuf,
    compression_level: i32,
}

impl FileBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).context("Failed to create blob storage directory")?;
        Ok(Self {
            root,
            compression_level: 3,
        })
    }

    /// Shard directory (first 2 chars of the blob name) inside the owner's directory
    fn shard_dir(&self, key: &BlobKey) -> PathBuf {
        let shard = key.name.get(..2).unwrap_or("xx");
        self.root.join(sanitize(&key.owner)).join(shard)
    }

    fn chunk_path(&self, key: &BlobKey, index: u32) -> PathBuf {
        self.shard_dir(key)
            .join(format!("{}.{}.zst", key.name, index))
    }

    fn list_chunks(&self, key: &BlobKey) -> Result<Vec<PathBuf>> {
        let shard_dir = self.shard_dir(key);
        if !shard_dir.exists() {
            return Ok(Vec::new());
        }

        let prefix = format!("{}.", key.name);
        let mut paths = Vec::new();
        for entry in fs::read_dir(&shard_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_str()
                && name.starts_with(&prefix)
                && name[prefix.len()..].trim_end_matches(".zst").parse::<u32>().is_ok()
            {
                paths.push(entry.path());
            }
        }
        Ok(paths)
    }
}

impl BlobStore for FileBlobStore {
    fn put_chunk(&self, key: &BlobKey, index: u32, data: &[u8]) -> Result<()> {
        let path = self.chunk_path(key, index);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let compressed =
            zstd::encode_all(data, self.compression_level).context("Failed to compress chunk")?;

        // Write to a temp file, then rename into place
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &compressed)
            .with_context(|| format!("Failed to write chunk {}", temp_path.display()))?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn get_chunk(&self, key: &BlobKey, index: u32) -> Result<Option<Vec<u8>>> {
        let path = self.chunk_path(key, index);
        if !path.exists() {
            return Ok(None);
        }

        let compressed = fs::read(&path)?;
        let mut decoder = zstd::Decoder::new(compressed.as_slice())?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .context("Failed to decompress chunk")?;
        Ok(Some(decompressed))
    }

    fn delete(&self, key: &BlobKey) -> Result<()> {
        for path in self.list_chunks(key)? {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BlobRef;
    use tempfile::tempdir;

    fn key() -> BlobKey {
        BlobKey::attachment("me@example.com", "18c2f0a1b2", "1")
    }

    #[test]
    fn test_put_get_chunked() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("blobs")).unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let blob = store.put(&key(), &data, 4096).unwrap();
        assert_eq!(blob.chunk_count, 3);
        assert_eq!(blob.length, 10_000);

        for index in 0..3 {
            assert!(store.chunk_path(&key(), index).exists());
        }

        let retrieved = store.get(&blob).unwrap().unwrap();
        assert_eq!(retrieved, data);
    }

    #[test]
    fn test_get_missing_blob() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("blobs")).unwrap();
        let blob = store.put(&key(), b"", 16).unwrap();
        assert_eq!(blob.chunk_count, 0);

        let missing = BlobRef {
            key: BlobKey::attachment("me@example.com", "nothere", "1"),
            chunk_count: 2,
            chunk_size: 16,
            length: 20,
        };
        assert!(store.get(&missing).unwrap().is_none());
    }

    #[test]
    fn test_missing_middle_chunk_is_an_error() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("blobs")).unwrap();
        let blob = store.put(&key(), &[7u8; 40], 16).unwrap();

        fs::remove_file(store.chunk_path(&key(), 1)).unwrap();

        assert!(store.get(&blob).is_err());
    }

    #[test]
    fn test_delete_removes_all_chunks() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("blobs")).unwrap();
        let other = BlobKey::attachment("me@example.com", "18c2f0a1b2", "2");

        let blob = store.put(&key(), &[1u8; 40], 16).unwrap();
        let other_blob = store.put(&other, &[2u8; 10], 16).unwrap();

        store.delete(&key()).unwrap();

        assert!(store.get(&blob).unwrap().is_none());
        assert_eq!(store.get(&other_blob).unwrap().unwrap(), vec![2u8; 10]);
    }

    #[test]
    fn test_compression() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("blobs")).unwrap();
        let data = "Hello, world! ".repeat(1000);

        store.put_chunk(&key(), 0, data.as_bytes()).unwrap();

        let compressed_size = fs::metadata(store.chunk_path(&key(), 0)).unwrap().len();
        assert!(compressed_size < data.len() as u64);
    }
}
