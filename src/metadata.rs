use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::path::RelativePath;

/// Files larger than this are hashed in fixed-size blocks whose digests are
/// concatenated into the content hash, mirroring S3-style multipart etags so
/// that a streaming sync server can validate large uploads without buffering
/// the whole file.
const MULTIPART_THRESHOLD: u64 = 8 * 1024 * 1024;
const PART_SIZE: u64 = 8 * 1024 * 1024;

/// `{ path, hash, signature, file_size, last_modified }` as described by
/// the wire contract and the local journal. Two metadata are "equal" iff
/// `hash` is equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: RelativePath,
    pub hash: String,
    pub signature: String,
    pub file_size: u64,
    pub last_modified: DateTime<Utc>,
}

impl FileMetadata {
    pub fn hash_equal(&self, other: &FileMetadata) -> bool {
        self.hash == other.hash
    }
}

/// Reads `abs_path`, computes its content hash and rolling signature, and
/// returns the relative path computed against `root`.
///
/// Fails with an io error if the file disappears mid-read; callers should
/// treat that as "deleted" rather than propagate it as fatal.
pub fn hash_file(abs_path: &Path, root: &Path) -> Result<FileMetadata> {
    let meta = fs::metadata(abs_path)
        .with_context(|| format!("stat {}", abs_path.display()))?;
    let file_size = meta.len();
    let last_modified = meta
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .into();

    let hash = compute_content_hash(abs_path, file_size)
        .with_context(|| format!("hash {}", abs_path.display()))?;
    let signature = compute_rolling_signature(abs_path)
        .with_context(|| format!("signature {}", abs_path.display()))?;

    let path = RelativePath::from_abs(abs_path, root)?;
    Ok(FileMetadata {
        path,
        hash,
        signature,
        file_size,
        last_modified,
    })
}

/// Content digest: a single md5 hex digest for small files, or a
/// multipart-style `md5(concat(part md5s))-part_count` digest for large
/// ones, so that a chunked upload can be validated part-by-part.
fn compute_content_hash(path: &Path, size: u64) -> Result<String> {
    if size > MULTIPART_THRESHOLD {
        compute_multipart_hash(path, size)
    } else {
        compute_md5_hex_streaming(path)
    }
}

fn compute_md5_hex_streaming(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

fn compute_multipart_hash(path: &Path, size: u64) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut buf = vec![0u8; 1024 * 1024];
    let mut remaining = size;
    let part_count = size.div_ceil(PART_SIZE);
    let mut concatenated = Vec::with_capacity((part_count as usize) * 16);

    for _ in 0..part_count {
        let mut ctx = md5::Context::new();
        let mut to_read = remaining.min(PART_SIZE);
        while to_read > 0 {
            let cap = std::cmp::min(buf.len() as u64, to_read) as usize;
            let n = file.read(&mut buf[..cap])?;
            if n == 0 {
                break;
            }
            ctx.consume(&buf[..n]);
            to_read -= n as u64;
            remaining -= n as u64;
        }
        concatenated.extend_from_slice(ctx.compute().as_ref());
    }
    let digest = md5::compute(&concatenated);
    Ok(format!("{digest:x}-{part_count}"))
}

/// Rolling signature: a sequence of per-block sha1 digests joined with `:`,
/// used by the server to compute a delta transfer against a previous
/// version of the same path instead of re-sending the whole file.
fn compute_rolling_signature(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut buf = vec![0u8; PART_SIZE as usize];
    let mut blocks = Vec::new();
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let mut hasher = Sha1::new();
        hasher.update(&buf[..n]);
        blocks.push(format!("{:x}", hasher.finalize()));
    }
    Ok(blocks.join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_temp_dir(prefix: &str) -> std::path::PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("{prefix}-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn hash_file_computes_relative_path_and_hash() {
        let root = make_temp_dir("syftbox-rs-metadata-test");
        let datasite = root.join("alice");
        fs::create_dir_all(&datasite).unwrap();
        let file_path = datasite.join("x.txt");
        fs::write(&file_path, b"hello world").unwrap();

        let meta = hash_file(&file_path, &root).unwrap();
        assert_eq!(meta.path.as_str(), "alice/x.txt");
        assert_eq!(meta.file_size, 11);
        assert_eq!(meta.hash, format!("{:x}", md5::compute(b"hello world")));
        assert!(!meta.signature.is_empty());
    }

    #[test]
    fn identical_content_hashes_equal() {
        let root = make_temp_dir("syftbox-rs-metadata-test-2");
        let datasite = root.join("alice");
        fs::create_dir_all(&datasite).unwrap();
        let a = datasite.join("a.txt");
        let b = datasite.join("b.txt");
        fs::write(&a, b"same content").unwrap();
        fs::write(&b, b"same content").unwrap();

        let ma = hash_file(&a, &root).unwrap();
        let mb = hash_file(&b, &root).unwrap();
        assert!(ma.hash_equal(&mb));
    }

    #[test]
    fn hash_file_fails_if_file_missing() {
        let root = make_temp_dir("syftbox-rs-metadata-test-3");
        let missing = root.join("alice").join("missing.txt");
        assert!(hash_file(&missing, &root).is_err());
    }

    #[test]
    fn large_file_uses_multipart_hash_with_part_count_suffix() {
        let root = make_temp_dir("syftbox-rs-metadata-test-4");
        let datasite = root.join("alice");
        fs::create_dir_all(&datasite).unwrap();
        let path = datasite.join("big.bin");
        let mut f = fs::File::create(&path).unwrap();
        let chunk = vec![7u8; 1024 * 1024];
        for _ in 0..9 {
            f.write_all(&chunk).unwrap();
        }
        drop(f);

        let meta = hash_file(&path, &root).unwrap();
        assert!(meta.hash.contains('-'));
        assert!(meta.hash.ends_with("-2"));
    }
}
