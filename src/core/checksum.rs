/// MD5 verification of uploads and downloads against the S3 ETag

use anyhow::{Context, Result};
use md5::{Digest, Md5};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::core::error::SiteBackupError;

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

pub fn md5_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open {} for hashing", path.display()))?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// ETags come back quoted (`"d41d8cd9..."`)
pub fn normalize_etag(etag: &str) -> String {
    etag.trim().trim_matches('"').to_ascii_lowercase()
}

/// Compare the file's MD5 with a remote ETag
pub fn verify_etag(path: &Path, etag: &str) -> Result<()> {
    let local = md5_file(path)?;
    let remote = normalize_etag(etag);
    if local != remote {
        return Err(SiteBackupError::ChecksumMismatch {
            path: path.to_path_buf(),
            local,
            remote,
        }
        .into());
    }
    tracing::debug!(path = %path.display(), md5 = %local, "checksum verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_md5_known_value() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        assert_eq!(md5_file(file.path()).unwrap(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn test_verify_etag_strips_quotes() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        verify_etag(file.path(), "\"5EB63BBBE01EEED093CB22BB8F5ACDC3\"").unwrap();

        let err = verify_etag(file.path(), "\"abc\"").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SiteBackupError>(),
            Some(SiteBackupError::ChecksumMismatch { .. })
        ));
    }
}
