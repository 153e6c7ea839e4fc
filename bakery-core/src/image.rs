//! Source image checks before a write: presence, checksum, xz extraction.

use crate::progress::Progress;
use bakery_error::{BakeryError, BakeryResult};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// SHA-256 of a whole file, lowercase hex.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fail with a checksum mismatch unless `path` hashes to `expected`.
pub fn verify_checksum(path: &Path, expected: &str) -> BakeryResult<()> {
    let actual = sha256_file(path).map_err(|e| {
        BakeryError::DownloadFailure(format!("cannot read {}: {e}", path.display()))
    })?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(BakeryError::DownloadIntegrityFailure {
            path: path.display().to_string(),
            expected: expected.trim().to_ascii_lowercase(),
            actual,
        });
    }
    Ok(())
}

/// Decompress `xz_path` next to itself (dropping `.xz`), reusing an existing
/// extraction.
pub fn extract_xz(xz_path: &Path, progress: &Progress) -> BakeryResult<PathBuf> {
    let raw_path = xz_path.with_extension("");
    if raw_path.exists() {
        progress.status(&format!("Raw image already exists: {}", raw_path.display()));
        return Ok(raw_path);
    }

    let extract_err = |reason: String| BakeryError::ExtractFailure {
        path: xz_path.display().to_string(),
        reason,
    };
    progress.status(&format!("Extracting {}...", xz_path.display()));

    let input = File::open(xz_path).map_err(|e| extract_err(e.to_string()))?;
    let mut decoder = xz2::read::XzDecoder::new(input);
    let partial = raw_path.with_extension("partial");
    let mut output = File::create(&partial).map_err(|e| extract_err(e.to_string()))?;
    if let Err(err) = io::copy(&mut decoder, &mut output) {
        drop(output);
        let _ = std::fs::remove_file(&partial);
        return Err(extract_err(err.to_string()));
    }
    std::fs::rename(&partial, &raw_path).map_err(|e| extract_err(e.to_string()))?;
    progress.status(&format!("Extraction complete: {}", raw_path.display()));
    Ok(raw_path)
}

/// Check and, if needed, extract the image at `path`. Returns the raw image
/// to write.
///
/// The checksum applies to the file as given (the download), so it is
/// verified before extraction.
pub fn prepare_image(
    path: &Path,
    expected_sha256: Option<&str>,
    progress: &Progress,
) -> BakeryResult<PathBuf> {
    if !path.is_file() {
        return Err(BakeryError::DownloadFailure(format!(
            "image not found: {}",
            path.display()
        )));
    }
    if let Some(expected) = expected_sha256 {
        progress.status("Verifying image checksum...");
        verify_checksum(path, expected)?;
    }
    if path.extension().is_some_and(|ext| ext == "xz") {
        return extract_xz(path, progress);
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn xz_encode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut enc = xz2::write::XzEncoder::new(&mut out, 6);
        enc.write_all(data).unwrap();
        enc.finish().unwrap();
        out
    }

    #[test]
    fn xz_images_are_extracted_once() {
        let dir = tempdir().unwrap();
        let xz = dir.path().join("raspbian.img.xz");
        std::fs::write(&xz, xz_encode(b"boot sector")).unwrap();

        let raw = prepare_image(&xz, None, &Progress::silent()).unwrap();
        assert_eq!(raw, dir.path().join("raspbian.img"));
        assert_eq!(std::fs::read(&raw).unwrap(), b"boot sector");

        std::fs::remove_file(&xz).unwrap();
        std::fs::write(&xz, b"no longer valid xz").unwrap();
        assert_eq!(prepare_image(&xz, None, &Progress::silent()).unwrap(), raw);
    }

    #[test]
    fn corrupt_archives_fail_extraction() {
        let dir = tempdir().unwrap();
        let xz = dir.path().join("broken.img.xz");
        std::fs::write(&xz, b"definitely not xz").unwrap();
        let err = prepare_image(&xz, None, &Progress::silent()).unwrap_err();
        assert_eq!(err.code(), "EXTRACT_FAILED");
        assert!(!dir.path().join("broken.img").exists());
    }

    #[test]
    fn checksum_mismatch_aborts() {
        let dir = tempdir().unwrap();
        let img = dir.path().join("raspbian.img");
        std::fs::write(&img, b"image").unwrap();
        let good = format!("{:x}", Sha256::digest(b"image"));

        assert_eq!(prepare_image(&img, Some(&good), &Progress::silent()).unwrap(), img);
        let err = prepare_image(&img, Some("00ff"), &Progress::silent()).unwrap_err();
        assert_eq!(err.code(), "CHECKSUM_MISMATCH");
    }

    #[test]
    fn missing_image_is_unavailable() {
        let dir = tempdir().unwrap();
        let err = prepare_image(&dir.path().join("nope.img"), None, &Progress::silent())
            .unwrap_err();
        assert_eq!(err.code(), "DOWNLOAD_FAILED");
    }
}
