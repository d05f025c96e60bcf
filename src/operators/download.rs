//! Download operator (`Action::Download`, spec §4.7), grounded in the
//! teacher's `crates/common/src/download.rs`: `download_big_file`'s
//! write-then-rename transfer and `remote_file_exists`'s HEAD-then-range-GET
//! probe, folded here into one `Fetch` trait so the scheduler's bulk
//! size-prefetch pass (spec §4.6) and the operator itself share a backend.
//! Kept outside the `postgis` feature gate — a download-only build (e.g. a
//! worker that only stages source files) should still link.

use std::io::copy;
use std::path::Path;
use std::time::Duration;

use crate::error::BuildResult;
use crate::fs_util::{finalize_atomic, remove_if_exists, shadow_path};

/// A pluggable download backend. `HttpFetch` is the only implementation
/// shipped; the trait seam exists so the scheduler's size-prefetch and this
/// operator can be driven by a stub in tests, matching the existing
/// preference for a trait at I/O boundaries (c.f. `io::GeometryWriter`).
pub trait Fetch: Send + Sync {
    /// `Ok(None)` when the size genuinely cannot be determined (no
    /// `Content-Length`, HEAD unsupported); not an error on its own.
    fn remote_size(&self, url: &str) -> BuildResult<Option<u64>>;
    fn fetch(&self, url: &str, dest: &Path) -> BuildResult<()>;
}

#[cfg(feature = "download")]
pub struct HttpFetch {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "download")]
impl HttpFetch {
    pub fn new() -> BuildResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("terraflow/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| crate::error::NetworkError::Request { url: String::new(), source: e.into() })?;
        Ok(HttpFetch { client })
    }
}

#[cfg(feature = "download")]
impl Fetch for HttpFetch {
    fn remote_size(&self, url: &str) -> BuildResult<Option<u64>> {
        use reqwest::StatusCode;

        let head = self.client.head(url).send();
        if let Ok(resp) = &head {
            if resp.status() == StatusCode::OK {
                return Ok(resp.content_length());
            }
        }

        // Some servers reject HEAD; fall back to a 1-byte ranged GET, which
        // reports the full size via Content-Range.
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, "bytes=0-0")
            .send()
            .map_err(|e| crate::error::NetworkError::Request { url: url.to_string(), source: e.into() })?;

        match resp.status() {
            StatusCode::OK => Ok(resp.content_length()),
            StatusCode::PARTIAL_CONTENT => {
                let total = resp
                    .headers()
                    .get(reqwest::header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.rsplit('/').next())
                    .and_then(|v| v.parse::<u64>().ok());
                Ok(total)
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(None),
            status => Err(crate::error::NetworkError::Status { url: url.to_string(), status: status.as_u16() }.into()),
        }
    }

    fn fetch(&self, url: &str, dest: &Path) -> BuildResult<()> {
        let shadow = shadow_path(dest);
        crate::fs_util::ensure_parent_dir(dest)?;

        let mut resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| crate::error::NetworkError::Request { url: url.to_string(), source: e.into() })?;
        if !resp.status().is_success() {
            return Err(crate::error::NetworkError::Status { url: url.to_string(), status: resp.status().as_u16() }.into());
        }

        let mut file = std::fs::File::create(&shadow).map_err(anyhow::Error::from)?;
        copy(&mut resp, &mut file).map_err(anyhow::Error::from)?;
        drop(file);

        finalize_atomic(&shadow, dest)
    }
}

/// Runs the download operator: skip if `dest` already exists and isn't
/// stale (the scheduler only submits this node when it decided a fetch is
/// needed — spec §4.6's idempotence check lives one layer up, mirroring
/// `download/base.py`'s `self.skip_if_exists`), otherwise fetch into a
/// shadow file and atomically rename over `dest`.
pub fn run(fetch: &dyn Fetch, url: &str, dest: &Path, overwrite: bool) -> BuildResult<bool> {
    if dest.exists() && !overwrite {
        return Ok(false);
    }
    remove_if_exists(&shadow_path(dest))?;
    fetch.fetch(url, dest)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StubFetch {
        size: Option<u64>,
        written: Mutex<Vec<u8>>,
    }

    impl Fetch for StubFetch {
        fn remote_size(&self, _url: &str) -> BuildResult<Option<u64>> {
            Ok(self.size)
        }
        fn fetch(&self, _url: &str, dest: &Path) -> BuildResult<()> {
            std::fs::write(dest, b"payload").map_err(anyhow::Error::from)?;
            self.written.lock().unwrap().extend_from_slice(b"payload");
            Ok(())
        }
    }

    #[test]
    fn skips_existing_file_unless_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.gpkg");
        std::fs::write(&dest, b"already here").unwrap();
        let stub = StubFetch { size: Some(7), written: Mutex::new(Vec::new()) };

        let ran = run(&stub, "https://example.test/x.gpkg", &dest, false).unwrap();
        assert!(!ran);
        assert_eq!(std::fs::read(&dest).unwrap(), b"already here");

        let ran = run(&stub, "https://example.test/x.gpkg", &dest, true).unwrap();
        assert!(ran);
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
    }
}
