//! On-disk CDN cache for static resources behind HTTP-proxy routes
//!
//! Layout is `<root>/<AppID>/<urlPath>`. The file's mtime carries the origin
//! `Last-Modified`; the ctime (bumped by every timestamp write) marks the
//! last revalidation. Entries older than the revalidation window get a
//! conditional GET; a 304 just refreshes the marker.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use filetime::FileTime;
use tracing::debug;

/// Seconds a cache entry is served without revalidation
pub const REVALIDATE_SECONDS: i64 = 1800;

/// Extensions that look static but are rendered server-side
const DYNAMIC_SUFFIXES: &[&str] = &[
    ".html", ".htm", ".shtml", ".php", ".jsp", ".aspx", ".asp", ".do", ".cgi", ".cfm",
];

/// Whether a request targets a cacheable static resource: GET, no query
/// string, a real dotted extension, and not a dynamic suffix.
pub fn is_static_resource(method: &str, request_uri: &str) -> bool {
    if method != "GET" {
        return false;
    }
    if request_uri.contains('?') {
        return false;
    }
    if !request_uri.contains('.') {
        // pseudo static like /articles/12345
        return false;
    }
    let last_segment = request_uri.rsplit('/').next().unwrap_or(request_uri);
    if !last_segment.contains('.') || last_segment.ends_with('.') {
        return false;
    }
    if last_segment.starts_with('.') && last_segment.matches('.').count() == 1 {
        // dotfiles like /.svn/entries
        return false;
    }
    !DYNAMIC_SUFFIXES
        .iter()
        .any(|suffix| request_uri.ends_with(suffix))
}

/// Disposition of a cache lookup
#[derive(Debug)]
pub enum CacheState {
    Miss,
    /// Serve from disk, no backend call
    Fresh(PathBuf),
    /// Revalidate against the origin with If-Modified-Since
    NeedsRevalidation {
        path: PathBuf,
        last_modified: SystemTime,
    },
}

/// Per-app on-disk cache
pub struct CdnCache {
    root: PathBuf,
}

impl CdnCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Filesystem path for a cached resource; `None` for traversal attempts
    pub fn cache_path(&self, app_id: i64, url_path: &str) -> Option<PathBuf> {
        if url_path.split('/').any(|segment| segment == "..") {
            return None;
        }
        let relative = url_path.trim_start_matches('/');
        Some(self.root.join(app_id.to_string()).join(relative))
    }

    pub fn lookup(&self, app_id: i64, url_path: &str, now: SystemTime) -> CacheState {
        let Some(path) = self.cache_path(app_id, url_path) else {
            return CacheState::Miss;
        };
        let Ok(metadata) = std::fs::metadata(&path) else {
            return CacheState::Miss;
        };
        if !metadata.is_file() {
            return CacheState::Miss;
        }

        let revalidated_at = change_time(&metadata);
        let now_secs = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        if now_secs - revalidated_at <= REVALIDATE_SECONDS {
            return CacheState::Fresh(path);
        }

        let last_modified = metadata.modified().unwrap_or(UNIX_EPOCH);
        CacheState::NeedsRevalidation {
            path,
            last_modified,
        }
    }

    /// Write a fresh copy: mtime = origin Last-Modified, ctime = now
    pub fn store(
        &self,
        app_id: i64,
        url_path: &str,
        body: &[u8],
        last_modified: Option<SystemTime>,
    ) -> std::io::Result<()> {
        let Some(path) = self.cache_path(app_id, url_path) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, body)?;
        if let Some(modified) = last_modified {
            filetime::set_file_mtime(&path, FileTime::from_system_time(modified))?;
        }
        debug!(path = ?path, "cdn cache entry written");
        Ok(())
    }

    /// Refresh the revalidation marker, keeping the stored Last-Modified.
    /// Rewriting the existing mtime bumps the ctime to now.
    pub fn touch(&self, path: &Path) -> std::io::Result<()> {
        let metadata = std::fs::metadata(path)?;
        let mtime = FileTime::from_last_modification_time(&metadata);
        filetime::set_file_times(path, FileTime::now(), mtime)
    }
}

#[cfg(unix)]
fn change_time(metadata: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ctime()
}

#[cfg(not(unix))]
fn change_time(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// `Sun, 14 Jun 2020 13:54:20 GMT`
pub fn http_date(time: SystemTime) -> String {
    let datetime: DateTime<Utc> = time.into();
    datetime.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).into())
}
