//! Access logging and traffic statistics
//!
//! The access log is written in nginx-compatible combined format to a file
//! under the log directory. Per-path and per-referer counters are in-memory
//! concurrent maps. Both are fed from detached tasks; a failure never
//! reaches the foreground response.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Local;
use dashmap::DashMap;
use tracing::{debug, error, info};

/// One access log line
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub domain: String,
    pub client_ip: String,
    pub method: String,
    pub request_uri: String,
    pub user_agent: String,
    pub status: u16,
}

/// File-backed access logger
pub struct AccessLogger {
    file: Arc<Mutex<Option<File>>>,
    path: Option<PathBuf>,
    enabled: bool,
}

impl AccessLogger {
    pub fn new(enabled: bool, path: Option<PathBuf>) -> Self {
        let file = if enabled {
            if let Some(ref p) = path {
                if let Some(parent) = p.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                match OpenOptions::new().create(true).append(true).open(p) {
                    Ok(f) => {
                        info!("access log enabled: {:?}", p);
                        Some(f)
                    }
                    Err(e) => {
                        error!("failed to open access log file {:?}: {}", p, e);
                        None
                    }
                }
            } else {
                debug!("access logging enabled but no file path configured");
                None
            }
        } else {
            debug!("access logging disabled");
            None
        };

        Self {
            file: Arc::new(Mutex::new(file)),
            path,
            enabled,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, None)
    }

    pub fn log(&self, entry: &AccessLogEntry) {
        if !self.enabled {
            return;
        }

        let timestamp = Local::now().format("%d/%b/%Y:%H:%M:%S %z");
        let line = format!(
            "{} - - [{}] \"{} {} HTTP/1.1\" {} \"-\" \"{}\" host=\"{}\"\n",
            entry.client_ip,
            timestamp,
            entry.method,
            entry.request_uri,
            entry.status,
            entry.user_agent,
            entry.domain,
        );

        if let Ok(mut guard) = self.file.lock() {
            if let Some(ref mut file) = *guard {
                if let Err(e) = file.write_all(line.as_bytes()) {
                    error!("failed to write access log: {}", e);
                }
            }
        }

        debug!(
            target: "access_log",
            client_ip = %entry.client_ip,
            method = %entry.method,
            uri = %entry.request_uri,
            status = entry.status,
            domain = %entry.domain,
            "access"
        );
    }

    /// Re-open the log file (log rotation)
    pub fn reopen(&self) {
        if !self.enabled {
            return;
        }
        if let Some(ref p) = self.path {
            if let Ok(mut guard) = self.file.lock() {
                match OpenOptions::new().create(true).append(true).open(p) {
                    Ok(f) => {
                        *guard = Some(f);
                        info!("access log re-opened: {:?}", p);
                    }
                    Err(e) => error!("failed to re-open access log file {:?}: {}", p, e),
                }
            }
        }
    }
}

impl Clone for AccessLogger {
    fn clone(&self) -> Self {
        Self {
            file: Arc::clone(&self.file),
            path: self.path.clone(),
            enabled: self.enabled,
        }
    }
}

/// In-memory per-path and per-referer counters
#[derive(Default)]
pub struct AccessStats {
    path_hits: DashMap<(i64, String), u64>,
    referer_hits: DashMap<(i64, String), u64>,
}

impl AccessStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_path(&self, app_id: i64, path: &str) {
        *self
            .path_hits
            .entry((app_id, path.to_string()))
            .or_insert(0) += 1;
    }

    pub fn inc_referer(&self, app_id: i64, referer: &str) {
        *self
            .referer_hits
            .entry((app_id, referer.to_string()))
            .or_insert(0) += 1;
    }

    pub fn path_count(&self, app_id: i64, path: &str) -> u64 {
        self.path_hits
            .get(&(app_id, path.to_string()))
            .map(|c| *c)
            .unwrap_or(0)
    }

    pub fn referer_count(&self, app_id: i64, referer: &str) -> u64 {
        self.referer_hits
            .get(&(app_id, referer.to_string()))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Drop all counters; run by the daily routine
    pub fn clear(&self) {
        self.path_hits.clear();
        self.referer_hits.clear();
    }
}
