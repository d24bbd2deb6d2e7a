use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use http::{HeaderMap, Method, StatusCode, Version};

use crate::constants::CacheStatus;

#[derive(Debug)]
pub struct AccessLogger {
    writer: Mutex<AccessWriter>,
}

#[derive(Debug)]
enum AccessWriter {
    File(std::fs::File),
    Stdout(std::io::Stdout),
}

impl AccessLogger {
    /// Appends to `path`, or writes to stdout when it is empty.
    pub fn new(path: &str) -> Result<Self> {
        let writer = if path.is_empty() {
            AccessWriter::Stdout(std::io::stdout())
        } else {
            let path = Path::new(path);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create access log dir {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open access log {}", path.display()))?;
            AccessWriter::File(file)
        };
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }

    pub fn log(&self, entry: &AccessEntry<'_>) {
        let line = format!("{}\n", entry.format(&format_access_time()));
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        let res = match &mut *writer {
            AccessWriter::File(file) => file.write_all(line.as_bytes()),
            AccessWriter::Stdout(stdout) => stdout.lock().write_all(line.as_bytes()),
        };
        if let Err(err) = res {
            log::warn!("write access log failed: {err}");
        }
    }
}

/// Everything one access-log line records.
pub struct AccessEntry<'a> {
    pub client_ip: &'a str,
    pub host: &'a str,
    pub method: &'a Method,
    pub uri: &'a str,
    pub version: Version,
    pub status: StatusCode,
    pub content_length: Option<u64>,
    pub duration: Duration,
    pub cache_status: CacheStatus,
    pub user_agent: &'a str,
}

impl AccessEntry<'_> {
    fn format(&self, time: &str) -> String {
        let request_line = format!("{} {} {}", self.method, self.uri, protocol(self.version));
        let content_length = self
            .content_length
            .map(|n| n.to_string())
            .unwrap_or_default();
        let fields = [
            normalize_field(self.client_ip),
            normalize_field(self.host),
            normalize_field(time),
            format!("\"{}\"", request_line),
            normalize_field(&self.status.as_u16().to_string()),
            normalize_field(&content_length),
            normalize_field(&self.duration.as_millis().to_string()),
            normalize_field(self.cache_status.as_str()),
            normalize_field_replace(self.user_agent),
        ];
        fields.join(" ")
    }
}

pub fn protocol(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

/// Client address as reported by a fronting proxy, falling back to the peer address.
pub fn client_ip(remote_addr: &str, headers: &HeaderMap) -> String {
    headers
        .get("X-Real-IP")
        .or_else(|| headers.get("X-Forwarded-For"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| remote_addr.to_string())
}

fn normalize_field(s: &str) -> String {
    if s.is_empty() {
        "-".to_string()
    } else {
        s.to_string()
    }
}

fn normalize_field_replace(s: &str) -> String {
    if s.is_empty() {
        "-".to_string()
    } else {
        s.replace(' ', "+")
    }
}

fn format_access_time() -> String {
    Local::now().format("[%d/%b/%Y:%H:%M:%S %z]").to_string()
}
