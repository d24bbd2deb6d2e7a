use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

pub const DEFAULT_PATTERN: &str = r"\.(png|jpe?g|gif|bmp|ico|svg|webp|avif|css|js|mjs|map|json|xml|txt|html?|pdf|woff2?|ttf|otf|eot|mp3|mp4|ogg|webm|wasm|zip|gz|tgz|bz2|xz|tar|7z|jar|deb|rpm)$";

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub upstream: Upstream,
    #[serde(default)]
    pub cache: Cache,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(anyhow!("server.host is required"));
        }
        let backend = self.upstream.backend.trim();
        if backend.is_empty() {
            return Err(anyhow!("upstream.backend is required"));
        }
        let uri: http::Uri = backend
            .parse()
            .with_context(|| format!("parse upstream.backend {backend}"))?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            _ => return Err(anyhow!("upstream.backend must be an http:// or https:// url")),
        }
        if uri.authority().is_none() {
            return Err(anyhow!("upstream.backend is missing a host"));
        }
        if self.cache.dir.as_os_str().is_empty() {
            return Err(anyhow!("cache.dir is required"));
        }
        regex::Regex::new(&self.cache.pattern)
            .with_context(|| format!("compile cache.pattern {}", self.cache.pattern))?;
        for method in &self.cache.methods {
            http::Method::from_bytes(method.as_bytes())
                .map_err(|_| anyhow!("cache.methods contains invalid method {method:?}"))?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub caller: bool,
    #[serde(default)]
    pub nopid: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Server {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub access_log: Option<ServerAccessLog>,
    #[serde(default)]
    pub metrics_path: Option<String>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            access_log: None,
            metrics_path: None,
        }
    }
}

impl Server {
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ServerAccessLog {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Upstream {
    #[serde(default)]
    pub backend: String,
    #[serde(default = "default_response_timeout", with = "humantime_serde")]
    pub response_timeout: Duration,
    #[serde(default = "default_body_idle_timeout", with = "humantime_serde")]
    pub body_idle_timeout: Duration,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            backend: String::new(),
            response_timeout: default_response_timeout(),
            body_idle_timeout: default_body_idle_timeout(),
            insecure_skip_verify: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Cache {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default = "default_exclude_headers")]
    pub exclude_headers: Vec<String>,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            pattern: default_pattern(),
            methods: default_methods(),
            exclude_headers: default_exclude_headers(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_response_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_body_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_pattern() -> String {
    DEFAULT_PATTERN.to_string()
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}

fn default_exclude_headers() -> Vec<String> {
    vec!["date".to_string(), "server".to_string(), "host".to_string()]
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    parse(&raw).with_context(|| format!("parse config {}", path.display()))
}

pub fn parse(raw: &str) -> Result<(Bootstrap, Vec<String>)> {
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })?;
    Ok((cfg, ignored))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let (cfg, ignored) = parse("upstream:\n  backend: http://origin.local\n").unwrap();
        assert!(ignored.is_empty());
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.cache.methods, vec!["GET", "HEAD"]);
        assert_eq!(cfg.cache.exclude_headers, vec!["date", "server", "host"]);
        assert_eq!(cfg.upstream.response_timeout, Duration::from_secs(30));
        cfg.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_reported() {
        let raw = "upstream:\n  backend: http://origin.local\n  retries: 3\nfoo: bar\n";
        let (_, ignored) = parse(raw).unwrap();
        assert!(ignored.contains(&"upstream.retries".to_string()));
        assert!(ignored.contains(&"foo".to_string()));
    }

    #[test]
    fn durations_are_humantime() {
        let raw = "upstream:\n  backend: https://origin.local\n  response_timeout: 2s\n  body_idle_timeout: 0s\n";
        let (cfg, _) = parse(raw).unwrap();
        assert_eq!(cfg.upstream.response_timeout, Duration::from_secs(2));
        assert_eq!(cfg.upstream.body_idle_timeout, Duration::ZERO);
    }

    #[test]
    fn validate_rejects_bad_settings() {
        let mut cfg = Bootstrap::default();
        assert!(cfg.validate().is_err(), "missing backend");

        cfg.upstream.backend = "ftp://origin.local".to_string();
        assert!(cfg.validate().is_err(), "unsupported scheme");

        cfg.upstream.backend = "http://origin.local".to_string();
        cfg.cache.pattern = "(unclosed".to_string();
        assert!(cfg.validate().is_err(), "invalid regex");

        cfg.cache.pattern = default_pattern();
        cfg.cache.methods = vec!["GE T".to_string()];
        assert!(cfg.validate().is_err(), "invalid method");
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let server = Server {
            host: "::1".to_string(),
            port: 9000,
            ..Server::default()
        };
        assert_eq!(server.addr(), "[::1]:9000");
    }
}
