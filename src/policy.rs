use std::collections::HashSet;

use anyhow::{anyhow, Context, Result};
use http::Method;
use regex::Regex;

use crate::config;

/// Decides from method and path alone whether a request takes the cache-fill path.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    methods: HashSet<Method>,
    pattern: Regex,
}

impl CachePolicy {
    pub fn new(methods: &[String], pattern: &str) -> Result<Self> {
        let methods = methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes())
                    .map_err(|_| anyhow!("invalid cache method {m:?}"))
            })
            .collect::<Result<HashSet<_>>>()?;
        let pattern = Regex::new(pattern).with_context(|| format!("compile cache pattern {pattern}"))?;
        Ok(Self { methods, pattern })
    }

    pub fn from_config(cfg: &config::Cache) -> Result<Self> {
        Self::new(&cfg.methods, &cfg.pattern)
    }

    pub fn is_cacheable(&self, method: &Method, path: &str) -> bool {
        self.methods.contains(method) && self.pattern.is_match(path)
    }
}
