use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{default_selector, Opt, Strategy};

/// The scalar part of [`Opt`] as it appears in configuration files.
/// Durations are in milliseconds; absent fields keep the current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub retries: Option<u32>,
    pub request_timeout_ms: Option<u64>,
    pub stream_timeout_ms: Option<u64>,
    pub dial_timeout_ms: Option<u64>,
    pub conn_timeout_ms: Option<u64>,
    pub pool_size: Option<usize>,
    pub pool_ttl_ms: Option<u64>,
    pub strategy: Option<Strategy>,
    pub service_token: Option<String>,
    pub conn_close: Option<bool>,
    pub node: Option<String>,
    pub allow_internal: Option<bool>,
}

impl ClientConfig {
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Layers this configuration over `opt`. A strategy rebuilds the
    /// selector over the options' registry.
    pub fn apply(&self, mut opt: Opt) -> Opt {
        let ms = Duration::from_millis;
        if let Some(v) = self.retries {
            opt.retries = v;
        }
        if let Some(v) = self.request_timeout_ms {
            opt.request_timeout = ms(v);
        }
        if let Some(v) = self.stream_timeout_ms {
            opt.stream_timeout = Some(ms(v));
        }
        if let Some(v) = self.dial_timeout_ms {
            opt.dial_timeout = ms(v);
        }
        if let Some(v) = self.conn_timeout_ms {
            opt.conn_timeout = ms(v);
        }
        if let Some(v) = self.pool_size {
            opt.pool_size = v;
        }
        if let Some(v) = self.pool_ttl_ms {
            opt.pool_ttl = ms(v);
        }
        if let Some(strategy) = self.strategy {
            opt.selector = default_selector(opt.registry.clone(), strategy);
        }
        if let Some(v) = &self.service_token {
            opt.service_token = Some(v.clone());
        }
        if let Some(v) = self.conn_close {
            opt.conn_close = v;
        }
        if let Some(v) = &self.node {
            opt.node = Some(v.clone());
        }
        if let Some(v) = self.allow_internal {
            opt.allow_internal = v;
        }
        opt
    }
}
