//! Runtime configuration of the fabric and session core.
//!
//! Every field has a default, so a partial (or empty) JSON document is a
//! valid configuration.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::case::{CONFIG_1, CONFIG_2, CURVE_P256};
use crate::error::ErrorCode;
use crate::fabric::MAX_VALID_FABRIC_INDEX;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricTableConfig {
    /// Number of fabric slots, 1..=254.
    pub max_fabrics: u8,
    /// Storage keys are `<key_prefix><index hex>`.
    pub key_prefix: String,
}

impl Default for FabricTableConfig {
    fn default() -> Self {
        Self {
            max_fabrics: 16,
            key_prefix: "Fabric".to_owned(),
        }
    }
}

/// What happens to existing sessions with a peer when a new one is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplacementPolicy {
    /// Older sessions with the peer stay until they idle out or are evicted.
    KeepExisting,
    /// Older non-shared sessions with the same peer on the same fabric are removed.
    ReplaceSamePeer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_sessions: usize,
    pub idle_timeout_secs: u64,
    pub replacement: ReplacementPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            idle_timeout_secs: 300,
            replacement: ReplacementPolicy::ReplaceSamePeer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyConfirmMode {
    /// Never run the key confirmation step. Responders ignore the request;
    /// initiators refuse a responder that wants it.
    Never,
    /// Initiators don't ask but follow the responder; responders run it when asked.
    IfRequested,
    /// Initiators ask and refuse a responder that declines; responders run it
    /// whether or not the initiator asked.
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaseConfig {
    /// Supported protocol configurations, most preferred first.
    pub protocol_configs: Vec<u16>,
    pub curves: Vec<u32>,
    pub key_confirm: KeyConfirmMode,
}

impl Default for CaseConfig {
    fn default() -> Self {
        Self {
            protocol_configs: vec![CONFIG_2],
            curves: vec![CURVE_P256],
            key_confirm: KeyConfirmMode::IfRequested,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub fabric_table: FabricTableConfig,
    pub session: SessionConfig,
    pub case: CaseConfig,
}

fn invalid(msg: &str) -> anyhow::Error {
    anyhow::Error::new(ErrorCode::InvalidArgument).context(msg.to_owned())
}

impl CoreConfig {
    pub fn validate(&self) -> Result<()> {
        let ft = &self.fabric_table;
        if ft.max_fabrics == 0 || ft.max_fabrics > MAX_VALID_FABRIC_INDEX {
            return Err(invalid("fabric_table.max_fabrics must be in 1..=254"));
        }
        if ft.key_prefix.is_empty() || !ft.key_prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid("fabric_table.key_prefix must be non-empty ascii alphanumeric"));
        }
        if self.session.max_sessions == 0 {
            return Err(invalid("session.max_sessions must be positive"));
        }
        if self.session.idle_timeout_secs == 0 {
            return Err(invalid("session.idle_timeout_secs must be positive"));
        }
        if self.case.protocol_configs.is_empty()
            || self.case.protocol_configs.iter().any(|c| *c != CONFIG_1 && *c != CONFIG_2)
        {
            return Err(invalid("case.protocol_configs must list known configurations"));
        }
        if self.case.curves.is_empty() || self.case.curves.iter().any(|c| *c != CURVE_P256) {
            return Err(invalid("case.curves must list supported curves"));
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<CoreConfig> {
    let data = std::fs::read_to_string(path).context(format!("reading config from {}", path.display()))?;
    let config: CoreConfig = serde_json::from_str(&data).context("parsing config")?;
    config.validate()?;
    Ok(config)
}

pub fn save_config(path: &Path, config: &CoreConfig) -> Result<()> {
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data).context(format!("writing config to {}", path.display()))
}
