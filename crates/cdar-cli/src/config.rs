use cdar_engine::{PackConfig, UnpackConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings file for the `cdar` binary. Command line flags override it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CdarConfig {
    pub pack: PackConfig,
    pub unpack: UnpackConfig,
}

impl CdarConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: CdarConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: CdarConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }
}
