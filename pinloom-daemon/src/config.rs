//! Daemon configuration file

use pinloom_core::CoreConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding the store database and the blob area.
    pub data_dir: PathBuf,
    pub core: CoreConfig,
    /// Static signing-key → author mapping used by the built-in identity
    /// resolver. A networked resolver replaces this in real deployments.
    pub identities: HashMap<String, String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./pinloom-data"),
            core: CoreConfig::default(),
            identities: HashMap::new(),
        }
    }
}

impl DaemonConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let cfg: DaemonConfig = toml::from_str(
            r#"
            data_dir = "/tmp/pinloom"

            [core]
            max_payload_size = 1048576

            [identities]
            "0x12345" = "org1"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/pinloom"));
        assert_eq!(cfg.core.max_payload_size, 1048576);
        assert_eq!(cfg.identities.get("0x12345").map(String::as_str), Some("org1"));
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let cfg = DaemonConfig::load(None).unwrap();
        assert!(cfg.identities.is_empty());
    }
}
