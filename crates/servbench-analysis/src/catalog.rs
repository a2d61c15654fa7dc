use crate::Configuration;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogModel {
    pub key: String,
    pub display: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogConfiguration {
    #[serde(flatten)]
    pub configuration: Configuration,
    pub name: String,
}

/// Closed sets of models and configurations for the summary report. Order is
/// the report order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportCatalog {
    pub models: Vec<CatalogModel>,
    pub configurations: Vec<CatalogConfiguration>,
}

impl ReportCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read catalog {}: {}", path.display(), e))?;
        let catalog: ReportCatalog = serde_yaml::from_str(&raw)?;
        if catalog.models.is_empty() {
            return Err(anyhow!("catalog {} lists no models", path.display()));
        }
        Ok(catalog)
    }

    pub fn has_model(&self, key: &str) -> bool {
        self.models.iter().any(|m| m.key == key)
    }

    pub fn has_configuration(&self, config: &Configuration) -> bool {
        self.configurations
            .iter()
            .any(|c| &c.configuration == config)
    }
}

impl Default for ReportCatalog {
    fn default() -> Self {
        let models = [
            ("original", "BF16 Baseline"),
            ("w8a8_smooth_ptq", "W8A8 SQ→PTQ"),
            ("w8a8_smooth_gptq", "W8A8 SQ→GPTQ"),
            ("w8a16_smooth_awq", "W8A16 SQ→AWQ"),
        ]
        .into_iter()
        .map(|(key, display)| CatalogModel {
            key: key.to_string(),
            display: display.to_string(),
        })
        .collect();
        let configurations = [
            ((32, 256, 32), "Base Configuration (32,256,32)"),
            ((1, 128, 64), "Small Batch Interactive (1,128,64)"),
            ((1, 2048, 32), "Long Input (1,2048,32)"),
            ((1, 256, 512), "Long Generation (1,256,512)"),
            ((8, 256, 128), "Medium Batch Processing (8,256,128)"),
            ((64, 256, 128), "High Concurrency (64,256,128)"),
            ((1, 16384, 32), "Ultra-Long Context (1,16384,32)"),
        ]
        .into_iter()
        .map(|((b, i, o), name)| CatalogConfiguration {
            configuration: Configuration::new(b, i, o),
            name: name.to_string(),
        })
        .collect();
        Self {
            models,
            configurations,
        }
    }
}
