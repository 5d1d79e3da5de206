use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parkflow_config::{validate_config, PipelineConfig};
use parkflow_pipeline::PipelineOptions;
use parkflow_state::SqliteStore;

/// Load and validate parkflow.toml.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let config = PipelineConfig::load(path).with_context(|| {
        format!(
            "Failed to load {} (run 'parkflow init' to create one)",
            path.display()
        )
    })?;
    validate_config(&config).with_context(|| format!("Invalid config in {}", path.display()))?;
    Ok(config)
}

/// Open the state database, creating its directory if needed.
pub fn open_store(config: &PipelineConfig) -> Result<Arc<SqliteStore>> {
    let path = config.checkpoint_path();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = SqliteStore::open(&path)
        .with_context(|| format!("Failed to open state database {}", path.display()))?;
    Ok(Arc::new(store))
}

pub fn pipeline_options(config: &PipelineConfig) -> PipelineOptions {
    PipelineOptions {
        change_policy: config.change_policy,
        retry: config.retry_policy(),
        observer_timeout: config.observer_timeout(),
    }
}
