use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

/// Load an env file (`.env` by default) from the current directory or the
/// nearest ancestor that has one. Returns the path that was loaded.
pub fn load_dotenv_from_ancestors(file_name: &str) -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    let mut current = cwd.as_path();
    loop {
        let env_path = current.join(file_name);
        if env_path.exists() {
            dotenvy::from_path(&env_path)
                .with_context(|| format!("Failed to load {} from {}", file_name, env_path.display()))?;
            info!("Loaded {} from {}", file_name, env_path.display());
            return Ok(env_path);
        }

        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }

    anyhow::bail!(
        "No {} file found.\n\n\
        Searched from {} to filesystem root.\n\n\
        Hint: run 'parkflow init' to create a .env.example.",
        file_name,
        cwd.display()
    )
}

/// File name for an optional named environment.
pub fn env_file_name(env: Option<&str>) -> String {
    match env {
        Some(name) => format!(".env.{}", name),
        None => ".env".to_string(),
    }
}
