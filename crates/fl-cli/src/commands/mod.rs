pub mod config;
pub mod queue;
pub mod review;
pub mod task;

use std::path::Path;

use anyhow::Context;
use fl_core::config::Config;
use fl_core::task_store::TaskStore;
use serde::Serialize;

/// Open the task store named by the config, creating its directory first.
pub async fn open_store(config: &Config, override_path: Option<&Path>) -> anyhow::Result<TaskStore> {
    let path = match override_path {
        Some(p) => p.to_path_buf(),
        None => config.store.resolved_path(),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = TaskStore::open(&path, config.store.busy_timeout())
        .await
        .with_context(|| format!("failed to open task store at {}", path.display()))?;
    tracing::debug!(path = %path.display(), "task store opened");
    Ok(store.with_supervisor(config.agents.supervisor_name.clone()))
}

/// Pretty-print any serializable result on stdout.
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse a `--meta key=value` pair. The value is read as JSON when it parses,
/// otherwise kept as a string.
pub fn parse_meta(pair: &str) -> Result<(String, serde_json::Value), String> {
    let (key, raw) = pair
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {pair:?}"))?;
    if key.is_empty() {
        return Err("metadata key must not be empty".into());
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
