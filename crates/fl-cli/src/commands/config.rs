use fl_core::config::Config;

/// Render the effective configuration as TOML.
pub fn show(config: &Config) -> anyhow::Result<String> {
    Ok(config.to_toml()?)
}
