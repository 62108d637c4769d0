//! `corvid config`: Print the effective configuration.

use corvid_config::AppConfig;

use crate::engine::Options;

pub fn show(options: &Options) -> anyhow::Result<()> {
    let mut config = options.load_config()?;
    for provider in config.providers.values_mut() {
        if provider.api_key.is_some() {
            provider.api_key = Some("[REDACTED]".into());
        }
    }
    let path = options
        .config
        .clone()
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));
    if path.exists() {
        eprintln!("# {}", path.display());
    } else {
        eprintln!("# {} not found, showing defaults", path.display());
    }
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
