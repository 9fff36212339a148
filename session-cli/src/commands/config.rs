//! Show the effective configuration.

use anyhow::{Context, Result};
use session_client::ClientConfig;

use crate::ConfigSource;

/// Run the config command.
pub fn run(source: &ConfigSource, config: &ClientConfig, path_only: bool) -> Result<()> {
    if path_only {
        println!("{}", source.path().display());
        return Ok(());
    }

    match source {
        ConfigSource::Default(path) if !path.exists() => {
            println!("# {} not found, showing defaults", path.display());
        }
        _ => println!("# {}", source.path().display()),
    }
    let rendered = config
        .to_toml()
        .context("Failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}
