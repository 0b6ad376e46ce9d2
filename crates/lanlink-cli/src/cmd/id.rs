//! `lanlink id`

use crate::config::{apply_env_overrides, load_config};
use anyhow::Context;
use lanlink_types::Identity;
use std::path::Path;

pub fn cmd_id(config_path: Option<&Path>) -> anyhow::Result<()> {
    let mut config = load_config(config_path);
    apply_env_overrides(&mut config);

    let identity = Identity::load_or_generate(&config.identity_path, config.identity_policy())
        .with_context(|| {
            format!(
                "Failed to load identity from {}",
                config.identity_path.display()
            )
        })?;

    println!("{}", identity.id());
    println!("  identity file: {}", config.identity_path.display());
    Ok(())
}
