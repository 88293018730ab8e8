use anyhow::{Context, Result};
use clap::Args;
use tracing::debug;

use crate::{config, constants};

#[derive(Debug, Clone, Args)]
pub struct ConfigureCommand {}

impl ConfigureCommand {
    pub async fn execute(self, profile: &str) -> Result<()> {
        let path = constants::get_login_config_path().context("Failed to determine config path")?;
        debug!(path = %path.display(), "Editing login configuration");
        config::configure_interactive(&path, profile).await
    }
}
