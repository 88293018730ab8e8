use std::io::{self, Read};

use anyhow::{Context, Result, bail};
use clap::Args;
use tracing::warn;

use crate::{
    aws::CredentialStore,
    constants,
    idp::EcpProvider,
    renewal::{DaemonRuntime, RenewalRequest, ReplayRenewer, RunOutcome},
    session::{SessionCache, SessionRecord},
};

/// Detached renewal loop, launched by `login` with its request on stdin
#[derive(Debug, Clone, Args)]
pub struct RenewCommand {}

impl RenewCommand {
    pub async fn execute(self, profile: &str) -> Result<()> {
        let mut payload = String::new();
        io::stdin()
            .read_to_string(&mut payload)
            .context("Failed to read renewal request")?;
        let request: RenewalRequest =
            serde_json::from_str(&payload).context("Malformed renewal request")?;

        let state_dir = constants::get_state_dir().context("Failed to determine state directory")?;
        let store = CredentialStore::from_env()?;
        let cache = SessionCache::new(&state_dir);
        let scheduler = request.scheduler()?;
        let provider = EcpProvider::new(
            request.ecp_endpoint_url.clone(),
            profile.to_string(),
            request.duration_seconds,
        )?;
        let renewer = ReplayRenewer::new(
            provider,
            request.credentials.clone(),
            request.role_arn.clone(),
        );

        let outcome = DaemonRuntime::new(&state_dir, profile)
            .run(
                &scheduler,
                &renewer,
                &store,
                request.expiration,
                |token| {
                    let record = SessionRecord {
                        role_arn: request.role_arn.clone(),
                        identity_provider: request.identity_provider.clone(),
                        expiration: token.expiration,
                    };
                    if let Err(e) = cache.save(profile, &record) {
                        warn!(error = %e, "Failed to update session cache");
                    }
                },
            )
            .await?;

        match outcome {
            RunOutcome::Stopped => Ok(()),
            RunOutcome::Failed(e) => bail!("Renewal for profile '{profile}' gave up: {e}"),
        }
    }
}
