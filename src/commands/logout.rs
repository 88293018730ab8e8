use anyhow::{Context, Result};
use clap::Args;

use crate::{
    aws::CredentialStore,
    constants,
    renewal::{ProcessController, RenewalDaemon, StopOutcome, process::UnixProcessController},
    session::{self, SessionCache},
};

#[derive(Debug, Clone, Args)]
pub struct LogoutCommand {}

impl LogoutCommand {
    pub async fn execute(self, profile: &str) -> Result<()> {
        let state_dir = constants::get_state_dir().context("Failed to determine state directory")?;
        let store = CredentialStore::from_env()?;
        let daemon = RenewalDaemon::new(&state_dir, UnixProcessController);
        let cache = SessionCache::new(&state_dir);

        let stopped = logout_off_runtime(profile.to_string(), daemon, store, cache)
            .await
            .with_context(|| format!("Failed to log out of profile '{profile}'"))?;

        match stopped {
            StopOutcome::Stopped { pid } | StopOutcome::Killed { pid } => {
                println!("Stopped background renewal (pid {pid}).");
            }
            StopOutcome::NotRunning => {}
        }
        println!("Logged out of profile '{profile}'.");
        Ok(())
    }
}

/// Stopping the daemon sleeps between liveness polls, so it runs on the blocking pool.
async fn logout_off_runtime<C>(
    profile: String,
    daemon: RenewalDaemon<C>,
    store: CredentialStore,
    cache: SessionCache,
) -> Result<StopOutcome>
where
    C: ProcessController + 'static,
{
    let stopped = tokio::task::spawn_blocking(move || {
        session::logout(&profile, &daemon, &store, &cache)
    })
    .await
    .context("Logout task panicked")??;
    Ok(stopped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renewal::{ProcessStatus, Signal, process::mock::MockProcessController};
    use std::{
        fs,
        time::{Duration, Instant},
    };
    use tempfile::TempDir;

    #[tokio::test(flavor = "current_thread")]
    async fn test_logout_does_not_block_the_runtime() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("dev.pid"), "4242\n").unwrap();
        let controller = MockProcessController::new()
            .with_process(4242, ProcessStatus::Running)
            .exiting_on(Signal::Kill);
        let daemon = RenewalDaemon::new(dir.path(), controller)
            .with_stop_timeout(Duration::from_millis(300));
        let store = CredentialStore::new(dir.path().join("credentials"));
        let cache = SessionCache::new(dir.path());

        let logout = logout_off_runtime("dev".to_string(), daemon, store, cache);
        let ticker = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Instant::now()
        };
        let (stopped, ticked) = tokio::join!(logout, ticker);
        let finished = Instant::now();

        assert_eq!(stopped.unwrap(), StopOutcome::Killed { pid: 4242 });
        assert!(finished.duration_since(ticked) >= Duration::from_millis(200));
        assert!(!dir.path().join("dev.pid").exists());
    }
}
