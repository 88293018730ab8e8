use std::io;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use crate::{
    aws::CredentialStore,
    config::{self, Overrides, RefreshMode},
    constants,
    idp::EcpProvider,
    prompt::TerminalPrompter,
    renewal::{RenewalDaemon, SelfExecLauncher, process::UnixProcessController},
    secrets::OsKeyring,
    session::{DaemonStatus, LoginIo, LoginOutcome, SessionCache, SessionManager},
};

#[derive(Debug, Clone, Default, Args)]
pub struct LoginCommand {
    #[arg(long, help = "ECP endpoint URL of the identity provider")]
    pub ecp_endpoint_url: Option<String>,

    #[arg(short = 'u', long, help = "Username for the identity provider")]
    pub username: Option<String>,

    #[arg(long, help = "Password for the identity provider")]
    pub password: Option<String>,

    #[arg(short = 'r', long, help = "ARN of the role to assume, skipping the role menu")]
    pub role_arn: Option<String>,

    #[arg(long, help = "Duo factor: auto, push, phone, sms, passcode or off")]
    pub factor: Option<String>,

    #[arg(long, help = "Duo passcode, used with --factor passcode")]
    pub passcode: Option<String>,

    #[arg(long, value_parser = clap::value_parser!(RefreshMode), help = "Renewal schedule: off, auto or a maximum interval in seconds")]
    pub refresh: Option<RefreshMode>,

    #[arg(long, help = "Prompt for the password even if one is stored")]
    pub ask_password: bool,

    #[arg(short = 'f', long, help = "Log in again even if current credentials are still valid")]
    pub force_refresh: bool,
}

impl LoginCommand {
    fn overrides(&self) -> Overrides {
        Overrides {
            ecp_endpoint_url: self.ecp_endpoint_url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            factor: self.factor.clone(),
            passcode: self.passcode.clone(),
            role_arn: self.role_arn.clone(),
            refresh: self.refresh,
            ask_password: self.ask_password,
        }
    }

    pub async fn execute(self, profile: &str) -> Result<()> {
        info!("Starting login for profile: {}", profile);

        let config = config::load(profile)
            .await
            .with_context(|| format!("Failed to load configuration for profile '{profile}'"))?
            .apply(self.overrides())?;

        let state_dir = constants::get_state_dir().context("Failed to determine state directory")?;
        let store = CredentialStore::from_env()?;
        let provider = EcpProvider::new(
            config.ecp_endpoint_url.clone(),
            profile.to_string(),
            config.duration_seconds,
        )?;

        let manager = SessionManager::new(
            profile,
            config,
            provider,
            store,
            RenewalDaemon::new(&state_dir, UnixProcessController),
            SessionCache::new(&state_dir),
        );

        let prompter = TerminalPrompter::default();
        let launcher = SelfExecLauncher::new(&state_dir);
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut output = io::stdout();

        let outcome = manager
            .login(
                LoginIo {
                    prompter: &prompter,
                    keyring: &OsKeyring,
                    launcher: &launcher,
                    input: &mut input,
                    output: &mut output,
                },
                self.force_refresh,
            )
            .await
            .context("Login failed")?;

        match outcome {
            LoginOutcome::StillValid { expiration } => {
                println!(
                    "Credentials for profile '{profile}' are valid until {expiration}. Use --force-refresh to log in again."
                );
            }
            LoginOutcome::LoggedIn {
                role,
                expiration,
                daemon,
            } => {
                println!("\nAWS credentials for {} saved to {profile} profile.", role.role_arn);
                println!("Credentials will expire at: {expiration}");
                match daemon {
                    DaemonStatus::Started { pid } => {
                        println!("Renewing credentials in the background (pid {pid}).");
                    }
                    DaemonStatus::AlreadyRunning { pid } => {
                        println!("Background renewal already running (pid {pid}).");
                    }
                    DaemonStatus::Unavailable(reason) => {
                        eprintln!("Warning: background renewal disabled: {reason}");
                    }
                    DaemonStatus::Disabled => {}
                }
            }
        }

        Ok(())
    }
}
