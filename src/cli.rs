use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

use crate::{
    commands::{CompletionsCommand, ConfigureCommand, LoginCommand, LogoutCommand, RenewCommand},
    constants::DEFAULT_PROFILE,
};

#[derive(Debug, Clone, Parser)]
#[command(name = "aws-login", version, about = "AWS credentials via SAML ECP with background renewal", long_about = None, arg_required_else_help = false)]
pub struct Cli {
    #[arg(
        short = 'p',
        long,
        global = true,
        default_value = DEFAULT_PROFILE,
        help = "AWS profile name"
    )]
    pub profile: String,

    #[arg(short = 'v', long, global = true, action = ArgAction::Count, help = "Increase verbosity (-v info, -vv debug, -vvv trace)")]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    #[command(about = "Log in through the IdP and keep the profile's credentials fresh")]
    Login(LoginCommand),
    #[command(about = "Stop background renewal and remove the profile's credentials")]
    Logout(LogoutCommand),
    #[command(about = "Configure the IdP endpoint and login defaults for a profile")]
    Configure(ConfigureCommand),
    #[command(about = "Generate shell completion scripts for aws-login")]
    Completions(CompletionsCommand),
    #[command(hide = true)]
    Renew(RenewCommand),
}

impl Cli {
    pub fn is_renewal_daemon(&self) -> bool {
        matches!(self.command, Some(Commands::Renew(_)))
    }

    pub async fn execute(self) -> Result<()> {
        let profile = self.profile;
        let command = self
            .command
            .unwrap_or_else(|| Commands::Login(LoginCommand::default()));

        match command {
            Commands::Login(cmd) => cmd.execute(&profile).await,
            Commands::Logout(cmd) => cmd.execute(&profile).await,
            Commands::Configure(cmd) => cmd.execute(&profile).await,
            Commands::Renew(cmd) => cmd.execute(&profile).await,
            Commands::Completions(cmd) => {
                cmd.execute();
                Ok(())
            }
        }
    }
}
