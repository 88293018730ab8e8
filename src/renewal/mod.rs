pub mod daemon;
pub mod process;
pub mod scheduler;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    aws::{AvailableRoles, Token},
    error::Result,
    idp::{Authenticator, LoginCredentials},
};

pub use daemon::{
    DaemonLauncher, DaemonRuntime, DaemonState, RenewalDaemon, SelfExecLauncher, StopOutcome,
};
pub use process::{ProcessController, ProcessStatus, Signal};
pub use scheduler::{RenewalScheduler, Renewer, RetryPolicy, RunOutcome};

/// Everything a detached renewal process needs, handed over on its stdin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewalRequest {
    pub ecp_endpoint_url: String,
    pub credentials: LoginCredentials,
    pub role_arn: String,
    pub identity_provider: String,
    pub duration_seconds: i32,
    pub expiration: DateTime<Utc>,
    pub margin: f64,
    pub interval_secs: Option<u64>,
}

impl RenewalRequest {
    pub fn scheduler(&self) -> Result<RenewalScheduler> {
        Ok(RenewalScheduler::new(self.margin)?
            .with_interval(self.interval_secs.map(Duration::from_secs)))
    }
}

/// Renews by replaying the login captured at startup and re-assuming the same role
pub struct ReplayRenewer<A: Authenticator> {
    authenticator: A,
    credentials: LoginCredentials,
    role_arn: String,
}

impl<A: Authenticator> ReplayRenewer<A> {
    pub fn new(authenticator: A, credentials: LoginCredentials, role_arn: String) -> Self {
        Self {
            authenticator,
            credentials,
            role_arn,
        }
    }
}

#[async_trait]
impl<A: Authenticator> Renewer for ReplayRenewer<A> {
    async fn renew(&self) -> Result<Token> {
        let assertion = self.authenticator.authenticate(&self.credentials).await?;
        let role = AvailableRoles::from_catalog(assertion.roles.clone())?.preselect(&self.role_arn)?;
        self.authenticator.assume_role(&assertion, &role).await
    }
}
