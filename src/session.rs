use std::{
    fs,
    io::{self, BufRead, Write},
    path::PathBuf,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    aws::{CredentialStore, RoleArn, roles::select_role},
    config::Config,
    error::{Error, Result},
    idp::Authenticator,
    prompt::Prompter,
    renewal::{
        DaemonLauncher, ProcessController, RenewalDaemon, RenewalRequest, RenewalScheduler,
        StopOutcome,
    },
    secrets::SecretStore,
};

/// What login last obtained for a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub role_arn: String,
    pub identity_provider: String,
    pub expiration: DateTime<Utc>,
}

/// `<state dir>/<profile>.session.json`
#[derive(Debug, Clone)]
pub struct SessionCache {
    dir: PathBuf,
}

impl SessionCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, profile: &str) -> PathBuf {
        self.dir.join(format!("{profile}.session.json"))
    }

    pub fn load(&self, profile: &str) -> Result<Option<SessionRecord>> {
        let contents = match fs::read_to_string(self.path(profile)) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&contents) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(profile, error = %e, "Ignoring unreadable session cache");
                Ok(None)
            }
        }
    }

    pub fn save(&self, profile: &str, record: &SessionRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(record).map_err(io::Error::other)?;
        fs::write(self.path(profile), json)?;
        Ok(())
    }

    pub fn remove(&self, profile: &str) -> Result<()> {
        match fs::remove_file(self.path(profile)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Interactive collaborators used during login
pub struct LoginIo<'a> {
    pub prompter: &'a dyn Prompter,
    pub keyring: &'a dyn SecretStore,
    pub launcher: &'a dyn DaemonLauncher,
    pub input: &'a mut dyn BufRead,
    pub output: &'a mut dyn Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonStatus {
    Disabled,
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
    /// Renewal was requested but cannot run unattended.
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Cached credentials are still good; nothing was done.
    StillValid { expiration: DateTime<Utc> },
    LoggedIn {
        role: RoleArn,
        expiration: DateTime<Utc>,
        daemon: DaemonStatus,
    },
}

/// Orchestrates login and logout for one profile
pub struct SessionManager<A: Authenticator, C: ProcessController> {
    profile: String,
    config: Config,
    authenticator: A,
    store: CredentialStore,
    daemon: RenewalDaemon<C>,
    cache: SessionCache,
}

impl<A: Authenticator, C: ProcessController> SessionManager<A, C> {
    pub fn new(
        profile: impl Into<String>,
        config: Config,
        authenticator: A,
        store: CredentialStore,
        daemon: RenewalDaemon<C>,
        cache: SessionCache,
    ) -> Self {
        Self {
            profile: profile.into(),
            config,
            authenticator,
            store,
            daemon,
            cache,
        }
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Session still usable without talking to the IdP.
    fn cached_session(&self, now: DateTime<Utc>) -> Result<Option<SessionRecord>> {
        let Some(record) = self.cache.load(&self.profile)? else {
            return Ok(None);
        };
        if record.expiration <= now {
            return Ok(None);
        }
        let stored = self.store.load(&self.profile)?;
        Ok(stored.filter(|keys| !keys.is_blank()).map(|_| record))
    }

    /// Authenticate, pick a role, store its credentials and hand renewal to a daemon.
    pub async fn login(&self, mut io: LoginIo<'_>, force_refresh: bool) -> Result<LoginOutcome> {
        let profile = self.profile.as_str();

        let scheduler = if self.config.refresh.is_enabled() {
            Some(
                RenewalScheduler::new(self.config.refresh_margin)?
                    .with_interval(self.config.refresh.interval()),
            )
        } else {
            None
        };

        if !force_refresh {
            if let Some(record) = self.cached_session(Utc::now())? {
                info!(profile, expiration = %record.expiration, "Credentials still valid");
                return Ok(LoginOutcome::StillValid {
                    expiration: record.expiration,
                });
            }
        }

        let running = match scheduler {
            Some(_) => self.daemon.running_pid(profile)?,
            None => None,
        };
        if let (Some(pid), false) = (running, force_refresh) {
            return Err(Error::AlreadyRunning {
                profile: profile.to_string(),
                pid,
            });
        }

        let credentials = self.config.get_credentials(io.prompter, io.keyring)?;
        let assertion = self.authenticator.authenticate(&credentials).await?;
        let role = select_role(
            assertion.roles.clone(),
            self.config.role_arn.as_deref(),
            &mut io.input,
            &mut io.output,
        )?;
        debug!(profile, role = %role.role_arn, "Assuming role");

        let token = self.authenticator.assume_role(&assertion, &role).await?;
        self.store.save(profile, &token)?;
        self.cache.save(
            profile,
            &SessionRecord {
                role_arn: role.role_arn.clone(),
                identity_provider: role.identity_provider.clone(),
                expiration: token.expiration,
            },
        )?;

        let daemon = match (scheduler, running) {
            (None, _) => DaemonStatus::Disabled,
            (Some(_), Some(pid)) => DaemonStatus::AlreadyRunning { pid },
            (Some(scheduler), None) => match credentials.for_renewal() {
                Ok(credentials) => {
                    let request = RenewalRequest {
                        ecp_endpoint_url: self.config.ecp_endpoint_url.clone(),
                        credentials,
                        role_arn: role.role_arn.clone(),
                        identity_provider: role.identity_provider.clone(),
                        duration_seconds: self.config.duration_seconds,
                        expiration: token.expiration,
                        margin: scheduler.margin(),
                        interval_secs: scheduler.interval().map(|i| i.as_secs()),
                    };
                    let pid = self.daemon.start(profile, io.launcher, &request)?;
                    DaemonStatus::Started { pid }
                }
                Err(Error::InteractionRequired(reason)) => {
                    warn!(profile, %reason, "Credentials will not be renewed");
                    DaemonStatus::Unavailable(reason)
                }
                Err(e) => return Err(e),
            },
        };

        Ok(LoginOutcome::LoggedIn {
            role,
            expiration: token.expiration,
            daemon,
        })
    }

    pub fn logout(&self) -> Result<StopOutcome> {
        logout(&self.profile, &self.daemon, &self.store, &self.cache)
    }
}

/// Stop renewal, then blank the profile's keys.
///
/// Needs no login configuration, so a profile can be logged out even after
/// its IdP settings were removed.
pub fn logout<C: ProcessController>(
    profile: &str,
    daemon: &RenewalDaemon<C>,
    store: &CredentialStore,
    cache: &SessionCache,
) -> Result<StopOutcome> {
    let stopped = daemon.stop(profile)?;
    store.remove(profile)?;
    cache.remove(profile)?;
    info!(profile, ?stopped, "Logged out");
    Ok(stopped)
}
