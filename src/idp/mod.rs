pub mod ecp;

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::aws::{RoleArn, RoleCatalog, Token};
use crate::error::{Error, Result};

pub use self::ecp::EcpProvider;

/// Duo second factor requested from the IdP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Factor {
    Auto,
    Push,
    Phone,
    Sms,
    Passcode,
}

impl Factor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Push => "push",
            Self::Phone => "phone",
            Self::Sms => "sms",
            Self::Passcode => "passcode",
        }
    }

    /// Parse an optional factor; an empty answer means "no factor".
    pub fn parse_optional(value: &str) -> Result<Option<Self>> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(None);
        }
        value.parse().map(Some)
    }
}

impl FromStr for Factor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "push" => Ok(Self::Push),
            "phone" => Ok(Self::Phone),
            "sms" => Ok(Self::Sms),
            "passcode" => Ok(Self::Passcode),
            _ => Err(Error::InvalidFactor(s.to_string())),
        }
    }
}

impl fmt::Display for Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-supplied factors for one authentication attempt
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginCredentials {
    pub username: String,
    pub password: String,
    pub factor: Option<Factor>,
    pub passcode: Option<String>,
}

impl LoginCredentials {
    /// Credentials usable for unattended renewal.
    ///
    /// One-time passcodes cannot be replayed, so a passcode factor makes
    /// unattended renewal impossible.
    pub fn for_renewal(&self) -> Result<Self> {
        if self.factor == Some(Factor::Passcode) {
            return Err(Error::InteractionRequired(
                "the passcode factor needs a fresh passcode for every login".into(),
            ));
        }
        Ok(Self {
            passcode: None,
            ..self.clone()
        })
    }
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("factor", &self.factor)
            .field("passcode", &self.passcode.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Successful IdP login: the SAML assertion and the roles it grants
#[derive(Debug, Clone)]
pub struct Assertion {
    pub saml: String,
    pub roles: RoleCatalog,
}

/// Federated login exchange yielding roles and, per role, temporary keys
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &LoginCredentials) -> Result<Assertion>;

    async fn assume_role(&self, assertion: &Assertion, role: &RoleArn) -> Result<Token>;
}
