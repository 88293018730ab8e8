use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod credentials;
pub mod roles;
pub mod sts;

/// AWS temporary credentials returned by STS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

// Re-export commonly used types (functions should be accessed via module path)
pub use credentials::CredentialStore;
pub use roles::{AvailableRoles, RoleArn, RoleCatalog};
