use std::{env, path::PathBuf, time::Duration};

use dirs;

/// State directory name under the user's home directory
pub const STATE_DIR_NAME: &str = ".aws-login";

/// Login configuration file name inside the state directory
pub const LOGIN_CONFIG_FILE_NAME: &str = "config";

/// AWS configuration directory name
pub const AWS_CONFIG_DIR_NAME: &str = ".aws";

/// AWS shared credentials file name
pub const AWS_CREDENTIALS_FILE_NAME: &str = "credentials";

/// Profile used when none is given
pub const DEFAULT_PROFILE: &str = "default";

/// AWS SAML endpoint URL (Assertion Consumer Service of the AWS SP)
pub const AWS_SAML_ENDPOINT: &str = "https://signin.aws.amazon.com/saml";

/// Issuer sent in ECP AuthnRequests
pub const AWS_SP_ENTITY_ID: &str = "urn:amazon:webservices";

/// SAML attribute carrying "provider_arn,role_arn" pairs
pub const AWS_ROLE_ATTRIBUTE: &str = "https://aws.amazon.com/SAML/Attributes/Role";

/// Header carrying the Duo factor to the IdP
pub const DUO_FACTOR_HEADER: &str = "X-Shibboleth-Duo-Factor";

/// Header carrying the Duo passcode to the IdP
pub const DUO_PASSCODE_HEADER: &str = "X-Shibboleth-Duo-Passcode";

/// Keyring service name for stored IdP passwords
pub const KEYRING_SERVICE: &str = "aws-login";

/// Default AWS region for STS operations when no region is configured
pub const DEFAULT_AWS_REGION: &str = "us-east-1";

/// Default requested session duration in seconds
pub const DEFAULT_SESSION_DURATION_SECS: i32 = 3600;

/// Renew once this fraction of the remaining lifetime has elapsed
pub const DEFAULT_REFRESH_MARGIN: f64 = 0.9;

/// Total renewal attempts per wake-up before the daemon gives up
pub const RENEWAL_MAX_ATTEMPTS: u32 = 5;

/// First backoff delay after a transient renewal failure
pub const RENEWAL_INITIAL_BACKOFF: Duration = Duration::from_secs(30);

/// Upper bound for the renewal backoff delay
pub const RENEWAL_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// How long `stop` waits for a daemon to exit before escalating
pub const DAEMON_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Initial poll interval while waiting for a daemon to exit
pub const DAEMON_STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Timeout for HTTP requests to the IdP
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Get the state directory holding login config, daemon records and logs
/// Respects AWS_LOGIN_DIR environment variable if set
pub fn get_state_dir() -> Option<PathBuf> {
    if let Ok(path) = env::var("AWS_LOGIN_DIR") {
        return Some(PathBuf::from(path));
    }

    dirs::home_dir().map(|home| home.join(STATE_DIR_NAME))
}

/// Get the login configuration file path
pub fn get_login_config_path() -> Option<PathBuf> {
    get_state_dir().map(|dir| dir.join(LOGIN_CONFIG_FILE_NAME))
}

/// Get the AWS credentials file path
/// Respects AWS_SHARED_CREDENTIALS_FILE environment variable if set
pub fn get_aws_credentials_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("AWS_SHARED_CREDENTIALS_FILE") {
        return Some(PathBuf::from(path));
    }

    dirs::home_dir().map(|home| {
        home.join(AWS_CONFIG_DIR_NAME)
            .join(AWS_CREDENTIALS_FILE_NAME)
    })
}
