use aws_config::{
    BehaviorVersion, Region, SdkConfig,
    environment::EnvironmentVariableRegionProvider,
    meta::region::RegionProviderChain,
    profile::ProfileFileRegionProvider,
};
use aws_sdk_sts::{
    Client as StsClient,
    error::{DisplayErrorContext, SdkError},
};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{RoleArn, Token};
use crate::{
    constants::DEFAULT_AWS_REGION,
    error::{Error, Result},
};

/// Region lookup: environment, then the profile's config section, then the default.
async fn sdk_config(profile: &str) -> SdkConfig {
    let region = RegionProviderChain::first_try(EnvironmentVariableRegionProvider::new())
        .or_else(
            ProfileFileRegionProvider::builder()
                .profile_name(profile)
                .build(),
        )
        .or_else(Region::new(DEFAULT_AWS_REGION));

    aws_config::defaults(BehaviorVersion::latest())
        .profile_name(profile)
        .region(region)
        .load()
        .await
}

/// Network-level SDK failures are retried by the renewal loop; anything else is final.
fn classify<E, R>(err: SdkError<E, R>) -> Error
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            Error::Transport(message)
        }
        _ => Error::AuthenticationFailed(message),
    }
}

/// Exchange a SAML assertion for temporary keys of `role`.
pub async fn assume_role_with_saml(
    profile: &str,
    saml_assertion: &str,
    role: &RoleArn,
    duration_seconds: i32,
) -> Result<Token> {
    let config = sdk_config(profile).await;
    debug!(
        profile,
        role_arn = %role.role_arn,
        principal_arn = %role.identity_provider,
        duration_seconds,
        region = ?config.region(),
        "Calling AssumeRoleWithSAML"
    );

    let response = StsClient::new(&config)
        .assume_role_with_saml()
        .role_arn(&role.role_arn)
        .principal_arn(&role.identity_provider)
        .saml_assertion(saml_assertion)
        .duration_seconds(duration_seconds)
        .send()
        .await
        .map_err(classify)?;

    let credentials = response
        .credentials()
        .ok_or_else(|| Error::AuthenticationFailed("AWS STS returned no credentials".into()))?;

    let issued = credentials.expiration();
    let expiration = DateTime::<Utc>::from_timestamp(issued.secs(), issued.subsec_nanos())
        .ok_or_else(|| {
            Error::AuthenticationFailed("AWS STS returned an invalid expiration".into())
        })?;

    info!(profile, %expiration, "Obtained temporary AWS credentials");
    Ok(Token {
        access_key_id: credentials.access_key_id().to_string(),
        secret_access_key: credentials.secret_access_key().to_string(),
        session_token: credentials.session_token().to_string(),
        expiration,
    })
}
