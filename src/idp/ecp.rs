use async_trait::async_trait;
use reqwest::{Client, StatusCode, header::CONTENT_TYPE};
use tracing::{debug, info};

use super::{Assertion, Authenticator, LoginCredentials};
use crate::{
    aws::{RoleArn, Token, sts},
    constants::{
        AWS_SAML_ENDPOINT, AWS_SP_ENTITY_ID, DUO_FACTOR_HEADER, DUO_PASSCODE_HEADER, HTTP_TIMEOUT,
    },
    error::{Error, Result},
    saml::{SamlRequest, SamlResponse},
};

/// Shibboleth-style IdP reached through its SAML ECP endpoint
#[derive(Debug, Clone)]
pub struct EcpProvider {
    endpoint_url: String,
    profile: String,
    duration_seconds: i32,
    client: Client,
}

impl EcpProvider {
    pub fn new(endpoint_url: String, profile: String, duration_seconds: i32) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::ConfigInvalid(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            endpoint_url,
            profile,
            duration_seconds,
            client,
        })
    }

    async fn post_authn_request(&self, credentials: &LoginCredentials) -> Result<Vec<u8>> {
        let envelope = SamlRequest {
            issuer: AWS_SP_ENTITY_ID.to_string(),
            acs_url: AWS_SAML_ENDPOINT.to_string(),
        }
        .generate();

        let mut request = self
            .client
            .post(&self.endpoint_url)
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .basic_auth(&credentials.username, Some(&credentials.password))
            .body(envelope);

        if let Some(factor) = credentials.factor {
            request = request.header(DUO_FACTOR_HEADER, factor.as_str());
        }
        if let Some(passcode) = &credentials.passcode {
            request = request.header(DUO_PASSCODE_HEADER, passcode);
        }

        debug!(url = %self.endpoint_url, "POST ECP AuthnRequest");
        let response = request
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        debug!(%status, "ECP endpoint responded");
        match status {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(Error::AuthenticationFailed(format!(
                    "IdP rejected the credentials ({status})"
                )));
            }
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                return Err(Error::Transport(format!("IdP returned {status}")));
            }
            _ => {
                return Err(Error::AuthenticationFailed(format!(
                    "IdP returned unexpected status {status}"
                )));
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl Authenticator for EcpProvider {
    async fn authenticate(&self, credentials: &LoginCredentials) -> Result<Assertion> {
        let soap = self.post_authn_request(credentials).await?;

        let response = SamlResponse::from_soap(soap);
        response.ensure_success()?;
        let assertion = Assertion {
            saml: response.assertion()?,
            roles: response.roles()?,
        };

        info!(
            endpoint = %self.endpoint_url,
            roles = assertion.roles.len(),
            "Successfully authenticated with username/password"
        );
        Ok(assertion)
    }

    async fn assume_role(&self, assertion: &Assertion, role: &RoleArn) -> Result<Token> {
        sts::assume_role_with_saml(
            &self.profile,
            &assertion.saml,
            role,
            self.duration_seconds,
        )
        .await
    }
}
