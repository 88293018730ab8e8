use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::Utc;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use uuid::Uuid;

use crate::aws::{RoleArn, RoleCatalog};
use crate::constants::AWS_ROLE_ATTRIBUTE;
use crate::error::{Error, Result};

const SAML_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
const SOAP_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const SAML2_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
const SAML2P_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
const PAOS_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:PAOS";

/// ECP AuthnRequest configuration
#[derive(Debug, Clone)]
pub struct SamlRequest {
    /// The entity that issues the SAML request (the AWS service provider)
    pub issuer: String,
    /// The URL where SAML responses should be sent (Assertion Consumer Service URL)
    pub acs_url: String,
}

impl SamlRequest {
    /// Generate a SOAP-wrapped SAML AuthnRequest for the ECP profile
    pub fn generate(&self) -> String {
        let id = format!("_{}", Uuid::new_v4().simple()).to_uppercase();
        let instant = Utc::now().format("%Y-%m-%dT%H:%M:%S");

        format!(
            r#"<S:Envelope xmlns:S="{SOAP_NS}" xmlns:saml2="{SAML2_NS}" xmlns:saml2p="{SAML2P_NS}"><S:Body><saml2p:AuthnRequest AssertionConsumerServiceURL="{}" ID="{id}" IssueInstant="{instant}" ProtocolBinding="{PAOS_BINDING}" Version="2.0"><saml2:Issuer>{}</saml2:Issuer></saml2p:AuthnRequest></S:Body></S:Envelope>"#,
            self.acs_url, self.issuer
        )
    }
}

/// SOAP response returned by the IdP's ECP endpoint
#[derive(Debug)]
pub struct SamlResponse {
    soap: Vec<u8>,
}

impl SamlResponse {
    pub fn from_soap(soap: impl Into<Vec<u8>>) -> Self {
        Self { soap: soap.into() }
    }

    /// Fail unless the top-level SAML status code is Success
    pub fn ensure_success(&self) -> Result<()> {
        let mut reader = Reader::from_reader(self.soap.as_slice());
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e) | Event::Empty(ref e))
                    if e.local_name().as_ref() == b"StatusCode" =>
                {
                    return match attribute_value(e, b"Value") {
                        Some(value) if value == SAML_SUCCESS => Ok(()),
                        Some(value) => Err(Error::AuthenticationFailed(format!(
                            "IdP returned status {value}"
                        ))),
                        None => Err(invalid_soap("status code without value")),
                    };
                }
                Ok(Event::Eof) => return Err(invalid_soap("no SAML status code")),
                Err(e) => return Err(invalid_soap(&e.to_string())),
                _ => {}
            }
            buf.clear();
        }
    }

    /// Base64 encoding of the SAML `Response` element, as AWS STS expects it.
    ///
    /// Namespace declarations inherited from the SOAP envelope are copied
    /// onto the element so it stands on its own.
    pub fn assertion(&self) -> Result<String> {
        let mut reader = Reader::from_reader(self.soap.as_slice());
        let mut buf = Vec::new();
        let mut inherited: Vec<Vec<(Vec<u8>, Vec<u8>)>> = Vec::new();
        let mut start: Option<(usize, Vec<u8>)> = None;
        let mut depth = 0usize;

        loop {
            let before = reader.buffer_position() as usize;
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    if start.is_some() {
                        depth += 1;
                    } else if e.local_name().as_ref() == b"Response" {
                        let open = self.soap[before..]
                            .iter()
                            .position(|b| *b == b'<')
                            .map(|offset| before + offset)
                            .ok_or_else(|| invalid_soap("unterminated Response"))?;
                        let end = reader.buffer_position() as usize;
                        let tag = with_inherited_namespaces(&self.soap[open..end], e, &inherited);
                        start = Some((end, tag));
                    } else {
                        inherited.push(namespace_declarations(e));
                    }
                }
                Ok(Event::End(ref e)) => match start {
                    Some((body, ref tag)) if depth == 0 => {
                        if e.local_name().as_ref() != b"Response" {
                            return Err(invalid_soap("mismatched Response element"));
                        }
                        let end = reader.buffer_position() as usize;
                        let mut element = tag.clone();
                        element.extend_from_slice(&self.soap[body..end]);
                        return Ok(STANDARD.encode(element));
                    }
                    Some(_) => depth -= 1,
                    None => {
                        inherited.pop();
                    }
                },
                Ok(Event::Eof) => return Err(invalid_soap("no SAML Response element")),
                Err(e) => return Err(invalid_soap(&e.to_string())),
                _ => {}
            }
            buf.clear();
        }
    }

    /// Get attribute values by name
    pub fn get_attribute_values(&self, attribute_name: &str) -> Result<Vec<String>> {
        let mut reader = Reader::from_reader(self.soap.as_slice());
        let mut values = Vec::new();
        let mut in_target_attribute = false;
        let mut in_value = false;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                    b"Attribute" => {
                        in_target_attribute =
                            attribute_value(e, b"Name").as_deref() == Some(attribute_name);
                    }
                    b"AttributeValue" => in_value = in_target_attribute,
                    _ => {}
                },
                Ok(Event::Text(e)) if in_value => {
                    let value = String::from_utf8_lossy(e.as_ref()).trim().to_string();
                    if !value.is_empty() {
                        values.push(value);
                    }
                }
                Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                    b"Attribute" => in_target_attribute = false,
                    b"AttributeValue" => in_value = false,
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Err(e) => return Err(invalid_soap(&e.to_string())),
                _ => {}
            }
            buf.clear();
        }

        Ok(values)
    }

    /// Roles offered in the AWS role attribute, in document order
    pub fn roles(&self) -> Result<RoleCatalog> {
        self.get_attribute_values(AWS_ROLE_ATTRIBUTE)?
            .iter()
            .map(|value| RoleArn::parse_attribute(value))
            .collect()
    }
}

fn invalid_soap(reason: &str) -> Error {
    Error::AuthenticationFailed(format!("invalid SOAP response from IdP: {reason}"))
}

fn attribute_value(e: &BytesStart, name: &[u8]) -> Option<String> {
    e.attributes()
        .filter_map(|attr| attr.ok())
        .find(|attr| attr.key.as_ref() == name)
        .map(|attr| String::from_utf8_lossy(&attr.value).to_string())
}

fn namespace_declarations(e: &BytesStart) -> Vec<(Vec<u8>, Vec<u8>)> {
    e.attributes()
        .filter_map(|attr| attr.ok())
        .filter(|attr| attr.key.as_ref().starts_with(b"xmlns"))
        .map(|attr| (attr.key.as_ref().to_vec(), attr.value.to_vec()))
        .collect()
}

/// Rebuild a raw start tag, adding ancestor namespace declarations it lacks.
fn with_inherited_namespaces(
    raw_tag: &[u8],
    e: &BytesStart,
    inherited: &[Vec<(Vec<u8>, Vec<u8>)>],
) -> Vec<u8> {
    let mut declared: Vec<Vec<u8>> = namespace_declarations(e)
        .into_iter()
        .map(|(key, _)| key)
        .collect();

    let mut extra = Vec::new();
    for (key, value) in inherited.iter().rev().flatten() {
        if declared.contains(key) {
            continue;
        }
        extra.push(b' ');
        extra.extend_from_slice(key);
        extra.extend_from_slice(b"=\"");
        extra.extend_from_slice(value);
        extra.push(b'"');
        declared.push(key.clone());
    }

    let close = raw_tag.len() - 1;
    let mut tag = raw_tag[..close].to_vec();
    tag.extend_from_slice(&extra);
    tag.extend_from_slice(&raw_tag[close..]);
    tag
}
