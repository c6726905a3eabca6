//! Client to the external identity service (`auth.beammp.com/pkToUser`).
//!
//! Resolves the opaque key a client presents during [`KEY_EXCHANGE`](crate::session)
//! into a nickname, role tag, guest flag and identifier set. The service
//! itself is out of scope; this module only owns the HTTP call shape.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::Deserialize;

use crate::error::{RelayError, Result};

/// Default identity endpoint, matching the reference's hardcoded URL.
pub const DEFAULT_ENDPOINT: &str = "https://auth.beammp.com/pkToUser";

#[derive(Debug, Deserialize)]
struct IdentityResponse {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    roles: Option<String>,
    #[serde(default)]
    guest: Option<bool>,
    #[serde(default)]
    identifiers: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Resolved identity for a connecting player, ready to seed a [`Session`](crate::session::Session).
#[derive(Debug, Clone)]
pub struct Identity {
    pub username: String,
    pub roles: String,
    pub guest: bool,
    pub identifiers: HashMap<String, String>,
}

/// Blocking client for the identity endpoint, one instance shared across
/// every connection's handshake.
pub struct IdentityClient {
    http: reqwest::blocking::Client,
    endpoint: String,
}

impl IdentityClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::blocking::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    /// Resolve `key` into an [`Identity`], injecting `peer_ip` as the `ip`
    /// identifier when the service didn't already supply one.
    pub fn resolve(&self, key: &str, peer_ip: IpAddr) -> Result<Identity> {
        let response = self
            .http
            .post(&self.endpoint)
            .form(&[("key", key)])
            .send()
            .map_err(|e| RelayError::IdentityFailed(e.to_string()))?;

        let body: IdentityResponse = response
            .json()
            .map_err(|e| RelayError::IdentityFailed(e.to_string()))?;

        if let Some(err) = body.error {
            return Err(RelayError::IdentityFailed(err));
        }
        let username = body
            .username
            .ok_or_else(|| RelayError::IdentityFailed("missing username".to_string()))?;
        let roles = body.roles.unwrap_or_default();
        let guest = body.guest.unwrap_or(true);

        let mut identifiers: HashMap<String, String> = body
            .identifiers
            .iter()
            .filter_map(|entry| entry.split_once(':'))
            .map(|(label, value)| (label.to_string(), value.to_string()))
            .collect();
        identifiers
            .entry("ip".to_string())
            .or_insert_with(|| peer_ip.to_string());

        Ok(Identity {
            username,
            roles,
            guest,
            identifiers,
        })
    }
}

impl Default for IdentityClient {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_ip_identifier_is_backfilled_from_peer_addr() {
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        let body = IdentityResponse {
            username: Some("player1".into()),
            roles: Some("USER".into()),
            guest: Some(false),
            identifiers: vec!["discord:12345".into()],
            error: None,
        };
        let mut identifiers: HashMap<String, String> = body
            .identifiers
            .iter()
            .filter_map(|entry| entry.split_once(':'))
            .map(|(l, v)| (l.to_string(), v.to_string()))
            .collect();
        identifiers.entry("ip".to_string()).or_insert_with(|| ip.to_string());
        assert_eq!(identifiers.get("ip"), Some(&"203.0.113.5".to_string()));
        assert_eq!(identifiers.get("discord"), Some(&"12345".to_string()));
    }
}
