//! Time-limited TURN credentials (coturn REST API convention)
//!
//! The credential username is `<expiry-unix>:<user>` and the password is
//! `base64(hmac-sha1(secret, username))`; the TURN server derives the same
//! MAC from its shared secret and honors the credential until expiry.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;

use crate::config::TurnServerConfig;
use crate::error::{AppError, Result};

type HmacSha1 = Hmac<Sha1>;

/// One ICE server entry as handed to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Response body for the ice-servers endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServersResponse {
    #[serde(rename = "iceServers")]
    pub ice_servers: Vec<IceServer>,
    /// Seconds the credentials remain valid
    pub ttl: i64,
}

/// Mint TURN credentials for a user
///
/// Returns an empty server list when no TURN server is configured; viewers
/// then fall back to host candidates.
pub fn mint_ice_servers(
    config: &TurnServerConfig,
    user: &str,
    now: DateTime<Utc>,
) -> Result<IceServersResponse> {
    if !config.is_configured() {
        return Ok(IceServersResponse {
            ice_servers: Vec::new(),
            ttl: 0,
        });
    }

    let ttl = if config.ttl_seconds > 0 {
        config.ttl_seconds
    } else {
        86400
    };
    let username = format!("{}:{}", now.timestamp() + ttl, user);

    let mut mac = HmacSha1::new_from_slice(config.secret.as_bytes())
        .map_err(|e| AppError::Internal(format!("TURN secret rejected: {}", e)))?;
    mac.update(username.as_bytes());
    let credential = BASE64.encode(mac.finalize().into_bytes());

    Ok(IceServersResponse {
        ice_servers: vec![IceServer {
            urls: vec![
                format!("turn:{}?transport=udp", config.host),
                format!("turn:{}?transport=tcp", config.host),
            ],
            username: Some(username),
            credential: Some(credential),
        }],
        ttl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TurnServerConfig {
        TurnServerConfig {
            host: "turn.example.com:3478".to_string(),
            secret: "north-remembers".to_string(),
            ttl_seconds: 600,
        }
    }

    #[test]
    fn test_mint_is_deterministic() {
        let now = Utc::now();
        let a = mint_ice_servers(&test_config(), "7", now).unwrap();
        let b = mint_ice_servers(&test_config(), "7", now).unwrap();
        assert_eq!(a.ice_servers[0].username, b.ice_servers[0].username);
        assert_eq!(a.ice_servers[0].credential, b.ice_servers[0].credential);
    }

    #[test]
    fn test_username_embeds_expiry_and_user() {
        let now = Utc::now();
        let response = mint_ice_servers(&test_config(), "7", now).unwrap();
        let username = response.ice_servers[0].username.clone().unwrap();
        let (expiry, user) = username.split_once(':').unwrap();
        assert_eq!(user, "7");
        assert_eq!(expiry.parse::<i64>().unwrap(), now.timestamp() + 600);
    }

    #[test]
    fn test_unconfigured_returns_empty() {
        let response =
            mint_ice_servers(&TurnServerConfig::default(), "7", Utc::now()).unwrap();
        assert!(response.ice_servers.is_empty());
    }

    #[test]
    fn test_different_users_get_different_credentials() {
        let now = Utc::now();
        let a = mint_ice_servers(&test_config(), "7", now).unwrap();
        let b = mint_ice_servers(&test_config(), "8", now).unwrap();
        assert_ne!(a.ice_servers[0].credential, b.ice_servers[0].credential);
    }
}
