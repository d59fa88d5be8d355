//! Token validation for the session endpoints
//!
//! The hub accepts two kinds of subjects: the appliance itself (`sub = "rpi"`)
//! and numeric user ids issued to mobile clients. Password verification and
//! the login flow live outside this crate; here we only mint and check the
//! JWTs that ride the WebSocket connect URLs.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::JwtConfig;
use crate::error::{AppError, Result};

/// Appliance-wide token subject
pub const APPLIANCE_SUBJECT: &str = "rpi";

/// JWT claims carried by access and refresh tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
}

/// Decoded token subject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    /// The appliance session (`sub = "rpi"`)
    Appliance,
    /// A mobile/user session
    User(i64),
}

impl Subject {
    pub fn parse(sub: &str) -> Result<Self> {
        if sub == APPLIANCE_SUBJECT {
            return Ok(Self::Appliance);
        }
        sub.parse::<i64>()
            .map(Self::User)
            .map_err(|_| AppError::Auth(format!("unrecognized token subject '{}'", sub)))
    }

    /// User the subject acts on behalf of; the appliance maps to the
    /// configured owner
    pub fn user_id(&self, owner_user_id: i64) -> i64 {
        match self {
            Self::Appliance => owner_user_id,
            Self::User(id) => *id,
        }
    }

    pub fn is_appliance(&self) -> bool {
        matches!(self, Self::Appliance)
    }
}

/// Issues and validates access/refresh JWTs from the configured keys
#[derive(Clone)]
pub struct TokenService {
    algorithm: Algorithm,
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    access_expires_seconds: i64,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    refresh_expires_seconds: i64,
}

impl TokenService {
    pub fn new(config: &JwtConfig) -> Result<Self> {
        let algorithm = config
            .algorithm
            .parse::<Algorithm>()
            .map_err(|_| AppError::Config(format!("unknown JWT algorithm '{}'", config.algorithm)))?;

        Ok(Self {
            algorithm,
            access_encoding: EncodingKey::from_secret(config.access.key.as_bytes()),
            access_decoding: DecodingKey::from_secret(config.access.key.as_bytes()),
            access_expires_seconds: config.access.expires_seconds,
            refresh_encoding: EncodingKey::from_secret(config.refresh.key.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(config.refresh.key.as_bytes()),
            refresh_expires_seconds: config.refresh.expires_seconds,
        })
    }

    /// Issue an access/refresh pair for a subject
    pub fn issue(&self, sub: &str) -> Result<(String, String)> {
        Ok((self.issue_access(sub)?, self.issue_refresh(sub)?))
    }

    pub fn issue_access(&self, sub: &str) -> Result<String> {
        self.encode(sub, self.access_expires_seconds, &self.access_encoding)
    }

    pub fn issue_refresh(&self, sub: &str) -> Result<String> {
        self.encode(sub, self.refresh_expires_seconds, &self.refresh_encoding)
    }

    fn encode(&self, sub: &str, expires_seconds: i64, key: &EncodingKey) -> Result<String> {
        let claims = Claims {
            sub: sub.to_string(),
            exp: Utc::now().timestamp() + expires_seconds,
        };
        jsonwebtoken::encode(&Header::new(self.algorithm), &claims, key)
            .map_err(|e| AppError::Internal(format!("token encode failed: {}", e)))
    }

    /// Validate an access token and return its subject
    pub fn verify_access(&self, token: &str) -> Result<Subject> {
        self.decode(token, &self.access_decoding)
    }

    /// Validate a refresh token and return its subject
    pub fn verify_refresh(&self, token: &str) -> Result<Subject> {
        self.decode(token, &self.refresh_decoding)
    }

    fn decode(&self, token: &str, key: &DecodingKey) -> Result<Subject> {
        let validation = Validation::new(self.algorithm);
        let data = jsonwebtoken::decode::<Claims>(token, key, &validation)
            .map_err(|e| AppError::Auth(e.to_string()))?;
        Subject::parse(&data.claims.sub)
    }
}
