use std::{
    fmt,
    net::IpAddr,
};

use http::{HeaderMap, header};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};

use crate::config::IdentityConfig;

/// Who a request is attributed to: a verified principal or the caller's address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Principal(String),
    Anonymous(Option<IpAddr>),
}

impl Identity {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Principal(_))
    }

    /// Counter key used by the rate limiter. Namespaced so a username can never
    /// collide with an address.
    pub fn rate_limit_key(&self) -> String {
        match self {
            Self::Principal(name) => format!("user:{name}"),
            Self::Anonymous(Some(ip)) => format!("ip:{ip}"),
            Self::Anonymous(None) => "anonymous".to_string(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Principal(name) => f.write_str(name),
            Self::Anonymous(Some(ip)) => write!(f, "{ip}"),
            Self::Anonymous(None) => f.write_str("anonymous"),
        }
    }
}

pub struct IdentityResolver {
    key: Option<DecodingKey>,
    validation: Validation,
    principal_claim: String,
}

impl IdentityResolver {
    pub fn new(cfg: &IdentityConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        Self {
            key: cfg
                .secret
                .as_ref()
                .map(|secret| DecodingKey::from_secret(secret.as_bytes())),
            validation,
            principal_claim: cfg.principal_claim.clone(),
        }
    }

    /// Never fails: anything short of a valid, unexpired token carrying the
    /// principal claim resolves to the anonymous identity.
    pub fn resolve(&self, headers: &HeaderMap, client_ip: Option<IpAddr>) -> Identity {
        match self.principal(headers) {
            Some(name) => Identity::Principal(name),
            None => Identity::Anonymous(client_ip),
        }
    }

    fn principal(&self, headers: &HeaderMap) -> Option<String> {
        let key = self.key.as_ref()?;
        let token = bearer_token(headers)?;

        let claims = match decode::<serde_json::Value>(token, key, &self.validation) {
            Ok(data) => data.claims,
            Err(err) => {
                tracing::debug!(error = %err, "bearer token rejected; falling back to anonymous");
                return None;
            }
        };

        claims
            .get(&self.principal_claim)
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(ToString::to_string)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
