use async_trait::async_trait;
use base64::Engine;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("token resolution timed out")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Mobile,
    Web,
    Dashboard,
}

impl Role {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "web" => Role::Web,
            "dashboard" => Role::Dashboard,
            _ => Role::Mobile,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Mobile => "mobile",
            Role::Web => "web",
            Role::Dashboard => "dashboard",
        }
    }

    /// Web and dashboard sockets join the presence broadcast set instead of
    /// the mobile presence lifecycle.
    pub fn is_dashboard(&self) -> bool {
        matches!(self, Role::Web | Role::Dashboard)
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedUser {
    pub user_id: String,
    pub role: Role,
}

/// What a token carries once opened: either an opaque string or a claims map.
#[derive(Debug, Clone)]
pub enum TokenPayload {
    Raw(String),
    Claims(Map<String, Value>),
}

/// Claim names observed carrying the user id, in priority order.
const USER_ID_CLAIMS: [&str; 6] = ["uid", "user_id", "userId", "sub", "id", "TELENET_userId"];

/// Total extractor over a token payload. Returns `None` only when neither
/// the raw form nor any known claim yields a usable id.
pub fn extract_user_id(payload: &TokenPayload) -> Option<String> {
    match payload {
        TokenPayload::Raw(raw) => {
            let trimmed = raw.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        TokenPayload::Claims(claims) => USER_ID_CLAIMS.iter().find_map(|key| {
            match claims.get(*key) {
                Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            }
        }),
    }
}

fn extract_role(payload: &TokenPayload) -> Role {
    match payload {
        TokenPayload::Claims(claims) => claims
            .get("role")
            .and_then(Value::as_str)
            .map(Role::parse)
            .unwrap_or(Role::Mobile),
        TokenPayload::Raw(_) => Role::Mobile,
    }
}

/// Best-effort open of a three-segment JWT-like token without verification.
/// Anything that does not parse collapses to the raw token string.
pub fn decode_unverified(token: &str) -> TokenPayload {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() == 3 {
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(segments[1])
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok());
        match decoded {
            Some(Value::Object(claims)) => return TokenPayload::Claims(claims),
            Some(Value::String(raw)) => return TokenPayload::Raw(raw),
            _ => {}
        }
    }
    TokenPayload::Raw(token.to_string())
}

/// Resolves a pre-issued bearer token into a user identity.
#[async_trait]
pub trait UserResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<ResolvedUser, AuthError>;
}

/// The built-in resolver: HS256 verification when authentication is on,
/// tolerant decode when it is off.
pub struct TokenResolver {
    use_authentication: bool,
    secret: String,
}

impl TokenResolver {
    pub fn new(use_authentication: bool, secret: impl Into<String>) -> Self {
        Self {
            use_authentication,
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl UserResolver for TokenResolver {
    async fn resolve(&self, token: &str) -> Result<ResolvedUser, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::MissingToken);
        }
        let payload = if self.use_authentication {
            let mut validation = Validation::new(Algorithm::HS256);
            // Tokens in the field omit exp; signature validity is the contract.
            validation.validate_exp = false;
            validation.required_spec_claims = Default::default();
            let data = decode::<Map<String, Value>>(
                token,
                &DecodingKey::from_secret(self.secret.as_bytes()),
                &validation,
            )
            .map_err(|_| AuthError::InvalidToken)?;
            TokenPayload::Claims(data.claims)
        } else {
            decode_unverified(token)
        };

        let user_id = match extract_user_id(&payload) {
            Some(user_id) => user_id,
            // Tolerant mode falls back to the opaque token as the id;
            // verified mode does not.
            None if !self.use_authentication => token.to_string(),
            None => return Err(AuthError::InvalidToken),
        };
        Ok(ResolvedUser {
            user_id,
            role: extract_role(&payload),
        })
    }
}
