use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Claims carried by access tokens. Tokens are issued elsewhere; this
/// service only verifies them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid, // Subject (user ID)
    #[serde(default)]
    pub email: Option<String>,
    /// Role ids, used for action permissions and role-addressed alerts
    #[serde(default)]
    pub roles: Vec<Uuid>,
    /// Role names, used for table permissions
    #[serde(default)]
    pub role_names: Vec<String>,
    pub exp: i64, // Expiration time
    pub iat: i64, // Issued at
}

#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtKeys {
    pub fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn verify(&self, token: &str) -> Result<TokenData<Claims>, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
    }

    /// Signs a token for `user_id`; used by operator tooling and tests.
    pub fn issue(
        &self,
        user_id: Uuid,
        roles: Vec<Uuid>,
        role_names: Vec<String>,
        ttl: Duration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id,
            email: None,
            roles,
            role_names,
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
    }
}
