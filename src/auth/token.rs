use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ACCESS_TOKEN_TYPE: &str = "access";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub token_type: String,
    pub user_id: Uuid,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 signing material shared by every handler.
#[derive(Clone)]
pub struct Keys(Arc<KeysInner>);

struct KeysInner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl Keys {
    pub fn new(secret: &[u8]) -> Keys {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Keys(Arc::new(KeysInner {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }))
    }

    /// Mints an access token for `user_id`. A negative `lifetime_secs` yields an
    /// already-expired token.
    pub fn issue(
        &self,
        user_id: Uuid,
        lifetime_secs: i64,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let iat = time::OffsetDateTime::now_utc().unix_timestamp();
        let claims = Claims {
            token_type: ACCESS_TOKEN_TYPE.to_owned(),
            user_id,
            jti: Uuid::now_v7().simple().to_string(),
            iat,
            exp: iat + lifetime_secs,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.0.encoding)
    }

    pub fn decode(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        jsonwebtoken::decode::<Claims>(token, &self.0.decoding, &self.0.validation)
            .map(|data| data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_decode() {
        let keys = Keys::new(b"secret");
        let user_id = Uuid::now_v7();
        let token = keys.issue(user_id, 60).unwrap();

        let claims = keys.decode(&token).unwrap();
        assert_eq!(claims.user_id, user_id);
        assert_eq!(claims.token_type, ACCESS_TOKEN_TYPE);
        assert_eq!(claims.exp - claims.iat, 60);
    }

    #[test]
    fn expired_and_foreign_tokens_fail() {
        let keys = Keys::new(b"secret");
        let user_id = Uuid::now_v7();

        let expired = keys.issue(user_id, -120).unwrap();
        assert!(keys.decode(&expired).is_err());

        let foreign = Keys::new(b"other").issue(user_id, 60).unwrap();
        assert!(keys.decode(&foreign).is_err());

        assert!(keys.decode("not-a-jwt").is_err());
    }
}
