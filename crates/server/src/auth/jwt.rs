use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Credentials issued by the login service stay valid for thirty days.
pub const CREDENTIAL_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityClaims {
    user_id: Uuid,
    username: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    iat: Option<i64>,
    exp: i64,
}

/// Verified caller identity carried by a bearer credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
    pub email: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("credential has expired")]
    Expired,
    #[error("credential is invalid: {0}")]
    Invalid(#[source] jsonwebtoken::errors::Error),
    #[error("credential carries an empty username")]
    MissingUsername,
}

#[derive(Clone)]
pub struct JwtIdentityService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Issue a credential the way the login service does. The server itself
    /// only verifies; issuing is kept for tests and local tooling.
    pub fn issue_token(
        &self,
        user_id: Uuid,
        username: &str,
        email: Option<&str>,
    ) -> anyhow::Result<String> {
        self.issue_token_at(user_id, username, email, current_unix_timestamp()?)
    }

    pub(crate) fn issue_token_at(
        &self,
        user_id: Uuid,
        username: &str,
        email: Option<&str>,
        issued_at: i64,
    ) -> anyhow::Result<String> {
        let claims = IdentityClaims {
            user_id,
            username: username.to_owned(),
            email: email.map(ToOwned::to_owned),
            iat: Some(issued_at),
            exp: issued_at + CREDENTIAL_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode identity credential")
    }

    pub fn verify_credential(&self, token: &str) -> Result<Identity, IdentityError> {
        let claims = decode::<IdentityClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|error| match error.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => IdentityError::Expired,
                _ => IdentityError::Invalid(error),
            })?
            .claims;

        if claims.username.trim().is_empty() {
            return Err(IdentityError::MissingUsername);
        }

        Ok(Identity { user_id: claims.user_id, username: claims.username, email: claims.email })
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}
