use std::fmt;
use std::sync::Arc;

use axum::{extract::FromRequestParts, http::request::Parts};
use axum_extra::TypedHeader;
use headers::{authorization::Bearer, Authorization};

use crate::api::AppState;
use crate::error::ChatError;

/// The process-wide shared secret callers must present.
#[derive(Clone)]
pub struct ServiceToken(Arc<str>);

impl ServiceToken {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self(token.into())
    }

    pub fn verify(&self, presented: &str) -> Result<(), ChatError> {
        verify_token(&self.0, presented)
    }
}

impl fmt::Debug for ServiceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServiceToken(..)")
    }
}

/// Byte-for-byte comparison against the configured token.
pub fn verify_token(expected: &str, presented: &str) -> Result<(), ChatError> {
    if presented.as_bytes() != expected.as_bytes() {
        return Err(ChatError::InvalidToken);
    }
    Ok(())
}

/// Extractor that only succeeds for callers holding the service token.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedCaller;

impl FromRequestParts<AppState> for AuthenticatedCaller {
    type Rejection = ChatError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| ChatError::MissingCredentials)?;

        state.token.verify(bearer.token())?;
        Ok(AuthenticatedCaller)
    }
}
