use axum::{
    extract::{FromRequest, Request},
    Json,
};
use serde::de::DeserializeOwned;

use crate::error::ChatError;

/// `Json` whose rejections all surface as `422 Unprocessable Entity`.
#[derive(Debug, Clone)]
pub struct ChatJson<T>(pub T);

impl<S, T> FromRequest<S> for ChatJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ChatError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ChatError::validation(rejection.body_text()))?;
        Ok(Self(value))
    }
}
