//! API-key gate for every route except `/health`.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use crate::api::correlation_id_from;
use crate::error::ApiError;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Configured keys. An empty set disables the check.
#[derive(Clone, Default)]
pub struct ApiKeys(Arc<Vec<SecretString>>);

impl ApiKeys {
    pub fn new(keys: Vec<SecretString>) -> Self {
        Self(Arc::new(keys))
    }

    pub fn is_enabled(&self) -> bool {
        !self.0.is_empty()
    }

    /// Compares against every key so timing does not reveal which one matched.
    pub fn accepts(&self, candidate: &str) -> bool {
        self.0.iter().fold(false, |matched, key| {
            let equal: bool = key.expose_secret().as_bytes().ct_eq(candidate.as_bytes()).into();
            matched | equal
        })
    }
}

pub async fn require_api_key(State(keys): State<ApiKeys>, request: Request, next: Next) -> Response {
    if !keys.is_enabled() {
        return next.run(request).await;
    }

    let presented = request.headers().get(API_KEY_HEADER).and_then(|value| value.to_str().ok());
    match presented {
        Some(candidate) if keys.accepts(candidate) => next.run(request).await,
        _ => {
            let correlation_id = correlation_id_from(request.headers());
            ApiError::unauthorized(&correlation_id).into_response()
        }
    }
}
