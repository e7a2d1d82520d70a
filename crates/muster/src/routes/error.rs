//! Error responses and request extractors shared by the handlers.

use axum::{
    Json,
    body::Bytes,
    extract::{ConnectInfo, FromRequest, FromRequestParts, Request},
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::net::SocketAddr;

use muster_common::api::ErrorResponse;
use muster_common::{ClusterError, address_host};

/// A [`ClusterError`] rendered as `{"error": ...}`
#[derive(Debug)]
pub struct ApiError(pub ClusterError);

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        tracing::warn!(kind = self.0.kind(), status = status.as_u16(), error = %self.0, "Request failed");
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                kind: Some(self.0.kind().to_string()),
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// JSON body extractor.
///
/// Unlike `axum::Json` it does not require a content type, and a
/// malformed body is answered with the usual error shape.
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| ClusterError::InvalidInput(e.body_text()))?;
        serde_json::from_slice(&bytes)
            .map(JsonBody)
            .map_err(|e| ApiError(ClusterError::InvalidInput(format!("invalid request body: {e}"))))
    }
}

/// Where a request came from
#[derive(Debug, Clone, Default)]
pub struct RequestOrigin {
    /// Peer socket address, when served with connect info
    pub remote_ip: String,
    /// Host part of the `Host` header the caller used to reach us
    pub host: String,
}

impl<S> FromRequestParts<S> for RequestOrigin
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let remote_ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_canonical().to_string())
            .unwrap_or_default();
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(|h| address_host(h).to_string())
            .unwrap_or_default();
        Ok(Self { remote_ip, host })
    }
}
