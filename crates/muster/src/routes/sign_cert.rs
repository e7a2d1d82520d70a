//! Certificate signing for joining nodes.

use axum::{Json, extract::State};

use muster_common::ClusterError;
use muster_common::api::{SignCertRequest, SignCertResponse};

use super::error::{ApiResult, JsonBody};
use crate::state::AppState;
use crate::store::TokenKind;

/// Sign a CSR; each certificate request token authorises one signature
pub async fn sign_cert(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<SignCertRequest>,
) -> ApiResult<SignCertResponse> {
    if !state
        .credentials
        .validate_and_consume(TokenKind::CertificateRequest, &request.token)?
    {
        return Err(ClusterError::Authentication("Invalid certificate request token".into()).into());
    }
    let certificate = state.signer.sign_locally(&request.request, None).await?;
    Ok(Json(SignCertResponse { certificate }))
}
