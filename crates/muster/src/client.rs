//! HTTPS client for a peer's cluster agent.
//!
//! Peers present self-signed server certificates, so the chain is never
//! validated. When the join string carries a fingerprint, the SHA-256 of
//! the peer certificate must start with it before any request body is
//! sent.

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use subtle::ConstantTimeEq;

use muster_common::ClusterError;
use muster_common::api::{
    ConfigureRequest, ErrorResponse, JoinRequestV1, JoinRequestV2, JoinResponseV1, JoinResponseV2,
    SignCertRequest, SignCertResponse,
};
use muster_common::constants::{CLUSTER_API_V1, CLUSTER_API_V2};

use crate::certs::fingerprint;

/// Calls a joining node makes to the peer it joins through
#[async_trait]
pub trait PeerAgent: Send + Sync {
    /// `host:port` of the peer agent
    fn endpoint(&self) -> &str;

    async fn join_v1(&self, request: &JoinRequestV1) -> Result<JoinResponseV1, ClusterError>;

    async fn join_v2(&self, request: &JoinRequestV2) -> Result<JoinResponseV2, ClusterError>;

    /// Have the peer sign `csr` with the cluster CA
    async fn sign_cert(&self, token: &str, csr: &str) -> Result<String, ClusterError>;

    /// Push a configuration change, authenticated by the callback token in `request`
    async fn configure(&self, request: &ConfigureRequest) -> Result<(), ClusterError>;
}

/// Accepts any certificate whose fingerprint starts with the pinned prefix
#[derive(Debug)]
struct PinnedVerifier {
    fingerprint: Option<String>,
    provider: Arc<CryptoProvider>,
    mismatch: Arc<AtomicBool>,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let Some(expected) = &self.fingerprint else {
            return Ok(ServerCertVerified::assertion());
        };
        let actual = fingerprint(end_entity.as_ref());
        let matches = actual.len() >= expected.len()
            && bool::from(actual.as_bytes()[..expected.len()].ct_eq(expected.as_bytes()));
        if !matches {
            self.mismatch.store(true, Ordering::SeqCst);
            return Err(rustls::Error::General("peer certificate fingerprint mismatch".into()));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client for one peer agent (`host:port`)
#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    endpoint: String,
    mismatch: Arc<AtomicBool>,
}

impl AgentClient {
    /// `fingerprint = None` accepts any peer certificate
    pub fn new(
        endpoint: &str,
        fingerprint: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ClusterError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mismatch = Arc::new(AtomicBool::new(false));
        let verifier = PinnedVerifier {
            fingerprint: fingerprint.map(str::to_lowercase),
            provider: provider.clone(),
            mismatch: mismatch.clone(),
        };

        let tls = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ClusterError::Internal(format!("tls setup: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        let http = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .timeout(timeout)
            .build()
            .map_err(|e| ClusterError::Internal(format!("http client: {e}")))?;

        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            mismatch,
        })
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, ClusterError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("https://{}{}", self.endpoint, path);
        tracing::debug!(%url, "Calling peer agent");

        let response = self.http.post(&url).json(body).send().await.map_err(|e| {
            if self.mismatch.load(Ordering::SeqCst) {
                ClusterError::PeerVerification(format!(
                    "Could not verify the identity of {}. Use '--skip-verify' to skip server certificate check.",
                    self.endpoint
                ))
            } else {
                ClusterError::TransientNetwork(format!(
                    "Please ensure the node {} is reachable. {e}",
                    self.endpoint
                ))
            }
        })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let text = response.text().await.unwrap_or_default();
            return Err(peer_error(status.as_u16(), &text));
        }

        response.json::<Resp>().await.map_err(|e| {
            ClusterError::Compatibility(format!(
                "unexpected response from {}: {e}. Make sure both nodes run compatible versions.",
                self.endpoint
            ))
        })
    }
}

/// Error for a non-200 peer reply, keeping the class the peer reported
fn peer_error(status: u16, body: &str) -> ClusterError {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(err) => ClusterError::from_kind(
            err.kind.as_deref(),
            format!("Connection failed. {} ({status})", err.error),
        ),
        Err(_) => ClusterError::Authentication(format!("Connection failed. ({status})")),
    }
}

#[async_trait]
impl PeerAgent for AgentClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn join_v1(&self, request: &JoinRequestV1) -> Result<JoinResponseV1, ClusterError> {
        self.post(&format!("{CLUSTER_API_V1}/join"), request).await
    }

    async fn join_v2(&self, request: &JoinRequestV2) -> Result<JoinResponseV2, ClusterError> {
        self.post(&format!("{CLUSTER_API_V2}/join"), request).await
    }

    async fn sign_cert(&self, token: &str, csr: &str) -> Result<String, ClusterError> {
        let request = SignCertRequest {
            token: token.to_string(),
            request: csr.to_string(),
        };
        let response: SignCertResponse = self
            .post(&format!("{CLUSTER_API_V1}/sign-cert"), &request)
            .await?;
        Ok(response.certificate)
    }

    async fn configure(&self, request: &ConfigureRequest) -> Result<(), ClusterError> {
        let _: serde_json::Value = self
            .post(&format!("{CLUSTER_API_V1}/configure"), request)
            .await?;
        Ok(())
    }
}
