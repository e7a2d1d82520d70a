//! Certificate signing and generation.
//!
//! Implements:
//! - Signing CSRs with the local cluster CA
//! - CSR generation for client certificates requested from a peer
//! - Self-signed consensus store certificates for a standalone node
//! - The server certificate fingerprint printed in join strings

use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

use muster_common::ClusterError;
use muster_common::constants::files as layout;

use crate::exec::CommandRunner;
use crate::paths::Paths;
use crate::store::files;

#[async_trait]
pub trait CertificateSigner: Send + Sync {
    /// Sign `csr` (PEM) with the cluster CA, optionally overriding the subject
    async fn sign_locally(&self, csr: &str, subject: Option<&str>) -> Result<String, ClusterError>;

    /// Create a key at `key_path` and return a CSR (PEM) for `subject`
    async fn generate_csr(
        &self,
        subject: &str,
        key_path: &Path,
        with_sans: bool,
    ) -> Result<String, ClusterError>;

    /// CSR for the node's server key, used as replicated store client cert
    async fn server_csr(&self) -> Result<String, ClusterError>;

    /// Self-signed certificate pair for a standalone consensus store
    async fn generate_cluster_cert(
        &self,
        hostname: &str,
        ip: &str,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<(), ClusterError>;
}

/// [`CertificateSigner`] over openssl and the install helper scripts
pub struct OpensslSigner {
    runner: Arc<dyn CommandRunner>,
    paths: Paths,
}

impl OpensslSigner {
    pub fn new(runner: Arc<dyn CommandRunner>, paths: Paths) -> Self {
        Self { runner, paths }
    }

    fn data(&self, relative: &str) -> String {
        self.paths.data(relative).to_string_lossy().into_owned()
    }
}

#[async_trait]
impl CertificateSigner for OpensslSigner {
    async fn sign_locally(&self, csr: &str, subject: Option<&str>) -> Result<String, ClusterError> {
        let mut argv: Vec<String> = vec![
            "openssl".into(),
            "x509".into(),
            "-sha256".into(),
            "-req".into(),
            "-CA".into(),
            self.data(layout::CA_CERT),
            "-CAkey".into(),
            self.data(layout::CA_KEY),
            "-CAcreateserial".into(),
            "-days".into(),
            "3650".into(),
        ];
        if let Some(subject) = subject {
            argv.push("-subj".into());
            argv.push(subject.to_string());
        }

        let cert = self.runner.run(argv, Some(csr.as_bytes().to_vec())).await?;
        if !cert.contains("BEGIN CERTIFICATE") {
            return Err(ClusterError::ExternalCommand("openssl produced no certificate".into()));
        }
        tracing::info!(subject = ?subject, "Certificate signed");
        Ok(cert)
    }

    async fn generate_csr(
        &self,
        subject: &str,
        key_path: &Path,
        with_sans: bool,
    ) -> Result<String, ClusterError> {
        let script = if with_sans {
            "generate_csr_with_sans"
        } else {
            "generate_csr"
        };
        self.runner
            .run(
                vec![
                    self.paths.utils_script().to_string_lossy().into_owned(),
                    script.into(),
                    subject.into(),
                    key_path.to_string_lossy().into_owned(),
                ],
                None,
            )
            .await
    }

    async fn server_csr(&self) -> Result<String, ClusterError> {
        self.runner
            .run(
                vec![
                    self.paths.snap("openssl.wrapper").to_string_lossy().into_owned(),
                    "req".into(),
                    "-new".into(),
                    "-sha256".into(),
                    "-key".into(),
                    self.data(layout::SERVER_KEY),
                    "-config".into(),
                    self.data("certs/csr.conf"),
                ],
                None,
            )
            .await
    }

    async fn generate_cluster_cert(
        &self,
        hostname: &str,
        ip: &str,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<(), ClusterError> {
        let template = files::read_required(&self.paths.snap("certs/csr-dqlite.conf.template"))?;
        let conf = self.paths.data("var/tmp/csr-dqlite.conf");
        files::replace_with_backup(
            &conf,
            template.replace("HOSTNAME", hostname).replace("HOSTIP", ip),
        )?;

        self.runner
            .run(
                vec![
                    self.paths.snap("openssl.wrapper").to_string_lossy().into_owned(),
                    "req".into(),
                    "-x509".into(),
                    "-newkey".into(),
                    "rsa:4096".into(),
                    "-sha256".into(),
                    "-days".into(),
                    "3650".into(),
                    "-nodes".into(),
                    "-keyout".into(),
                    key_path.to_string_lossy().into_owned(),
                    "-out".into(),
                    cert_path.to_string_lossy().into_owned(),
                    "-subj".into(),
                    "/CN=k8s".into(),
                    "-config".into(),
                    conf.to_string_lossy().into_owned(),
                    "-extensions".into(),
                    "v3_ext".into(),
                ],
                None,
            )
            .await?;
        tracing::info!(hostname, "Generated consensus store certificate");
        Ok(())
    }
}

/// SHA-256 of the DER certificate, hex encoded
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Fingerprint of the PEM certificate at `path`
pub fn certificate_fingerprint(path: &Path) -> Result<String, ClusterError> {
    let der = CertificateDer::from_pem_file(path).map_err(|e| {
        ClusterError::LocalState(format!("cannot read certificate {}: {e}", path.display()))
    })?;
    Ok(fingerprint(der.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::RecordingRunner;

    #[tokio::test]
    async fn test_sign_locally_feeds_csr_on_stdin() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("openssl x509", "-----BEGIN CERTIFICATE-----\nMII\n-----END CERTIFICATE-----\n");
        let signer = OpensslSigner::new(runner.clone(), Paths::new("/data", "/snap"));

        let cert = signer
            .sign_locally("CSR", Some("/CN=system:node:w1/O=system:nodes"))
            .await
            .unwrap();
        assert!(cert.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(
            runner.calls()[0],
            "openssl x509 -sha256 -req -CA /data/certs/ca.crt -CAkey /data/certs/ca.key \
             -CAcreateserial -days 3650 -subj /CN=system:node:w1/O=system:nodes"
        );
        assert_eq!(runner.inputs(), vec![b"CSR".to_vec()]);
    }

    #[tokio::test]
    async fn test_sign_locally_rejects_empty_output() {
        let runner = Arc::new(RecordingRunner::new());
        let signer = OpensslSigner::new(runner, Paths::new("/data", "/snap"));
        let err = signer.sign_locally("CSR", None).await.unwrap_err();
        assert!(matches!(err, ClusterError::ExternalCommand(_)));
    }

    #[tokio::test]
    async fn test_cluster_cert_template() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("certs")).unwrap();
        std::fs::write(
            dir.path().join("certs/csr-dqlite.conf.template"),
            "CN = HOSTNAME\nIP.1 = HOSTIP\n",
        )
        .unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let signer = OpensslSigner::new(runner.clone(), Paths::new(dir.path(), dir.path()));

        signer
            .generate_cluster_cert("node-a", "127.0.0.1", Path::new("/c.crt"), Path::new("/c.key"))
            .await
            .unwrap();
        let conf = std::fs::read_to_string(dir.path().join("var/tmp/csr-dqlite.conf")).unwrap();
        assert_eq!(conf, "CN = node-a\nIP.1 = 127.0.0.1\n");
        assert!(runner.calls()[0].contains("-keyout /c.key -out /c.crt -subj /CN=k8s"));
    }

    #[test]
    fn test_fingerprint_of_pem() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.crt");
        std::fs::write(&path, generated.cert.pem()).unwrap();

        let fp = certificate_fingerprint(&path).unwrap();
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, fingerprint(generated.cert.der()));
        assert!(certificate_fingerprint(&dir.path().join("missing.crt")).is_err());
    }
}
