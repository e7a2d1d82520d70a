//! File-backed credential store.
//!
//! Holds bootstrap (join) tokens, certificate request tokens, callback
//! tokens and node identity tokens. All mutation happens under one
//! mutex and goes through the backup-then-replace helper, so a token can
//! be validated and consumed as a single step.

use rand::Rng;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use subtle::ConstantTimeEq;

use muster_common::constants::{files as layout, CALLBACK_TOKEN_LEN, KUBELET_TOKEN_LEN, TOKEN_MIN_LEN};
use muster_common::{ClusterError, TokenEntry, address_host};

use super::files;
use crate::paths::Paths;

const CALLBACK_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Token files with single-use semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Join tokens issued by `add-token`
    Bootstrap,
    /// Tokens authorising one `/sign-cert` call
    CertificateRequest,
}

/// Token and user of one `known_tokens.csv` row (`token,user,uid,"groups"`)
#[derive(Debug, Clone, PartialEq, Eq)]
struct KnownToken {
    token: String,
    user: String,
}

impl KnownToken {
    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim().splitn(3, ',');
        let token = parts.next()?.to_string();
        let user = parts.next()?.to_string();
        (!token.is_empty()).then_some(Self { token, user })
    }
}

/// Credential store rooted at the node data directory
#[derive(Debug)]
pub struct CredentialStore {
    paths: Paths,
    lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, ClusterError> {
        self.lock
            .lock()
            .map_err(|_| ClusterError::Internal("credential store lock poisoned".into()))
    }

    fn token_file(&self, kind: TokenKind) -> PathBuf {
        match kind {
            TokenKind::Bootstrap => self.paths.data(layout::CLUSTER_TOKENS),
            TokenKind::CertificateRequest => self.paths.data(layout::CERT_REQUEST_TOKENS),
        }
    }

    fn read_entries(&self, kind: TokenKind) -> Result<Vec<TokenEntry>, ClusterError> {
        let contents = files::read_optional(&self.token_file(kind))?.unwrap_or_default();
        Ok(contents.lines().filter_map(TokenEntry::parse).collect())
    }

    fn write_entries(&self, kind: TokenKind, entries: &[TokenEntry]) -> Result<(), ClusterError> {
        let contents: String = entries.iter().map(|e| format!("{e}\n")).collect();
        files::replace_with_backup(&self.token_file(kind), contents)
    }

    // === Bootstrap tokens ===

    /// Issue a join token.
    ///
    /// `ttl = None` issues a single-use token without expiry. A caller
    /// supplied token must be at least 32 characters.
    pub fn issue_bootstrap_token(
        &self,
        ttl: Option<Duration>,
        token: Option<String>,
    ) -> Result<String, ClusterError> {
        let token = match token {
            Some(token) => {
                let token = token.trim().to_string();
                if token.len() < TOKEN_MIN_LEN || token.contains(['|', '\n']) {
                    return Err(ClusterError::InvalidInput(format!(
                        "token must be at least {TOKEN_MIN_LEN} characters long"
                    )));
                }
                token
            }
            None => generate_hex_token(),
        };

        let expiry = ttl.map(|ttl| chrono::Utc::now().timestamp() + ttl.as_secs() as i64);

        let _guard = self.guard()?;
        let now = chrono::Utc::now().timestamp();
        let mut entries = self.read_entries(TokenKind::Bootstrap)?;
        entries.retain(|e| !e.is_expired_at(now));
        entries.push(TokenEntry::new(token.clone(), expiry));
        self.write_entries(TokenKind::Bootstrap, &entries)?;

        tracing::info!(expiry = ?expiry, "Bootstrap token issued");
        Ok(token)
    }

    /// Validate a token and, if valid, remove it in the same critical section
    pub fn validate_and_consume(&self, kind: TokenKind, token: &str) -> Result<bool, ClusterError> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(false);
        }

        let _guard = self.guard()?;
        let now = chrono::Utc::now().timestamp();
        let entries = self.read_entries(kind)?;

        let valid = entries
            .iter()
            .any(|e| tokens_match(&e.token, token) && !e.is_expired_at(now));
        if !valid {
            return Ok(false);
        }

        let remaining: Vec<TokenEntry> = entries
            .into_iter()
            .filter(|e| !tokens_match(&e.token, token))
            .collect();
        self.write_entries(kind, &remaining)?;
        Ok(true)
    }

    /// Non-consuming validity check
    pub fn is_valid(&self, kind: TokenKind, token: &str) -> Result<bool, ClusterError> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(false);
        }
        let _guard = self.guard()?;
        let now = chrono::Utc::now().timestamp();
        Ok(self
            .read_entries(kind)?
            .iter()
            .any(|e| tokens_match(&e.token, token) && !e.is_expired_at(now)))
    }

    /// Drop expired join tokens. Returns how many were removed.
    pub fn remove_expired(&self) -> Result<usize, ClusterError> {
        let _guard = self.guard()?;
        let now = chrono::Utc::now().timestamp();
        let entries = self.read_entries(TokenKind::Bootstrap)?;
        let before = entries.len();
        let kept: Vec<TokenEntry> = entries.into_iter().filter(|e| !e.is_expired_at(now)).collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.write_entries(TokenKind::Bootstrap, &kept)?;
            tracing::info!(removed, "Expired bootstrap tokens removed");
        }
        Ok(removed)
    }

    /// Register a single-use token for `/sign-cert`
    pub fn add_certificate_request_token(&self, token: &str) -> Result<(), ClusterError> {
        let _guard = self.guard()?;
        let mut entries = self.read_entries(TokenKind::CertificateRequest)?;
        entries.push(TokenEntry::new(token.trim(), None));
        self.write_entries(TokenKind::CertificateRequest, &entries)
    }

    // === Callback tokens ===

    /// This node's callback token, created on first use
    pub fn get_or_create_self_callback_token(&self) -> Result<String, ClusterError> {
        let _guard = self.guard()?;
        self.self_callback_token_locked()
    }

    fn self_callback_token_locked(&self) -> Result<String, ClusterError> {
        let path = self.paths.data(layout::CALLBACK_TOKEN);
        if let Some(existing) = files::read_optional(&path)? {
            let existing = existing.trim();
            if !existing.is_empty() {
                return Ok(existing.to_string());
            }
        }
        let token = generate_callback_token();
        files::replace_with_backup(&path, format!("{token}\n"))?;
        Ok(token)
    }

    /// Replace this node's callback token (cluster-wide token received at join)
    pub fn store_self_callback_token(&self, token: &str) -> Result<(), ClusterError> {
        let _guard = self.guard()?;
        files::replace_with_backup(&self.paths.data(layout::CALLBACK_TOKEN), format!("{}\n", token.trim()))
    }

    pub fn remove_self_callback_token(&self) -> Result<(), ClusterError> {
        let _guard = self.guard()?;
        files::remove_if_exists(&self.paths.data(layout::CALLBACK_TOKEN)).map(|_| ())
    }

    /// Check a token presented to a callback-authenticated endpoint
    pub fn is_valid_self_callback_token(&self, token: &str) -> Result<bool, ClusterError> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(false);
        }
        let _guard = self.guard()?;
        let stored = files::read_optional(&self.paths.data(layout::CALLBACK_TOKEN))?.unwrap_or_default();
        let stored = stored.trim();
        Ok(!stored.is_empty() && tokens_match(stored, token))
    }

    fn read_peer_tokens(&self) -> Result<Vec<(String, String)>, ClusterError> {
        let contents = files::read_optional(&self.paths.data(layout::CALLBACK_TOKENS))?.unwrap_or_default();
        Ok(contents
            .lines()
            .filter_map(|line| {
                let (endpoint, token) = line.trim().split_once(' ')?;
                Some((endpoint.to_string(), token.trim().to_string()))
            })
            .collect())
    }

    fn write_peer_tokens(&self, peers: &[(String, String)]) -> Result<(), ClusterError> {
        let contents: String = peers
            .iter()
            .map(|(endpoint, token)| format!("{endpoint} {token}\n"))
            .collect();
        files::replace_with_backup(&self.paths.data(layout::CALLBACK_TOKENS), contents)
    }

    /// Record the token used to call back into `endpoint` (`host:port`)
    pub fn store_peer_callback_token(&self, endpoint: &str, token: &str) -> Result<(), ClusterError> {
        let _guard = self.guard()?;
        let mut peers = self.read_peer_tokens()?;
        peers.retain(|(existing, _)| existing != endpoint);
        peers.push((endpoint.to_string(), token.trim().to_string()));
        self.write_peer_tokens(&peers)
    }

    /// Token for calling `endpoint`; records the cluster callback token if none is stored
    pub fn get_or_create_callback_token(&self, endpoint: &str) -> Result<String, ClusterError> {
        let _guard = self.guard()?;
        let mut peers = self.read_peer_tokens()?;
        if let Some((_, token)) = peers.iter().find(|(existing, _)| existing == endpoint) {
            return Ok(token.clone());
        }
        let token = self.self_callback_token_locked()?;
        peers.push((endpoint.to_string(), token.clone()));
        self.write_peer_tokens(&peers)?;
        Ok(token)
    }

    /// Forget every callback endpoint on host `node`
    pub fn remove_callback_token(&self, node: &str) -> Result<bool, ClusterError> {
        let _guard = self.guard()?;
        let peers = self.read_peer_tokens()?;
        let before = peers.len();
        let kept: Vec<_> = peers
            .into_iter()
            .filter(|(endpoint, _)| address_host(endpoint) != node)
            .collect();
        if kept.len() == before {
            return Ok(false);
        }
        self.write_peer_tokens(&kept)?;
        Ok(true)
    }

    /// All known `(endpoint, token)` pairs
    pub fn peer_callback_tokens(&self) -> Result<Vec<(String, String)>, ClusterError> {
        let _guard = self.guard()?;
        self.read_peer_tokens()
    }

    // === Identity tokens (known_tokens.csv) ===

    fn read_known_tokens(&self) -> Result<Vec<String>, ClusterError> {
        let contents = files::read_optional(&self.paths.data(layout::KNOWN_TOKENS))?.unwrap_or_default();
        Ok(contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    fn write_known_tokens(&self, lines: &[String]) -> Result<(), ClusterError> {
        let contents: String = lines.iter().map(|l| format!("{l}\n")).collect();
        files::replace_with_backup(&self.paths.data(layout::KNOWN_TOKENS), contents)
    }

    /// Token of `user`, if one is registered
    pub fn get_known_token(&self, user: &str) -> Result<Option<String>, ClusterError> {
        let _guard = self.guard()?;
        Ok(self
            .read_known_tokens()?
            .iter()
            .filter_map(|line| KnownToken::parse(line))
            .find(|t| t.user == user)
            .map(|t| t.token))
    }

    /// Kubelet token for `hostname`, created if missing
    pub fn get_or_create_kubelet_token(&self, hostname: &str) -> Result<String, ClusterError> {
        let user = kubelet_user(hostname);
        let _guard = self.guard()?;
        let mut lines = self.read_known_tokens()?;
        if let Some(existing) = lines
            .iter()
            .filter_map(|line| KnownToken::parse(line))
            .find(|t| t.user == user)
        {
            return Ok(existing.token);
        }

        let mut rng = rand::rng();
        let token: String = (&mut rng)
            .sample_iter(rand::distr::Alphanumeric)
            .take(KUBELET_TOKEN_LEN)
            .map(char::from)
            .collect();
        let uid: u32 = rng.random_range(10_000_000..100_000_000);
        lines.push(format!("{token},{user},kubelet-{uid},\"system:nodes\""));
        self.write_known_tokens(&lines)?;
        Ok(token)
    }

    /// Revoke the kubelet token of `hostname`
    pub fn remove_kubelet_token(&self, hostname: &str) -> Result<bool, ClusterError> {
        let user = kubelet_user(hostname);
        let _guard = self.guard()?;
        let lines = self.read_known_tokens()?;
        let before = lines.len();
        let kept: Vec<String> = lines
            .into_iter()
            .filter(|line| KnownToken::parse(line).is_none_or(|t| t.user != user))
            .collect();
        if kept.len() == before {
            return Ok(false);
        }
        self.write_known_tokens(&kept)?;
        Ok(true)
    }

    /// Install the cluster admin token, replacing any local one
    pub fn replace_admin_token(&self, token: &str) -> Result<(), ClusterError> {
        let _guard = self.guard()?;
        let mut lines: Vec<String> = self
            .read_known_tokens()?
            .into_iter()
            .filter(|line| KnownToken::parse(line).is_none_or(|t| t.user != "admin"))
            .collect();
        lines.push(format!("{},admin,admin,\"system:masters\"", token.trim()));
        self.write_known_tokens(&lines)
    }
}

fn kubelet_user(hostname: &str) -> String {
    format!("system:node:{}", hostname.to_lowercase())
}

fn tokens_match(stored: &str, presented: &str) -> bool {
    stored.len() == presented.len() && bool::from(stored.as_bytes().ct_eq(presented.as_bytes()))
}

/// 16 random bytes, hex encoded
pub fn generate_hex_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

fn generate_callback_token() -> String {
    let mut rng = rand::rng();
    (0..CALLBACK_TOKEN_LEN)
        .map(|_| CALLBACK_CHARSET[rng.random_range(0..CALLBACK_CHARSET.len())] as char)
        .collect()
}
