//! Joining a cluster through a peer agent.
//!
//! The legacy path joins a node running the replicated store as a
//! worker. The consensus path joins as a worker (client certificates
//! signed by the peer, API reached through the local proxy) or as a
//! control plane node (shared CA, new consensus store member).

use serde_yaml::{Mapping, Value};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use muster_common::api::{JoinRequestV1, JoinRequestV2, JoinResponseV1, JoinResponseV2};
use muster_common::constants::{
    KUBELET_CERT_TOKEN_SUFFIX, PROXY_CERT_TOKEN_SUFFIX, WORKER_NODE_LABELS, args as arg,
    files as layout, locks,
};
use muster_common::{ClusterError, ClusterMode, ConnectionString, join_host_port};

use crate::client::PeerAgent;
use crate::cni;
use crate::kubeconfig::{self, ClientAuth};
use crate::membership::wait_for_members;
use crate::network::local_hostname;
use crate::state::AppState;

const LOOPBACK: &str = "127.0.0.1";

/// Parsed `join` invocation
#[derive(Debug, Clone)]
pub struct JoinOptions {
    pub connection: ConnectionString,
    /// Join without running the control plane
    pub worker: bool,
    pub disable_low_memory_guard: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPhase {
    Idle,
    ContactingPeer,
    AwaitingMaterial,
    InstallingCertificates,
    ReconfiguringLocalServices,
    JoiningConsensus,
    Done,
    Failed,
}

impl fmt::Display for JoinPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::ContactingPeer => "contacting-peer",
            Self::AwaitingMaterial => "awaiting-material",
            Self::InstallingCertificates => "installing-certificates",
            Self::ReconfiguringLocalServices => "reconfiguring-local-services",
            Self::JoiningConsensus => "joining-consensus",
            Self::Done => "done",
            Self::Failed => "failed",
        })
    }
}

/// Join the cluster `peer` belongs to and return the phases passed through.
///
/// `join-in-progress` exists for the whole run and is removed whatever
/// the outcome.
pub async fn join(
    node: &AppState,
    peer: &dyn PeerAgent,
    options: &JoinOptions,
) -> Result<Vec<JoinPhase>, ClusterError> {
    let mode = node.mode();
    if mode.is_worker() {
        return Err(ClusterError::LocalState(format!(
            "This node is already a {mode} member of a cluster. Run leave first."
        )));
    }
    if mode.is_consensus() && !options.worker {
        guard_low_memory(node, options)?;
    }

    let mut run = Join {
        node,
        peer,
        options,
        hostname: local_hostname()?,
        master_ip: options.connection.host.to_string(),
        phases: vec![JoinPhase::Idle],
    };

    node.locks.create(locks::JOIN_IN_PROGRESS)?;
    let result = match mode {
        ClusterMode::Single => run.legacy().await,
        _ => run.consensus().await,
    };
    if let Err(e) = node.locks.remove(locks::JOIN_IN_PROGRESS) {
        tracing::warn!(error = %e, "Could not clear the join lock");
    }

    match result {
        Ok(()) => {
            run.enter(JoinPhase::Done);
            tracing::info!(peer = %peer.endpoint(), worker = options.worker, "✅ Joined the cluster");
            Ok(run.phases)
        }
        Err(e) => {
            let phase = run.current();
            run.enter(JoinPhase::Failed);
            tracing::error!(%phase, error = %e, "Join failed");
            Err(e)
        }
    }
}

fn guard_low_memory(node: &AppState, options: &JoinOptions) -> Result<(), ClusterError> {
    if !node.locks.has(locks::LOW_MEMORY_GUARD) {
        return Ok(());
    }
    if options.disable_low_memory_guard {
        node.locks.remove(locks::LOW_MEMORY_GUARD)?;
        tracing::info!("Low memory guard disabled");
        return Ok(());
    }
    Err(ClusterError::LocalState(
        "This node does not have enough memory to run the control plane. \
         Join as a worker with --worker, or pass --disable-low-memory-guard."
            .into(),
    ))
}

struct Join<'a> {
    node: &'a AppState,
    peer: &'a dyn PeerAgent,
    options: &'a JoinOptions,
    hostname: String,
    master_ip: String,
    phases: Vec<JoinPhase>,
}

impl Join<'_> {
    fn enter(&mut self, phase: JoinPhase) {
        tracing::info!(%phase, peer = %self.peer.endpoint(), "Join phase");
        self.phases.push(phase);
    }

    fn current(&self) -> JoinPhase {
        self.phases.last().copied().unwrap_or(JoinPhase::Idle)
    }

    fn token(&self) -> &str {
        &self.options.connection.token
    }

    /// Worker join against a node running the replicated store
    async fn legacy(&mut self) -> Result<(), ClusterError> {
        let node = self.node;
        self.enter(JoinPhase::ContactingPeer);
        let callback = node.credentials.get_or_create_self_callback_token()?;
        let request = JoinRequestV1 {
            token: self.token().to_string(),
            hostname: self.hostname.clone(),
            port: node.agent_port()?,
            callback: Some(callback),
            can_handle_x509_auth: true,
        };

        self.enter(JoinPhase::AwaitingMaterial);
        let info: JoinResponseV1 = self.peer.join_v1(&request).await?;
        let token_auth = match info.api_authn_mode.as_deref().unwrap_or("Token") {
            "Token" => true,
            "Cert" => false,
            other => {
                return Err(ClusterError::Compatibility(format!(
                    "The cluster uses an unsupported authentication mode ({other}). \
                     Upgrade this node to a newer version."
                )));
            }
        };

        self.enter(JoinPhase::InstallingCertificates);
        node.write_data(layout::REMOTE_CA_CERT, &info.ca)?;
        let store_csr = node.signer.server_csr().await?;
        let store_cert = self.peer.sign_cert(self.token(), &store_csr).await?;
        node.write_data(layout::REMOTE_SERVER_CERT, &store_cert)?;

        let server = join_host_port(&self.master_ip, &info.apiport);
        let ca = node.paths.data(layout::REMOTE_CA_CERT);
        if token_auth {
            self.write_kubeconfig(layout::PROXY_CONFIG, "kubeproxy", &server, &ca, ClientAuth::Token(&info.kubeproxy))?;
            self.write_kubeconfig(layout::KUBELET_CONFIG, "kubelet", &server, &ca, ClientAuth::Token(&info.kubelet))?;
        } else {
            let (cert, key) = self
                .request_client_cert(&self.kubelet_subject(), "kubelet", true, &info.kubelet)
                .await?;
            self.write_kubeconfig(layout::KUBELET_CONFIG, "kubelet", &server, &ca, ClientAuth::Certificate { cert: &cert, key: &key })?;
            let (cert, key) = self
                .request_client_cert("/CN=system:kube-proxy", "proxy", false, &info.kubeproxy)
                .await?;
            self.write_kubeconfig(layout::PROXY_CONFIG, "kubeproxy", &server, &ca, ClientAuth::Certificate { cert: &cert, key: &key })?;
        }

        self.enter(JoinPhase::ReconfiguringLocalServices);
        self.align_cidr(info.cluster_cidr.as_deref())?;
        self.store_kubelet_args(&info.kubelet_args, &info.hostname_override, true)?;

        let mut proxy_updates = Vec::new();
        if !info.hostname_override.is_empty() {
            proxy_updates.push((arg::HOSTNAME_OVERRIDE.to_string(), info.hostname_override.clone()));
        }
        node.args
            .update("kube-proxy", &proxy_updates, &[arg::MASTER.to_string()])?;

        let endpoints = info.etcd.replace("0.0.0.0", &self.master_ip);
        node.args.update(
            "flanneld",
            &[
                (arg::ETCD_ENDPOINTS.to_string(), endpoints),
                (arg::ETCD_CAFILE.to_string(), in_snap_data(layout::REMOTE_CA_CERT)),
                (arg::ETCD_CERTFILE.to_string(), in_snap_data(layout::REMOTE_SERVER_CERT)),
                (arg::ETCD_KEYFILE.to_string(), in_snap_data(layout::SERVER_KEY)),
            ],
            &[],
        )?;

        node.locks.mark_worker()?;
        node.locks.create(locks::NO_CERT_REISSUE)?;
        node.services.stop("etcd").await?;
        node.services
            .restart_each(&["flanneld", "kubelet", "kube-proxy"])
            .await
    }

    async fn consensus(&mut self) -> Result<(), ClusterError> {
        self.enter(JoinPhase::ContactingPeer);
        let request = JoinRequestV2 {
            token: self.token().to_string(),
            hostname: self.hostname.clone(),
            port: self.node.agent_port()?,
            worker: self.options.worker,
            can_handle_x509_auth: true,
            can_handle_custom_etcd: true,
        };

        self.enter(JoinPhase::AwaitingMaterial);
        let info = self.peer.join_v2(&request).await?;
        if self.options.worker {
            self.worker(&info).await
        } else {
            self.control_plane(&info).await
        }
    }

    async fn worker(&mut self, info: &JoinResponseV2) -> Result<(), ClusterError> {
        // Only responders that understand worker joins withhold the CA key
        if info.ca_key.is_some() {
            return Err(ClusterError::Compatibility(
                "The cluster does not support worker joins. Upgrade the control plane nodes first."
                    .into(),
            ));
        }
        let node = self.node;

        self.enter(JoinPhase::InstallingCertificates);
        node.write_data(layout::REMOTE_CA_CERT, &info.ca)?;
        let kubelet_token = format!("{}{KUBELET_CERT_TOKEN_SUFFIX}", self.token());
        let (kubelet_cert, kubelet_key) = self
            .request_client_cert(&self.kubelet_subject(), "kubelet", true, &kubelet_token)
            .await?;
        let proxy_token = format!("{}{PROXY_CERT_TOKEN_SUFFIX}", self.token());
        let (proxy_cert, proxy_key) = self
            .request_client_cert("/CN=system:kube-proxy", "proxy", false, &proxy_token)
            .await?;

        // Workers reach the API servers through the local proxy
        let server = join_host_port(LOOPBACK, &info.apiport);
        let ca = node.paths.data(layout::REMOTE_CA_CERT);
        self.write_kubeconfig(
            layout::KUBELET_CONFIG,
            "kubelet",
            &server,
            &ca,
            ClientAuth::Certificate { cert: &kubelet_cert, key: &kubelet_key },
        )?;
        self.write_kubeconfig(
            layout::PROXY_CONFIG,
            "kubeproxy",
            &server,
            &ca,
            ClientAuth::Certificate { cert: &proxy_cert, key: &proxy_key },
        )?;

        self.enter(JoinPhase::ReconfiguringLocalServices);
        self.apply_apiserver_args(info.api_authz_mode.as_deref(), &info.apiport)?;
        self.align_cidr(info.cluster_cidr.as_deref())?;
        self.store_kubelet_args(&info.kubelet_args, &info.hostname_override, true)?;
        self.store_callback_tokens(&info.callback_token)?;
        self.write_proxy_provider(&info.control_plane_nodes, &info.apiport)?;

        node.locks.remove(locks::NO_APISERVER_PROXY)?;
        node.locks.mark_worker()?;
        node.locks.create(locks::NO_CERT_REISSUE)?;
        node.services.stop("k8s-dqlite").await?;
        node.services
            .restart_each(&["kubelet", "kube-proxy", "kube-apiserver", "apiserver-proxy"])
            .await
    }

    async fn control_plane(&mut self, info: &JoinResponseV2) -> Result<(), ClusterError> {
        let Some(ca_key) = info.ca_key.as_deref() else {
            return Err(ClusterError::Compatibility(
                "The cluster did not hand out its CA key. Join with --worker instead.".into(),
            ));
        };
        let node = self.node;

        self.enter(JoinPhase::InstallingCertificates);
        node.write_data(layout::CA_CERT, &info.ca)?;
        node.write_data(layout::CA_KEY, ca_key)?;
        node.write_data(layout::SERVICE_ACCOUNT_KEY, &info.service_account_key)?;
        if let Some(admin) = info.admin_token.as_deref() {
            node.credentials.replace_admin_token(admin)?;
            let server = join_host_port(LOOPBACK, &info.apiport);
            let ca = node.paths.data(layout::CA_CERT);
            self.write_kubeconfig(layout::CLIENT_CONFIG, "admin", &server, &ca, ClientAuth::Token(admin))?;
        }

        self.enter(JoinPhase::ReconfiguringLocalServices);
        self.apply_apiserver_args(info.api_authz_mode.as_deref(), &info.apiport)?;
        self.align_cidr(info.cluster_cidr.as_deref())?;
        self.store_kubelet_args(&info.kubelet_args, &info.hostname_override, false)?;
        self.store_callback_tokens(&info.callback_token)?;

        match info.etcd_servers.as_deref() {
            Some(servers) => self.use_external_datastore(servers, info).await?,
            None => {
                self.enter(JoinPhase::JoiningConsensus);
                self.join_consensus(info).await?;
            }
        }

        cni::patch_autodetect(&node.paths, &self.master_ip)?;
        node.locks.create(locks::NO_CERT_REISSUE)
    }

    /// Point the API server at the cluster's own datastore
    async fn use_external_datastore(
        &self,
        servers: &str,
        info: &JoinResponseV2,
    ) -> Result<(), ClusterError> {
        let node = self.node;
        let mut updates = vec![(arg::ETCD_SERVERS.to_string(), servers.to_string())];
        for (pem, file, flag) in [
            (&info.etcd_ca, layout::REMOTE_ETCD_CA, arg::ETCD_CAFILE),
            (&info.etcd_cert, layout::REMOTE_ETCD_CERT, arg::ETCD_CERTFILE),
            (&info.etcd_key, layout::REMOTE_ETCD_KEY, arg::ETCD_KEYFILE),
        ] {
            if let Some(pem) = pem {
                node.write_data(file, pem)?;
                updates.push((flag.to_string(), in_snap_data(file)));
            }
        }
        node.args.update("kube-apiserver", &updates, &[])?;
        node.locks.create(locks::NO_CONSENSUS_STORE)?;
        tracing::info!(servers, "Using the cluster's external datastore");

        node.services.stop("k8s-dqlite").await?;
        node.services.restart("kube-apiserver").await
    }

    /// Restart the local consensus store as a new member of the cluster's
    async fn join_consensus(&self, info: &JoinResponseV2) -> Result<(), ClusterError> {
        let (Some(cert), Some(key)) = (info.cluster_cert.as_deref(), info.cluster_key.as_deref())
        else {
            return Err(ClusterError::Compatibility(
                "The cluster did not hand out the consensus store certificate.".into(),
            ));
        };
        let host = info
            .hostname_override
            .trim_start_matches('[')
            .trim_end_matches(']');
        if host.is_empty() {
            return Err(ClusterError::Compatibility(
                "The cluster did not report the address of this node.".into(),
            ));
        }

        let node = self.node;
        let retry = &node.config.retry;
        node.services.stop("kube-apiserver").await?;
        node.services.stop("k8s-dqlite").await?;
        tokio::time::sleep(retry.service_settle()).await;

        node.consensus.move_to_backup()?;
        node.consensus.store_cluster_certs(cert, key)?;
        let address = join_host_port(host, node.consensus.backup_port()?);
        node.consensus.write_init(&info.voters, &address)?;
        node.services.start("k8s-dqlite").await?;

        wait_for_members(
            node.membership.as_ref(),
            retry.consensus_wait_attempts,
            retry.consensus_wait_interval(),
            retry.consensus_error_interval(),
            |members| members.iter().any(|m| m.host() == host),
        )
        .await?;
        tracing::info!(%address, voters = info.voters.len(), "Consensus store joined");

        node.services.start("kube-apiserver").await
    }

    fn kubelet_subject(&self) -> String {
        format!("/CN=system:node:{}/O=system:nodes", self.hostname)
    }

    /// Create a key and have the peer sign a client certificate for it
    async fn request_client_cert(
        &self,
        subject: &str,
        name: &str,
        with_sans: bool,
        token: &str,
    ) -> Result<(PathBuf, PathBuf), ClusterError> {
        let node = self.node;
        let key = node.paths.data(&format!("certs/{name}.key"));
        let cert_file = format!("certs/{name}.crt");
        let csr = node.signer.generate_csr(subject, &key, with_sans).await?;
        let cert = self.peer.sign_cert(token, &csr).await?;
        node.write_data(&cert_file, &cert)?;
        tracing::debug!(subject, "Client certificate signed by peer");
        Ok((node.paths.data(&cert_file), key))
    }

    fn write_kubeconfig(
        &self,
        file: &str,
        user: &str,
        server: &str,
        ca: &Path,
        auth: ClientAuth<'_>,
    ) -> Result<(), ClusterError> {
        let rendered = kubeconfig::render(user, server, ca, auth)?;
        self.node.write_data(file, &rendered)
    }

    fn apply_apiserver_args(&self, authz_mode: Option<&str>, apiport: &str) -> Result<(), ClusterError> {
        let mut updates = Vec::new();
        if !apiport.is_empty() {
            updates.push((arg::SECURE_PORT.to_string(), apiport.to_string()));
        }
        if let Some(mode) = authz_mode {
            updates.push((arg::AUTHORIZATION_MODE.to_string(), mode.to_string()));
        }
        if updates.is_empty() {
            return Ok(());
        }
        self.node.args.update("kube-apiserver", &updates, &[])
    }

    /// Adopt the cluster's pod CIDR when it differs from ours
    fn align_cidr(&self, cluster_cidr: Option<&str>) -> Result<(), ClusterError> {
        let Some(cluster) = cluster_cidr.filter(|c| !c.is_empty()) else {
            return Ok(());
        };
        let local = self.node.args.get("kube-proxy", arg::CLUSTER_CIDR)?;
        if local.as_deref() == Some(cluster) {
            return Ok(());
        }
        tracing::warn!(
            local = local.as_deref().unwrap_or("unset"),
            cluster,
            "Pod CIDR differs from the cluster's, adopting the cluster's"
        );
        self.node.args.set("kube-proxy", arg::CLUSTER_CIDR, Some(cluster))
    }

    /// Install the kubelet arguments handed out by the peer
    fn store_kubelet_args(
        &self,
        kubelet_args: &str,
        hostname_override: &str,
        worker: bool,
    ) -> Result<(), ClusterError> {
        let args = &self.node.args;
        args.replace_all("kubelet", kubelet_args)?;
        match hostname_override.parse::<IpAddr>() {
            Ok(ip) => args.set("kubelet", arg::NODE_IP, Some(&ip.to_string()))?,
            // The peer's own address is meaningless here
            Err(_) => args.set("kubelet", arg::NODE_IP, None)?,
        }
        if worker {
            args.update(
                "kubelet",
                &[
                    (arg::CLIENT_CA_FILE.to_string(), in_snap_data(layout::REMOTE_CA_CERT)),
                    (arg::NODE_LABELS.to_string(), WORKER_NODE_LABELS.to_string()),
                ],
                &[],
            )?;
        }
        Ok(())
    }

    /// The cluster shares one callback token; keep it for us and the peer
    fn store_callback_tokens(&self, token: &str) -> Result<(), ClusterError> {
        let credentials = &self.node.credentials;
        credentials.store_self_callback_token(token)?;
        credentials.store_peer_callback_token(self.peer.endpoint(), token)
    }

    /// Render the API reverse proxy backends from the template
    fn write_proxy_provider(&self, control_plane: &[String], apiport: &str) -> Result<(), ClusterError> {
        let hosts: Vec<&str> = if control_plane.is_empty() {
            vec![self.master_ip.as_str()]
        } else {
            control_plane.iter().map(String::as_str).collect()
        };
        let servers = hosts
            .iter()
            .map(|host| {
                let mut server = Mapping::new();
                server.insert(
                    Value::String("address".into()),
                    Value::String(join_host_port(host, apiport)),
                );
                Value::Mapping(server)
            })
            .collect();

        let template = self.node.read_data(layout::PROXY_PROVIDER_TEMPLATE)?;
        let mut provider: Value = serde_yaml::from_str(&template)
            .map_err(|e| ClusterError::LocalState(format!("invalid proxy provider template: {e}")))?;
        let mut slot = &mut provider;
        for key in ["tcp", "services", "kube-apiserver", "loadBalancer", "servers"] {
            slot = child(slot, key)?;
        }
        *slot = Value::Sequence(servers);

        let rendered = serde_yaml::to_string(&provider)
            .map_err(|e| ClusterError::Internal(format!("proxy provider: {e}")))?;
        self.node.write_data(layout::PROXY_PROVIDER, &rendered)?;
        tracing::info!(backends = hosts.len(), "API proxy backends written");
        Ok(())
    }
}

/// Mapping entry `key` of `value`, created when missing
fn child<'v>(value: &'v mut Value, key: &str) -> Result<&'v mut Value, ClusterError> {
    if value.is_null() {
        *value = Value::Mapping(Mapping::new());
    }
    let map = value.as_mapping_mut().ok_or_else(|| {
        ClusterError::LocalState(format!("proxy provider template: parent of {key} is not a mapping"))
    })?;
    Ok(map
        .entry(Value::String(key.to_string()))
        .or_insert(Value::Null))
}

/// Argument value referring to a file under the data root
fn in_snap_data(relative: &str) -> String {
    format!("${{SNAP_DATA}}/{relative}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::FakePeer;
    use crate::state::testing::TestNode;
    use muster_common::NodeRole::Voter;

    const TOKEN: &str = "abcdef0123456789abcdef0123456789";

    fn options(worker: bool) -> JoinOptions {
        JoinOptions {
            connection: format!("10.0.0.9:25000/{TOKEN}").parse().unwrap(),
            worker,
            disable_low_memory_guard: false,
        }
    }

    fn callback() -> String {
        "CALLBACK".repeat(8)
    }

    fn worker_response() -> JoinResponseV2 {
        JoinResponseV2 {
            ca: "REMOTE CA\n".into(),
            callback_token: callback(),
            apiport: "16443".into(),
            kubelet_args: "--kubeconfig=${SNAP_DATA}/credentials/kubelet.config\n--node-ip=10.0.0.9\n".into(),
            hostname_override: "10.0.0.1".into(),
            control_plane_nodes: vec!["10.0.0.9".into(), "10.0.0.10".into()],
            cluster_cidr: Some("10.1.0.0/16".into()),
            api_authz_mode: Some("RBAC,Node".into()),
            ..Default::default()
        }
    }

    fn control_plane_response() -> JoinResponseV2 {
        JoinResponseV2 {
            ca_key: Some("REMOTE CA KEY\n".into()),
            service_account_key: "REMOTE SA KEY\n".into(),
            admin_token: Some("remoteadmin".into()),
            cluster_cert: Some("REMOTE CLUSTER CERT\n".into()),
            cluster_key: Some("REMOTE CLUSTER KEY\n".into()),
            voters: vec!["10.0.0.9:19001".into()],
            control_plane_nodes: Vec::new(),
            ..worker_response()
        }
    }

    fn legacy_response(authn: &str) -> JoinResponseV1 {
        JoinResponseV1 {
            ca: "LEGACY CA\n".into(),
            etcd: "https://0.0.0.0:12379".into(),
            apiport: "16443".into(),
            kubeproxy: "req-proxy".into(),
            kubelet: "req-kubelet".into(),
            kubelet_args: "--kubeconfig=${SNAP_DATA}/credentials/kubelet.config\n".into(),
            hostname_override: "10.0.0.1".into(),
            cluster_cidr: Some("10.2.0.0/16".into()),
            api_authn_mode: Some(authn.into()),
        }
    }

    #[tokio::test]
    async fn test_worker_join_refuses_control_plane_material() {
        let node = TestNode::new();
        let peer = FakePeer::v2(control_plane_response());

        let err = join(&node.state, &peer, &options(true)).await.unwrap_err();
        assert!(matches!(err, ClusterError::Compatibility(_)));
        assert!(peer.v2_requests.lock().unwrap()[0].worker);

        // Nothing on disk changed
        assert!(!node.exists(layout::REMOTE_CA_CERT));
        assert_eq!(node.read(layout::CA_KEY), "CA KEY\n");
        assert!(peer.signed().is_empty());
        assert!(node.runner.calls_matching("snapctl").is_empty());
        assert!(!node.state.locks.has(locks::JOIN_IN_PROGRESS));
        assert_eq!(node.state.mode(), ClusterMode::ConsensusControlPlane);
    }

    #[tokio::test]
    async fn test_worker_join() {
        let node = TestNode::new();
        let peer = FakePeer::v2(worker_response());

        let phases = join(&node.state, &peer, &options(true)).await.unwrap();
        assert_eq!(
            phases,
            vec![
                JoinPhase::Idle,
                JoinPhase::ContactingPeer,
                JoinPhase::AwaitingMaterial,
                JoinPhase::InstallingCertificates,
                JoinPhase::ReconfiguringLocalServices,
                JoinPhase::Done,
            ]
        );

        let request = peer.v2_requests.lock().unwrap()[0].clone();
        assert_eq!(request.token, TOKEN);
        assert_eq!(request.port, "25000");
        assert!(request.can_handle_x509_auth && request.can_handle_custom_etcd);

        let tokens: Vec<String> = peer.signed().into_iter().map(|(token, _)| token).collect();
        assert_eq!(tokens, vec![format!("{TOKEN}-kubelet"), format!("{TOKEN}-proxy")]);
        assert_eq!(node.read(layout::REMOTE_CA_CERT), "REMOTE CA\n");
        assert!(node.read("certs/kubelet.crt").contains(&format!("{TOKEN}-kubelet")));

        let kubeconfig = node.read(layout::KUBELET_CONFIG);
        assert!(kubeconfig.contains("server: https://127.0.0.1:16443"));
        assert!(kubeconfig.contains("client-certificate"));

        let kubelet = node.read("args/kubelet");
        assert!(kubelet.contains("--node-ip=10.0.0.1\n"));
        assert!(kubelet.contains(&format!("--node-labels={WORKER_NODE_LABELS}")));
        assert!(kubelet.contains("--client-ca-file=${SNAP_DATA}/certs/ca.remote.crt"));

        let provider = node.read(layout::PROXY_PROVIDER);
        assert!(provider.contains("address: 10.0.0.9:16443"));
        assert!(provider.contains("address: 10.0.0.10:16443"));

        assert_eq!(node.state.mode(), ClusterMode::ConsensusWorker);
        assert!(node.state.locks.has(locks::NO_CERT_REISSUE));
        assert!(!node.state.locks.has(locks::JOIN_IN_PROGRESS));
        assert!(node.state.credentials.is_valid_self_callback_token(&callback()).unwrap());
        assert_eq!(
            node.state.credentials.peer_callback_tokens().unwrap(),
            vec![("10.0.0.9:25000".to_string(), callback())]
        );
    }

    #[tokio::test]
    async fn test_worker_join_then_leave_restores_standalone_files() {
        let node = TestNode::new();
        node.write(layout::KUBELET_CONFIG, "standalone kubelet\n");
        node.write(layout::PROXY_CONFIG, "standalone proxy\n");
        node.state.locks.create(locks::NO_APISERVER_PROXY).unwrap();

        let held = || {
            [
                locks::HA_CLUSTER,
                locks::CLUSTERED,
                locks::NO_CONSENSUS_STORE,
                locks::NO_APISERVER_PROXY,
                locks::NO_CERT_REISSUE,
                locks::JOIN_IN_PROGRESS,
            ]
            .into_iter()
            .filter(|lock| node.state.locks.has(lock))
            .collect::<Vec<_>>()
        };
        let locks_before = held();
        let apiserver_before = node.read("args/kube-apiserver");

        join(&node.state, &FakePeer::v2(worker_response()), &options(true))
            .await
            .unwrap();
        assert_ne!(node.read(layout::KUBELET_CONFIG), "standalone kubelet\n");
        crate::cluster::leave(&node.state).await.unwrap();

        assert_eq!(held(), locks_before);
        assert_eq!(node.state.mode(), ClusterMode::ConsensusControlPlane);
        assert_eq!(node.read(layout::KUBELET_CONFIG), "standalone kubelet\n");
        assert_eq!(node.read(layout::PROXY_CONFIG), "standalone proxy\n");
        for service in ["kubelet", "kube-proxy"] {
            let defaults =
                std::fs::read_to_string(node.state.paths.default_args(service)).unwrap();
            assert_eq!(node.read(&format!("args/{service}")), defaults);
        }
        assert_eq!(node.read("args/kube-apiserver"), apiserver_before);
    }

    #[tokio::test]
    async fn test_control_plane_join_enters_consensus() {
        let node = TestNode::new();
        node.membership.set(&[("10.0.0.9:19001", Voter), ("10.0.0.1:19001", Voter)]);
        let peer = FakePeer::v2(control_plane_response());

        let phases = join(&node.state, &peer, &options(false)).await.unwrap();
        assert!(phases.contains(&JoinPhase::JoiningConsensus));
        assert!(!peer.v2_requests.lock().unwrap()[0].worker);

        assert_eq!(node.read(layout::CA_KEY), "REMOTE CA KEY\n");
        assert_eq!(node.read(layout::SERVICE_ACCOUNT_KEY), "REMOTE SA KEY\n");
        assert_eq!(
            node.state.credentials.get_known_token("admin").unwrap().as_deref(),
            Some("remoteadmin")
        );

        let init = node.read("var/kubernetes/backend/init.yaml");
        assert!(init.contains("- 10.0.0.9:19001"));
        assert!(init.contains("Address: 10.0.0.1:19001"));
        assert_eq!(node.read("var/kubernetes/backend/cluster.crt"), "REMOTE CLUSTER CERT\n");
        assert_eq!(
            node.read("var/kubernetes/backend.backup/cluster.crt"),
            "LOCAL CLUSTER CERT\n"
        );

        assert_eq!(
            node.runner.calls_matching("snapctl st"),
            vec![
                "snapctl stop microk8s.daemon-apiserver",
                "snapctl stop microk8s.daemon-k8s-dqlite",
                "snapctl start microk8s.daemon-k8s-dqlite",
                "snapctl start microk8s.daemon-apiserver",
            ]
        );
        assert!(node.read(layout::CNI_MANIFEST).contains("can-reach=10.0.0.9"));
        assert!(node.kube.applied().is_empty());
        assert_eq!(node.state.mode(), ClusterMode::ConsensusControlPlane);
        assert!(node.state.locks.has(locks::NO_CERT_REISSUE));
    }

    #[tokio::test]
    async fn test_control_plane_join_gives_up_when_store_never_converges() {
        let node = TestNode::new();
        node.membership.set(&[("10.0.0.9:19001", Voter)]);
        let peer = FakePeer::v2(control_plane_response());

        let err = join(&node.state, &peer, &options(false)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(node.runner.calls_matching("start microk8s.daemon-apiserver").is_empty());
        assert!(!node.state.locks.has(locks::JOIN_IN_PROGRESS));
    }

    #[tokio::test]
    async fn test_control_plane_join_with_external_datastore() {
        let node = TestNode::new();
        let peer = FakePeer::v2(JoinResponseV2 {
            etcd_servers: Some("https://10.0.0.50:2379".into()),
            etcd_ca: Some("ETCD CA\n".into()),
            cluster_cert: None,
            cluster_key: None,
            ..control_plane_response()
        });

        let phases = join(&node.state, &peer, &options(false)).await.unwrap();
        assert!(!phases.contains(&JoinPhase::JoiningConsensus));
        assert_eq!(node.read(layout::REMOTE_ETCD_CA), "ETCD CA\n");
        assert!(!node.exists(layout::REMOTE_ETCD_KEY));
        let apiserver = node.read("args/kube-apiserver");
        assert!(apiserver.contains("--etcd-servers=https://10.0.0.50:2379\n"));
        assert!(apiserver.contains("--etcd-cafile=${SNAP_DATA}/certs/remote-etcd-ca.crt\n"));
        assert!(node.state.locks.has(locks::NO_CONSENSUS_STORE));
        assert!(!node.exists("var/kubernetes/backend/init.yaml"));
    }

    #[tokio::test]
    async fn test_low_memory_guard() {
        let node = TestNode::new();
        node.state.locks.create(locks::LOW_MEMORY_GUARD).unwrap();
        node.membership.set(&[("10.0.0.1:19001", Voter)]);
        let peer = FakePeer::v2(control_plane_response());

        let err = join(&node.state, &peer, &options(false)).await.unwrap_err();
        assert!(matches!(err, ClusterError::LocalState(_)));
        assert!(peer.v2_requests.lock().unwrap().is_empty());

        let mut forced = options(false);
        forced.disable_low_memory_guard = true;
        join(&node.state, &peer, &forced).await.unwrap();
        assert!(!node.state.locks.has(locks::LOW_MEMORY_GUARD));
    }

    #[tokio::test]
    async fn test_workers_must_leave_first() {
        let node = TestNode::new();
        node.state.locks.mark_worker().unwrap();
        let peer = FakePeer::v2(worker_response());

        let err = join(&node.state, &peer, &options(true)).await.unwrap_err();
        assert!(matches!(err, ClusterError::LocalState(_)));
        assert!(peer.v2_requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_peer_refusal_clears_join_lock() {
        let node = TestNode::new();
        let peer = FakePeer::failing(ClusterError::Authentication("Invalid token".into()));

        let err = join(&node.state, &peer, &options(true)).await.unwrap_err();
        assert!(matches!(err, ClusterError::Authentication(_)));
        assert!(!node.state.locks.has(locks::JOIN_IN_PROGRESS));
        assert_eq!(node.state.mode(), ClusterMode::ConsensusControlPlane);
    }

    #[tokio::test]
    async fn test_legacy_join_with_tokens() {
        let node = TestNode::new();
        node.state.locks.remove(locks::HA_CLUSTER).unwrap();
        let peer = FakePeer::v1(JoinResponseV1 {
            kubeproxy: "proxytoken".into(),
            kubelet: "kubelettoken".into(),
            ..legacy_response("Token")
        });

        join(&node.state, &peer, &options(true)).await.unwrap();

        let request = peer.v1_requests.lock().unwrap()[0].clone();
        let own_callback = node.state.credentials.get_or_create_self_callback_token().unwrap();
        assert_eq!(request.callback, Some(own_callback));
        assert!(request.can_handle_x509_auth);

        // Only the store client certificate is requested, with the join token
        let signed = peer.signed();
        assert_eq!(signed.len(), 1);
        assert_eq!(signed[0].0, TOKEN);
        assert!(node.exists(layout::REMOTE_SERVER_CERT));

        let proxy = node.read(layout::PROXY_CONFIG);
        assert!(proxy.contains("token: proxytoken"));
        assert!(proxy.contains("server: https://10.0.0.9:16443"));

        assert!(node.read("args/flanneld").contains("--etcd-endpoints=https://10.0.0.9:12379\n"));
        assert_eq!(
            node.state.args.get("kube-proxy", arg::CLUSTER_CIDR).unwrap().as_deref(),
            Some("10.2.0.0/16")
        );
        assert_eq!(
            node.state.args.get("kube-proxy", arg::HOSTNAME_OVERRIDE).unwrap().as_deref(),
            Some("10.0.0.1")
        );
        assert_eq!(node.state.mode(), ClusterMode::LegacyReplicated);
        assert_eq!(node.runner.calls_matching("snapctl stop"), vec!["snapctl stop microk8s.daemon-etcd"]);
    }

    #[tokio::test]
    async fn test_legacy_join_with_certificates() {
        let node = TestNode::new();
        node.state.locks.remove(locks::HA_CLUSTER).unwrap();
        let peer = FakePeer::v1(legacy_response("Cert"));

        join(&node.state, &peer, &options(true)).await.unwrap();
        let tokens: Vec<String> = peer.signed().into_iter().map(|(token, _)| token).collect();
        assert_eq!(tokens, vec![TOKEN, "req-kubelet", "req-proxy"]);
        assert!(node.read(layout::PROXY_CONFIG).contains("client-key"));
    }

    #[tokio::test]
    async fn test_legacy_join_rejects_unknown_auth_mode() {
        let node = TestNode::new();
        node.state.locks.remove(locks::HA_CLUSTER).unwrap();
        let peer = FakePeer::v1(legacy_response("Webhook"));

        let err = join(&node.state, &peer, &options(true)).await.unwrap_err();
        assert!(matches!(err, ClusterError::Compatibility(_)));
        assert!(!node.exists(layout::REMOTE_CA_CERT));
        assert_eq!(node.state.mode(), ClusterMode::Single);
    }
}
