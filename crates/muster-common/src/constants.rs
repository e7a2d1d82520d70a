//! Shared constants for Muster components.

/// Default cluster agent port
pub const DEFAULT_AGENT_PORT: u16 = 25000;

/// Default cluster agent listen address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:25000";

/// Default per-request timeout for the agent (4 minutes)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 240;

/// Legacy (replicated store) API prefix
pub const CLUSTER_API_V1: &str = "/cluster/api/v1.0";

/// Consensus store API prefix
pub const CLUSTER_API_V2: &str = "/cluster/api/v2.0";

/// Minimum length of a bootstrap token
pub const TOKEN_MIN_LEN: usize = 32;

/// Minimum length of an abbreviated certificate fingerprint
pub const FINGERPRINT_MIN_LEN: usize = 12;

/// Length of a callback token
pub const CALLBACK_TOKEN_LEN: usize = 64;

/// Length of a kubelet identity token
pub const KUBELET_TOKEN_LEN: usize = 32;

/// Default consensus store port
pub const DEFAULT_CONSENSUS_PORT: u16 = 19001;

/// Default kube-apiserver secure port
pub const DEFAULT_APISERVER_PORT: &str = "16443";

/// Suffix appended to a worker join token for the kubelet certificate request
pub const KUBELET_CERT_TOKEN_SUFFIX: &str = "-kubelet";

/// Suffix appended to a worker join token for the kube-proxy certificate request
pub const PROXY_CERT_TOKEN_SUFFIX: &str = "-proxy";

/// Node labels applied to worker kubelets
pub const WORKER_NODE_LABELS: &str =
    "microk8s.io/cluster=true,node.kubernetes.io/microk8s-worker=microk8s-worker";

/// Upgrade scripts under the install root, `<name>/<phase>-node.sh`
pub const UPGRADE_SCRIPTS: &str = "upgrade-scripts";

/// Files under the node data directory
pub mod files {
    pub const CLUSTER_TOKENS: &str = "credentials/cluster-tokens.txt";
    pub const CERT_REQUEST_TOKENS: &str = "credentials/certs-request-tokens.txt";
    pub const CALLBACK_TOKEN: &str = "credentials/callback-token.txt";
    pub const CALLBACK_TOKENS: &str = "credentials/callback-tokens.txt";
    pub const KNOWN_TOKENS: &str = "credentials/known_tokens.csv";
    pub const CLIENT_CONFIG: &str = "credentials/client.config";
    pub const PROXY_CONFIG: &str = "credentials/proxy.config";
    pub const KUBELET_CONFIG: &str = "credentials/kubelet.config";

    pub const CA_CERT: &str = "certs/ca.crt";
    pub const CA_KEY: &str = "certs/ca.key";
    pub const REMOTE_CA_CERT: &str = "certs/ca.remote.crt";
    pub const SERVICE_ACCOUNT_KEY: &str = "certs/serviceaccount.key";
    pub const SERVER_CERT: &str = "certs/server.crt";
    pub const SERVER_KEY: &str = "certs/server.key";
    /// Replicated store client certificate signed by a legacy control plane
    pub const REMOTE_SERVER_CERT: &str = "certs/server.remote.crt";
    pub const REMOTE_ETCD_CA: &str = "certs/remote-etcd-ca.crt";
    pub const REMOTE_ETCD_CERT: &str = "certs/remote-etcd.crt";
    pub const REMOTE_ETCD_KEY: &str = "certs/remote-etcd.key";

    pub const CNI_MANIFEST: &str = "args/cni-network/cni.yaml";
    pub const PROXY_PROVIDER_TEMPLATE: &str = "args/traefik/provider-template.yaml";
    pub const PROXY_PROVIDER: &str = "args/traefik/provider.yaml";

    /// Consensus store working directory
    pub const BACKEND_DIR: &str = "var/kubernetes/backend";
    /// Previous consensus store directory, kept across a join
    pub const BACKEND_BACKUP_DIR: &str = "var/kubernetes/backend.backup";
}

/// Lock files under `var/lock`
pub mod locks {
    /// Node runs the consensus store
    pub const HA_CLUSTER: &str = "ha-cluster";
    /// Node joined a cluster as a non control plane member
    pub const CLUSTERED: &str = "clustered.lock";
    /// Local consensus store must not run
    pub const NO_CONSENSUS_STORE: &str = "no-k8s-dqlite";
    /// Local API reverse proxy must not run
    pub const NO_APISERVER_PROXY: &str = "no-apiserver-proxy";
    /// Certificates must not be regenerated on address changes
    pub const NO_CERT_REISSUE: &str = "no-cert-reissue";
    pub const JOIN_IN_PROGRESS: &str = "join-in-progress";
    /// Control plane services run inside kubelite
    pub const KUBELITE: &str = "lite.lock";
    pub const LOW_MEMORY_GUARD: &str = "low-memory-guard.lock";
}

/// Argument names read from service argument files
pub mod args {
    pub const SECURE_PORT: &str = "--secure-port";
    pub const AUTHORIZATION_MODE: &str = "--authorization-mode";
    pub const TOKEN_AUTH_FILE: &str = "--token-auth-file";
    pub const ETCD_SERVERS: &str = "--etcd-servers";
    pub const ETCD_CAFILE: &str = "--etcd-cafile";
    pub const ETCD_CERTFILE: &str = "--etcd-certfile";
    pub const ETCD_KEYFILE: &str = "--etcd-keyfile";
    pub const CLUSTER_CIDR: &str = "--cluster-cidr";
    pub const HOSTNAME_OVERRIDE: &str = "--hostname-override";
    pub const NODE_IP: &str = "--node-ip";
    pub const BIND: &str = "--bind";
    pub const NODE_LABELS: &str = "--node-labels";
    pub const CLIENT_CA_FILE: &str = "--client-ca-file";
    pub const MASTER: &str = "--master";
    pub const ETCD_ENDPOINTS: &str = "--etcd-endpoints";
}
