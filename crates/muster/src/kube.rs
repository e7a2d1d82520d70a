//! Kubernetes API access through the kubectl wrapper.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use muster_common::ClusterError;

use crate::exec::CommandRunner;
use crate::paths::Paths;

/// A Kubernetes node object, reduced to what membership needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub internal_ip: Option<String>,
}

#[async_trait]
pub trait KubeClient: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError>;

    async fn delete_node(&self, name: &str) -> Result<(), ClusterError>;

    async fn apply_manifest(&self, path: &Path) -> Result<(), ClusterError>;

    /// True once the API server answers for the default service
    async fn api_ready(&self) -> bool;

    /// `get all --all-namespaces` as JSON
    async fn overview(&self) -> Result<Value, ClusterError>;

    /// Find a node by name or InternalIP
    async fn find_node(&self, name_or_ip: &str) -> Result<Option<NodeInfo>, ClusterError> {
        Ok(self
            .list_nodes()
            .await?
            .into_iter()
            .find(|n| n.name == name_or_ip || n.internal_ip.as_deref() == Some(name_or_ip)))
    }
}

#[derive(Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<NodeObject>,
}

#[derive(Deserialize)]
struct NodeObject {
    metadata: NodeMetadata,
    #[serde(default)]
    status: NodeStatus,
}

#[derive(Deserialize)]
struct NodeMetadata {
    name: String,
}

#[derive(Deserialize, Default)]
struct NodeStatus {
    #[serde(default)]
    addresses: Vec<NodeAddress>,
}

#[derive(Deserialize)]
struct NodeAddress {
    #[serde(rename = "type")]
    kind: String,
    address: String,
}

/// Parse `kubectl get no -o json`
fn parse_nodes(json: &str) -> Result<Vec<NodeInfo>, ClusterError> {
    let list: NodeList = serde_json::from_str(json)
        .map_err(|e| ClusterError::ExternalCommand(format!("unexpected node list: {e}")))?;
    Ok(list
        .items
        .into_iter()
        .map(|node| NodeInfo {
            internal_ip: node
                .status
                .addresses
                .into_iter()
                .find(|a| a.kind == "InternalIP")
                .map(|a| a.address),
            name: node.metadata.name,
        })
        .collect())
}

/// [`KubeClient`] backed by `microk8s-kubectl.wrapper`
pub struct Kubectl {
    runner: Arc<dyn CommandRunner>,
    paths: Paths,
}

impl Kubectl {
    pub fn new(runner: Arc<dyn CommandRunner>, paths: Paths) -> Self {
        Self { runner, paths }
    }

    async fn kubectl(&self, args: &[&str]) -> Result<String, ClusterError> {
        let mut argv = vec![self.paths.kubectl().to_string_lossy().into_owned()];
        argv.extend(args.iter().map(|a| a.to_string()));
        self.runner.run(argv, None).await
    }
}

#[async_trait]
impl KubeClient for Kubectl {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        let out = self.kubectl(&["get", "no", "-o", "json"]).await?;
        parse_nodes(&out)
    }

    async fn delete_node(&self, name: &str) -> Result<(), ClusterError> {
        self.kubectl(&["delete", "no", name]).await?;
        tracing::info!(node = name, "Node object deleted");
        Ok(())
    }

    async fn apply_manifest(&self, path: &Path) -> Result<(), ClusterError> {
        let path = path.to_string_lossy();
        self.kubectl(&["apply", "-f", path.as_ref()]).await?;
        Ok(())
    }

    async fn api_ready(&self) -> bool {
        self.kubectl(&["get", "service/kubernetes"]).await.is_ok()
    }

    async fn overview(&self) -> Result<Value, ClusterError> {
        let out = self
            .kubectl(&["get", "all", "--all-namespaces", "-o", "json"])
            .await?;
        serde_json::from_str(&out)
            .map_err(|e| ClusterError::ExternalCommand(format!("unexpected overview output: {e}")))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// In-memory node list
    #[derive(Default)]
    pub struct FakeKube {
        pub nodes: Mutex<Vec<NodeInfo>>,
        pub deleted: Mutex<Vec<String>>,
        pub applied: Mutex<Vec<PathBuf>>,
        pub not_ready: std::sync::atomic::AtomicBool,
    }

    impl FakeKube {
        pub fn with_nodes(nodes: &[(&str, &str)]) -> Self {
            let fake = Self::default();
            *fake.nodes.lock().unwrap() = nodes
                .iter()
                .map(|(name, ip)| NodeInfo {
                    name: name.to_string(),
                    internal_ip: Some(ip.to_string()),
                })
                .collect();
            fake
        }

        pub fn deleted(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }

        pub fn applied(&self) -> Vec<PathBuf> {
            self.applied.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl KubeClient for FakeKube {
        async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
            Ok(self.nodes.lock().unwrap().clone())
        }

        async fn delete_node(&self, name: &str) -> Result<(), ClusterError> {
            self.nodes.lock().unwrap().retain(|n| n.name != name);
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn apply_manifest(&self, path: &Path) -> Result<(), ClusterError> {
            self.applied.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        async fn api_ready(&self) -> bool {
            !self.not_ready.load(std::sync::atomic::Ordering::SeqCst)
        }

        async fn overview(&self) -> Result<Value, ClusterError> {
            Ok(serde_json::json!({ "items": [] }))
        }
    }
}
