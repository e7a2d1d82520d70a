//! CNI manifest handling.

use std::time::Duration;

use muster_common::ClusterError;
use muster_common::constants::files as layout;

use crate::kube::KubeClient;
use crate::paths::Paths;
use crate::store::files;

const FIRST_FOUND: &str = "\"first-found\"";

/// Point calico IP autodetection at `host`.
///
/// Returns false when the manifest is absent or already patched.
pub fn patch_autodetect(paths: &Paths, host: &str) -> Result<bool, ClusterError> {
    let manifest = paths.data(layout::CNI_MANIFEST);
    let Some(contents) = files::read_optional(&manifest)? else {
        return Ok(false);
    };
    if !contents.contains(FIRST_FOUND) {
        return Ok(false);
    }
    let patched = contents.replace(FIRST_FOUND, &format!("\"can-reach={host}\""));
    files::replace_with_backup(&manifest, patched)?;
    tracing::info!(host, "CNI autodetection set to reach peer");
    Ok(true)
}

/// Apply the CNI manifest once the API server answers
pub async fn apply(
    kube: &dyn KubeClient,
    paths: &Paths,
    attempts: u32,
    interval: Duration,
) -> Result<(), ClusterError> {
    let manifest = paths.data(layout::CNI_MANIFEST);
    if !manifest.exists() {
        tracing::debug!("No CNI manifest to apply");
        return Ok(());
    }

    let mut last_error = None;
    for attempt in 1..=attempts {
        if kube.api_ready().await {
            match kube.apply_manifest(&manifest).await {
                Ok(()) => {
                    tracing::info!("CNI manifest applied");
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }
        tracing::debug!(attempt, "Waiting for the API server to apply the CNI");
        tokio::time::sleep(interval).await;
    }
    Err(last_error.unwrap_or_else(|| {
        ClusterError::TransientNetwork("API server did not come up to apply the CNI".into())
    }))
}
