use async_trait::async_trait;
use tracing::error;

use crate::upstream::{
    ClusterServiceClient, DesiredSnapshot, MaestroClient, RealizedSnapshot, UpstreamError,
};

/// Cluster-Service over its regional HTTP API.
pub struct HttpClusterServiceClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpClusterServiceClient {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    async fn fetch(&self, url: String) -> Result<Option<DesiredSnapshot>, UpstreamError> {
        let response = self.client.get(&url).send().await.map_err(|e| {
            error!("cluster-service request failed: {}", e);
            UpstreamError::Transient(format!("cluster-service request failed: {e}"))
        })?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if status.is_server_error() {
            return Err(UpstreamError::Transient(format!("cluster-service returned {status}")));
        }
        if !status.is_success() {
            return Err(UpstreamError::Denied(format!("cluster-service returned {status}")));
        }
        let snapshot = response.json::<DesiredSnapshot>().await.map_err(|e| {
            UpstreamError::Transient(format!("failed to parse cluster-service response: {e}"))
        })?;
        Ok(Some(snapshot))
    }
}

#[async_trait]
impl ClusterServiceClient for HttpClusterServiceClient {
    async fn get_cluster(&self, cluster_service_id: &str) -> Result<Option<DesiredSnapshot>, UpstreamError> {
        self.fetch(format!(
            "{}/api/clusters_mgmt/v1/clusters/{cluster_service_id}/status",
            self.base_url
        ))
        .await
    }

    async fn find_cluster_by_resource(
        &self,
        resource_key: &str,
    ) -> Result<Option<DesiredSnapshot>, UpstreamError> {
        self.fetch(format!(
            "{}/api/clusters_mgmt/v1/clusters?resource_id={resource_key}",
            self.base_url
        ))
        .await
    }
}

/// Maestro over the fleet consumer API.
pub struct HttpMaestroClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMaestroClient {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    async fn fetch(&self, url: String) -> Result<Option<RealizedSnapshot>, UpstreamError> {
        let response = self.client.get(&url).send().await.map_err(|e| {
            error!("maestro request failed: {}", e);
            UpstreamError::Transient(format!("maestro request failed: {e}"))
        })?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if status.is_server_error() {
            return Err(UpstreamError::Transient(format!("maestro returned {status}")));
        }
        if !status.is_success() {
            return Err(UpstreamError::Denied(format!("maestro returned {status}")));
        }
        let snapshot = response.json::<RealizedSnapshot>().await.map_err(|e| {
            UpstreamError::Transient(format!("failed to parse maestro response: {e}"))
        })?;
        Ok(Some(snapshot))
    }
}

#[async_trait]
impl MaestroClient for HttpMaestroClient {
    async fn get_manifest(&self, manifest_id: &str) -> Result<Option<RealizedSnapshot>, UpstreamError> {
        self.fetch(format!("{}/api/maestro/v1/resource-bundles/{manifest_id}", self.base_url))
            .await
    }

    async fn find_manifest_by_resource(
        &self,
        resource_key: &str,
    ) -> Result<Option<RealizedSnapshot>, UpstreamError> {
        self.fetch(format!(
            "{}/api/maestro/v1/resource-bundles?resource_id={resource_key}",
            self.base_url
        ))
        .await
    }
}
