use std::time::Duration;

use gridcore::backend::{BackendFuture, InstanceProvider, LaunchRequest, RunId, RunInfo};
use gridcore::instance::Instance;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::pipeline::model::{
    ApiError, ApiResponse, ApiResult, InstanceType, LaunchBody, PipelineRun, StatusBody,
    region_instances,
};

#[derive(Clone)]
pub struct ApiConfig {
    /// Base URL of the REST API, e.g. `https://cp.example.com/pipeline/restapi`.
    pub url: String,
    pub token: String,
    pub timeout: Duration,
    /// Only instance types of this region are offered.
    pub region_id: Option<u64>,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("url", &self.url)
            .field("token", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .field("region_id", &self.region_id)
            .finish()
    }
}

/// Client of the Cloud Pipeline REST API, authenticated by a bearer token.
pub struct CloudPipelineClient {
    client: Client,
    base_url: String,
    token: String,
    region_id: Option<u64>,
}

impl std::fmt::Debug for CloudPipelineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudPipelineClient")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl CloudPipelineClient {
    pub fn new(config: ApiConfig) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token,
            region_id: config.region_id,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> ApiResult<T> {
        let url = self.url(path);
        log::debug!("GET {url}");
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        handle_response(response).await
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> ApiResult<T> {
        let url = self.url(path);
        log::debug!("POST {url}");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        handle_response(response).await
    }

    pub async fn launch_run(&self, request: &LaunchRequest) -> ApiResult<RunId> {
        let body = LaunchBody::from(request);
        let run: PipelineRun = self.post("run", &body).await?;
        Ok(run.id)
    }

    pub async fn get_run(&self, run_id: RunId) -> ApiResult<RunInfo> {
        let run: PipelineRun = self.get(&format!("run/{run_id}")).await?;
        Ok(run.into_run_info())
    }

    pub async fn stop_run(&self, run_id: RunId) -> ApiResult<()> {
        let body = StatusBody::stopped(chrono::Utc::now());
        let _: serde_json::Value = self.post(&format!("run/{run_id}/status"), &body).await?;
        Ok(())
    }

    pub async fn load_instance_types(&self) -> ApiResult<Vec<Instance>> {
        let types: Vec<InstanceType> = self.get("cluster/instance/loadAll").await?;
        Ok(region_instances(types, self.region_id))
    }
}

async fn handle_response<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> ApiResult<T> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            message,
        });
    }
    let body = response.bytes().await?;
    let response: ApiResponse<T> = serde_json::from_slice(&body)?;
    response.into_payload()
}

impl InstanceProvider for CloudPipelineClient {
    fn launch_instance<'a>(&'a self, request: &'a LaunchRequest) -> BackendFuture<'a, RunId> {
        Box::pin(async move { Ok(self.launch_run(request).await?) })
    }

    fn load_run(&self, run_id: RunId) -> BackendFuture<'_, RunInfo> {
        Box::pin(async move { Ok(self.get_run(run_id).await?) })
    }

    fn terminate_instance(&self, run_id: RunId) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            log::info!("Stopping run {run_id}");
            Ok(self.stop_run(run_id).await?)
        })
    }

    fn list_instances(&self) -> BackendFuture<'_, Vec<Instance>> {
        Box::pin(async move { Ok(self.load_instance_types().await?) })
    }
}
