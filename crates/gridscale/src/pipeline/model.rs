use std::collections::BTreeMap;

use gridcore::backend::{HOST_PREFIX, LaunchRequest, PriceType, RunId, RunInfo, RunStatus};
use gridcore::instance::Instance;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Request failed with HTTP status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Request was rejected: {0}")]
    Rejected(String),
    #[error("Response has no payload")]
    MissingPayload,
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Envelope of every API response.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub message: Option<String>,
    pub payload: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn into_payload(self) -> ApiResult<T> {
        if self.status != "OK" {
            return Err(ApiError::Rejected(
                self.message
                    .unwrap_or_else(|| format!("status {}", self.status)),
            ));
        }
        self.payload.ok_or(ApiError::MissingPayload)
    }
}

#[derive(Debug, Serialize)]
pub struct RunParameter {
    pub value: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl RunParameter {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            kind: "string",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchBody {
    pub instance_type: String,
    pub hdd_size: u32,
    pub docker_image: String,
    pub cmd_template: String,
    pub parent_run_id: RunId,
    pub is_spot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_region_id: Option<u64>,
    pub params: BTreeMap<String, RunParameter>,
}

impl From<&LaunchRequest> for LaunchBody {
    fn from(request: &LaunchRequest) -> Self {
        let mut params = BTreeMap::new();
        params.insert(
            "parent-id".to_string(),
            RunParameter::string(request.parent_run_id.to_string()),
        );
        params.insert(
            "CP_CAP_AUTOSCALE_OWNER".to_string(),
            RunParameter::string(request.owner.clone()),
        );
        Self {
            instance_type: request.instance_type.clone(),
            hdd_size: request.disk,
            docker_image: request.image.clone(),
            cmd_template: request.cmd_template.clone(),
            parent_run_id: request.parent_run_id,
            is_spot: request.price_type == PriceType::Spot,
            cloud_region_id: request.region_id,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    pub status: &'static str,
    /// UTC time in the `%Y-%m-%d %H:%M:%S%.3f` format.
    pub end_date: String,
}

impl StatusBody {
    pub fn stopped(now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            status: "STOPPED",
            end_date: now.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub id: RunId,
    pub status: String,
    #[serde(default)]
    pub initialized: bool,
    #[serde(rename = "podIP")]
    pub pod_ip: Option<String>,
    pub state_reason_message: Option<String>,
}

impl PipelineRun {
    pub fn into_run_info(self) -> RunInfo {
        let status = match self.status.as_str() {
            "RUNNING" => RunStatus::Running,
            "SUCCESS" => RunStatus::Success,
            "FAILURE" => RunStatus::Failure,
            "STOPPED" => RunStatus::Stopped,
            "RESUMING" => RunStatus::Resuming,
            "PAUSING" => RunStatus::Pausing,
            "PAUSED" => RunStatus::Paused,
            other => {
                log::warn!("Run {} has unknown status {other}", self.id);
                RunStatus::Failure
            }
        };
        let ip = self.pod_ip.filter(|ip| !ip.is_empty());
        RunInfo {
            id: self.id,
            status,
            initialized: self.initialized,
            // The hostname of a run is derived from its id, it is resolvable once the pod has an IP
            host: ip.as_ref().map(|_| format!("{HOST_PREFIX}{}", self.id)),
            ip,
            state_reason: self.state_reason_message,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceType {
    pub name: String,
    #[serde(rename = "vCPU")]
    pub vcpu: u32,
    #[serde(default)]
    pub gpu: u32,
    /// Memory in GiB.
    pub memory: f64,
    #[serde(default)]
    pub price_per_unit: f64,
    pub region_id: Option<u64>,
}

impl InstanceType {
    pub fn into_instance(self) -> Instance {
        let mut instance = Instance::new(self.name, self.vcpu, self.gpu, self.memory.floor() as u64);
        instance.price = self.price_per_unit;
        instance
    }
}

/// Instance types of the region, deduplicated by name. Types without a region are kept.
pub fn region_instances(types: Vec<InstanceType>, region_id: Option<u64>) -> Vec<Instance> {
    let mut instances: Vec<Instance> = Vec::new();
    for instance_type in types {
        let in_region = match (region_id, instance_type.region_id) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => true,
        };
        if in_region && !instances.iter().any(|i| i.name == instance_type.name) {
            instances.push(instance_type.into_instance());
        }
    }
    instances
}

#[cfg(test)]
mod tests {
    use super::{
        ApiError, ApiResponse, InstanceType, LaunchBody, PipelineRun, StatusBody, region_instances,
    };
    use chrono::TimeZone;
    use gridcore::backend::{LaunchRequest, PriceType, RunStatus};

    #[test]
    fn run_to_run_info() {
        let response: ApiResponse<PipelineRun> = serde_json::from_str(
            r#"{"status": "OK", "payload": {"id": 42, "status": "RUNNING", "initialized": true, "podIP": "10.0.0.42", "pipelineName": "worker"}}"#,
        )
        .unwrap();
        let run = response.into_payload().unwrap().into_run_info();
        assert_eq!(run.id, 42);
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.host.as_deref(), Some("pipeline-42"));
        assert_eq!(run.ip.as_deref(), Some("10.0.0.42"));
        assert!(run.is_ready());
    }

    #[test]
    fn run_without_ip_has_no_host() {
        let run: PipelineRun = serde_json::from_str(
            r#"{"id": 7, "status": "FAILURE", "podIP": "", "stateReasonMessage": "Insufficient instance capacity"}"#,
        )
        .unwrap();
        let run = run.into_run_info();
        assert_eq!(run.status, RunStatus::Failure);
        assert!(!run.initialized);
        assert!(run.host.is_none());
        assert!(run.ip.is_none());
        assert_eq!(run.state_reason.as_deref(), Some("Insufficient instance capacity"));
    }

    #[test]
    fn error_response_is_rejected() {
        let response: ApiResponse<PipelineRun> =
            serde_json::from_str(r#"{"status": "ERROR", "message": "Run 5 not found"}"#).unwrap();
        match response.into_payload() {
            Err(ApiError::Rejected(message)) => assert_eq!(message, "Run 5 not found"),
            other => panic!("Unexpected result {other:?}"),
        }
        let response: ApiResponse<PipelineRun> = serde_json::from_str(r#"{"status": "OK"}"#).unwrap();
        assert!(matches!(response.into_payload(), Err(ApiError::MissingPayload)));
    }

    #[test]
    fn launch_body() {
        let request = LaunchRequest {
            instance_type: "m5.large".to_string(),
            disk: 100,
            image: "library/centos:7".to_string(),
            cmd_template: "sleep infinity".to_string(),
            owner: "alice".to_string(),
            parent_run_id: 10,
            price_type: PriceType::OnDemand,
            region_id: None,
        };
        let body = serde_json::to_value(LaunchBody::from(&request)).unwrap();
        assert_eq!(body["instanceType"], "m5.large");
        assert_eq!(body["hddSize"], 100);
        assert_eq!(body["parentRunId"], 10);
        assert_eq!(body["isSpot"], false);
        assert!(body.get("cloudRegionId").is_none());
        assert_eq!(body["params"]["parent-id"]["value"], "10");
        assert_eq!(body["params"]["CP_CAP_AUTOSCALE_OWNER"]["value"], "alice");
    }

    #[test]
    fn stop_body_end_date() {
        let now = chrono::Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 0).unwrap();
        let body = serde_json::to_value(StatusBody::stopped(now)).unwrap();
        assert_eq!(body["status"], "STOPPED");
        assert_eq!(body["endDate"], "2026-10-18 09:30:00.000");
    }

    #[test]
    fn instances_of_region() {
        let types: Vec<InstanceType> = serde_json::from_str(
            r#"[
              {"name": "m5.large", "vCPU": 2, "memory": 8, "pricePerUnit": 0.096, "regionId": 1},
              {"name": "m5.large", "vCPU": 2, "memory": 8, "pricePerUnit": 0.035, "regionId": 1, "termType": "Spot"},
              {"name": "m5.xlarge", "vCPU": 4, "memory": 16, "regionId": 2},
              {"name": "p3.2xlarge", "vCPU": 8, "gpu": 1, "memory": 61}
            ]"#,
        )
        .unwrap();
        let instances = region_instances(types, Some(1));
        let names: Vec<&str> = instances.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["m5.large", "p3.2xlarge"]);
        assert_eq!(instances[0].price, 0.096);
        assert_eq!(instances[1].gpu, 1);
        assert_eq!(instances[1].mem, 61);
    }
}
