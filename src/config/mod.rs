use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use strum::{Display, EnumString};

/// Which execution strategy runs the segmentation model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InvokerKind {
    /// Launch the published model container with bind-mounted volumes.
    #[default]
    Docker,
    /// Run the adapter script as a subprocess in the host environment.
    Direct,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8000")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Root directory of the local case dataset, one subdirectory per case
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory where per-job staging and result files are written
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    /// Maximum number of jobs simultaneously pending or running
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Seconds a job record (and its result files) is retained after creation
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,

    /// Seconds between TTL eviction sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Execution strategy: "docker" or "direct"
    #[serde(default)]
    pub invoker: InvokerKind,

    /// Container image run by the docker strategy
    #[serde(default = "default_docker_image")]
    pub docker_image: String,

    /// Pass --gpus all to the container runtime
    #[serde(default = "default_use_gpu")]
    pub use_gpu: bool,

    /// Seconds one inference invocation may take before it is killed
    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,

    /// Command prefix the direct strategy runs the adapter with,
    /// whitespace-separated (program first)
    #[serde(default = "default_adapter_command")]
    pub adapter_command: String,

    /// Absolute base URL prefixed to result file URLs; relative when unset
    #[serde(default)]
    pub public_base_url: Option<String>,

    /// Hugging Face dataset repo to sync missing cases from (e.g.
    /// "hugging-science/isles24-stroke-lite")
    #[serde(default)]
    pub hub_dataset_id: Option<String>,

    /// Revision of the dataset repo to sync from
    #[serde(default = "default_hub_revision")]
    pub hub_revision: String,

    /// Hugging Face access token for gated datasets
    #[serde(default)]
    pub hub_token: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/isles24")
}

fn default_results_dir() -> PathBuf {
    std::env::temp_dir().join("stroke-seg-results")
}

fn default_max_concurrent_jobs() -> usize {
    2
}

fn default_job_ttl_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    600
}

fn default_docker_image() -> String {
    "isleschallenge/deepisles".to_string()
}

fn default_use_gpu() -> bool {
    true
}

fn default_inference_timeout_secs() -> u64 {
    1800
}

fn default_adapter_command() -> String {
    "conda run -n isles_ensemble python /app/deepisles_adapter.py".to_string()
}

fn default_hub_revision() -> String {
    "main".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn job_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.job_ttl_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoker_kind_parses_from_config_strings() {
        assert_eq!(
            "docker".parse::<InvokerKind>().ok(),
            Some(InvokerKind::Docker)
        );
        assert_eq!(
            "direct".parse::<InvokerKind>().ok(),
            Some(InvokerKind::Direct)
        );
        assert!("podman".parse::<InvokerKind>().is_err());
    }

    #[test]
    fn duration_helpers_reflect_seconds() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.job_ttl(), chrono::Duration::hours(1));
        assert_eq!(config.inference_timeout(), Duration::from_secs(1800));
        assert_eq!(config.max_concurrent_jobs, 2);
    }
}
