use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::dataset::CaseCatalog;
use crate::services::invoker::InferenceInvoker;
use crate::services::job_store::JobStore;
use crate::services::pipeline::SegmentationPipeline;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub jobs: Arc<JobStore>,
    pub catalog: Arc<CaseCatalog>,
    pub invoker: Arc<dyn InferenceInvoker>,
    pub pipeline: Arc<SegmentationPipeline>,
}

impl AppState {
    pub fn new(config: AppConfig, invoker: Arc<dyn InferenceInvoker>) -> Self {
        let config = Arc::new(config);
        let jobs = Arc::new(JobStore::new());
        let catalog = Arc::new(CaseCatalog::new(config.data_dir.clone()));
        let pipeline = Arc::new(SegmentationPipeline::new(
            jobs.clone(),
            catalog.clone(),
            invoker.clone(),
            config.clone(),
        ));
        Self {
            config,
            jobs,
            catalog,
            invoker,
            pipeline,
        }
    }
}
