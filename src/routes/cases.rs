use axum::extract::State;
use axum::Json;

use crate::app_state::AppState;
use crate::models::CasesResponse;
use crate::routes::ApiError;

/// GET /api/cases — case ids available for segmentation.
pub async fn list_cases(State(state): State<AppState>) -> Result<Json<CasesResponse>, ApiError> {
    let cases = state.catalog.list_case_ids().await.map_err(|err| {
        tracing::error!(error = %err, "Could not list dataset cases");
        ApiError::internal("could not list dataset cases")
    })?;
    Ok(Json(CasesResponse { cases }))
}
