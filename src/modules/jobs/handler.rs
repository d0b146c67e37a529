use crate::common::response::{ApiError, ApiResponse, ApiSuccess};
use crate::common::upload::{discard, stream_to_disk};
use crate::modules::jobs::dto::*;
use crate::modules::jobs::model::JobStatus;
use crate::modules::jobs::service::{JobService, SubmitError};
use crate::state::AppState;
use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::path::PathBuf;
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

/// Submit a video for HLS transcoding
#[utoipa::path(
    post,
    path = "/api/v1/jobs",
    request_body(content = SubmitJobRequest, content_type = "multipart/form-data"),
    responses(
        (status = 202, description = "Job accepted", body = ApiResponse<SubmitJobResponse>),
        (status = 400, description = "Bad Request"),
        (status = 500, description = "Job could not be recorded"),
        (status = 503, description = "Job recorded but not queued", body = ApiResponse<SubmitJobResponse>)
    ),
    tag = "Jobs"
)]
pub async fn submit_job(State(state): State<AppState>, multipart: Multipart) -> Response {
    let job_id = Uuid::new_v4();

    let (form, upload) = match read_submission(&state, job_id, multipart).await {
        Ok(parts) => parts,
        Err((e, upload)) => {
            if let Some(path) = upload {
                discard(&path).await;
            }
            warn!("Rejected submission: {}", e.0);
            return e.into_response();
        }
    };

    match JobService::submit(&state, job_id, form, &upload).await {
        Ok(res) => ApiSuccess(ApiResponse::success(res, "Job accepted"), StatusCode::ACCEPTED).into_response(),
        Err(SubmitError::Enqueue { job_id, source }) => {
            error!("❌ Job {} stays pending, enqueue failed: {}", job_id, source);
            let res = SubmitJobResponse {
                job_id,
                task_id: None,
                status: JobStatus::Pending,
            };
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiResponse::error_with_data(
                    res,
                    "Job recorded but could not be queued; it will be retried",
                )),
            )
                .into_response()
        }
        Err(SubmitError::Store(e)) => {
            error!("❌ Failed to record job {}: {}", job_id, e);
            discard(&upload).await;
            ApiError("Failed to record job".to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

type Rejection = (ApiError, Option<PathBuf>);

/// Reads `file`, `title` and `description`. On rejection, hands back the upload
/// path (if any bytes landed) so the caller can discard it.
async fn read_submission(
    state: &AppState,
    job_id: Uuid,
    mut multipart: Multipart,
) -> Result<(SubmitJobForm, PathBuf), Rejection> {
    let mut form = SubmitJobForm::default();
    let mut has_title = false;
    let mut upload: Option<PathBuf> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err((ApiError::bad_request(format!("Malformed multipart body: {}", e)), upload)),
        };
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "file" => {
                if upload.is_some() {
                    return Err((ApiError::bad_request("Only one file per job"), upload));
                }
                let file_name = field.file_name().unwrap_or("upload.bin").to_string();
                let path = state.files.upload_path(job_id, &file_name);
                info!("Receiving upload for job {}: {}", job_id, file_name);

                match stream_to_disk(field, path.clone()).await {
                    Ok(bytes) => {
                        info!("Stored {} bytes at {}", bytes, path.display());
                        upload = Some(path);
                    }
                    Err(e) => return Err((ApiError::bad_request(format!("Upload failed: {}", e)), Some(path))),
                }
            }
            "title" | "description" => {
                let text = match field.text().await {
                    Ok(text) => text,
                    Err(e) => return Err((ApiError::bad_request(format!("Unreadable field '{}': {}", name, e)), upload)),
                };
                if name == "title" {
                    form.title = text;
                    has_title = true;
                } else {
                    form.description = Some(text);
                }
            }
            _ => {}
        }
    }

    let form = form.normalize();
    if !has_title || form.title.is_empty() {
        return Err((ApiError::bad_request("Title is required"), upload));
    }
    if let Err(e) = form.validate() {
        return Err((ApiError::bad_request(e.to_string()), upload));
    }
    let Some(path) = upload else {
        return Err((ApiError::bad_request("No file part in the request"), None));
    };

    Ok((form, path))
}

#[utoipa::path(
    get,
    path = "/api/v1/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job status", body = ApiResponse<JobStatusResponse>),
        (status = 404, description = "Job Not Found"),
        (status = 503, description = "Job store unavailable")
    ),
    tag = "Jobs"
)]
pub async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match JobService::get(&state, id).await {
        Ok(Some(res)) => ApiSuccess(ApiResponse::success(res, "Job retrieved successfully"), StatusCode::OK).into_response(),
        Ok(None) => ApiError::not_found("Job not found").into_response(),
        Err(_) => ApiError::unavailable().into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/jobs",
    responses(
        (status = 200, description = "Recent jobs, newest first", body = ApiResponse<Vec<JobStatusResponse>>),
        (status = 503, description = "Job store unavailable")
    ),
    tag = "Jobs"
)]
pub async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    match JobService::list(&state).await {
        Ok(res) => ApiSuccess(ApiResponse::success(res, "Jobs retrieved successfully"), StatusCode::OK).into_response(),
        Err(_) => ApiError::unavailable().into_response(),
    }
}
