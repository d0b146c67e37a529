use crate::modules::jobs::dto::*;
use crate::modules::jobs::model::JobStatus;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::modules::jobs::handler::submit_job,
        crate::modules::jobs::handler::get_job,
        crate::modules::jobs::handler::list_jobs,
    ),
    components(
        schemas(
            SubmitJobRequest, SubmitJobResponse, JobStatusResponse, JobStatus,
        )
    ),
    tags(
        (name = "Jobs", description = "HLS transcoding jobs")
    )
)]
pub struct ApiDoc;
