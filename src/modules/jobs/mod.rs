use crate::state::AppState;
use axum::routing::get;
use axum::Router;

pub mod dto;
pub mod events;
pub mod handler;
pub mod memory;
pub mod model;
pub mod repository;
pub mod service;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(handler::list_jobs).post(handler::submit_job))
        .route("/jobs/{id}", get(handler::get_job))
}
