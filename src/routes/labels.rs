use crate::server::SharedState;
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Labels<'a> {
    labels: &'a [String],
}

pub async fn labels(State(state): State<SharedState>) -> impl IntoResponse {
    Json(Labels {
        labels: state.prediction_service.labels(),
    })
    .into_response()
}
