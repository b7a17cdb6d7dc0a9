//! Subject endpoints used by the bot front end.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::post,
};
use herald_db::MessageLocation;
use herald_db::entities::{offer_instance, reminder_subscription};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::response::ApiError;

const DEFAULT_SCENARIO: &str = "default";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnterStepQuery {
    scenario: Option<String>,
}

/// Where the bot displayed the offer, when it did.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisplayQuery {
    chat_id: Option<i64>,
    message_id: Option<i32>,
}

impl DisplayQuery {
    const fn location(&self) -> Option<MessageLocation> {
        match (self.chat_id, self.message_id) {
            (Some(chat_id), Some(message_id)) => Some(MessageLocation {
                chat_id,
                message_id,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OfferDisplayed {
    instance: offer_instance::Model,
    expiration_task_id: Option<String>,
}

/// The subject entered `step`: schedule its reminder chain.
async fn enter_step(
    State(state): State<AppState>,
    Path((subject_id, step)): Path<(i64, String)>,
    Query(query): Query<EnterStepQuery>,
) -> Result<(StatusCode, Json<Vec<reminder_subscription::Model>>), ApiError> {
    let scenario = query.scenario.as_deref().unwrap_or(DEFAULT_SCENARIO);
    let scheduled = state
        .reminders
        .schedule_chain(subject_id, &step, scenario)
        .await?;
    Ok((StatusCode::CREATED, Json(scheduled)))
}

/// The offer was (re)displayed: start it if needed and arm its expiration.
async fn display_offer(
    State(state): State<AppState>,
    Path((subject_id, offer)): Path<(i64, String)>,
    Query(query): Query<DisplayQuery>,
) -> Result<Json<OfferDisplayed>, ApiError> {
    let instance = state
        .offers
        .ensure_instance_started(subject_id, &offer)
        .await?;
    let expiration_task_id = state
        .offers
        .arm_expiration(&instance, query.location())
        .await?;
    Ok(Json(OfferDisplayed {
        instance,
        expiration_task_id,
    }))
}

async fn confirm_payment(
    State(state): State<AppState>,
    Path((subject_id, offer)): Path<(i64, String)>,
) -> Result<Json<offer_instance::Model>, ApiError> {
    Ok(Json(state.offers.confirm_payment(subject_id, &offer).await?))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}/steps/{step}", post(enter_step))
        .route("/{id}/offers/{offer}", post(display_offer))
        .route("/{id}/offers/{offer}/paid", post(confirm_payment))
}
