//! Schedule endpoints: read, update frequency, pause, resume.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::{authenticate, AppState};

/// Wire shape of a tenant's schedule.
#[derive(Debug, Serialize)]
pub struct ScheduleView {
    /// Whether the scheduler ticks this tenant.
    pub enabled: bool,
    /// Minutes between harvests.
    pub frequency_minutes: u32,
}

/// `GET /api/schedule`.
pub async fn get_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ScheduleView>, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    Ok(Json(ScheduleView {
        enabled: tenant.schedule_enabled,
        frequency_minutes: tenant.frequency_minutes,
    }))
}

/// Body for frequency updates.
#[derive(Debug, Deserialize)]
pub struct SetScheduleRequest {
    /// New harvest frequency, floored at one minute.
    pub frequency_minutes: u32,
}

/// `PUT /api/schedule` — change the harvest frequency.
pub async fn set_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SetScheduleRequest>,
) -> Result<Json<ScheduleView>, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    if body.frequency_minutes == 0 {
        return Err(ApiError::BadRequest(
            "frequency_minutes must be at least 1".to_owned(),
        ));
    }
    state
        .scheduler
        .update_frequency(tenant.id, body.frequency_minutes)
        .await?;
    let tenant = state
        .tenants
        .get(tenant.id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("tenant {}", tenant.id)))?;
    Ok(Json(ScheduleView {
        enabled: tenant.schedule_enabled,
        frequency_minutes: tenant.frequency_minutes,
    }))
}

/// `POST /api/schedule/pause` — stop future ticks; running jobs finish.
pub async fn pause_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ScheduleView>, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    state.scheduler.pause(tenant.id).await?;
    Ok(Json(ScheduleView {
        enabled: false,
        frequency_minutes: tenant.frequency_minutes,
    }))
}

/// `POST /api/schedule/resume` — re-arm the tenant's ticks.
pub async fn resume_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ScheduleView>, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    state.scheduler.resume(tenant.id).await?;
    Ok(Json(ScheduleView {
        enabled: true,
        frequency_minutes: tenant.frequency_minutes,
    }))
}
