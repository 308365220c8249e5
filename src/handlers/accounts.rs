use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::Json,
};
use serde_json::{json, Value};

use crate::{
    config::parse_timezone,
    errors::{AppError, Result},
    handlers::AppState,
    middleware::auth::AuthenticatedUser,
    models::{Account, AccountResponse, Balance, PointType, RegisterAccountRequest},
};

/// `POST /api/accounts`: registers the token's user with the opening grant.
pub async fn register(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    payload: std::result::Result<Json<RegisterAccountRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>)> {
    let Json(request) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    user.ensure_same_user(request.user_id.as_deref())?;

    let display_name = request.display_name.trim();
    if display_name.is_empty() {
        return Err(AppError::Validation("displayName is required".to_string()));
    }
    if display_name.chars().count() > 64 {
        return Err(AppError::Validation("displayName is too long".to_string()));
    }

    let timezone = match request.timezone.as_deref() {
        Some(name) => parse_timezone(name).map_err(|_| AppError::Validation(format!("Unknown timezone: {}", name)))?,
        None => state.config.default_timezone,
    };

    let account = Account {
        user_id: user.user_id.clone(),
        display_name: display_name.to_string(),
        grade_level: request.grade_level,
        timezone,
        created_at: state.ledger.now(),
    };
    let balance = state.ledger.open_account(account.clone()).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "account": account_response(account, &balance),
        })),
    ))
}

/// `GET /api/accounts`: the caller's profile with their current points.
pub async fn get_account(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<Value>> {
    let (account, balance) = state.ledger.account(&user.user_id).await?;

    Ok(Json(json!({
        "success": true,
        "account": account_response(account, &balance),
    })))
}

/// `GET /api/points`: current balance after any due top-up.
pub async fn get_points(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<Value>> {
    let balance = state.ledger.current_balance(&user.user_id).await?;

    Ok(Json(json!({
        "success": true,
        "pointsRemaining": balance.points(),
        "nextTicketReplenishAt": state.ledger.next_replenish_at(PointType::Ticket, &balance),
        "nextDiamondReplenishAt": state.ledger.next_replenish_at(PointType::Diamond, &balance),
    })))
}

fn account_response(account: Account, balance: &Balance) -> AccountResponse {
    AccountResponse {
        user_id: account.user_id,
        display_name: account.display_name,
        grade_level: account.grade_level,
        timezone: account.timezone.name().to_string(),
        points: balance.points(),
        created_at: account.created_at,
    }
}
