use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::Json,
};
use serde_json::{json, Map, Value};

use crate::{
    errors::{AppError, Result},
    handlers::AppState,
    middleware::auth::AuthenticatedUser,
    models::normalize_feature_id,
    services::feature_gate::GateError,
};

/// `POST /api/features/:feature`
///
/// Body is the feature's own parameters plus an optional `userId`, which
/// must match the token when present.
pub async fn invoke_feature(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(feature): Path<String>,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> std::result::Result<Json<Value>, GateError<anyhow::Error>> {
    let mut params = feature_params(payload)?;

    let claimed = params.remove("userId");
    let claimed = match &claimed {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) => Some(id.as_str()),
        Some(_) => return Err(AppError::Validation("userId must be a string".to_string()).into()),
    };
    user.ensure_same_user(claimed)?;

    let feature_id = normalize_feature_id(&feature);
    let handler = state.features.clone();
    let gated = state
        .gate
        .invoke(&feature, &user.user_id, |user_id| {
            let feature_id = feature_id.clone();
            async move {
                handler
                    .handle(&feature_id, &user_id, Value::Object(params))
                    .await
            }
        })
        .await?;

    Ok(Json(json!({
        "success": true,
        "data": gated.value,
        "pointsRemaining": gated.points_remaining,
    })))
}

/// `GET /api/features`: the cost table, so clients can label buttons.
pub async fn list_features(State(state): State<AppState>) -> Json<Value> {
    let mut features: Vec<Value> = state
        .gate
        .catalog()
        .feature_ids()
        .filter_map(|id| {
            state.gate.catalog().resolve(id).map(|cost| {
                json!({
                    "id": id,
                    "pointType": cost.point_type,
                    "cost": cost.cost,
                })
            })
        })
        .collect();
    features.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));

    Json(json!({
        "success": true,
        "features": features,
    }))
}

fn feature_params(payload: std::result::Result<Json<Value>, JsonRejection>) -> Result<Map<String, Value>> {
    match payload {
        Ok(Json(Value::Object(params))) => Ok(params),
        Ok(Json(Value::Null)) => Ok(Map::new()),
        Ok(Json(_)) => Err(AppError::Validation("Request body must be a JSON object".to_string())),
        Err(rejection) => Err(AppError::Validation(rejection.body_text())),
    }
}
