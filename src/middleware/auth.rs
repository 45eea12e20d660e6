use crate::common::response::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorClaims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    // 1. Extract bearer token
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|auth_header| auth_header.to_str().ok())
        .and_then(|auth_value| auth_value.strip_prefix("Bearer "))
        .map(str::to_owned);

    let token = match token {
        Some(t) => t,
        None => return Err(ApiError("Unauthorized: Missing or invalid token".to_string(), StatusCode::UNAUTHORIZED)),
    };

    // 2. Verify JWT against the operator secret
    let secret = &state.config.operator_token_secret;

    let claims = decode::<OperatorClaims>(
        &token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError("Unauthorized: Invalid token signature".to_string(), StatusCode::UNAUTHORIZED))?
    .claims;

    // 3. Inject claims into request extensions
    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}
