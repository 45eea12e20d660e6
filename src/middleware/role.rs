use crate::common::response::ApiError;
use crate::middleware::auth::OperatorClaims;
use axum::{
    extract::{Extension, Request},
    http::StatusCode,
    middleware::Next,
    response::Response,
};

pub const OPERATOR_ROLE: &str = "operator";

pub async fn operator_guard(
    Extension(claims): Extension<OperatorClaims>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if claims.role != OPERATOR_ROLE {
        return Err(ApiError("Forbidden: Operator access required".to_string(), StatusCode::FORBIDDEN));
    }

    Ok(next.run(req).await)
}
