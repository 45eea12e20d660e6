use axum::{
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use super::ManifestError;
use super::service::{KEY_FILE, KEYINFO_FILE};
use crate::common::response::ApiError;
use crate::infrastructure::storage::{StorageError, content_type_for};
use crate::modules::signer::{SignatureError, SignedToken};
use crate::state::AppState;

pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const KEY_CACHE_CONTROL: &str = "private, max-age=60";

impl From<SignatureError> for ApiError {
    fn from(e: SignatureError) -> Self {
        match e {
            SignatureError::Expired => ApiError(e.to_string(), StatusCode::UNAUTHORIZED),
            _ => ApiError(e.to_string(), StatusCode::FORBIDDEN),
        }
    }
}

impl From<ManifestError> for ApiError {
    fn from(e: ManifestError) -> Self {
        match e {
            ManifestError::Storage(StorageError::NotFound(_)) => {
                ApiError("Not found".to_string(), StatusCode::NOT_FOUND)
            }
            ManifestError::Signature(e) => e.into(),
            other => {
                tracing::error!(error = %other, "manifest delivery failed");
                ApiError(other.to_string(), StatusCode::BAD_GATEWAY)
            }
        }
    }
}

/// Serves everything behind a signed URL: master and variant playlists,
/// key material and segments.
#[utoipa::path(
    get,
    path = "/signed/{expires_ms}/{scope}/{signature}/assets/{id}/{file}",
    params(
        ("expires_ms" = i64, Path, description = "Expiry, unix milliseconds"),
        ("scope" = usize, Path, description = "0 = exact path, n = first n path components"),
        ("signature" = String, Path, description = "Hex HMAC-SHA256"),
        ("id" = Uuid, Path, description = "Asset ID"),
        ("file" = String, Path, description = "Playlist, segment, keyinfo or file.key")
    ),
    responses(
        (status = 200, description = "Signed content"),
        (status = 401, description = "Signature expired"),
        (status = 403, description = "Invalid signature"),
        (status = 404, description = "Not Found")
    ),
    tag = "Delivery"
)]
pub async fn serve_signed(
    State(state): State<AppState>,
    Path(rest): Path<String>,
) -> Result<Response, ApiError> {
    let token = SignedToken::parse(&rest)?;
    state.manifests.signer().verify(&token)?;

    let (asset_id, file_name) = split_asset_path(&token.path)
        .ok_or_else(|| ApiError("Not found".to_string(), StatusCode::NOT_FOUND))?;

    let asset = state
        .store
        .get_asset(asset_id)
        .await?
        .ok_or_else(|| ApiError("Asset not found".to_string(), StatusCode::NOT_FOUND))?;

    if file_name == KEY_FILE {
        return Ok((
            [
                (header::CONTENT_TYPE, "application/octet-stream"),
                (header::CACHE_CONTROL, KEY_CACHE_CONTROL),
            ],
            asset.encryption_key.to_vec(),
        )
            .into_response());
    }

    if file_name == KEYINFO_FILE {
        let body = state.manifests.keyinfo(&asset)?;
        return Ok((
            [
                (header::CONTENT_TYPE, "text/plain"),
                (header::CACHE_CONTROL, KEY_CACHE_CONTROL),
            ],
            body,
        )
            .into_response());
    }

    if file_name == asset.master_playlist_name() {
        let body = state.manifests.master(&asset).await?;
        return Ok(([(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)], body).into_response());
    }

    if file_name.ends_with(".m3u8") {
        let body = state.manifests.variant(&asset, file_name).await?;
        return Ok(([(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)], body).into_response());
    }

    let stream = state.manifests.object(asset_id, file_name).await?;
    Ok((
        [(header::CONTENT_TYPE, content_type_for(file_name))],
        Body::from_stream(stream),
    )
        .into_response())
}

/// `assets/{uuid}/{file}` -> (uuid, file). Nested paths are rejected.
fn split_asset_path(path: &str) -> Option<(Uuid, &str)> {
    let mut parts = path.splitn(3, '/');
    if parts.next()? != "assets" {
        return None;
    }
    let asset_id = Uuid::parse_str(parts.next()?).ok()?;
    let file_name = parts.next()?;
    if file_name.is_empty() || file_name.contains('/') {
        return None;
    }
    Some((asset_id, file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_asset_paths() {
        let id = Uuid::new_v4();
        let path = format!("assets/{id}/file.key");
        assert_eq!(split_asset_path(&path), Some((id, "file.key")));
        assert_eq!(split_asset_path(&format!("assets/{id}/a/b.ts")), None);
        assert_eq!(split_asset_path(&format!("movies/{id}/file.key")), None);
        assert_eq!(split_asset_path("assets/not-a-uuid/file.key"), None);
        assert_eq!(split_asset_path(&format!("assets/{id}/")), None);
    }
}
