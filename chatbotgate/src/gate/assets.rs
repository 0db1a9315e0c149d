//! Embedded static assets for the login pages.

use axum::extract::Path;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

const CSS: &[u8] = include_bytes!("../../assets/chatbotgate.css");
const ICON_GOOGLE: &[u8] = include_bytes!("../../assets/icons/google.svg");
const ICON_GITHUB: &[u8] = include_bytes!("../../assets/icons/github.svg");
const ICON_MICROSOFT: &[u8] = include_bytes!("../../assets/icons/microsoft.svg");
const ICON_OPENID: &[u8] = include_bytes!("../../assets/icons/openid.svg");

fn lookup(path: &str) -> Option<(&'static [u8], &'static str)> {
    match path {
        "chatbotgate.css" => Some((CSS, "text/css; charset=utf-8")),
        "icons/google.svg" => Some((ICON_GOOGLE, "image/svg+xml")),
        "icons/github.svg" => Some((ICON_GITHUB, "image/svg+xml")),
        "icons/microsoft.svg" => Some((ICON_MICROSOFT, "image/svg+xml")),
        "icons/openid.svg" => Some((ICON_OPENID, "image/svg+xml")),
        _ => None,
    }
}

/// `GET <prefix>/assets/{*path}`. Traversal attempts are 404s like any
/// other unknown asset.
pub async fn asset(Path(path): Path<String>) -> Response {
    if path.split('/').any(|segment| segment == "..") {
        return StatusCode::NOT_FOUND.into_response();
    }
    match lookup(&path) {
        Some((bytes, content_type)) => (
            [
                (header::CONTENT_TYPE, content_type),
                (header::CACHE_CONTROL, "public, max-age=3600"),
            ],
            bytes,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_assets() {
        assert!(lookup("chatbotgate.css").is_some());
        assert!(lookup("icons/google.svg").is_some());
        assert!(lookup("icons/missing.svg").is_none());
    }

    #[tokio::test]
    async fn test_traversal_is_rejected() {
        let response = asset(Path("../../etc/passwd".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_css_content_type() {
        let response = asset(Path("chatbotgate.css".to_string())).await;
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/css; charset=utf-8"
        );
    }
}
