//! Offline fallback responses.

use crate::classify::RequestClass;
use crate::http::Response;

/// Inline placeholder served for images that are neither cached nor reachable.
pub const IMAGE_PLACEHOLDER_SVG: &str = concat!(
    r##"<svg xmlns="http://www.w3.org/2000/svg" width="300" height="200" viewBox="0 0 300 200">"##,
    r##"<rect width="300" height="200" fill="#f3f4f6"/>"##,
    r##"<text x="150" y="100" text-anchor="middle" dominant-baseline="middle" "##,
    r##"font-family="sans-serif" font-size="14" fill="#6b7280">Image unavailable</text>"##,
    r##"</svg>"##
);

/// Body of the offline API response.
pub const API_OFFLINE_BODY: &str =
    r#"{"error":"Offline","message":"This data is not available offline"}"#;

pub fn image_placeholder() -> Response {
    Response::new(200, IMAGE_PLACEHOLDER_SVG).with_header("content-type", "image/svg+xml")
}

pub fn api_offline() -> Response {
    Response::new(503, API_OFFLINE_BODY).with_header("content-type", "application/json")
}

pub fn plain_offline() -> Response {
    Response::new(503, "Offline").with_header("content-type", "text/plain")
}

/// Fallback for a request class. Navigations get the cached root document
/// when there is one.
pub fn offline_response(class: RequestClass, cached_root: Option<Response>) -> Response {
    match class {
        RequestClass::Image => image_placeholder(),
        RequestClass::Api => api_offline(),
        RequestClass::Other => cached_root.unwrap_or_else(plain_offline),
        RequestClass::StaticAsset => plain_offline(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_offline_exact() {
        let resp = offline_response(RequestClass::Api, None);
        assert_eq!(resp.status, 503);
        assert_eq!(resp.header("Content-Type"), Some("application/json"));
        assert_eq!(
            resp.json().unwrap(),
            serde_json::json!({"error": "Offline", "message": "This data is not available offline"})
        );
    }

    #[test]
    fn test_image_placeholder() {
        let resp = offline_response(RequestClass::Image, None);
        assert_eq!(resp.header("content-type"), Some("image/svg+xml"));
        let svg = resp.text();
        assert!(svg.contains(r#"width="300""#));
        assert!(svg.contains(r#"height="200""#));
        assert!(svg.contains("#f3f4f6"));
        assert!(svg.contains("Image unavailable"));
    }

    #[test]
    fn test_navigation_prefers_cached_root() {
        let root = Response::new(200, "<html>home</html>");
        assert_eq!(offline_response(RequestClass::Other, Some(root.clone())), root);

        let resp = offline_response(RequestClass::Other, None);
        assert_eq!((resp.status, resp.text().as_str()), (503, "Offline"));
    }
}
