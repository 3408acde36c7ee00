// CORS policy for the REST endpoints.
//
// Origins come from `ServerConfig::cors_origins`: `"*"` allows any origin
// without credentials, otherwise a comma-separated allow-list is used with
// credentials enabled.

use axum::http::{header, HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Build a [`CorsLayer`] from the configured origin list.
pub fn cors_layer(origins: &str) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, HeaderName::from_static("x-request-id")])
        .expose_headers([HeaderName::from_static("x-request-id")])
        .max_age(std::time::Duration::from_secs(3600));

    match origins.trim() {
        "*" | "" => base.allow_origin(AllowOrigin::any()),
        list => base.allow_origin(parse_origins(list)).allow_credentials(true),
    }
}

fn parse_origins(comma_separated: &str) -> Vec<HeaderValue> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| HeaderValue::from_str(s).ok())
        .collect()
}
