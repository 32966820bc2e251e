// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! API middleware: CORS and the optional shared-secret check.

use axum::extract::{Request, State};
use axum::http::{header, HeaderName, Method};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::api::error::ApiError;
use crate::dispatch::Dispatcher;

/// Header carrying the shared secret.
pub const API_KEY_HEADER: &str = "x-api-key";

/// CORS layer allowing any origin, as the farm UI may be served from
/// anywhere on the network.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(API_KEY_HEADER),
        ])
}

/// Reject requests without the configured shared secret. A no-op when no
/// key is configured.
pub async fn require_api_key(
    State(dispatcher): State<Arc<Dispatcher>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = &dispatcher.config().api_key {
        let provided = request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return Err(ApiError::Unauthorized("invalid or missing API key".into()));
        }
    }

    Ok(next.run(request).await)
}
