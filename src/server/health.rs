//! Liveness endpoint.
//!
//! Returns 200 "pong" if the server is running. Database reachability is
//! a separate concern, surfaced through the store's health probe at
//! startup; this endpoint is for load balancers and orchestration
//! systems that only need to know the process accepts connections.

use axum::http::StatusCode;

/// Ping handler.
///
/// # Example
///
/// ```ignore
/// GET /ping HTTP/1.1
///
/// HTTP/1.1 200 OK
/// Content-Type: text/plain
///
/// pong
/// ```
pub async fn ping_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "pong")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_returns_200_pong() {
        let (status, body) = ping_handler().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "pong");
    }
}
