use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use relay_protocol::{error_codes, HttpErrorEnvelope};
use std::fmt::Display;

pub type HttpResponse = Response;

pub(crate) fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> HttpResponse {
    (
        status,
        Json(HttpErrorEnvelope {
            code: code.into(),
            message: message.into(),
            details: None,
        }),
    )
        .into_response()
}

pub fn unauthenticated(message: impl Into<String>) -> HttpResponse {
    json_error(
        StatusCode::UNAUTHORIZED,
        error_codes::UNAUTHENTICATED,
        message,
    )
}

pub fn client_not_found(client_id: &str) -> HttpResponse {
    json_error(
        StatusCode::NOT_FOUND,
        error_codes::CLIENT_NOT_FOUND,
        format!("no connected client with id {client_id}"),
    )
}

pub fn bad_request(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::BAD_REQUEST, error_codes::BAD_REQUEST, message)
}

pub fn send_failed(hint: impl Into<String>) -> HttpResponse {
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        error_codes::SEND_FAILED,
        hint,
    )
}

pub fn request_timeout(kind: &str) -> HttpResponse {
    json_error(
        StatusCode::GATEWAY_TIMEOUT,
        error_codes::REQUEST_TIMEOUT,
        format!("{kind} request timed out"),
    )
}

pub fn client_disconnected(request_id: &str) -> HttpResponse {
    json_error(
        StatusCode::BAD_GATEWAY,
        error_codes::CLIENT_DISCONNECTED,
        format!("client disconnected before answering request {request_id}"),
    )
}

pub fn internal_error(err: impl Display) -> HttpResponse {
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        error_codes::INTERNAL_ERROR,
        err.to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn assert_error_response(
        response: Response,
        expected_status: StatusCode,
        expected_code: &str,
        expected_fragment: &str,
    ) {
        assert_eq!(response.status(), expected_status);

        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        let parsed: HttpErrorEnvelope =
            serde_json::from_slice(&body).expect("response body should be valid error json");

        assert_eq!(parsed.code, expected_code);
        assert!(
            parsed.message.contains(expected_fragment),
            "message {:?} should contain {:?}",
            parsed.message,
            expected_fragment
        );
        assert_eq!(parsed.details, None);
    }

    #[tokio::test]
    async fn error_body_places_the_message_under_the_error_key() {
        let response = request_timeout("search");
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let raw: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(raw["error"], "search request timed out");
        assert_eq!(raw["code"], "REQUEST_TIMEOUT");
    }

    #[tokio::test]
    async fn unauthenticated_maps_to_401() {
        assert_error_response(
            unauthenticated("unknown api key"),
            StatusCode::UNAUTHORIZED,
            "UNAUTHENTICATED",
            "unknown api key",
        )
        .await;
    }

    #[tokio::test]
    async fn client_not_found_maps_to_404_and_names_the_client() {
        assert_error_response(
            client_not_found("foundry-A"),
            StatusCode::NOT_FOUND,
            "CLIENT_NOT_FOUND",
            "foundry-A",
        )
        .await;
    }

    #[tokio::test]
    async fn bad_request_maps_to_400() {
        assert_error_response(
            bad_request("missing clientId"),
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            "missing clientId",
        )
        .await;
    }

    #[tokio::test]
    async fn send_failed_maps_to_500_with_a_hint() {
        assert_error_response(
            send_failed("outbound queue is full"),
            StatusCode::INTERNAL_SERVER_ERROR,
            "SEND_FAILED",
            "queue",
        )
        .await;
    }

    #[tokio::test]
    async fn request_timeout_maps_to_504_with_the_kind() {
        assert_error_response(
            request_timeout("entity"),
            StatusCode::GATEWAY_TIMEOUT,
            "REQUEST_TIMEOUT",
            "entity",
        )
        .await;
    }

    #[tokio::test]
    async fn client_disconnected_maps_to_502_with_the_request_id() {
        assert_error_response(
            client_disconnected("search_1712000000000_a1b2"),
            StatusCode::BAD_GATEWAY,
            "CLIENT_DISCONNECTED",
            "search_1712000000000_a1b2",
        )
        .await;
    }

    #[tokio::test]
    async fn internal_error_maps_to_500() {
        assert_error_response(
            internal_error("correlation sink dropped"),
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            "sink",
        )
        .await;
    }
}
