//! Minimal Telegram Bot API client: `sendMessage` only.

use std::{fmt, time::Duration};

use log::warn;
use reqwest::{StatusCode, blocking::Client};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::RoutingTarget;

pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

/// Body of a `sendMessage` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendMessageRequest {
    pub chat_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_thread_id: Option<u64>,
    pub text: String,
    pub disable_notification: bool,
}

impl SendMessageRequest {
    pub fn new(target: &RoutingTarget, text: impl Into<String>) -> Self {
        Self {
            chat_id: target.chat_id,
            message_thread_id: target.thread_id,
            text: text.into(),
            disable_notification: target.is_silent(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    error_code: Option<u16>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

/// A failed `sendMessage` call, classified by whether repeating it can help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by Telegram: {description}")]
    RateLimited {
        description: String,
        retry_after: Option<u64>,
    },

    #[error("Telegram server error {code}: {description}")]
    Server { code: u16, description: String },

    #[error("rejected by Telegram {code}: {description}")]
    Rejected { code: u16, description: String },
}

impl ApiError {
    /// Map a Bot API error code (or bare HTTP status) to a variant.
    pub fn from_code(code: u16, description: impl Into<String>, retry_after: Option<u64>) -> Self {
        let description = description.into();
        match code {
            429 => ApiError::RateLimited {
                description,
                retry_after,
            },
            code if code >= 500 => ApiError::Server { code, description },
            _ => ApiError::Rejected { code, description },
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ApiError::Rejected { .. })
    }

    /// Server-requested wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited {
                retry_after: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        // the request URL carries the bot token
        ApiError::Network(err.without_url().to_string())
    }
}

/// The one Bot API call the relay needs. Implemented by [`TelegramApi`] and, for tests,
/// by any `Fn(&SendMessageRequest) -> Result<(), ApiError>`.
pub trait SendMessage: Send + Sync {
    fn send_message(&self, request: &SendMessageRequest) -> Result<(), ApiError>;
}

impl<F> SendMessage for F
where
    F: Fn(&SendMessageRequest) -> Result<(), ApiError> + Send + Sync,
{
    fn send_message(&self, request: &SendMessageRequest) -> Result<(), ApiError> {
        self(request)
    }
}

pub struct TelegramApi {
    client: Client,
    api_url: String,
    token: String,
}

impl TelegramApi {
    pub fn new(api_url: &str, token: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_owned(),
            token: token.to_owned(),
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.token, method)
    }
}

impl fmt::Debug for TelegramApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramApi")
            .field("api_url", &self.api_url)
            .field("token", &"***")
            .finish()
    }
}

impl SendMessage for TelegramApi {
    fn send_message(&self, request: &SendMessageRequest) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.endpoint("sendMessage"))
            .json(request)
            .send()?;

        let status = response.status();
        match response.json::<ApiResponse>() {
            Ok(ApiResponse { ok: true, .. }) if status.is_success() => Ok(()),
            Ok(body) => Err(ApiError::from_code(
                body.error_code.unwrap_or(status.as_u16()),
                body.description.unwrap_or_else(|| reason(status)),
                body.parameters.and_then(|p| p.retry_after),
            )),
            // a 2xx status means Telegram accepted the message
            Err(err) if status.is_success() => {
                warn!(
                    "[smtp2tg] Unreadable Telegram reply to a successful send: {}",
                    err.without_url()
                );
                Ok(())
            }
            Err(_) => Err(ApiError::from_code(status.as_u16(), reason(status), None)),
        }
    }
}

fn reason(status: StatusCode) -> String {
    status
        .canonical_reason()
        .unwrap_or("unknown status")
        .to_owned()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::address::Flag;

    const TOKEN: &str = "123456:TEST";

    fn api(url: &str) -> TelegramApi {
        TelegramApi::new(url, TOKEN, Duration::from_secs(5)).unwrap()
    }

    fn request() -> SendMessageRequest {
        let target = RoutingTarget::new(-100999)
            .with_thread(7)
            .with_flag(Flag::Silent);
        SendMessageRequest::new(&target, "hello")
    }

    #[test]
    fn test_request_serialization() {
        let value = serde_json::to_value(request()).unwrap();
        assert_eq!(
            value,
            json!({
                "chat_id": -100999,
                "message_thread_id": 7,
                "text": "hello",
                "disable_notification": true,
            })
        );

        let plain = SendMessageRequest::new(&RoutingTarget::new(5), "x");
        let value = serde_json::to_value(plain).unwrap();
        assert!(value.get("message_thread_id").is_none());
        assert_eq!(value["disable_notification"], json!(false));
    }

    #[test]
    fn test_classification() {
        assert!(ApiError::from_code(429, "Too Many Requests", Some(3)).is_retryable());
        assert!(ApiError::from_code(502, "Bad Gateway", None).is_retryable());
        assert!(ApiError::Network("refused".into()).is_retryable());
        assert!(!ApiError::from_code(400, "Bad Request: chat not found", None).is_retryable());
        assert!(!ApiError::from_code(403, "Forbidden: bot was blocked by the user", None)
            .is_retryable());
        assert_eq!(
            ApiError::from_code(429, "", Some(3)).retry_after(),
            Some(Duration::from_secs(3))
        );
        assert_eq!(ApiError::from_code(500, "", None).retry_after(), None);
    }

    #[test]
    fn test_send_success() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", format!("/bot{TOKEN}/sendMessage").as_str())
            .match_body(mockito::Matcher::Json(json!({
                "chat_id": -100999,
                "message_thread_id": 7,
                "text": "hello",
                "disable_notification": true,
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true,"result":{"message_id":1}}"#)
            .create();

        assert_eq!(api(&server.url()).send_message(&request()), Ok(()));
        mock.assert();
    }

    #[test]
    fn test_send_success_with_unreadable_body() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", format!("/bot{TOKEN}/sendMessage").as_str())
            .with_status(200)
            .with_body("<html>ok</html>")
            .expect(1)
            .create();

        assert_eq!(api(&server.url()).send_message(&request()), Ok(()));
        mock.assert();
    }

    #[test]
    fn test_send_rate_limited() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", format!("/bot{TOKEN}/sendMessage").as_str())
            .with_status(429)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 2","parameters":{"retry_after":2}}"#,
            )
            .create();

        let err = api(&server.url()).send_message(&request()).unwrap_err();
        assert_eq!(
            err,
            ApiError::RateLimited {
                description: "Too Many Requests: retry after 2".to_owned(),
                retry_after: Some(2),
            }
        );
    }

    #[test]
    fn test_send_chat_not_found() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", format!("/bot{TOKEN}/sendMessage").as_str())
            .with_status(400)
            .with_body(r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#)
            .create();

        let err = api(&server.url()).send_message(&request()).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("chat not found"));
    }

    #[test]
    fn test_send_server_error_without_json() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", format!("/bot{TOKEN}/sendMessage").as_str())
            .with_status(502)
            .with_body("<html>bad gateway</html>")
            .create();

        let err = api(&server.url()).send_message(&request()).unwrap_err();
        assert!(matches!(err, ApiError::Server { code: 502, .. }));
    }

    #[test]
    fn test_network_error_hides_token() {
        // nothing listens on port 9 of the loopback in test environments
        let api = TelegramApi::new("http://127.0.0.1:9", TOKEN, Duration::from_secs(2)).unwrap();
        let err = api.send_message(&request()).unwrap_err();
        assert!(err.is_retryable());
        assert!(!err.to_string().contains(TOKEN));
        assert!(!format!("{api:?}").contains(TOKEN));
    }
}
