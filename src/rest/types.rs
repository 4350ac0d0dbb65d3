//! REST response types the network runtime itself consumes.

use serde::Deserialize;

use crate::gateway::SessionStartLimit;

fn one() -> u32 {
    1
}

/// data for `GET /gateway`
#[derive(Debug, Clone, Deserialize)]
pub struct Gateway {
    /// websocket url to connect
    pub url: String,
}

/// data for `GET /gateway/bot`
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBot {
    /// websocket url to connect
    pub url: String,
    /// recommended shard count
    #[serde(default = "one")]
    pub shards: u32,
    /// identify budget for this bot
    pub session_start_limit: SessionStartLimitData,
}

/// the `session_start_limit` object of `GET /gateway/bot`
#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartLimitData {
    /// identifies allowed per window
    pub total: u32,
    /// identifies left in the current window
    pub remaining: u32,
    /// milliseconds until the window resets
    pub reset_after: u64,
    /// number of identify concurrency buckets
    #[serde(default = "one")]
    pub max_concurrency: u32,
}

impl From<SessionStartLimitData> for SessionStartLimit {
    fn from(data: SessionStartLimitData) -> Self {
        Self {
            total: data.total,
            remaining: data.remaining,
            reset_after: std::time::Duration::from_millis(data.reset_after),
            max_concurrency: data.max_concurrency,
        }
    }
}

/// error body returned with 4xx/5xx responses
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiErrorBody {
    /// platform error code, zero when absent
    #[serde(default)]
    pub code: i64,
    /// error message
    #[serde(default)]
    pub message: String,
    /// raw per-field validation errors, when present
    #[serde(default)]
    pub errors: Option<serde_json::Value>,
}

/// body of a 429 response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitBody {
    /// error message
    #[serde(default)]
    pub message: String,
    /// seconds to wait before retrying
    #[serde(default)]
    pub retry_after: f64,
    /// whether the global limit was hit
    #[serde(default)]
    pub global: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_gateway_bot() {
        let body = serde_json::json!({
            "url": "wss://gateway.discord.gg",
            "shards": 2,
            "session_start_limit": {
                "total": 1000,
                "remaining": 997,
                "reset_after": 14_400_000u64,
                "max_concurrency": 1,
            },
        });

        let info: GatewayBot = serde_json::from_value(body).unwrap();

        assert_eq!(info.url, "wss://gateway.discord.gg");
        assert_eq!(info.shards, 2);
        assert_eq!(info.session_start_limit.remaining, 997);

        let limit = SessionStartLimit::from(info.session_start_limit);
        assert_eq!(limit.reset_after, std::time::Duration::from_secs(14_400));
    }

    #[test]
    fn test_parse_rate_limit_body_defaults() {
        let body: RateLimitBody = serde_json::from_str("{}").unwrap();

        assert_eq!(body.retry_after, 0.0);
        assert!(!body.global);
    }

    #[test]
    fn test_parse_error_body() {
        let body: ApiErrorBody =
            serde_json::from_str(r#"{"code": 10003, "message": "Unknown Channel"}"#).unwrap();

        assert_eq!(body.code, 10003);
        assert_eq!(body.message, "Unknown Channel");
        assert!(body.errors.is_none());
    }
}
