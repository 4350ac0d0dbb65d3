//! Route normalization for rate limit bucketing.

use reqwest::Method;

/// A normalized request route.
///
/// Numeric path segments become `:id` so every request to the same
/// logical endpoint shares one key, and the segment following a webhook
/// id becomes `:token`. The first id after a `channels`, `guilds`,
/// `webhooks` or `interactions` segment is kept aside as the major
/// parameter: rate limit buckets are shared across routes with the same
/// server bucket id, but never across major parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    key: String,
    major: String,
}

const MAJOR_PREFIXES: [&str; 4] = ["channels", "guilds", "webhooks", "interactions"];

impl Route {
    /// Normalize a method plus path (query strings and fragments are
    /// ignored).
    pub fn new(method: &Method, path: &str) -> Self {
        let path = path
            .split(|c| c == '?' || c == '#')
            .next()
            .unwrap_or_default();

        let mut key = String::with_capacity(path.len() + 8);
        key.push_str(method.as_str());
        key.push(' ');

        let mut major = None;
        let mut prev_segment = "";
        let mut prev_was_webhook_id = false;

        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            key.push('/');

            let is_id = segment.bytes().all(|b| b.is_ascii_digit());

            if is_id {
                if major.is_none() && MAJOR_PREFIXES.contains(&prev_segment) {
                    major = Some(format!("{prev_segment}/{segment}"));
                }
                key.push_str(":id");
            } else if prev_was_webhook_id {
                key.push_str(":token");
            } else {
                key.push_str(segment);
            }

            prev_was_webhook_id = is_id && prev_segment == "webhooks";
            prev_segment = segment;
        }

        Self {
            key,
            major: major.unwrap_or_else(|| "global".to_string()),
        }
    }

    /// The normalized `METHOD /path` key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The major parameter, `global` when the route has none.
    pub fn major(&self) -> &str {
        &self.major
    }

    /// Whether this is an interaction callback route, which is exempt
    /// from auth and from the client-side global request guard.
    pub fn is_interaction(&self) -> bool {
        self.major.starts_with("interactions/")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ids_collapse_to_placeholder() {
        let route = Route::new(&Method::GET, "/channels/123/messages/456");

        assert_eq!(route.key(), "GET /channels/:id/messages/:id");
        assert_eq!(route.major(), "channels/123");
    }

    #[test]
    fn test_method_distinguishes_routes() {
        let get = Route::new(&Method::GET, "/channels/123/messages");
        let post = Route::new(&Method::POST, "/channels/123/messages");

        assert_ne!(get.key(), post.key());
    }

    #[test]
    fn test_major_parameter_differs_per_resource() {
        let first = Route::new(&Method::GET, "/guilds/1/roles");
        let second = Route::new(&Method::GET, "/guilds/2/roles");

        assert_eq!(first.key(), second.key());
        assert_ne!(first.major(), second.major());
    }

    #[test]
    fn test_webhook_token_is_masked() {
        let route = Route::new(&Method::POST, "/webhooks/123/aBcD-token");

        assert_eq!(route.key(), "POST /webhooks/:id/:token");
        assert_eq!(route.major(), "webhooks/123");
    }

    #[test]
    fn test_route_without_major_is_global() {
        let route = Route::new(&Method::GET, "/gateway/bot");

        assert_eq!(route.key(), "GET /gateway/bot");
        assert_eq!(route.major(), "global");
    }

    #[test]
    fn test_query_string_is_ignored() {
        let with = Route::new(&Method::GET, "/channels/9/messages?limit=100");
        let without = Route::new(&Method::GET, "/channels/9/messages");

        assert_eq!(with, without);
    }

    #[test]
    fn test_interaction_routes_are_flagged() {
        let route = Route::new(&Method::POST, "/interactions/55/some-token/callback");

        assert!(route.is_interaction());
        assert!(!Route::new(&Method::GET, "/gateway/bot").is_interaction());
    }
}
