//! Posts notifications as JSON to an HTTP endpoint.
//!
//! Payload:
//!
//! ```json
//! {"text": "<rendered message>", "listing": { … } | null}
//! ```

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::models::Listing;
use crate::services::Notifier;

#[derive(Debug, Serialize)]
struct Payload<'a> {
    text: &'a str,
    listing: Option<&'a Listing>,
}

pub struct WebhookNotifier {
    name: String,
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(name: impl Into<String>, url: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &str, listing: Option<&Listing>) -> Result<()> {
        let payload = Payload {
            text: message,
            listing,
        };
        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| AppError::notifier(&self.name, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let listing = Listing::new("immo", 5, "Flat", "https://x/5");
        let payload = Payload {
            text: "hello",
            listing: Some(&listing),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["text"], "hello");
        assert_eq!(json["listing"]["id"], 5);
        assert_eq!(json["listing"]["source_name"], "immo");

        let heartbeat = serde_json::to_value(Payload {
            text: "still searching",
            listing: None,
        })
        .unwrap();
        assert!(heartbeat["listing"].is_null());
    }
}
