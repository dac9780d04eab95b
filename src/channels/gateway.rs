//! HTTP messaging gateway channel.
//!
//! Talks to a WhatsApp-style REST gateway:
//! `POST {base}/message/sendText/{instance}` with an `apikey` header.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde_json::{Value, json};

use super::{DeliveryReceipt, OutboundChannel, SendOptions};
use crate::config::GatewayConfig;
use crate::error::ChannelError;

const CHANNEL_NAME: &str = "gateway";

pub struct HttpGateway {
    config: GatewayConfig,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn send_text_url(&self) -> String {
        format!(
            "{}/message/sendText/{}",
            self.config.base_url, self.config.instance
        )
    }

    async fn post_text(
        &self,
        recipient: &str,
        text: &str,
        opts: &SendOptions,
    ) -> Result<Option<String>, ChannelError> {
        let body = request_body(recipient, text, opts);

        let resp = self
            .client
            .post(self.send_text_url())
            .header("apikey", self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            let parsed: Value = resp.json().await.unwrap_or(Value::Null);
            return Ok(provider_id(&parsed));
        }

        let err_body = resp.text().await.unwrap_or_default();
        tracing::warn!(%status, recipient, "Gateway sendText failed");
        Err(classify_failure(status, recipient, &err_body))
    }
}

#[async_trait]
impl OutboundChannel for HttpGateway {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    fn max_message_len(&self) -> Option<usize> {
        Some(self.config.max_message_len)
    }

    async fn send(
        &self,
        recipient: &str,
        content: &str,
        opts: &SendOptions,
    ) -> Result<DeliveryReceipt, ChannelError> {
        let provider_ids = self
            .post_text(recipient, content, opts)
            .await?
            .into_iter()
            .collect();

        Ok(DeliveryReceipt {
            channel: CHANNEL_NAME.to_string(),
            recipient: recipient.to_string(),
            provider_ids,
            sent_at: Utc::now(),
        })
    }
}

fn request_body(recipient: &str, text: &str, opts: &SendOptions) -> Value {
    let mut body = json!({ "number": recipient, "text": text });
    if let Some(quoted) = &opts.quoted_message_id {
        body["quoted"] = json!({ "key": { "id": quoted } });
    }
    if let Some(delay) = opts.presence_delay {
        body["delay"] = json!(delay.as_millis() as u64);
    }
    body
}

fn provider_id(resp: &Value) -> Option<String> {
    resp.get("key")
        .and_then(|k| k.get("id"))
        .or_else(|| resp.get("id"))
        .or_else(|| resp.get("messageId"))
        .and_then(Value::as_str)
        .map(String::from)
}

fn classify_failure(status: StatusCode, recipient: &str, body: &str) -> ChannelError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ChannelError::RateLimited {
            name: CHANNEL_NAME.into(),
        },
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => ChannelError::InvalidRecipient {
            name: CHANNEL_NAME.into(),
            recipient: recipient.to_string(),
        },
        _ => ChannelError::SendFailed {
            name: CHANNEL_NAME.into(),
            reason: format!("HTTP {status}: {body}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn gateway() -> HttpGateway {
        HttpGateway::new(GatewayConfig {
            base_url: "https://gw.example.com".into(),
            instance: "sales".into(),
            api_key: "k".to_string().into(),
            max_message_len: 4000,
        })
    }

    #[test]
    fn reports_provider_length_limit() {
        assert_eq!(gateway().max_message_len(), Some(4000));
    }

    #[test]
    fn builds_send_text_url() {
        assert_eq!(
            gateway().send_text_url(),
            "https://gw.example.com/message/sendText/sales"
        );
    }

    #[test]
    fn body_includes_quote_and_delay() {
        let opts = SendOptions {
            quoted_message_id: Some("ABC".into()),
            presence_delay: Some(Duration::from_millis(1200)),
        };
        let body = request_body("5511", "hi", &opts);
        assert_eq!(body["number"], "5511");
        assert_eq!(body["quoted"]["key"]["id"], "ABC");
        assert_eq!(body["delay"], 1200);

        let plain = request_body("5511", "hi", &SendOptions::default());
        assert!(plain.get("quoted").is_none());
    }

    #[test]
    fn extracts_provider_id() {
        assert_eq!(
            provider_id(&json!({"key": {"id": "X1"}})).as_deref(),
            Some("X1")
        );
        assert_eq!(provider_id(&json!({"messageId": "X2"})).as_deref(), Some("X2"));
        assert_eq!(provider_id(&Value::Null), None);
    }

    #[test]
    fn classifies_failures() {
        assert!(matches!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, "1", ""),
            ChannelError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, "1", ""),
            ChannelError::InvalidRecipient { .. }
        ));
        assert!(!classify_failure(StatusCode::BAD_REQUEST, "1", "").is_transient());
        assert!(classify_failure(StatusCode::BAD_GATEWAY, "1", "").is_transient());
    }
}
