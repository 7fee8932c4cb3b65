//! Message handlers

use async_trait::async_trait;
use tracing::info;

/// Processes the body of one delivery.
///
/// An error is logged and counted by the runtime; the message is still
/// acknowledged once the handler returns.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery_tag: u64, body: &[u8]) -> anyhow::Result<()>;
}

/// Logs each message and does nothing else
pub struct NoopHandler {
    host: String,
}

impl NoopHandler {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

/// JSON bodies are logged as compact JSON, anything else as lossy UTF-8
pub(crate) fn render_body(body: &[u8]) -> String {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => value.to_string(),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

#[async_trait]
impl MessageHandler for NoopHandler {
    async fn handle(&self, delivery_tag: u64, body: &[u8]) -> anyhow::Result<()> {
        info!(
            host = %self.host,
            delivery_tag,
            body = %render_body(body),
            "Received message"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_json_body() {
        assert_eq!(render_body(br#"{ "job": 7 }"#), r#"{"job":7}"#);
    }

    #[test]
    fn test_render_non_json_body() {
        assert_eq!(render_body(b"plain text"), "plain text");
        assert_eq!(render_body(&[0x66, 0x6f, 0xff]), "fo\u{fffd}");
    }

    #[test]
    fn test_noop_handler_accepts_anything() {
        let handler = NoopHandler::new("worker-0");
        assert!(tokio_test::block_on(handler.handle(1, b"\x00\x01")).is_ok());
    }
}
