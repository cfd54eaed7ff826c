//! Fire-and-forget operator notifications.
//!
//! Delivery is best-effort by contract: a failed send is logged and
//! swallowed, never surfaced into the pipeline. Transport is a Telegram-style
//! `sendMessage` endpoint; anything that accepts the same form payload works.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::NotifierConfig;

pub struct Notifier {
    cfg: NotifierConfig,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(cfg: NotifierConfig) -> Self {
        Self {
            cfg,
            client: reqwest::Client::new(),
        }
    }

    /// Send one message; returns whether the HTTP round trip succeeded.
    pub async fn send(&self, text: &str) -> bool {
        if !self.cfg.enabled || self.cfg.bot_token.is_empty() {
            debug!(target: "autopatch::notify", text, "notifier disabled; message dropped");
            return false;
        }
        let url = format!(
            "{}/bot{}/sendMessage",
            self.cfg.api_base.trim_end_matches('/'),
            self.cfg.bot_token
        );
        let payload = [
            ("chat_id", self.cfg.chat_id.as_str()),
            ("text", text),
            ("parse_mode", "Markdown"),
        ];
        match self.client.post(&url).form(&payload).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(
                    target: "autopatch::notify",
                    status = %resp.status(),
                    "notification rejected by transport"
                );
                false
            }
            Err(e) => {
                warn!(target: "autopatch::notify", error = %e, "notification send failed");
                false
            }
        }
    }

    /// Detach the send so callers never wait on the transport.
    pub fn spawn_send(self: &Arc<Self>, text: String) {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            notifier.send(&text).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_notifier_drops_quietly() {
        let notifier = Notifier::new(NotifierConfig::default());
        assert!(!notifier.send("hello").await);
    }
}
