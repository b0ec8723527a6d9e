//! Gateway bridge: mirror verified mesh traffic to external HTTP webhooks.
//!
//! Fan-out is fire-and-forget on spawned tasks so the mesh hot path never
//! waits on the WiFi side; every hook is tried independently and failures are
//! captured, counted and otherwise swallowed.

use std::time::Duration;

use metrics::counter;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// POST a serialized Zombiegram to every configured webhook.
pub fn propagate(client: Client, hooks: Vec<String>, document: Value) {
    for hook in hooks {
        let client = client.clone();
        let body = document.clone();
        tokio::spawn(async move {
            match client
                .post(&hook)
                .timeout(WEBHOOK_TIMEOUT)
                .json(&body)
                .send()
                .await
            {
                Ok(resp) => {
                    counter!("zg.bridge.ok", "status" => resp.status().as_u16().to_string())
                        .increment(1);
                    debug!(hook = %hook, status = resp.status().as_u16(), "propagated zombiegram to external hook");
                }
                Err(e) => {
                    counter!("zg.bridge.err").increment(1);
                    debug!(hook = %hook, error = %e, "external hook could not be contacted");
                }
            }
        });
    }
}
