//! Throughput and latency statistics
//!
//! Totals grow for the life of the device. Latency is accumulated in a
//! sampling window that [`Statistics::fold`] turns into averages and clears.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use super::commands::CommandHandler;
use super::message::RpcBackPayload;

#[derive(Debug, Default, Clone, Copy)]
struct Window {
    inbound_count: u64,
    inbound_time: Duration,
    outbound_count: u64,
    outbound_time: Duration,
}

/// Counters and rolling averages for one device
#[derive(Debug, Clone)]
pub struct Statistics {
    started_at: DateTime<Utc>,
    refreshed_at: Option<DateTime<Utc>>,
    inbound_total: u64,
    outbound_total: u64,
    timeout_total: u64,
    inbound_avg_ms: u64,
    outbound_avg_ms: u64,
    window: Window,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            refreshed_at: None,
            inbound_total: 0,
            outbound_total: 0,
            timeout_total: 0,
            inbound_avg_ms: 0,
            outbound_avg_ms: 0,
            window: Window::default(),
        }
    }

    /// An inbound call finished after `elapsed` of handler time
    pub fn record_inbound(&mut self, elapsed: Duration) {
        self.inbound_total += 1;
        self.window.inbound_count += 1;
        self.window.inbound_time += elapsed;
    }

    /// An outbound call or message was sent
    pub fn record_sent(&mut self) {
        self.outbound_total += 1;
    }

    /// A reply arrived `latency` after its call was issued
    pub fn record_reply(&mut self, latency: Duration) {
        self.window.outbound_count += 1;
        self.window.outbound_time += latency;
    }

    /// A call gave up waiting for its reply
    pub fn record_timeout(&mut self) {
        self.timeout_total += 1;
    }

    /// Fold the sampling window into the averages and clear it
    pub fn fold(&mut self) {
        self.inbound_avg_ms = average_ms(self.window.inbound_time, self.window.inbound_count);
        self.outbound_avg_ms = average_ms(self.window.outbound_time, self.window.outbound_count);
        self.window = Window::default();
        self.refreshed_at = Some(Utc::now());
    }

    #[must_use]
    pub const fn inbound_total(&self) -> u64 {
        self.inbound_total
    }

    #[must_use]
    pub const fn outbound_total(&self) -> u64 {
        self.outbound_total
    }

    #[must_use]
    pub const fn timeout_total(&self) -> u64 {
        self.timeout_total
    }

    /// All counters by name
    #[must_use]
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("startedAt".into(), json!(self.started_at.to_rfc3339()));
        map.insert(
            "refreshedAt".into(),
            self.refreshed_at
                .map_or(Value::Null, |t| json!(t.to_rfc3339())),
        );
        map.insert("inboundTotal".into(), json!(self.inbound_total));
        map.insert("outboundTotal".into(), json!(self.outbound_total));
        map.insert("timeoutTotal".into(), json!(self.timeout_total));
        map.insert("inboundAvgMs".into(), json!(self.inbound_avg_ms));
        map.insert("outboundAvgMs".into(), json!(self.outbound_avg_ms));
        map
    }

    /// Counters filtered to `selector`, or all of them; unknown names are ignored
    #[must_use]
    pub fn status(&self, selector: Option<&[String]>) -> Map<String, Value> {
        let mut all = self.to_map();
        match selector {
            None => all,
            Some(names) => names
                .iter()
                .filter_map(|name| all.remove_entry(name.as_str()))
                .collect(),
        }
    }
}

/// `ceil(total / count)` in milliseconds, 0 for an empty window
fn average_ms(total: Duration, count: u64) -> u64 {
    if count == 0 {
        return 0;
    }
    let avg = total.as_micros().div_ceil(u128::from(count) * 1000);
    u64::try_from(avg).unwrap_or(u64::MAX)
}

/// Built-in `status` command
///
/// Parameters may be an array of counter names to select; anything else
/// returns every counter.
pub struct StatusCommand {
    stats: Arc<Mutex<Statistics>>,
}

impl StatusCommand {
    #[must_use]
    pub const fn new(stats: Arc<Mutex<Statistics>>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl CommandHandler for StatusCommand {
    async fn handle(&self, parameters: Value) -> RpcBackPayload {
        let selector: Option<Vec<String>> = parameters.as_array().map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        });
        let status = self
            .stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .status(selector.as_deref());
        RpcBackPayload::ok(Value::Object(status))
    }
}
