//! # Gateway Monitor
//!
//! Metrics context for one gateway. It is constructed explicitly and handed
//! to every component that reports, so two gateways in the same process
//! keep separate counters. All metrics live in a dedicated
//! [`prometheus::Registry`].

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

pub struct GatewayMonitor {
    gateway_id: String,
    registry: Registry,
    running: AtomicBool,
    pub sessions_started: IntCounter,
    pub sessions_completed: IntCounter,
    pub sessions_failed: IntCounter,
    pub retries: IntCounter,
    pub rollbacks: IntCounter,
    pub roll_forwards: IntCounter,
    pub recoveries: IntCounter,
    pub active_sessions: IntGauge,
    /// Messages handled, by direction (`sent`/`received`) and message type.
    pub messages: IntCounterVec,
    pub transfer_latency_seconds: Histogram,
}

impl GatewayMonitor {
    pub fn new(gateway_id: impl Into<String>) -> Result<Self, prometheus::Error> {
        let gateway_id = gateway_id.into();
        let mut labels = HashMap::new();
        labels.insert("gateway".to_string(), gateway_id.clone());
        let registry = Registry::new_custom(Some("satp".into()), Some(labels))?;

        let sessions_started =
            IntCounter::new("sessions_started_total", "Transfers started as client")?;
        let sessions_completed =
            IntCounter::new("sessions_completed_total", "Transfers that reached completion")?;
        let sessions_failed =
            IntCounter::new("sessions_failed_total", "Transfers that exhausted their retries")?;
        let retries = IntCounter::new("retries_total", "Retried protocol steps")?;
        let rollbacks = IntCounter::new("rollbacks_total", "Sessions rolled back by recovery")?;
        let roll_forwards =
            IntCounter::new("roll_forwards_total", "Sessions completed by recovery")?;
        let recoveries =
            IntCounter::new("recoveries_total", "Sessions taken over by the crash manager")?;
        let active_sessions = IntGauge::new("active_sessions", "Sessions in the active map")?;
        let messages = IntCounterVec::new(
            Opts::new("messages_total", "Gateway messages by direction and type"),
            &["direction", "message_type"],
        )?;
        let transfer_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "transfer_latency_seconds",
                "Client-side end-to-end transfer latency in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;

        registry.register(Box::new(sessions_started.clone()))?;
        registry.register(Box::new(sessions_completed.clone()))?;
        registry.register(Box::new(sessions_failed.clone()))?;
        registry.register(Box::new(retries.clone()))?;
        registry.register(Box::new(rollbacks.clone()))?;
        registry.register(Box::new(roll_forwards.clone()))?;
        registry.register(Box::new(recoveries.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(messages.clone()))?;
        registry.register(Box::new(transfer_latency_seconds.clone()))?;

        Ok(Self {
            gateway_id,
            registry,
            running: AtomicBool::new(false),
            sessions_started,
            sessions_completed,
            sessions_failed,
            retries,
            rollbacks,
            roll_forwards,
            recoveries,
            active_sessions,
            messages,
            transfer_latency_seconds,
        })
    }

    /// Mark the monitor live. Idempotent.
    pub fn init(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!(gateway = %self.gateway_id, "monitor started");
        }
    }

    /// Mark the monitor stopped. Metrics stay readable. Idempotent.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(gateway = %self.gateway_id, "monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_message(&self, direction: &str, message_type: impl std::fmt::Display) {
        let message_type = message_type.to_string();
        self.messages
            .with_label_values(&[direction, message_type.as_str()])
            .inc();
    }

    /// Prometheus text exposition of every metric.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl std::fmt::Debug for GatewayMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMonitor")
            .field("gateway_id", &self.gateway_id)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_is_idempotent() {
        let m = GatewayMonitor::new("gw-a").unwrap();
        assert!(!m.is_running());
        m.init();
        m.init();
        assert!(m.is_running());
        m.shutdown();
        m.shutdown();
        assert!(!m.is_running());
    }

    #[test]
    fn two_monitors_do_not_share_counters() {
        let a = GatewayMonitor::new("gw-a").unwrap();
        let b = GatewayMonitor::new("gw-b").unwrap();
        a.sessions_started.inc();
        assert_eq!(a.sessions_started.get(), 1);
        assert_eq!(b.sessions_started.get(), 0);
    }

    #[test]
    fn encode_includes_prefixed_names_and_gateway_label() {
        let m = GatewayMonitor::new("gw-a").unwrap();
        m.retries.inc();
        m.record_message("sent", "lock-assertion-request");
        let text = m.encode().unwrap();
        assert!(text.contains("satp_retries_total"));
        assert!(text.contains("gateway=\"gw-a\""));
        assert!(text.contains("lock-assertion-request"));
    }
}
