//! # Prometheus Metrics
//!
//! Counters and gauges for the router core, registered in a dedicated
//! [`prometheus::Registry`] with the `murk` prefix so an embedding process
//! can expose them next to its own without collisions.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Metric handles for one router. Cloning shares the underlying metrics.
#[derive(Clone)]
pub struct RouterMetrics {
    registry: Registry,
    pub ticks_total: IntCounter,
    /// Clock skews that forced every session closed.
    pub thaws_total: IntCounter,
    pub rc_regenerations_total: IntCounter,
    pub gossip_broadcasts_total: IntCounter,
    pub outbound_attempts_total: IntCounter,
    /// Sessions closed because the peer left the consensus lists.
    pub disallowed_sessions_closed_total: IntCounter,
    pub reachability_failures_total: IntCounter,
    pub known_routers: IntGauge,
    pub connected_routers: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let metric = IntCounter::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let metric = IntGauge::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl RouterMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("murk".into()), None)?;
        Ok(Self {
            ticks_total: counter(&registry, "ticks_total", "Router ticks executed")?,
            thaws_total: counter(
                &registry,
                "thaws_total",
                "Clock skews that closed all sessions",
            )?,
            rc_regenerations_total: counter(
                &registry,
                "rc_regenerations_total",
                "Times our RC was re-signed",
            )?,
            gossip_broadcasts_total: counter(
                &registry,
                "gossip_broadcasts_total",
                "RC gossip broadcasts sent",
            )?,
            outbound_attempts_total: counter(
                &registry,
                "outbound_attempts_total",
                "Outbound session attempts started",
            )?,
            disallowed_sessions_closed_total: counter(
                &registry,
                "disallowed_sessions_closed_total",
                "Relay sessions closed after the peer lost consensus",
            )?,
            reachability_failures_total: counter(
                &registry,
                "reachability_failures_total",
                "Failed reachability tests",
            )?,
            known_routers: gauge(&registry, "known_routers", "Contacts in the node db")?,
            connected_routers: gauge(
                &registry,
                "connected_routers",
                "Established sessions to relays",
            )?,
            registry,
        })
    }

    /// Encodes all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
