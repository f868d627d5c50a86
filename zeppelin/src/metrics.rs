use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use log::{error, info};
use prometheus::{Encoder, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder};

/// Every counter the service exposes. Counters are registered once at startup
/// and shared across pipelines; the underlying atomics make `inc` safe from
/// any thread.
pub struct Metrics {
    registry: Registry,
    pub version: IntGaugeVec,
    pub rx_message_total: IntCounter,
    pub rx_message_over_size: IntCounter,
    pub rx_message_discarded: IntCounter,
    pub rx_message_error: IntCounter,
    pub rx_message_valid: IntCounter,
    pub rx_message_invalid: IntCounter,
    pub tx_message_total: IntCounter,
    pub throttle_total: IntCounter,
    pub rx_zigbee_message_total: IntCounter,
    pub rx_egauge_message_total: IntCounter,
    pub rx_c2d_message_total: IntCounter,
    pub rx_gdp_message_total: IntCounter,
    pub rx_ibr_message_total: IntCounter,
    pub rx_rci_message_total: IntCounter,
    pub tx_cmd_message_total: IntCounter,
    pub rx_cmd_message_total: IntCounter,
    pub rx_generic_message_total: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::new(format!("zeppelin_{name}"), help.to_owned())
        .with_context(|| format!("invalid counter {name}"))?;
    registry
        .register(Box::new(counter.clone()))
        .with_context(|| format!("unable to register counter {name}"))?;
    Ok(counter)
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let version = IntGaugeVec::new(
            Opts::new("zeppelin_version", "Zeppelin version information"),
            &["version", "version_date", "module"],
        )
        .context("invalid version gauge")?;
        registry
            .register(Box::new(version.clone()))
            .context("unable to register version gauge")?;

        Ok(Metrics {
            rx_message_total: counter(
                &registry,
                "rx_message_total",
                "Total received message from Broker",
            )?,
            rx_message_over_size: counter(
                &registry,
                "rx_message_over_size",
                "Total received message with payload size exceeding maximum size from Broker",
            )?,
            rx_message_discarded: counter(
                &registry,
                "rx_message_discarded",
                "Total received message discarded from Broker",
            )?,
            rx_message_error: counter(
                &registry,
                "rx_message_error",
                "Total received message with processing error from Broker",
            )?,
            rx_message_valid: counter(
                &registry,
                "rx_message_valid",
                "Total received message valid from Broker",
            )?,
            rx_message_invalid: counter(
                &registry,
                "rx_message_invalid",
                "Total received message invalid from Broker",
            )?,
            tx_message_total: counter(&registry, "tx_message_total", "Total sent message to Broker")?,
            throttle_total: counter(
                &registry,
                "throttle_total",
                "Total throttle applied to received message from Broker",
            )?,
            rx_zigbee_message_total: counter(
                &registry,
                "rx_zigbee_message_total",
                "Total Zigbee received message from Broker",
            )?,
            rx_egauge_message_total: counter(
                &registry,
                "rx_egauge_message_total",
                "Total eGauge received message from Broker",
            )?,
            rx_c2d_message_total: counter(
                &registry,
                "rx_c2d_message_total",
                "Total Cloud to Device received message from Broker",
            )?,
            rx_gdp_message_total: counter(
                &registry,
                "rx_gdp_message_total",
                "Total GDP received message from Broker",
            )?,
            rx_ibr_message_total: counter(
                &registry,
                "rx_ibr_message_total",
                "Total IBR received message from Broker",
            )?,
            rx_rci_message_total: counter(
                &registry,
                "rx_rci_message_total",
                "Total RCI received message from Broker",
            )?,
            tx_cmd_message_total: counter(
                &registry,
                "tx_cmd_message_total",
                "Total Cloud to Edge (direct method) transmitted message",
            )?,
            rx_cmd_message_total: counter(
                &registry,
                "rx_cmd_message_total",
                "Total Cloud to Edge (direct method) received message",
            )?,
            rx_generic_message_total: counter(
                &registry,
                "rx_generic_message_total",
                "Total generic received message from Broker",
            )?,
            version,
            registry,
        })
    }

    pub fn set_version(&self, version: &str, version_date: &str, module: &str) {
        self.version
            .with_label_values(&[version, version_date, module])
            .set(1);
    }

    /// Prometheus text exposition of everything registered.
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            error!("unable to encode metrics: {e}");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Start the scrape endpoint (`GET /`) on its own thread. The bind happens
/// before this returns so a busy port fails startup instead of surfacing
/// later as an unreachable endpoint.
pub fn serve(metrics: Arc<Metrics>, port: u16) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Unable to build metrics runtime")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = runtime
        .block_on(tokio::net::TcpListener::bind(addr))
        .with_context(|| format!("unable to bind metrics endpoint on {addr}"))?;

    let app = Router::new().route(
        "/",
        get(move || {
            let metrics = metrics.clone();
            async move { metrics.encode() }
        }),
    );

    thread::Builder::new()
        .name("metrics endpoint".into())
        .spawn(move || {
            info!("metrics endpoint listening on {addr}");
            if let Err(e) = runtime.block_on(axum::serve(listener, app).into_future()) {
                error!("metrics endpoint stopped: {e}");
            }
        })
        .context("Unable to spawn metrics thread")?;

    Ok(())
}
