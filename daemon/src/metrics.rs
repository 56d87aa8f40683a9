//! Prometheus metrics

use crate::config::MonitoringConfig;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::LazyLock;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Global metrics registry
static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Global metrics; `None` only if the collectors could not be built
static METRICS: LazyLock<Option<Metrics>> = LazyLock::new(|| match Metrics::new() {
    Ok(metrics) => Some(metrics),
    Err(e) => {
        error!("Failed to create metrics: {}", e);
        None
    }
});

/// Metrics struct
pub struct Metrics {
    // Counters
    pub frames_sent: IntCounter,
    pub frames_received: IntCounter,
    pub frame_errors: IntCounter,
    pub sessions_opened: IntCounter,

    // Gauges
    pub active_connections: IntGauge,
    pub active_sessions: IntGauge,

    // Histograms
    pub frame_size: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let frames_sent = IntCounter::with_opts(Opts::new(
            "wsrelay_frames_sent_total",
            "Total number of frames sent to controllers",
        ))?;

        let frames_received = IntCounter::with_opts(Opts::new(
            "wsrelay_frames_received_total",
            "Total number of frames received from controllers",
        ))?;

        let frame_errors = IntCounter::with_opts(Opts::new(
            "wsrelay_frame_errors_total",
            "Total number of malformed or unknown frames dropped",
        ))?;

        let sessions_opened = IntCounter::with_opts(Opts::new(
            "wsrelay_sessions_opened_total",
            "Total number of socket sessions registered",
        ))?;

        let active_connections = IntGauge::with_opts(Opts::new(
            "wsrelay_active_connections",
            "Number of active controller connections",
        ))?;

        let active_sessions = IntGauge::with_opts(Opts::new(
            "wsrelay_active_sessions",
            "Number of registered socket sessions",
        ))?;

        let frame_size = Histogram::with_opts(
            HistogramOpts::new("wsrelay_frame_size_bytes", "Frame size in bytes")
                .buckets(vec![64.0, 256.0, 512.0, 1024.0, 4096.0, 16384.0, 65536.0]),
        )?;

        // Register metrics
        REGISTRY.register(Box::new(frames_sent.clone())).ok();
        REGISTRY.register(Box::new(frames_received.clone())).ok();
        REGISTRY.register(Box::new(frame_errors.clone())).ok();
        REGISTRY.register(Box::new(sessions_opened.clone())).ok();
        REGISTRY.register(Box::new(active_connections.clone())).ok();
        REGISTRY.register(Box::new(active_sessions.clone())).ok();
        REGISTRY.register(Box::new(frame_size.clone())).ok();

        Ok(Self {
            frames_sent,
            frames_received,
            frame_errors,
            sessions_opened,
            active_connections,
            active_sessions,
            frame_size,
        })
    }
}

/// Run `f` against the global metrics, if available
pub fn with<F: FnOnce(&Metrics)>(f: F) {
    if let Some(metrics) = METRICS.as_ref() {
        f(metrics);
    }
}

/// Render the registry in the Prometheus text format
pub fn render() -> Vec<u8> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    buffer
}

/// Start the metrics server
pub fn start_server(config: &MonitoringConfig) -> JoinHandle<()> {
    let bind = config.prometheus_bind;
    let enabled = config.prometheus_enabled;

    tokio::spawn(async move {
        if !enabled {
            info!("Prometheus metrics disabled");
            return;
        }

        use bytes::Bytes;
        use http_body_util::Full;
        use hyper::{Response, server::conn::http1, service::service_fn};
        use hyper_util::rt::TokioIo;

        let listener = match tokio::net::TcpListener::bind(bind).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind metrics server: {}", e);
                return;
            }
        };

        info!("Prometheus metrics server listening on {}", bind);

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    error!("Metrics accept error: {}", e);
                    continue;
                }
            };

            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|_req| async {
                    let mut response = Response::new(Full::new(Bytes::from(render())));
                    response.headers_mut().insert(
                        hyper::header::CONTENT_TYPE,
                        hyper::header::HeaderValue::from_static("text/plain"),
                    );
                    Ok::<_, std::convert::Infallible>(response)
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Metrics connection error: {}", e);
                }
            });
        }
    })
}
