//! Prometheus metrics for the reconcile loop, exposed over a small `hyper`
//! HTTP server when the `metrics` feature is enabled.

#[cfg(feature = "metrics")]
use http_body_util::Full;
#[cfg(feature = "metrics")]
use hyper::body::Bytes;
#[cfg(feature = "metrics")]
use hyper::{Request, Response, service::service_fn};
#[cfg(feature = "metrics")]
use hyper_util::rt::TokioIo;
#[cfg(feature = "metrics")]
use owo_colors::OwoColorize;
#[cfg(feature = "metrics")]
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use tokio::net::TcpListener;

#[cfg(feature = "metrics")]
pub struct ControllerMetrics {
    registry: Registry,
    pub reconcile_counter: IntCounterVec,
    pub action_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
}

#[cfg(feature = "metrics")]
impl ControllerMetrics {
    pub fn new(subsystem: &str) -> Self {
        let registry = Registry::new();

        let reconcile_counter = IntCounterVec::new(
            Opts::new("reconcile_total", "Total reconciliations per cluster").subsystem(subsystem),
            &["name", "namespace"],
        )
        .unwrap();

        let action_counter = IntCounterVec::new(
            Opts::new("action_total", "Reconcile actions taken per cluster").subsystem(subsystem),
            &["name", "namespace", "action"],
        )
        .unwrap();

        let read_histogram = HistogramVec::new(
            HistogramOpts::new("reconcile_seconds", "Time spent on one reconcile pass")
                .subsystem(subsystem),
            &["name", "namespace", "action"],
        )
        .unwrap();

        registry
            .register(Box::new(reconcile_counter.clone()))
            .unwrap();
        registry
            .register(Box::new(action_counter.clone()))
            .unwrap();
        registry
            .register(Box::new(read_histogram.clone()))
            .unwrap();

        ControllerMetrics {
            registry,
            reconcile_counter,
            action_counter,
            read_histogram,
        }
    }

    fn gather(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        buffer
    }
}

/// Serves `/metrics` on `port` until the process exits. Spawned once at
/// startup; a bind failure is fatal since it usually means the port is
/// already in use by another replica.
#[cfg(feature = "metrics")]
pub async fn serve(metrics: std::sync::Arc<ControllerMetrics>, port: u16) -> std::io::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    println!("{}", format!("📈 Metrics listening on {addr}").green());

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                let metrics = metrics.clone();
                async move {
                    let body = metrics.gather();
                    Ok::<_, std::convert::Infallible>(Response::new(Full::new(Bytes::from(body))))
                }
            });
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                eprintln!("metrics connection error: {err}");
            }
        });
    }
}
