use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use owo_colors::OwoColorize;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;

lazy_static::lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

/// Counters and histograms emitted by one reconciler instance.
#[derive(Clone)]
pub struct ControllerMetrics {
    pub ticks_total: IntCounter,
    pub tick_errors_total: IntCounterVec,
    pub nodes_in_flight: IntGauge,
    pub phase_duration_seconds: Histogram,
}

impl ControllerMetrics {
    pub fn new(subsystem: &str) -> Self {
        let ticks_total = IntCounter::with_opts(
            Opts::new("reboot_coordinator_ticks_total", "Reconciler ticks completed").subsystem(subsystem),
        )
        .unwrap();
        let tick_errors_total = IntCounterVec::new(
            Opts::new("reboot_coordinator_tick_errors_total", "Reconciler ticks that aborted early")
                .subsystem(subsystem),
            &["phase"],
        )
        .unwrap();
        let nodes_in_flight = IntGauge::with_opts(
            Opts::new("reboot_coordinator_nodes_in_flight", "Nodes counted against maxRebootingNodes")
                .subsystem(subsystem),
        )
        .unwrap();
        let phase_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("reboot_coordinator_phase_duration_seconds", "Per-phase wall time")
                .subsystem(subsystem),
        )
        .unwrap();

        REGISTRY.register(Box::new(ticks_total.clone())).ok();
        REGISTRY.register(Box::new(tick_errors_total.clone())).ok();
        REGISTRY.register(Box::new(nodes_in_flight.clone())).ok();
        REGISTRY.register(Box::new(phase_duration_seconds.clone())).ok();

        ControllerMetrics {
            ticks_total,
            tick_errors_total,
            nodes_in_flight,
            phase_duration_seconds,
        }
    }
}

async fn serve_metrics(_req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer).unwrap();
    Ok(Response::new(Full::new(Bytes::from(buffer))))
}

/// Spawns a background `/metrics` HTTP endpoint if `METRICS_PORT` is set.
pub fn maybe_spawn_metrics_server() {
    let Some(port) = std::env::var("METRICS_PORT").ok().and_then(|s| s.parse::<u16>().ok()) else {
        return;
    };
    tokio::spawn(run_metrics_server(port));
}

async fn run_metrics_server(port: u16) {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("{}", format!("failed to bind metrics server to {addr}: {e}").red());
            return;
        }
    };
    println!("{}", format!("📈 metrics server listening on {addr}").green());
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                eprintln!("{}", format!("metrics server accept failed: {e}").red());
                continue;
            }
        };
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            if let Err(e) = ConnBuilder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection(io, service_fn(serve_metrics))
                .await
            {
                eprintln!("{}", format!("metrics connection error: {e}").red());
            }
        });
    }
}
