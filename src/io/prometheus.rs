//! Prometheus metrics HTTP endpoint
//!
//! Exposes tracking metrics in Prometheus text format at /metrics and a
//! liveness probe at /health. Uses hyper for the HTTP server.

use crate::infra::metrics::{
    CacheKind, Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS,
};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with service label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    service: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{service=\"{service}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    service: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{service=\"{service}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{service=\"{service}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{service=\"{service}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{service=\"{service}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, service_id: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_tracking_metrics(&mut output, service_id, &summary);
    write_evaluation_metrics(&mut output, service_id, &summary);
    write_notification_metrics(&mut output, service_id, &summary);
    write_cache_metrics(&mut output, service_id, &summary);

    output
}

fn write_tracking_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "tracking_samples_total",
        "Location samples received from the sensor",
        MetricType::Counter,
        service,
        summary.samples_total,
    );
    write_metric(
        output,
        "tracking_sensor_errors_total",
        "Sensor errors on an active watch",
        MetricType::Counter,
        service,
        summary.sensor_errors_total,
    );
}

fn write_evaluation_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "geofence_evaluations_issued_total",
        "Evaluation requests sent",
        MetricType::Counter,
        service,
        summary.evaluations_issued,
    );
    write_metric(
        output,
        "geofence_evaluations_applied_total",
        "Evaluation results applied to membership",
        MetricType::Counter,
        service,
        summary.evaluations_applied,
    );
    write_metric(
        output,
        "geofence_evaluations_failed_total",
        "Evaluation calls that failed",
        MetricType::Counter,
        service,
        summary.evaluations_failed,
    );
    write_metric(
        output,
        "geofence_evaluations_stale_total",
        "Evaluation responses discarded as superseded",
        MetricType::Counter,
        service,
        summary.evaluations_stale,
    );
    write_metric(
        output,
        "geofence_neighborhoods_entered_total",
        "Evaluations reporting entry into a new neighborhood",
        MetricType::Counter,
        service,
        summary.neighborhoods_entered,
    );
    write_histogram(
        output,
        "geofence_evaluation_latency_ms",
        "Evaluation round trip in milliseconds",
        service,
        &summary.eval_latency_buckets,
        summary.eval_latency_sum_ms,
    );
    write_metric(
        output,
        "geofence_evaluation_latency_p99_ms",
        "99th percentile evaluation round trip",
        MetricType::Gauge,
        service,
        summary.eval_latency_p99_ms,
    );
}

fn write_notification_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "notification_envelopes_scheduled_total",
        "Notification envelopes scheduled",
        MetricType::Counter,
        service,
        summary.envelopes_scheduled,
    );
    write_metric(
        output,
        "notification_envelopes_delivered_total",
        "Notification envelopes delivered",
        MetricType::Counter,
        service,
        summary.envelopes_delivered,
    );
    write_metric(
        output,
        "notification_envelopes_cancelled_total",
        "Notification envelopes cancelled before firing",
        MetricType::Counter,
        service,
        summary.envelopes_cancelled,
    );
    write_metric(
        output,
        "notification_user_events_dropped_total",
        "User events dropped due to a full channel",
        MetricType::Counter,
        service,
        summary.user_events_dropped,
    );
}

fn write_cache_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    let _ = writeln!(output, "# HELP cache_hits_total Cache hits by tier");
    let _ = writeln!(output, "# TYPE cache_hits_total counter");
    for kind in [CacheKind::Token, CacheKind::Geocode, CacheKind::Reverse] {
        let _ = writeln!(
            output,
            "cache_hits_total{{service=\"{service}\",cache=\"{}\"}} {}",
            kind.as_str(),
            summary.cache_hits_for(kind)
        );
    }
    let _ = writeln!(output, "# HELP cache_misses_total Cache misses by tier");
    let _ = writeln!(output, "# TYPE cache_misses_total counter");
    for kind in [CacheKind::Token, CacheKind::Geocode, CacheKind::Reverse] {
        let _ = writeln!(
            output,
            "cache_misses_total{{service=\"{service}\",cache=\"{}\"}} {}",
            kind.as_str(),
            summary.cache_misses_for(kind)
        );
    }
    write_metric(
        output,
        "token_fetch_failures_total",
        "Access token fetches that failed",
        MetricType::Counter,
        service,
        summary.token_fetch_failures,
    );
}

fn text_response(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    service_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => Ok(text_response(
            StatusCode::OK,
            PROMETHEUS_CONTENT_TYPE,
            format_prometheus_metrics(&metrics, &service_id),
        )),
        (&Method::GET, "/health") => {
            Ok(text_response(StatusCode::OK, "text/plain", "ok".to_string()))
        }
        _ => Ok(text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string())),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    service_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let service_id = Arc::new(service_id);

    info!(port = %port, service = %service_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let service_id = service_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let service_id = service_id.clone();
                                async move { handle_request(req, metrics, service_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
