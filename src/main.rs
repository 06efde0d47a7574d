//! Neighborhood watch - location tracking, geofence evaluation and deal notifications
//!
//! Module structure:
//! - `domain/` - Core types (samples, membership, envelopes)
//! - `cache/` - Token, geocode and reverse-geocode cache tiers
//! - `io/` - External interfaces (platform, evaluation, token, geocoding, metrics)
//! - `services/` - Permission, watch lifecycle, evaluation, notification sequencing
//! - `infra/` - Infrastructure (Config, Errors, Metrics)

use anyhow::Context;
use clap::{Parser, Subcommand};
use neighborhood_watch::cache::{
    AccessTokenCache, FileStore, GeocodeCache, ReverseGeocodeCache, SessionStore,
};
use neighborhood_watch::domain::{epoch_ms, LocationSample};
use neighborhood_watch::infra::{Config, Metrics};
use neighborhood_watch::io::{
    create_notification_channel, AccessTokenProvider, GeocodingClient, HttpEvaluationClient,
    HttpTokenSource, NotificationSink, ScriptedPermissions, ScriptedSensor, UserEvent,
    WatchOptions,
};
use neighborhood_watch::services::{
    GeofenceEvaluator, LocationWatchController, NotificationDispatchSequencer, PermissionNegotiator,
    WatchDeps,
};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Time to let the last notification sequence play out after a replay
const REPLAY_SETTLE: Duration = Duration::from_millis(3500);

/// Neighborhood watch - nearby deal notifications driven by location
#[derive(Parser, Debug)]
#[command(name = "neighborhood-watch", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay location samples through the tracking pipeline
    Track {
        /// JSON lines file, one `{latitude, longitude, accuracy, timestamp?}` object per line
        #[arg(short, long)]
        samples: String,

        /// Delay between samples in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Resolve a venue name to coordinates
    Geocode {
        venue: String,

        /// Proximity bias longitude
        #[arg(long, requires = "lat", allow_negative_numbers = true)]
        lng: Option<f64>,

        /// Proximity bias latitude
        #[arg(long, requires = "lng", allow_negative_numbers = true)]
        lat: Option<f64>,
    },
    /// Resolve coordinates to a place name
    Reverse {
        #[arg(allow_negative_numbers = true)]
        lat: f64,
        #[arg(allow_negative_numbers = true)]
        lng: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for cache and sequencing detail
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = Config::load_from_path(&Config::resolve_config_path(args.config.as_deref()));

    info!(
        version = %env!("CARGO_PKG_VERSION"),
        git_hash = %env!("GIT_HASH"),
        profile = %env!("BUILD_PROFILE"),
        config_file = %config.config_file(),
        service = %config.service_id(),
        evaluation_url = %config.evaluation_url(),
        cache_dir = %config.cache_dir().display(),
        "neighborhood_watch_starting"
    );

    let metrics = Arc::new(Metrics::new());

    match args.command {
        Command::Track { samples, interval_ms } => {
            run_track(&config, metrics, Path::new(&samples), Duration::from_millis(interval_ms))
                .await
        }
        Command::Geocode { venue, lng, lat } => {
            let client = build_geocoding_client(&config, metrics)?;
            let proximity = lng.zip(lat);
            match client.geocode_venue(&venue, proximity).await? {
                Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                None => warn!(venue = %venue, "no_geocode_result"),
            }
            Ok(())
        }
        Command::Reverse { lat, lng } => {
            let client = build_geocoding_client(&config, metrics)?;
            match client.reverse_geocode(lat, lng).await? {
                Some(place) => println!("{}", serde_json::to_string_pretty(&place)?),
                None => warn!(lat = %lat, lng = %lng, "no_reverse_geocode_result"),
            }
            Ok(())
        }
    }
}

fn build_geocoding_client(config: &Config, metrics: Arc<Metrics>) -> anyhow::Result<GeocodingClient> {
    let token_cache =
        AccessTokenCache::new(Arc::new(SessionStore::new()), config.token_ttl(), metrics.clone());
    let token_source = Arc::new(HttpTokenSource::from_config(config)?);
    let tokens = Arc::new(AccessTokenProvider::new(token_cache, token_source, metrics.clone()));

    let geocode_cache = GeocodeCache::new(
        Arc::new(FileStore::new(config.cache_dir())),
        config.geocode_ttl(),
        metrics.clone(),
    );
    let reverse_cache =
        ReverseGeocodeCache::new(config.reverse_capacity(), config.reverse_ttl(), metrics);

    Ok(GeocodingClient::new(config, tokens, geocode_cache, reverse_cache)?)
}

/// One line of a replay file
#[derive(Debug, Deserialize)]
struct SampleLine {
    #[serde(flatten)]
    sample: LocationSample,
    /// RFC 3339 capture time, e.g. "2026-03-14T18:05:12.250-05:00"
    #[serde(default)]
    timestamp: Option<String>,
}

/// Parse an RFC 3339 timestamp to epoch milliseconds
fn parse_iso_time(time_str: &str) -> Option<u64> {
    OffsetDateTime::parse(time_str, &Rfc3339)
        .ok()
        .map(|dt| (dt.unix_timestamp_nanos() / 1_000_000) as u64)
}

fn load_samples(path: &Path) -> anyhow::Result<Vec<LocationSample>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read samples file {}", path.display()))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            let SampleLine { mut sample, timestamp } = serde_json::from_str(line)
                .with_context(|| format!("Bad sample on line {} of {}", i + 1, path.display()))?;
            if let Some(ts) = timestamp {
                sample.captured_at = parse_iso_time(&ts).with_context(|| {
                    format!("Bad timestamp {ts:?} on line {} of {}", i + 1, path.display())
                })?;
            }
            if sample.captured_at == 0 {
                sample.captured_at = epoch_ms();
            }
            Ok(sample)
        })
        .collect()
}

async fn run_track(
    config: &Config,
    metrics: Arc<Metrics>,
    samples_path: &Path,
    interval: Duration,
) -> anyhow::Result<()> {
    let samples = load_samples(samples_path)?;
    info!(samples = %samples.len(), file = %samples_path.display(), "samples_loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let service_id = config.service_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = neighborhood_watch::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                service_id,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    // Periodic metrics report
    let reporter_metrics = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            reporter_metrics.report().log();
        }
    });

    // User-visible events are logged in place of a UI
    let (sender, mut events) = create_notification_channel(256, metrics.clone());
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                UserEvent::Envelope(envelope) => info!(
                    kind = %envelope.kind().as_str(),
                    title = %envelope.title(),
                    body = %envelope.body(),
                    link = ?envelope.action().map(|a| a.link),
                    offset_ms = %envelope.fire_at_offset_ms,
                    "notification"
                ),
                UserEvent::Notice { notice } => info!(message = %notice.message(), "tracking_notice"),
            }
        }
    });

    let sink: Arc<dyn NotificationSink> = Arc::new(sender);
    let dispatcher = Arc::new(NotificationDispatchSequencer::new(sink.clone(), metrics.clone()));
    let client = Arc::new(HttpEvaluationClient::from_config(config)?);
    let evaluator = Arc::new(GeofenceEvaluator::new(client, dispatcher.clone(), metrics.clone()));
    let sensor = Arc::new(ScriptedSensor::new());
    let negotiator = Arc::new(PermissionNegotiator::new(Arc::new(ScriptedPermissions::granted())));

    let controller = LocationWatchController::new(
        WatchDeps {
            negotiator,
            sensor: sensor.clone(),
            evaluator,
            dispatcher,
            sink,
            metrics: metrics.clone(),
        },
        WatchOptions::from_config(config),
    );
    controller.start().await?;

    let replay = async {
        for sample in samples {
            sensor.push_sample(sample).await;
            tokio::time::sleep(interval).await;
        }
        tokio::time::sleep(REPLAY_SETTLE).await;
    };

    tokio::select! {
        _ = replay => info!("replay_complete"),
        _ = tokio::signal::ctrl_c() => info!("shutdown_signal_received"),
    }

    let membership = controller.evaluator().membership();
    info!(neighborhood = ?membership.map(|m| m.name), "final_membership");

    controller.teardown().await;
    let _ = shutdown_tx.send(true);
    metrics.report().log();

    info!("neighborhood_watch_shutdown_complete");
    Ok(())
}
