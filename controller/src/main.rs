use controller::{
    activities::{ActivityOrchestrator, KubeActivityPatcher},
    candidate::CandidateRunner,
    config::Config,
    drain::DrainExecutor,
    error::{self, Result},
    events::EventRecorder,
    index::ObjectIndex,
    metrics::ControllerMetrics,
    replace::NodeReplacer,
    retry::RetryManager,
    scheduler::GroupScheduler,
    scope::ScopeObserver,
    simulator::{DrainSimulator, KubeEvictionDryRun},
    telemetry::vending_metrics,
};
use models::constants::DRAINOP;
use models::node::K8sNodeStateClient;

use actix_web::{web::Data, App, HttpServer};
use snafu::ResultExt;
use std::sync::Arc;
use tracing::{event, Level};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

const DEFAULT_TRACE_LEVEL: &str = "info";
const METRICS_PORT: u16 = 8080;

#[actix_web::main]
async fn main() -> Result<()> {
    let registry = init_telemetry()?;

    let config = Config::from_environment().context(error::ConfigurationSnafu)?;

    let k8s_client = kube::client::Client::try_default()
        .await
        .context(error::ClientCreateSnafu)?;

    // Reflector-backed indexes over the cluster; the driver future must keep
    // running for the index to observe watch events.
    let (index, index_driver) = ObjectIndex::new(&k8s_client);
    let index = Arc::new(index);

    let events = EventRecorder::new(k8s_client.clone(), &config.config_name);
    let metrics = Arc::new(ControllerMetrics::new(opentelemetry::global::meter(
        "drainop-controller",
    )));
    let node_client = K8sNodeStateClient::new(k8s_client.clone());

    let simulator = Arc::new(DrainSimulator::new(
        index.clone(),
        KubeEvictionDryRun::new(k8s_client.clone()),
        events.clone(),
        metrics.clone(),
        config.simulation_rate_per_minute,
    ));
    let cache_cleanup = simulator.cache_cleanup();

    let scope_observer = ScopeObserver::new(
        node_client.clone(),
        index.clone(),
        config.config_name.clone(),
        config.node_labels.clone(),
    );
    let candidate_runner = CandidateRunner::new(
        node_client.clone(),
        index.clone(),
        simulator,
        events.clone(),
        config.config_name.clone(),
        config.node_conditions.clone(),
    );

    let retry = RetryManager::new(
        node_client.clone(),
        events.clone(),
        config.max_drain_attempts,
    );
    let executor = Arc::new(DrainExecutor::new(
        node_client.clone(),
        k8s_client.clone(),
        index.clone(),
        events.clone(),
        metrics.clone(),
        retry.clone(),
        &config,
    ));
    let activities = Arc::new(ActivityOrchestrator::new(
        KubeActivityPatcher::new(k8s_client.clone()),
        index.clone(),
        config.activity_timeout,
    ));
    let replacer = NodeReplacer::new(node_client.clone(), events.clone(), metrics.clone());
    let scheduler = Arc::new(GroupScheduler::new(
        node_client,
        index,
        executor,
        activities,
        replacer,
        retry,
        events,
        metrics,
        &config,
    ));

    // Setup Http server to vend prometheus metrics.
    let registry_data = Data::new(registry);
    let prometheus_server = HttpServer::new(move || {
        App::new()
            .app_data(registry_data.clone())
            .service(vending_metrics)
    })
    .bind(("0.0.0.0", METRICS_PORT))
    .context(error::PrometheusServerSnafu)?
    .run();

    tokio::select! {
        _ = index_driver => {
            event!(Level::ERROR, "object index reflectors drained");
        },
        _ = cache_cleanup => {
            event!(Level::ERROR, "simulation cache cleanup exited");
        },
        _ = scope_observer.run() => {
            event!(Level::ERROR, "scope observer exited");
        },
        _ = candidate_runner.run() => {
            event!(Level::ERROR, "candidate runner exited");
        },
        _ = scheduler.run() => {
            event!(Level::ERROR, "scheduler exited");
        },
        _ = prometheus_server => {
            event!(Level::ERROR, "metric server exited");
        }
    };
    Ok(())
}

fn init_telemetry() -> Result<prometheus::Registry> {
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .context(error::MetricsConfigurationSnafu)?;
    let provider = opentelemetry::sdk::metrics::MeterProvider::builder()
        .with_reader(exporter)
        .build();
    opentelemetry::global::set_meter_provider(provider);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_TRACE_LEVEL));
    let stdio_formatting_layer = BunyanFormattingLayer::new(DRAINOP.into(), std::io::stdout);
    let subscriber = Registry::default()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(stdio_formatting_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context(error::TracingConfigurationSnafu)?;

    Ok(registry)
}
