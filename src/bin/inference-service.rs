//! Root-Cause Inference Service
//!
//! Polls the abnormal-KPI stream, runs one inference cycle per triggering
//! KPI, and publishes the ranked causes onto the inference topic. A
//! background task keeps the observation-metadata registry fresh from the
//! metadata topic.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rca_hub::analytics::locator::CauseLocator;
use rca_hub::analytics::policy::{build_policy, PolicyOptions};
use rca_hub::clients::arango::ArangoClient;
use rca_hub::clients::timeseries::{PrometheusCollector, TimeSeriesClient};
use rca_hub::clients::topology::ArangoTopologyClient;
use rca_hub::common::config::InferConfig;
use rca_hub::error::InferError;
use rca_hub::keywords::CauseKeywords;
use rca_hub::output::{build_cause_message, format_infer_result};
use rca_hub::pipeline::aggregator::{AggregatorConfig, EventAggregator};
use rca_hub::pipeline::consumer::{BrokerAuth, KafkaEventSource};
use rca_hub::pipeline::metadata::spawn_metadata_refresher;
use rca_hub::pipeline::publish::CausePublisher;
use rca_hub::rules::engine::RuleEngine;
use rca_hub::schemas::metadata::ObserveMetaRegistry;

#[derive(Debug, Parser)]
#[command(name = "inference-service", about = "Root-cause inference service")]
struct Args {
    /// Configuration file path (overrides INFER_CONFIG_PATH)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn init_tracing(config: &InferConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.log_level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if let Some(path) = &config.log.log_path {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        builder.with_writer(Arc::new(file)).with_ansi(false).init();
    } else {
        builder.init();
    }
    Ok(())
}

fn broker_auth(config: &InferConfig) -> BrokerAuth {
    BrokerAuth {
        server: config.kafka.server.clone(),
        auth_type: config.kafka.auth_type.clone(),
        username: config.kafka.username.clone(),
        password: config.kafka.password.clone(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = InferConfig::load(args.config.as_deref())?;
    init_tracing(&config)?;
    info!("start cause inference service...");

    let registry = Arc::new(ObserveMetaRegistry::new(&config.global.data_agent));
    let loaded = registry
        .load_ext_file(&config.infer.ext_observe_meta_path)
        .context("load observe metadata failed")?;
    info!("load observe metadata success, {loaded} entity types");

    let mut rule_engine = RuleEngine::new();
    rule_engine
        .load_rule_file(&config.infer.infer_rule_path)
        .context("load rule meta failed")?;
    info!("load rule meta success");

    let mut keywords = CauseKeywords::new();
    keywords
        .load_file(&config.infer.cause_keyword_path)
        .context("load cause keyword failed")?;
    info!("load cause keyword success");

    let auth = broker_auth(&config);
    let kpi_source = KafkaEventSource::new(
        &auth,
        &config.kafka.abnormal_kpi_topic.topic_id,
        &config.kafka.abnormal_kpi_topic.group_id,
        Duration::from_secs(config.kafka.abnormal_kpi_topic.consumer_to),
    )?;
    let metric_source = KafkaEventSource::new(
        &auth,
        &config.kafka.abnormal_metric_topic.topic_id,
        &config.kafka.abnormal_metric_topic.group_id,
        Duration::from_secs(config.kafka.abnormal_metric_topic.consumer_to),
    )?;
    let metadata_source = KafkaEventSource::new(
        &auth,
        &config.kafka.metadata_topic.topic_id,
        &config.kafka.metadata_topic.group_id,
        Duration::from_secs(config.kafka.metadata_topic.consumer_to),
    )?;
    let publisher = CausePublisher::new(&auth, &config.kafka.inference_topic.topic_id)?;

    let _refresher = spawn_metadata_refresher(metadata_source, registry.clone());

    let mut aggregator = EventAggregator::new(
        kpi_source,
        metric_source,
        registry.clone(),
        AggregatorConfig {
            valid_duration: config.infer.evt_valid_duration,
            future_duration: config.infer.evt_future_duration,
            aging_duration: config.infer.evt_aging_duration,
        },
    );

    let arango = ArangoClient::new(&config.arangodb.url, &config.arangodb.db_name);
    let topo_client = ArangoTopologyClient::new(
        arango,
        config.infer.topo_depth,
        config.infer.tolerated_bias,
    );
    let ts_client = TimeSeriesClient::new(
        PrometheusCollector::new(&config.prometheus.base_url, &config.prometheus.range_api),
        config.prometheus.sample_duration,
        config.prometheus.step,
        registry.clone(),
    );

    let policy_options = PolicyOptions {
        rho: config.infer.rho,
        random_walk_round: config.infer.random_walk_round,
        seed: None,
    };
    let poll_interval = Duration::from_secs(config.infer.kpi_poll_interval);

    loop {
        info!("start consuming abnormal kpi event...");
        let (kpi, abn_metrics) = match aggregator.get_abnormal_info().await {
            Ok(pair) => pair,
            Err(InferError::NoKpi) => {
                tokio::time::sleep(poll_interval).await;
                aggregator.consume_kpi_events().await;
                continue;
            }
            Err(err) => {
                warn!("{err}");
                continue;
            }
        };
        tracing::debug!("abnormal kpi is: {kpi:?}");
        tracing::debug!("abnormal metrics are: {abn_metrics:?}");

        let policy = match build_policy(&config.infer.infer_policy, &policy_options) {
            Ok(policy) => policy,
            Err(err) => {
                warn!("{err}");
                continue;
            }
        };

        let event_id = kpi.event_id.clone();
        let mut locator = CauseLocator::new(
            kpi.clone(),
            abn_metrics,
            &topo_client,
            &ts_client,
            &rule_engine,
            policy,
            config.infer.root_topk,
        );
        let causes = match locator.locate().await {
            Ok(causes) => causes,
            Err(err) => {
                warn!("{err}");
                continue;
            }
        };
        if causes.is_empty() {
            info!("no cause detected, event_id={event_id}");
            continue;
        }

        let Some(result) = format_infer_result(&causes, &keywords) else {
            info!("no cause detected, event_id={event_id}");
            continue;
        };
        let message = build_cause_message(&kpi, &result);
        tracing::debug!("{message}");
        publisher.publish(&message).await;
    }
}
