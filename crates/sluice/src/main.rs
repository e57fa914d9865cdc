mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::{DatastreamSettings, Settings, TopicSettings};
use sluice_common::datastream::START_POSITION;
use sluice_common::{Datastream, Task};
use sluice_connector::{Connector, KafkaConnector};
use sluice_connector_memory::{MemoryCheckpointProvider, MemorySource, MemoryTransportProvider};
use sluice_producer::EventProducerPool;
use std::sync::Arc;
use tokio::task::JoinSet;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replicate the configured datastreams until interrupted.
    Run,
    /// Initialize the configured datastreams and print the result.
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::new(args.config.as_deref()).context("failed to load settings")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level)),
        )
        .init();

    let source = MemorySource::new();
    for topic in &settings.topics {
        seed(&source, topic).await?;
    }

    let transports = MemoryTransportProvider::new();
    let checkpoints = MemoryCheckpointProvider::new();
    let pool = Arc::new(EventProducerPool::new(
        Arc::new(transports.clone()),
        Arc::new(checkpoints.clone()),
        settings.producer.clone(),
    ));
    let connector = KafkaConnector::new(settings.connector.clone(), Arc::new(source.clone()), pool.clone())
        .context("invalid connector configuration")?;

    let streams = admit(&connector, &settings.datastreams).await;

    match args.command.unwrap_or(Command::Run) {
        Command::Validate => {
            for stream in &streams {
                println!(
                    "{}: {} ({} partitions) -> {}",
                    stream.name,
                    stream.source.connection_string,
                    stream.source.partitions.unwrap_or(0),
                    stream.destination.connection_string
                );
            }
            let rejected = settings.datastreams.len() - streams.len();
            if rejected > 0 {
                anyhow::bail!("{rejected} datastream(s) failed validation");
            }
        }
        Command::Run => {
            run(&settings, &connector, &source, &streams).await?;
            pool.close().await;
            for stream in &streams {
                let destination = &stream.destination.connection_string;
                tracing::info!(
                    datastream = %stream.name,
                    destination = %destination,
                    delivered = transports.delivered(destination).len(),
                    "final delivery count"
                );
            }
            tracing::info!(checkpoints = checkpoints.committed().len(), "checkpoints committed");
        }
    }
    Ok(())
}

async fn run(
    settings: &Settings,
    connector: &KafkaConnector,
    source: &MemorySource,
    streams: &[Datastream],
) -> anyhow::Result<()> {
    let tasks: Vec<Task> = streams.iter().map(Task::new).collect();
    connector.start().await?;
    connector.on_assignment_change(tasks).await?;

    let mut emitters = JoinSet::new();
    for topic in &settings.topics {
        if let Some(period) = topic.emit_interval() {
            emitters.spawn(emit(source.clone(), topic.clone(), period));
        }
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut report = tokio::time::interval(settings.report_interval());
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res.context("failed to listen for ctrl-c")?;
                tracing::info!("shutting down");
                break;
            }
            _ = report.tick() => {
                for diag in connector.diagnostics().await {
                    tracing::info!(
                        task = %diag.task_name,
                        status = %diag.status_code,
                        message = %diag.status_message,
                        checkpoint = %diag.source_checkpoint,
                        "task status"
                    );
                }
            }
        }
    }

    emitters.shutdown().await;
    if let Err(e) = connector.stop().await {
        tracing::warn!(error = %e, "connector stopped with stragglers");
    }
    Ok(())
}

async fn admit(connector: &KafkaConnector, configured: &[DatastreamSettings]) -> Vec<Datastream> {
    let mut admitted: Vec<Datastream> = Vec::new();
    for ds in configured {
        let mut stream = Datastream::new(&ds.name, connector.connector_type(), &ds.source, &ds.destination);
        stream.source.partitions = ds.partitions;
        if let Some(ts) = ds.start_position {
            stream.metadata.insert(START_POSITION.to_string(), ts.to_string());
        }
        match connector.initialize_datastream(&mut stream, &admitted).await {
            Ok(()) => admitted.push(stream),
            Err(e) => tracing::error!(datastream = %ds.name, error = %e, "datastream rejected"),
        }
    }
    admitted
}

async fn seed(source: &MemorySource, topic: &TopicSettings) -> anyhow::Result<()> {
    source.create_topic(&topic.name, topic.partitions).await;
    let now = chrono::Utc::now().timestamp_millis();
    for i in 0..topic.seed_records {
        for partition in 0..topic.partitions {
            source
                .append(&topic.name, partition, format!("{}-{partition}-{i}", topic.name), now)
                .await?;
        }
    }
    tracing::info!(topic = %topic.name, partitions = topic.partitions, records = topic.seed_records, "seeded topic");
    Ok(())
}

async fn emit(source: MemorySource, topic: TopicSettings, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    let mut sequence = topic.seed_records;
    loop {
        ticker.tick().await;
        let now = chrono::Utc::now().timestamp_millis();
        for partition in 0..topic.partitions {
            let value = format!("{}-{partition}-{sequence}", topic.name);
            if let Err(e) = source.append(&topic.name, partition, value, now).await {
                tracing::warn!(topic = %topic.name, error = %e, "failed to append record");
            }
        }
        sequence += 1;
    }
}
