//! Herald demo binary.
//!
//! Sends one message to a topic and consumes it back as a member of a
//! consumer group, both against an in-process simulated broker.
//!
//! ```bash
//! herald-demo
//! herald-demo --topic orders --message "hello" --commit-mode manual
//! HERALD_GROUP_ID=billing herald-demo --partitions 3 --log-level debug
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use herald_broker::SimulatedBroker;
use herald_client::{
    CommitMode, Consumer, ConsumerConfig, HandlerError, Message, OffsetReset, Producer,
    ProducerConfig, StringCodec,
};
use herald_core::{PartitionId, TopicPartition};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// When consumed offsets are committed.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum CommitModeArg {
    /// Commit the delivered position every `--auto-commit-interval-ms`.
    #[default]
    Auto,
    /// Commit after the handler succeeds.
    Manual,
}

/// Where a group without committed offsets starts.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OffsetResetArg {
    /// Oldest retained record.
    #[default]
    Earliest,
    /// Only records produced after joining.
    Latest,
}

impl From<OffsetResetArg> for OffsetReset {
    fn from(arg: OffsetResetArg) -> Self {
        match arg {
            OffsetResetArg::Earliest => Self::Earliest,
            OffsetResetArg::Latest => Self::Latest,
        }
    }
}

/// Herald producer/consumer demo.
#[derive(Parser, Debug)]
#[command(name = "herald-demo")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Topic to produce to and consume from.
    #[arg(long, env = "HERALD_TOPIC", default_value = "naceunProgramador-Topic")]
    topic: String,

    /// Consumer group id.
    #[arg(long, env = "HERALD_GROUP_ID", default_value = "my-group-id")]
    group_id: String,

    /// Message value to send.
    #[arg(long, env = "HERALD_MESSAGE", default_value = "Final prueba de Kafka")]
    message: String,

    /// Number of partitions of the topic.
    #[arg(long, env = "HERALD_PARTITIONS", default_value = "1")]
    partitions: u32,

    /// Offset commit policy.
    #[arg(long, env = "HERALD_COMMIT_MODE", value_enum, default_value = "auto")]
    commit_mode: CommitModeArg,

    /// Auto-commit interval in milliseconds.
    #[arg(long, env = "HERALD_AUTO_COMMIT_INTERVAL_MS", default_value = "1000")]
    auto_commit_interval_ms: u64,

    /// Offset reset policy.
    #[arg(long, env = "HERALD_OFFSET_RESET", value_enum, default_value = "earliest")]
    offset_reset: OffsetResetArg,

    /// Bootstrap servers, comma separated.
    #[arg(
        long,
        env = "HERALD_BOOTSTRAP_SERVERS",
        value_delimiter = ',',
        default_value = herald_client::DEFAULT_BOOTSTRAP_SERVER
    )]
    bootstrap_servers: Vec<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "HERALD_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// How long to consume before shutting down, in milliseconds.
    #[arg(long, env = "HERALD_RUN_FOR_MS", default_value = "3000")]
    run_for_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!(
        topic = %args.topic,
        group_id = %args.group_id,
        partitions = args.partitions,
        commit_mode = ?args.commit_mode,
        offset_reset = ?args.offset_reset,
        bootstrap_servers = ?args.bootstrap_servers,
        "Starting Herald demo"
    );

    let broker = Arc::new(SimulatedBroker::new(0));
    broker.create_topic(&args.topic, args.partitions)?;

    let commit_mode = match args.commit_mode {
        CommitModeArg::Auto => {
            CommitMode::AutoInterval(Duration::from_millis(args.auto_commit_interval_ms))
        }
        CommitModeArg::Manual => CommitMode::ManualAfterSuccess,
    };
    let consumer_config = ConsumerConfig::default()
        .with_bootstrap_servers(args.bootstrap_servers.clone())
        .with_commit_mode(commit_mode)
        .with_offset_reset(args.offset_reset.into())
        .with_session(Duration::from_millis(100), Duration::from_secs(10))
        .with_shutdown_grace(Duration::from_secs(5));
    let consumer = Arc::new(Consumer::new(Arc::clone(&broker), consumer_config)?);
    consumer.subscribe(
        [args.topic.clone()],
        args.group_id.clone(),
        StringCodec,
        |message: Message<String>| async move {
            info!(
                partition = %message.partition,
                offset = %message.offset,
                "message received: {}",
                message.value
            );
            Ok::<(), HandlerError>(())
        },
    )?;

    let running = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.run().await })
    };

    let producer = Producer::new(
        Arc::clone(&broker),
        ProducerConfig::default().with_bootstrap_servers(args.bootstrap_servers),
    )?;
    let report = producer
        .send_serialized(
            &args.topic,
            None::<&str>,
            args.message.as_str(),
            &StringCodec,
            &StringCodec,
        )
        .await?;
    info!(
        topic = %report.topic,
        partition = %report.partition,
        offset = ?report.offset,
        "Message sent"
    );
    producer.close().await?;

    tokio::time::sleep(Duration::from_millis(args.run_for_ms)).await;
    consumer.close().await;
    running.await??;

    for partition in 0..u64::from(args.partitions) {
        let tp = TopicPartition::new(args.topic.clone(), PartitionId::new(partition));
        info!(
            partition = %tp,
            committed = ?broker.committed(&args.group_id, &tp),
            "Final committed offset"
        );
    }
    Ok(())
}
