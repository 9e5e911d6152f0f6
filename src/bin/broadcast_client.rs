use std::{process::ExitCode, sync::Arc, time::Duration};

use broadcast_load::{
    grpc::GrpcTransport,
    memory::MemoryTransport,
    message::ChannelEnvelopeBuilder,
    LoadCoordinator, LoadOptions, TimeoutOptions, Transport,
};
use bytes::Bytes;
use clap::Parser;
use tracing::{error, Level};

/// Broadcast a batch of fixed-size messages over concurrent streams and wait
/// for every acknowledgment.
#[derive(Debug, Parser)]
#[command(name = "broadcast_client")]
struct Cli {
    /// The ordering service to connect to.
    #[arg(long, default_value = "127.0.0.1:7050")]
    server: String,

    /// The channel to broadcast to.
    #[arg(long = "channel-id", alias = "chainID", default_value = "testchainid")]
    channel_id: String,

    /// The number of messages to broadcast.
    #[arg(long, default_value_t = 1)]
    messages: u64,

    /// The number of concurrent streams to broadcast the messages on.
    #[arg(long, alias = "goroutines", default_value_t = 1)]
    sessions: usize,

    /// The size in bytes of the data section of each payload.
    #[arg(long, default_value_t = 1024)]
    size: usize,

    /// Pause after opening each stream, in milliseconds.
    #[arg(long = "warmup-ms", default_value_t = 0)]
    warmup_ms: u64,

    /// Pause before every send, in milliseconds.
    #[arg(long = "send-interval-ms", default_value_t = 0)]
    send_interval_ms: u64,

    /// Run against an in-process endpoint instead of the network.
    #[arg(long)]
    loopback: bool,

    #[arg(long = "log-level", default_value_t = Level::INFO)]
    log_level: Level,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(cli.log_level)
            .finish(),
    )
    .expect("Failed to set tracing subscriber");

    let transport: Arc<dyn Transport> = if cli.loopback {
        Arc::new(MemoryTransport::new())
    } else {
        match GrpcTransport::connect(&cli.server, TimeoutOptions::default()).await {
            Ok(transport) => Arc::new(transport),
            Err(err) => {
                println!("Error connecting: {}", err);
                return ExitCode::FAILURE;
            }
        }
    };

    let options = LoadOptions::default()
        .with_warmup(Duration::from_millis(cli.warmup_ms))
        .with_send_interval(Duration::from_millis(cli.send_interval_ms));
    let coordinator = LoadCoordinator::new(
        transport,
        Arc::new(ChannelEnvelopeBuilder::new(cli.channel_id.clone())),
        options,
    );
    let payload = Bytes::from(vec![0u8; cli.size]);

    let result = match coordinator
        .run_load(cli.messages, cli.sessions, payload)
        .await
    {
        Ok(result) => result,
        Err(err) => {
            error!("Load run rejected: {}", err);
            return ExitCode::FAILURE;
        }
    };

    if result.rounded() {
        println!("Rounding messages to {}", result.effective_total);
    }
    for session in result.failed_sessions() {
        if let Some(err) = &session.error {
            println!(
                "Session {} failed after {} sent / {} acked: {}",
                session.stream_index, session.send_count, session.recv_count, err
            );
        }
    }
    println!(
        "Broadcast {} messages on {} streams: {} sent, {} acked, {} of {} streams completed in {:.3}s",
        result.effective_total,
        cli.sessions,
        result.total_sent,
        result.total_acked,
        result.completed_count(),
        result.sessions.len(),
        result.elapsed.as_secs_f64()
    );

    if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
