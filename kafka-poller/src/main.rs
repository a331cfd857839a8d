use std::io;
use std::net::SocketAddr;

use anyhow::{anyhow, Context, Result};
use common_kafka::KafkaBroker;
use envconfig::Envconfig;
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use kafka_poller::codec::{decode_command, FrameWriter};
use kafka_poller::config::Config;
use kafka_poller::{command_channel, Command, CommandSender, Poller};

async fn shutdown() -> io::Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };
    Ok(())
}

async fn stop_on_signal(commands: CommandSender) {
    match shutdown().await {
        Ok(()) => {
            info!("Received shutdown signal, stopping");
            commands.send(Command::Stop);
        }
        Err(e) => error!(error = ?e, "Failed to register signal handlers"),
    }
}

/// Forwards host frames from stdin to the poller. The host closing stdin
/// means it wants us gone.
async fn read_host_commands(commands: CommandSender, max_frame_bytes: usize) {
    let codec = LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(max_frame_bytes)
        .new_codec();
    let mut frames = FramedRead::new(tokio::io::stdin(), codec);

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(body) => commands.send(decode_command(&body)),
            Err(e) => {
                error!(error = ?e, "Failed to read command frame from host");
                commands.send(Command::Unrecognized(format!("{e:#}")));
                return;
            }
        }
    }

    info!("Host closed stdin, stopping");
    commands.send(Command::Stop);
}

async fn run() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    info!("Configuration loaded: {:?}", config);

    if config.export_prometheus {
        let metrics_addr: SocketAddr = config
            .bind_address()
            .parse()
            .context("Invalid metrics bind address")?;
        PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Metrics server listening on {}", metrics_addr);
    }

    let broker = KafkaBroker::new(
        &config.client_config(),
        config.kafka_operation_timeout_ms.0,
        config.max_poll_records,
    )
    .context("Failed to create Kafka consumer")?;

    let (commands, queue) = command_channel();
    let mut poller = Poller::new(
        broker,
        FrameWriter::new(io::stdout()),
        queue,
        config.poller_settings(),
    );

    let poller_thread = std::thread::Builder::new()
        .name("kafka-poller".to_string())
        .spawn(move || poller.run())
        .context("Failed to spawn poller thread")?;

    tokio::spawn(read_host_commands(
        commands.clone(),
        config.max_command_frame_bytes,
    ));
    tokio::spawn(stop_on_signal(commands));

    let joined = tokio::task::spawn_blocking(move || poller_thread.join())
        .await
        .context("Failed to wait for poller thread")?;

    match joined {
        Ok(result) => result.context("Poller stopped with an error"),
        Err(_) => Err(anyhow!("Poller thread panicked")),
    }
}

#[tokio::main]
async fn main() {
    // stdout carries the host protocol, so logs go to stderr
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "kafka_poller=info,info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    info!("Starting Kafka poller");

    let code = match run().await {
        Ok(()) => {
            info!("Kafka poller stopped");
            0
        }
        Err(e) => {
            error!(error = ?e, "Kafka poller failed");
            1
        }
    };

    // The stdin reader may be parked in a blocking read that the runtime
    // cannot cancel, so leave without waiting for it.
    std::process::exit(code);
}
