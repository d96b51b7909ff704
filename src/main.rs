//! direct-sampler: publish or subscribe against a broker from the command line

use clap::{Args, Parser, Subcommand};
use pubsub_direct::config::keys;
use pubsub_direct::observability::init_default_logging;
use pubsub_direct::{
    listener_fn, BrokerProperties, ConnectionManager, FailedPublishEvent, InboundMessage, Message,
    PublishOutcome, ServiceConfig, ServiceEvent, Topic, TopicSubscription,
};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "direct-sampler")]
#[command(about = "Direct messaging sampler for a pub/sub broker")]
#[command(version)]
struct Cli {
    /// Broker properties file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the session metrics as JSON when the command finishes
    #[arg(long, global = true)]
    metrics: bool,

    #[command(flatten)]
    broker: BrokerArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BrokerArgs {
    /// Broker URL, e.g. tcp://localhost:1883
    #[arg(long, env = "PUBSUB_HOST")]
    host: Option<String>,

    #[arg(long, env = "PUBSUB_VPN")]
    vpn: Option<String>,

    #[arg(long, env = "PUBSUB_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "PUBSUB_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long, env = "PUBSUB_CLIENT_NAME")]
    client_name: Option<String>,

    /// Reconnection attempts: -1 forever, 0 never
    #[arg(long, allow_hyphen_values = true)]
    retries: Option<i64>,

    /// Wait between reconnection attempts
    #[arg(long, value_name = "MS")]
    retry_interval_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print messages arriving on one or more subscriptions
    Subscribe {
        /// Subscription pattern; repeatable
        #[arg(short, long = "topic", required = true)]
        topics: Vec<String>,

        /// Stop after this many messages
        #[arg(long)]
        count: Option<u64>,
    },
    /// Publish a payload to a topic
    Publish {
        #[arg(short, long)]
        topic: String,

        #[arg(short, long)]
        message: String,

        #[arg(long, default_value_t = 1)]
        count: u64,

        #[arg(long, value_name = "MS", default_value_t = 0)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_default_logging() {
        eprintln!("Failed to initialize logging: {e}");
    }

    let config = match load_configuration(cli.config.as_deref(), &cli.broker) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Subscribe { topics, count } => {
            run_subscribe(config, &topics, count, cli.metrics).await
        }
        Commands::Publish {
            topic,
            message,
            count,
            interval_ms,
        } => {
            let interval = Duration::from_millis(interval_ms);
            run_publish(config, &topic, &message, count, interval, cli.metrics).await
        }
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    path: Option<&std::path::Path>,
    args: &BrokerArgs,
) -> Result<ServiceConfig, Box<dyn std::error::Error>> {
    let mut props = match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            BrokerProperties::load_from_file(path)?
        }
        None => BrokerProperties::new(),
    };

    let overrides = [
        (keys::TRANSPORT_HOST, args.host.clone()),
        (keys::SERVICE_VPN_NAME, args.vpn.clone()),
        (keys::AUTHENTICATION_BASIC_USER_NAME, args.username.clone()),
        (keys::AUTHENTICATION_BASIC_PASSWORD, args.password.clone()),
        (keys::SERVICE_CLIENT_NAME, args.client_name.clone()),
        (keys::RECONNECTION_ATTEMPTS, args.retries.map(|r| r.to_string())),
        (
            keys::RECONNECTION_INTERVAL_MS,
            args.retry_interval_ms.map(|ms| ms.to_string()),
        ),
    ];
    for (key, value) in overrides {
        if let Some(value) = value {
            props = props.with(key, value);
        }
    }

    Ok(ServiceConfig::from_properties(&props)?)
}

async fn connect(config: ServiceConfig) -> Result<ConnectionManager, Box<dyn std::error::Error>> {
    let manager = ConnectionManager::with_mqtt(config)?;

    manager.add_reconnection_attempt_listener(listener_fn(|event: &ServiceEvent| {
        warn!(attempt = event.attempt, reason = %event.message, "Reconnection attempt failed");
        Ok(())
    }));
    manager.add_reconnection_listener(listener_fn(|event: &ServiceEvent| {
        info!(broker = %event.broker_uri, "Reconnected");
        Ok(())
    }));
    manager.add_service_interruption_listener(listener_fn(|event: &ServiceEvent| {
        error!(broker = %event.broker_uri, reason = %event.message, "Service interrupted");
        Ok(())
    }));

    manager.connect().await?;
    info!(broker = %manager.broker_uri(), "Connected");
    Ok(manager)
}

async fn run_subscribe(
    config: ServiceConfig,
    patterns: &[String],
    count: Option<u64>,
    show_metrics: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let subscriptions = patterns
        .iter()
        .map(|p| TopicSubscription::of(p))
        .collect::<Result<Vec<_>, _>>()?;

    let receiver_config = config.receiver.clone();
    let manager = connect(config).await?;
    let receiver = manager.create_direct_receiver(receiver_config, subscriptions)?;

    let received = Arc::new(AtomicU64::new(0));
    let done = Arc::new(Notify::new());
    {
        let received = received.clone();
        let done = done.clone();
        receiver.receive_async(move |message: InboundMessage| {
            let n = received.fetch_add(1, Ordering::SeqCst) + 1;
            match message.payload_as_str() {
                Some(text) => println!("[{}] {}", message.destination(), text),
                None => println!("[{}] <{} bytes>", message.destination(), message.payload.len()),
            }
            if count.is_some_and(|limit| n >= limit) {
                done.notify_one();
            }
        });
    }
    receiver.start().await?;
    info!(subscriptions = ?patterns, "Receiving; press Ctrl-C to stop");

    let mut state = manager.watch_state();
    tokio::select! {
        _ = signal::ctrl_c() => info!("Interrupted"),
        _ = done.notified() => {}
        _ = state.wait_for(|s| s.is_resolved() && !s.is_connected()) => {
            warn!(state = %manager.state(), "Session ended");
        }
    }

    receiver.terminate().await;
    manager.disconnect().await?;
    info!(received = received.load(Ordering::SeqCst), "Done");
    if show_metrics {
        println!("{}", metrics_json(&manager)?);
    }
    Ok(())
}

async fn run_publish(
    config: ServiceConfig,
    topic: &str,
    payload: &str,
    count: u64,
    interval: Duration,
    show_metrics: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let destination = Topic::of(topic)?;
    let publisher_config = config.publisher.clone();

    let manager = connect(config).await?;
    let publisher = manager.create_direct_publisher(publisher_config)?;
    publisher.set_publish_failure_listener(|event: &FailedPublishEvent| {
        warn!(topic = %event.destination, cause = %event.cause, "Publish failed");
    });
    publisher.start().await?;

    let mut accepted = 0u64;
    for sequence in 0..count {
        let message = Message::builder()
            .with_property("sequence", sequence.to_string())
            .build(payload.to_string());
        match publisher.publish(&destination, message).await {
            PublishOutcome::Accepted => accepted += 1,
            PublishOutcome::Rejected { reason } => warn!(sequence, %reason, "Publish rejected"),
        }
        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    let discarded = publisher.terminate(Duration::from_secs(5)).await;
    manager.disconnect().await?;
    info!(accepted, discarded, "Done");
    if show_metrics {
        println!("{}", metrics_json(&manager)?);
    }

    let unsent = (count - accepted) + discarded as u64;
    if unsent > 0 {
        return Err(format!("{unsent} of {count} messages were not sent").into());
    }
    Ok(())
}

fn metrics_json(manager: &ConnectionManager) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&manager.metrics().snapshot())
}
