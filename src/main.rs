// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::{
    process::ExitCode,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use todomq::{
    ack::AckPolicy,
    configs::{BrokerConfig, SubscriberConfig},
    connection::{AmqpDialer, Session},
    connector::{BackoffConnector, Interrupted, Supervised},
    consumer::{ConsumerHandler, SubscriptionHandle},
    dispatcher::{RabbitMQDispatcher, DEFAULT_PREFETCH},
    errors::{PublishError, RpcError, SubscriptionError},
    message::{encode_json, Destination, PublishOptions},
    publisher::{Publisher, RabbitMQPublisher},
    rpc::{CorrelationRouter, ReplyHandler},
    todo::{
        self, movie_details, EventHandler, EventMessage, RpcResponse, TaskHandler, TaskMessage,
        EVENT_EXCHANGE, RPC_QUEUE, TASK_QUEUE,
    },
    topology::Topology,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "todomq", version, about = "Todo task queue, event fanout and RPC over RabbitMQ")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone)]
enum Command {
    /// Send a persistent task to the task queue at a fixed interval
    Produce {
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,
    },
    /// Process tasks from the task queue
    Consume {
        /// Simulated processing time per task
        #[arg(long, default_value_t = 2)]
        work_secs: u64,
        #[arg(long, default_value_t = DEFAULT_PREFETCH)]
        prefetch: u16,
    },
    /// Broadcast todo events at a fixed interval
    PublishEvents {
        #[arg(long, default_value_t = 7)]
        interval_secs: u64,
    },
    /// Receive every broadcast event on a private queue
    Subscribe {
        #[arg(long, env = "SUBSCRIBER_NAME")]
        name: Option<String>,
    },
    /// Answer movie lookups sent to the RPC queue
    Reply {
        #[arg(long, default_value_t = DEFAULT_PREFETCH)]
        prefetch: u16,
    },
    /// Look up a movie over RPC and print the answer
    Request {
        #[arg(long, default_value_t = 42)]
        movie_id: u64,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupted, shutting down");
                    shutdown.cancel();
                }
                Err(err) => error!(error = err.to_string(), "failure to listen for ctrl-c"),
            }
        }
    });

    match run(cli.command, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = format!("{err:#}"), "todomq failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, shutdown: CancellationToken) -> anyhow::Result<()> {
    let cfg = BrokerConfig::from_env().context("invalid broker configuration")?;
    let connector = BackoffConnector::new(cfg.backoff());
    // keeps task and event numbering going across reconnects
    let sequence = Arc::new(AtomicU64::new(1));

    let res = connector
        .supervise(&AmqpDialer::new(&cfg), &shutdown, |session: Session| {
            let command = command.clone();
            let shutdown = shutdown.clone();
            let sequence = sequence.clone();
            async move {
                info!(endpoint = session.endpoint(), "connected to rabbitmq");

                let res = execute(command, &session, &shutdown, &sequence).await;
                let lost = !session.is_connected();

                if let Err(err) = session.close().await {
                    warn!(error = err.to_string(), "failure to close the connection");
                }
                res.map_err(|err| classify(err, lost))
            }
        })
        .await;

    match res {
        Ok(()) => Ok(()),
        Err(Supervised::Connect(err)) => Err(err).context("could not reach the broker"),
        Err(Supervised::Failed(err)) => Err(err),
    }
}

/// Tells a dropped connection, which is worth reconnecting for, apart from
/// any other failure.
fn classify(err: anyhow::Error, session_lost: bool) -> Interrupted<anyhow::Error> {
    let lost = session_lost
        || matches!(
            err.downcast_ref::<SubscriptionError>(),
            Some(SubscriptionError::ConnectionLost(_))
        )
        || matches!(err.downcast_ref::<PublishError>(), Some(PublishError::NotConnected))
        || matches!(
            err.downcast_ref::<RpcError>(),
            Some(RpcError::ConnectionLost | RpcError::Publish(PublishError::NotConnected))
        );

    if lost {
        Interrupted::ConnectionLost(err)
    } else {
        Interrupted::Failed(err)
    }
}

async fn execute(
    command: Command,
    session: &Session,
    shutdown: &CancellationToken,
    sequence: &AtomicU64,
) -> anyhow::Result<()> {
    todo::topology(session.channel().await?)
        .install()
        .await
        .context("failure to install the topology")?;

    match command {
        Command::Produce { interval_secs } => {
            let publisher = RabbitMQPublisher::open(session).await?;
            publish_every(
                publisher.as_ref(),
                &Destination::queue(TASK_QUEUE),
                PublishOptions::default().persistent(),
                Duration::from_secs(interval_secs),
                shutdown,
                sequence,
                |n| encode_json(&TaskMessage::new(n)),
            )
            .await
        }
        Command::PublishEvents { interval_secs } => {
            let publisher = RabbitMQPublisher::open(session).await?;
            publish_every(
                publisher.as_ref(),
                &Destination::fanout(EVENT_EXCHANGE),
                PublishOptions::default(),
                Duration::from_secs(interval_secs),
                shutdown,
                sequence,
                |n| encode_json(&EventMessage::sample(n)),
            )
            .await
        }
        Command::Consume { work_secs, prefetch } => {
            let handler = Arc::new(TaskHandler::new(Duration::from_secs(work_secs)));
            serve(session, Destination::queue(TASK_QUEUE), prefetch, AckPolicy::tasks(), handler, shutdown).await
        }
        Command::Subscribe { name } => {
            let subscriber = name.map(SubscriberConfig::new).unwrap_or_else(SubscriberConfig::generated);
            info!(subscriber = subscriber.name.as_str(), "subscriber started");

            let handler = Arc::new(EventHandler::new(subscriber));
            serve(
                session,
                Destination::fanout(EVENT_EXCHANGE),
                DEFAULT_PREFETCH,
                AckPolicy::events(),
                handler,
                shutdown,
            )
            .await
        }
        Command::Reply { prefetch } => {
            let publisher = RabbitMQPublisher::open(session).await?;
            let handler = Arc::new(ReplyHandler::new(publisher, |req: Value| movie_details(&req)));
            serve(session, Destination::queue(RPC_QUEUE), prefetch, AckPolicy::tasks(), handler, shutdown).await
        }
        Command::Request { movie_id, timeout_secs } => {
            let router = CorrelationRouter::open(session).await?;
            let request = json!({"task": "get_movie_info", "movie_id": movie_id});

            let destination = Destination::queue(RPC_QUEUE);
            let res = tokio::select! {
                res = router.call_json::<_, RpcResponse>(
                    &destination,
                    &request,
                    Duration::from_secs(timeout_secs),
                ) => res.map(Some),
                _ = shutdown.cancelled() => Ok(None),
            };
            router.shutdown().await;

            if let Some(response) = res.context("movie lookup failed")? {
                info!(status = response.status.as_str(), "received response: {}", response.info);
            }
            Ok(())
        }
    }
}

/// Publishes the payload built for each sequence number until shutdown.
async fn publish_every<F>(
    publisher: &dyn Publisher,
    destination: &Destination,
    opts: PublishOptions,
    interval: Duration,
    shutdown: &CancellationToken,
    sequence: &AtomicU64,
    build: F,
) -> anyhow::Result<()>
where
    F: Fn(u64) -> Result<Vec<u8>, PublishError>,
{
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let n = sequence.fetch_add(1, Ordering::SeqCst);
        let payload = build(n)?;
        match publisher.publish(destination, &payload, &opts).await {
            Ok(()) => info!(destination = %destination, sequence = n, "message published"),
            Err(PublishError::NotConnected) => return Err(PublishError::NotConnected.into()),
            Err(err) => warn!(error = err.to_string(), sequence = n, "message not published"),
        }
    }
    Ok(())
}

/// Runs one subscription until it fails or shutdown is requested, then
/// drains in-flight messages and closes the channel.
async fn serve(
    session: &Session,
    destination: Destination,
    prefetch: u16,
    policy: AckPolicy,
    handler: Arc<dyn ConsumerHandler>,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let dispatcher = RabbitMQDispatcher::open(session).await?;
    let handle = dispatcher
        .subscribe(&destination, prefetch, policy, handler)
        .await
        .with_context(|| format!("failure to subscribe to {destination}"))?;

    let res = wait(handle, shutdown).await;

    if let Err(err) = dispatcher.close().await {
        warn!(error = err.to_string(), "failure to close the channel");
    }
    res
}

async fn wait(handle: SubscriptionHandle, shutdown: &CancellationToken) -> anyhow::Result<()> {
    let stop = handle.cancellation_token();
    let name = handle.name().to_owned();
    let done = handle.join();
    tokio::pin!(done);

    tokio::select! {
        biased;
        res = &mut done => return res.with_context(|| format!("subscription {name} stopped")),
        _ = shutdown.cancelled() => {}
    }

    info!(subscription = name.as_str(), "draining in-flight messages");
    stop.cancel();
    done.await.with_context(|| format!("subscription {name} stopped"))
}
