//! Echo service: answers every `Ping` on the topic with a `Pong`, and every `Pong`
//! with the next `Ping`, so a single seed message keeps a conversation going.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use envconfig::Envconfig;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use partition_pipeline::config::Config;
use partition_pipeline::consumer::{consumer_for_topic, ConsumerHandle};
use partition_pipeline::dictionary::{HandlerContext, MessageHandler, TypeDictionary};
use partition_pipeline::envelope::{reply_to, request_for, Payload, Topic, TraceContext};
use partition_pipeline::processor::DiscardFailedMessages;
use partition_pipeline::producer::Producer;

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    sequence: u64,
    sent_at: DateTime<Utc>,
}

impl Payload for Ping {
    const NAME: &'static str = "demo.Ping";
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong {
    sequence: u64,
    ping_sent_at: DateTime<Utc>,
}

impl Payload for Pong {
    const NAME: &'static str = "demo.Pong";
}

struct PingHandler {
    producer: Producer,
}

#[async_trait]
impl MessageHandler<Ping> for PingHandler {
    async fn handle(&self, ping: Ping, context: &HandlerContext) -> anyhow::Result<()> {
        let pong = Pong {
            sequence: ping.sequence,
            ping_sent_at: ping.sent_at,
        };
        let reply = reply_to(&context.envelope, &pong, TraceContext::default())?;
        self.producer.send(&reply).await?;
        Ok(())
    }
}

struct PongHandler {
    producer: Producer,
    topic: Topic,
    reply_topic: Topic,
    interval: Duration,
}

#[async_trait]
impl MessageHandler<Pong> for PongHandler {
    async fn handle(&self, pong: Pong, context: &HandlerContext) -> anyhow::Result<()> {
        let round_trip = Utc::now() - pong.ping_sent_at;
        info!(
            sequence = pong.sequence,
            partition = %context.partition,
            round_trip_ms = round_trip.num_milliseconds(),
            "Received pong"
        );

        tokio::time::sleep(self.interval).await;

        let ping = Ping {
            sequence: pong.sequence + 1,
            sent_at: Utc::now(),
        };
        let request = request_for(
            &self.topic,
            &self.reply_topic,
            context.envelope.key.clone(),
            &ping,
            context.envelope.context.clone(),
        )?;
        self.producer.send(&request).await?;
        Ok(())
    }
}

fn setup_tracing() -> anyhow::Result<()> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse()?),
    );
    tracing_subscriber::registry().with(log_layer).init();
    Ok(())
}

async fn shutdown_signal(consumer: &ConsumerHandle) {
    let stopped = async {
        while !consumer.is_finished() {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        warn!("Consumer loop stopped on its own");
    };

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Received ctrl-c, shutting down");
        },
        () = stopped => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing()?;

    let config = Config::init_from_env().context("Invalid configuration")?;

    if let Some(address) = &config.metrics_bind_address {
        let address: SocketAddr = address
            .parse()
            .with_context(|| format!("Invalid metrics bind address {address}"))?;
        PrometheusBuilder::new()
            .with_http_listener(address)
            .install()
            .context("Failed to install the Prometheus exporter")?;
        info!("Metrics exporter listening on {}", address);
    }

    let producer = Producer::from_config(&config.kafka).context("Failed to create producer")?;
    let topic = Topic::new(config.topic.clone());
    let reply_topic = Topic::new(config.reply_topic.clone());

    let dictionary = TypeDictionary::builder()
        .register::<Ping, _>(PingHandler {
            producer: producer.clone(),
        })
        .register::<Pong, _>(PongHandler {
            producer: producer.clone(),
            topic: topic.clone(),
            reply_topic: reply_topic.clone(),
            interval: Duration::from_secs(1),
        })
        .build();

    let consumer = consumer_for_topic(
        &config,
        Arc::new(dictionary),
        Arc::new(DiscardFailedMessages),
    )
    .context("Failed to start consumer")?;

    let seed = request_for(
        &topic,
        &reply_topic,
        Some(uuid::Uuid::now_v7().to_string()),
        &Ping {
            sequence: 0,
            sent_at: Utc::now(),
        },
        TraceContext::new_trace(),
    )?;
    let report = producer
        .send(&seed)
        .await
        .context("Failed to send the first ping")?;
    info!(partition = report.partition, offset = report.offset, "Sent first ping");

    shutdown_signal(&consumer).await;

    consumer
        .shutdown()
        .await
        .context("Consumer stopped with an error")?;
    info!("Shutdown complete");
    Ok(())
}
