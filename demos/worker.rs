use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use refresh_queue::{
    ConnectionManager, EngineConfig, Handler, Message, Progress, Producer, QueueDefinition,
    Registry, Role, TaskError, Transport,
    dedup::{InMemoryMarkers, MarkerStore},
    jobs::{AppMessage, PlayerMessage},
    sub_task,
    transport::rabbitmq::AmqpConnector,
};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

struct RefreshApp;

#[async_trait]
impl Handler for RefreshApp {
    type Job = AppMessage;

    async fn handle(&self, batch: Vec<Message<AppMessage>>) {
        for message in batch {
            let id = message.payload().id;
            let progress = message
                .coordinator
                .stage([
                    sub_task(move |_| async move {
                        tracing::info!(id, "Fetching store page");
                        Ok(())
                    }),
                    sub_task(move |_| async move {
                        if id % 7 == 0 {
                            return Err(TaskError::retry("store API rate limited"));
                        }
                        tracing::info!(id, "Fetching player counts");
                        Ok(())
                    }),
                ])
                .await;

            if progress == Progress::Decided {
                continue;
            }
            message
                .coordinator
                .guarded(tokio::time::sleep(Duration::from_millis(20)))
                .await;
            message.coordinator.finish().await;
        }
    }
}

struct RefreshPlayer;

#[async_trait]
impl Handler for RefreshPlayer {
    type Job = PlayerMessage;

    async fn handle(&self, batch: Vec<Message<PlayerMessage>>) {
        for message in batch {
            tracing::info!(id = message.payload().id, attempt = message.headers().attempt, "Refreshing player");
            message.coordinator.finish().await;
        }
    }
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let config = EngineConfig::load().unwrap();
    let settings = config.settings();

    let producer = ConnectionManager::new(
        AmqpConnector::default().with_connection_name(config.connection_name(Role::Producer)),
        config.rabbit_dsn.clone(),
        Role::Producer,
        config.reconnect_policy(),
    );
    let consumer = ConnectionManager::new(
        AmqpConnector::default().with_connection_name(config.connection_name(Role::Consumer)),
        config.rabbit_dsn.clone(),
        Role::Consumer,
        config.reconnect_policy(),
    );
    producer.connect().await.unwrap();
    consumer.connect().await.unwrap();

    let markers: Arc<dyn MarkerStore> = match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => Arc::new(
            refresh_queue::dedup::redis::RedisMarkers::new(url, "refresh-queue")
                .await
                .unwrap(),
        ),
        _ => Arc::new(InMemoryMarkers::default()),
    };

    let registry = Registry::new(
        Transport::new(producer.clone()).boxed(),
        Arc::new(consumer.clone()),
        markers,
        settings.clone(),
    );
    registry
        .register(
            [
                config.apply(QueueDefinition::consumer(RefreshApp).with_max_attempts(5)),
                config.apply(QueueDefinition::consumer(RefreshPlayer)),
                QueueDefinition::delay_router(&settings),
                QueueDefinition::dead_letter(&settings),
            ],
            true,
        )
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let jobs = Producer::new(Arc::clone(&registry));
    let mut id = 1;
    while !cancel.is_cancelled() {
        if let Err(error) = jobs.enqueue_app(id, false).await {
            tracing::warn!(%error, "Enqueue failed");
        }
        id += 1;
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    }

    registry.shutdown().await;
    producer.shutdown();
    consumer.shutdown();
}
