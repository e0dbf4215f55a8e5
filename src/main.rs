use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use servicelink::config::{self, BrokerConfig, RuntimeConfig};
use servicelink::messaging::{Broker, ConsumeOptions, ConsumerHandle, Message};
use servicelink::{
    with_correlation_id, BoxError, ClientRegistry, ConnectionManager, CorrelationId, RpcChannel,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Typed clients this binary knows how to build.
#[derive(Debug, Clone)]
enum ServiceClient {
    Health(HealthClient<RpcChannel>),
}

struct RunningBroker {
    broker: Broker,
    consumer: ConsumerHandle,
    consume_ctx: CancellationToken,
    heartbeat: tokio::task::JoinHandle<()>,
    heartbeat_ctx: CancellationToken,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    if args.next().as_deref() == Some("init") {
        let path = args
            .next()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(config::CONFIG_FILE_NAME));
        return config::create_default_config_file(&path);
    }

    let config = config::load_config()?;
    let manager = connect_services(&config).await?;
    check_health(&manager).await?;

    let running = match &config.broker {
        Some(broker_config) => Some(start_broker(broker_config).await?),
        None => {
            info!("No broker configured");
            None
        }
    };

    info!("Service running. Press Ctrl+C to exit.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutting down");

    if let Some(running) = running {
        running.heartbeat_ctx.cancel();
        if let Err(e) = running.heartbeat.await {
            warn!(error = %e, "Heartbeat task failed");
        }
        running.consume_ctx.cancel();
        running.consumer.drain().await;
        running.broker.close().await?;
    }
    manager.close().await?;

    info!("Shutdown complete");
    Ok(())
}

async fn connect_services(config: &RuntimeConfig) -> Result<ConnectionManager<ServiceClient>> {
    let registry = Arc::new(ClientRegistry::new());
    let manager = ConnectionManager::new(registry.clone());

    for service in &config.services {
        registry.register(service.name.clone(), |channel: RpcChannel| {
            Ok(ServiceClient::Health(HealthClient::new(channel)))
        })?;
        manager.register(service.clone()).await?;
    }

    if let Err(e) = manager.connect_all().await {
        // Leave nothing half-connected
        manager.close().await.ok();
        return Err(e.into());
    }
    Ok(manager)
}

async fn check_health(manager: &ConnectionManager<ServiceClient>) -> Result<()> {
    with_correlation_id(CorrelationId::generate(), async {
        for name in manager.services().await {
            let ServiceClient::Health(mut client) = manager.get_client(&name).await?;
            let request = HealthCheckRequest {
                service: String::new(),
            };
            match client.check(request).await {
                Ok(response) => {
                    let status = response.into_inner().status();
                    info!(service = %name, status = ?status, "Health check");
                }
                Err(status) => warn!(service = %name, error = %status, "Health check failed"),
            }
        }
        Ok::<(), anyhow::Error>(())
    })
    .await
}

async fn start_broker(config: &BrokerConfig) -> Result<RunningBroker> {
    let broker = Broker::connect_amqp(config).await?;

    let consume_ctx = CancellationToken::new();
    let options = ConsumeOptions {
        auto_ack: false,
        prefetch: config.prefetch,
    };
    let consumer = broker
        .consumer()
        .consume_with_options(
            consume_ctx.clone(),
            |_ctx: CancellationToken, message: Message| async move {
                info!(
                    routing_key = %message.routing_key,
                    bytes = message.payload.len(),
                    redelivered = message.redelivered,
                    correlation_id = message.correlation_id.as_deref().unwrap_or_default(),
                    payload = %String::from_utf8_lossy(&message.payload),
                    "Received message"
                );
                Ok::<(), BoxError>(())
            },
            options,
        )
        .await?;

    let heartbeat_ctx = CancellationToken::new();
    let heartbeat = tokio::spawn(heartbeat(broker.clone(), heartbeat_ctx.clone()));

    Ok(RunningBroker {
        broker,
        consumer,
        consume_ctx,
        heartbeat,
        heartbeat_ctx,
    })
}

async fn heartbeat(broker: Broker, ctx: CancellationToken) {
    let publisher = broker.publisher();
    let mut ticks = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut sequence: u64 = 0;

    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = ticks.tick() => {}
        }
        sequence += 1;
        let body = json!({
            "kind": "heartbeat",
            "sequence": sequence,
            "sent_at": chrono::Utc::now(),
        });
        let published = with_correlation_id(
            CorrelationId::generate(),
            publisher.publish_json(None, &body),
        )
        .await;
        if let Err(e) = published {
            warn!(error = %e, "Heartbeat publish failed");
        }
    }
}
