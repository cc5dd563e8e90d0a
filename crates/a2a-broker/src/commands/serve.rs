use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use a2a_broker::{
    adapters::rest::{AppState, create_router},
    config::{BrokerConfig, BrokerConfigBuilder},
    demo_agent::WeatherAgent,
    service::A2aBroker,
};
use clap::Parser;
use shared::error::CommonError;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, Parser)]
pub struct ServeParams {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "8080")]
    pub port: u16,
    /// Deadline for requests that do not carry their own, in milliseconds
    #[arg(long, default_value = "300000")]
    pub default_deadline_ms: u64,
    /// Events buffered per session stream before publishers are refused
    #[arg(long, default_value = "1024")]
    pub stream_capacity: usize,
    /// Seconds without a heartbeat before an agent is marked degraded
    #[arg(long, default_value = "90")]
    pub heartbeat_timeout_secs: u64,
}

impl ServeParams {
    fn broker_config(&self) -> Result<BrokerConfig, CommonError> {
        BrokerConfigBuilder::default()
            .default_deadline(Duration::from_millis(self.default_deadline_ms))
            .stream_capacity(self.stream_capacity)
            .heartbeat_timeout(Duration::from_secs(self.heartbeat_timeout_secs))
            .build()
            .map_err(|e| CommonError::InvalidRequest {
                msg: format!("invalid broker configuration: {e}"),
                source: None,
            })
    }
}

pub async fn cmd_serve(params: ServeParams) -> Result<(), CommonError> {
    let config = params.broker_config()?;
    let addr: SocketAddr = format!("{}:{}", params.host, params.port).parse()?;

    let broker = A2aBroker::new(config);
    broker.register_agent(WeatherAgent::agent(), Arc::new(WeatherAgent))?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let heartbeat_monitor = broker.spawn_heartbeat_monitor(shutdown_tx.subscribe());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Broker listening on http://{}", listener.local_addr()?);

    let app = create_router(AppState::new(broker));
    let mut server_shutdown = shutdown_tx.subscribe();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = server_shutdown.recv().await;
    });

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => warn!("Failed to listen for Ctrl+C: {e}"),
        }
        let _ = signal_tx.send(());
    });

    let served = server.await;
    let _ = shutdown_tx.send(());
    heartbeat_monitor.wait_for_shutdown().await;

    served?;
    info!("Broker stopped");
    Ok(())
}
