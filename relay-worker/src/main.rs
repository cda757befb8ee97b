use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use relay_broker::{
    BrokerLink, Consumer, Publisher, Transport, adapters::amqp::AmqpTransport,
    in_memory::InMemoryBroker,
};
use relay_database::{
    CompletionStore, in_memory::InMemoryStore, initialize_store, postgres::PostgresStore,
    sqlite::SqliteStore,
};
use relay_models::errors::{RuntimeError, SendableError};
use relay_utilities::startup;
use relay_worker::{
    config::{BrokerBackend, CliArgs, Config, NotifierBackend, StoreBackend},
    handler::NotificationHandler,
    health::{self, HealthState},
    notifier::{FcmSender, LoggingSender, NotificationSender, ServiceAccount},
};
use tokio::{net::TcpListener, sync::Notify};

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let args = CliArgs::parse();
    startup::startup("FCM Relay", args.log_level, args.log_file.as_deref())?;

    let config = Config::from_args(args)
        .inspect_err(|err| error!("Invalid configuration: {}", err))?;

    info!("Initializing notification sender...");
    let sender = build_sender(&config.notifier)?;

    match config.store.clone() {
        StoreBackend::Sqlite { path } => {
            info!("Recording completions in SQLite database at {}", path);
            let store = SqliteStore::new(&path)
                .await
                .map_err(|err| RuntimeError::boxed("relay.store.connect", err.to_string()))?;
            run(config, Arc::new(store), sender).await
        }
        StoreBackend::Postgres { url } => {
            info!("Recording completions in Postgres");
            let store = PostgresStore::new(&url)
                .await
                .map_err(|err| RuntimeError::boxed("relay.store.connect", err.to_string()))?;
            run(config, Arc::new(store), sender).await
        }
        StoreBackend::Memory => {
            warn!("Recording completions in memory; they are lost on restart");
            run(config, Arc::new(InMemoryStore::new()), sender).await
        }
    }
}

fn build_sender(notifier: &NotifierBackend) -> Result<Arc<dyn NotificationSender>, SendableError> {
    match notifier {
        NotifierBackend::Fcm {
            project_id,
            service_account_path,
            service_account_json,
        } => {
            let account = ServiceAccount::load(
                service_account_path.as_deref(),
                service_account_json.as_deref(),
            )
            .map_err(|err| RuntimeError::boxed("relay.notifier.credentials", err.to_string()))?;
            let sender = FcmSender::new(project_id, account)
                .map_err(|err| RuntimeError::boxed("relay.notifier.credentials", err.to_string()))?;
            Ok(Arc::new(sender))
        }
        NotifierBackend::Log => {
            warn!("Notifications are logged, not delivered");
            Ok(Arc::new(LoggingSender::new()))
        }
    }
}

fn build_transport(broker: &BrokerBackend) -> Arc<dyn Transport> {
    match broker {
        BrokerBackend::Amqp { url } => Arc::new(AmqpTransport::new(url.as_str())),
        BrokerBackend::Memory => {
            warn!("Using an in-memory broker; nothing outside this process can publish jobs");
            Arc::new(InMemoryBroker::new())
        }
    }
}

async fn run<C: CompletionStore>(
    config: Config,
    store: Arc<C>,
    sender: Arc<dyn NotificationSender>,
) -> Result<(), SendableError> {
    initialize_store(store.as_ref())
        .await
        .map_err(|err| RuntimeError::boxed("relay.store.init", err.to_string()))?;

    info!("Connecting to broker...");
    let link = Arc::new(BrokerLink::new(
        build_transport(&config.broker),
        config.topology.clone(),
        config.reconnect.clone(),
    ));
    let mut supervisor = {
        let link = Arc::clone(&link);
        tokio::spawn(async move { link.run().await })
    };

    info!("Starting message consumer...");
    let handler = Arc::new(NotificationHandler::new(
        Arc::clone(&sender),
        Arc::clone(&store),
        Publisher::new(Arc::clone(&link)),
    ));
    let consumer_task = {
        let consumer = Consumer::new(Arc::clone(&link), config.consumer_tag.as_str());
        tokio::spawn(async move { consumer.run(handler).await })
    };

    let listener = TcpListener::bind((config.bind.as_str(), config.port)).await?;
    info!("Health endpoint listening on {}", listener.local_addr()?);
    let server_shutdown = Arc::new(Notify::new());
    let server_task = tokio::spawn(health::serve(
        listener,
        HealthState::new(Arc::clone(&link), sender),
        Arc::clone(&server_shutdown),
    ));
    info!("Service is ready to process notifications");

    let outcome: Result<(), SendableError> = tokio::select! {
        signal = shutdown_signal() => {
            info!("{} received, shutting down gracefully...", signal?);
            Ok(())
        }
        result = &mut supervisor => Err(match result {
            Ok(Err(err)) => RuntimeError::boxed("relay.broker.unreachable", err.to_string()),
            Ok(Ok(())) => RuntimeError::boxed("relay.broker.stopped", "broker link stopped unexpectedly"),
            Err(err) => RuntimeError::boxed("relay.broker.supervisor", err.to_string()),
        }),
    };
    if let Err(err) = &outcome {
        error!("Broker link failed, shutting down: {}", err);
    }
    let supervisor_running = outcome.is_ok();

    let graceful = async {
        server_shutdown.notify_one();
        link.request_close();

        if let Err(err) = consumer_task.await {
            error!("Consumer task join error: {}", err);
        }
        if let Err(err) = link.close().await {
            error!("Error closing broker connection: {}", err);
        }
        if supervisor_running {
            if let Err(err) = supervisor.await {
                error!("Broker supervisor join error: {}", err);
            }
        }
        match server_task.await {
            Ok(Ok(())) => info!("HTTP server closed"),
            Ok(Err(err)) => error!("Health endpoint error: {}", err),
            Err(err) => error!("Health endpoint task join error: {}", err),
        }
        store.close().await;
    };

    if tokio::time::timeout(config.shutdown_timeout, graceful).await.is_err() {
        error!("Forced shutdown after {:?}", config.shutdown_timeout);
        std::process::exit(1);
    }
    info!("All connections closed");
    outcome
}

async fn shutdown_signal() -> Result<&'static str, SendableError> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                Ok("SIGINT")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("Ctrl+C")
    }
}
