use std::{path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};
use relay_broker::{ReconnectPolicy, Topology};
use relay_models::errors::{RuntimeError, SendableError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BrokerKind {
    Amqp,
    Memory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DatabaseKind {
    Sqlite,
    Postgres,
    Memory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum NotifierKind {
    Fcm,
    Log,
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Relays queued push jobs to FCM and announces completions", long_about = None)]
pub struct CliArgs {
    /// Broker backend to connect to
    #[arg(long, env = "RELAY_BROKER", value_enum, default_value_t = BrokerKind::Amqp)]
    pub broker: BrokerKind,

    /// AMQP connection URL (required when --broker=amqp)
    #[arg(long, env = "RABBITMQ_URL")]
    pub rabbitmq_url: Option<String>,

    /// Durable work queue jobs are consumed from
    #[arg(long, env = "RABBITMQ_QUEUE_NAME", default_value = "notification.fcm")]
    pub queue_name: String,

    /// Durable fanout exchange results are broadcast on
    #[arg(long, env = "RABBITMQ_TOPIC_NAME", default_value = "notification.done")]
    pub topic_name: String,

    #[arg(long, env = "RABBITMQ_CONSUMER_TAG", default_value = "fcm-relay")]
    pub consumer_tag: String,

    /// Seconds to wait before reconnecting to the broker
    #[arg(long, env = "RABBITMQ_RECONNECT_DELAY_SECONDS", default_value_t = 5)]
    pub reconnect_delay_seconds: u64,

    /// Give up after this many consecutive failed connection attempts (retries forever when unset)
    #[arg(long, env = "RABBITMQ_RECONNECT_MAX_ATTEMPTS")]
    pub reconnect_max_attempts: Option<u32>,

    /// Database backend used to record completed jobs
    #[arg(long, env = "RELAY_DATABASE", value_enum, default_value_t = DatabaseKind::Sqlite)]
    pub database: DatabaseKind,

    /// Path to the SQLite database file (used when --database=sqlite)
    #[arg(long, env = "SQLITE_PATH", default_value = "fcm_jobs.db")]
    pub sqlite_path: String,

    /// Connection string for the database (required when --database=postgres)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Notification backend
    #[arg(long, env = "RELAY_NOTIFIER", value_enum, default_value_t = NotifierKind::Fcm)]
    pub notifier: NotifierKind,

    #[arg(long, env = "FIREBASE_PROJECT_ID")]
    pub firebase_project_id: Option<String>,

    /// Service account key file, preferred over the inline JSON when the file exists
    #[arg(long, env = "FIREBASE_SERVICE_ACCOUNT_PATH")]
    pub firebase_service_account_path: Option<PathBuf>,

    #[arg(long, env = "FIREBASE_SERVICE_ACCOUNT_JSON", hide_env_values = true)]
    pub firebase_service_account_json: Option<String>,

    /// Address the health endpoint binds to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Hard limit for a graceful shutdown before the process exits with a failure status
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECONDS", default_value_t = 10)]
    pub shutdown_timeout_seconds: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info", value_parser = parse_level)]
    pub log_level: log::LevelFilter,

    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerBackend {
    Amqp { url: String },
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite { path: String },
    Postgres { url: String },
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierBackend {
    Fcm {
        project_id: String,
        service_account_path: Option<PathBuf>,
        service_account_json: Option<String>,
    },
    Log,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerBackend,
    pub topology: Topology,
    pub consumer_tag: String,
    pub reconnect: ReconnectPolicy,
    pub store: StoreBackend,
    pub notifier: NotifierBackend,
    pub bind: String,
    pub port: u16,
    pub shutdown_timeout: Duration,
}

impl Config {
    pub fn from_args(args: CliArgs) -> Result<Self, SendableError> {
        let broker = match args.broker {
            BrokerKind::Amqp => BrokerBackend::Amqp {
                url: required(
                    args.rabbitmq_url,
                    "relay.config.missing_rabbitmq_url",
                    "--rabbitmq-url (RABBITMQ_URL) must be provided when --broker=amqp",
                )?,
            },
            BrokerKind::Memory => BrokerBackend::Memory,
        };

        let store = match args.database {
            DatabaseKind::Sqlite => StoreBackend::Sqlite {
                path: args.sqlite_path,
            },
            DatabaseKind::Postgres => StoreBackend::Postgres {
                url: required(
                    args.database_url,
                    "relay.config.missing_database_url",
                    "--database-url (DATABASE_URL) must be provided when --database=postgres",
                )?,
            },
            DatabaseKind::Memory => StoreBackend::Memory,
        };

        let notifier = match args.notifier {
            NotifierKind::Fcm => {
                let project_id = required(
                    args.firebase_project_id,
                    "relay.config.missing_firebase_project",
                    "--firebase-project-id (FIREBASE_PROJECT_ID) must be provided when --notifier=fcm",
                )?;
                let service_account_path = args
                    .firebase_service_account_path
                    .filter(|path| !path.as_os_str().is_empty());
                let service_account_json = non_blank(args.firebase_service_account_json);
                if service_account_path.is_none() && service_account_json.is_none() {
                    return Err(RuntimeError::boxed(
                        "relay.config.missing_service_account",
                        "Either FIREBASE_SERVICE_ACCOUNT_PATH or FIREBASE_SERVICE_ACCOUNT_JSON must be provided",
                    ));
                }
                NotifierBackend::Fcm {
                    project_id,
                    service_account_path,
                    service_account_json,
                }
            }
            NotifierKind::Log => NotifierBackend::Log,
        };

        if args.reconnect_delay_seconds == 0 {
            return Err(RuntimeError::boxed(
                "relay.config.invalid_reconnect_delay",
                "--reconnect-delay-seconds must be at least 1",
            ));
        }
        if args.reconnect_max_attempts == Some(0) {
            return Err(RuntimeError::boxed(
                "relay.config.invalid_reconnect_attempts",
                "--reconnect-max-attempts must be at least 1 when set",
            ));
        }
        if args.queue_name.trim().is_empty() || args.topic_name.trim().is_empty() {
            return Err(RuntimeError::boxed(
                "relay.config.invalid_topology",
                "queue and topic names must not be blank",
            ));
        }

        Ok(Config {
            broker,
            topology: Topology::new(args.queue_name, args.topic_name),
            consumer_tag: args.consumer_tag,
            reconnect: ReconnectPolicy {
                delay: Duration::from_secs(args.reconnect_delay_seconds),
                max_attempts: args.reconnect_max_attempts,
                ..ReconnectPolicy::default()
            },
            store,
            notifier,
            bind: args.bind,
            port: args.port,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_seconds),
        })
    }
}

fn parse_level(value: &str) -> Result<log::LevelFilter, String> {
    value
        .parse()
        .map_err(|_| format!("unknown log level '{value}'"))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn required(value: Option<String>, code: &str, message: &str) -> Result<String, SendableError> {
    non_blank(value).ok_or_else(|| RuntimeError::boxed(code, message))
}
