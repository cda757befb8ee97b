use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use chrono::Utc;
use log::info;
use relay_broker::BrokerLink;
use relay_models::jobs::format_timestamp;
use serde::Serialize;
use tokio::{net::TcpListener, sync::Notify};

use crate::notifier::NotificationSender;

#[derive(Clone)]
pub struct HealthState {
    link: Arc<BrokerLink>,
    sender: Arc<dyn NotificationSender>,
    started: Instant,
}

impl HealthState {
    pub fn new(link: Arc<BrokerLink>, sender: Arc<dyn NotificationSender>) -> Self {
        Self {
            link,
            sender,
            started: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub broker: bool,
    pub notifier: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub timestamp: String,
    pub uptime_seconds: u64,
    pub services: ServiceHealth,
}

impl HealthReport {
    pub fn collect(state: &HealthState) -> Self {
        let services = ServiceHealth {
            broker: state.link.is_connected(),
            notifier: state.sender.is_ready(),
        };
        let status = if services.broker && services.notifier {
            "ok"
        } else {
            "unavailable"
        };
        Self {
            status,
            timestamp: format_timestamp(Utc::now()),
            uptime_seconds: state.uptime().as_secs(),
            services,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.services.broker && self.services.notifier
    }
}

async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthReport>) {
    let report = HealthReport::collect(&state);
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

/// Serve the health endpoint until `shutdown` is notified.
pub async fn serve(
    listener: TcpListener,
    state: HealthState,
    shutdown: Arc<Notify>,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.notified().await;
            info!("Shutting down health endpoint...");
        })
        .await
}
