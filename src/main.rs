#![forbid(unsafe_code)]

use anyhow::Result;
use lecturehall::lecture::Collaborators;
use lecturehall::{MediaConfig, RoomManager, ServerMetrics, SignalingServer};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lecturehall=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("LectureHall - Starting media routing server");

    let mut media_config = MediaConfig::default();

    // Set announced IP from environment variable (required for ICE candidates)
    if let Ok(ip) = std::env::var("ANNOUNCE_IP") {
        info!("Using ANNOUNCE_IP={}", ip);
        let addr = ip
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid ANNOUNCE_IP: {ip}"))?;
        media_config = media_config.with_announced_ip(addr);
    } else {
        info!("No ANNOUNCE_IP set, candidates will use the listen address");
    }

    let metrics = ServerMetrics::new();
    // Standalone collaborators: the deployed platform wires the course
    // service's access control, lifecycle and attendance here instead
    let collaborators = Collaborators::permissive();
    let room_manager = Arc::new(RoomManager::new(
        media_config,
        collaborators,
        metrics.clone(),
    ));

    info!("Room manager initialized");

    let signaling_server = SignalingServer::new(room_manager.clone(), metrics);
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);

    info!("Starting signaling server on port {}", port);

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            room_manager.shutdown().await;
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
