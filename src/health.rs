//! # Health & Metrics Endpoints
//!
//! Plain HTTP views of the bridge for load balancers and dashboards. Both read
//! the connection registry without touching any session lock.

use crate::connection::SERVER_NAME;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;
    let metrics = state.connections.get_metrics();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "backend": {
            "mode": config.backend.mode,
            "url": config.backend.url
        },
        "memory": get_memory_info(),
        "system": get_load_status(metrics.active_connections, config.websocket.max_connections)
    }))
}

/// Bridge counters plus a per-connection breakdown.
pub async fn bridge_metrics(state: web::Data<AppState>) -> HttpResponse {
    let uptime_seconds = state.uptime_seconds();
    let metrics = state.connections.get_metrics();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "bridge": metrics,
        "connections": state.connections.connection_metrics(),
        "chunks_per_second": if uptime_seconds > 0 {
            metrics.total_audio_chunks_processed as f64 / uptime_seconds as f64
        } else {
            0.0
        },
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let read_kb = |prefix: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(prefix))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": read_kb("VmRSS:"),
                "virtual_memory_bytes": read_kb("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for pid {}", process::id())
    })
}

fn get_load_status(active: usize, max: usize) -> serde_json::Value {
    let usage = if max > 0 { active as f64 / max as f64 } else { 0.0 };

    let status = if usage > 0.9 {
        "high_load"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "connection_usage_percent": (usage * 100.0).round(),
        "max_connections": max,
        "current_connections": active
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_load_status_thresholds() {
        assert_eq!(get_load_status(1, 10)["status"], "normal");
        assert_eq!(get_load_status(8, 10)["status"], "moderate_load");
        assert_eq!(get_load_status(10, 10)["status"], "high_load");
        assert_eq!(get_load_status(0, 0)["connection_usage_percent"], 0.0);
    }

    #[actix_web::test]
    async fn test_health_endpoint() {
        use actix_web::{test, App};

        let state = AppState::new(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check))
                .route("/metrics", web::get().to(bridge_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"]["name"], SERVER_NAME);
        assert_eq!(body["backend"]["mode"], "mock");

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["bridge"]["active_connections"], 0);
        assert!(body["connections"].as_array().unwrap().is_empty());
    }
}
