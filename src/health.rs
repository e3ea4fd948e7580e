use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    let session_usage = session_usage(metrics.active_sessions, config.performance.max_concurrent_sessions);
    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "upstream": {
            "live_model": config.upstream.live_model,
            "text_model": config.upstream.text_model,
            "configured": !config.upstream.api_key.is_empty(),
            "text_generation": state.services.generator.is_some()
        },
        "sessions": {
            "active": metrics.active_sessions,
            "max": config.performance.max_concurrent_sessions,
            "usage_percent": (session_usage * 100.0).round(),
            "status": status
        },
        "memory": get_memory_info()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "sessions": {
            "opened": metrics.sessions_opened,
            "rejected": metrics.sessions_rejected,
            "active": metrics.active_sessions,
            "max": config.performance.max_concurrent_sessions
        },
        "upstream": {
            "reconnects": metrics.upstream_reconnects
        },
        "behavior": {
            "emotion_updates": metrics.emotion_updates,
            "burst_follow_ups": metrics.burst_follow_ups,
            "idle_prompts": metrics.idle_prompts,
            "proactive_messages": state.proactive.delivered(),
            "pending_proactive_locks": state.proactive.locks().len()
        },
        "memory": get_memory_info()
    }))
}

fn session_usage(active: u32, max: usize) -> f64 {
    if max > 0 {
        active as f64 / max as f64
    } else {
        0.0
    }
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())) {
            let field = |name: &str| -> u64 {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::live::testing::FakeConnector;
    use crate::services::{InMemoryStore, Services};
    use actix_web::{test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_metrics_report_session_counters() {
        let (connector, _upstreams) = FakeConnector::new();
        let state = AppState::new(
            AppConfig::default(),
            Services::in_memory(Arc::new(InMemoryStore::new())),
            connector,
        );
        state.record_session_opened();
        state.record_reconnect();
        state.record_reconnect();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/metrics", web::get().to(detailed_metrics))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let metrics: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/api/v1/metrics").to_request()).await;
        assert_eq!(metrics["sessions"]["opened"], 1);
        assert_eq!(metrics["upstream"]["reconnects"], 2);
        assert_eq!(metrics["behavior"]["proactive_messages"], 0);

        let health: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["upstream"]["configured"], false);
        assert_eq!(health["sessions"]["status"], "normal");
    }

    #[::core::prelude::v1::test]
    fn test_session_usage() {
        assert_eq!(session_usage(5, 10), 0.5);
        assert_eq!(session_usage(3, 0), 0.0);
    }
}
