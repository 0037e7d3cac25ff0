//! Minimal operational HTTP surface: a health endpoint deriving loop
//! liveness from heartbeat ages.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use opt_trade_engine::{EngineHandle, Health};

pub fn router(handle: EngineHandle) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(handle)
}

async fn health(State(handle): State<EngineHandle>) -> Result<(StatusCode, Json<Health>), StatusCode> {
    let health = handle
        .health()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok((status_for(&health), Json(health)))
}

/// 200 only while running with every loop beating; a stopped engine or a
/// stalled loop degrades to 503 so probes pull the instance.
fn status_for(health: &Health) -> StatusCode {
    if health.running && health.loops_alive == health.loops_total {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Serve the health endpoint until the process exits.
///
/// # Errors
/// Returns an error if the listener fails to bind or serve.
pub async fn serve(addr: String, handle: EngineHandle) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Health endpoint listening on {addr}");
    axum::serve(listener, router(handle)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy() -> Health {
        Health {
            running: true,
            loops_alive: 5,
            loops_total: 5,
            last_heartbeat_age_secs: Some(1),
        }
    }

    #[test]
    fn all_loops_alive_is_ok() {
        assert_eq!(status_for(&healthy()), StatusCode::OK);
    }

    #[test]
    fn stalled_loop_degrades_to_unavailable() {
        let health = Health {
            loops_alive: 4,
            ..healthy()
        };
        assert_eq!(status_for(&health), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn stopped_engine_is_unavailable() {
        let health = Health {
            running: false,
            ..healthy()
        };
        assert_eq!(status_for(&health), StatusCode::SERVICE_UNAVAILABLE);
    }
}
