//! Plan lifecycle service entry point

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use route_planner::app_state::AppState;
use route_planner::directions::HttpDirections;
use route_planner::materialize::Materializer;
use route_planner::plan_store::PlanStore;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("route_planner=info,tower_http=info")),
        )
        .init();

    let bind_addr = env_or("BIND_ADDR", "0.0.0.0:8080");
    let data_dir = env_or("DATA_DIR", "./data");
    let provider_url = env_or(
        "DIRECTIONS_URL",
        "https://apis.openapi.sk.com/tmap/routes/routeSequential30",
    );
    let provider_key = env_or("DIRECTIONS_APP_KEY", "");
    let max_in_flight: usize = env_or("PROVIDER_MAX_IN_FLIGHT", "4").parse().unwrap_or(4);
    let per_call_timeout =
        Duration::from_secs(env_or("PROVIDER_CALL_TIMEOUT_S", "15").parse().unwrap_or(15));
    let per_vehicle_timeout =
        Duration::from_secs(env_or("PROVIDER_VEHICLE_TIMEOUT_S", "60").parse().unwrap_or(60));

    // The blocking provider client owns its own I/O thread; build it before
    // the server runtime starts
    let provider = HttpDirections::new(&provider_url, &provider_key)
        .and_then(|client| client.with_timeouts(per_call_timeout, per_vehicle_timeout))
        .expect("directions client construction failed");

    let state = Arc::new(AppState::new(
        PlanStore::new(&data_dir),
        Materializer::new(Arc::new(provider), max_in_flight),
    ));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime can be created");

    runtime.block_on(async move {
        let app = route_planner::handlers::create_routes()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
            .with_state(state);

        let addr: SocketAddr = bind_addr.parse().expect("BIND_ADDR must be host:port");
        info!(%addr, %data_dir, max_in_flight, "route planner listening");

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .expect("failed to bind listener");
        axum::serve(listener, app).await.expect("server error");
    });
}
