// Backend API server for the live MiWay map
// Polls GTFS-RT, snapshot and per-route feeds and serves the merged vehicle state

use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, middleware, web};
use clap::Parser;
use serde::{Deserialize, Serialize};

use miway_tracker::config::CliArgs;
use miway_tracker::logging::init_logging;
use miway_tracker::route_shape::ShapeView;
use miway_tracker::{SourceTag, TrackerConfig, TrackerError, TrackerHandle, TrackerService, VehicleRecord};

#[derive(Clone)]
struct AppState {
    tracker: TrackerHandle,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VehiclesPayload {
    revision: u64,
    advisory: bool,
    query: String,
    vehicles: Vec<VehicleRecord>,
}

#[derive(Serialize)]
struct TrailPayload {
    id: String,
    points: Vec<[f64; 2]>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload {
    revision: u64,
    advisory: bool,
    tracked: usize,
    visible: usize,
    selected: Option<String>,
    sources: Vec<miway_tracker::SourceStatus>,
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default, alias = "query")]
    q: String,
}

#[derive(Deserialize)]
struct RefreshQuery {
    source: Option<String>,
}

fn tracker_error_response(e: TrackerError) -> HttpResponse {
    let body = ApiResponse::<ShapeView>::error(e.to_string());
    match e {
        TrackerError::UnknownVehicle(_) => HttpResponse::NotFound().json(body),
        TrackerError::NoShapeKey(_) => HttpResponse::UnprocessableEntity().json(body),
        TrackerError::Shutdown => HttpResponse::ServiceUnavailable().json(body),
    }
}

// ============================================================================
// Vehicle Routes
// ============================================================================

fn vehicles_payload(tracker: &TrackerHandle) -> VehiclesPayload {
    let snapshot = tracker.snapshot();
    VehiclesPayload {
        revision: snapshot.revision,
        advisory: snapshot.advisory,
        query: snapshot.query.clone(),
        vehicles: snapshot.vehicles.clone(),
    }
}

async fn get_vehicles(state: web::Data<AppState>) -> HttpResponse {
    let payload = vehicles_payload(&state.tracker);
    tracing::debug!(count = payload.vehicles.len(), revision = payload.revision, "Vehicles requested");
    HttpResponse::Ok().json(ApiResponse::success(payload))
}

async fn get_trail(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let id = path.into_inner();
    let snapshot = state.tracker.snapshot();

    if snapshot.vehicle(&id).is_none() {
        return HttpResponse::NotFound().json(ApiResponse::<TrailPayload>::error(format!(
            "Vehicle not visible: {}",
            id
        )));
    }

    let points = snapshot.trail(&id);
    HttpResponse::Ok().json(ApiResponse::success(TrailPayload { id, points }))
}

async fn apply_search(state: &AppState, query: &str) -> HttpResponse {
    match state.tracker.set_search_query(query).await {
        Ok(visible) => {
            tracing::debug!(query = %query, visible, "Search applied");
            HttpResponse::Ok().json(ApiResponse::success(vehicles_payload(&state.tracker)))
        }
        Err(e) => tracker_error_response(e),
    }
}

async fn search_get(state: web::Data<AppState>, query: web::Query<SearchQuery>) -> HttpResponse {
    apply_search(&state, &query.q).await
}

async fn search_post(state: web::Data<AppState>, body: web::Json<SearchQuery>) -> HttpResponse {
    apply_search(&state, &body.q).await
}

// ============================================================================
// Selection Routes
// ============================================================================

async fn select_vehicle(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let id = path.into_inner();
    match state.tracker.select(&id).await {
        Ok(view) => HttpResponse::Ok().json(ApiResponse::success(view)),
        Err(e) => tracker_error_response(e),
    }
}

async fn deselect_vehicle(state: web::Data<AppState>) -> HttpResponse {
    match state.tracker.deselect().await {
        Ok(view) => HttpResponse::Ok().json(ApiResponse::success(view)),
        Err(e) => tracker_error_response(e),
    }
}

async fn get_shape(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(state.tracker.shape()))
}

// ============================================================================
// Meta & Control Routes
// ============================================================================

async fn get_status(state: web::Data<AppState>) -> HttpResponse {
    let snapshot = state.tracker.snapshot();
    HttpResponse::Ok().json(ApiResponse::success(StatusPayload {
        revision: snapshot.revision,
        advisory: snapshot.advisory,
        tracked: snapshot.tracked,
        visible: snapshot.vehicles.len(),
        selected: snapshot.selected.clone(),
        sources: snapshot.sources.clone(),
    }))
}

async fn get_fleet(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(state.tracker.fleet_numbers()))
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let snapshot = state.tracker.snapshot();
    HttpResponse::Ok().json(serde_json::json!({
        "status": if snapshot.advisory { "degraded" } else { "healthy" },
        "service": "MiWay Live Tracker",
        "version": env!("CARGO_PKG_VERSION"),
        "sources": snapshot.sources.iter().map(|s| s.tag.as_str()).collect::<Vec<_>>(),
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

async fn force_refresh(state: web::Data<AppState>, query: web::Query<RefreshQuery>) -> HttpResponse {
    let source = match query.source.as_deref().map(str::parse::<SourceTag>).transpose() {
        Ok(source) => source,
        Err(e) => return HttpResponse::BadRequest().json(ApiResponse::<Vec<SourceTag>>::error(e)),
    };

    match state.tracker.refresh(source).await {
        Ok(sources) if sources.is_empty() => HttpResponse::NotFound().json(ApiResponse::<Vec<SourceTag>>::error(
            "No matching source is being polled".to_string(),
        )),
        Ok(sources) => HttpResponse::Ok().json(ApiResponse::success(sources)),
        Err(e) => tracker_error_response(e),
    }
}

// ============================================================================
// Server Setup
// ============================================================================

fn print_banner(config: &TrackerConfig, port: u16) {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║   🚌 MiWay Live Tracker                                    ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");
    println!("🌐 Server running on: http://0.0.0.0:{}", port);
    println!("📡 API available at: http://localhost:{}/api", port);
    for tag in config.enabled_sources() {
        println!("🔄 {:<10} every {}s", tag.as_str(), config.source(tag).interval.as_secs());
    }
    if !config.routes.is_empty() {
        println!("🚏 Routes: {}", config.routes.join(", "));
    }
    println!("⏳ Vehicles hidden after {}s without a report\n", config.stale_after().as_secs());

    println!("📍 Available Routes:");
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│ API - Vehicles:                                             │");
    println!("│   GET    /api/vehicles              - Visible vehicles      │");
    println!("│   GET    /api/vehicles/:id/trail    - Recent fixes          │");
    println!("│   GET    /api/search?q=             - Set search query      │");
    println!("│   POST   /api/search                - Set search query      │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ API - Selection:                                            │");
    println!("│   POST   /api/select/:id            - Select vehicle        │");
    println!("│   DELETE /api/select                - Clear selection       │");
    println!("│   GET    /api/shape                 - Selected route shape  │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ API - Meta & Control:                                       │");
    println!("│   GET    /api/status                - Source health         │");
    println!("│   GET    /api/fleet                 - Fleet number table    │");
    println!("│   POST   /api/refresh?source=       - Poll now              │");
    println!("│   GET    /health                    - Health check          │");
    println!("└─────────────────────────────────────────────────────────────┘\n");
}

async fn run_server(config: TrackerConfig, port: u16) -> std::io::Result<()> {
    let service = TrackerService::start_http(config.clone()).map_err(std::io::Error::other)?;
    let app_state = AppState {
        tracker: service.handle(),
    };

    print_banner(&config, port);

    let result = HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .route("/health", web::get().to(health_check))
            .service(
                web::scope("/api")
                    .route("/vehicles", web::get().to(get_vehicles))
                    .route("/vehicles/{id}/trail", web::get().to(get_trail))
                    .route("/search", web::get().to(search_get))
                    .route("/search", web::post().to(search_post))
                    .route("/select/{id}", web::post().to(select_vehicle))
                    .route("/select", web::delete().to(deselect_vehicle))
                    .route("/shape", web::get().to(get_shape))
                    .route("/status", web::get().to(get_status))
                    .route("/fleet", web::get().to(get_fleet))
                    .route("/refresh", web::post().to(force_refresh)),
            )
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await;

    service.shutdown().await;
    result
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    let args = CliArgs::parse();
    init_logging();

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║                                                            ║");
    println!("║    🚌 MiWay Live Tracker                                   ║");
    println!("║       GTFS-RT + snapshot + per-route feeds                 ║");
    println!("║                                                            ║");
    println!("║    Version: {:<47}║", env!("CARGO_PKG_VERSION"));
    println!("║                                                            ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");

    let port = args.port;
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("\n╔════════════════════════════════════════════════════════════╗");
            eprintln!("║  ❌ INVALID CONFIGURATION                                  ║");
            eprintln!("╚════════════════════════════════════════════════════════════╝");
            eprintln!("\n❌ {}", e);
            eprintln!("\n💡 Troubleshooting:");
            eprintln!("   1. Pass --routes (or MIWAY_ROUTES) to poll the per-route feed");
            eprintln!("   2. Or switch it off with --disable-source per-route");
            eprintln!("   3. Intervals must be at least one second\n");
            std::process::exit(1);
        }
    };

    actix_web::rt::System::new().block_on(run_server(config, port))
}
