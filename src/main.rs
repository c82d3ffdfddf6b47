// mBajk availability board server
// Serves the station catalog and the prediction board to the map front end.

use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, middleware, web};
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

mod pipeline;
mod stations;
mod store;

use pipeline::{MbajkHttpFetcher, PredictionBoard, PredictionFetcher};
use stations::Station;
use store::SelectionStore;

#[derive(Clone)]
struct AppState {
    store: Arc<SelectionStore>,
    board: Arc<PredictionBoard>,
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

// ============================================================================
// Configuration
// ============================================================================

struct ServiceConfig {
    base_url: String,
    timeout_secs: u64,
    bind_addr: String,
}

impl ServiceConfig {
    const DEFAULT_BASE_URL: &'static str = "http://localhost:8000";
    const DEFAULT_TIMEOUT_SECS: u64 = 30;
    const DEFAULT_BIND_ADDR: &'static str = "0.0.0.0:8080";

    fn from_env() -> Self {
        ServiceConfig {
            base_url: std::env::var("MBAJK_API_URL")
                .unwrap_or_else(|_| Self::DEFAULT_BASE_URL.to_string()),
            timeout_secs: std::env::var("MBAJK_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Self::DEFAULT_TIMEOUT_SECS),
            bind_addr: std::env::var("BIND_ADDR")
                .unwrap_or_else(|_| Self::DEFAULT_BIND_ADDR.to_string()),
        }
    }
}

// ============================================================================
// API Endpoints
// ============================================================================

async fn get_stations(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(state.store.registry()))
}

async fn get_station_by_location(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let location = path.into_inner();

    match state
        .store
        .registry()
        .iter()
        .find(|s| s.location.eq_ignore_ascii_case(&location))
    {
        Some(station) => HttpResponse::Ok().json(ApiResponse::success(station)),
        None => HttpResponse::NotFound().json(ApiResponse::<Station>::error(format!(
            "Station '{}' not found",
            location
        ))),
    }
}

#[derive(Deserialize)]
struct SelectRequest {
    latitude: f64,
    longitude: f64,
}

/// Marker activation from the map: resolve the station by the coordinates
/// the marker reports and make it the current selection.
async fn select_station(
    state: web::Data<AppState>,
    body: web::Json<SelectRequest>,
) -> HttpResponse {
    match state.store.find_by_coordinates(body.latitude, body.longitude) {
        Some(station) => {
            let station = station.clone();
            info!("Station selected: {}", station.location);
            state.store.select(station.clone());
            HttpResponse::Ok().json(ApiResponse::success(station))
        }
        None => HttpResponse::NotFound().json(ApiResponse::<Station>::error(format!(
            "No station at ({}, {})",
            body.latitude, body.longitude
        ))),
    }
}

/// Dismissing the detail view clears the selection; the pipeline drops back
/// to idle.
async fn clear_selection(state: web::Data<AppState>) -> HttpResponse {
    state.store.clear();
    HttpResponse::Ok().json(ApiResponse::success("Selection cleared"))
}

async fn get_selection(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(state.store.current()))
}

async fn get_board(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(state.board.snapshot().await))
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "mBajk Availability Board",
        "version": env!("CARGO_PKG_VERSION"),
        "stations": state.store.registry().len(),
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

// ============================================================================
// Server Setup
// ============================================================================

fn app_state(config: &ServiceConfig, catalog: Vec<Station>) -> std::io::Result<AppState> {
    let fetcher = MbajkHttpFetcher::new(&config.base_url, config.timeout_secs)
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    let store = Arc::new(SelectionStore::new(catalog));
    let board = Arc::new(PredictionBoard::new(
        Arc::new(fetcher) as Arc<dyn PredictionFetcher>
    ));

    // Pipeline task: re-runs the fetch sequence on every selection change.
    tokio::spawn(Arc::clone(&board).watch_selection(store.subscribe()));

    Ok(AppState { store, board })
}

async fn run_server(config: ServiceConfig, catalog: Vec<Station>) -> std::io::Result<()> {
    let state = app_state(&config, catalog)?;

    println!("🚲 mBajk availability board");
    println!("🌐 Listening on:        http://{}", config.bind_addr);
    println!("📡 Prediction service:  {}", config.base_url);
    println!("📍 Available Routes:");
    println!("   GET  /health                      - Health check");
    println!("   GET  /api/mbajk/stations          - Station catalog");
    println!("   GET  /api/mbajk/station/{{name}}    - Station by location");
    println!("   POST /api/mbajk/select            - Select station by coordinates");
    println!("   DEL  /api/mbajk/select            - Clear the selection");
    println!("   GET  /api/mbajk/selection         - Currently selected station");
    println!("   GET  /api/mbajk/board             - Current availability board");

    let bind_addr = config.bind_addr.clone();
    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .route("/health", web::get().to(health_check))
            .service(
                web::scope("/api/mbajk")
                    .route("/stations", web::get().to(get_stations))
                    .route("/station/{location}", web::get().to(get_station_by_location))
                    .route("/select", web::post().to(select_station))
                    .route("/select", web::delete().to(clear_selection))
                    .route("/selection", web::get().to(get_selection))
                    .route("/board", web::get().to(get_board)),
            )
    })
    .bind(bind_addr.as_str())?
    .run()
    .await
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = ServiceConfig::from_env();

    let catalog = match stations::load_catalog() {
        Ok(catalog) => catalog,
        Err(e) => {
            eprintln!("❌ Failed to parse embedded station catalog: {}", e);
            std::process::exit(1);
        }
    };
    info!("Loaded {} stations from the embedded catalog", catalog.len());

    actix_web::rt::System::new().block_on(run_server(config, catalog))
}
