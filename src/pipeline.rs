// Prediction pipeline for the availability board.
//
// Every selection change runs one invocation: live snapshot, then the last
// 12 historical rows, then the model prediction, all keyed by the normalized
// station name. The three calls are strictly sequential. Invocations carry a
// generation number and only the newest generation may commit to the board,
// so a result that arrives after the user has already picked another station
// is dropped on the floor instead of overwriting fresher data.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, Timelike};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Number, Value, json};
use tokio::sync::{RwLock, watch};

use crate::stations::Station;

/// Rows of history the model needs; anything else means no prediction.
pub const HISTORY_WINDOW: usize = 12;
/// Hours of forecast shown on the board.
pub const FORECAST_HOURS: u32 = 7;

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum MbajkError {
    Transport(String),
    Decode(String),
}

impl std::fmt::Display for MbajkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MbajkError::Transport(e) => write!(f, "Transport error: {}", e),
            MbajkError::Decode(e) => write!(f, "Decode error: {}", e),
        }
    }
}

impl std::error::Error for MbajkError {}

pub type Result<T> = std::result::Result<T, MbajkError>;

// ============================================================================
// Fetcher Boundary
// ============================================================================

/// One time-bucketed observation; cells arrive as numbers, numeric strings
/// or nulls depending on how the upstream export was feeling that day.
pub type HistoricalRow = Vec<Value>;

#[derive(Debug, Clone, Deserialize)]
pub struct LiveSnapshot {
    #[serde(default)]
    pub available_bikes: Option<u32>,
}

/// Remote prediction-service capability. The board only ever talks to this
/// trait; the HTTP implementation below is swapped for an in-process fake in
/// tests.
#[async_trait]
pub trait PredictionFetcher: Send + Sync {
    async fn live_snapshot(&self, location: &str) -> Result<LiveSnapshot>;
    async fn historical_series(&self, location: &str) -> Result<Vec<HistoricalRow>>;
    async fn predict(&self, location: &str, series: &[HistoricalRow]) -> Result<Vec<f64>>;
}

pub struct MbajkHttpFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl MbajkHttpFetcher {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| MbajkError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| MbajkError::Transport(format!("POST {} failed: {}", path, e)))?;

        if !response.status().is_success() {
            return Err(MbajkError::Transport(format!(
                "POST {} returned status {}",
                path,
                response.status()
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| MbajkError::Decode(format!("POST {} returned invalid JSON: {}", path, e)))
    }
}

#[async_trait]
impl PredictionFetcher for MbajkHttpFetcher {
    async fn live_snapshot(&self, location: &str) -> Result<LiveSnapshot> {
        self.post_json("/live-data", json!({ "location": location })).await
    }

    async fn historical_series(&self, location: &str) -> Result<Vec<HistoricalRow>> {
        #[derive(Deserialize)]
        struct HistoricalResponse {
            data: Vec<HistoricalRow>,
        }

        let response: HistoricalResponse =
            self.post_json("/data", json!({ "location": location })).await?;
        Ok(response.data)
    }

    async fn predict(&self, location: &str, series: &[HistoricalRow]) -> Result<Vec<f64>> {
        #[derive(Deserialize)]
        struct PredictResponse {
            predictions: Vec<f64>,
        }

        let response: PredictResponse = self
            .post_json("/mbajk/predict", json!({ "location": location, "data": series }))
            .await?;
        Ok(response.predictions)
    }
}

// ============================================================================
// Pure Helpers
// ============================================================================

/// The next seven clock hours after `current_hour`, wrapping at midnight.
/// Computed for every selection whether or not the fetches succeed.
pub fn next_seven_hours(current_hour: u32) -> Vec<u32> {
    (1..=FORECAST_HOURS).map(|i| (current_hour + i) % 24).collect()
}

/// Cleans one historical row for the model: numeric strings become numbers,
/// null and blank cells become 0, everything else passes through unchanged.
pub fn clean_row(row: &[Value]) -> HistoricalRow {
    row.iter()
        .map(|cell| match cell {
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    Value::from(0)
                } else if let Ok(i) = trimmed.parse::<i64>() {
                    Value::from(i)
                } else if let Ok(n) = trimmed.parse::<f64>() {
                    // NaN / infinity are not valid JSON numbers
                    Number::from_f64(n).map(Value::Number).unwrap_or_else(|| cell.clone())
                } else {
                    cell.clone()
                }
            }
            Value::Null => Value::from(0),
            Value::Bool(false) => Value::from(0),
            other => other.clone(),
        })
        .collect()
}

pub fn clean_series(series: &[HistoricalRow]) -> Vec<HistoricalRow> {
    series.iter().map(|row| clean_row(row)).collect()
}

// ============================================================================
// Board State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardStatus {
    Idle,
    Loading,
    Ready,
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub struct BoardState {
    pub status: BoardStatus,
    pub station: Option<Station>,
    pub hours: Vec<u32>,
    pub available_bikes: Option<u32>,
    pub predictions: Vec<f64>,
}

impl BoardState {
    fn idle() -> Self {
        Self {
            status: BoardStatus::Idle,
            station: None,
            hours: Vec::new(),
            available_bikes: None,
            predictions: Vec::new(),
        }
    }
}

enum FetchOutcome {
    Ready {
        available_bikes: u32,
        predictions: Vec<f64>,
    },
    ShortHistory {
        available_bikes: u32,
        rows: usize,
    },
    Failed {
        available_bikes: Option<u32>,
        error: MbajkError,
    },
}

// ============================================================================
// Prediction Board
// ============================================================================

pub struct PredictionBoard {
    fetcher: Arc<dyn PredictionFetcher>,
    state: RwLock<BoardState>,
    generation: AtomicU64,
}

impl PredictionBoard {
    pub fn new(fetcher: Arc<dyn PredictionFetcher>) -> Self {
        Self {
            fetcher,
            state: RwLock::new(BoardState::idle()),
            generation: AtomicU64::new(0),
        }
    }

    pub async fn snapshot(&self) -> BoardState {
        self.state.read().await.clone()
    }

    /// Watches the selection store and runs one pipeline invocation per
    /// change. Generations are assigned here, in change order, so a slow
    /// invocation can never commit over a newer one.
    pub async fn watch_selection(self: Arc<Self>, mut rx: watch::Receiver<Option<Station>>) {
        while rx.changed().await.is_ok() {
            let selection = rx.borrow_and_update().clone();
            let generation = self.begin_invocation();
            let board = Arc::clone(&self);
            tokio::spawn(async move {
                board.run(generation, selection).await;
            });
        }
    }

    /// Runs a single invocation for `selection` under a fresh generation.
    pub async fn refresh(&self, selection: Option<Station>) {
        let generation = self.begin_invocation();
        self.run(generation, selection).await;
    }

    fn begin_invocation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn run(&self, generation: u64, selection: Option<Station>) {
        let Some(station) = selection else {
            let mut state = self.state.write().await;
            if self.is_current(generation) {
                *state = BoardState::idle();
            }
            return;
        };

        let hours = next_seven_hours(Local::now().hour());
        {
            let mut state = self.state.write().await;
            if !self.is_current(generation) {
                return;
            }
            *state = BoardState {
                status: BoardStatus::Loading,
                station: Some(station.clone()),
                hours: hours.clone(),
                available_bikes: None,
                predictions: Vec::new(),
            };
        }

        let location = station.lookup_key();
        debug!("Fetching availability for {} (generation {})", location, generation);
        let outcome = self.run_fetch_sequence(&location).await;

        let mut state = self.state.write().await;
        if !self.is_current(generation) {
            debug!("Discarding stale result for {} (generation {})", location, generation);
            return;
        }

        match outcome {
            FetchOutcome::Ready { available_bikes, predictions } => {
                *state = BoardState {
                    status: BoardStatus::Ready,
                    station: Some(station),
                    hours,
                    available_bikes: Some(available_bikes),
                    predictions,
                };
            }
            FetchOutcome::ShortHistory { available_bikes, rows } => {
                warn!(
                    "Insufficient history for {}: expected {} rows, got {}; skipping prediction",
                    location, HISTORY_WINDOW, rows
                );
                *state = BoardState {
                    status: BoardStatus::Empty,
                    station: Some(station),
                    hours,
                    available_bikes: Some(available_bikes),
                    predictions: Vec::new(),
                };
            }
            FetchOutcome::Failed { available_bikes, error } => {
                error!("Failed to fetch predictions for {}: {}", location, error);
                *state = BoardState {
                    status: BoardStatus::Empty,
                    station: Some(station),
                    hours,
                    available_bikes,
                    predictions: Vec::new(),
                };
            }
        }
    }

    // Live snapshot, then history, then prediction. Each call depends on the
    // previous one, so no parallelism here.
    async fn run_fetch_sequence(&self, location: &str) -> FetchOutcome {
        let live = match self.fetcher.live_snapshot(location).await {
            Ok(live) => live,
            Err(error) => {
                return FetchOutcome::Failed { available_bikes: None, error };
            }
        };
        let available_bikes = live.available_bikes.unwrap_or(0);

        let series = match self.fetcher.historical_series(location).await {
            Ok(series) => series,
            Err(error) => {
                return FetchOutcome::Failed { available_bikes: Some(available_bikes), error };
            }
        };

        if series.len() != HISTORY_WINDOW {
            return FetchOutcome::ShortHistory { available_bikes, rows: series.len() };
        }

        let cleaned = clean_series(&series);
        match self.fetcher.predict(location, &cleaned).await {
            Ok(predictions) => FetchOutcome::Ready { available_bikes, predictions },
            Err(error) => FetchOutcome::Failed { available_bikes: Some(available_bikes), error },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stations::Station;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    fn station(location: &str) -> Station {
        Station {
            location: location.to_string(),
            latitude: 46.55,
            longitude: 15.64,
            name: None,
        }
    }

    fn rows(count: usize) -> Vec<HistoricalRow> {
        (0..count).map(|i| vec![json!(i), json!(20.5), json!(60)]).collect()
    }

    // Scripted fetcher: per-call results, optional per-location gate on the
    // live call, and a flag recording whether predict was ever reached.
    struct ScriptedFetcher {
        live: std::result::Result<LiveSnapshot, String>,
        history: std::result::Result<Vec<HistoricalRow>, String>,
        predictions: std::result::Result<Vec<f64>, String>,
        gate: Option<(String, Arc<Notify>)>,
        history_called: AtomicBool,
        predict_called: AtomicBool,
    }

    impl ScriptedFetcher {
        fn ok(available: u32, history: Vec<HistoricalRow>, predictions: Vec<f64>) -> Self {
            Self {
                live: Ok(LiveSnapshot { available_bikes: Some(available) }),
                history: Ok(history),
                predictions: Ok(predictions),
                gate: None,
                history_called: AtomicBool::new(false),
                predict_called: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl PredictionFetcher for ScriptedFetcher {
        async fn live_snapshot(&self, location: &str) -> Result<LiveSnapshot> {
            if let Some((gated, notify)) = &self.gate {
                if location == gated {
                    notify.notified().await;
                }
            }
            self.live.clone().map_err(MbajkError::Transport)
        }

        async fn historical_series(&self, _location: &str) -> Result<Vec<HistoricalRow>> {
            self.history_called.store(true, Ordering::SeqCst);
            self.history.clone().map_err(MbajkError::Transport)
        }

        async fn predict(&self, _location: &str, _series: &[HistoricalRow]) -> Result<Vec<f64>> {
            self.predict_called.store(true, Ordering::SeqCst);
            self.predictions.clone().map_err(MbajkError::Transport)
        }
    }

    #[test]
    fn next_seven_hours_wraps_for_every_hour() {
        for h in 0..24 {
            let hours = next_seven_hours(h);
            assert_eq!(hours.len(), 7);
            for (i, hour) in hours.iter().enumerate() {
                assert_eq!(*hour, (h + i as u32 + 1) % 24);
                assert!(*hour < 24);
            }
        }
        assert_eq!(next_seven_hours(23), vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn clean_row_converts_mixed_cells() {
        let row = vec![json!("3"), json!(4), Value::Null, json!(" 2.5 "), json!("1e2"), json!("")];
        let cleaned = clean_row(&row);
        assert_eq!(
            cleaned,
            vec![json!(3), json!(4), json!(0), json!(2.5), json!(100.0), json!(0)]
        );
    }

    #[test]
    fn clean_row_passes_non_numeric_text_through() {
        let row = vec![json!("DVORANA TABOR"), json!("NaN"), json!(true)];
        assert_eq!(clean_row(&row), row);
    }

    #[test]
    fn clean_row_is_idempotent() {
        let row = vec![json!("3"), Value::Null, json!("text"), json!(7.25), json!("")];
        let once = clean_row(&row);
        assert_eq!(clean_row(&once), once);
    }

    #[tokio::test]
    async fn no_selection_goes_idle() {
        let fetcher = Arc::new(ScriptedFetcher::ok(1, rows(12), vec![1.0]));
        let board = PredictionBoard::new(fetcher);

        board.refresh(Some(station("DVORANA TABOR"))).await;
        board.refresh(None).await;

        let state = board.snapshot().await;
        assert_eq!(state.status, BoardStatus::Idle);
        assert!(state.hours.is_empty());
        assert!(state.predictions.is_empty());
        assert_eq!(state.available_bikes, None);
    }

    #[tokio::test]
    async fn full_sequence_reaches_ready() {
        let predictions = vec![5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0];
        let fetcher = Arc::new(ScriptedFetcher::ok(7, rows(12), predictions.clone()));
        let board = PredictionBoard::new(fetcher);

        board.refresh(Some(station("DVORANA TABOR"))).await;

        let state = board.snapshot().await;
        assert_eq!(state.status, BoardStatus::Ready);
        assert_eq!(state.available_bikes, Some(7));
        assert_eq!(state.predictions, predictions);
        assert_eq!(state.hours.len(), state.predictions.len());
        assert_eq!(state.station.map(|s| s.location), Some("DVORANA TABOR".to_string()));
    }

    #[tokio::test]
    async fn short_history_skips_prediction() {
        for count in [11, 13] {
            let fetcher = Arc::new(ScriptedFetcher::ok(3, rows(count), vec![1.0]));
            let board = PredictionBoard::new(Arc::clone(&fetcher) as Arc<dyn PredictionFetcher>);

            board.refresh(Some(station("LIDL - TITOVA C."))).await;

            let state = board.snapshot().await;
            assert_eq!(state.status, BoardStatus::Empty);
            assert_eq!(state.available_bikes, Some(3));
            assert!(state.predictions.is_empty());
            assert_eq!(state.hours.len(), 7);
            assert!(!fetcher.predict_called.load(Ordering::SeqCst));
        }
    }

    #[tokio::test]
    async fn live_failure_collapses_to_empty_without_further_calls() {
        let fetcher = Arc::new(ScriptedFetcher {
            live: Err("connection refused".to_string()),
            history: Ok(rows(12)),
            predictions: Ok(vec![1.0]),
            gate: None,
            history_called: AtomicBool::new(false),
            predict_called: AtomicBool::new(false),
        });
        let board = PredictionBoard::new(Arc::clone(&fetcher) as Arc<dyn PredictionFetcher>);

        board.refresh(Some(station("DVORANA TABOR"))).await;

        let state = board.snapshot().await;
        assert_eq!(state.status, BoardStatus::Empty);
        assert_eq!(state.available_bikes, None);
        assert!(state.predictions.is_empty());
        assert_eq!(state.hours.len(), 7);
        assert!(!fetcher.history_called.load(Ordering::SeqCst));
        assert!(!fetcher.predict_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn prediction_failure_keeps_live_count_but_clears_predictions() {
        let fetcher = Arc::new(ScriptedFetcher {
            live: Ok(LiveSnapshot { available_bikes: Some(5) }),
            history: Ok(rows(12)),
            predictions: Err("model unavailable".to_string()),
            gate: None,
            history_called: AtomicBool::new(false),
            predict_called: AtomicBool::new(false),
        });
        let board = PredictionBoard::new(fetcher);

        board.refresh(Some(station("DVORANA TABOR"))).await;

        let state = board.snapshot().await;
        assert_eq!(state.status, BoardStatus::Empty);
        assert_eq!(state.available_bikes, Some(5));
        assert!(state.predictions.is_empty());
    }

    #[tokio::test]
    async fn missing_available_bikes_defaults_to_zero() {
        let fetcher = Arc::new(ScriptedFetcher {
            live: Ok(LiveSnapshot { available_bikes: None }),
            history: Ok(rows(12)),
            predictions: Ok(vec![2.0]),
            gate: None,
            history_called: AtomicBool::new(false),
            predict_called: AtomicBool::new(false),
        });
        let board = PredictionBoard::new(fetcher);

        board.refresh(Some(station("DVORANA TABOR"))).await;

        let state = board.snapshot().await;
        assert_eq!(state.status, BoardStatus::Ready);
        assert_eq!(state.available_bikes, Some(0));
    }

    #[tokio::test]
    async fn stale_invocation_never_overwrites_newer_one() {
        let gate = Arc::new(Notify::new());
        let fetcher = Arc::new(ScriptedFetcher {
            live: Ok(LiveSnapshot { available_bikes: Some(9) }),
            history: Ok(rows(12)),
            predictions: Ok(vec![9.0; 7]),
            gate: Some(("SLOW STAND".to_string(), Arc::clone(&gate))),
            history_called: AtomicBool::new(false),
            predict_called: AtomicBool::new(false),
        });
        let board = Arc::new(PredictionBoard::new(
            Arc::clone(&fetcher) as Arc<dyn PredictionFetcher>
        ));

        // Station A's live call parks on the gate until released.
        let slow_board = Arc::clone(&board);
        let slow = tokio::spawn(async move {
            slow_board.refresh(Some(station("SLOW STAND"))).await;
        });
        tokio::task::yield_now().await;

        // Station B is selected while A is still in flight and completes.
        board.refresh(Some(station("FAST STAND"))).await;
        let state = board.snapshot().await;
        assert_eq!(state.status, BoardStatus::Ready);

        // Release A; its late result must be discarded.
        gate.notify_one();
        slow.await.unwrap();

        let state = board.snapshot().await;
        assert_eq!(state.status, BoardStatus::Ready);
        assert_eq!(state.station.map(|s| s.location), Some("FAST STAND".to_string()));
    }

    #[tokio::test]
    async fn watch_selection_drives_the_board() {
        let fetcher = Arc::new(ScriptedFetcher::ok(4, rows(12), vec![4.0; 7]));
        let board = Arc::new(PredictionBoard::new(fetcher as Arc<dyn PredictionFetcher>));
        let (tx, rx) = watch::channel(None);

        let watcher = tokio::spawn(Arc::clone(&board).watch_selection(rx));

        tx.send_replace(Some(station("SPAR - TRZNICA TABOR")));
        // Poll until the spawned invocation commits.
        for _ in 0..100 {
            if board.snapshot().await.status == BoardStatus::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let state = board.snapshot().await;
        assert_eq!(state.status, BoardStatus::Ready);
        assert_eq!(state.available_bikes, Some(4));

        drop(tx);
        watcher.await.unwrap();
    }
}
