// Station catalog and location-key normalization for the mBajk network.
//
// The catalog is the fixed set of Maribor bike stands. Display names
// (`location`) are uppercase with ASCII-substituted diacritics; where the
// diacritic-correct spelling differs it is carried in `name` and preferred
// when talking to the prediction service.

use serde::{Deserialize, Serialize};

// Embed the station catalog at compile time
const STATION_CATALOG: &str = include_str!("../static/stations.json");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub location: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Station {
    /// The key sent to the prediction service for this station: the
    /// diacritic-correct `name` when present, `location` otherwise, run
    /// through `normalize_location`.
    pub fn lookup_key(&self) -> String {
        normalize_location(self.name.as_deref().unwrap_or(&self.location))
    }
}

/// Parses the embedded station catalog. Called once at startup; the result
/// is immutable for the rest of the session.
pub fn load_catalog() -> Result<Vec<Station>, serde_json::Error> {
    serde_json::from_str(STATION_CATALOG)
}

/// Maps the Slovene diacritics that appear in station names to their plain
/// ASCII equivalents. Every other character passes through unchanged, so the
/// function is idempotent.
pub fn normalize_location(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            'š' => 's',
            'č' => 'c',
            'ž' => 'z',
            'Š' => 'S',
            'Č' => 'C',
            'Ž' => 'Z',
            other => other,
        })
        .collect()
}
