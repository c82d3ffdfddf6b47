// Shared selection state: the station registry plus the currently active
// station. There is a single writer (the select endpoint); readers either
// poll `current()` or subscribe to the watch channel, which gives
// replace-and-notify semantics without any locking on the read path.

use tokio::sync::watch;

use crate::stations::Station;

pub struct SelectionStore {
    stations: Vec<Station>,
    selection: watch::Sender<Option<Station>>,
}

impl SelectionStore {
    pub fn new(stations: Vec<Station>) -> Self {
        let (selection, _) = watch::channel(None);
        Self { stations, selection }
    }

    /// The full immutable catalog, in catalog order.
    pub fn registry(&self) -> &[Station] {
        &self.stations
    }

    pub fn current(&self) -> Option<Station> {
        self.selection.borrow().clone()
    }

    /// Replaces the current selection and notifies subscribers before
    /// returning. No membership check against the registry, callers are
    /// trusted to pass a catalog station.
    pub fn select(&self, station: Station) {
        self.selection.send_replace(Some(station));
    }

    /// Resets to no selection.
    pub fn clear(&self) {
        self.selection.send_replace(None);
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Station>> {
        self.selection.subscribe()
    }

    /// Resolves a station the way the map resolves a clicked marker: by
    /// exact coordinate equality. Markers are placed from the catalog, so
    /// the coordinates they report back match bit-for-bit.
    pub fn find_by_coordinates(&self, latitude: f64, longitude: f64) -> Option<&Station> {
        self.stations
            .iter()
            .find(|s| s.latitude == latitude && s.longitude == longitude)
    }
}
