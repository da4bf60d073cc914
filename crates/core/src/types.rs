/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Stable, path-derived unit identifier (`/`-separated, relative to the unit root).
pub type UnitId = String;
