/// All row identifiers are UUIDs (v7 for rows created by the store).
pub type DbId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a fresh, time-ordered row identifier.
pub fn new_id() -> DbId {
    uuid::Uuid::now_v7()
}
