/// All database primary keys are PostgreSQL BIGSERIAL.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Open key-value bag attached to a notification.
pub type Metadata = serde_json::Map<String, serde_json::Value>;
