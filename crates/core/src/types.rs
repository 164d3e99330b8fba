/// Tasks are identified by a random UUID generated at submission time.
pub type TaskId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Allocate a fresh task identifier.
pub fn new_task_id() -> TaskId {
    uuid::Uuid::new_v4()
}
