/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Node addresses inside a workflow graph (e.g. `"9"`, `"image_loader"`).
pub type NodeId = String;
