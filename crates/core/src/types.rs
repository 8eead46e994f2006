/// All database primary keys are PostgreSQL BIGSERIAL.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Track and group ids. Unique per dataset, not globally.
pub type AnnotationId = i64;

/// Per-dataset revision number. Revision 0 is the implicit empty revision.
pub type Revision = i64;

/// Zero-based video frame index.
pub type Frame = i64;
