//! Database row types. These map directly to SQLite rows.
//! Distinct from campus-types models to keep the DB layer independent.

#[derive(Debug, Clone)]
pub struct ProfileRow {
    pub id: String,
    pub display_name: String,
    pub student_id: String,
    pub password: String,
    pub bio: Option<String>,
    pub blocked: bool,
    pub created_at: String,
    pub last_seen_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub listing_id: Option<String>,
    pub lost_found_id: Option<String>,
    pub read: bool,
    pub created_at: String,
}

/// Fields supplied by the sender; id and timestamp are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewMessageRow {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub listing_id: Option<String>,
    pub lost_found_id: Option<String>,
}
