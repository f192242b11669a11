use crate::Database;
use crate::models::{MessageRow, NewMessageRow, ProfileRow};
use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, Row};
use uuid::Uuid;

const PROFILE_COLUMNS: &str =
    "id, display_name, student_id, password, bio, blocked, created_at, last_seen_at";

const MESSAGE_COLUMNS: &str =
    "id, sender_id, receiver_id, content, listing_id, lost_found_id, read, created_at";

/// Server clock formatted so that lexical order matches time order.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Database {
    // -- Profiles --

    pub fn create_profile(
        &self,
        id: &str,
        display_name: &str,
        student_id: &str,
        password_hash: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO profiles (id, display_name, student_id, password, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (id, display_name, student_id, password_hash, now_timestamp()),
            )?;
            Ok(())
        })
    }

    pub fn get_profile_by_id(&self, id: &str) -> Result<Option<ProfileRow>> {
        self.with_conn(|conn| query_profile(conn, "id", id))
    }

    pub fn get_profile_by_student_id(&self, student_id: &str) -> Result<Option<ProfileRow>> {
        self.with_conn(|conn| query_profile(conn, "student_id", student_id))
    }

    /// Record activity for a profile.
    pub fn touch_profile(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE profiles SET last_seen_at = ?1 WHERE id = ?2",
                (now_timestamp(), id),
            )?;
            Ok(())
        })
    }

    pub fn set_profile_blocked(&self, id: &str, blocked: bool) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE profiles SET blocked = ?1 WHERE id = ?2",
                rusqlite::params![blocked, id],
            )?;
            Ok(changed == 1)
        })
    }

    // -- Messages --

    /// Insert a message and return the stored row with its server-assigned
    /// id and timestamp.
    pub fn insert_message(&self, new: &NewMessageRow) -> Result<MessageRow> {
        let row = MessageRow {
            id: Uuid::new_v4().to_string(),
            sender_id: new.sender_id.clone(),
            receiver_id: new.receiver_id.clone(),
            content: new.content.clone(),
            listing_id: new.listing_id.clone(),
            lost_found_id: new.lost_found_id.clone(),
            read: false,
            created_at: now_timestamp(),
        };

        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                rusqlite::params![
                    row.id,
                    row.sender_id,
                    row.receiver_id,
                    row.content,
                    row.listing_id,
                    row.lost_found_id,
                    row.read,
                    row.created_at,
                ],
            )?;
            Ok(())
        })?;

        Ok(row)
    }

    /// Every message the user sent or received, oldest first.
    pub fn get_messages_for_user(&self, user_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE sender_id = ?1 OR receiver_id = ?1
                 ORDER BY created_at ASC, rowid ASC"
            ))?;

            let rows = stmt
                .query_map([user_id], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Flip one message to read, only when `receiver_id` is its receiver.
    /// Returns the updated row, or `None` when nothing changed (unknown id,
    /// wrong receiver, or already read).
    pub fn mark_message_read(&self, id: &str, receiver_id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET read = 1 WHERE id = ?1 AND receiver_id = ?2 AND read = 0",
                (id, receiver_id),
            )?;

            if changed == 0 {
                return Ok(None);
            }
            query_message(conn, id)
        })
    }

    /// Flip every unread message from `partner_id` to `receiver_id`.
    /// Returns the rows that changed.
    pub fn mark_conversation_read(
        &self,
        partner_id: &str,
        receiver_id: &str,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let mut rows = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE sender_id = ?1 AND receiver_id = ?2 AND read = 0
                     ORDER BY created_at ASC, rowid ASC"
                ))?;
                stmt.query_map((partner_id, receiver_id), message_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            tx.execute(
                "UPDATE messages SET read = 1 WHERE sender_id = ?1 AND receiver_id = ?2 AND read = 0",
                (partner_id, receiver_id),
            )?;
            tx.commit()?;

            for row in &mut rows {
                row.read = true;
            }
            Ok(rows)
        })
    }
}

fn query_profile(conn: &Connection, column: &str, value: &str) -> Result<Option<ProfileRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROFILE_COLUMNS} FROM profiles WHERE {column} = ?1"
    ))?;

    let row = stmt.query_row([value], profile_from_row).optional()?;
    Ok(row)
}

fn query_message(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let mut stmt = conn.prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))?;

    let row = stmt.query_row([id], message_from_row).optional()?;
    Ok(row)
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<ProfileRow> {
    Ok(ProfileRow {
        id: row.get(0)?,
        display_name: row.get(1)?,
        student_id: row.get(2)?,
        password: row.get(3)?,
        bio: row.get(4)?,
        blocked: row.get(5)?,
        created_at: row.get(6)?,
        last_seen_at: row.get(7)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        content: row.get(3)?,
        listing_id: row.get(4)?,
        lost_found_id: row.get(5)?,
        read: row.get(6)?,
        created_at: row.get(7)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
