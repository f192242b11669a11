use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS profiles (
            id              TEXT PRIMARY KEY,
            display_name    TEXT NOT NULL,
            student_id      TEXT NOT NULL UNIQUE,
            password        TEXT NOT NULL,
            bio             TEXT,
            blocked         INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL,
            last_seen_at    TEXT
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            sender_id       TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
            receiver_id     TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
            content         TEXT NOT NULL,
            listing_id      TEXT,
            lost_found_id   TEXT,
            read            INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL,
            CHECK (listing_id IS NULL OR lost_found_id IS NULL)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_sender
            ON messages(sender_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_receiver
            ON messages(receiver_id, read, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
