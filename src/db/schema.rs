pub const SCHEMA: &str = r#"
-- subscriptions table
CREATE TABLE IF NOT EXISTS subscriptions (
    feed_id INTEGER NOT NULL,
    vendor TEXT NOT NULL,
    sub_id TEXT NOT NULL,
    name TEXT NOT NULL,
    data TEXT NOT NULL DEFAULT '',
    updated_at TEXT,
    error TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (feed_id, vendor, sub_id)
);

CREATE INDEX IF NOT EXISTS idx_subscriptions_shift ON subscriptions(feed_id, error, updated_at);

-- media_hashes table (content uniqueness per destination)
CREATE TABLE IF NOT EXISTS media_hashes (
    feed_id INTEGER NOT NULL,
    url TEXT NOT NULL,
    hash_type TEXT NOT NULL,
    hash_value TEXT NOT NULL,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    collisions INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (feed_id, hash_type, hash_value)
);

CREATE INDEX IF NOT EXISTS idx_media_hashes_last_seen ON media_hashes(last_seen);
"#;
