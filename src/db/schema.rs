pub const SCHEMA: &str = r#"
-- Content table: one row per unique content fingerprint.
-- capabilities_done only ever grows (bitwise OR on upsert).
CREATE TABLE IF NOT EXISTS content (
    fingerprint TEXT PRIMARY KEY,
    path TEXT UNIQUE,
    capabilities_done INTEGER NOT NULL DEFAULT 0,

    -- Opaque, schema-tagged payloads (JSON)
    metadata TEXT,
    faces TEXT,

    risk REAL,
    embedding BLOB,  -- float32 array stored as little-endian bytes

    last_scanned TEXT
);

CREATE INDEX IF NOT EXISTS idx_content_path ON content(path);

-- Tag vocabulary. global_count is only incremented when trend buckets
-- age out and are folded in.
CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    global_count INTEGER NOT NULL DEFAULT 0,
    is_character INTEGER NOT NULL DEFAULT 0
);

-- Content to tag associations, fully replaced per recompute.
CREATE TABLE IF NOT EXISTS content_tags (
    fingerprint TEXT NOT NULL,
    tag_id INTEGER NOT NULL,
    confidence REAL,
    FOREIGN KEY (tag_id) REFERENCES tags(id)
);

CREATE INDEX IF NOT EXISTS idx_content_tags_fingerprint ON content_tags(fingerprint);

-- Per-day, per-tag sighting counters for recency-weighted trending.
CREATE TABLE IF NOT EXISTS trend_buckets (
    date TEXT NOT NULL,
    tag_id INTEGER NOT NULL,
    day_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (date, tag_id)
);

-- Compatibility counters for the legacy stats surface.
CREATE TABLE IF NOT EXISTS legacy_stats (
    id INTEGER PRIMARY KEY CHECK(id = 1),
    scan_count INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO legacy_stats(id, scan_count) VALUES(1, 0);

CREATE TABLE IF NOT EXISTS legacy_tag_counts (
    tag TEXT PRIMARY KEY,
    count INTEGER NOT NULL
);
"#;

/// Additive migrations for databases created by older builds. Each statement
/// is allowed to fail when the column already exists.
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE content ADD COLUMN metadata TEXT",
    "ALTER TABLE content ADD COLUMN risk REAL",
    "ALTER TABLE content ADD COLUMN faces TEXT",
    "ALTER TABLE content ADD COLUMN embedding BLOB",
    "ALTER TABLE content ADD COLUMN last_scanned TEXT",
    "ALTER TABLE tags ADD COLUMN is_character INTEGER NOT NULL DEFAULT 0",
];
