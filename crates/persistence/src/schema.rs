//! Database schema definitions

/// SQL to create all tables
/// NOTE: metrics and parameter payloads are stored as JSON TEXT
pub const CREATE_TABLES: &str = r#"
-- Current strategy configuration (single-row-per-key store)
CREATE TABLE IF NOT EXISTS config_kv (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    value TEXT NOT NULL
);

-- Append-only history of evaluated champions (promoted or not)
CREATE TABLE IF NOT EXISTS model_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version TEXT NOT NULL UNIQUE,
    metrics TEXT NOT NULL,
    promoted INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Free-form evolution journal
CREATE TABLE IF NOT EXISTS evolution_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message TEXT NOT NULL,
    data TEXT,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_config_key ON config_kv(key);
CREATE INDEX IF NOT EXISTS idx_model_versions_version ON model_versions(version);
CREATE INDEX IF NOT EXISTS idx_model_versions_promoted ON model_versions(promoted, id DESC)
"#;

/// Column additions applied after `CREATE_TABLES`.
/// A "duplicate column name" failure means the column is already there.
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE evolution_log ADD COLUMN params_hash TEXT",
];
