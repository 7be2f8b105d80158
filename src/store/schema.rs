pub const SCHEMA: &str = r#"
-- Catalog tree: folders and dataset nodes
CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    parent_id TEXT REFERENCES nodes(id) ON DELETE CASCADE,
    kind TEXT NOT NULL CHECK (kind IN ('folder', 'dataset')),
    owner_id TEXT NOT NULL,
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now'))
);

-- Transitive closure of the node tree, including one (n, n, 0) row per node
CREATE TABLE IF NOT EXISTS node_closure (
    ancestor_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    descendant_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    depth INTEGER NOT NULL CHECK (depth >= 0),
    PRIMARY KEY (ancestor_id, descendant_id)
);

-- Exactly one dataset per dataset node
CREATE TABLE IF NOT EXISTS datasets (
    id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL UNIQUE REFERENCES nodes(id) ON DELETE CASCADE,
    type TEXT NOT NULL,
    format TEXT NOT NULL,
    file_name TEXT NOT NULL DEFAULT '',
    file_size INTEGER NOT NULL DEFAULT 0,
    storage_key TEXT NOT NULL DEFAULT '',
    metadata TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now'))
);

-- Tile-ready artifact generated from a raster dataset
CREATE TABLE IF NOT EXISTS tilesets (
    id TEXT PRIMARY KEY,
    dataset_id TEXT NOT NULL UNIQUE REFERENCES datasets(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'pending',
    storage_key TEXT NOT NULL DEFAULT '',
    file_size INTEGER NOT NULL DEFAULT 0,
    min_zoom INTEGER NOT NULL DEFAULT 0,
    max_zoom INTEGER NOT NULL DEFAULT 22,
    bounds TEXT,                  -- JSON [west, south, east, north]
    error_message TEXT NOT NULL DEFAULT '',
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now'))
);

-- User-facing notifications
CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id);
CREATE INDEX IF NOT EXISTS idx_node_closure_descendant ON node_closure(descendant_id);
CREATE INDEX IF NOT EXISTS idx_datasets_storage_key ON datasets(storage_key);
CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id);
"#;
