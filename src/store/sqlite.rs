use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::Store;
use super::closure;
use super::schema::SCHEMA;
use crate::error::{Error, Result};
use crate::types::*;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens a private in-memory database, used by tests and throwaway runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn invalid_column(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unexpected value '{value}'").into(),
    )
}

fn json_column<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::validation(format!("invalid JSON: {e}")))
}

const NODE_COLUMNS: &str = "n.id, n.name, n.parent_id, n.kind, n.owner_id, n.created_at, n.updated_at";

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    let kind: String = row.get(3)?;
    Ok(Node {
        id: row.get(0)?,
        name: row.get(1)?,
        parent_id: row.get(2)?,
        kind: NodeKind::parse(&kind).ok_or_else(|| invalid_column(3, &kind))?,
        owner_id: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
        updated_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

const DATASET_COLUMNS: &str = "id, node_id, type, format, file_name, file_size, storage_key, metadata, status, created_at, updated_at";

fn dataset_from_row(row: &Row<'_>) -> rusqlite::Result<Dataset> {
    let dataset_type: String = row.get(2)?;
    let format: String = row.get(3)?;
    let status: String = row.get(8)?;
    Ok(Dataset {
        id: row.get(0)?,
        node_id: row.get(1)?,
        dataset_type: DatasetType::parse(&dataset_type)
            .ok_or_else(|| invalid_column(2, &dataset_type))?,
        format: FileFormat::parse(&format).ok_or_else(|| invalid_column(3, &format))?,
        file_name: row.get(4)?,
        file_size: row.get(5)?,
        storage_key: row.get(6)?,
        metadata: json_column(7, &row.get::<_, String>(7)?)?,
        status: DatasetStatus::parse(&status).ok_or_else(|| invalid_column(8, &status))?,
        created_at: parse_datetime(&row.get::<_, String>(9)?),
        updated_at: parse_datetime(&row.get::<_, String>(10)?),
    })
}

const TILESET_COLUMNS: &str = "id, dataset_id, status, storage_key, file_size, min_zoom, max_zoom, bounds, error_message, created_at, updated_at";

fn tileset_from_row(row: &Row<'_>) -> rusqlite::Result<TileSet> {
    let status: String = row.get(2)?;
    let bounds = match row.get::<_, Option<String>>(7)? {
        Some(raw) => Some(json_column(7, &raw)?),
        None => None,
    };
    Ok(TileSet {
        id: row.get(0)?,
        dataset_id: row.get(1)?,
        status: TileSetStatus::parse(&status).ok_or_else(|| invalid_column(2, &status))?,
        storage_key: row.get(3)?,
        file_size: row.get(4)?,
        min_zoom: row.get(5)?,
        max_zoom: row.get(6)?,
        bounds,
        error_message: row.get(8)?,
        created_at: parse_datetime(&row.get::<_, String>(9)?),
        updated_at: parse_datetime(&row.get::<_, String>(10)?),
    })
}

fn fetch_node(conn: &Connection, id: &str) -> Result<Option<Node>> {
    conn.query_row(
        &format!("SELECT {NODE_COLUMNS} FROM nodes n WHERE n.id = ?1"),
        params![id],
        node_from_row,
    )
    .optional()
    .map_err(Error::from)
}

fn require_folder(conn: &Connection, parent_id: &str) -> Result<()> {
    match fetch_node(conn, parent_id)? {
        None => Err(Error::not_found(format!("parent node '{parent_id}'"))),
        Some(parent) if parent.kind != NodeKind::Folder => Err(Error::validation(
            "parent must be a folder; datasets cannot contain child nodes",
        )),
        Some(_) => Ok(()),
    }
}

fn insert_node(conn: &Connection, node: &Node) -> Result<()> {
    if let Some(parent_id) = node.parent_id.as_deref() {
        require_folder(conn, parent_id)?;
    }

    conn.execute(
        "INSERT INTO nodes (id, name, parent_id, kind, owner_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            node.id,
            node.name,
            node.parent_id,
            node.kind.as_str(),
            node.owner_id,
            format_datetime(&node.created_at),
            format_datetime(&node.updated_at),
        ],
    )?;
    closure::insert_node_edges(conn, &node.id, node.parent_id.as_deref())
}

fn query_nodes_with_depth(conn: &Connection, sql: &str, id: &str) -> Result<Vec<(Node, i64)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![id], |row| Ok((node_from_row(row)?, row.get(7)?)))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    // Node operations

    fn create_node(&self, node: &Node) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        insert_node(&tx, node)?;
        tx.commit()?;
        Ok(())
    }

    fn create_dataset_node(&self, node: &Node, dataset: &Dataset) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        insert_node(&tx, node)?;
        tx.execute(
            "INSERT INTO datasets (id, node_id, type, format, file_name, file_size, storage_key,
                                   metadata, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                dataset.id,
                dataset.node_id,
                dataset.dataset_type.as_str(),
                dataset.format.as_str(),
                dataset.file_name,
                dataset.file_size,
                dataset.storage_key,
                to_json(&dataset.metadata)?,
                dataset.status.as_str(),
                format_datetime(&dataset.created_at),
                format_datetime(&dataset.updated_at),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_node(&self, id: &str) -> Result<Option<Node>> {
        fetch_node(&self.conn(), id)
    }

    fn list_children(&self, parent_id: Option<&str>) -> Result<Vec<Node>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes n WHERE n.parent_id IS ?1 ORDER BY n.name, n.id"
        ))?;
        let rows = stmt.query_map(params![parent_id], node_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_descendants(&self, id: &str) -> Result<Vec<(Node, i64)>> {
        query_nodes_with_depth(
            &self.conn(),
            &format!(
                "SELECT {NODE_COLUMNS}, c.depth FROM node_closure c
                 JOIN nodes n ON n.id = c.descendant_id
                 WHERE c.ancestor_id = ?1 AND c.depth > 0
                 ORDER BY c.depth, n.name, n.id"
            ),
            id,
        )
    }

    fn list_ancestors(&self, id: &str) -> Result<Vec<(Node, i64)>> {
        query_nodes_with_depth(
            &self.conn(),
            &format!(
                "SELECT {NODE_COLUMNS}, c.depth FROM node_closure c
                 JOIN nodes n ON n.id = c.ancestor_id
                 WHERE c.descendant_id = ?1 AND c.depth > 0
                 ORDER BY c.depth"
            ),
            id,
        )
    }

    fn update_node(
        &self,
        id: &str,
        name: Option<&str>,
        new_parent_id: Option<Option<&str>>,
    ) -> Result<Node> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let node = fetch_node(&tx, id)?.ok_or_else(|| Error::not_found(format!("node '{id}'")))?;
        let old_parent_id = node.parent_id.clone();
        let new_parent_id = new_parent_id.filter(|parent| *parent != old_parent_id.as_deref());

        if let Some(Some(parent_id)) = new_parent_id {
            if parent_id == id {
                return Err(Error::validation("a node cannot be its own parent"));
            }
            require_folder(&tx, parent_id)?;
            if closure::is_in_subtree(&tx, id, parent_id)? {
                return Err(Error::validation(
                    "cannot move a node into its own subtree",
                ));
            }
        }
        if name.is_none() && new_parent_id.is_none() {
            return Ok(node);
        }

        let now = format_datetime(&Utc::now());
        if let Some(name) = name {
            tx.execute(
                "UPDATE nodes SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name, now, id],
            )?;
        }
        if let Some(parent_id) = new_parent_id {
            tx.execute(
                "UPDATE nodes SET parent_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![parent_id, now, id],
            )?;
            closure::relink_subtree(&tx, id, parent_id)?;
        }

        let updated =
            fetch_node(&tx, id)?.ok_or_else(|| Error::not_found(format!("node '{id}'")))?;
        tx.commit()?;

        if let Some(parent_id) = new_parent_id {
            tracing::info!(
                node_id = id,
                from = old_parent_id.as_deref().unwrap_or("<root>"),
                to = parent_id.unwrap_or("<root>"),
                "moved node"
            );
        }
        Ok(updated)
    }

    fn delete_node(&self, id: &str) -> Result<Option<Vec<String>>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        if fetch_node(&tx, id)?.is_none() {
            return Ok(None);
        }

        let keys = {
            let mut stmt = tx.prepare(
                "SELECT d.storage_key FROM datasets d
                 JOIN node_closure c ON c.descendant_id = d.node_id
                 WHERE c.ancestor_id = ?1 AND d.storage_key != ''
                 UNION
                 SELECT t.storage_key FROM tilesets t
                 JOIN datasets d ON d.id = t.dataset_id
                 JOIN node_closure c ON c.descendant_id = d.node_id
                 WHERE c.ancestor_id = ?1 AND t.storage_key != ''",
            )?;
            let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        // Children, closure rows, datasets and tile sets go through ON DELETE CASCADE.
        tx.execute("DELETE FROM nodes WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(Some(keys))
    }

    fn list_closure_edges(&self, descendant_id: &str) -> Result<Vec<ClosureEdge>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT ancestor_id, descendant_id, depth FROM node_closure
             WHERE descendant_id = ?1 ORDER BY depth",
        )?;
        let rows = stmt.query_map(params![descendant_id], |row| {
            Ok(ClosureEdge {
                ancestor_id: row.get(0)?,
                descendant_id: row.get(1)?,
                depth: row.get(2)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn rebuild_closure(&self) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let written = closure::rebuild_all(&tx)?;
        tx.commit()?;
        Ok(written)
    }

    // Dataset operations

    fn get_dataset(&self, id: &str) -> Result<Option<Dataset>> {
        self.conn()
            .query_row(
                &format!("SELECT {DATASET_COLUMNS} FROM datasets WHERE id = ?1"),
                params![id],
                dataset_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_dataset_by_node(&self, node_id: &str) -> Result<Option<Dataset>> {
        self.conn()
            .query_row(
                &format!("SELECT {DATASET_COLUMNS} FROM datasets WHERE node_id = ?1"),
                params![node_id],
                dataset_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_dataset_by_storage_key(&self, storage_key: &str) -> Result<Option<Dataset>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {DATASET_COLUMNS} FROM datasets WHERE storage_key = ?1 LIMIT 1"
                ),
                params![storage_key],
                dataset_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn update_dataset(&self, dataset: &Dataset) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE datasets SET type = ?1, format = ?2, file_name = ?3, file_size = ?4,
                                 storage_key = ?5, metadata = ?6, status = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                dataset.dataset_type.as_str(),
                dataset.format.as_str(),
                dataset.file_name,
                dataset.file_size,
                dataset.storage_key,
                to_json(&dataset.metadata)?,
                dataset.status.as_str(),
                format_datetime(&Utc::now()),
                dataset.id,
            ],
        )?;
        if updated == 0 {
            return Err(Error::not_found(format!("dataset '{}'", dataset.id)));
        }
        Ok(())
    }

    // Tile set operations

    fn begin_tileset_processing(&self, dataset_id: &str) -> Result<TileSet> {
        let conn = self.conn();
        let now = format_datetime(&Utc::now());
        conn.execute(
            "INSERT INTO tilesets (id, dataset_id, status, error_message, created_at, updated_at)
             VALUES (?1, ?2, 'processing', '', ?3, ?3)
             ON CONFLICT(dataset_id) DO UPDATE
                SET status = 'processing', error_message = '', updated_at = excluded.updated_at",
            params![uuid::Uuid::new_v4().to_string(), dataset_id, now],
        )?;
        conn.query_row(
            &format!("SELECT {TILESET_COLUMNS} FROM tilesets WHERE dataset_id = ?1"),
            params![dataset_id],
            tileset_from_row,
        )
        .map_err(Error::from)
    }

    fn get_tileset(&self, id: &str) -> Result<Option<TileSet>> {
        self.conn()
            .query_row(
                &format!("SELECT {TILESET_COLUMNS} FROM tilesets WHERE id = ?1"),
                params![id],
                tileset_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_tileset_by_dataset(&self, dataset_id: &str) -> Result<Option<TileSet>> {
        self.conn()
            .query_row(
                &format!("SELECT {TILESET_COLUMNS} FROM tilesets WHERE dataset_id = ?1"),
                params![dataset_id],
                tileset_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn update_tileset(&self, tileset: &TileSet) -> Result<()> {
        let bounds = tileset.bounds.as_ref().map(to_json).transpose()?;
        let updated = self.conn().execute(
            "UPDATE tilesets SET status = ?1, storage_key = ?2, file_size = ?3, min_zoom = ?4,
                                 max_zoom = ?5, bounds = ?6, error_message = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                tileset.status.as_str(),
                tileset.storage_key,
                tileset.file_size,
                tileset.min_zoom,
                tileset.max_zoom,
                bounds,
                tileset.error_message,
                format_datetime(&Utc::now()),
                tileset.id,
            ],
        )?;
        if updated == 0 {
            return Err(Error::not_found(format!("tileset '{}'", tileset.id)));
        }
        Ok(())
    }

    // Notification operations

    fn create_notification(&self, notification: &Notification) -> Result<()> {
        self.conn().execute(
            "INSERT INTO notifications (id, user_id, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                notification.id,
                notification.user_id,
                notification.message,
                format_datetime(&notification.created_at),
            ],
        )?;
        Ok(())
    }

    fn list_notifications(&self, user_id: &str) -> Result<Vec<Notification>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, message, created_at FROM notifications
             WHERE user_id = ?1 ORDER BY created_at DESC, id",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(Notification {
                id: row.get(0)?,
                user_id: row.get(1)?,
                message: row.get(2)?,
                created_at: parse_datetime(&row.get::<_, String>(3)?),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        store
    }

    fn folder(id: &str, parent: Option<&str>) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            parent_id: parent.map(str::to_string),
            kind: NodeKind::Folder,
            owner_id: "user-1".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn dataset_node(id: &str, parent: Option<&str>, key: &str) -> (Node, Dataset) {
        let node = Node {
            kind: NodeKind::Dataset,
            ..folder(id, parent)
        };
        let dataset = Dataset {
            id: format!("ds-{id}"),
            node_id: id.to_string(),
            dataset_type: DatasetType::Raster,
            format: FileFormat::Geotiff,
            file_name: format!("{id}.tif"),
            file_size: 10,
            storage_key: key.to_string(),
            metadata: DatasetMetadata::default(),
            status: DatasetStatus::Uploaded,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        (node, dataset)
    }

    fn edge_set(store: &SqliteStore, id: &str) -> Vec<(String, i64)> {
        store
            .list_closure_edges(id)
            .unwrap()
            .into_iter()
            .map(|e| (e.ancestor_id, e.depth))
            .collect()
    }

    #[test]
    fn test_schema_creation() {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(temp.path().join("test.db")).unwrap();
        store.initialize().unwrap();

        let conn = store.conn();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in ["nodes", "node_closure", "datasets", "tilesets", "notifications"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_create_nested_nodes_writes_closure() {
        let store = store();
        store.create_node(&folder("a", None)).unwrap();
        store.create_node(&folder("b", Some("a"))).unwrap();
        store.create_node(&folder("c", Some("b"))).unwrap();

        assert_eq!(
            edge_set(&store, "c"),
            vec![
                ("c".to_string(), 0),
                ("b".to_string(), 1),
                ("a".to_string(), 2)
            ]
        );

        let ancestors: Vec<_> = store
            .list_ancestors("c")
            .unwrap()
            .into_iter()
            .map(|(n, d)| (n.id, d))
            .collect();
        assert_eq!(ancestors, vec![("b".to_string(), 1), ("a".to_string(), 2)]);

        let descendants = store.list_descendants("a").unwrap();
        assert_eq!(descendants.len(), 2);
        assert_eq!(descendants[0].0.id, "b");
    }

    #[test]
    fn test_create_under_missing_parent_fails_without_partial_rows() {
        let store = store();
        let result = store.create_node(&folder("orphan", Some("missing")));
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(store.get_node("orphan").unwrap().is_none());
        assert!(store.list_closure_edges("orphan").unwrap().is_empty());
    }

    #[test]
    fn test_dataset_node_cannot_have_children() {
        let store = store();
        let (node, dataset) = dataset_node("d", None, "datasets/ds-d/file.tif");
        store.create_dataset_node(&node, &dataset).unwrap();

        let result = store.create_node(&folder("child", Some("d")));
        assert!(matches!(result, Err(Error::Validation(_))));

        store.create_node(&folder("other", None)).unwrap();
        let result = store.move_node("other", Some("d"));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_move_node_rebuilds_subtree_edges() {
        let store = store();
        store.create_node(&folder("p1", None)).unwrap();
        store.create_node(&folder("p2", None)).unwrap();
        store.create_node(&folder("n", Some("p1"))).unwrap();
        store.create_node(&folder("leaf", Some("n"))).unwrap();

        let moved = store.move_node("n", Some("p2")).unwrap();
        assert_eq!(moved.parent_id.as_deref(), Some("p2"));

        assert_eq!(
            edge_set(&store, "leaf"),
            vec![
                ("leaf".to_string(), 0),
                ("n".to_string(), 1),
                ("p2".to_string(), 2)
            ]
        );
        assert!(store.list_descendants("p1").unwrap().is_empty());

        let moved = store.move_node("n", None).unwrap();
        assert!(moved.parent_id.is_none());
        assert_eq!(
            edge_set(&store, "leaf"),
            vec![("leaf".to_string(), 0), ("n".to_string(), 1)]
        );
    }

    #[test]
    fn test_move_into_own_subtree_is_rejected() {
        let store = store();
        store.create_node(&folder("a", None)).unwrap();
        store.create_node(&folder("b", Some("a"))).unwrap();

        assert!(matches!(
            store.move_node("a", Some("b")),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            store.move_node("a", Some("a")),
            Err(Error::Validation(_))
        ));

        let b = store.get_node("b").unwrap().unwrap();
        assert_eq!(b.parent_id.as_deref(), Some("a"));
        assert_eq!(edge_set(&store, "b").len(), 2);
    }

    #[test]
    fn test_rejected_move_keeps_rename_unapplied() {
        let store = store();
        store.create_node(&folder("a", None)).unwrap();
        store.create_node(&folder("b", Some("a"))).unwrap();

        let result = store.update_node("a", Some("renamed"), Some(Some("b")));
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(store.get_node("a").unwrap().unwrap().name, "a");
    }

    #[test]
    fn test_update_node_renames_and_moves_together() {
        let store = store();
        store.create_node(&folder("p", None)).unwrap();
        store.create_node(&folder("n", None)).unwrap();

        let updated = store.update_node("n", Some("moved"), Some(Some("p"))).unwrap();
        assert_eq!(updated.name, "moved");
        assert_eq!(updated.parent_id.as_deref(), Some("p"));
        assert_eq!(
            edge_set(&store, "n"),
            vec![("n".to_string(), 0), ("p".to_string(), 1)]
        );
    }

    #[test]
    fn test_delete_node_returns_storage_keys_and_cascades() {
        let store = store();
        store.create_node(&folder("root", None)).unwrap();
        let (node, dataset) = dataset_node("ortho", Some("root"), "datasets/ds-ortho/file.tif");
        store.create_dataset_node(&node, &dataset).unwrap();

        let mut tileset = store.begin_tileset_processing("ds-ortho").unwrap();
        tileset.status = TileSetStatus::Ready;
        tileset.storage_key = "tilesets/t/processed.tif".to_string();
        store.update_tileset(&tileset).unwrap();

        let mut keys = store.delete_node("root").unwrap().unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "datasets/ds-ortho/file.tif".to_string(),
                "tilesets/t/processed.tif".to_string()
            ]
        );

        assert!(store.get_node("ortho").unwrap().is_none());
        assert!(store.get_dataset("ds-ortho").unwrap().is_none());
        assert!(store.get_tileset_by_dataset("ds-ortho").unwrap().is_none());
        assert!(store.list_closure_edges("ortho").unwrap().is_empty());
        assert!(store.delete_node("root").unwrap().is_none());
    }

    #[test]
    fn test_begin_tileset_processing_resets_failure() {
        let store = store();
        let (node, dataset) = dataset_node("d", None, "datasets/ds-d/file.tif");
        store.create_dataset_node(&node, &dataset).unwrap();

        let mut tileset = store.begin_tileset_processing("ds-d").unwrap();
        assert_eq!(tileset.status, TileSetStatus::Processing);

        tileset.status = TileSetStatus::Failed;
        tileset.error_message = "boom".to_string();
        tileset.bounds = Some([1.0, 2.0, 3.0, 4.0]);
        store.update_tileset(&tileset).unwrap();

        let again = store.begin_tileset_processing("ds-d").unwrap();
        assert_eq!(again.id, tileset.id);
        assert_eq!(again.status, TileSetStatus::Processing);
        assert!(again.error_message.is_empty());
        assert_eq!(again.bounds, Some([1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn test_dataset_metadata_round_trips_through_store() {
        let store = store();
        let (node, mut dataset) = dataset_node("d", None, "k");
        dataset.metadata.srid = Some(3857);
        dataset
            .metadata
            .extra
            .insert("sensor".to_string(), serde_json::json!("lidar"));
        store.create_dataset_node(&node, &dataset).unwrap();

        let fetched = store.get_dataset_by_storage_key("k").unwrap().unwrap();
        assert_eq!(fetched.metadata, dataset.metadata);
        assert_eq!(fetched.node_id, "d");
    }

    #[test]
    fn test_notifications_are_scoped_to_user() {
        let store = store();
        for (id, user) in [("n1", "alice"), ("n2", "bob")] {
            store
                .create_notification(&Notification {
                    id: id.to_string(),
                    user_id: user.to_string(),
                    message: format!("hello {user}"),
                    created_at: Utc::now(),
                })
                .unwrap();
        }

        let alice = store.list_notifications("alice").unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].message, "hello alice");
    }

    #[test]
    fn test_rebuild_closure_restores_edges() {
        let store = store();
        store.create_node(&folder("a", None)).unwrap();
        store.create_node(&folder("b", Some("a"))).unwrap();
        store
            .conn()
            .execute("DELETE FROM node_closure WHERE depth > 0", [])
            .unwrap();

        assert_eq!(store.rebuild_closure().unwrap(), 3);
        assert_eq!(
            edge_set(&store, "b"),
            vec![("b".to_string(), 0), ("a".to_string(), 1)]
        );
    }
}
