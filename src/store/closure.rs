//! Closure-table maintenance for the node tree.
//!
//! Every function here takes the connection of an open transaction; callers
//! commit or roll back the node write and the edge changes together.

use std::collections::{HashMap, VecDeque};

use rusqlite::{Connection, params};

use crate::error::Result;

/// Inserts the closure rows of a freshly inserted node: the `(n, n, 0)` self
/// edge plus one edge per ancestor of `parent_id`, one hop deeper.
pub(crate) fn insert_node_edges(
    conn: &Connection,
    node_id: &str,
    parent_id: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO node_closure (ancestor_id, descendant_id, depth) VALUES (?1, ?1, 0)",
        params![node_id],
    )?;

    if let Some(parent_id) = parent_id {
        conn.execute(
            "INSERT INTO node_closure (ancestor_id, descendant_id, depth)
             SELECT ancestor_id, ?1, depth + 1 FROM node_closure WHERE descendant_id = ?2",
            params![node_id, parent_id],
        )?;
    }

    Ok(())
}

/// Re-links the subtree rooted at `node_id` after its parent pointer changed.
///
/// Edges internal to the subtree keep their relative depths. Edges from any
/// node outside the subtree to any node inside it are dropped, then rebuilt by
/// crossing the new parent's ancestor set with the subtree's descendant set.
pub(crate) fn relink_subtree(
    conn: &Connection,
    node_id: &str,
    new_parent_id: Option<&str>,
) -> Result<()> {
    let removed = conn.execute(
        "DELETE FROM node_closure
         WHERE descendant_id IN (SELECT descendant_id FROM node_closure WHERE ancestor_id = ?1)
           AND ancestor_id NOT IN (SELECT descendant_id FROM node_closure WHERE ancestor_id = ?1)",
        params![node_id],
    )?;

    let added = match new_parent_id {
        Some(parent_id) => conn.execute(
            "INSERT INTO node_closure (ancestor_id, descendant_id, depth)
             SELECT p.ancestor_id, c.descendant_id, p.depth + c.depth + 1
             FROM node_closure p
             JOIN node_closure c
             WHERE p.descendant_id = ?1 AND c.ancestor_id = ?2",
            params![parent_id, node_id],
        )?,
        None => 0,
    };

    tracing::debug!(node_id, removed, added, "relinked subtree closure");
    Ok(())
}

/// Returns true when `candidate` is `node_id` itself or one of its descendants.
pub(crate) fn is_in_subtree(conn: &Connection, node_id: &str, candidate: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM node_closure WHERE ancestor_id = ?1 AND descendant_id = ?2",
        params![node_id, candidate],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Rebuilds the whole closure table from the parent pointers.
///
/// Walks the forest breadth-first from its roots, so each node's parent rows
/// are already present when the node is visited. Returns the number of edges
/// written.
pub(crate) fn rebuild_all(conn: &Connection) -> Result<usize> {
    let mut children: HashMap<Option<String>, Vec<String>> = HashMap::new();
    {
        let mut stmt = conn.prepare("SELECT id, parent_id FROM nodes ORDER BY created_at, id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        for row in rows {
            let (id, parent_id) = row?;
            children.entry(parent_id).or_default().push(id);
        }
    }

    conn.execute("DELETE FROM node_closure", [])?;

    // (node, ancestors ordered nearest first)
    let mut queue: VecDeque<(String, Vec<String>)> = children
        .get(&None)
        .into_iter()
        .flatten()
        .map(|id| (id.clone(), Vec::new()))
        .collect();

    let mut insert = conn.prepare(
        "INSERT INTO node_closure (ancestor_id, descendant_id, depth) VALUES (?1, ?2, ?3)",
    )?;
    let mut written = 0;

    while let Some((node_id, ancestors)) = queue.pop_front() {
        insert.execute(params![node_id, node_id, 0])?;
        written += 1;
        for (hops, ancestor) in ancestors.iter().enumerate() {
            insert.execute(params![ancestor, node_id, hops as i64 + 1])?;
            written += 1;
        }

        if let Some(kids) = children.get(&Some(node_id.clone())) {
            let mut chain = Vec::with_capacity(ancestors.len() + 1);
            chain.push(node_id.clone());
            chain.extend(ancestors.iter().cloned());
            for kid in kids {
                queue.push_back((kid.clone(), chain.clone()));
            }
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::SCHEMA;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn
    }

    fn add(conn: &Connection, id: &str, parent: Option<&str>) {
        conn.execute(
            "INSERT INTO nodes (id, name, parent_id, kind, owner_id) VALUES (?1, ?1, ?2, 'folder', 'u')",
            params![id, parent],
        )
        .unwrap();
        insert_node_edges(conn, id, parent).unwrap();
    }

    fn reparent(conn: &Connection, id: &str, parent: Option<&str>) {
        conn.execute(
            "UPDATE nodes SET parent_id = ?1 WHERE id = ?2",
            params![parent, id],
        )
        .unwrap();
        relink_subtree(conn, id, parent).unwrap();
    }

    fn edges(conn: &Connection) -> Vec<(String, String, i64)> {
        let mut stmt = conn
            .prepare(
                "SELECT ancestor_id, descendant_id, depth FROM node_closure
                 ORDER BY descendant_id, depth",
            )
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    fn e(a: &str, d: &str, depth: i64) -> (String, String, i64) {
        (a.to_string(), d.to_string(), depth)
    }

    #[test]
    fn test_root_node_has_only_self_edge() {
        let conn = setup();
        add(&conn, "imagery", None);
        assert_eq!(edges(&conn), vec![e("imagery", "imagery", 0)]);
    }

    #[test]
    fn test_child_copies_parent_ancestors() {
        let conn = setup();
        add(&conn, "a", None);
        add(&conn, "b", Some("a"));
        add(&conn, "c", Some("b"));

        assert_eq!(
            edges(&conn),
            vec![
                e("a", "a", 0),
                e("b", "b", 0),
                e("a", "b", 1),
                e("c", "c", 0),
                e("b", "c", 1),
                e("a", "c", 2),
            ]
        );
    }

    #[test]
    fn test_reparent_updates_whole_subtree() {
        let conn = setup();
        add(&conn, "p1", None);
        add(&conn, "p2", None);
        add(&conn, "n", Some("p1"));
        add(&conn, "child", Some("n"));
        add(&conn, "grandchild", Some("child"));

        reparent(&conn, "n", Some("p2"));

        let all = edges(&conn);
        assert!(!all.contains(&e("p1", "n", 1)));
        assert!(!all.contains(&e("p1", "child", 2)));
        assert!(!all.contains(&e("p1", "grandchild", 3)));
        assert!(all.contains(&e("p2", "n", 1)));
        assert!(all.contains(&e("p2", "child", 2)));
        assert!(all.contains(&e("p2", "grandchild", 3)));
        assert!(all.contains(&e("n", "grandchild", 2)));
        assert!(all.contains(&e("child", "grandchild", 1)));
    }

    #[test]
    fn test_reparent_to_root_keeps_relative_depths() {
        let conn = setup();
        add(&conn, "top", None);
        add(&conn, "mid", Some("top"));
        add(&conn, "leaf", Some("mid"));

        reparent(&conn, "mid", None);

        assert_eq!(
            edges(&conn),
            vec![
                e("leaf", "leaf", 0),
                e("mid", "leaf", 1),
                e("mid", "mid", 0),
                e("top", "top", 0),
            ]
        );
    }

    #[test]
    fn test_rebuild_all_matches_incremental_maintenance() {
        let conn = setup();
        add(&conn, "r1", None);
        add(&conn, "r2", None);
        add(&conn, "x", Some("r1"));
        add(&conn, "y", Some("x"));
        add(&conn, "z", Some("y"));
        reparent(&conn, "y", Some("r2"));

        let incremental = edges(&conn);
        let written = rebuild_all(&conn).unwrap();

        assert_eq!(written, incremental.len());
        assert_eq!(edges(&conn), incremental);
    }

    #[test]
    fn test_is_in_subtree() {
        let conn = setup();
        add(&conn, "a", None);
        add(&conn, "b", Some("a"));
        add(&conn, "c", None);

        assert!(is_in_subtree(&conn, "a", "b").unwrap());
        assert!(is_in_subtree(&conn, "a", "a").unwrap());
        assert!(!is_in_subtree(&conn, "b", "a").unwrap());
        assert!(!is_in_subtree(&conn, "a", "c").unwrap());
    }
}
