// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-workspace application databases.
//!
//! Every workspace gets its own SQLite file, so a statement issued by one
//! workspace's isolate cannot reach another workspace's rows.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Arguments, Column, Row, SqlitePool, TypeInfo, ValueRef};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Result of one statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
    pub affected_rows: u64,
}

/// Database reachable from a workspace's isolate.
#[async_trait]
pub trait WorkspaceDb: Send + Sync {
    /// Run one statement with positional parameters against `workspace_id`'s database.
    async fn execute(&self, workspace_id: Uuid, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Close and delete a workspace's database.
    async fn drop_workspace(&self, workspace_id: Uuid) -> Result<()>;
}

/// One SQLite file per workspace under a root directory.
pub struct SqliteWorkspaceDb {
    root: PathBuf,
    pools: DashMap<Uuid, SqlitePool>,
}

impl SqliteWorkspaceDb {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pools: DashMap::new(),
        }
    }

    pub fn path_of(&self, workspace_id: Uuid) -> PathBuf {
        self.root.join(format!("{workspace_id}.db"))
    }

    pub fn exists(&self, workspace_id: Uuid) -> bool {
        self.path_of(workspace_id).exists()
    }

    async fn pool(&self, workspace_id: Uuid) -> Result<SqlitePool> {
        if let Some(pool) = self.pools.get(&workspace_id) {
            return Ok(pool.clone());
        }
        tokio::fs::create_dir_all(&self.root).await?;
        let pool = open(&self.path_of(workspace_id)).await?;
        // A concurrent opener may have won; keep the first pool.
        Ok(self.pools.entry(workspace_id).or_insert(pool).clone())
    }
}

async fn open(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.to_string_lossy()))?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await?;
    Ok(pool)
}

fn is_query(sql: &str) -> bool {
    let head = sql.trim_start().to_ascii_uppercase();
    ["SELECT", "WITH", "PRAGMA", "EXPLAIN", "VALUES"]
        .iter()
        .any(|kw| head.starts_with(kw))
        || head.contains(" RETURNING ")
}

fn bind_params<'q>(params: &[Value]) -> Result<SqliteArguments<'q>> {
    let mut args = SqliteArguments::default();
    for (i, param) in params.iter().enumerate() {
        let added = match param {
            Value::Null => args.add(Option::<String>::None),
            Value::Bool(b) => args.add(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => args.add(i),
                None => args.add(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => args.add(s.clone()),
            other => args.add(other.to_string()),
        };
        added.map_err(|e| Error::InvalidRequest(format!("parameter {}: {e}", i + 1)))?;
    }
    Ok(args)
}

fn column_value(row: &SqliteRow, index: usize) -> Result<Value> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_ascii_uppercase();
    let value = match type_name.as_str() {
        "INTEGER" | "BOOLEAN" | "INT8" | "BIGINT" => Value::from(row.try_get::<i64, _>(index)?),
        "REAL" | "NUMERIC" => Number::from_f64(row.try_get::<f64, _>(index)?)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "BLOB" => Value::String(hex::encode(row.try_get::<Vec<u8>, _>(index)?)),
        _ => Value::String(row.try_get::<String, _>(index)?),
    };
    Ok(value)
}

#[async_trait]
impl WorkspaceDb for SqliteWorkspaceDb {
    async fn execute(&self, workspace_id: Uuid, sql: &str, params: &[Value]) -> Result<QueryResult> {
        if sql.trim().is_empty() {
            return Err(Error::InvalidRequest("statement is empty".into()));
        }
        let upper = sql.to_ascii_uppercase();
        if upper.contains("ATTACH") || upper.contains("DETACH") {
            return Err(Error::InvalidRequest("ATTACH and DETACH are not allowed".into()));
        }

        let pool = self.pool(workspace_id).await?;
        let args = bind_params(params)?;
        let query = sqlx::query_with(sql, args);

        if is_query(sql) {
            let rows = query
                .fetch_all(&pool)
                .await
                .map_err(|e| Error::InvalidRequest(format!("query failed: {e}")))?;
            let columns: Vec<String> = rows
                .first()
                .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
                .unwrap_or_default();
            let mut out = Vec::with_capacity(rows.len());
            for row in &rows {
                let mut map = Map::new();
                for (i, name) in columns.iter().enumerate() {
                    map.insert(name.clone(), column_value(row, i)?);
                }
                out.push(map);
            }
            debug!(workspace_id = %workspace_id, rows = out.len(), "Workspace query");
            Ok(QueryResult {
                columns,
                rows: out,
                affected_rows: 0,
            })
        } else {
            let result = query
                .execute(&pool)
                .await
                .map_err(|e| Error::InvalidRequest(format!("statement failed: {e}")))?;
            Ok(QueryResult {
                affected_rows: result.rows_affected(),
                ..QueryResult::default()
            })
        }
    }

    async fn drop_workspace(&self, workspace_id: Uuid) -> Result<()> {
        if let Some((_, pool)) = self.pools.remove(&workspace_id) {
            pool.close().await;
        }
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{suffix}", self.path_of(workspace_id).display()));
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_execute_ddl_dml_and_select() {
        let dir = TempDir::new().unwrap();
        let db = SqliteWorkspaceDb::new(dir.path());
        let ws = Uuid::new_v4();

        db.execute(ws, "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, price REAL)", &[])
            .await
            .unwrap();
        let inserted = db
            .execute(ws, "INSERT INTO items (name, price) VALUES (?, ?)", &[json!("apple"), json!(1.5)])
            .await
            .unwrap();
        assert_eq!(inserted.affected_rows, 1);
        assert!(db.exists(ws));

        let result = db.execute(ws, "SELECT * FROM items", &[]).await.unwrap();
        assert_eq!(result.columns, vec!["id", "name", "price"]);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0]["name"], json!("apple"));
        assert_eq!(result.rows[0]["id"], json!(1));
        assert_eq!(result.rows[0]["price"], json!(1.5));
    }

    #[tokio::test]
    async fn test_workspaces_are_isolated() {
        let dir = TempDir::new().unwrap();
        let db = SqliteWorkspaceDb::new(dir.path());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        db.execute(a, "CREATE TABLE secrets (v TEXT)", &[]).await.unwrap();
        db.execute(a, "INSERT INTO secrets VALUES ('a-only')", &[]).await.unwrap();

        assert!(db.execute(b, "SELECT * FROM secrets", &[]).await.is_err());
        let attach = format!("ATTACH DATABASE '{}' AS other", db.path_of(a).display());
        assert!(matches!(
            db.execute(b, &attach, &[]).await,
            Err(Error::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_workspace_removes_file() {
        let dir = TempDir::new().unwrap();
        let db = SqliteWorkspaceDb::new(dir.path());
        let ws = Uuid::new_v4();
        db.execute(ws, "CREATE TABLE t (v INTEGER)", &[]).await.unwrap();
        db.drop_workspace(ws).await.unwrap();
        assert!(!db.exists(ws));
        db.drop_workspace(ws).await.unwrap();
    }
}
