//! # SQLite 适配
//!
//! - [`SqliteSession`]: 基于 rusqlite 的 [`Session`] 实现
//! - [`SqliteSessionFactory`]: 打开数据库文件，设置 busy timeout
//! - [`SqliteBatchExecutor`]: 通过连接池执行分组后的批量操作
//!
//! 批量执行的 SQL 形态：
//!
//! - insert：每组一条多行 `INSERT`（列集合不同的行分成多条，受 SQLite 变量数上限约束）
//! - read：每个条件集合一条 `SELECT * FROM t WHERE col = ? AND ...`
//! - update/delete：整组在一个事务中执行，必须带条件
//!
//! 表名与列名只接受 `[A-Za-z_][A-Za-z0-9_]*`。

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Map, Value};

use super::pool::SessionPool;
use super::session::{Session, SessionFactory};
use crate::batch::{BatchExecutor, Conditions, OperationKind, OperationRequest};
use crate::error::{AccelError, Result};

/// 单条语句的变量数上限
const MAX_VARIABLES: usize = 999;

/// 校验 SQL 标识符
pub fn validate_identifier(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(name)
    } else {
        Err(AccelError::invalid_input(format!("invalid SQL identifier: {:?}", name)))
    }
}

/// JSON → SQLite 值
fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// SQLite 值 → JSON
fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| json!(b)).collect()),
    }
}

/// 有序列名
fn object_columns(payload: &Value) -> Result<Vec<&str>> {
    let object = payload
        .as_object()
        .ok_or_else(|| AccelError::invalid_input("row payload must be a JSON object"))?;
    let mut columns = object
        .keys()
        .map(|key| validate_identifier(key))
        .collect::<Result<Vec<_>>>()?;
    columns.sort_unstable();
    Ok(columns)
}

/// 构造 WHERE 子句并追加参数
fn where_clause(conditions: &Conditions, params: &mut Vec<SqlValue>) -> Result<String> {
    if conditions.is_empty() {
        return Ok(String::new());
    }

    let mut parts = Vec::with_capacity(conditions.len());
    for (column, value) in conditions {
        let column = validate_identifier(column)?;
        if value.is_null() {
            parts.push(format!("\"{}\" IS NULL", column));
        } else {
            params.push(to_sql_value(value));
            parts.push(format!("\"{}\" = ?", column));
        }
    }
    Ok(format!(" WHERE {}", parts.join(" AND ")))
}

/// rusqlite 会话
pub struct SqliteSession {
    conn: Connection,
}

impl SqliteSession {
    /// 打开数据库文件
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        Ok(Self { conn })
    }

    /// 内存数据库（每个会话独立）
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    /// 底层连接
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// 开启事务
    pub fn begin(&mut self) -> Result<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    /// 执行一段不带参数的 SQL
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// 查询单个标量
    pub fn query_scalar<T: rusqlite::types::FromSql>(&self, sql: &str) -> Result<T> {
        Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
    }

    /// 查询匹配条件的所有行，返回 JSON 对象数组
    pub fn select(&self, table: &str, conditions: &Conditions) -> Result<Value> {
        let table = validate_identifier(table)?;
        let mut params = Vec::new();
        let sql = format!("SELECT * FROM \"{}\"{}", table, where_clause(conditions, &mut params)?);

        let mut stmt = self.conn.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let rows = stmt.query_map(params_from_iter(params), |row| {
            let mut object = Map::with_capacity(names.len());
            for (i, name) in names.iter().enumerate() {
                object.insert(name.clone(), from_sql_value(row.get_ref(i)?));
            }
            Ok(Value::Object(object))
        })?;

        Ok(Value::Array(rows.collect::<rusqlite::Result<Vec<_>>>()?))
    }

    /// 插入多行，列集合相同的相邻行合并为一条语句
    ///
    /// 每行返回 `{"rows_affected": 1}`。
    pub fn insert_rows(&self, table: &str, rows: &[&Value]) -> Result<Vec<Value>> {
        let table = validate_identifier(table)?;
        let mut results = Vec::with_capacity(rows.len());

        let mut start = 0;
        while start < rows.len() {
            let columns = object_columns(rows[start])?;

            if columns.is_empty() {
                self.conn
                    .execute(&format!("INSERT INTO \"{}\" DEFAULT VALUES", table), [])?;
                results.push(json!({ "rows_affected": 1 }));
                start += 1;
                continue;
            }

            let max_rows = (MAX_VARIABLES / columns.len()).max(1);
            let mut end = start + 1;
            while end < rows.len() && end - start < max_rows && object_columns(rows[end])? == columns {
                end += 1;
            }

            let column_list = columns
                .iter()
                .map(|c| format!("\"{}\"", c))
                .collect::<Vec<_>>()
                .join(", ");
            let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
            let values_list = vec![placeholders.as_str(); end - start].join(", ");
            let sql = format!("INSERT INTO \"{}\" ({}) VALUES {}", table, column_list, values_list);

            let mut params = Vec::with_capacity((end - start) * columns.len());
            for row in &rows[start..end] {
                for column in &columns {
                    params.push(to_sql_value(&row[*column]));
                }
            }

            let inserted = self.conn.execute(&sql, params_from_iter(params))?;
            if inserted != end - start {
                return Err(AccelError::execution(format!(
                    "expected {} rows inserted into '{}', got {}",
                    end - start,
                    table,
                    inserted
                )));
            }
            results.extend((start..end).map(|_| json!({ "rows_affected": 1 })));
            start = end;
        }

        Ok(results)
    }

    /// 按条件更新，返回 `{"rows_affected": n}`
    pub fn update(&self, table: &str, conditions: &Conditions, changes: &Value) -> Result<Value> {
        let table = validate_identifier(table)?;
        if conditions.is_empty() {
            return Err(AccelError::invalid_input(format!("refusing unconditioned update of '{}'", table)));
        }

        let columns = object_columns(changes)?;
        if columns.is_empty() {
            return Err(AccelError::invalid_input("update payload has no columns"));
        }

        let mut params: Vec<SqlValue> = columns.iter().map(|c| to_sql_value(&changes[*c])).collect();
        let assignments = columns
            .iter()
            .map(|c| format!("\"{}\" = ?", c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE \"{}\" SET {}{}",
            table,
            assignments,
            where_clause(conditions, &mut params)?
        );

        let affected = self.conn.execute(&sql, params_from_iter(params))?;
        Ok(json!({ "rows_affected": affected }))
    }

    /// 按条件删除，返回 `{"rows_affected": n}`
    pub fn delete(&self, table: &str, conditions: &Conditions) -> Result<Value> {
        let table = validate_identifier(table)?;
        if conditions.is_empty() {
            return Err(AccelError::invalid_input(format!("refusing unconditioned delete from '{}'", table)));
        }

        let mut params = Vec::new();
        let sql = format!("DELETE FROM \"{}\"{}", table, where_clause(conditions, &mut params)?);
        let affected = self.conn.execute(&sql, params_from_iter(params))?;
        Ok(json!({ "rows_affected": affected }))
    }
}

#[async_trait]
impl Session for SqliteSession {
    async fn ping(&mut self) -> Result<()> {
        let one: i64 = self.conn.query_row("SELECT 1", [], |row| row.get(0))?;
        if one == 1 {
            Ok(())
        } else {
            Err(AccelError::liveness("unexpected probe result"))
        }
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    async fn commit(&mut self) -> Result<()> {
        if self.in_transaction() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.in_transaction() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }
}

/// 打开 SQLite 文件的会话工厂
#[derive(Debug, Clone)]
pub struct SqliteSessionFactory {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteSessionFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SessionFactory for SqliteSessionFactory {
    type Session = SqliteSession;

    async fn create(&self) -> Result<SqliteSession> {
        SqliteSession::open(&self.path, self.busy_timeout)
    }
}

/// 通过连接池执行分组操作
#[derive(Clone)]
pub struct SqliteBatchExecutor {
    pool: SessionPool<SqliteSession>,
}

impl SqliteBatchExecutor {
    pub fn new(pool: SessionPool<SqliteSession>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SessionPool<SqliteSession> {
        &self.pool
    }
}

#[async_trait]
impl BatchExecutor for SqliteBatchExecutor {
    async fn execute_group(
        &self,
        kind: OperationKind,
        target: &str,
        operations: &[OperationRequest],
    ) -> Result<Vec<Value>> {
        let table = validate_identifier(target)?.to_string();
        let operations = operations.to_vec();

        self.pool
            .with_session(move |session| {
                Box::pin(async move {
                    match kind {
                        OperationKind::Read => operations
                            .iter()
                            .map(|op| session.select(&table, &op.conditions))
                            .collect(),
                        OperationKind::Insert => {
                            session.begin()?;
                            let rows: Vec<&Value> = operations.iter().map(|op| &op.payload).collect();
                            session.insert_rows(&table, &rows)
                        }
                        OperationKind::Update => {
                            session.begin()?;
                            operations
                                .iter()
                                .map(|op| session.update(&table, &op.conditions, &op.payload))
                                .collect()
                        }
                        OperationKind::Delete => {
                            session.begin()?;
                            operations
                                .iter()
                                .map(|op| session.delete(&table, &op.conditions))
                                .collect()
                        }
                    }
                })
            })
            .await
    }
}
