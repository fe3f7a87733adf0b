//! 持久化存储
//!
//! 缓存的持久层和示例预设都保存在同一个 SQLite 数据库里。
//! 翻译记录以规范化后的源文本为唯一键，每次写入都追加一条历史记录。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::{Result, TranslationError};
use crate::types::{
    ExampleLines, ExamplePreset, HistoryPage, HistoryQuery, TranslationHistoryEntry,
    TranslationRecord,
};

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS translation_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_key TEXT NOT NULL UNIQUE,
    target_text TEXT NOT NULL,
    success INTEGER NOT NULL,
    model_name TEXT,
    file_info TEXT,
    created_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS translation_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id INTEGER NOT NULL,
    source TEXT NOT NULL,
    target TEXT NOT NULL,
    success INTEGER NOT NULL,
    model TEXT,
    file_info TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (record_id) REFERENCES translation_records(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_history_record ON translation_history(record_id);
CREATE INDEX IF NOT EXISTS idx_history_created ON translation_history(created_at);

CREATE TABLE IF NOT EXISTS example_presets (
    name TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    examples_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// SQLite 单条语句允许的参数数量有限，批量查询按此分块
const QUERY_CHUNK: usize = 500;

/// 缓存的持久层接口
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// 批量查询；返回的映射包含每个请求的键，未命中为 `None`
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Option<String>>>;

    /// 批量写入，记录与历史在同一个事务里
    async fn set_many(
        &self,
        entries: &[(String, String)],
        success: bool,
        file_info: Option<&str>,
        model: Option<&str>,
    ) -> Result<()>;

    async fn get_record(&self, id: i64) -> Result<Option<TranslationRecord>>;

    async fn find_record(&self, source_key: &str) -> Result<Option<TranslationRecord>>;

    /// 修改译文，同时追加一条历史
    async fn update_record(
        &self,
        id: i64,
        target_text: &str,
        success: bool,
    ) -> Result<Option<TranslationRecord>>;

    /// 删除记录（历史级联删除），返回被删除的记录
    async fn delete_record(&self, id: i64) -> Result<Option<TranslationRecord>>;

    async fn delete_by_keys(&self, keys: &[String]) -> Result<usize>;

    async fn history(&self, query: HistoryQuery) -> Result<HistoryPage>;

    async fn clear(&self) -> Result<()>;
}

/// 示例预设的持久化接口
#[async_trait]
pub trait PresetStore: Send + Sync {
    async fn create_preset(&self, preset: &ExamplePreset) -> Result<()>;
    async fn list_presets(&self) -> Result<Vec<ExamplePreset>>;
    async fn get_preset(&self, name: &str) -> Result<Option<ExamplePreset>>;
    async fn update_preset(&self, preset: &ExamplePreset) -> Result<bool>;
    async fn delete_preset(&self, name: &str) -> Result<bool>;
}

/// 基于 SQLite 的存储实现
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// 打开（必要时创建）数据库文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// 仅存在于内存中的数据库
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 在阻塞线程池中使用连接
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| TranslationError::StorageError("connection mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await?
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<TranslationRecord> {
        Ok(TranslationRecord {
            id: row.get(0)?,
            source_key: row.get(1)?,
            target_text: row.get(2)?,
            success: row.get(3)?,
            model_name: row.get(4)?,
            file_info: row.get(5)?,
            created_at: row.get(6)?,
            last_accessed_at: row.get(7)?,
        })
    }

    fn row_to_history(row: &Row) -> rusqlite::Result<TranslationHistoryEntry> {
        Ok(TranslationHistoryEntry {
            id: row.get(0)?,
            record_id: row.get(1)?,
            source: row.get(2)?,
            target: row.get(3)?,
            success: row.get(4)?,
            model: row.get(5)?,
            file_info: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn select_record(conn: &Connection, column: &str, value: &dyn rusqlite::ToSql) -> Result<Option<TranslationRecord>> {
        let sql = format!(
            "SELECT id, source_key, target_text, success, model_name, file_info, created_at, last_accessed_at
             FROM translation_records WHERE {} = ?1",
            column
        );
        let record = conn
            .query_row(&sql, [value], Self::row_to_record)
            .optional()?;
        Ok(record)
    }

    fn append_history(
        conn: &Connection,
        record_id: i64,
        source: &str,
        target: &str,
        success: bool,
        model: Option<&str>,
        file_info: Option<&str>,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO translation_history (record_id, source, target, success, model, file_info, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![record_id, source, target, success, model, file_info, Utc::now()],
        )?;
        Ok(())
    }

    fn row_to_preset(row: &Row) -> rusqlite::Result<(String, String, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    }

    fn decode_preset((name, description, json): (String, String, String)) -> Result<ExamplePreset> {
        let examples: HashMap<String, ExampleLines> = serde_json::from_str(&json)?;
        Ok(ExamplePreset {
            name,
            description,
            examples,
        })
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Option<String>>> {
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            let mut found: HashMap<String, Option<String>> =
                keys.iter().map(|k| (k.clone(), None)).collect();
            let now = Utc::now();
            let tx = conn.transaction()?;

            for chunk in keys.chunks(QUERY_CHUNK) {
                let placeholders = vec!["?"; chunk.len()].join(", ");
                let sql = format!(
                    "SELECT source_key, target_text FROM translation_records
                     WHERE success = 1 AND source_key IN ({})",
                    placeholders
                );
                let hits: Vec<(String, String)> = {
                    let mut stmt = tx.prepare(&sql)?;
                    let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?;
                    rows.collect::<rusqlite::Result<_>>()?
                };

                if !hits.is_empty() {
                    let sql = format!(
                        "UPDATE translation_records SET last_accessed_at = ? WHERE source_key IN ({})",
                        vec!["?"; hits.len()].join(", ")
                    );
                    let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now)];
                    values.extend(hits.iter().map(|(k, _)| Box::new(k.clone()) as Box<dyn rusqlite::ToSql>));
                    tx.execute(&sql, params_from_iter(values.iter()))?;
                }

                for (key, target) in hits {
                    found.insert(key, Some(target));
                }
            }

            tx.commit()?;
            Ok(found)
        })
        .await
    }

    async fn set_many(
        &self,
        entries: &[(String, String)],
        success: bool,
        file_info: Option<&str>,
        model: Option<&str>,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let entries = entries.to_vec();
        let file_info = file_info.map(str::to_string);
        let model = model.map(str::to_string);

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();

            for (key, target) in &entries {
                tx.execute(
                    "INSERT INTO translation_records
                        (source_key, target_text, success, model_name, file_info, created_at, last_accessed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                     ON CONFLICT(source_key) DO UPDATE SET
                        target_text = excluded.target_text,
                        success = excluded.success,
                        model_name = COALESCE(excluded.model_name, model_name),
                        file_info = COALESCE(excluded.file_info, file_info),
                        last_accessed_at = excluded.last_accessed_at",
                    params![key, target, success, model, file_info, now],
                )?;
                let record_id: i64 = tx.query_row(
                    "SELECT id FROM translation_records WHERE source_key = ?1",
                    [key],
                    |row| row.get(0),
                )?;
                Self::append_history(
                    &tx,
                    record_id,
                    key,
                    target,
                    success,
                    model.as_deref(),
                    file_info.as_deref(),
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_record(&self, id: i64) -> Result<Option<TranslationRecord>> {
        self.with_conn(move |conn| Self::select_record(conn, "id", &id))
            .await
    }

    async fn find_record(&self, source_key: &str) -> Result<Option<TranslationRecord>> {
        let source_key = source_key.to_string();
        self.with_conn(move |conn| Self::select_record(conn, "source_key", &source_key))
            .await
    }

    async fn update_record(
        &self,
        id: i64,
        target_text: &str,
        success: bool,
    ) -> Result<Option<TranslationRecord>> {
        let target_text = target_text.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE translation_records SET target_text = ?1, success = ?2, last_accessed_at = ?3
                 WHERE id = ?4",
                params![target_text, success, Utc::now(), id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let record = Self::select_record(&tx, "id", &id)?;
            if let Some(record) = &record {
                Self::append_history(
                    &tx,
                    record.id,
                    &record.source_key,
                    &record.target_text,
                    record.success,
                    record.model_name.as_deref(),
                    record.file_info.as_deref(),
                )?;
            }
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn delete_record(&self, id: i64) -> Result<Option<TranslationRecord>> {
        self.with_conn(move |conn| {
            let record = Self::select_record(conn, "id", &id)?;
            if record.is_some() {
                conn.execute("DELETE FROM translation_records WHERE id = ?1", [id])?;
            }
            Ok(record)
        })
        .await
    }

    async fn delete_by_keys(&self, keys: &[String]) -> Result<usize> {
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            let mut deleted = 0;
            for chunk in keys.chunks(QUERY_CHUNK) {
                let sql = format!(
                    "DELETE FROM translation_records WHERE source_key IN ({})",
                    vec!["?"; chunk.len()].join(", ")
                );
                deleted += conn.execute(&sql, params_from_iter(chunk.iter()))?;
            }
            Ok(deleted)
        })
        .await
    }

    async fn history(&self, query: HistoryQuery) -> Result<HistoryPage> {
        self.with_conn(move |conn| {
            let mut clauses: Vec<&str> = Vec::new();
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(source) = &query.source_contains {
                clauses.push("source LIKE ?");
                values.push(Box::new(format!("%{}%", source)));
            }
            if let Some(target) = &query.target_contains {
                clauses.push("target LIKE ?");
                values.push(Box::new(format!("%{}%", target)));
            }
            if let Some(file_info) = &query.file_info {
                clauses.push("file_info = ?");
                values.push(Box::new(file_info.clone()));
            }
            if let Some(from) = query.from {
                clauses.push("created_at >= ?");
                values.push(Box::new(from));
            }
            if let Some(to) = query.to {
                clauses.push("created_at <= ?");
                values.push(Box::new(to));
            }

            let filter = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM translation_history {}", filter),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )?;

            let page = query.page.max(1);
            let page_size = query.page_size.max(1);
            values.push(Box::new(page_size as i64));
            values.push(Box::new(((page - 1) * page_size) as i64));

            let sql = format!(
                "SELECT id, record_id, source, target, success, model, file_info, created_at
                 FROM translation_history {} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
                filter
            );
            let mut stmt = conn.prepare(&sql)?;
            let entries = stmt
                .query_map(params_from_iter(values.iter()), Self::row_to_history)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(HistoryPage {
                entries,
                total: total as usize,
                page,
                page_size,
            })
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM translation_records", [])?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl PresetStore for SqliteStore {
    async fn create_preset(&self, preset: &ExamplePreset) -> Result<()> {
        let preset = preset.clone();
        self.with_conn(move |conn| {
            let json = serde_json::to_string(&preset.examples)?;
            let now = Utc::now();
            conn.execute(
                "INSERT INTO example_presets (name, description, examples_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![preset.name, preset.description, json, now],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    TranslationError::InvalidInput(format!("preset '{}' already exists", preset.name))
                }
                other => other.into(),
            })?;
            Ok(())
        })
        .await
    }

    async fn list_presets(&self) -> Result<Vec<ExamplePreset>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, description, examples_json FROM example_presets ORDER BY name",
            )?;
            let rows = stmt
                .query_map([], Self::row_to_preset)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(Self::decode_preset).collect()
        })
        .await
    }

    async fn get_preset(&self, name: &str) -> Result<Option<ExamplePreset>> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT name, description, examples_json FROM example_presets WHERE name = ?1",
                    [&name],
                    Self::row_to_preset,
                )
                .optional()?;
            row.map(Self::decode_preset).transpose()
        })
        .await
    }

    async fn update_preset(&self, preset: &ExamplePreset) -> Result<bool> {
        let preset = preset.clone();
        self.with_conn(move |conn| {
            let json = serde_json::to_string(&preset.examples)?;
            let changed = conn.execute(
                "UPDATE example_presets SET description = ?1, examples_json = ?2, updated_at = ?3
                 WHERE name = ?4",
                params![preset.description, json, Utc::now(), preset.name],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn delete_preset(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute("DELETE FROM example_presets WHERE name = ?1", [&name])?;
            Ok(changed > 0)
        })
        .await
    }
}
