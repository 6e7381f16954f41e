//! Domain store: the `(domain, token, enabled)` records behind agent
//! authentication, plus the request log sink.
//!
//! Two backends share one front: a SQLite pool for persistence and an
//! in-memory map for tests and database-less deployments. The broker picks
//! at startup based on whether a database URL was configured.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{info, warn};
use tunely_core::{TunnelError, TunnelResult};
use uuid::Uuid;

/// Request/response bodies in the log are truncated to this many bytes.
const LOG_BODY_LIMIT: usize = 10_000;

/// The in-memory backend keeps at most this many log rows.
const MEMORY_LOG_CAP: usize = 1_000;

/// Relay mode of a domain record. Only `http` records accept control-channel
/// binds; `tcp` belongs to the separate raw-byte transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    #[default]
    Http,
    Tcp,
}

impl TunnelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelMode::Http => "http",
            TunnelMode::Tcp => "tcp",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "tcp" => TunnelMode::Tcp,
            "http" => TunnelMode::Http,
            other => {
                warn!("unknown tunnel mode '{}', treating as http", other);
                TunnelMode::Http
            }
        }
    }
}

/// One registered domain.
#[derive(Debug, Clone, Serialize)]
pub struct DomainRecord {
    pub tunnel_id: String,
    pub domain: String,
    pub token: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: bool,
    pub mode: TunnelMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub total_requests: u64,
}

/// Mutable fields of a domain record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
}

impl DomainUpdate {
    fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.enabled.is_none()
    }
}

/// One completed forward.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub timestamp: DateTime<Utc>,
    pub domain: String,
    pub method: String,
    pub path: String,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
}

impl RequestLog {
    /// Build a log row for a finished forward, truncating bodies.
    pub fn new(
        domain: &str,
        method: &str,
        path: &str,
        status_code: Option<u16>,
        error: Option<String>,
        duration_ms: u64,
        request_body: Option<&str>,
        response_body: Option<&str>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            domain: domain.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            status_code,
            error,
            duration_ms,
            request_body: request_body.map(truncate_body),
            response_body: response_body.map(truncate_body),
        }
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() <= LOG_BODY_LIMIT {
        return body.to_string();
    }
    let mut end = LOG_BODY_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Generate a fresh connection token.
fn generate_token() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("tun_{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Store front over the configured backend.
#[derive(Clone)]
pub enum TunnelStore {
    Memory(Arc<MemoryStore>),
    Sqlite(SqliteStore),
}

impl TunnelStore {
    /// Open the store. With no URL the broker runs memory-only, as when the
    /// database is unreachable at startup.
    pub async fn connect(database_url: Option<&str>) -> TunnelResult<Self> {
        match database_url {
            Some(url) => match SqliteStore::connect(url).await {
                Ok(store) => {
                    info!("domain store backed by {}", url);
                    Ok(TunnelStore::Sqlite(store))
                }
                Err(e) => {
                    warn!("failed to open database: {}. Running memory-only.", e);
                    Ok(TunnelStore::memory())
                }
            },
            None => {
                info!("no database configured, running memory-only");
                Ok(TunnelStore::memory())
            }
        }
    }

    /// A fresh in-memory store.
    pub fn memory() -> Self {
        TunnelStore::Memory(Arc::new(MemoryStore::default()))
    }

    pub async fn create_domain(
        &self,
        domain: &str,
        name: Option<String>,
        description: Option<String>,
        mode: TunnelMode,
    ) -> TunnelResult<DomainRecord> {
        let record = DomainRecord {
            tunnel_id: Uuid::new_v4().to_string(),
            domain: domain.to_string(),
            token: generate_token(),
            name,
            description,
            enabled: true,
            mode,
            created_at: Utc::now(),
            updated_at: None,
            last_connected_at: None,
            total_requests: 0,
        };
        match self {
            TunnelStore::Memory(m) => m.create(record),
            TunnelStore::Sqlite(s) => s.create(record).await,
        }
    }

    pub async fn lookup_by_token(&self, token: &str) -> TunnelResult<Option<DomainRecord>> {
        match self {
            TunnelStore::Memory(m) => Ok(m.find(|r| r.token == token)),
            TunnelStore::Sqlite(s) => s.lookup("token", token).await,
        }
    }

    pub async fn lookup_by_domain(&self, domain: &str) -> TunnelResult<Option<DomainRecord>> {
        match self {
            TunnelStore::Memory(m) => Ok(m.find(|r| r.domain == domain)),
            TunnelStore::Sqlite(s) => s.lookup("domain", domain).await,
        }
    }

    pub async fn list_domains(&self) -> TunnelResult<Vec<DomainRecord>> {
        match self {
            TunnelStore::Memory(m) => Ok(m.list()),
            TunnelStore::Sqlite(s) => s.list().await,
        }
    }

    pub async fn update_domain(
        &self,
        domain: &str,
        update: DomainUpdate,
    ) -> TunnelResult<Option<DomainRecord>> {
        if update.is_empty() {
            return self.lookup_by_domain(domain).await;
        }
        match self {
            TunnelStore::Memory(m) => Ok(m.update(domain, update)),
            TunnelStore::Sqlite(s) => s.update(domain, update).await,
        }
    }

    pub async fn delete_domain(&self, domain: &str) -> TunnelResult<bool> {
        match self {
            TunnelStore::Memory(m) => Ok(m.delete(domain)),
            TunnelStore::Sqlite(s) => s.delete(domain).await,
        }
    }

    pub async fn regenerate_token(&self, domain: &str) -> TunnelResult<Option<String>> {
        let token = generate_token();
        match self {
            TunnelStore::Memory(m) => Ok(m.set_token(domain, token)),
            TunnelStore::Sqlite(s) => s.set_token(domain, token).await,
        }
    }

    /// Stamp `last_connected_at` on a successful bind.
    pub async fn mark_connected(&self, token: &str) -> TunnelResult<()> {
        match self {
            TunnelStore::Memory(m) => {
                m.touch(token);
                Ok(())
            }
            TunnelStore::Sqlite(s) => s.mark_connected(token).await,
        }
    }

    /// Bump the per-domain forward counter.
    pub async fn increment_requests(&self, domain: &str) -> TunnelResult<()> {
        match self {
            TunnelStore::Memory(m) => {
                m.increment(domain);
                Ok(())
            }
            TunnelStore::Sqlite(s) => s.increment(domain).await,
        }
    }

    /// Append one request-log row.
    pub async fn record_request(&self, log: RequestLog) -> TunnelResult<()> {
        match self {
            TunnelStore::Memory(m) => {
                m.record(log);
                Ok(())
            }
            TunnelStore::Sqlite(s) => s.record(log).await,
        }
    }

    /// Most recent log rows for a domain, newest first.
    pub async fn recent_logs(
        &self,
        domain: &str,
        limit: u32,
        offset: u32,
    ) -> TunnelResult<(u64, Vec<RequestLog>)> {
        match self {
            TunnelStore::Memory(m) => Ok(m.recent(domain, limit, offset)),
            TunnelStore::Sqlite(s) => s.recent(domain, limit, offset).await,
        }
    }
}

// ============== in-memory backend ==============

#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, DomainRecord>,
    logs: Mutex<Vec<RequestLog>>,
}

impl MemoryStore {
    fn create(&self, record: DomainRecord) -> TunnelResult<DomainRecord> {
        use dashmap::mapref::entry::Entry;
        match self.records.entry(record.domain.clone()) {
            Entry::Occupied(_) => Err(TunnelError::conflict(format!(
                "domain '{}' already exists",
                record.domain
            ))),
            Entry::Vacant(v) => {
                v.insert(record.clone());
                Ok(record)
            }
        }
    }

    fn find(&self, pred: impl Fn(&DomainRecord) -> bool) -> Option<DomainRecord> {
        self.records
            .iter()
            .find(|entry| pred(entry.value()))
            .map(|entry| entry.value().clone())
    }

    fn list(&self) -> Vec<DomainRecord> {
        let mut all: Vec<DomainRecord> = self.records.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    fn update(&self, domain: &str, update: DomainUpdate) -> Option<DomainRecord> {
        let mut entry = self.records.get_mut(domain)?;
        if let Some(name) = update.name {
            entry.name = Some(name);
        }
        if let Some(description) = update.description {
            entry.description = Some(description);
        }
        if let Some(enabled) = update.enabled {
            entry.enabled = enabled;
        }
        entry.updated_at = Some(Utc::now());
        Some(entry.clone())
    }

    fn delete(&self, domain: &str) -> bool {
        self.records.remove(domain).is_some()
    }

    fn set_token(&self, domain: &str, token: String) -> Option<String> {
        let mut entry = self.records.get_mut(domain)?;
        entry.token = token.clone();
        entry.updated_at = Some(Utc::now());
        Some(token)
    }

    fn touch(&self, token: &str) {
        for mut entry in self.records.iter_mut() {
            if entry.token == token {
                entry.last_connected_at = Some(Utc::now());
                break;
            }
        }
    }

    fn increment(&self, domain: &str) {
        if let Some(mut entry) = self.records.get_mut(domain) {
            entry.total_requests += 1;
        }
    }

    fn record(&self, log: RequestLog) {
        let mut logs = self.logs.lock().expect("log lock poisoned");
        logs.push(log);
        if logs.len() > MEMORY_LOG_CAP {
            let excess = logs.len() - MEMORY_LOG_CAP;
            logs.drain(..excess);
        }
    }

    fn recent(&self, domain: &str, limit: u32, offset: u32) -> (u64, Vec<RequestLog>) {
        let logs = self.logs.lock().expect("log lock poisoned");
        let matching: Vec<&RequestLog> = logs.iter().filter(|l| l.domain == domain).collect();
        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .rev()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        (total, page)
    }
}

// ============== SQLite backend ==============

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct TunnelRow {
    id: String,
    domain: String,
    token: String,
    name: Option<String>,
    description: Option<String>,
    enabled: bool,
    mode: String,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    last_connected_at: Option<DateTime<Utc>>,
    total_requests: i64,
}

impl From<TunnelRow> for DomainRecord {
    fn from(row: TunnelRow) -> Self {
        DomainRecord {
            tunnel_id: row.id,
            domain: row.domain,
            token: row.token,
            name: row.name,
            description: row.description,
            enabled: row.enabled,
            mode: TunnelMode::parse(&row.mode),
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_connected_at: row.last_connected_at,
            total_requests: row.total_requests.max(0) as u64,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    timestamp: DateTime<Utc>,
    domain: String,
    method: String,
    path: String,
    status_code: Option<i64>,
    error: Option<String>,
    duration_ms: i64,
    request_body: Option<String>,
    response_body: Option<String>,
}

impl From<LogRow> for RequestLog {
    fn from(row: LogRow) -> Self {
        RequestLog {
            timestamp: row.timestamp,
            domain: row.domain,
            method: row.method,
            path: row.path,
            status_code: row.status_code.map(|s| s as u16),
            error: row.error,
            duration_ms: row.duration_ms.max(0) as u64,
            request_body: row.request_body,
            response_body: row.response_body,
        }
    }
}

fn db_err(err: sqlx::Error) -> TunnelError {
    TunnelError::internal(format!("database error: {err}")).with_source(err)
}

const TUNNEL_COLUMNS: &str = "id, domain, token, name, description, enabled, mode, \
     created_at, updated_at, last_connected_at, total_requests";

impl SqliteStore {
    async fn connect(url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    async fn create(&self, record: DomainRecord) -> TunnelResult<DomainRecord> {
        if self.lookup("domain", &record.domain).await?.is_some() {
            return Err(TunnelError::conflict(format!(
                "domain '{}' already exists",
                record.domain
            )));
        }
        sqlx::query(
            "INSERT INTO tunnels (id, domain, token, name, description, enabled, mode, \
             created_at, total_requests) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(&record.tunnel_id)
        .bind(&record.domain)
        .bind(&record.token)
        .bind(&record.name)
        .bind(&record.description)
        .bind(record.enabled)
        .bind(record.mode.as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(record)
    }

    async fn lookup(&self, column: &str, value: &str) -> TunnelResult<Option<DomainRecord>> {
        // `column` is one of two internal constants, never caller input.
        let sql = format!("SELECT {TUNNEL_COLUMNS} FROM tunnels WHERE {column} = ?");
        let row = sqlx::query_as::<_, TunnelRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(DomainRecord::from))
    }

    async fn list(&self) -> TunnelResult<Vec<DomainRecord>> {
        let rows = sqlx::query_as::<_, TunnelRow>(&format!(
            "SELECT {TUNNEL_COLUMNS} FROM tunnels ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(DomainRecord::from).collect())
    }

    async fn update(&self, domain: &str, update: DomainUpdate) -> TunnelResult<Option<DomainRecord>> {
        sqlx::query(
            "UPDATE tunnels SET \
             name = COALESCE(?, name), \
             description = COALESCE(?, description), \
             enabled = COALESCE(?, enabled), \
             updated_at = ? \
             WHERE domain = ?",
        )
        .bind(&update.name)
        .bind(&update.description)
        .bind(update.enabled)
        .bind(Utc::now())
        .bind(domain)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        self.lookup("domain", domain).await
    }

    async fn delete(&self, domain: &str) -> TunnelResult<bool> {
        let result = sqlx::query("DELETE FROM tunnels WHERE domain = ?")
            .bind(domain)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_token(&self, domain: &str, token: String) -> TunnelResult<Option<String>> {
        let result = sqlx::query("UPDATE tunnels SET token = ?, updated_at = ? WHERE domain = ?")
            .bind(&token)
            .bind(Utc::now())
            .bind(domain)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok((result.rows_affected() > 0).then_some(token))
    }

    async fn mark_connected(&self, token: &str) -> TunnelResult<()> {
        sqlx::query("UPDATE tunnels SET last_connected_at = ? WHERE token = ?")
            .bind(Utc::now())
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn increment(&self, domain: &str) -> TunnelResult<()> {
        sqlx::query("UPDATE tunnels SET total_requests = total_requests + 1 WHERE domain = ?")
            .bind(domain)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn record(&self, log: RequestLog) -> TunnelResult<()> {
        sqlx::query(
            "INSERT INTO request_logs (timestamp, domain, method, path, status_code, error, \
             duration_ms, request_body, response_body) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(log.timestamp)
        .bind(&log.domain)
        .bind(&log.method)
        .bind(&log.path)
        .bind(log.status_code.map(|s| s as i64))
        .bind(&log.error)
        .bind(log.duration_ms as i64)
        .bind(&log.request_body)
        .bind(&log.response_body)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn recent(
        &self,
        domain: &str,
        limit: u32,
        offset: u32,
    ) -> TunnelResult<(u64, Vec<RequestLog>)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM request_logs WHERE domain = ?")
            .bind(domain)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT timestamp, domain, method, path, status_code, error, duration_ms, \
             request_body, response_body FROM request_logs \
             WHERE domain = ? ORDER BY timestamp DESC LIMIT ? OFFSET ?",
        )
        .bind(domain)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok((
            total.max(0) as u64,
            rows.into_iter().map(RequestLog::from).collect(),
        ))
    }
}
