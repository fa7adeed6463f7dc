//! Database connection, TLS support, and pipelined statement execution.

use std::time::Duration;

use futures::future::join_all;
use tokio_postgres::config::Host;
use tokio_postgres::Client;

use crate::config::{DatabaseConfig, SslMode};
use crate::error::{format_db_error, Result, StratumError};

/// Quote a SQL identifier.
///
/// Doubles any embedded double-quotes and wraps in double-quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a SQL string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Validate that a SQL identifier contains only `[a-zA-Z0-9_]`.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StratumError::ConfigError(
            "Identifier cannot be empty".to_string(),
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StratumError::ConfigError(format!(
            "Identifier '{}' contains invalid characters. Only [a-zA-Z0-9_] are allowed.",
            name
        )));
    }
    Ok(())
}

/// Translate a `*` glob into a `LIKE` pattern, escaping LIKE metacharacters.
pub fn like_pattern(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 4);
    for c in glob.chars() {
        match c {
            '*' => out.push('%'),
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Connection tuning shared by every connect call.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub ssl_mode: SslMode,
    pub retries: u32,
    pub connect_timeout_secs: u32,
    pub statement_timeout_secs: u32,
    pub keepalive_secs: u32,
}

impl ConnectOptions {
    /// Plaintext, no retries; for databases on this machine.
    pub fn local() -> Self {
        Self {
            ssl_mode: SslMode::Disable,
            retries: 0,
            connect_timeout_secs: 10,
            statement_timeout_secs: 0,
            keepalive_secs: 0,
        }
    }
}

impl From<&DatabaseConfig> for ConnectOptions {
    fn from(db: &DatabaseConfig) -> Self {
        Self {
            ssl_mode: db.ssl_mode,
            retries: db.connect_retries,
            connect_timeout_secs: db.connect_timeout_secs,
            statement_timeout_secs: db.statement_timeout_secs,
            keepalive_secs: db.keepalive_secs,
        }
    }
}

/// Build a rustls ClientConfig using the Mozilla CA bundle and ring crypto provider.
fn make_rustls_config() -> Result<rustls::ClientConfig> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(std::sync::Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| StratumError::ConfigError(format!("TLS setup failed: {}", e)))?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    Ok(config)
}

/// Authentication failures are not retried.
fn is_permanent_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_err) = e.as_db_error() {
        let code = db_err.code().code();
        // 28P01 = invalid_password, 28000 = invalid_authorization_specification
        return code == "28P01" || code == "28000";
    }
    false
}

/// Host and port a parsed config points at, for error messages.
fn describe_target(config: &tokio_postgres::Config) -> (String, u16) {
    let host = match config.get_hosts().first() {
        Some(Host::Tcp(h)) => h.clone(),
        #[cfg(unix)]
        Some(Host::Unix(path)) => path.display().to_string(),
        None => "localhost".to_string(),
    };
    let port = config.get_ports().first().copied().unwrap_or(5432);
    (host, port)
}

/// Parse a connection string (URL or key=value) and apply keepalive/timeout tuning.
pub fn parse_connection_string(
    conn_string: &str,
    options: &ConnectOptions,
) -> Result<tokio_postgres::Config> {
    let mut config: tokio_postgres::Config = conn_string
        .parse()
        .map_err(|e| StratumError::ConfigError(format!("Invalid connection string: {}", e)))?;
    if options.keepalive_secs > 0 {
        config
            .keepalives(true)
            .keepalives_idle(Duration::from_secs(options.keepalive_secs as u64));
    }
    if options.connect_timeout_secs > 0 {
        config.connect_timeout(Duration::from_secs(options.connect_timeout_secs as u64));
    }
    Ok(config)
}

/// TLS mode the connection string itself asks for, if it names one.
fn explicit_ssl_mode(conn_string: &str, config: &tokio_postgres::Config) -> Option<SslMode> {
    let is_url = conn_string.starts_with("postgres://") || conn_string.starts_with("postgresql://");
    let names_mode = if is_url {
        conn_string
            .split_once('?')
            .is_some_and(|(_, query)| query.split('&').any(|p| p.starts_with("sslmode=")))
    } else {
        conn_string
            .split_whitespace()
            .any(|p| p.starts_with("sslmode"))
    };
    if !names_mode {
        return None;
    }
    Some(match config.get_ssl_mode() {
        tokio_postgres::config::SslMode::Disable => SslMode::Disable,
        tokio_postgres::config::SslMode::Prefer => SslMode::Prefer,
        _ => SslMode::Require,
    })
}

/// Spawn the background connection driver task.
fn spawn_connection_task<F>(connection: F)
where
    F: std::future::Future<Output = std::result::Result<(), tokio_postgres::Error>>
        + Send
        + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            log::debug!("Database connection closed with error: {}", e);
        }
    });
}

async fn connect_once(
    config: &tokio_postgres::Config,
    ssl_mode: SslMode,
) -> std::result::Result<Client, tokio_postgres::Error> {
    match ssl_mode {
        SslMode::Disable => {
            let (client, connection) = config.connect(tokio_postgres::NoTls).await?;
            spawn_connection_task(connection);
            Ok(client)
        }
        SslMode::Require | SslMode::Prefer => {
            let mut config = config.clone();
            config.ssl_mode(if ssl_mode == SslMode::Require {
                tokio_postgres::config::SslMode::Require
            } else {
                tokio_postgres::config::SslMode::Prefer
            });
            // TLS setup only fails on a broken crypto provider; fall back to plaintext.
            let tls_config = match make_rustls_config() {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("{}; connecting without TLS", e);
                    let (client, connection) = config.connect(tokio_postgres::NoTls).await?;
                    spawn_connection_task(connection);
                    return Ok(client);
                }
            };
            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
            let (client, connection) = config.connect(tls).await?;
            spawn_connection_task(connection);
            Ok(client)
        }
    }
}

/// Connect to Postgres, retrying up to `options.retries` times with
/// exponential backoff + jitter.
///
/// Each retry waits `min(2^attempt, 30)s + rand(0..1000ms)`. Authentication
/// failures are not retried. Every failure surfaces as
/// [`StratumError::ConnectFailed`] carrying the target host and port.
pub async fn connect(conn_string: &str, options: &ConnectOptions) -> Result<Client> {
    let config = parse_connection_string(conn_string, options)?;
    let (host, port) = describe_target(&config);
    let ssl_mode = explicit_ssl_mode(conn_string, &config).unwrap_or(options.ssl_mode);
    let mut last_err = None;

    for attempt in 0..=options.retries {
        if attempt > 0 {
            let base_delay = std::cmp::min(1u64 << attempt.min(5), 30);
            let delay = Duration::from_secs(base_delay)
                + Duration::from_millis(fastrand::u64(0..1000));
            log::info!(
                "Connection attempt failed, retrying; attempt={}, max_attempts={}, delay_ms={}",
                attempt + 1,
                options.retries + 1,
                delay.as_millis() as u64
            );
            tokio::time::sleep(delay).await;
        }

        match connect_once(&config, ssl_mode).await {
            Ok(client) => {
                log::debug!("Connected to postgres; host={}, port={}", host, port);
                if options.statement_timeout_secs > 0 {
                    let timeout_sql = format!(
                        "SET statement_timeout = '{}s'",
                        options.statement_timeout_secs
                    );
                    client.batch_execute(&timeout_sql).await?;
                }
                return Ok(client);
            }
            Err(e) => {
                if is_permanent_error(&e) {
                    last_err = Some(e);
                    break;
                }
                last_err = Some(e);
            }
        }
    }

    Err(StratumError::ConnectFailed {
        host,
        port,
        reason: last_err
            .map(|e| format_db_error(&e))
            .unwrap_or_else(|| "unknown error".to_string()),
    })
}

/// A statement in a pipelined batch failed.
#[derive(Debug)]
pub struct StatementError {
    /// 0-based position of the failing statement.
    pub index: usize,
    pub source: tokio_postgres::Error,
}

/// Execute statements as one pipelined batch: every statement is queued on
/// the connection before any response is awaited, so the whole batch costs
/// a single round-trip. Statements run in order using the simple query
/// protocol. Returns the first failing statement.
///
/// Callers wrap this in a transaction; once a statement fails, the server
/// rejects the rest of the batch.
pub async fn execute_batch(
    client: &Client,
    statements: &[String],
) -> std::result::Result<(), StatementError> {
    let results = join_all(statements.iter().map(|s| client.batch_execute(s))).await;
    match results
        .into_iter()
        .enumerate()
        .find_map(|(index, r)| r.err().map(|source| StatementError { index, source }))
    {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Run `ROLLBACK`, logging instead of failing.
pub async fn rollback_quietly(client: &Client) {
    if let Err(e) = client.batch_execute("ROLLBACK").await {
        log::warn!("Failed to rollback transaction: {}", format_db_error(&e));
    }
}

/// Schemas in the connected database not matching any of `excluded`
/// (`*` is a wildcard).
pub async fn list_schemas(client: &Client, excluded: &[String]) -> Result<Vec<String>> {
    let patterns: Vec<String> = excluded.iter().map(|s| like_pattern(s)).collect();
    let rows = client
        .query(
            "SELECT nspname::text FROM pg_namespace \
             WHERE NOT (nspname LIKE ANY($1)) ORDER BY nspname",
            &[&patterns],
        )
        .await?;
    Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
}

/// Get the current database name.
pub async fn get_current_database(client: &Client) -> Result<String> {
    let row = client.query_one("SELECT current_database()", &[]).await?;
    Ok(row.get::<_, String>(0))
}
