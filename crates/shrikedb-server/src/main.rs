use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use shrikedb_core::{
    Catalog, FieldInfo, FieldSpec, FilterExpr, GroupByExpr, OrderByExpr, Query, QueryStats,
    SelectExpr, TableStats, Value,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;
const DEFAULT_IO_TIMEOUT_MILLIS: u64 = 30_000;
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:7171";

#[derive(Debug, Error)]
enum ServerError {
    #[error("io: {0}")]
    Io(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("encode: {0}")]
    Encode(String),
}

#[derive(Debug, Clone)]
struct ServerConfig {
    bind_addr: String,
    max_frame_len: usize,
    max_connections: usize,
    worker_threads: usize,
    io_timeout: Duration,
    log_requests: bool,
}

fn default_limit() -> i64 {
    -1
}

/// One framed command. The `command` tag selects the variant; the rest of
/// the object carries that command's arguments.
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Request {
    Ping,
    ShowTables,
    CreateTable {
        name: String,
        #[serde(default)]
        fields: Vec<FieldSpec>,
    },
    DescribeTable {
        name: String,
    },
    DropTable {
        name: String,
    },
    InsertIntoTable {
        name: String,
        #[serde(default)]
        rows: Vec<JsonMap<String, JsonValue>>,
    },
    QueryTable(QueryCommand),
    StatsTable {
        name: String,
    },
}

#[derive(Debug, Deserialize)]
struct QueryCommand {
    name: String,
    #[serde(default)]
    select: Vec<SelectExpr>,
    #[serde(default)]
    filters: Vec<FilterExpr>,
    #[serde(default)]
    group_by: Vec<GroupByExpr>,
    #[serde(default)]
    order_by: Vec<OrderByExpr>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    debug: bool,
    #[serde(default)]
    query_stats_detailed: bool,
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::ShowTables => "show_tables",
            Request::CreateTable { .. } => "create_table",
            Request::DescribeTable { .. } => "describe_table",
            Request::DropTable { .. } => "drop_table",
            Request::InsertIntoTable { .. } => "insert_into_table",
            Request::QueryTable(_) => "query_table",
            Request::StatsTable { .. } => "stats_table",
        }
    }
}

#[derive(Debug, Serialize)]
struct Response {
    stat: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tables: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    created: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dropped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inserted: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<Vec<FieldInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows: Option<Vec<Vec<Value>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    elapsed_us: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    elapsed_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_stats_detailed: Option<QueryStats>,
    // stats_table's table/size/fields/total_mem_bytes land flat in the
    // envelope; a None adds nothing.
    #[serde(flatten)]
    stats: Option<TableStats>,
}

impl Default for Response {
    fn default() -> Self {
        Response {
            stat: "ok",
            error_message: None,
            message: None,
            tables: None,
            created: None,
            dropped: None,
            inserted: None,
            fields: None,
            columns: None,
            rows: None,
            elapsed_us: None,
            elapsed_ms: None,
            query_stats_detailed: None,
            stats: None,
        }
    }
}

impl Response {
    fn ok() -> Self {
        Response::default()
    }

    fn ok_message(msg: &str) -> Self {
        Response {
            message: Some(msg.to_string()),
            ..Default::default()
        }
    }

    fn error(msg: &str) -> Self {
        Response {
            stat: "error",
            error_message: Some(msg.to_string()),
            ..Default::default()
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging
    let log_format = std::env::var("SHRIKEDB_LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into()),
            )
            .init();
    }

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        eprintln!("Usage: shrikedb-server [bind_addr] [--max-conns <n>] [--workers <n>] [--io-timeout-ms <ms>] [--max-frame-bytes <bytes>] [--log-requests]");
        std::process::exit(1);
    }

    let cfg = parse_config(args)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async move { run(cfg).await })
}

fn parse_config(args: Vec<String>) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut bind_addr = DEFAULT_BIND_ADDR.to_string();
    let mut next = 0;
    if let Some(first) = args.first() {
        if !first.starts_with("--") {
            bind_addr = first.clone();
            next = 1;
        }
    }
    let mut max_frame_len: usize = DEFAULT_MAX_FRAME_LEN;
    let mut max_connections: usize = 256;
    let mut worker_threads: usize = 4;
    let mut io_timeout_ms: u64 = DEFAULT_IO_TIMEOUT_MILLIS;
    let mut log_requests = false;

    let mut i = next;
    while i < args.len() {
        match args[i].as_str() {
            "--max-conns" => {
                if let Some(val) = args.get(i + 1) {
                    if let Ok(v) = val.parse::<usize>() {
                        max_connections = v.max(1);
                    }
                    i += 1;
                }
            }
            "--workers" => {
                if let Some(val) = args.get(i + 1) {
                    if let Ok(v) = val.parse::<usize>() {
                        worker_threads = v.max(1);
                    }
                    i += 1;
                }
            }
            "--io-timeout-ms" => {
                if let Some(val) = args.get(i + 1) {
                    if let Ok(v) = val.parse::<u64>() {
                        io_timeout_ms = v.max(1);
                    }
                    i += 1;
                }
            }
            "--max-frame-bytes" => {
                if let Some(val) = args.get(i + 1) {
                    if let Ok(v) = val.parse::<usize>() {
                        max_frame_len = v.max(1024);
                    }
                    i += 1;
                }
            }
            "--log-requests" => {
                log_requests = true;
            }
            _ => {}
        }
        i += 1;
    }

    Ok(ServerConfig {
        bind_addr,
        max_frame_len,
        max_connections,
        worker_threads,
        io_timeout: Duration::from_millis(io_timeout_ms),
        log_requests,
    })
}

async fn run(cfg: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = Arc::new(RwLock::new(Catalog::new()));

    let listener = TcpListener::bind(&cfg.bind_addr)
        .await
        .map_err(|e| format!("bind {} failed: {e}", cfg.bind_addr))?;
    info!(
        bind_addr = %cfg.bind_addr,
        max_connections = cfg.max_connections,
        workers = cfg.worker_threads,
        max_frame_bytes = cfg.max_frame_len,
        "shrikedb-server started"
    );
    println!(
        "shrikedb-server listening on {} (max_conns={}, workers={}, max_frame_bytes={})",
        cfg.bind_addr, cfg.max_connections, cfg.worker_threads, cfg.max_frame_len
    );

    let limiter = Arc::new(Semaphore::new(cfg.max_connections));
    let cfg = Arc::new(cfg);

    // Track active connections for graceful shutdown
    let active_connections = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    // Set up shutdown signal handler
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {
                            info!("received SIGINT, initiating graceful shutdown");
                        }
                        _ = sigterm.recv() => {
                            info!("received SIGTERM, initiating graceful shutdown");
                        }
                    }
                }
                Err(e) => {
                    warn!("failed to register SIGTERM handler: {e}, falling back to SIGINT only");
                    let _ = ctrl_c.await;
                    info!("received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received shutdown signal, initiating graceful shutdown");
        }

        shutdown_clone.notify_waiters();
    });

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, addr) = match accept_result {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "accept error");
                        continue;
                    }
                };
                let permit = match limiter.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        warn!(addr = %addr, "connection rejected: max connections reached");
                        continue;
                    }
                };
                let catalog = catalog.clone();
                let cfg = cfg.clone();
                let active = active_connections.clone();
                active.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

                tokio::spawn(async move {
                    if let Err(e) = handle_conn(stream, catalog, cfg).await {
                        debug!(addr = %addr, error = %e, "connection error");
                    }
                    active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    drop(permit);
                });
            }
            _ = shutdown.notified() => {
                info!("stopping accept loop");
                break;
            }
        }
    }

    // Wait for active connections to complete (with timeout)
    let active_count = active_connections.load(std::sync::atomic::Ordering::SeqCst);
    if active_count > 0 {
        info!(
            active_connections = active_count,
            "waiting for active connections to complete"
        );
        let shutdown_timeout = Duration::from_secs(30);
        let start = Instant::now();
        while active_connections.load(std::sync::atomic::Ordering::SeqCst) > 0 {
            if start.elapsed() > shutdown_timeout {
                warn!("shutdown timeout exceeded, forcing exit");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    info!("graceful shutdown complete");
    Ok(())
}

async fn handle_conn(
    mut stream: TcpStream,
    catalog: Arc<RwLock<Catalog>>,
    cfg: Arc<ServerConfig>,
) -> Result<(), ServerError> {
    loop {
        let req_bytes = match read_frame(&mut stream, cfg.io_timeout, cfg.max_frame_len).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(()),
            Err(e) => {
                let _ = write_response(
                    &mut stream,
                    &Response::error(&e.to_string()),
                    cfg.io_timeout,
                    cfg.max_frame_len,
                )
                .await;
                return Err(e);
            }
        };

        let req: Request = match serde_json::from_slice(&req_bytes) {
            Ok(v) => v,
            Err(e) => {
                let err = ServerError::BadRequest(format!("invalid json: {e}"));
                let _ = write_response(
                    &mut stream,
                    &Response::error(&err.to_string()),
                    cfg.io_timeout,
                    cfg.max_frame_len,
                )
                .await;
                return Err(err);
            }
        };

        if cfg.log_requests {
            eprintln!("request command={}", req.name());
        }

        // Catalog access is synchronous and CPU bound; keep it off the
        // reactor threads.
        let catalog = catalog.clone();
        let resp = match tokio::task::spawn_blocking(move || dispatch(&catalog, req)).await {
            Ok(resp) => resp,
            Err(e) => Response::error(&format!("worker failed: {e}")),
        };

        write_response(&mut stream, &resp, cfg.io_timeout, cfg.max_frame_len).await?;
    }
}

/// Maps one decoded request onto the catalog. Every core error is folded
/// into the uniform error envelope here; nothing below this function
/// reaches the socket.
fn dispatch(catalog: &RwLock<Catalog>, req: Request) -> Response {
    match req {
        Request::Ping => Response::ok_message("pong"),
        Request::ShowTables => {
            let mut resp = Response::ok();
            resp.tables = Some(catalog.read().table_names());
            resp
        }
        Request::CreateTable { name, fields } => {
            match catalog.write().create_table(&name, fields) {
                Ok(()) => {
                    let mut resp = Response::ok();
                    resp.created = Some(true);
                    resp
                }
                Err(e) => Response::error(&e.to_string()),
            }
        }
        Request::DescribeTable { name } => {
            let guard = catalog.read();
            match guard.table(&name) {
                Ok(table) => {
                    let mut resp = Response::ok();
                    resp.fields = Some(table.describe());
                    resp
                }
                Err(e) => Response::error(&e.to_string()),
            }
        }
        Request::DropTable { name } => match catalog.write().drop_table(&name) {
            Ok(()) => {
                let mut resp = Response::ok();
                resp.dropped = Some(true);
                resp
            }
            Err(e) => Response::error(&e.to_string()),
        },
        Request::InsertIntoTable { name, rows } => {
            let mut guard = catalog.write();
            let table = match guard.table_mut(&name) {
                Ok(t) => t,
                Err(e) => return Response::error(&e.to_string()),
            };
            match table.insert_rows(&rows) {
                Ok(()) => {
                    let mut resp = Response::ok();
                    resp.inserted = Some(rows.len() as u64);
                    resp
                }
                Err(e) => Response::error(&e.to_string()),
            }
        }
        Request::QueryTable(cmd) => run_query(catalog, cmd),
        Request::StatsTable { name } => {
            let guard = catalog.read();
            match guard.table(&name) {
                Ok(table) => {
                    let mut resp = Response::ok();
                    resp.stats = Some(table.stats());
                    resp
                }
                Err(e) => Response::error(&e.to_string()),
            }
        }
    }
}

fn run_query(catalog: &RwLock<Catalog>, cmd: QueryCommand) -> Response {
    let started = Instant::now();
    // The read guard is held for the whole run; inserts into this table
    // wait rather than racing the query's bitmap snapshots.
    let guard = catalog.read();
    let table = match guard.table(&cmd.name) {
        Ok(t) => t,
        Err(e) => return Response::error(&e.to_string()),
    };

    let columns: Vec<String> = cmd.select.iter().map(SelectExpr::output_name).collect();
    let query = Query::new(table)
        .selects(cmd.select)
        .filters(cmd.filters)
        .group_bys(cmd.group_by)
        .order_bys(cmd.order_by)
        .with_limit(cmd.limit)
        .with_debug(cmd.debug);

    match query.run() {
        Ok(output) => {
            let elapsed_us = started.elapsed().as_micros() as u64;
            let mut resp = Response::ok();
            resp.columns = Some(columns);
            resp.rows = Some(output.rows);
            resp.elapsed_us = Some(elapsed_us);
            resp.elapsed_ms = Some(elapsed_us / 1000);
            if cmd.query_stats_detailed {
                resp.query_stats_detailed = Some(output.stats);
            }
            resp
        }
        Err(e) => Response::error(&e.to_string()),
    }
}

async fn read_frame(
    stream: &mut (impl AsyncRead + Unpin),
    timeout_dur: Duration,
    max_frame_len: usize,
) -> Result<Option<Vec<u8>>, ServerError> {
    let mut len_buf = [0u8; 4];
    match timeout(timeout_dur, stream.read_exact(&mut len_buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Ok(Err(e)) => return Err(ServerError::Io(format!("read length failed: {e}"))),
        Err(_) => return Err(ServerError::Timeout("read length timeout".into())),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > max_frame_len {
        return Err(ServerError::BadRequest("invalid frame length".into()));
    }
    let mut buf = vec![0u8; len];
    match timeout(timeout_dur, stream.read_exact(&mut buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Ok(Err(e)) => return Err(ServerError::Io(format!("read payload failed: {e}"))),
        Err(_) => return Err(ServerError::Timeout("read payload timeout".into())),
    }
    Ok(Some(buf))
}

async fn write_response(
    stream: &mut (impl AsyncWrite + Unpin),
    resp: &Response,
    timeout_dur: Duration,
    max_frame_len: usize,
) -> Result<(), ServerError> {
    let bytes = serde_json::to_vec(&resp).map_err(|e| ServerError::Encode(format!("json: {e}")))?;
    if bytes.len() > max_frame_len {
        return Err(ServerError::Encode("response too large".into()));
    }
    timeout(timeout_dur, async {
        stream
            .write_all(&(bytes.len() as u32).to_be_bytes())
            .await?;
        stream.write_all(&bytes).await
    })
    .await
    .map_err(|_| ServerError::Timeout("write timeout".into()))?
    .map_err(|e| ServerError::Io(format!("write failed: {e}")))
}
