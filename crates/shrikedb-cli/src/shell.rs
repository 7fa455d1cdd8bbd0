//! Interactive shell for shrikedb-server.
//!
//! Speaks the server's length-prefixed JSON protocol, one connection per
//! request. Input lines are either backslash commands (`\tables`,
//! `\d <table>`, ...) or raw request objects typed as JSON, which may span
//! multiple lines and are sent once their braces balance.

use anyhow::{anyhow, Result};
use comfy_table::{Cell, Table};
use rustyline::error::ReadlineError;
use rustyline::{Config, DefaultEditor, EditMode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_HOST: &str = "127.0.0.1:7171";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IO_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RESPONSE_LEN: usize = 100 * 1024 * 1024;

const MAX_RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;

/// Response envelope, reduced to the fields the shell renders.
#[derive(Debug, Deserialize)]
struct Response {
    stat: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    tables: Option<Vec<String>>,
    #[serde(default)]
    created: Option<bool>,
    #[serde(default)]
    dropped: Option<bool>,
    #[serde(default)]
    inserted: Option<u64>,
    #[serde(default)]
    fields: Option<Vec<FieldLine>>,
    #[serde(default)]
    columns: Option<Vec<String>>,
    #[serde(default)]
    rows: Option<Vec<Vec<Value>>>,
    #[serde(default)]
    elapsed_us: Option<u64>,
    #[serde(default)]
    query_stats_detailed: Option<StageTimings>,
    // stats_table answers arrive flat: table/size/total_mem_bytes next to
    // a fields list that carries per-column mem_bytes.
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    size: Option<u32>,
    #[serde(default)]
    total_mem_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FieldLine {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    encoding: String,
    #[serde(default)]
    mem_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StageTimings {
    filter_us: u64,
    group_us: u64,
    order_us: u64,
}

struct ShellState {
    host: String,
}

impl ShellState {
    fn prompt(&self) -> String {
        "shrikedb> ".to_string()
    }
}

fn resolve_host(host: Option<&str>) -> String {
    host.unwrap_or(DEFAULT_HOST).to_string()
}

/// Run the interactive shell, or execute one line when `command` is given.
pub fn run_shell(host: Option<&str>, command: Option<&str>) -> Result<()> {
    let state = ShellState {
        host: resolve_host(host),
    };

    // Non-interactive mode: execute the line and exit
    if let Some(line) = command {
        return match process_input(&state, line.trim()) {
            Ok(_) => Ok(()),
            Err(e) => Err(anyhow!("Command failed: {}", e)),
        };
    }

    // Probe the connection before dropping into the prompt
    print!("Connecting to {}... ", state.host);
    std::io::stdout().flush().ok();
    match send_request(&state, &json!({"command": "ping"})) {
        Ok(_) => println!("OK"),
        Err(e) => {
            println!("FAILED");
            return Err(anyhow!("Failed to connect: {}", e));
        }
    }

    println!("shrikedb shell v{}", VERSION);
    println!("Type '\\h' for help, '\\q' to quit.\n");

    // Emacs mode has Ctrl+R history search built-in
    let config = Config::builder()
        .max_history_size(10_000)?
        .history_ignore_dups(true)?
        .history_ignore_space(true)
        .edit_mode(EditMode::Emacs)
        .auto_add_history(false)
        .build();

    let mut rl = DefaultEditor::with_config(config)?;
    let history_path = dirs_next::home_dir()
        .map(|h| h.join(".shrikedb_history"))
        .unwrap_or_else(|| ".shrikedb_history".into());
    let _ = rl.load_history(&history_path);

    // Multi-line input buffer for JSON requests
    let mut input_buffer = String::new();

    loop {
        let prompt = if input_buffer.is_empty() {
            state.prompt()
        } else {
            "   -> ".to_string()
        };

        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();

                if line.is_empty() && input_buffer.is_empty() {
                    continue;
                }

                // Backslash commands and bare words run immediately
                if input_buffer.is_empty() && !line.starts_with('{') {
                    let _ = rl.add_history_entry(line);
                    match process_input(&state, line) {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(e) => eprintln!("Error: {}", e),
                    }
                    continue;
                }

                // Accumulate a JSON request until its braces balance
                if !input_buffer.is_empty() {
                    input_buffer.push(' ');
                }
                input_buffer.push_str(line);

                if is_request_complete(&input_buffer) {
                    let full_input = std::mem::take(&mut input_buffer);
                    let _ = rl.add_history_entry(full_input.as_str());
                    match process_input(&state, full_input.trim()) {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(e) => eprintln!("Error: {}", e),
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                if !input_buffer.is_empty() {
                    input_buffer.clear();
                    println!("^C (input cancelled)");
                } else {
                    println!("^C");
                }
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Bye!");
                break;
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    Ok(())
}

/// Send one raw JSON request and pretty-print the response as it came.
pub fn send_once(host: Option<&str>, input: &str) -> Result<()> {
    let state = ShellState {
        host: resolve_host(host),
    };
    let request: Value = serde_json::from_str(input)?;
    if !request.is_object() {
        return Err(anyhow!("a request must be a JSON object"));
    }

    let body = send_raw(&state, &request)?;
    let resp: Value = serde_json::from_slice(&body)?;
    println!("{}", serde_json::to_string_pretty(&resp)?);

    if resp.get("stat").and_then(Value::as_str) == Some("error") {
        let msg = resp
            .get("error_message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(anyhow!("request failed: {}", msg));
    }
    Ok(())
}

pub fn ping(host: Option<&str>) -> Result<()> {
    let state = ShellState {
        host: resolve_host(host),
    };
    let start = Instant::now();
    let resp = send_request(&state, &json!({"command": "ping"}))?;
    if resp.stat != "ok" {
        return Err(anyhow!(
            "ping failed: {}",
            resp.error_message.as_deref().unwrap_or("unknown error")
        ));
    }
    println!(
        "{} ({:.1}ms)",
        resp.message.as_deref().unwrap_or("pong"),
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(())
}

/// Execute one shell line. Returns Ok(true) when quit was requested.
fn process_input(state: &ShellState, input: &str) -> Result<bool> {
    let parts: Vec<&str> = input.split_whitespace().collect();

    match parts.first().map(|s| s.to_lowercase()).as_deref() {
        Some("\\q") | Some("quit") | Some("exit") => return Ok(true),
        Some("\\h") | Some("\\?") | Some("help") => {
            print_help();
            return Ok(false);
        }
        Some("\\tables") | Some("\\dt") => {
            return run_request(state, json!({"command": "show_tables"}));
        }
        Some("\\d") | Some("\\describe") => {
            let table = parts.get(1).ok_or_else(|| anyhow!("usage: \\d <table>"))?;
            return run_request(state, json!({"command": "describe_table", "name": table}));
        }
        Some("\\stats") => {
            let table = parts
                .get(1)
                .ok_or_else(|| anyhow!("usage: \\stats <table>"))?;
            return run_request(state, json!({"command": "stats_table", "name": table}));
        }
        Some("\\drop") => {
            let table = parts
                .get(1)
                .ok_or_else(|| anyhow!("usage: \\drop <table>"))?;
            return run_request(state, json!({"command": "drop_table", "name": table}));
        }
        Some("\\ping") => {
            return run_request(state, json!({"command": "ping"}));
        }
        Some(word) if word.starts_with('\\') => {
            return Err(anyhow!("unknown command {} (try \\h)", word));
        }
        _ => {}
    }

    // Anything else must be a raw request object
    let request: Value = serde_json::from_str(input)
        .map_err(|e| anyhow!("not a \\ command and not valid JSON: {}", e))?;
    if !request.is_object() {
        return Err(anyhow!("a request must be a JSON object"));
    }
    run_request(state, request)
}

fn run_request(state: &ShellState, request: Value) -> Result<bool> {
    let start = Instant::now();
    let resp = send_request(state, &request)?;
    render_response(&resp, start.elapsed());
    Ok(false)
}

/// Check whether an accumulated JSON request is complete: bracket depth
/// back to zero outside of string literals.
fn is_request_complete(input: &str) -> bool {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return false;
    }

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;
    let mut seen_bracket = false;

    for c in trimmed.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => {
                depth += 1;
                seen_bracket = true;
            }
            '}' | ']' if !in_string => depth -= 1,
            _ => {}
        }
    }

    seen_bracket && depth <= 0 && !in_string
}

/// Send with retry on transient connection failures.
fn send_request(state: &ShellState, request: &Value) -> Result<Response> {
    let mut last_error = None;

    for attempt in 1..=MAX_RETRY_ATTEMPTS {
        match send_request_once(state, request) {
            Ok(resp) => return Ok(resp),
            Err(e) => {
                let err_str = e.to_string();
                let is_connection_error = err_str.contains("Connection refused")
                    || err_str.contains("Connection reset")
                    || err_str.contains("timed out");

                if is_connection_error && attempt < MAX_RETRY_ATTEMPTS {
                    eprintln!(
                        "Connection error (attempt {}/{}): {}. Retrying in {}ms...",
                        attempt, MAX_RETRY_ATTEMPTS, e, RETRY_DELAY_MS
                    );
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
                    last_error = Some(e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| anyhow!("Connection failed after {} attempts", MAX_RETRY_ATTEMPTS)))
}

fn send_request_once(state: &ShellState, request: &Value) -> Result<Response> {
    let body = send_raw(state, request)?;
    serde_json::from_slice(&body).map_err(|e| {
        anyhow!(
            "Invalid response: {} - body: {}",
            e,
            String::from_utf8_lossy(&body)
        )
    })
}

fn send_raw(state: &ShellState, request: &Value) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(request)?;

    let addr = state
        .host
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow!("Could not resolve {}", state.host))?;
    let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
        .map_err(|e| anyhow!("Connection to {} failed: {}", state.host, e))?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;

    let len = payload.len() as u32;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&payload)?;
    stream.flush()?;

    read_frame_bytes(&mut stream)
}

fn read_frame_bytes(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_RESPONSE_LEN {
        return Err(anyhow!("Response too large: {} bytes", len));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(body)
}

fn render_response(resp: &Response, elapsed: Duration) {
    if resp.stat != "ok" {
        let detail = resp.error_message.as_deref().unwrap_or("unknown error");
        eprintln!("ERROR: {}", detail);
        return;
    }

    if let Some(message) = &resp.message {
        println!("{}", message);
    }

    if let Some(tables) = &resp.tables {
        if tables.is_empty() {
            println!("no tables");
        } else {
            let mut table = Table::new();
            table.set_header(vec!["table"]);
            for name in tables {
                table.add_row(vec![Cell::new(name)]);
            }
            println!("{}", table);
        }
    }

    if let Some(fields) = &resp.fields {
        // Memory columns only appear in stats answers.
        let with_mem = resp.total_mem_bytes.is_some();
        let mut table = Table::new();
        if with_mem {
            table.set_header(vec!["field", "type", "encoding", "mem_bytes"]);
        } else {
            table.set_header(vec!["field", "type", "encoding"]);
        }
        for field in fields {
            let mut cells = vec![
                Cell::new(&field.name),
                Cell::new(&field.field_type),
                Cell::new(&field.encoding),
            ];
            if with_mem {
                cells.push(Cell::new(field.mem_bytes.unwrap_or(0)));
            }
            table.add_row(cells);
        }
        println!("{}", table);
        if let (Some(name), Some(size), Some(total)) =
            (&resp.table, resp.size, resp.total_mem_bytes)
        {
            println!("{}: {} row(s), {} bytes resident", name, size, total);
        }
    }

    if let (Some(columns), Some(rows)) = (&resp.columns, &resp.rows) {
        let mut table = Table::new();
        table.set_header(columns.clone());
        for row in rows {
            table.add_row(row.iter().map(format_cell).map(Cell::new).collect::<Vec<_>>());
        }
        println!("{}", table);
        println!("{} row(s)", rows.len());
    }

    if let Some(inserted) = resp.inserted {
        println!("{} row(s) inserted", inserted);
    }
    if resp.created == Some(true) {
        println!("table created");
    }
    if resp.dropped == Some(true) {
        println!("table dropped");
    }

    if let Some(timings) = &resp.query_stats_detailed {
        println!(
            "stages: filter {}us, group {}us, order {}us",
            timings.filter_us, timings.group_us, timings.order_us
        );
    }

    match resp.elapsed_us {
        Some(server_us) => println!(
            "Time: {:.3}s (server: {}us)",
            elapsed.as_secs_f64(),
            server_us
        ),
        None => println!("Time: {:.3}s", elapsed.as_secs_f64()),
    }
}

fn format_cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_help() {
    let help = r#"
shrikedb shell commands:

  Shell Commands:
    \tables, \dt        List tables
    \d <table>          Describe a table (fields, types, encodings)
    \stats <table>      Show per-column memory usage for a table
    \drop <table>       Drop a table
    \ping               Check that the server answers
    \q                  Quit (also: quit, exit)
    \h, \?              Show this help (also: help)

  Requests:
    Any line starting with '{' is sent to the server as-is. Requests are
    JSON objects tagged by "command" and may span multiple lines; they go
    out once the braces balance. Examples:

    {"command": "create_table", "name": "access_log", "fields": [
        {"name": "timestamp", "type": "timestamp"},
        {"name": "endpoint", "type": "string", "encoding": "dict"},
        {"name": "responseTime", "type": "int"}]}

    {"command": "insert_into_table", "name": "access_log", "rows": [
        {"timestamp": 1, "endpoint": "/home", "responseTime": 20}]}

    {"command": "query_table", "name": "access_log",
     "select": [{"field": "endpoint"},
                {"field": "*", "aggr_func": "count", "display": "hits"}],
     "group_by": [{"field": "endpoint"}],
     "order_by": [{"field": "hits"}], "limit": 10}

  Keyboard Shortcuts:
    Ctrl+R              Reverse history search
    Up/Down             Navigate history
    Ctrl+C              Cancel current line / multi-line input
    Ctrl+D              Exit shell
"#;
    println!("{}", help);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_request_complete() {
        // Complete requests
        assert!(is_request_complete(r#"{"command": "ping"}"#));
        assert!(is_request_complete(r#"  {"command": "show_tables"}  "#));
        assert!(is_request_complete(
            r#"{"command": "query_table", "name": "t", "select": [{"field": "a"}]}"#
        ));

        // Still open
        assert!(!is_request_complete(r#"{"command": "query_table","#));
        assert!(!is_request_complete(r#"{"select": [{"field": "a"}"#));

        // Brackets inside string literals do not count
        assert!(!is_request_complete(r#"{"value": "}"#));
        assert!(is_request_complete(r#"{"value": "}"}"#));
        assert!(is_request_complete(r#"{"value": "a\"}b"}"#));

        // Empty input
        assert!(!is_request_complete(""));
        assert!(!is_request_complete("   "));
    }

    #[test]
    fn test_format_cell() {
        assert_eq!(format_cell(&Value::Null), "NULL");
        assert_eq!(format_cell(&json!("hello")), "hello");
        assert_eq!(format_cell(&json!(42)), "42");
        assert_eq!(format_cell(&json!(true)), "true");
    }

    #[test]
    fn test_response_decode() {
        let resp: Response = serde_json::from_value(json!({
            "stat": "ok",
            "columns": ["endpoint", "hits"],
            "rows": [["/home", 5], ["/api", 2]],
            "elapsed_us": 120,
            "elapsed_ms": 0,
            "query_stats_detailed": {
                "filter_us": 10, "filter_ms": 0,
                "group_us": 90, "group_ms": 0,
                "order_us": 20, "order_ms": 0
            }
        }))
        .unwrap();
        assert_eq!(resp.stat, "ok");
        assert_eq!(resp.columns.as_deref(), Some(&["endpoint".to_string(), "hits".to_string()][..]));
        assert_eq!(resp.rows.as_ref().map(|r| r.len()), Some(2));
        assert_eq!(resp.query_stats_detailed.as_ref().map(|t| t.group_us), Some(90));

        let minimal: Response = serde_json::from_value(json!({"stat": "ok"})).unwrap();
        assert!(minimal.rows.is_none());
        assert!(minimal.error_message.is_none());

        // stats answers carry table/size/total_mem_bytes flat alongside fields
        let stats: Response = serde_json::from_value(json!({
            "stat": "ok",
            "table": "access_log",
            "size": 3,
            "fields": [
                { "name": "endpoint", "type": "string", "encoding": "dict", "mem_bytes": 55 },
                { "name": "timestamp", "type": "timestamp", "encoding": "none", "mem_bytes": 24 }
            ],
            "total_mem_bytes": 79
        }))
        .unwrap();
        assert_eq!(stats.table.as_deref(), Some("access_log"));
        assert_eq!(stats.size, Some(3));
        assert_eq!(stats.total_mem_bytes, Some(79));
        assert_eq!(stats.fields.as_ref().unwrap()[0].mem_bytes, Some(55));

        // describe answers have no memory columns
        let desc: Response = serde_json::from_value(json!({
            "stat": "ok",
            "fields": [ { "name": "endpoint", "type": "string", "encoding": "dict" } ]
        }))
        .unwrap();
        assert!(desc.total_mem_bytes.is_none());
        assert!(desc.fields.unwrap()[0].mem_bytes.is_none());

        let err: Response =
            serde_json::from_value(json!({"stat": "error", "error_message": "table 'x' not found"}))
                .unwrap();
        assert_eq!(err.stat, "error");
        assert_eq!(err.error_message.as_deref(), Some("table 'x' not found"));
    }

    #[test]
    fn test_resolve_host() {
        assert_eq!(resolve_host(None), DEFAULT_HOST);
        assert_eq!(resolve_host(Some("db.example.com:9000")), "db.example.com:9000");
    }
}
