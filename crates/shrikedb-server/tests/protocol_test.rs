//! End-to-end tests for the framed TCP protocol.
//!
//! Each test spawns its own server binary on a free port and speaks the
//! length-prefixed JSON protocol over a plain std TcpStream.

use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

/// Helper to find a free port
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Kills the spawned server even when a test panics.
struct ServerGuard(Child);

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn start_server() -> (ServerGuard, String) {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let child = Command::new(env!("CARGO_BIN_EXE_shrikedb-server"))
        .arg(&addr)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to start server binary");
    let guard = ServerGuard(child);

    for _ in 0..50 {
        if TcpStream::connect(&addr).is_ok() {
            return (guard, addr);
        }
        sleep(Duration::from_millis(100));
    }
    panic!("server did not come up on {addr}");
}

fn connect(addr: &str) -> TcpStream {
    TcpStream::connect(addr).expect("connect failed")
}

fn read_frame_bytes(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let resp_len = u32::from_be_bytes(len_buf) as usize;
    let mut response = vec![0u8; resp_len];
    stream.read_exact(&mut response)?;
    Ok(response)
}

/// Helper to send a request and receive a response using the framed protocol
fn send_request(stream: &mut TcpStream, request: &Value) -> std::io::Result<Value> {
    let json_bytes = serde_json::to_vec(request).unwrap();
    let len = json_bytes.len() as u32;

    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&json_bytes)?;
    stream.flush()?;

    let response = read_frame_bytes(stream)?;
    Ok(serde_json::from_slice(&response).unwrap_or(json!({"error": "parse error"})))
}

fn send_raw(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<Value> {
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(payload)?;
    stream.flush()?;
    let response = read_frame_bytes(stream)?;
    Ok(serde_json::from_slice(&response).unwrap_or(json!({"error": "parse error"})))
}

#[test]
fn ping_round_trip() {
    let (_server, addr) = start_server();
    let mut stream = connect(&addr);

    let resp = send_request(&mut stream, &json!({ "command": "ping" })).unwrap();
    assert_eq!(resp["stat"], "ok");
    assert_eq!(resp["message"], "pong");
}

#[test]
fn table_lifecycle_over_the_wire() {
    let (_server, addr) = start_server();
    let mut stream = connect(&addr);

    let resp = send_request(
        &mut stream,
        &json!({
            "command": "create_table",
            "name": "access_log",
            "fields": [
                { "name": "timestamp", "type": "timestamp" },
                { "name": "endpoint", "type": "string", "encoding": "dict" },
                { "name": "responseTime", "type": "int" }
            ]
        }),
    )
    .unwrap();
    assert_eq!(resp["stat"], "ok", "create failed: {resp}");
    assert_eq!(resp["created"], true);

    let resp = send_request(&mut stream, &json!({ "command": "show_tables" })).unwrap();
    assert_eq!(resp["tables"], json!(["access_log"]));

    let resp = send_request(
        &mut stream,
        &json!({ "command": "describe_table", "name": "access_log" }),
    )
    .unwrap();
    assert_eq!(resp["stat"], "ok");
    let fields = resp["fields"].as_array().unwrap();
    assert_eq!(fields.len(), 3);
    // Fields come back in name order.
    assert_eq!(fields[0]["name"], "endpoint");
    assert_eq!(fields[0]["encoding"], "dict");
    assert_eq!(fields[2]["type"], "timestamp");

    let resp = send_request(
        &mut stream,
        &json!({
            "command": "insert_into_table",
            "name": "access_log",
            "rows": [
                { "timestamp": 1, "endpoint": "/home", "responseTime": 10 },
                { "timestamp": 2, "endpoint": "/home", "responseTime": 30 },
                { "timestamp": 3, "endpoint": "/api", "responseTime": 20 }
            ]
        }),
    )
    .unwrap();
    assert_eq!(resp["stat"], "ok", "insert failed: {resp}");
    assert_eq!(resp["inserted"], 3);

    // A batch with one broken row must change nothing.
    let resp = send_request(
        &mut stream,
        &json!({
            "command": "insert_into_table",
            "name": "access_log",
            "rows": [
                { "timestamp": 4, "endpoint": "/home", "responseTime": 40 },
                { "timestamp": 5, "endpoint": "/api", "responseTime": "slow" }
            ]
        }),
    )
    .unwrap();
    assert_eq!(resp["stat"], "error");

    let resp = send_request(
        &mut stream,
        &json!({ "command": "stats_table", "name": "access_log" }),
    )
    .unwrap();
    assert_eq!(resp["stat"], "ok");
    // The stats payload lands flat in the envelope.
    assert!(resp.get("stats").is_none());
    assert_eq!(resp["table"], "access_log");
    assert_eq!(resp["size"], 3);
    assert!(resp["total_mem_bytes"].as_u64().unwrap() > 0);
    let stat_fields = resp["fields"].as_array().unwrap();
    assert_eq!(stat_fields.len(), 3);
    assert!(stat_fields.iter().all(|f| f["mem_bytes"].is_u64()));

    let resp = send_request(
        &mut stream,
        &json!({
            "command": "query_table",
            "name": "access_log",
            "select": [
                { "field": "endpoint" },
                { "field": "*", "aggr_func": "count", "display": "hits" },
                { "field": "responseTime", "aggr_func": "sum", "display": "total_rt" }
            ],
            "group_by": [ { "field": "endpoint" } ],
            "order_by": [ { "field": "hits" } ],
            "limit": 1,
            "query_stats_detailed": true
        }),
    )
    .unwrap();
    assert_eq!(resp["stat"], "ok", "query failed: {resp}");
    assert_eq!(resp["columns"], json!(["endpoint", "hits", "total_rt"]));
    assert_eq!(resp["rows"], json!([["/home", 2, 40]]));
    assert!(resp["elapsed_us"].is_u64());
    assert!(resp["elapsed_ms"].is_u64());
    assert!(resp["query_stats_detailed"]["group_us"].is_u64());

    let resp = send_request(
        &mut stream,
        &json!({ "command": "drop_table", "name": "access_log" }),
    )
    .unwrap();
    assert_eq!(resp["dropped"], true);

    let resp = send_request(&mut stream, &json!({ "command": "show_tables" })).unwrap();
    assert_eq!(resp["tables"], json!([]));
}

#[test]
fn engine_errors_keep_the_connection_alive() {
    let (_server, addr) = start_server();
    let mut stream = connect(&addr);

    let resp = send_request(
        &mut stream,
        &json!({
            "command": "query_table",
            "name": "missing",
            "select": [ { "field": "*", "aggr_func": "count" } ],
            "group_by": [ { "field": "endpoint" } ]
        }),
    )
    .unwrap();
    assert_eq!(resp["stat"], "error");
    assert!(resp["error_message"]
        .as_str()
        .unwrap()
        .contains("missing"));

    // Same connection still serves requests.
    let resp = send_request(&mut stream, &json!({ "command": "ping" })).unwrap();
    assert_eq!(resp["stat"], "ok");
}

#[test]
fn malformed_json_gets_envelope_then_close() {
    let (_server, addr) = start_server();
    let mut stream = connect(&addr);

    let resp = send_raw(&mut stream, b"this is not json").unwrap();
    assert_eq!(resp["stat"], "error");
    assert!(resp["error_message"]
        .as_str()
        .unwrap()
        .contains("invalid json"));

    // The server drops the connection after a decode failure.
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(_) => panic!("expected the connection to be closed"),
        Err(_) => {}
    }

    // A fresh connection is unaffected.
    let mut stream = connect(&addr);
    let resp = send_request(&mut stream, &json!({ "command": "ping" })).unwrap();
    assert_eq!(resp["stat"], "ok");
}

#[test]
fn zero_length_frame_is_rejected() {
    let (_server, addr) = start_server();
    let mut stream = connect(&addr);

    stream.write_all(&0u32.to_be_bytes()).unwrap();
    stream.flush().unwrap();

    let response = read_frame_bytes(&mut stream).unwrap();
    let resp: Value = serde_json::from_slice(&response).unwrap();
    assert_eq!(resp["stat"], "error");
    assert!(resp["error_message"]
        .as_str()
        .unwrap()
        .contains("invalid frame length"));
}
