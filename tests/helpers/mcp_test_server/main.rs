//! MCP test server binary for integration tests
//!
//! A minimal MCP server speaking newline-delimited JSON over stdin/stdout.
//! Integration tests spawn it through the process transport instead of a
//! real external server.
//!
//! # Handled Methods
//!
//! - `initialize` -- advertises tools, resources, and prompts.
//! - `notifications/initialized` -- swallowed.
//! - `tools/list` -- `echo`, `sleep`, and `burst`.
//! - `tools/call`:
//!   - `echo` returns `arguments.message`.
//!   - `sleep` waits `arguments.ms` milliseconds on its own thread before
//!     replying, so concurrent calls complete out of order.
//!   - `burst` writes a log notification and the reply in a single write.
//! - `resources/list`, `resources/read` -- one text resource,
//!   `mem://<prefix>/readme`.
//! - `prompts/list`, `prompts/get` -- one prompt, `greet(name)`.
//! - `ping` -- empty result.
//! - Anything else -- `-32601 Method not found`.
//!
//! # Flags
//!
//! - `--prefix NAME` -- server name and resource namespace (default `test`).
//! - `--exit-after N` -- exit after answering N requests.
//! - `--exit-code C` -- exit status used by `--exit-after` (default 0).
//! - `--noise` -- print a non-JSON line on stdout before serving.
//!
//! Every request is also logged to stderr, which is not part of the
//! protocol channel.

use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

struct Options {
    prefix: String,
    exit_after: Option<usize>,
    exit_code: i32,
    noise: bool,
}

fn parse_options() -> Options {
    let mut options = Options {
        prefix: "test".to_string(),
        exit_after: None,
        exit_code: 0,
        noise: false,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--prefix" => {
                if let Some(v) = args.next() {
                    options.prefix = v;
                }
            }
            "--exit-after" => options.exit_after = args.next().and_then(|v| v.parse().ok()),
            "--exit-code" => {
                options.exit_code = args.next().and_then(|v| v.parse().ok()).unwrap_or(0)
            }
            "--noise" => options.noise = true,
            other => eprintln!("mcp_test_server: ignoring unknown argument {other}"),
        }
    }
    options
}

type Output = Arc<Mutex<io::Stdout>>;

fn write_raw(out: &Output, text: &str) -> bool {
    let mut guard = match out.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.write_all(text.as_bytes()).is_ok() && guard.flush().is_ok()
}

fn write_message(out: &Output, message: &Value) -> bool {
    match serde_json::to_string(message) {
        Ok(s) => write_raw(out, &format!("{s}\n")),
        Err(e) => {
            eprintln!("mcp_test_server: failed to serialize response: {e}");
            true
        }
    }
}

fn main() {
    let options = parse_options();
    let out: Output = Arc::new(Mutex::new(io::stdout()));
    eprintln!("mcp_test_server[{}]: starting", options.prefix);

    if options.noise {
        write_raw(&out, "this line is not json\n");
    }

    let stdin = io::stdin();
    let mut answered = 0usize;

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                write_message(&out, &make_error(&Value::Null, -32700, "Parse error"));
                continue;
            }
        };

        let method = request
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or("")
            .to_string();
        eprintln!("mcp_test_server[{}]: {method}", options.prefix);

        // Replies to anything we sent, and notifications, need no answer.
        let Some(id) = request.get("id").cloned() else {
            continue;
        };
        if method.is_empty() {
            continue;
        }

        let params = request.get("params").cloned().unwrap_or(Value::Null);
        match method.as_str() {
            "tools/call" if params["name"] == "sleep" => {
                let ms = params["arguments"]["ms"].as_u64().unwrap_or(100);
                let tag = params["arguments"]["tag"].as_str().unwrap_or("").to_string();
                let out = Arc::clone(&out);
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(ms));
                    write_message(&out, &text_result(&id, &format!("slept {ms} {tag}")));
                });
            }
            "tools/call" if params["name"] == "burst" => {
                let notification = json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/message",
                    "params": { "level": "info", "data": "burst" }
                });
                let reply = text_result(&id, "burst done");
                let chunk = format!("{notification}\n{reply}\n");
                if !write_raw(&out, &chunk) {
                    break;
                }
            }
            _ => {
                let response = handle(&options.prefix, &method, &id, &params);
                if !write_message(&out, &response) {
                    break;
                }
            }
        }

        answered += 1;
        if options.exit_after.map_or(false, |n| answered >= n) {
            eprintln!(
                "mcp_test_server[{}]: exiting with {}",
                options.prefix, options.exit_code
            );
            std::process::exit(options.exit_code);
        }
    }
}

fn handle(prefix: &str, method: &str, id: &Value, params: &Value) -> Value {
    match method {
        "initialize" => ok(
            id,
            json!({
                "protocolVersion": "2025-11-25",
                "capabilities": {
                    "tools": { "listChanged": true },
                    "resources": {},
                    "prompts": {}
                },
                "serverInfo": { "name": format!("{prefix}-server"), "version": "0.1.0" }
            }),
        ),
        "ping" => ok(id, json!({})),
        "tools/list" => ok(
            id,
            json!({
                "tools": [
                    {
                        "name": "echo",
                        "description": "Echoes input",
                        "inputSchema": {
                            "type": "object",
                            "properties": { "message": { "type": "string" } }
                        }
                    },
                    {
                        "name": "sleep",
                        "description": "Replies after a delay",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "ms": { "type": "integer" },
                                "tag": { "type": "string" }
                            }
                        }
                    },
                    {
                        "name": "burst",
                        "description": "Sends a notification and the reply together",
                        "inputSchema": { "type": "object" }
                    }
                ]
            }),
        ),
        "tools/call" => {
            let name = params["name"].as_str().unwrap_or("");
            if name != "echo" {
                return make_error(id, -32602, &format!("Unknown tool: {name}"));
            }
            let message = params["arguments"]["message"].as_str().unwrap_or("");
            text_result(id, message)
        }
        "resources/list" => ok(
            id,
            json!({
                "resources": [{
                    "uri": format!("mem://{prefix}/readme"),
                    "name": "readme",
                    "mimeType": "text/plain"
                }]
            }),
        ),
        "resources/read" => {
            let uri = params["uri"].as_str().unwrap_or("");
            if uri != format!("mem://{prefix}/readme") {
                return make_error(id, -32602, &format!("Unknown resource: {uri}"));
            }
            ok(
                id,
                json!({
                    "contents": [{
                        "uri": uri,
                        "mimeType": "text/plain",
                        "text": format!("hello from {prefix}")
                    }]
                }),
            )
        }
        "prompts/list" => ok(
            id,
            json!({
                "prompts": [{
                    "name": "greet",
                    "description": "Greets someone",
                    "arguments": [{ "name": "name", "required": true }]
                }]
            }),
        ),
        "prompts/get" => {
            let who = params["arguments"]["name"].as_str().unwrap_or("nobody");
            ok(
                id,
                json!({
                    "messages": [{
                        "role": "user",
                        "content": { "type": "text", "text": format!("Hello, {who}!") }
                    }]
                }),
            )
        }
        other => make_error(id, -32601, &format!("Method not found: {other}")),
    }
}

fn ok(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn text_result(id: &Value, text: &str) -> Value {
    ok(
        id,
        json!({
            "content": [{ "type": "text", "text": text }],
            "isError": false
        }),
    )
}

/// Build a JSON-RPC error response.
fn make_error(id: &Value, code: i32, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}
