//! Wasm middlewares built from WAT guests.

mod common;

use common::{calls, counting_next, local, request, write_plugin};
use http::StatusCode;
use portcullis_plugins::wasm::WasmError;
use portcullis_plugins::{BuildError, Builder, Settings};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::Path;

const MODULE: &str = "example.com/guard";

const MANIFEST: &str =
    "displayName: Guard\ntype: middleware\nruntime: wasm\nwasmPath: plugin.wat\ntestData: {}\n";

const DENY: &str = r#"
(module
  (import "http_handler" "set_status_code" (func $set_status (param i32)))
  (import "http_handler" "write_body" (func $write_body (param i32 i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "denied")
  (func (export "handle_request") (result i64)
    (call $set_status (i32.const 403))
    (call $write_body (i32.const 1) (i32.const 16) (i32.const 6))
    (i64.const 0))
  (func (export "handle_response") (param i32 i32)))
"#;

const TAG: &str = r#"
(module
  (import "http_handler" "set_header_value" (func $set_header (param i32 i32 i32 i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "x-plugin")
  (data (i32.const 16) "wasm")
  (data (i32.const 32) "x-after")
  (data (i32.const 48) "done")
  (func (export "handle_request") (result i64)
    (call $set_header (i32.const 0) (i32.const 0) (i32.const 8) (i32.const 16) (i32.const 4))
    (i64.const 1))
  (func (export "handle_response") (param i32 i32)
    (call $set_header (i32.const 1) (i32.const 32) (i32.const 7) (i32.const 48) (i32.const 4))))
"#;

const ECHO_CONFIG: &str = r#"
(module
  (import "http_handler" "get_config" (func $get_config (param i32 i32) (result i32)))
  (import "http_handler" "write_body" (func $write_body (param i32 i32 i32)))
  (memory (export "memory") 1)
  (func (export "handle_request") (result i64)
    (local $len i32)
    (local.set $len (call $get_config (i32.const 1024) (i32.const 8192)))
    (call $write_body (i32.const 1) (i32.const 1024) (local.get $len))
    (i64.const 0))
  (func (export "handle_response") (param i32 i32)))
"#;

const ECHO_ENV: &str = r#"
(module
  (import "wasi_snapshot_preview1" "environ_sizes_get" (func $sizes (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "environ_get" (func $environ (param i32 i32) (result i32)))
  (import "http_handler" "write_body" (func $write_body (param i32 i32 i32)))
  (memory (export "memory") 1)
  (func (export "handle_request") (result i64)
    (drop (call $sizes (i32.const 0) (i32.const 4)))
    (drop (call $environ (i32.const 64) (i32.const 1024)))
    (call $write_body (i32.const 1) (i32.const 1024) (i32.load (i32.const 4)))
    (i64.const 0))
  (func (export "handle_response") (param i32 i32)))
"#;

const TRAP: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "handle_request") (result i64)
    unreachable)
  (func (export "handle_response") (param i32 i32)))
"#;

const SOCKETS: &str = r#"
(module
  (import "wasi_snapshot_preview1" "sock_open" (func $sock_open (param i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "handle_request") (result i64)
    (i64.const 1))
  (func (export "handle_response") (param i32 i32)))
"#;

const OVERSIZED_RECV: &str = r#"
(module
  (import "wasi_snapshot_preview1" "sock_open" (func $sock_open (param i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "sock_recv" (func $sock_recv (param i32 i32 i32 i32 i32 i32) (result i32)))
  (import "http_handler" "set_status_code" (func $set_status (param i32)))
  (memory (export "memory") 1)
  (data (i32.const 64) "\00\04\00\00\ff\ff\ff\ff\00\04\00\00\ff\ff\ff\ff")
  (func (export "handle_request") (result i64)
    (drop (call $sock_open (i32.const 1) (i32.const 2) (i32.const 0)))
    (call $set_status
      (i32.add
        (i32.const 400)
        (call $sock_recv (i32.load (i32.const 0)) (i32.const 64) (i32.const 2) (i32.const 0) (i32.const 128) (i32.const 132))))
    (i64.const 0))
  (func (export "handle_response") (param i32 i32)))
"#;

const OVERSIZED_BODY: &str = r#"
(module
  (import "http_handler" "write_body" (func $write_body (param i32 i32 i32)))
  (memory (export "memory") 1)
  (func (export "handle_request") (result i64)
    (call $write_body (i32.const 1) (i32.const 0) (i32.const -1))
    (i64.const 0))
  (func (export "handle_response") (param i32 i32)))
"#;

fn builder(root: &Path, guest: &str, settings: Settings) -> Result<Builder, BuildError> {
    write_plugin(root, MODULE, MANIFEST, &[("plugin.wat", guest.as_bytes())]);
    Builder::new(root, &HashMap::new(), root, &local("guard", MODULE, settings))
}

fn config(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn guest_can_answer_without_calling_next() {
    let root = tempfile::tempdir().unwrap();
    let builder = builder(root.path(), DENY, Settings::default()).unwrap();
    let middleware = builder.build("guard", &Map::new(), "guard@file").unwrap();

    let (next, counter) = counting_next();
    let handler = middleware.new_handler(next).unwrap();
    let resp = handler.serve_http(request("http://proxy.local/", "10.0.0.1:5000")).await;

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(resp.body().as_ref(), b"denied");
    assert_eq!(calls(&counter), 0);
}

#[tokio::test]
async fn guest_rewrites_request_and_response() {
    let root = tempfile::tempdir().unwrap();
    let builder = builder(root.path(), TAG, Settings::default()).unwrap();
    let middleware = builder.build("guard", &Map::new(), "guard@file").unwrap();

    let (next, counter) = counting_next();
    let handler = middleware.new_handler(next).unwrap();
    let resp = handler.serve_http(request("http://proxy.local/", "10.0.0.1:5000")).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.body().as_ref(), b"next");
    assert_eq!(resp.headers()["x-seen"], "wasm");
    assert_eq!(resp.headers()["x-after"], "done");
    assert_eq!(calls(&counter), 1);
}

async fn echoed_config(builder: &Builder, config: Map<String, Value>) -> Value {
    let middleware = builder.build("guard", &config, "guard@file").unwrap();
    let (next, _) = counting_next();
    let handler = middleware.new_handler(next).unwrap();
    let resp = handler.serve_http(request("http://proxy.local/", "10.0.0.1:5000")).await;
    serde_json::from_slice(resp.body()).unwrap()
}

#[tokio::test]
async fn guest_config_envelope_and_flat_forms() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let mount = data.path().to_str().unwrap().to_string();
    let settings = Settings {
        mounts: vec![mount.clone()],
        ..Default::default()
    };
    let builder = builder(root.path(), ECHO_CONFIG, settings).unwrap();

    let flat = echoed_config(&builder, config(json!({ "limit": 3, "name": "edge" }))).await;
    assert_eq!(flat, json!({ "limit": 3, "name": "edge" }));

    let envelope = echoed_config(
        &builder,
        config(json!({ "runtime": { "rootFS": mount }, "config": { "limit": 5 } })),
    )
    .await;
    assert_eq!(envelope, json!({ "limit": 5 }));

    let no_config = echoed_config(&builder, config(json!({ "runtime": {} }))).await;
    assert_eq!(no_config, json!({}));
}

#[test]
fn root_fs_must_be_a_mount() {
    let root = tempfile::tempdir().unwrap();
    let elsewhere = tempfile::tempdir().unwrap();
    let builder = builder(root.path(), ECHO_CONFIG, Settings::default()).unwrap();

    let err = builder
        .build(
            "guard",
            &config(json!({ "runtime": { "rootFS": elsewhere.path().to_str().unwrap() } })),
            "guard@file",
        )
        .err()
        .unwrap();
    assert!(matches!(err, BuildError::Wasm(WasmError::GuestConfig(_))));
}

#[test]
fn missing_mount_directory_fails_the_build() {
    let root = tempfile::tempdir().unwrap();
    let settings = Settings {
        mounts: vec!["/definitely/not/here:/data".to_string()],
        ..Default::default()
    };
    let err = builder(root.path(), ECHO_CONFIG, settings).err().unwrap();
    assert!(matches!(err, BuildError::Wasm(WasmError::InvalidMount { .. })));
}

#[tokio::test]
async fn only_allowed_variables_reach_the_guest() {
    // SAFETY: test-only variables with names no other test touches.
    unsafe {
        std::env::set_var("PORTCULLIS_WASM_ALLOWED", "first");
        std::env::set_var("PORTCULLIS_WASM_HIDDEN", "secret");
    }

    let root = tempfile::tempdir().unwrap();
    let settings = Settings {
        envs: vec!["PORTCULLIS_WASM_ALLOWED".to_string()],
        ..Default::default()
    };
    let builder = builder(root.path(), ECHO_ENV, settings).unwrap();
    let middleware = builder.build("guard", &Map::new(), "guard@file").unwrap();
    let (next, _) = counting_next();
    let handler = middleware.new_handler(next).unwrap();

    let resp = handler.serve_http(request("http://proxy.local/", "10.0.0.1:5000")).await;
    let environ = String::from_utf8_lossy(resp.body()).into_owned();
    assert!(environ.contains("PORTCULLIS_WASM_ALLOWED=first"));
    assert!(!environ.contains("PORTCULLIS_WASM_HIDDEN"));

    // SAFETY: as above.
    unsafe { std::env::set_var("PORTCULLIS_WASM_ALLOWED", "second") };
    let resp = handler.serve_http(request("http://proxy.local/", "10.0.0.1:5000")).await;
    assert!(String::from_utf8_lossy(resp.body()).contains("PORTCULLIS_WASM_ALLOWED=second"));
}

#[tokio::test]
async fn guest_traps_become_server_errors() {
    let root = tempfile::tempdir().unwrap();
    let builder = builder(root.path(), TRAP, Settings::default()).unwrap();
    let middleware = builder.build("guard", &Map::new(), "guard@file").unwrap();

    let (next, counter) = counting_next();
    let handler = middleware.new_handler(next).unwrap();
    let resp = handler.serve_http(request("http://proxy.local/", "10.0.0.1:5000")).await;

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(calls(&counter), 0);
}

#[test]
fn socket_imports_are_linked_on_demand() {
    let root = tempfile::tempdir().unwrap();
    let builder = builder(root.path(), SOCKETS, Settings::default()).unwrap();
    assert!(builder.build("guard", &Map::new(), "guard@file").is_ok());
    assert!(builder.build_tcp("guard", &Map::new(), "guard@file").is_err());
}

#[tokio::test]
async fn receive_buffers_outside_guest_memory_are_rejected() {
    let root = tempfile::tempdir().unwrap();
    let builder = builder(root.path(), OVERSIZED_RECV, Settings::default()).unwrap();
    let middleware = builder.build("guard", &Map::new(), "guard@file").unwrap();

    let (next, counter) = counting_next();
    let handler = middleware.new_handler(next).unwrap();
    let resp = handler.serve_http(request("http://proxy.local/", "10.0.0.1:5000")).await;

    // 400 + EINVAL
    assert_eq!(resp.status().as_u16(), 428);
    assert_eq!(calls(&counter), 0);
}

#[tokio::test]
async fn oversized_host_reads_trap_the_guest() {
    let root = tempfile::tempdir().unwrap();
    let builder = builder(root.path(), OVERSIZED_BODY, Settings::default()).unwrap();
    let middleware = builder.build("guard", &Map::new(), "guard@file").unwrap();

    let (next, counter) = counting_next();
    let handler = middleware.new_handler(next).unwrap();
    let resp = handler.serve_http(request("http://proxy.local/", "10.0.0.1:5000")).await;

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(calls(&counter), 0);
}
