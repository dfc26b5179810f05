//! WasmEngine tests against small hand-written modules
#![cfg(feature = "wasmtime")]

use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use vidbridge::{BridgeConfig, TranscodeBridge, WasmEngine, WasmEngineConfig};
use vidbridge_core::{BridgeError, TranscodeOptions};

/// Bump allocator, a one-file filesystem and a transcode that keeps the
/// first half of its input. Empty input fails with "empty input".
const ECHO_HALF: &str = r#"
(module
  (import "env" "report_progress" (func $progress (param f64)))
  (import "env" "log_line" (func $log (param i32 i32)))
  (memory (export "memory") 4)
  (global $heap (mut i32) (i32.const 4096))
  (global $file (mut i32) (i32.const 0))
  (global $file_len (mut i32) (i32.const 0))
  (data (i32.const 64) "empty input\00")
  (data (i32.const 128) "starting")

  (func $malloc (export "malloc") (param $size i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $size
    i32.add
    i32.const 7
    i32.add
    i32.const -8
    i32.and
    global.set $heap
    local.get $ptr)

  (func (export "free") (param i32))
  (func (export "init_ffmpeg") (result i32) i32.const 0)
  (func (export "transcode_result_size") (result i32) i32.const 24)
  (func (export "free_transcode_result") (param i32))

  (func (export "transcode")
    (param $in i32) (param $len i32) (param $fmt i32) (param $vc i32)
    (param $ac i32) (param $vb i32) (param $ab i32) (param $res i32)
    (result i32)
    (local $rec i32) (local $out i32) (local $half i32)
    (call $log (i32.const 128) (i32.const 8))
    (local.set $rec (call $malloc (i32.const 24)))
    (if (i32.eqz (local.get $len))
      (then
        (i32.store (local.get $rec) (i32.const 0))
        (i32.store offset=8 (local.get $rec) (i32.const 64))
        (return (local.get $rec))))
    (call $progress (f64.const 10))
    (call $progress (f64.const 10))
    (call $progress (f64.const 12.5))
    (call $progress (f64.const 55))
    (call $progress (f64.const 90))
    (call $progress (f64.const 100))
    (local.set $half (i32.div_u (local.get $len) (i32.const 2)))
    (local.set $out (call $malloc (local.get $half)))
    (memory.copy (local.get $out) (local.get $in) (local.get $half))
    (i32.store (local.get $rec) (i32.const 1))
    (i32.store offset=12 (local.get $rec) (local.get $out))
    (i64.store offset=16 (local.get $rec) (i64.extend_i32_u (local.get $half)))
    (local.get $rec))

  (func (export "fs_write_file") (param $name i32) (param $data i32) (param $len i32) (result i32)
    (global.set $file (call $malloc (local.get $len)))
    (global.set $file_len (local.get $len))
    (memory.copy (global.get $file) (local.get $data) (local.get $len))
    (i32.const 0))

  (func (export "fs_read_file") (param $name i32) (param $len_out i32) (result i32)
    (local $copy i32)
    (if (i32.eqz (global.get $file))
      (then (return (i32.const 0))))
    (local.set $copy (call $malloc (global.get $file_len)))
    (memory.copy (local.get $copy) (global.get $file) (global.get $file_len))
    (i32.store (local.get $len_out) (global.get $file_len))
    (local.get $copy))
)
"#;

/// Transcode traps. No filesystem exports.
const TRAPPING: &str = r#"
(module
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 4096))
  (func (export "malloc") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (i32.const 256)))
    (local.get $ptr))
  (func (export "free") (param i32))
  (func (export "free_transcode_result") (param i32))
  (func (export "transcode")
    (param i32 i32 i32 i32 i32 i32 i32 i32) (result i32)
    unreachable)
)
"#;

const NO_MALLOC: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "free") (param i32))
  (func (export "free_transcode_result") (param i32))
  (func (export "transcode")
    (param i32 i32 i32 i32 i32 i32 i32 i32) (result i32)
    i32.const 0)
)
"#;

const FAILING_INIT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "malloc") (param i32) (result i32) i32.const 4096)
  (func (export "free") (param i32))
  (func (export "_init_ffmpeg") (result i32) i32.const 3)
  (func (export "free_transcode_result") (param i32))
  (func (export "transcode")
    (param i32 i32 i32 i32 i32 i32 i32 i32) (result i32)
    i32.const 0)
)
"#;

/// Command-line entry point that exits with `argc - 2`, or 99 when argv is
/// not NULL-terminated.
const RUNNER: &str = r#"
(module
  (import "env" "report_progress" (func $progress (param f64)))
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 4096))
  (func (export "malloc") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (i32.const 256)))
    (local.get $ptr))
  (func (export "free") (param i32))
  (func (export "free_transcode_result") (param i32))
  (func (export "transcode")
    (param i32 i32 i32 i32 i32 i32 i32 i32) (result i32)
    i32.const 0)
  (func (export "run") (param $argc i32) (param $argv i32) (result i32)
    (if (i32.load (i32.add (local.get $argv) (i32.mul (local.get $argc) (i32.const 4))))
      (then (return (i32.const 99))))
    (call $progress (f64.const 50))
    (i32.sub (local.get $argc) (i32.const 2)))
)
"#;

/// Helper to build a bridge over a module given as text
fn wasm_bridge(wat: &'static str) -> TranscodeBridge {
    TranscodeBridge::new(BridgeConfig::default(), move || {
        WasmEngine::from_bytes(wat.as_bytes(), 64)
            .map(|engine| Box::new(engine) as Box<dyn vidbridge_core::Engine>)
    })
}

#[tokio::test]
async fn test_transcode_through_module() {
    let bridge = wasm_bridge(ECHO_HALF);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let lines = Arc::new(Mutex::new(Vec::new()));
    let _progress = {
        let seen = Arc::clone(&seen);
        bridge.set_progress_callback(move |percent| seen.lock().push(percent))
    };
    let _logger = {
        let lines = Arc::clone(&lines);
        bridge.set_logger_callback(move |line| lines.lock().push(line.to_string()))
    };

    let input: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let output = bridge
        .transcode(input.clone(), TranscodeOptions::new("webm").video_codec("vp9"))
        .await
        .unwrap();

    assert_eq!(output, input[..500].to_vec());
    assert_eq!(*seen.lock(), vec![10.0, 12.5, 55.0, 90.0, 100.0]);
    assert_eq!(*lines.lock(), vec!["starting".to_string()]);
}

#[tokio::test]
async fn test_module_failure_message() {
    let bridge = wasm_bridge(ECHO_HALF);

    let err = bridge
        .transcode(Vec::new(), TranscodeOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, BridgeError::EngineFailure(_)));
    assert_eq!(err.to_string(), "empty input");
}

#[tokio::test]
async fn test_module_filesystem() {
    let bridge = wasm_bridge(ECHO_HALF);

    let err = bridge.read_file("out.mp4").await.unwrap_err();
    assert!(matches!(err, BridgeError::FileNotFound(_)));

    bridge
        .write_file("in.mp4", b"\x00\x00\x00\x18ftypmp42".to_vec())
        .await
        .unwrap();
    assert_eq!(
        bridge.read_file("in.mp4").await.unwrap(),
        b"\x00\x00\x00\x18ftypmp42".to_vec()
    );
}

#[tokio::test]
async fn test_trap_is_engine_failure() {
    let bridge = wasm_bridge(TRAPPING);

    let err = bridge
        .transcode(b"x".to_vec(), TranscodeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::EngineFailure(_)));

    // the instance survives a trap
    let err = bridge
        .transcode(b"x".to_vec(), TranscodeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::EngineFailure(_)));
}

#[tokio::test]
async fn test_missing_filesystem_exports() {
    let bridge = wasm_bridge(TRAPPING);

    let err = bridge.read_file("a").await.unwrap_err();
    assert_eq!(err.to_string(), "module does not export fs_read_file");
    let err = bridge.write_file("a", vec![1]).await.unwrap_err();
    assert_eq!(err.to_string(), "module does not export fs_write_file");
}

#[test]
fn test_missing_allocator_fails_load() {
    let err = WasmEngine::from_bytes(NO_MALLOC.as_bytes(), 16).err().unwrap();
    assert!(matches!(err, BridgeError::LoadFailure(_)));
    assert!(err.to_string().contains("malloc"));
}

#[tokio::test]
async fn test_init_failure_fails_load() {
    let bridge = wasm_bridge(FAILING_INIT);

    let err = bridge.load().await.unwrap_err();
    assert!(matches!(err, BridgeError::LoadFailure(_)));
    assert!(!bridge.is_loaded());
}

#[test]
fn test_unreadable_module_path() {
    let dir = tempfile::tempdir().unwrap();
    let config = WasmEngineConfig::new(dir.path().join("missing.wasm"));

    let err = WasmEngine::from_config(&config).err().unwrap();
    assert!(matches!(err, BridgeError::LoadFailure(_)));
}

/// Helper to turn string literals into owned arguments
fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|arg| arg.to_string()).collect()
}

#[tokio::test]
async fn test_run_exit_code() {
    let bridge = wasm_bridge(RUNNER);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _progress = {
        let seen = Arc::clone(&seen);
        bridge.set_progress_callback(move |percent| seen.lock().push(percent))
    };

    bridge.run(args(&["-i", "in.mp4"])).await.unwrap();
    assert_eq!(*seen.lock(), vec![50.0]);

    let err = bridge
        .run(args(&["-i", "in.mp4", "out.webm"]))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::EngineFailure(_)));
    assert_eq!(err.to_string(), "run exited with code 1");
}

#[tokio::test]
async fn test_run_export_missing() {
    let bridge = wasm_bridge(TRAPPING);

    let err = bridge.run(args(&["out.mp4"])).await.unwrap_err();
    assert_eq!(err.to_string(), "module does not export run");
}
