//! Scripted in-process engine.
//!
//! `StubEngine` speaks the same memory protocol as a real engine: it reads
//! the input region out of its [`MemoryArena`], writes output buffers and
//! result records in the configured [`ResultLayout`], and frees them in
//! `free_result`. What it "transcodes" is decided by a script, which makes it
//! the fault-injecting engine for tests and a stand-in for development.
//!
//! `run` follows the same scripts against the stub's virtual filesystem: the
//! last argument names the output file, and `-i <name>` the input.

use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::{Arena, ArenaPtr, ArenaStats, MemoryArena};
use crate::engine::{Engine, TranscodeCall};
use crate::error::{BridgeError, Result};
use crate::layout::ResultLayout;
use crate::options::TranscodeOptions;
use crate::progress::EventSink;

/// What the stub returns at the end of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubOutcome {
    /// Success record with these output bytes
    Success(Vec<u8>),
    /// Success record whose output is a copy of the input
    Echo,
    /// Failure record with this error message
    Failure(String),
    /// Null result pointer; `run` exits without writing output
    NullResult,
    /// The engine faults instead of returning
    Fault(String),
}

/// One scripted action performed during a call.
#[derive(Debug, Clone, PartialEq)]
pub enum StubStep {
    Progress(f64),
    Log(String),
    /// Block until the gate receives a signal (or its sender is dropped)
    WaitForGate,
}

/// Steps and outcome of one call.
#[derive(Debug, Clone, PartialEq)]
pub struct StubScript {
    pub steps: Vec<StubStep>,
    pub outcome: StubOutcome,
}

impl StubScript {
    pub fn new(outcome: StubOutcome) -> Self {
        Self {
            steps: Vec::new(),
            outcome,
        }
    }

    /// Succeed with `len` bytes of output.
    pub fn success(len: usize) -> Self {
        Self::new(StubOutcome::Success(vec![0xAB; len]))
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(StubOutcome::Failure(message.into()))
    }

    pub fn progress(mut self, values: impl IntoIterator<Item = f64>) -> Self {
        self.steps.extend(values.into_iter().map(StubStep::Progress));
        self
    }

    pub fn log(mut self, line: impl Into<String>) -> Self {
        self.steps.push(StubStep::Log(line.into()));
        self
    }

    pub fn wait_for_gate(mut self) -> Self {
        self.steps.push(StubStep::WaitForGate);
        self
    }
}

/// A call as the stub saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub input: Vec<u8>,
    pub options: TranscodeOptions,
}

#[derive(Debug, Default)]
struct MonitorState {
    inits: usize,
    calls: Vec<RecordedCall>,
    runs: Vec<Vec<String>>,
    frees: usize,
}

/// Read-only view of a stub's activity that stays valid after the stub has
/// been moved into a bridge.
#[derive(Debug, Clone, Default)]
pub struct StubMonitor {
    state: Arc<Mutex<MonitorState>>,
    arena: Arc<Mutex<ArenaStats>>,
}

impl StubMonitor {
    /// Number of times `init` ran.
    pub fn inits(&self) -> usize {
        self.state.lock().inits
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    /// Argument lists passed to `run`, in order.
    pub fn runs(&self) -> Vec<Vec<String>> {
        self.state.lock().runs.clone()
    }

    /// Number of result records freed.
    pub fn frees(&self) -> usize {
        self.state.lock().frees
    }

    /// Live counters of the stub's arena, including regions the host
    /// allocates and releases itself.
    pub fn arena_stats(&self) -> ArenaStats {
        *self.arena.lock()
    }
}

/// Scripted engine over an in-process arena.
pub struct StubEngine {
    arena: MemoryArena,
    layout: ResultLayout,
    scripts: Vec<StubScript>,
    calls: usize,
    gate: Option<Receiver<()>>,
    init_error: Option<String>,
    reported_record_size: Option<u32>,
    files: HashMap<String, Vec<u8>>,
    owned: HashMap<ArenaPtr, Vec<ArenaPtr>>,
    monitor: StubMonitor,
}

impl StubEngine {
    /// Stub that runs `script` on every call.
    pub fn new(script: StubScript) -> Self {
        let layout = ResultLayout::default();
        let monitor = StubMonitor::default();
        Self {
            arena: MemoryArena::with_shared_stats(
                MemoryArena::DEFAULT_CAPACITY,
                Arc::clone(&monitor.arena),
            ),
            layout,
            scripts: vec![script],
            calls: 0,
            gate: None,
            init_error: None,
            reported_record_size: Some(layout.record_size),
            files: HashMap::new(),
            owned: HashMap::new(),
            monitor,
        }
    }

    /// Run `script` on the next call. The last script repeats.
    pub fn then(mut self, script: StubScript) -> Self {
        self.scripts.push(script);
        self
    }

    /// Encode records in `layout`; the reported record size follows it.
    pub fn with_layout(mut self, layout: ResultLayout) -> Self {
        self.layout = layout;
        self.reported_record_size = Some(layout.record_size);
        self
    }

    /// Report a native record size different from the layout in use.
    pub fn with_reported_record_size(mut self, size: Option<u32>) -> Self {
        self.reported_record_size = size;
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.arena = MemoryArena::with_shared_stats(capacity, Arc::clone(&self.monitor.arena));
        self
    }

    /// Gate consumed by [`StubStep::WaitForGate`].
    pub fn with_gate(mut self, gate: Receiver<()>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Make `init` fail with a load error.
    pub fn failing_init(mut self, message: impl Into<String>) -> Self {
        self.init_error = Some(message.into());
        self
    }

    pub fn monitor(&self) -> StubMonitor {
        self.monitor.clone()
    }

    /// Script for the next call or run. The last one repeats.
    fn next_script(&mut self) -> StubScript {
        let last = self.scripts.len().saturating_sub(1);
        let script = self.scripts[self.calls.min(last)].clone();
        self.calls += 1;
        script
    }

    fn play(&self, steps: Vec<StubStep>, events: &Arc<dyn EventSink>) {
        for step in steps {
            match step {
                StubStep::Progress(percent) => events.progress(percent),
                StubStep::Log(line) => events.log(&line),
                StubStep::WaitForGate => {
                    if let Some(gate) = &self.gate {
                        let _ = gate.recv();
                    }
                }
            }
        }
    }

    fn emit_result(&mut self, outcome: StubOutcome, input: &[u8]) -> Result<ArenaPtr> {
        match outcome {
            StubOutcome::NullResult => Ok(ArenaPtr::NULL),
            StubOutcome::Fault(message) => Err(BridgeError::EngineFailure(message)),
            StubOutcome::Failure(message) => {
                let record = self.arena.allocate(self.layout.record_size)?;
                let text = self
                    .layout
                    .encode_failure(&mut self.arena, record, &message)?;
                self.owned.insert(record, text.into_iter().collect());
                Ok(record)
            }
            StubOutcome::Success(output) => self.emit_success(&output),
            StubOutcome::Echo => self.emit_success(input),
        }
    }

    fn emit_success(&mut self, output: &[u8]) -> Result<ArenaPtr> {
        let len = output.len() as u32;
        let data = self.arena.allocate(len)?;
        self.arena.write(data, output)?;
        let record = self.arena.allocate(self.layout.record_size)?;
        self.layout
            .encode_success(&mut self.arena, record, data, len)?;
        self.owned.insert(record, vec![data]);
        Ok(record)
    }
}

impl Engine for StubEngine {
    fn init(&mut self) -> Result<()> {
        self.monitor.state.lock().inits += 1;
        match &self.init_error {
            Some(message) => Err(BridgeError::LoadFailure(message.clone())),
            None => Ok(()),
        }
    }

    fn result_record_size(&self) -> Option<u32> {
        self.reported_record_size
    }

    fn arena(&self) -> &dyn Arena {
        &self.arena
    }

    fn arena_mut(&mut self) -> &mut dyn Arena {
        &mut self.arena
    }

    fn transcode(
        &mut self,
        call: TranscodeCall<'_>,
        events: &Arc<dyn EventSink>,
    ) -> Result<ArenaPtr> {
        let input = self.arena.read(call.input, call.input_len)?;
        self.monitor.state.lock().calls.push(RecordedCall {
            input: input.clone(),
            options: call.options.clone(),
        });

        let script = self.next_script();
        self.play(script.steps, events);
        self.emit_result(script.outcome, &input)
    }

    fn run(&mut self, args: &[String], events: &Arc<dyn EventSink>) -> Result<()> {
        self.monitor.state.lock().runs.push(args.to_vec());

        let script = self.next_script();
        self.play(script.steps, events);

        let output = match script.outcome {
            StubOutcome::Failure(message) | StubOutcome::Fault(message) => {
                return Err(BridgeError::EngineFailure(message));
            }
            StubOutcome::NullResult => return Ok(()),
            StubOutcome::Success(output) => output,
            StubOutcome::Echo => {
                let input = args
                    .windows(2)
                    .find(|pair| pair[0] == "-i")
                    .map(|pair| pair[1].as_str())
                    .ok_or_else(|| BridgeError::EngineFailure("no input file given".into()))?;
                self.files.get(input).cloned().ok_or_else(|| {
                    BridgeError::EngineFailure(format!("{}: No such file or directory", input))
                })?
            }
        };
        if let Some(name) = args.last() {
            self.files.insert(name.clone(), output);
        }
        Ok(())
    }

    fn free_result(&mut self, record: ArenaPtr) -> Result<()> {
        for owned in self.owned.remove(&record).unwrap_or_default() {
            self.arena.release(owned)?;
        }
        self.arena.release(record)?;
        self.monitor.state.lock().frees += 1;
        Ok(())
    }

    fn write_file(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.files.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn read_file(&mut self, name: &str) -> Result<Vec<u8>> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::FileNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Decoded, ResultDecoder};
    use crate::progress::NullSink;

    fn call_with_input(engine: &mut StubEngine, input: &[u8]) -> ArenaPtr {
        let options = TranscodeOptions::default();
        let events: Arc<dyn EventSink> = Arc::new(NullSink);
        let ptr = engine.arena_mut().allocate(input.len() as u32).unwrap();
        engine.arena_mut().write(ptr, input).unwrap();
        let record = engine
            .transcode(
                TranscodeCall {
                    input: ptr,
                    input_len: input.len() as u32,
                    options: &options,
                },
                &events,
            )
            .unwrap();
        engine.arena_mut().release(ptr).unwrap();
        record
    }

    #[test]
    fn test_echo_reads_input_region() {
        let mut engine = StubEngine::new(StubScript::new(StubOutcome::Echo));
        let record = call_with_input(&mut engine, b"frames");

        let decoder = ResultDecoder::new(ResultLayout::default()).unwrap();
        assert_eq!(
            decoder.decode(engine.arena(), record).unwrap(),
            Decoded::Success(b"frames".to_vec())
        );
        assert_eq!(engine.monitor().calls()[0].input, b"frames");
    }

    #[test]
    fn test_free_result_releases_everything() {
        let mut engine = StubEngine::new(StubScript::failure("bad input"));
        let record = call_with_input(&mut engine, b"x");
        // record and error text; the input region is already released
        assert_eq!(engine.monitor().arena_stats().outstanding, 2);

        engine.free_result(record).unwrap();
        assert_eq!(engine.monitor().arena_stats().outstanding, 0);
        assert_eq!(engine.monitor().frees(), 1);
    }

    #[test]
    fn test_monitor_sees_host_releases() {
        let mut engine = StubEngine::new(StubScript::new(StubOutcome::NullResult));
        let monitor = engine.monitor();
        let ptr = engine.arena_mut().allocate(16).unwrap();
        assert_eq!(monitor.arena_stats().outstanding, 1);

        engine.arena_mut().release(ptr).unwrap();
        assert_eq!(monitor.arena_stats().outstanding, 0);
        assert_eq!(monitor.arena_stats().releases, 1);
    }

    #[test]
    fn test_capacity_keeps_monitor_counters() {
        let mut engine = StubEngine::new(StubScript::success(1)).with_capacity(256);
        let monitor = engine.monitor();
        let ptr = engine.arena_mut().allocate(16).unwrap();
        assert_eq!(monitor.arena_stats().allocations, 1);
        engine.arena_mut().release(ptr).unwrap();
    }

    #[test]
    fn test_scripts_advance_and_last_repeats() {
        let mut engine = StubEngine::new(StubScript::success(1))
            .then(StubScript::new(StubOutcome::NullResult));

        let first = call_with_input(&mut engine, b"a");
        assert!(!first.is_null());
        engine.free_result(first).unwrap();

        assert!(call_with_input(&mut engine, b"a").is_null());
        assert!(call_with_input(&mut engine, b"a").is_null());
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_run_echo_copies_staged_input() {
        let mut engine = StubEngine::new(StubScript::new(StubOutcome::Echo));
        let events: Arc<dyn EventSink> = Arc::new(NullSink);
        engine.write_file("in.mp4", b"frames").unwrap();

        engine
            .run(&args(&["-i", "in.mp4", "-c:v", "vp9", "out.webm"]), &events)
            .unwrap();
        assert_eq!(engine.read_file("out.webm").unwrap(), b"frames");
        assert_eq!(engine.monitor().runs()[0][1], "in.mp4");
        assert_eq!(engine.monitor().arena_stats().outstanding, 0);
    }

    #[test]
    fn test_run_missing_input() {
        let mut engine = StubEngine::new(StubScript::new(StubOutcome::Echo));
        let events: Arc<dyn EventSink> = Arc::new(NullSink);

        let err = engine
            .run(&args(&["-i", "missing.mp4", "out.webm"]), &events)
            .unwrap_err();
        assert_eq!(err.to_string(), "missing.mp4: No such file or directory");
    }

    #[test]
    fn test_failing_init() {
        let mut engine =
            StubEngine::new(StubScript::success(1)).failing_init("missing wasm binary");
        let err = engine.init().unwrap_err();
        assert!(matches!(err, BridgeError::LoadFailure(_)));
        assert_eq!(engine.monitor().inits(), 1);
    }

    #[test]
    fn test_virtual_filesystem() {
        let mut engine = StubEngine::new(StubScript::success(1));
        engine.write_file("input.mp4", b"data").unwrap();
        assert_eq!(engine.read_file("input.mp4").unwrap(), b"data");
        assert!(matches!(
            engine.read_file("missing.mp4"),
            Err(BridgeError::FileNotFound(_))
        ));
    }
}
