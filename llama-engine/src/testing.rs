// llama-engine/src/testing.rs
//
// Scripted native backend for tests. Records every call and the highest number
// of native calls that were ever running at the same time.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::native::{NativeBackend, NativeFault, NativeStatus, Step, STATUS_OK};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Init,
    Load(PathBuf),
    Prepare,
    SystemInfo,
    Unload,
    Shutdown,
    SessionInit { text: String, target_len: i32 },
    SessionStep { counter: i32 },
    ClearCache,
    Benchmark(i32, i32, i32, i32),
}

/// Shared view of what a [`ScriptedBackend`] was asked to do.
#[derive(Debug, Clone, Default)]
pub(crate) struct CallLog {
    calls: Arc<Mutex<Vec<Call>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl CallLog {
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    pub(crate) fn steps(&self) -> usize {
        self.count(|c| matches!(c, Call::SessionStep { .. }))
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self, call: Call) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push(call);
        InFlight(self)
    }
}

struct InFlight<'a>(&'a CallLog);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What the backend answers.
#[derive(Debug, Clone)]
pub(crate) struct Script {
    pub init_fault: Option<String>,
    pub load_status: NativeStatus,
    pub prepare_status: NativeStatus,
    /// Counter returned by `session_init`.
    pub initial_counter: i32,
    pub session_init_fault: Option<String>,
    /// Time spent processing the prompt in `session_init`.
    pub session_init_delay: Duration,
    /// Emit the end sentinel after this many fragments.
    pub end_after: Option<usize>,
    /// Fault on this (zero-based) step.
    pub fault_at_step: Option<usize>,
    /// Time spent inside each `session_step`.
    pub step_delay: Duration,
    pub clear_cache_delay: Duration,
    pub bench_fault: Option<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            init_fault: None,
            load_status: STATUS_OK,
            prepare_status: STATUS_OK,
            initial_counter: 0,
            session_init_fault: None,
            session_init_delay: Duration::ZERO,
            end_after: None,
            fault_at_step: None,
            step_delay: Duration::ZERO,
            clear_cache_delay: Duration::ZERO,
            bench_fault: None,
        }
    }
}

pub(crate) struct ScriptedBackend {
    script: Script,
    log: CallLog,
    prompt: String,
    steps: usize,
}

impl ScriptedBackend {
    pub(crate) fn new(script: Script, log: CallLog) -> Self {
        Self {
            script,
            log,
            prompt: String::new(),
            steps: 0,
        }
    }
}

impl NativeBackend for ScriptedBackend {
    fn init(&mut self, _lib_dir: &Path) -> Result<(), NativeFault> {
        let _call = self.log.enter(Call::Init);
        match &self.script.init_fault {
            Some(msg) => Err(NativeFault::new(msg.clone())),
            None => Ok(()),
        }
    }

    fn load(&mut self, path: &Path) -> NativeStatus {
        let _call = self.log.enter(Call::Load(path.to_path_buf()));
        self.script.load_status
    }

    fn prepare(&mut self) -> NativeStatus {
        let _call = self.log.enter(Call::Prepare);
        self.script.prepare_status
    }

    fn system_info(&self) -> String {
        let _call = self.log.enter(Call::SystemInfo);
        "scripted backend | CPU : SSE3 = 1 | AVX = 1".to_string()
    }

    fn unload(&mut self) {
        let _call = self.log.enter(Call::Unload);
    }

    fn shutdown(&mut self) {
        let _call = self.log.enter(Call::Shutdown);
    }

    fn session_init(
        &mut self,
        text: &str,
        _format_chat: bool,
        target_len: i32,
    ) -> Result<i32, NativeFault> {
        let _call = self.log.enter(Call::SessionInit {
            text: text.to_string(),
            target_len,
        });
        if !self.script.session_init_delay.is_zero() {
            std::thread::sleep(self.script.session_init_delay);
        }
        if let Some(msg) = &self.script.session_init_fault {
            return Err(NativeFault::new(msg.clone()));
        }
        self.prompt = text.to_string();
        self.steps = 0;
        Ok(self.script.initial_counter)
    }

    fn session_step(&mut self, _target_len: i32, counter: i32) -> Result<Step, NativeFault> {
        let log = self.log.clone();
        let _call = log.enter(Call::SessionStep { counter });
        if !self.script.step_delay.is_zero() {
            std::thread::sleep(self.script.step_delay);
        }

        let step = self.steps;
        self.steps += 1;
        if self.script.fault_at_step == Some(step) {
            return Err(NativeFault::new("decode failed"));
        }
        if self.script.end_after == Some(step) {
            return Ok(Step::End);
        }
        Ok(Step::Fragment {
            text: format!("{}#{} ", self.prompt, counter),
            counter: counter + 1,
        })
    }

    fn clear_cache(&mut self) {
        let _call = self.log.enter(Call::ClearCache);
        if !self.script.clear_cache_delay.is_zero() {
            std::thread::sleep(self.script.clear_cache_delay);
        }
    }

    fn benchmark(&mut self, pp: i32, tg: i32, pl: i32, nr: i32) -> Result<String, NativeFault> {
        let _call = self.log.enter(Call::Benchmark(pp, tg, pl, nr));
        if let Some(msg) = &self.script.bench_fault {
            return Err(NativeFault::new(msg.clone()));
        }
        Ok(format!(
            "| model | size | params | backend | test | t/s |\n\
             | --- | --- | --- | --- | --- | --- |\n\
             | scripted | 0 B | 0 | CPU | pp {} | 100.00 ± 0.00 |\n\
             | scripted | 0 B | 0 | CPU | tg {} | 10.00 ± 0.00 |\n",
            pp, tg
        ))
    }
}
