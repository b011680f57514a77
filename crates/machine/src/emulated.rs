//! # Emulated Machine Backend
//!
//! In-process [`MachineBinding`] implementation for tests and the node's
//! mock mode. An [`EmulatedHost`] plays the part of the machine-manager
//! fleet: a table of synthetic processes keyed by endpoint, so `fork`,
//! `connect`, `destroy` and `shutdown` behave like their remote
//! counterparts, including the failure modes (connecting to a dead process,
//! destroying twice).
//!
//! ## Scripting
//!
//! Machine behavior is scripted per request with [`RequestScript`]: a
//! sequence of emissions and checkpoints, each with a cycle cost, followed
//! by a terminal action (accept, reject, exception, halt, fault, soft
//! yield) or an endless spin. When the driver clears the manual-yield flag
//! the next script is armed; `run` then consumes events up to the target
//! cycle, yielding exactly as a real machine would.
//!
//! ## Determinism aids
//!
//! - Cycle costs are explicit, so cycle-budget tests are exact.
//! - An optional per-`run` latency makes concurrency tests meaningful.
//! - Every armed request is appended to a host-wide log with its endpoint,
//!   kind and payload, so tests can assert what actually reached the
//!   machine.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use oren_common::Hash32;

use crate::bindings::{
    BreakReason, BufferConfig, MachineBinding, MachineError, MachineResult, YieldReason,
};
use crate::htif::pack_tohost;

/// Rx buffer base address in the emulated address space.
pub const EMULATED_RX_START: u64 = 0x6000_0000;
/// Tx buffer base address in the emulated address space.
pub const EMULATED_TX_START: u64 = 0x6080_0000;
/// Size of each buffer region.
pub const EMULATED_BUFFER_LENGTH: u64 = 0x20_0000;

/// Cycle cost charged per script event unless overridden.
pub const DEFAULT_STEP_CYCLES: u64 = 1_000;

// ════════════════════════════════════════════════════════════════════════════
// SCRIPTS
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum Effect {
    EmitOutput(Vec<u8>),
    EmitReport(Vec<u8>),
    Progress(u32),
    Accept,
    Reject,
    Exception(Vec<u8>),
    Halt,
    Fail,
    SoftYield,
    Spin,
}

#[derive(Debug, Clone)]
struct ProgramEvent {
    remaining: u64,
    effect: Effect,
}

/// Scripted behavior for one incoming request.
///
/// Builder order is emission order. A script without a terminal action
/// spins forever once its events are exhausted, which is also what
/// [`RequestScript::run_forever`] expresses explicitly.
#[derive(Debug, Clone)]
pub struct RequestScript {
    events: Vec<(u64, Effect)>,
    step_cycles: u64,
}

impl RequestScript {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            step_cycles: DEFAULT_STEP_CYCLES,
        }
    }

    /// Cycle cost charged for each subsequent event.
    pub fn step_cycles(mut self, cycles: u64) -> Self {
        self.step_cycles = cycles;
        self
    }

    /// Emit one output and yield automatically.
    pub fn output(mut self, data: &[u8]) -> Self {
        self.events.push((self.step_cycles, Effect::EmitOutput(data.to_vec())));
        self
    }

    /// Emit one report and yield automatically.
    pub fn report(mut self, data: &[u8]) -> Self {
        self.events.push((self.step_cycles, Effect::EmitReport(data.to_vec())));
        self
    }

    /// Emit a progress checkpoint (automatic yield, no payload).
    pub fn progress(mut self, hint: u32) -> Self {
        self.events.push((self.step_cycles, Effect::Progress(hint)));
        self
    }

    /// Terminal: accept the request at a manual yield.
    pub fn then_accept(mut self) -> Self {
        self.events.push((self.step_cycles, Effect::Accept));
        self
    }

    /// Terminal: reject the request at a manual yield.
    pub fn then_reject(mut self) -> Self {
        self.events.push((self.step_cycles, Effect::Reject));
        self
    }

    /// Terminal: raise an exception at a manual yield.
    pub fn then_exception(mut self, payload: &[u8]) -> Self {
        self.events
            .push((self.step_cycles, Effect::Exception(payload.to_vec())));
        self
    }

    /// Terminal: halt the machine.
    pub fn then_halt(mut self) -> Self {
        self.events.push((self.step_cycles, Effect::Halt));
        self
    }

    /// Terminal: fault the machine.
    pub fn then_fail(mut self) -> Self {
        self.events.push((self.step_cycles, Effect::Fail));
        self
    }

    /// Terminal: yield softly.
    pub fn then_soft_yield(mut self) -> Self {
        self.events.push((self.step_cycles, Effect::SoftYield));
        self
    }

    /// Terminal: burn cycles forever without yielding.
    pub fn run_forever(mut self) -> Self {
        self.events.push((u64::MAX, Effect::Spin));
        self
    }

    fn into_program(self) -> VecDeque<ProgramEvent> {
        self.events
            .into_iter()
            .map(|(remaining, effect)| ProgramEvent { remaining, effect })
            .collect()
    }
}

impl Default for RequestScript {
    fn default() -> Self {
        Self::new()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// HOST
// ════════════════════════════════════════════════════════════════════════════

/// One armed request as seen by the machine.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub endpoint: String,
    /// Request kind discriminant from the `fromhost` high bits.
    pub kind: u32,
    pub data: Vec<u8>,
}

/// Initial register state for a loaded machine, for tests that need a
/// snapshot that is not primed.
#[derive(Debug, Clone)]
pub struct EmulatedSeed {
    pub iflags_y: bool,
    pub yield_reason: YieldReason,
    pub scripts: Vec<RequestScript>,
}

#[derive(Debug, Clone)]
struct MachineState {
    mcycle: u64,
    iflags_y: bool,
    tohost: u64,
    fromhost: u64,
    rx_buffer: Vec<u8>,
    tx_buffer: Vec<u8>,
    scripts: VecDeque<RequestScript>,
    program: VecDeque<ProgramEvent>,
    processed: u64,
    checkpoint: Option<Box<MachineState>>,
}

struct ProcessEntry {
    machine: Option<MachineState>,
}

/// Synthetic machine-manager fleet.
///
/// Holds every emulated process, the request log and the shared latency
/// knob. Tests keep an `Arc<EmulatedHost>` to observe process topology
/// while handles come and go.
pub struct EmulatedHost {
    processes: Mutex<HashMap<String, ProcessEntry>>,
    requests: Mutex<Vec<RequestRecord>>,
    next_id: AtomicU64,
    run_latency_ms: AtomicU64,
}

impl EmulatedHost {
    pub fn new() -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            run_latency_ms: AtomicU64::new(0),
        }
    }

    /// Loads a primed machine with the given per-request scripts.
    pub fn load(self: &Arc<Self>, scripts: Vec<RequestScript>) -> EmulatedMachine {
        self.load_seed(EmulatedSeed {
            iflags_y: true,
            yield_reason: YieldReason::RxAccepted,
            scripts,
        })
    }

    /// Loads a machine with explicit initial register state.
    pub fn load_seed(self: &Arc<Self>, seed: EmulatedSeed) -> EmulatedMachine {
        let endpoint = self.allocate_endpoint();
        let state = MachineState {
            mcycle: 0,
            iflags_y: seed.iflags_y,
            tohost: pack_tohost(seed.yield_reason as u32, 0),
            fromhost: 0,
            rx_buffer: Vec::new(),
            tx_buffer: Vec::new(),
            scripts: seed.scripts.into(),
            program: VecDeque::new(),
            processed: 0,
            checkpoint: None,
        };
        self.processes.lock().insert(
            endpoint.clone(),
            ProcessEntry {
                machine: Some(state),
            },
        );
        EmulatedMachine {
            host: Arc::clone(self),
            endpoint,
            buffers: BufferConfig {
                rx_buffer_start: EMULATED_RX_START,
                tx_buffer_start: EMULATED_TX_START,
            },
        }
    }

    /// Endpoints of all live processes, sorted.
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.processes.lock().keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    /// Every request armed so far, in arrival order.
    pub fn request_log(&self) -> Vec<RequestRecord> {
        self.requests.lock().clone()
    }

    /// Artificial latency added to every `run` call.
    pub fn set_run_latency(&self, latency: Duration) {
        self.run_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    fn run_latency(&self) -> Duration {
        Duration::from_millis(self.run_latency_ms.load(Ordering::SeqCst))
    }

    fn allocate_endpoint(&self) -> String {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("emulated://{id}")
    }
}

impl Default for EmulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MACHINE HANDLE
// ════════════════════════════════════════════════════════════════════════════

/// Handle to one emulated machine process.
pub struct EmulatedMachine {
    host: Arc<EmulatedHost>,
    endpoint: String,
    buffers: BufferConfig,
}

impl std::fmt::Debug for EmulatedMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedMachine")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl EmulatedMachine {
    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut MachineState) -> MachineResult<R>,
    ) -> MachineResult<R> {
        let mut processes = self.host.processes.lock();
        let entry = processes
            .get_mut(&self.endpoint)
            .ok_or_else(|| MachineError::Transport {
                endpoint: self.endpoint.clone(),
                reason: "connection refused".to_string(),
            })?;
        let state = entry.machine.as_mut().ok_or_else(|| MachineError::NotFound {
            endpoint: self.endpoint.clone(),
        })?;
        f(state)
    }
}

#[async_trait]
impl MachineBinding for EmulatedMachine {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn buffer_config(&self) -> BufferConfig {
        self.buffers
    }

    async fn run(&mut self, target_cycle: u64) -> MachineResult<BreakReason> {
        let latency = self.host.run_latency();
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }

        self.with_state(|state| {
            loop {
                let budget = target_cycle.saturating_sub(state.mcycle);
                match state.program.front_mut() {
                    None => {
                        state.mcycle = target_cycle.max(state.mcycle);
                        return Ok(BreakReason::ReachedTargetCycle);
                    }
                    // A spin event is bottomless and never pops.
                    Some(event)
                        if event.remaining > budget
                            || matches!(event.effect, Effect::Spin) =>
                    {
                        event.remaining = event.remaining.saturating_sub(budget);
                        state.mcycle = target_cycle.max(state.mcycle);
                        return Ok(BreakReason::ReachedTargetCycle);
                    }
                    Some(_) => {}
                }

                let Some(event) = state.program.pop_front() else {
                    continue;
                };
                state.mcycle = state.mcycle.saturating_add(event.remaining);

                match event.effect {
                    Effect::EmitOutput(data) => {
                        state.tohost =
                            pack_tohost(YieldReason::TxOutput as u32, data.len() as u32);
                        state.tx_buffer = data;
                        return Ok(BreakReason::YieldedAutomatically);
                    }
                    Effect::EmitReport(data) => {
                        state.tohost =
                            pack_tohost(YieldReason::TxReport as u32, data.len() as u32);
                        state.tx_buffer = data;
                        return Ok(BreakReason::YieldedAutomatically);
                    }
                    Effect::Progress(hint) => {
                        state.tohost = pack_tohost(YieldReason::Progress as u32, hint);
                        return Ok(BreakReason::YieldedAutomatically);
                    }
                    Effect::Accept => {
                        state.tohost = pack_tohost(YieldReason::RxAccepted as u32, 0);
                        state.iflags_y = true;
                        state.processed += 1;
                        return Ok(BreakReason::YieldedManually);
                    }
                    Effect::Reject => {
                        state.tohost = pack_tohost(YieldReason::RxRejected as u32, 0);
                        state.iflags_y = true;
                        state.processed += 1;
                        return Ok(BreakReason::YieldedManually);
                    }
                    Effect::Exception(payload) => {
                        state.tohost =
                            pack_tohost(YieldReason::TxException as u32, payload.len() as u32);
                        state.tx_buffer = payload;
                        state.iflags_y = true;
                        state.processed += 1;
                        return Ok(BreakReason::YieldedManually);
                    }
                    Effect::Halt => return Ok(BreakReason::Halted),
                    Effect::Fail => return Ok(BreakReason::Failed),
                    Effect::SoftYield => return Ok(BreakReason::YieldedSoftly),
                    Effect::Spin => {
                        // The guard above keeps spin events queued; if one
                        // is ever popped, re-arm it.
                        state.program.push_front(ProgramEvent {
                            remaining: u64::MAX,
                            effect: Effect::Spin,
                        });
                        state.mcycle = target_cycle.max(state.mcycle);
                        return Ok(BreakReason::ReachedTargetCycle);
                    }
                }
            }
        })
    }

    async fn read_mcycle(&self) -> MachineResult<u64> {
        self.with_state(|state| Ok(state.mcycle))
    }

    async fn read_iflags_y(&self) -> MachineResult<bool> {
        self.with_state(|state| Ok(state.iflags_y))
    }

    async fn reset_iflags_y(&mut self) -> MachineResult<()> {
        let endpoint = self.endpoint.clone();
        let record = self.with_state(|state| {
            state.iflags_y = false;
            let kind = (state.fromhost >> 32) as u32;
            let declared = (state.fromhost & 0xffff_ffff) as usize;
            let take = declared.min(state.rx_buffer.len());
            let data = state.rx_buffer[..take].to_vec();

            let script = state
                .scripts
                .pop_front()
                .unwrap_or_else(|| RequestScript::new().then_accept());
            state.program = script.into_program();

            Ok(RequestRecord {
                endpoint,
                kind,
                data,
            })
        })?;
        self.host.requests.lock().push(record);
        Ok(())
    }

    async fn read_htif_tohost_data(&self) -> MachineResult<u64> {
        self.with_state(|state| Ok(state.tohost))
    }

    async fn read_htif_fromhost(&self) -> MachineResult<u64> {
        self.with_state(|state| Ok(state.fromhost))
    }

    async fn write_htif_fromhost_data(&mut self, value: u64) -> MachineResult<()> {
        self.with_state(|state| {
            state.fromhost = value;
            Ok(())
        })
    }

    async fn read_memory(&self, address: u64, length: u64) -> MachineResult<Vec<u8>> {
        if length > EMULATED_BUFFER_LENGTH {
            return Err(MachineError::BadResponse {
                method: "read_memory".to_string(),
                reason: format!("read of {length} bytes exceeds the buffer region"),
            });
        }
        self.with_state(|state| {
            let buffer = match address {
                EMULATED_RX_START => &state.rx_buffer,
                EMULATED_TX_START => &state.tx_buffer,
                other => {
                    return Err(MachineError::BadResponse {
                        method: "read_memory".to_string(),
                        reason: format!("address {other:#x} is outside the rx/tx buffers"),
                    })
                }
            };
            let mut out = buffer.clone();
            out.resize(length as usize, 0);
            Ok(out)
        })
    }

    async fn write_memory(&mut self, address: u64, data: &[u8]) -> MachineResult<()> {
        if data.len() as u64 > EMULATED_BUFFER_LENGTH {
            return Err(MachineError::BadResponse {
                method: "write_memory".to_string(),
                reason: format!("write of {} bytes exceeds the buffer region", data.len()),
            });
        }
        self.with_state(|state| {
            match address {
                EMULATED_RX_START => state.rx_buffer = data.to_vec(),
                EMULATED_TX_START => state.tx_buffer = data.to_vec(),
                other => {
                    return Err(MachineError::BadResponse {
                        method: "write_memory".to_string(),
                        reason: format!("address {other:#x} is outside the rx/tx buffers"),
                    })
                }
            }
            Ok(())
        })
    }

    async fn read_root_hash(&self) -> MachineResult<Hash32> {
        self.with_state(|state| {
            let mut preimage = [0u8; 25];
            preimage[..8].copy_from_slice(&state.mcycle.to_be_bytes());
            preimage[8..16].copy_from_slice(&state.processed.to_be_bytes());
            preimage[16..24].copy_from_slice(&state.tohost.to_be_bytes());
            preimage[24] = state.iflags_y as u8;
            Ok(Hash32::digest(&preimage))
        })
    }

    async fn snapshot(&mut self) -> MachineResult<()> {
        self.with_state(|state| {
            let mut copy = state.clone();
            copy.checkpoint = None;
            state.checkpoint = Some(Box::new(copy));
            Ok(())
        })
    }

    async fn rollback(&mut self) -> MachineResult<()> {
        self.with_state(|state| match state.checkpoint.take() {
            Some(saved) => {
                *state = *saved;
                Ok(())
            }
            None => Err(MachineError::BadResponse {
                method: "rollback".to_string(),
                reason: "no snapshot to roll back to".to_string(),
            }),
        })
    }

    async fn fork(&self) -> MachineResult<String> {
        let child = self.host.allocate_endpoint();
        let mut processes = self.host.processes.lock();
        let machine = processes
            .get(&self.endpoint)
            .ok_or_else(|| MachineError::Transport {
                endpoint: self.endpoint.clone(),
                reason: "connection refused".to_string(),
            })?
            .machine
            .clone();
        processes.insert(child.clone(), ProcessEntry { machine });
        Ok(child)
    }

    async fn connect(&self, endpoint: &str) -> MachineResult<Self> {
        let processes = self.host.processes.lock();
        let entry = processes.get(endpoint).ok_or_else(|| MachineError::Transport {
            endpoint: endpoint.to_string(),
            reason: "connection refused".to_string(),
        })?;
        if entry.machine.is_none() {
            return Err(MachineError::NotFound {
                endpoint: endpoint.to_string(),
            });
        }
        Ok(EmulatedMachine {
            host: Arc::clone(&self.host),
            endpoint: endpoint.to_string(),
            buffers: self.buffers,
        })
    }

    async fn shutdown_endpoint(&self, endpoint: &str) -> MachineResult<()> {
        match self.host.processes.lock().remove(endpoint) {
            Some(_) => Ok(()),
            None => Err(MachineError::Transport {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            }),
        }
    }

    async fn destroy(&mut self) -> MachineResult<()> {
        let mut processes = self.host.processes.lock();
        let entry = processes
            .get_mut(&self.endpoint)
            .ok_or_else(|| MachineError::Transport {
                endpoint: self.endpoint.clone(),
                reason: "connection refused".to_string(),
            })?;
        match entry.machine.take() {
            Some(_) => Ok(()),
            None => Err(MachineError::NotFound {
                endpoint: self.endpoint.clone(),
            }),
        }
    }

    async fn shutdown(&mut self) -> MachineResult<()> {
        match self.host.processes.lock().remove(&self.endpoint) {
            Some(_) => Ok(()),
            None => Err(MachineError::Transport {
                endpoint: self.endpoint.clone(),
                reason: "connection refused".to_string(),
            }),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
