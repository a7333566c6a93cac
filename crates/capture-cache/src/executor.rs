//! Capturing executor
//!
//! Wraps an executable and replays a captured device graph for every call
//! whose tensor arguments match a previously seen shape signature. A new
//! signature is captured once: the inner executable runs a warmup call on
//! private input holders, then runs again while the stream records. Replays
//! copy the caller's tensors into those holders, launch the graph and return
//! copies of the graph's outputs.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use common::error::{Error, Result};
use common::utils::format_duration;
use device_runtime::{CallArgs, Executable, GraphExec, ScheduleEntry, Stream, Tensor};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::signature::ShapeSignature;

/// Capture cache options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureOptions {
    /// Maximum number of captured graphs; 0 keeps every signature
    pub max_graphs: usize,
}

/// Counters of a capturing executor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStats {
    /// Signatures captured
    pub captures: u64,
    /// Calls served by replaying a captured graph
    pub replays: u64,
    /// Captures that failed
    pub failures: u64,
    /// Graphs dropped to make room for new signatures
    pub evictions: u64,
    /// Signatures currently cached, including failed ones
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    captures: AtomicU64,
    replays: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
}

/// Captured graph and the buffers it is bound to
struct CapturedEntry {
    signature: ShapeSignature,
    exec: GraphExec,
    /// Input holders; tensor arguments are copied into these before replay
    holders: CallArgs,
    /// Buffers the graph writes its results to
    outputs: Vec<Tensor>,
}

enum SlotState {
    Empty,
    Ready(CapturedEntry),
    Failed(Error),
}

/// Per-signature slot; its lock serializes capture and replay
struct SignatureSlot {
    state: Mutex<SlotState>,
}

impl SignatureSlot {
    /// No capture or replay holds the slot
    fn is_idle(&self) -> bool {
        self.state.try_lock().is_some()
    }
}

/// Executable that captures once per shape signature and replays afterwards
pub struct CapturingExecutor {
    name: String,
    inner: Arc<dyn Executable>,
    slots: Mutex<LruCache<ShapeSignature, Arc<SignatureSlot>>>,
    /// Slots kept once idle ones can be evicted; `None` keeps every signature
    max_graphs: Option<NonZeroUsize>,
    /// Held exclusively while recording so no replay lands in a capture
    capture_gate: RwLock<()>,
    counters: Counters,
}

impl CapturingExecutor {
    pub fn new(inner: Arc<dyn Executable>, options: CaptureOptions) -> Self {
        Self {
            name: format!("captured:{}", inner.name()),
            inner,
            slots: Mutex::new(LruCache::unbounded()),
            max_graphs: NonZeroUsize::new(options.max_graphs),
            capture_gate: RwLock::new(()),
            counters: Counters::default(),
        }
    }

    pub fn inner(&self) -> &Arc<dyn Executable> {
        &self.inner
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            captures: self.counters.captures.load(Ordering::Relaxed),
            replays: self.counters.replays.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Number of cached signatures
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, signature: &ShapeSignature) -> bool {
        self.slots.lock().contains(signature)
    }

    /// Forgets one signature so the next call captures it again
    pub fn reset_signature(&self, signature: &ShapeSignature) -> bool {
        self.slots.lock().pop(signature).is_some()
    }

    /// Forgets every signature
    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    /// Slot for `signature`, inserting an empty one if needed
    fn slot(&self, signature: &ShapeSignature) -> Arc<SignatureSlot> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(signature) {
            return slot.clone();
        }

        let slot = Arc::new(SignatureSlot {
            state: Mutex::new(SlotState::Empty),
        });
        slots.put(signature.clone(), slot.clone());
        self.evict_idle(&mut slots, signature);
        slot
    }

    /// Drops least recently used idle slots until the cache fits its bound
    ///
    /// Slots in the middle of a capture or replay are never evicted, so the
    /// cache may exceed its bound until they finish and a later insertion
    /// trims it.
    fn evict_idle(&self, slots: &mut LruCache<ShapeSignature, Arc<SignatureSlot>>, keep: &ShapeSignature) {
        let Some(limit) = self.max_graphs else {
            return;
        };
        while slots.len() > limit.get() {
            let victim = slots
                .iter()
                .rev()
                .find(|(signature, slot)| *signature != keep && slot.is_idle())
                .map(|(signature, _)| signature.clone());
            match victim {
                Some(signature) => {
                    slots.pop(&signature);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!("Evicted captured graph for {}", signature);
                }
                None => {
                    debug!("{} busy signatures exceed the bound of {}", slots.len(), limit);
                    break;
                }
            }
        }
    }

    fn capture(&self, stream: &Stream, args: &CallArgs, signature: &ShapeSignature) -> Result<CapturedEntry> {
        let start = Instant::now();

        // Holders are private copies; the caller's tensors are never captured
        let holders = args.map_tensors(|_, tensor| stream.clone_tensor(tensor))?;

        // Warmup absorbs first-use side effects such as weight uploads
        stream.begin_journal();
        let warmup = self.inner.call(stream, &holders);
        let journal = stream.end_journal();
        warmup?;

        stream.synchronize()?;
        stream.begin_capture()?;
        let recorded = self.inner.call(stream, &holders);
        let graph = stream.end_capture();
        let outputs = recorded?;
        let graph = graph?;

        let schedule = graph.schedule();
        if let Some(detail) = first_divergence(&journal, &schedule) {
            return Err(Error::CaptureInconsistency {
                signature: signature.to_string(),
                detail,
            });
        }

        let exec = graph.instantiate();
        info!(
            "Captured {} for {} ({} launches) in {}",
            self.inner.name(),
            signature,
            exec.len(),
            format_duration(start.elapsed())
        );

        Ok(CapturedEntry {
            signature: signature.clone(),
            exec,
            holders,
            outputs,
        })
    }

    /// Runs the graph on the entry's holders and waits for it
    ///
    /// Holders and graph outputs are shared by every stream replaying the
    /// entry, so the copies and the graph must have executed before the slot
    /// is released.
    fn replay(&self, stream: &Stream, args: &CallArgs, entry: &CapturedEntry) -> Result<Vec<Tensor>> {
        for (key, tensor) in args.tensors() {
            let holder = entry.holders.tensor(&key).ok_or_else(|| {
                Error::Internal(format!("no input holder for {} in {}", key, entry.signature))
            })?;
            stream.copy(tensor, holder)?;
        }
        stream.launch_graph(&entry.exec)?;

        let outputs = entry
            .outputs
            .iter()
            .map(|output| stream.clone_tensor(output))
            .collect::<Result<Vec<_>>>()?;
        stream.synchronize()?;
        Ok(outputs)
    }
}

/// Describes the first launch where the recorded schedule leaves the warmup journal
fn first_divergence(journal: &[ScheduleEntry], schedule: &[ScheduleEntry]) -> Option<String> {
    for (index, (expected, recorded)) in journal.iter().zip(schedule).enumerate() {
        if expected != recorded {
            return Some(format!(
                "launch {} was {} during warmup but {} during capture",
                index, expected, recorded
            ));
        }
    }
    match journal.len().cmp(&schedule.len()) {
        std::cmp::Ordering::Equal => None,
        std::cmp::Ordering::Less => Some(format!(
            "launch {} ({}) was recorded but never issued during warmup",
            journal.len(),
            schedule[journal.len()]
        )),
        std::cmp::Ordering::Greater => Some(format!(
            "launch {} ({}) was issued during warmup but never recorded",
            schedule.len(),
            journal[schedule.len()]
        )),
    }
}

impl Executable for CapturingExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, stream: &Stream, args: &CallArgs) -> Result<Vec<Tensor>> {
        let signature = ShapeSignature::from_args(args)?;
        let slot = self.slot(&signature);
        let mut state = slot.state.lock();

        match &*state {
            SlotState::Ready(entry) => {
                if entry.signature != signature {
                    return Err(Error::SignatureCollision(format!(
                        "entry captured for {} served lookup of {}",
                        entry.signature, signature
                    )));
                }
                self.counters.replays.fetch_add(1, Ordering::Relaxed);
                let _gate = self.capture_gate.read();
                return self.replay(stream, args, entry);
            }
            SlotState::Failed(error) => return Err(error.duplicate()),
            SlotState::Empty => {}
        }

        let _gate = self.capture_gate.write();
        match self.capture(stream, args, &signature) {
            Ok(entry) => {
                self.counters.captures.fetch_add(1, Ordering::Relaxed);
                let outputs = self.replay(stream, args, &entry);
                *state = SlotState::Ready(entry);
                outputs
            }
            Err(error) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Capture of {} for {} failed: {}", self.inner.name(), signature, error);
                *state = SlotState::Failed(error.duplicate());
                Err(error)
            }
        }
    }
}
