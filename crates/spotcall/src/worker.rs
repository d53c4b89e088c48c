//! Background cycle processing.
//!
//! A [`CycleWorker`] owns a [`Session`] on a dedicated thread. Image sets are
//! queued with [`CycleWorker::submit`] and processed strictly in order; after
//! spot detection the thread blocks until [`CycleWorker::decide`] delivers a
//! basis decision. Progress and call results come back as [`WorkerEvent`]s.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::basis::BasisSpots;
use crate::image_set::ImageSet;
use crate::pipeline::BaseCallingResult;
use crate::segment::RoiDetectConfig;
use crate::session::{CycleOutcome, Session};

// ── Error type ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum WorkerError {
    Spawn(std::io::Error),
    /// The worker no longer accepts input.
    Stopped,
    Panicked,
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "failed to spawn cycle worker: {}", e),
            Self::Stopped => write!(f, "cycle worker has stopped"),
            Self::Panicked => write!(f, "cycle worker panicked"),
        }
    }
}

impl std::error::Error for WorkerError {}

// ── Messages ───────────────────────────────────────────────────────────────

/// Operator answer after spot detection.
#[derive(Debug, Clone, PartialEq)]
pub enum BasisDecision {
    Confirm(BasisSpots),
    Redo(RoiDetectConfig),
}

enum Control {
    Decision(BasisDecision),
    Abort,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Calibrated { cycle: u32 },
    SpotsDetected { cycle: u32, n_spots: usize },
    BasisConfirmed { n_features: usize, condition_number: f64 },
    Measured {
        cycle: u32,
        rows: usize,
        sink_failures: usize,
    },
    /// Calls over every cycle measured so far, emitted after `cycle`.
    Called {
        cycle: u32,
        result: Box<BaseCallingResult>,
    },
    Failed { cycle: u32, message: String },
}

// ── Gate ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct GateState {
    paused: bool,
    aborted: bool,
}

/// Pause/resume switch the worker waits on between cycles.
#[derive(Debug, Default)]
pub struct ProcessingGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl ProcessingGate {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pause(&self) {
        self.lock().paused = true;
    }

    pub fn resume(&self) {
        self.lock().paused = false;
        self.changed.notify_all();
    }

    pub fn abort(&self) {
        self.lock().aborted = true;
        self.changed.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    /// Block while paused. Returns `false` once aborted.
    pub fn wait_ready(&self) -> bool {
        let mut state = self.lock();
        while state.paused && !state.aborted {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        !state.aborted
    }
}

// ── Worker ─────────────────────────────────────────────────────────────────

pub struct CycleWorker {
    images: Option<mpsc::Sender<ImageSet>>,
    control: mpsc::Sender<Control>,
    events: mpsc::Receiver<WorkerEvent>,
    gate: Arc<ProcessingGate>,
    handle: Option<JoinHandle<Session>>,
}

impl CycleWorker {
    pub fn spawn(session: Session) -> Result<Self, WorkerError> {
        let (images_tx, images_rx) = mpsc::channel::<ImageSet>();
        let (control_tx, control_rx) = mpsc::channel::<Control>();
        let (events_tx, events_rx) = mpsc::channel::<WorkerEvent>();
        let gate = Arc::new(ProcessingGate::default());

        let thread_gate = gate.clone();
        let handle = std::thread::Builder::new()
            .name("spotcall-cycles".into())
            .spawn(move || worker_loop(session, images_rx, control_rx, events_tx, &thread_gate))
            .map_err(WorkerError::Spawn)?;

        Ok(Self {
            images: Some(images_tx),
            control: control_tx,
            events: events_rx,
            gate,
            handle: Some(handle),
        })
    }

    /// Queue the image set of the next cycle.
    pub fn submit(&self, images: ImageSet) -> Result<(), WorkerError> {
        if self.gate.is_aborted() {
            return Err(WorkerError::Stopped);
        }
        self.images
            .as_ref()
            .ok_or(WorkerError::Stopped)?
            .send(images)
            .map_err(|_| WorkerError::Stopped)
    }

    pub fn decide(&self, decision: BasisDecision) -> Result<(), WorkerError> {
        self.control
            .send(Control::Decision(decision))
            .map_err(|_| WorkerError::Stopped)
    }

    pub fn events(&self) -> &mpsc::Receiver<WorkerEvent> {
        &self.events
    }

    pub fn gate(&self) -> &ProcessingGate {
        &self.gate
    }

    /// Stop accepting cycles. The cycle in flight completes; queued cycles
    /// are dropped.
    pub fn abort(&self) {
        self.gate.abort();
        // wakes a thread blocked on a basis decision
        let _ = self.control.send(Control::Abort);
    }

    /// Process every queued cycle, stop the thread and return the session.
    /// A pending basis decision is cancelled.
    pub fn finish(mut self) -> Result<Session, WorkerError> {
        self.images = None;
        let _ = self.control.send(Control::Abort);
        let handle = self.handle.take().ok_or(WorkerError::Stopped)?;
        handle.join().map_err(|_| WorkerError::Panicked)
    }
}

impl Drop for CycleWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.abort();
            self.images = None;
            let _ = handle.join();
        }
    }
}

fn send(tx: &mpsc::Sender<WorkerEvent>, event: WorkerEvent) {
    let _ = tx.send(event);
}

fn worker_loop(
    mut session: Session,
    images: mpsc::Receiver<ImageSet>,
    control: mpsc::Receiver<Control>,
    tx: mpsc::Sender<WorkerEvent>,
    gate: &ProcessingGate,
) -> Session {
    while let Ok(set) = images.recv() {
        if !gate.wait_ready() {
            break;
        }
        let cycle = set.cycle();
        tracing::debug!("Worker: processing cycle {}", cycle);
        match session.ingest(set) {
            Ok(CycleOutcome::Calibration { cycle }) => {
                send(&tx, WorkerEvent::Calibrated { cycle });
            }
            Ok(CycleOutcome::SpotsDetected { cycle, n_spots }) => {
                send(&tx, WorkerEvent::SpotsDetected { cycle, n_spots });
                if !await_basis(&mut session, &control, &tx, gate) {
                    break;
                }
                emit_calls(&session, cycle, &tx);
            }
            Ok(CycleOutcome::Measured {
                cycle,
                rows,
                sink_failures,
            }) => {
                send(
                    &tx,
                    WorkerEvent::Measured {
                        cycle,
                        rows,
                        sink_failures,
                    },
                );
                emit_calls(&session, cycle, &tx);
            }
            Err(e) => {
                tracing::warn!("Cycle {} rejected: {}", cycle, e);
                send(
                    &tx,
                    WorkerEvent::Failed {
                        cycle,
                        message: e.to_string(),
                    },
                );
            }
        }
        if gate.is_aborted() {
            tracing::info!("Worker aborted after cycle {}", cycle);
            break;
        }
    }
    session.close();
    session
}

/// Wait for the operator until the basis is confirmed. Returns `false` when
/// aborted.
fn await_basis(
    session: &mut Session,
    control: &mpsc::Receiver<Control>,
    tx: &mpsc::Sender<WorkerEvent>,
    gate: &ProcessingGate,
) -> bool {
    while let Ok(msg) = control.recv() {
        let decision = match msg {
            Control::Abort => return false,
            Control::Decision(d) => d,
        };
        if gate.is_aborted() {
            return false;
        }
        match decision {
            BasisDecision::Confirm(spots) => match session.confirm_basis(&spots) {
                Ok(basis) => {
                    send(
                        tx,
                        WorkerEvent::BasisConfirmed {
                            n_features: basis.n_features(),
                            condition_number: basis.condition_number(),
                        },
                    );
                    return true;
                }
                Err(e) => send(
                    tx,
                    WorkerEvent::Failed {
                        cycle: 1,
                        message: e.to_string(),
                    },
                ),
            },
            BasisDecision::Redo(roi) => match session.redo_spot_detection(roi) {
                Ok(n_spots) => send(tx, WorkerEvent::SpotsDetected { cycle: 1, n_spots }),
                Err(e) => send(
                    tx,
                    WorkerEvent::Failed {
                        cycle: 1,
                        message: e.to_string(),
                    },
                ),
            },
        }
    }
    false
}

fn emit_calls(session: &Session, cycle: u32, tx: &mpsc::Sender<WorkerEvent>) {
    match session.base_call() {
        Ok(result) => send(
            tx,
            WorkerEvent::Called {
                cycle,
                result: Box::new(result),
            },
        ),
        Err(e) => {
            tracing::warn!("Base calling after cycle {} failed: {}", cycle, e);
            send(
                tx,
                WorkerEvent::Failed {
                    cycle,
                    message: e.to_string(),
                },
            );
        }
    }
}
