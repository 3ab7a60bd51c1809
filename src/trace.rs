//! Diagnostic call traces for in-flight handlers.
//!
//! A tokio task has no call stack another task can walk, so each handler task
//! the middleware spawns owns a logical one: a list of [`Frame`]s, seeded with
//! an entry frame naming the handler and extended by the handler itself via
//! [`scope`] and [`enter`]. The middleware snapshots it as a
//! [`CapturedTrace`] when the client goes away.
//!
//! ```rust,no_run
//! use kube_trivy_exporter::{trace, Request, Response};
//!
//! async fn report(req: Request) -> Response {
//!     let body = trace::scope("load_report", load_report()).await;
//!     Response::json(body)
//! }
//! # async fn load_report() -> Vec<u8> { Vec::new() }
//! ```
//!
//! Outside a monitored handler task both helpers are no-ops. Frames do not
//! follow work the handler hands to other tasks with `tokio::spawn`.

use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

tokio::task_local! {
    static CURRENT: Arc<TaskStack>;
}

/// One entry of a trace: a qualified name and the source location it was
/// recorded at.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    name: &'static str,
    file: &'static str,
    line: u32,
}

impl Frame {
    pub fn new(name: &'static str, location: &'static Location<'static>) -> Self {
        Self { name, file: location.file(), line: location.line() }
    }

    pub fn name(&self) -> &'static str { self.name }
    pub fn file(&self) -> &'static str { self.file }
    pub fn line(&self) -> u32 { self.line }
}

/// A point-in-time snapshot of a handler task's frames, innermost first.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CapturedTrace {
    frames: Vec<Frame>,
}

impl CapturedTrace {
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Renders one frame per two lines:
///
/// ```text
///     kube_trivy_exporter::telemetry::endpoint::{{closure}}
///         src/main.rs:42
/// ```
impl fmt::Display for CapturedTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            writeln!(f, "    {}", frame.name)?;
            writeln!(f, "        {}:{}", frame.file, frame.line)?;
        }
        Ok(())
    }
}

/// The live frame list of one handler task.
#[derive(Debug)]
pub(crate) struct TaskStack {
    next_id: AtomicU64,
    // Outermost first. Entries carry an id because frames opened by
    // concurrently polled futures inside one task do not close in LIFO order.
    frames: Mutex<Vec<(u64, Frame)>>,
}

impl TaskStack {
    pub(crate) fn with_entry(entry: Frame) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            frames: Mutex::new(vec![(0, entry)]),
        })
    }

    fn push(self: &Arc<Self>, frame: Frame) -> FrameGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.frames.lock().unwrap_or_else(PoisonError::into_inner).push((id, frame));
        FrameGuard { stack: Arc::clone(self), id }
    }

    fn remove(&self, id: u64) {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = frames.iter().rposition(|(frame_id, _)| *frame_id == id) {
            frames.remove(pos);
        }
    }

    pub(crate) fn snapshot(&self) -> CapturedTrace {
        let frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        CapturedTrace {
            frames: frames.iter().rev().map(|(_, frame)| frame.clone()).collect(),
        }
    }
}

/// Keeps a frame on the current task's trace until dropped.
#[must_use = "the frame is removed as soon as the guard is dropped"]
#[derive(Debug)]
pub struct FrameGuard {
    stack: Arc<TaskStack>,
    id: u64,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.stack.remove(self.id);
    }
}

/// Runs `fut` with `stack` as the task's trace.
pub(crate) fn instrument<F: Future>(
    stack: Arc<TaskStack>,
    fut: F,
) -> impl Future<Output = F::Output> {
    CURRENT.scope(stack, fut)
}

/// Pushes a frame named `name` at the caller's location onto the current
/// task's trace. The frame stays until the returned guard is dropped.
///
/// Returns `None` outside a monitored handler task.
#[track_caller]
pub fn enter(name: &'static str) -> Option<FrameGuard> {
    let frame = Frame::new(name, Location::caller());
    CURRENT.try_with(|stack| stack.push(frame)).ok()
}

/// Wraps `fut` so that a frame named `name`, located at the caller, is on
/// the task's trace for as long as `fut` runs.
#[track_caller]
pub fn scope<F: Future>(name: &'static str, fut: F) -> impl Future<Output = F::Output> {
    let location = Location::caller();
    async move {
        let _frame = CURRENT
            .try_with(|stack| stack.push(Frame::new(name, location)))
            .ok();
        fut.await
    }
}
