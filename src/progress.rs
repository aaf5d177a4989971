//! Progress events streamed from the image builder and registry operations.
//!
//! Callers receive events through a single first-class callback value; there
//! is no subclass hook. The callback's return value is the cancellation
//! channel.

use std::panic::{AssertUnwindSafe, catch_unwind};

use log::warn;

/// A tagged record describing one observed unit of daemon output.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A `Step N/M` build announcement.
    Step {
        step: u32,
        total_steps: u32,
        message: String,
        /// Seconds since the build started.
        elapsed_secs: u64,
    },

    /// Layer download or extraction during a build.
    Download {
        message: String,
        percent: Option<f32>,
    },

    /// Per-layer status during a push (`Pushing`, `Pushed`, ...).
    PushStatus {
        status: String,
        layer: Option<String>,
        percent: Option<f32>,
    },

    Error { message: String },

    /// Terminal success.
    Complete { message: String },
}

/// What the callback wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Continue,
    Cancel,
}

/// The callback value passed into builds and pushes.
pub type ProgressHandler<'a> = dyn FnMut(&ProgressEvent) -> Signal + 'a;

/// Invoke the handler, swallowing panics: a broken progress renderer must
/// never take the operation down with it.
pub fn notify(handler: &mut ProgressHandler<'_>, event: &ProgressEvent) -> Signal {
    match catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(signal) => signal,
        Err(_) => {
            warn!("progress callback panicked; continuing");
            Signal::Continue
        }
    }
}
