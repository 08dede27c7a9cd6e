//! Output redirection with per-invocation restore guards.
//!
//! [`StreamRedirector::attach`] switches an engine's output and returns a
//! [`StreamGuard`] remembering what was there before. Handing the guard back
//! to [`StreamRedirector::detach`] restores it. The previous stream lives in
//! a slot owned by the guard rather than in one shared engine slot, so
//! overlapping invocations each restore their own predecessor.
//!
//! Every engine keeps the stack of its active redirections:
//!
//! ```text
//! engine output: I
//! stack: [ O (previous = S0) , I (previous = O) ]
//!
//! detach(O)  ─► out of order: O leaves the stack, I.previous = S0
//! detach(I)  ─► engine output: S0
//! ```
//!
//! Releases should happen in reverse attach order. A detach whose guard is
//! not the innermost redirection is reported as
//! [`EngineError::StreamOutOfOrder`]; the engine keeps its current stream,
//! and the next redirection inherits the detached guard's previous stream,
//! so once all guards are detached the engine is back on its original one.
//!
//! # Example
//!
//! ```
//! use cinder_engine::{CaptureBuffer, EngineOptions, OutputStream, ScriptEngine, StreamRedirector};
//!
//! let engine = ScriptEngine::new(EngineOptions::default()).expect("engine");
//! let buffer = CaptureBuffer::new();
//!
//! let guard = StreamRedirector::attach(&engine, OutputStream::capture(&buffer));
//! engine.exec("print('captured')", "t").expect("exec");
//! StreamRedirector::detach(&engine, guard).expect("detach");
//!
//! assert_eq!(buffer.contents(), "captured\n");
//! assert_eq!(engine.output().label(), "stdout");
//! ```

use crate::engine::ScriptEngine;
use crate::error::EngineError;
use crate::output::OutputStream;
use cinder_types::EngineId;
use parking_lot::Mutex;
use std::sync::Arc;

/// One active redirection on an engine.
#[derive(Debug)]
pub(crate) struct Redirection {
    attached: OutputStream,
    /// Stream to restore on detach. Rewritten when an outer redirection is
    /// detached out of order.
    previous: Mutex<OutputStream>,
}

/// Restore token returned by [`StreamRedirector::attach`].
#[derive(Debug)]
#[must_use = "a stream guard must be handed back to StreamRedirector::detach"]
pub struct StreamGuard {
    engine_id: EngineId,
    redirection: Arc<Redirection>,
}

impl StreamGuard {
    /// Engine this guard belongs to.
    #[must_use]
    pub fn engine_id(&self) -> EngineId {
        self.engine_id
    }

    /// Stream the engine returns to when this guard is detached.
    #[must_use]
    pub fn previous(&self) -> OutputStream {
        self.redirection.previous.lock().clone()
    }

    /// Stream installed by the attach.
    #[must_use]
    pub fn attached(&self) -> &OutputStream {
        &self.redirection.attached
    }
}

/// Attaches and detaches engine output streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamRedirector;

impl StreamRedirector {
    /// Directs the engine's output to `sink`.
    pub fn attach(engine: &ScriptEngine, sink: OutputStream) -> StreamGuard {
        let mut stack = engine.redirections().lock();
        let previous = engine.replace_output(sink.clone());
        tracing::trace!(
            engine = %engine.id(),
            from = previous.label(),
            to = sink.label(),
            depth = stack.len() + 1,
            "Attached output stream"
        );

        let redirection = Arc::new(Redirection {
            attached: sink,
            previous: Mutex::new(previous),
        });
        stack.push(Arc::clone(&redirection));
        StreamGuard {
            engine_id: engine.id(),
            redirection,
        }
    }

    /// Restores the stream recorded in `guard`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::StreamGuardMismatch`] if the guard was created for
    ///   another engine; nothing changes
    /// - [`EngineError::StreamOutOfOrder`] if a later redirection on this
    ///   engine is still attached. The engine keeps its current stream and
    ///   the guard's previous stream passes to the next redirection.
    pub fn detach(engine: &ScriptEngine, guard: StreamGuard) -> Result<(), EngineError> {
        if guard.engine_id != engine.id() {
            return Err(EngineError::StreamGuardMismatch {
                guard: guard.engine_id,
                engine: engine.id(),
            });
        }

        let mut stack = engine.redirections().lock();
        let Some(index) = stack
            .iter()
            .position(|r| Arc::ptr_eq(r, &guard.redirection))
        else {
            return Err(EngineError::StreamOutOfOrder {
                engine: engine.id(),
            });
        };

        let previous = guard.redirection.previous.lock().clone();
        stack.remove(index);

        if let Some(next) = stack.get(index) {
            *next.previous.lock() = previous;
            tracing::debug!(
                engine = %engine.id(),
                detached = guard.redirection.attached.label(),
                "Output stream detached out of order"
            );
            return Err(EngineError::StreamOutOfOrder {
                engine: engine.id(),
            });
        }

        tracing::trace!(
            engine = %engine.id(),
            restored = previous.label(),
            "Detached output stream"
        );
        engine.replace_output(previous);
        Ok(())
    }
}
