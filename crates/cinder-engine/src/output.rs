//! Output streams that engine `print` / `io.write` write to.
//!
//! An [`OutputStream`] is a cheaply clonable handle to a shared writer.
//! Clones compare equal with [`OutputStream::same_stream`], which is how the
//! stream redirector detects out-of-order releases.
//!
//! # Example
//!
//! ```
//! use cinder_engine::{CaptureBuffer, OutputStream};
//!
//! let buffer = CaptureBuffer::new();
//! let stream = OutputStream::capture(&buffer);
//! stream.write_text("hello\n").expect("write");
//! assert_eq!(buffer.contents(), "hello\n");
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

/// Shared, clonable text sink.
///
/// Text is always written UTF-8 encoded; invalid byte sequences coming from
/// Lua strings are replaced with U+FFFD before they reach the writer.
#[derive(Clone)]
pub struct OutputStream {
    label: Arc<str>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl OutputStream {
    /// Wraps an arbitrary writer.
    pub fn new(label: impl Into<String>, writer: impl Write + Send + 'static) -> Self {
        let label: String = label.into();
        Self {
            label: Arc::from(label),
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Stream writing to the process standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new("stdout", io::stdout())
    }

    /// Stream that discards everything.
    #[must_use]
    pub fn sink() -> Self {
        Self::new("sink", io::sink())
    }

    /// Stream appending to an in-memory [`CaptureBuffer`].
    #[must_use]
    pub fn capture(buffer: &CaptureBuffer) -> Self {
        Self::new("capture", buffer.clone())
    }

    /// Human-readable label (used in logs).
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns true if both handles point at the same underlying writer.
    #[must_use]
    pub fn same_stream(&self, other: &OutputStream) -> bool {
        Arc::ptr_eq(&self.writer, &other.writer)
    }

    /// Writes text and flushes.
    ///
    /// # Errors
    ///
    /// Returns the writer's I/O error.
    pub fn write_text(&self, text: &str) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(text.as_bytes())?;
        writer.flush()
    }

    /// Writes raw bytes (from a Lua string), replacing invalid UTF-8.
    ///
    /// # Errors
    ///
    /// Returns the writer's I/O error.
    pub fn write_lossy(&self, bytes: &[u8]) -> io::Result<()> {
        self.write_text(&String::from_utf8_lossy(bytes))
    }
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl Default for OutputStream {
    fn default() -> Self {
        Self::stdout()
    }
}

/// In-memory byte buffer usable as an output sink.
///
/// Clones share the same storage, so a host can keep one clone and hand
/// another to [`OutputStream::capture`].
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns everything written so far.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }

    /// Returns true if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.lock().is_empty()
    }

    /// Discards the buffered bytes.
    pub fn clear(&self) {
        self.bytes.lock().clear();
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
