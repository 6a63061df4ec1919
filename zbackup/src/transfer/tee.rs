//! Fan-out writer used while copying a file.

use crate::executor::verify::Digester;
use crate::transfer::progress::Progress;
use std::io::{self, Write};

/// Writes to the destination and mirrors every accepted chunk to the
/// progress reporter and, when verifying, to a digester.
pub struct TeeWriter<'a, W: Write> {
    inner: W,
    progress: &'a dyn Progress,
    digester: Option<&'a mut Digester>,
    written: u64,
}

impl<'a, W: Write> TeeWriter<'a, W> {
    pub fn new(inner: W, progress: &'a dyn Progress, digester: Option<&'a mut Digester>) -> Self {
        Self {
            inner,
            progress,
            digester,
            written: 0,
        }
    }

    /// Bytes accepted by the destination so far
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for TeeWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if let Some(digester) = self.digester.as_deref_mut() {
            digester.update(&buf[..n]);
        }
        self.progress.add_bytes(n as u64);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
