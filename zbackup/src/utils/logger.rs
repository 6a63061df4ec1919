//! Logging configuration using tracing.
//!
//! Events go to stdout, to an optional local file, and to the run log: a
//! per-thread writer the runner points at the destination while a run is
//! in progress.

use crate::fs::FileWriter;
use crate::utils::Result;
use indicatif::ProgressBar;
use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Bar currently drawn on the terminal; stdout lines are printed around it
static CONSOLE_BAR: Mutex<Option<ProgressBar>> = Mutex::new(None);

thread_local! {
    static RUN_LOG: RefCell<Option<Box<dyn FileWriter>>> = const { RefCell::new(None) };
}

/// Initialize logging with the specified level, optionally mirroring output to a file
pub fn init(level: &str, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::create(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(|| ConsoleWriter))
        .with(file_layer)
        .with(run_log_layer())
        .init();

    Ok(())
}

/// Plain-text layer feeding the current thread's run log
fn run_log_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer().with_ansi(false).with_writer(|| RunLogWriter)
}

/// Print stdout log lines around `bar` until it is cleared with `None`
pub fn set_console_bar(bar: Option<ProgressBar>) {
    *CONSOLE_BAR.lock().unwrap_or_else(PoisonError::into_inner) = bar;
}

/// Send this thread's events to `writer` until the guard is finished or dropped.
/// Either way the writer is committed.
pub fn attach_run_log(writer: Box<dyn FileWriter>) -> RunLogGuard {
    RUN_LOG.with(|slot| *slot.borrow_mut() = Some(writer));
    RunLogGuard { _thread: PhantomData }
}

/// Keeps the run log attached; bound to the thread that attached it
pub struct RunLogGuard {
    _thread: PhantomData<*const ()>,
}

impl RunLogGuard {
    /// Detach the run log and commit it
    pub fn finish(self) -> Result<()> {
        match detach_run_log() {
            Some(writer) => writer.commit(),
            None => Ok(()),
        }
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if let Some(writer) = detach_run_log() {
            let _ = writer.commit();
        }
    }
}

fn detach_run_log() -> Option<Box<dyn FileWriter>> {
    RUN_LOG.try_with(|slot| slot.borrow_mut().take()).ok().flatten()
}

struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let bar = CONSOLE_BAR.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match bar {
            Some(bar) => bar.suspend(|| io::stdout().write(buf)),
            None => io::stdout().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

/// Writes to the run log attached to this thread, if any
struct RunLogWriter;

impl Write for RunLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = RUN_LOG.try_with(|slot| match slot.try_borrow_mut() {
            Ok(mut slot) => match slot.as_mut() {
                Some(writer) => writer.write(buf),
                None => Ok(buf.len()),
            },
            // An event raised while the run log itself is writing
            Err(_) => Ok(buf.len()),
        });
        written.unwrap_or(Ok(buf.len()))
    }

    fn flush(&mut self) -> io::Result<()> {
        let flushed = RUN_LOG.try_with(|slot| match slot.try_borrow_mut() {
            Ok(mut slot) => slot.as_mut().map_or(Ok(()), |writer| writer.flush()),
            Err(_) => Ok(()),
        });
        flushed.unwrap_or(Ok(()))
    }
}
