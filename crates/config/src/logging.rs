//! Logging configuration for tether
//!
//! Terminal output and optional file logging using tracing. Every sink is
//! wrapped in a [`RedactingMakeWriter`] so secret values never reach it.

use crate::Result;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tether_core::{Error, Redactor};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Writer that masks redaction tokens before forwarding bytes
pub struct RedactingWriter<W> {
    inner: W,
    redactor: Arc<Redactor>,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // fmt layers hand over one formatted event per call
        let text = String::from_utf8_lossy(buf);
        let masked = self.redactor.redact(&text);
        self.inner.write_all(masked.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// [`MakeWriter`] wrapper producing [`RedactingWriter`]s
pub struct RedactingMakeWriter<M> {
    inner: M,
    redactor: Arc<Redactor>,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M, redactor: Arc<Redactor>) -> Self {
        Self { inner, redactor }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: self.inner.make_writer(),
            redactor: Arc::clone(&self.redactor),
        }
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize the logging system
///
/// # Arguments
/// * `verbose` - Enable debug level logging and timestamps on the terminal
/// * `log_file` - Optional path to append logs to
/// * `redactor` - Token set scrubbed from every emitted line
///
/// # Examples
/// ```ignore
/// let redactor = Arc::new(Redactor::new());
/// init(false, None, Arc::clone(&redactor))?;
/// ```
pub fn init(verbose: bool, log_file: Option<&Path>, redactor: Arc<Redactor>) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };

    // Allows overriding with RUST_LOG env var
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "tether={level},tether_core={level},tether_config={level},tether_secrets={level},tether_engine={level}"
        ))
    });

    let stderr = RedactingMakeWriter::new(io::stderr, Arc::clone(&redactor));
    let terminal_layer: BoxedLayer = if verbose {
        fmt::layer()
            .with_writer(stderr)
            .with_target(false)
            .with_thread_names(true)
            .compact()
            .with_ansi(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(stderr)
            .with_target(false)
            .without_time() // No timestamps in normal mode
            .compact()
            .with_ansi(true)
            .with_filter(env_filter)
            .boxed()
    };

    let mut layers = vec![terminal_layer];

    if let Some(log_path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| Error::path_io(log_path, e))?;

        let file_layer: BoxedLayer = fmt::layer()
            .with_writer(RedactingMakeWriter::new(Mutex::new(file), redactor))
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(EnvFilter::new("debug"))
            .boxed();
        layers.push(file_layer);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {e}")))
}
