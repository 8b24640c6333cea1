//! Tracing setup with credential redaction
//!
//! Every formatted line passes through a [`CredentialRedactor`] before it is
//! written, so server URLs with embedded user-info, `Authorization` headers and
//! account e-mail addresses never reach the log sink in clear text.
//!
//! ```rust,no_run
//! use logger_redacted::{init, LoggerConfig};
//!
//! let installed = init(&LoggerConfig { enabled: true, ..LoggerConfig::default() })?;
//! tracing::info!(url = %logger_redacted::redact_url("https://admin:pw@host/api"), "GET");
//! // Output: url=https://***@host/api GET
//! # Ok::<(), logger_redacted::LoggerError>(())
//! ```

pub mod config;
pub mod redactor;

pub use config::*;
pub use redactor::*;

use std::io::{self, Write};
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Invalid log filter '{directive}': {message}")]
    InvalidFilter { directive: String, message: String },
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` when another subscriber was installed first.
pub fn init(config: &LoggerConfig) -> Result<bool, LoggerError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| LoggerError::InvalidFilter {
            directive: config.level.clone(),
            message: e.to_string(),
        })?,
    };

    let writer = RedactingMakeWriter::new(config.redaction_enabled.then(CredentialRedactor::default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    Ok(result.is_ok())
}

/// Hands out stderr writers that redact each formatted event
#[derive(Clone)]
pub struct RedactingMakeWriter {
    redactor: Option<Arc<CredentialRedactor>>,
}

impl RedactingMakeWriter {
    pub fn new(redactor: Option<CredentialRedactor>) -> Self {
        Self {
            redactor: redactor.map(Arc::new),
        }
    }
}

impl<'a> MakeWriter<'a> for RedactingMakeWriter {
    type Writer = RedactingWriter<io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(io::stderr(), self.redactor.clone())
    }
}

/// Writes redacted text to the wrapped sink.
/// The fmt layer writes one complete event per call.
pub struct RedactingWriter<W> {
    inner: W,
    redactor: Option<Arc<CredentialRedactor>>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W, redactor: Option<Arc<CredentialRedactor>>) -> Self {
        Self { inner, redactor }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.redactor {
            Some(redactor) => {
                let text = String::from_utf8_lossy(buf);
                self.inner.write_all(redactor.redact(&text).as_bytes())?;
                Ok(buf.len())
            }
            None => self.inner.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
