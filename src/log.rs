//! Logging hook used by sessions and sink callbacks.
//!
//! Sessions hold an `Arc<dyn Logger>`; the default [`TracingLogger`] forwards into the
//! `tracing` ecosystem so the host decides where output goes.

use std::fmt::{self, Arguments};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        })
    }
}

pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, args: Arguments<'_>);

    fn trace(&self, args: Arguments<'_>) {
        self.log(LogLevel::Trace, args)
    }

    fn debug(&self, args: Arguments<'_>) {
        self.log(LogLevel::Debug, args)
    }

    fn info(&self, args: Arguments<'_>) {
        self.log(LogLevel::Info, args)
    }

    fn warn(&self, args: Arguments<'_>) {
        self.log(LogLevel::Warn, args)
    }

    fn error(&self, args: Arguments<'_>) {
        self.log(LogLevel::Error, args)
    }
}

/// Forwards to `tracing`. `Fatal` has no tracing level and is emitted as an error
/// event tagged `fatal = true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, args: Arguments<'_>) {
        match level {
            LogLevel::Trace => tracing::trace!("{}", args),
            LogLevel::Debug => tracing::debug!("{}", args),
            LogLevel::Info => tracing::info!("{}", args),
            LogLevel::Warn => tracing::warn!("{}", args),
            LogLevel::Error => tracing::error!("{}", args),
            LogLevel::Fatal => tracing::error!(fatal = true, "{}", args),
        }
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpLogger;

impl Logger for NoOpLogger {
    #[inline]
    fn log(&self, _level: LogLevel, _args: Arguments<'_>) {}
}
