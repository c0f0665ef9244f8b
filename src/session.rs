//! Connection session: one provider connection plus the asynchronous calls running on it.
//!
//! ```text
//! Created --connect--> Connected --release--> Released
//!    |                                            ^
//!    +------------------release-------------------+
//! ```
//!
//! A failed `connect` leaves the session in `Created`. Queries, synchronous or not, do not
//! change the state; several asynchronous queries may be outstanding at once, each tracked
//! by its own sink.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    log::{LogLevel, Logger},
    provider::{
        ConnectParams, Locator, NativeObject, NativeSink, Provider, ProviderConnection, QueryMode,
    },
    sink::EventSink,
    Error, Result,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Connected,
    Released,
}

struct Inner {
    state: SessionState,
    locator: Option<Arc<dyn Locator>>,
    connection: Option<Arc<dyn ProviderConnection>>,
    sinks: Vec<Arc<EventSink>>,
}

impl Inner {
    fn live_connection(&self) -> Result<Arc<dyn ProviderConnection>> {
        match (self.state, &self.connection) {
            (SessionState::Connected, Some(conn)) => Ok(conn.clone()),
            (SessionState::Released, _) => Err(Error::InvalidState("session is released".into())),
            _ => Err(Error::InvalidState("session is not connected".into())),
        }
    }
}

pub struct Session {
    handle: AtomicU64,
    provider: Arc<dyn Provider>,
    logger: Arc<dyn Logger>,
    inner: Mutex<Inner>,
}

impl Session {
    pub fn new(provider: Arc<dyn Provider>, logger: Arc<dyn Logger>) -> Arc<Self> {
        Arc::new(Self {
            handle: AtomicU64::new(0),
            provider,
            logger,
            inner: Mutex::new(Inner {
                state: SessionState::Created,
                locator: None,
                connection: None,
                sinks: Vec::new(),
            }),
        })
    }

    /// Registry key, `0` until registered.
    pub fn handle(&self) -> u64 {
        self.handle.load(Ordering::Acquire)
    }

    pub(crate) fn set_handle(&self, handle: u64) {
        self.handle.store(handle, Ordering::Release);
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// A session is alive while it holds a provider connection.
    pub fn is_alive(&self) -> bool {
        self.inner.lock().connection.is_some()
    }

    pub fn sink_count(&self) -> usize {
        self.inner.lock().sinks.len()
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }

    pub fn connect(&self, params: &ConnectParams) -> Result<()> {
        {
            let inner = self.inner.lock();
            match inner.state {
                SessionState::Created => {}
                SessionState::Connected => {
                    return Err(Error::InvalidState("session is already connected".into()))
                }
                SessionState::Released => {
                    return Err(Error::InvalidState("session is released".into()))
                }
            }
        }

        let resource = params.network_resource();
        let established = self
            .provider
            .create_locator()
            .and_then(|locator| Ok((locator.connect(params)?, locator)))
            .map_err(connection_error);
        let (connection, locator) = match established {
            Ok(pair) => pair,
            Err(e) => {
                self.write_log(
                    LogLevel::Error,
                    format_args!("cannot connect to '{resource}': {e}"),
                    e.code(),
                );
                return Err(e);
            }
        };

        let mut inner = self.inner.lock();
        // release() may have run while the provider was connecting
        if inner.state != SessionState::Created {
            return Err(Error::InvalidState(
                "session changed state while connecting".into(),
            ));
        }
        inner.state = SessionState::Connected;
        inner.locator = Some(locator);
        inner.connection = Some(connection);
        drop(inner);

        self.write_log(
            LogLevel::Debug,
            format_args!("connected to '{resource}'"),
            None,
        );
        Ok(())
    }

    /// Runs `query` and blocks until the provider has produced the whole result set.
    ///
    /// `sync = false` asks the provider for a semi-synchronous enumerator; the result set is
    /// still drained before returning.
    pub fn execute_query(&self, query: &str, sync: bool) -> Result<Vec<Arc<dyn NativeObject>>> {
        let connection = self.inner.lock().live_connection()?;
        let mode = if sync {
            QueryMode::Synchronous
        } else {
            QueryMode::SemiSynchronous
        };

        let run = || -> Result<Vec<Arc<dyn NativeObject>>> {
            let mut results = connection.exec_query(query, mode)?;
            let mut objects = Vec::new();
            while let Some(obj) = results.next()? {
                objects.push(obj);
            }
            Ok(objects)
        };
        run().map_err(query_error).inspect_err(|e| {
            self.write_log(
                LogLevel::Error,
                format_args!("query '{query}' failed: {e}"),
                e.code(),
            )
        })
    }

    /// Registers `sink` and starts the provider's asynchronous call.
    ///
    /// The sink is registered before the call so a terminal status that races the return
    /// still finds it. If the provider refuses the call, the sink is unregistered again.
    pub(crate) fn execute_query_async(&self, query: &str, sink: Arc<EventSink>) -> Result<()> {
        let connection = {
            let mut inner = self.inner.lock();
            let connection = inner.live_connection()?;
            inner.sinks.push(sink.clone());
            connection
        };

        let native: Arc<dyn NativeSink> = sink.clone();
        if let Err(e) = connection.exec_query_async(query, sink.send_status(), native) {
            self.remove_sink(&sink);
            let e = query_error(e);
            self.write_log(
                LogLevel::Error,
                format_args!("async query '{query}' failed to start: {e}"),
                e.code(),
            );
            return Err(e);
        }
        self.write_log(
            LogLevel::Trace,
            format_args!("async query started on sink {}", sink.id()),
            None,
        );
        Ok(())
    }

    /// Snapshot of the outstanding sinks.
    pub(crate) fn sinks(&self) -> Result<Vec<Arc<EventSink>>> {
        let inner = self.inner.lock();
        if inner.state == SessionState::Released {
            return Err(Error::InvalidState("session is released".into()));
        }
        Ok(inner.sinks.clone())
    }

    /// Unregisters `sink`. Idempotent: returns `false` when it was already gone.
    pub(crate) fn remove_sink(&self, sink: &EventSink) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.sinks.len();
        inner.sinks.retain(|s| !std::ptr::eq(Arc::as_ptr(s), sink));
        inner.sinks.len() != before
    }

    /// Cancels one outstanding call.
    ///
    /// The sink is unregistered whether or not the provider acknowledges; if nothing was
    /// delivered as terminal yet, the listener receives a cancelled status.
    pub(crate) fn cancel_sink(&self, sink: &Arc<EventSink>) -> Result<()> {
        let connection = self.inner.lock().live_connection()?;
        if !self.remove_sink(sink) {
            return Ok(());
        }
        let native: Arc<dyn NativeSink> = sink.clone();
        if let Err(e) = connection.cancel_async_call(&native) {
            self.write_log(
                LogLevel::Warn,
                format_args!("provider did not accept cancel of sink {}: {e}", sink.id()),
                e.code(),
            );
        }
        sink.cancel();
        Ok(())
    }

    /// Cancels every outstanding call and drops the connection. Idempotent.
    pub fn release(&self) {
        let (connection, locator, sinks) = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Released {
                return;
            }
            inner.state = SessionState::Released;
            (
                inner.connection.take(),
                inner.locator.take(),
                std::mem::take(&mut inner.sinks),
            )
        };

        for sink in &sinks {
            if let Some(connection) = &connection {
                let native: Arc<dyn NativeSink> = sink.clone();
                if let Err(e) = connection.cancel_async_call(&native) {
                    self.write_log(
                        LogLevel::Warn,
                        format_args!("cancel of sink {} on release failed: {e}", sink.id()),
                        e.code(),
                    );
                }
            }
            sink.cancel();
        }
        drop(connection);
        drop(locator);

        self.write_log(
            LogLevel::Debug,
            format_args!("session released ({} outstanding calls cancelled)", sinks.len()),
            None,
        );
    }

    /// Session logging hook; `code` is appended as a provider result code.
    pub fn write_log(&self, level: LogLevel, message: fmt::Arguments<'_>, code: Option<i32>) {
        let handle = self.handle();
        match code {
            Some(code) => self.logger.log(
                level,
                format_args!("[session {handle:#x}] {message} (code {code:#010x})"),
            ),
            None => self
                .logger
                .log(level, format_args!("[session {handle:#x}] {message}")),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle())
            .field("state", &self.state())
            .finish()
    }
}

fn connection_error(e: Error) -> Error {
    match e {
        Error::Provider { code, message } => Error::Connection { code, message },
        other => other,
    }
}

fn query_error(e: Error) -> Error {
    match e {
        Error::Provider { code, message } => Error::Query { code, message },
        other => other,
    }
}
