//! Per-call event sink: relays provider callbacks to a managed listener.
//!
//! Callbacks arrive on provider threads. Each one attaches its thread for the duration of
//! the delivery, marshals, calls the listener and detaches again. Deliveries for one sink
//! are serialized; the terminal status is delivered exactly once, after which the sink
//! unregisters itself and drops its listener reference.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use parking_lot::ReentrantMutex;

use crate::{
    bridge::Shared,
    log::{LogLevel, Logger},
    managed::{AttachGuard, JValue, ManagedEnv, ObjectRef},
    marshal::Marshaller,
    provider::{codes, status, NativeObject, NativeSink},
    session::Session,
    Result,
};

pub struct EventSink {
    id: u64,
    listener: ObjectRef,
    send_status: bool,
    session: Weak<Session>,
    shared: Weak<Shared>,
    // reentrant: a listener may cancel its own call from inside a delivery
    delivery: ReentrantMutex<()>,
    finished: AtomicBool,
}

impl EventSink {
    /// `listener` must be a global reference; the sink owns it from here on.
    pub(crate) fn new(
        id: u64,
        listener: ObjectRef,
        send_status: bool,
        session: &Arc<Session>,
        shared: &Arc<Shared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            listener,
            send_status,
            session: Arc::downgrade(session),
            shared: Arc::downgrade(shared),
            delivery: ReentrantMutex::new(()),
            finished: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn listener(&self) -> ObjectRef {
        self.listener
    }

    pub fn send_status(&self) -> bool {
        self.send_status
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Delivers a cancelled terminal status unless a terminal status already went out.
    pub(crate) fn cancel(&self) {
        self.on_set_status(
            status::WBEM_STATUS_COMPLETE,
            codes::WBEM_E_CALL_CANCELLED,
            None,
            None,
        );
    }

    /// Retires a sink whose call never started. Nothing is delivered.
    pub(crate) fn discard(&self, env: &dyn ManagedEnv) {
        let _order = self.delivery.lock();
        if !self.finished.swap(true, Ordering::AcqRel) {
            env.delete_global_ref(self.listener);
        }
    }

    fn on_indicate(&self, objects: &[Arc<dyn NativeObject>]) -> i32 {
        let _order = self.delivery.lock();
        if self.is_finished() {
            self.log(
                LogLevel::Trace,
                format_args!("dropping {} objects after completion", objects.len()),
            );
            return codes::WBEM_S_NO_ERROR;
        }
        let Some(shared) = self.shared.upgrade() else {
            return codes::WBEM_E_SHUTTING_DOWN;
        };

        let guard = match AttachGuard::acquire(&*shared.vm) {
            Ok(guard) => guard,
            Err(e) => {
                self.log(
                    LogLevel::Error,
                    format_args!("cannot attach callback thread, {} objects dropped: {e}", objects.len()),
                );
                return codes::WBEM_E_FAILED;
            }
        };
        let env = guard.env();
        if let Err(e) = self.deliver_batch(env, &shared, objects) {
            self.log(
                LogLevel::Error,
                format_args!("batch of {} objects dropped: {e}", objects.len()),
            );
        }
        codes::WBEM_S_NO_ERROR
    }

    fn deliver_batch(
        &self,
        env: &dyn ManagedEnv,
        shared: &Shared,
        objects: &[Arc<dyn NativeObject>],
    ) -> Result<()> {
        let marshaller = Marshaller::new(env, &shared.meta, &shared.objects);
        let array = marshaller.objects_to_array(objects)?;
        let delivered = env.call_method(
            self.listener,
            shared.meta.wmi_object_sink_indicate,
            &[JValue::object(array)],
        );
        env.delete_local_ref(array);
        delivered.map(|_| ())
    }

    fn on_set_status(
        &self,
        flags: i32,
        result: i32,
        param: Option<&str>,
        object: Option<Arc<dyn NativeObject>>,
    ) -> i32 {
        let terminal = status::is_terminal(flags);
        let _order = self.delivery.lock();
        if terminal {
            if self.finished.swap(true, Ordering::AcqRel) {
                return codes::WBEM_S_NO_ERROR;
            }
        } else if !self.send_status || self.is_finished() {
            return codes::WBEM_S_NO_ERROR;
        }

        let code = match self.shared.upgrade() {
            None => {
                if terminal {
                    self.log(
                        LogLevel::Warn,
                        format_args!("bridge is gone, listener reference leaked"),
                    );
                }
                codes::WBEM_E_SHUTTING_DOWN
            }
            Some(shared) => match AttachGuard::acquire(&*shared.vm) {
                Ok(guard) => {
                    let env = guard.env();
                    if let Err(e) = self.deliver_status(env, &shared, flags, result, param, object)
                    {
                        self.log(
                            LogLevel::Error,
                            format_args!("status {flags} (result {result:#010x}) dropped: {e}"),
                        );
                    }
                    if terminal {
                        env.delete_global_ref(self.listener);
                    }
                    codes::WBEM_S_NO_ERROR
                }
                Err(e) => {
                    self.log(
                        LogLevel::Error,
                        format_args!("cannot attach callback thread, status {flags} dropped: {e}"),
                    );
                    if terminal {
                        shared.strand(self.listener);
                    }
                    codes::WBEM_E_FAILED
                }
            },
        };

        if terminal {
            if let Some(session) = self.session.upgrade() {
                session.remove_sink(self);
            }
            self.log(
                LogLevel::Trace,
                format_args!("finished with result {result:#010x}"),
            );
        }
        code
    }

    fn deliver_status(
        &self,
        env: &dyn ManagedEnv,
        shared: &Shared,
        flags: i32,
        result: i32,
        param: Option<&str>,
        object: Option<Arc<dyn NativeObject>>,
    ) -> Result<()> {
        let meta = &shared.meta;
        let status = env
            .call_static_method(
                meta.wmi_object_sink_status_class,
                meta.wmi_object_sink_status_from_code,
                &[JValue::Int(flags)],
            )?
            .as_object()
            .flatten();

        let mut locals: Vec<ObjectRef> = status.into_iter().collect();
        let outcome = (|| -> Result<()> {
            let param = param.map(|p| env.new_string(p)).transpose()?;
            locals.extend(param);
            let object = match &object {
                Some(o) => {
                    let marshaller = Marshaller::new(env, meta, &shared.objects);
                    Some(marshaller.object_to_managed(o)?)
                }
                None => None,
            };
            locals.extend(object);
            env.call_method(
                self.listener,
                meta.wmi_object_sink_set_status,
                &[
                    JValue::Object(status),
                    JValue::Int(result),
                    JValue::Object(param),
                    JValue::Object(object),
                ],
            )?;
            Ok(())
        })();
        for local in locals {
            env.delete_local_ref(local);
        }
        outcome
    }

    fn log(&self, level: LogLevel, message: std::fmt::Arguments<'_>) {
        if let Some(session) = self.session.upgrade() {
            session.write_log(level, format_args!("sink {}: {message}", self.id), None);
        } else if let Some(shared) = self.shared.upgrade() {
            shared
                .logger
                .log(level, format_args!("sink {}: {message}", self.id));
        }
    }
}

impl NativeSink for EventSink {
    fn indicate(&self, objects: &[Arc<dyn NativeObject>]) -> i32 {
        catch_unwind(AssertUnwindSafe(|| self.on_indicate(objects))).unwrap_or_else(|_| {
            tracing::error!(sink = self.id, "panic while delivering results");
            codes::WBEM_E_FAILED
        })
    }

    fn set_status(
        &self,
        flags: i32,
        result: i32,
        param: Option<&str>,
        object: Option<Arc<dyn NativeObject>>,
    ) -> i32 {
        catch_unwind(AssertUnwindSafe(|| {
            self.on_set_status(flags, result, param, object)
        }))
        .unwrap_or_else(|_| {
            tracing::error!(sink = self.id, "panic while delivering status");
            codes::WBEM_E_FAILED
        })
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("id", &self.id)
            .field("send_status", &self.send_status)
            .field("finished", &self.is_finished())
            .finish()
    }
}
