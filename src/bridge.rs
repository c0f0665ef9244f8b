//! Bridge entry points: the operations the managed service and object classes call into.
//!
//! Every operation takes the caller's [`ManagedEnv`] (the calling thread is attached by
//! definition) plus the managed receiver, resolves the native side through the handle
//! stored in the receiver, and maps the outcome to a [`Result`]. Raising the error as a
//! managed exception is left to the embedding layer.
//!
//! A process has at most one attached bridge, reachable through [`attach`], [`current`]
//! and [`detach`].

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    log::{LogLevel, Logger, TracingLogger},
    managed::{AttachGuard, JValue, ManagedEnv, ManagedVm, ObjectRef},
    marshal::Marshaller,
    metadata::MetaData,
    native::NativeProvider,
    object::ObjectRegistry,
    provider::{ConnectParams, Provider},
    registry::{read_handle, SessionRegistry},
    session::Session,
    sink::EventSink,
    value::ValueType,
    Error, Result,
};

/// What a bridge talks to below and where it logs.
#[derive(Clone)]
pub struct BridgeOptions {
    pub provider: Arc<dyn Provider>,
    pub logger: Arc<dyn Logger>,
}

impl BridgeOptions {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            logger: Arc::new(TracingLogger),
        }
    }

    /// Provider backed by the dynamically loaded shim (see [`crate::runtime`]).
    pub fn native() -> Self {
        Self::new(Arc::new(NativeProvider::new()))
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }
}

pub(crate) struct Shared {
    pub(crate) vm: Arc<dyn ManagedVm>,
    pub(crate) meta: MetaData,
    pub(crate) sessions: SessionRegistry,
    pub(crate) objects: ObjectRegistry,
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) logger: Arc<dyn Logger>,
    next_sink_id: AtomicU64,
    shut_down: AtomicBool,
    stranded: Mutex<Vec<ObjectRef>>,
}

impl Shared {
    /// Holds a listener reference that could not be deleted on a callback thread.
    pub(crate) fn strand(&self, listener: ObjectRef) {
        self.stranded.lock().push(listener);
    }

    /// Deletes stranded listener references; `env` must be attached.
    pub(crate) fn reclaim_stranded(&self, env: &dyn ManagedEnv) {
        let stranded = std::mem::take(&mut *self.stranded.lock());
        if stranded.is_empty() {
            return;
        }
        for listener in &stranded {
            env.delete_global_ref(*listener);
        }
        self.logger.debug(format_args!(
            "released {} stranded listener references",
            stranded.len()
        ));
    }
}

#[derive(Clone)]
pub struct Bridge {
    shared: Arc<Shared>,
}

impl Bridge {
    /// Resolves managed metadata and builds the bridge state.
    ///
    /// # Errors
    ///
    /// [`Error::EnvironmentIntegrity`] when a required managed class, method or field is
    /// missing.
    pub fn new(vm: Arc<dyn ManagedVm>, options: BridgeOptions) -> Result<Self> {
        let meta = {
            let guard = AttachGuard::acquire(&*vm)?;
            MetaData::resolve(guard.env())?
        };
        options
            .logger
            .debug(format_args!("managed metadata resolved"));
        Ok(Self {
            shared: Arc::new(Shared {
                vm,
                meta,
                sessions: SessionRegistry::new(),
                objects: ObjectRegistry::new(),
                provider: options.provider,
                logger: options.logger,
                next_sink_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
                stranded: Mutex::new(Vec::new()),
            }),
        })
    }

    fn live(&self) -> Result<&Shared> {
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(Error::InvalidState("bridge is shut down".into()));
        }
        Ok(&self.shared)
    }

    pub fn metadata(&self) -> &MetaData {
        &self.shared.meta
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    pub fn object_count(&self) -> usize {
        self.shared.objects.len()
    }

    /// Creates a session for `service` and stores its handle in the `serviceHandle` field.
    pub fn init_service(&self, env: &dyn ManagedEnv, service: ObjectRef) -> Result<u64> {
        let shared = self.live()?;
        let current = read_handle(env, service, shared.meta.wmi_service_handle_field)?;
        if current != 0 && shared.sessions.lookup(current).is_ok() {
            return Err(Error::InvalidState(format!(
                "service already bound to session {current:#x}"
            )));
        }
        let session = Session::new(shared.provider.clone(), shared.logger.clone());
        let handle = shared.sessions.register(session);
        if let Err(e) = env.set_field(
            service,
            shared.meta.wmi_service_handle_field,
            JValue::Long(handle as i64),
        ) {
            shared.sessions.unregister(handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Resolves the session behind a managed service object.
    pub fn session_from_object(
        &self,
        env: &dyn ManagedEnv,
        service: ObjectRef,
    ) -> Result<Arc<Session>> {
        let shared = self.live()?;
        shared
            .sessions
            .get_from_object(env, &shared.meta, service)
    }

    pub fn connect(
        &self,
        env: &dyn ManagedEnv,
        service: ObjectRef,
        params: &ConnectParams,
    ) -> Result<()> {
        self.session_from_object(env, service)?.connect(params)
    }

    /// Runs a blocking query and returns the results as a managed `WMIObject[]`.
    pub fn execute_query(
        &self,
        env: &dyn ManagedEnv,
        service: ObjectRef,
        query: &str,
        sync: bool,
    ) -> Result<ObjectRef> {
        let session = self.session_from_object(env, service)?;
        let objects = session.execute_query(query, sync)?;
        let shared = self.live()?;
        Marshaller::new(env, &shared.meta, &shared.objects)
            .objects_to_array(&objects)
            .inspect_err(|e| {
                session.write_log(
                    LogLevel::Error,
                    format_args!("converting {} results failed: {e}", objects.len()),
                    e.code(),
                )
            })
    }

    /// Starts an asynchronous query whose results go to `listener` (a `WMIObjectSink`).
    pub fn execute_query_async(
        &self,
        env: &dyn ManagedEnv,
        service: ObjectRef,
        query: &str,
        listener: ObjectRef,
        send_status: bool,
    ) -> Result<()> {
        let session = self.session_from_object(env, service)?;
        let shared = self.live()?;
        shared.reclaim_stranded(env);
        let global = env.new_global_ref(listener)?;
        let id = shared.next_sink_id.fetch_add(1, Ordering::Relaxed);
        let sink = EventSink::new(id, global, send_status, &session, &self.shared);
        if let Err(e) = session.execute_query_async(query, sink.clone()) {
            sink.discard(env);
            return Err(e);
        }
        Ok(())
    }

    /// Cancels the outstanding call whose listener equals `listener`.
    ///
    /// A listener with no outstanding call is not an error: its call may have completed
    /// in the meantime.
    pub fn cancel_async_operation(
        &self,
        env: &dyn ManagedEnv,
        service: ObjectRef,
        listener: ObjectRef,
    ) -> Result<()> {
        let session = self.session_from_object(env, service)?;
        let shared = self.live()?;
        shared.reclaim_stranded(env);
        let mut target = None;
        for sink in session.sinks()? {
            let same = env
                .call_method(
                    sink.listener(),
                    shared.meta.java_lang_object_equals,
                    &[JValue::object(listener)],
                )?
                .as_bool()
                .unwrap_or(false);
            if same {
                target = Some(sink);
                break;
            }
        }
        match target {
            Some(sink) => session.cancel_sink(&sink),
            None => {
                session.write_log(
                    LogLevel::Debug,
                    format_args!("cancel requested for a listener with no outstanding call"),
                    None,
                );
                Ok(())
            }
        }
    }

    /// Releases the session behind `service` and clears its handle. Repeated calls are
    /// no-ops.
    pub fn release_service(&self, env: &dyn ManagedEnv, service: ObjectRef) -> Result<()> {
        let shared = self.live()?;
        let field = shared.meta.wmi_service_handle_field;
        let handle = read_handle(env, service, field)?;
        if handle == 0 {
            return Ok(());
        }
        let session = shared.sessions.unregister(handle);
        let cleared = env.set_field(service, field, JValue::Long(0));
        if let Some(session) = session {
            session.release();
        }
        shared.reclaim_stranded(env);
        cleared
    }

    /// Provider text rendering of a managed `WMIObject`.
    pub fn object_text(&self, env: &dyn ManagedEnv, object: ObjectRef) -> Result<ObjectRef> {
        let native = self.native_object(env, object)?;
        env.new_string(&native.object_text()?)
    }

    /// Re-reads one property from the provider object behind `object`.
    pub fn read_property(
        &self,
        env: &dyn ManagedEnv,
        object: ObjectRef,
        name: &str,
    ) -> Result<Option<ObjectRef>> {
        let native = self.native_object(env, object)?;
        let property = native.property(name)?;
        let shared = self.live()?;
        Marshaller::new(env, &shared.meta, &shared.objects).to_managed(&property.value)
    }

    /// Writes `value` into a property, converted to the property's declared CIM type.
    pub fn write_property(
        &self,
        env: &dyn ManagedEnv,
        object: ObjectRef,
        name: &str,
        value: Option<ObjectRef>,
    ) -> Result<()> {
        let native = self.native_object(env, object)?;
        let declared = native.property(name)?.cim_type;
        let expected = ValueType::from_cim(declared).ok_or_else(|| {
            Error::Marshal(format!("property '{name}' has unsupported CIM type {declared}"))
        })?;
        let shared = self.live()?;
        let tagged = Marshaller::new(env, &shared.meta, &shared.objects).to_native(value, expected)?;
        native.put_property(name, &tagged)
    }

    /// Drops the native object behind a managed `WMIObject` and clears its handle.
    pub fn release_object(&self, env: &dyn ManagedEnv, object: ObjectRef) -> Result<()> {
        let shared = self.live()?;
        let field = shared.meta.wmi_object_handle_field;
        let handle = read_handle(env, object, field)?;
        if handle == 0 {
            return Ok(());
        }
        shared.objects.release(handle);
        env.set_field(object, field, JValue::Long(0))
    }

    fn native_object(
        &self,
        env: &dyn ManagedEnv,
        object: ObjectRef,
    ) -> Result<Arc<dyn crate::provider::NativeObject>> {
        let shared = self.live()?;
        let handle = read_handle(env, object, shared.meta.wmi_object_handle_field)?;
        shared.objects.lookup(handle)
    }

    /// Force-releases every session, drops every registered object and releases the
    /// managed metadata. Idempotent.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let sessions = shared.sessions.drain();
        for session in &sessions {
            session.release();
        }
        let objects = shared.objects.clear();
        match AttachGuard::acquire(&*shared.vm) {
            Ok(guard) => {
                shared.reclaim_stranded(guard.env());
                shared.meta.release(guard.env());
            }
            Err(e) => shared.logger.warn(format_args!(
                "cannot attach to release managed metadata: {e}"
            )),
        }
        shared.logger.info(format_args!(
            "bridge shut down ({} sessions, {objects} objects released)",
            sessions.len()
        ));
    }

    fn same_vm(&self, vm: &Arc<dyn ManagedVm>) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.shared.vm) as *const (),
            Arc::as_ptr(vm) as *const (),
        )
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("sessions", &self.session_count())
            .field("objects", &self.object_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

static ATTACHED: Mutex<Option<Bridge>> = parking_lot::const_mutex(None);

/// Runtime-load hook: builds the process bridge for `vm`.
///
/// Attaching the same runtime again returns the existing bridge.
///
/// # Errors
///
/// [`Error::InvalidState`] if a different runtime is already attached, or whatever
/// [`Bridge::new`] reports.
pub fn attach(vm: Arc<dyn ManagedVm>, options: BridgeOptions) -> Result<Bridge> {
    let mut slot = ATTACHED.lock();
    if let Some(existing) = slot.as_ref() {
        if existing.same_vm(&vm) {
            return Ok(existing.clone());
        }
        return Err(Error::InvalidState(
            "a different managed runtime is already attached".into(),
        ));
    }
    let bridge = Bridge::new(vm, options)?;
    tracing::info!("bridge attached");
    *slot = Some(bridge.clone());
    Ok(bridge)
}

/// The attached bridge.
pub fn current() -> Result<Bridge> {
    ATTACHED
        .lock()
        .clone()
        .ok_or_else(|| Error::InvalidState("no managed runtime attached".into()))
}

/// Runtime-unload hook: shuts the attached bridge down. No-op when nothing is attached.
pub fn detach() {
    let bridge = ATTACHED.lock().take();
    if let Some(bridge) = bridge {
        bridge.shutdown();
        tracing::info!("bridge detached");
    }
}
