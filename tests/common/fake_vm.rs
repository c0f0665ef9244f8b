//! In-process stand-in for the managed runtime.
//!
//! Every `ManagedEnv` call checks that the calling thread is attached; a call from an
//! unattached thread fails and is counted as a violation. Objects live in a heap keyed by
//! object id, references are separate ids that are either local or global.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde_json::{json, Value};
use wmi_bridge::{
    metadata::*, provider::status, ClassRef, Error, FieldId, JValue, ManagedEnv, ManagedVm,
    MethodId, ObjectRef, Result,
};

const CLASSES: &[&str] = &[
    CLASS_WMI_SERVICE,
    CLASS_WMI_OBJECT,
    CLASS_WMI_OBJECT_SINK,
    CLASS_WMI_OBJECT_SINK_STATUS,
    CLASS_WMI_OBJECT_PROPERTY,
    CLASS_WMI_OBJECT_METHOD,
    CLASS_OBJECT,
    CLASS_BYTE,
    CLASS_CHARACTER,
    CLASS_BOOLEAN,
    CLASS_SHORT,
    CLASS_INTEGER,
    CLASS_LONG,
    CLASS_FLOAT,
    CLASS_DOUBLE,
    CLASS_STRING,
    CLASS_DATE,
    CLASS_LIST,
    CLASS_ARRAY_LIST,
];

struct MethodDef {
    class: &'static str,
    name: &'static str,
    sig: &'static str,
    is_static: bool,
}

const fn m(class: &'static str, name: &'static str, sig: &'static str) -> MethodDef {
    MethodDef {
        class,
        name,
        sig,
        is_static: false,
    }
}

const METHODS: &[MethodDef] = &[
    m(CLASS_WMI_OBJECT, "<init>", SIG_OBJECT_CTOR),
    m(CLASS_WMI_OBJECT_SINK, "indicate", SIG_SINK_INDICATE),
    m(CLASS_WMI_OBJECT_SINK, "setStatus", SIG_SINK_SET_STATUS),
    MethodDef {
        class: CLASS_WMI_OBJECT_SINK_STATUS,
        name: "fromCode",
        sig: SIG_STATUS_FROM_CODE,
        is_static: true,
    },
    m(CLASS_WMI_OBJECT_PROPERTY, "<init>", SIG_PROPERTY_CTOR),
    m(CLASS_WMI_OBJECT_METHOD, "<init>", SIG_METHOD_CTOR),
    m(CLASS_OBJECT, "equals", "(Ljava/lang/Object;)Z"),
    m(CLASS_BYTE, "<init>", "(B)V"),
    m(CLASS_BYTE, "byteValue", "()B"),
    m(CLASS_CHARACTER, "<init>", "(C)V"),
    m(CLASS_CHARACTER, "charValue", "()C"),
    m(CLASS_BOOLEAN, "<init>", "(Z)V"),
    m(CLASS_BOOLEAN, "booleanValue", "()Z"),
    m(CLASS_SHORT, "<init>", "(S)V"),
    m(CLASS_SHORT, "shortValue", "()S"),
    m(CLASS_INTEGER, "<init>", "(I)V"),
    m(CLASS_INTEGER, "intValue", "()I"),
    m(CLASS_LONG, "<init>", "(J)V"),
    m(CLASS_LONG, "longValue", "()J"),
    m(CLASS_FLOAT, "<init>", "(F)V"),
    m(CLASS_FLOAT, "floatValue", "()F"),
    m(CLASS_DOUBLE, "<init>", "(D)V"),
    m(CLASS_DOUBLE, "doubleValue", "()D"),
    m(CLASS_DATE, "<init>", "(J)V"),
    m(CLASS_DATE, "getTime", "()J"),
    m(CLASS_LIST, "add", "(Ljava/lang/Object;)Z"),
    m(CLASS_LIST, "size", "()I"),
    m(CLASS_LIST, "get", "(I)Ljava/lang/Object;"),
    m(CLASS_ARRAY_LIST, "<init>", "(I)V"),
];

const FIELDS: &[(&str, &str, &str)] = &[
    (CLASS_WMI_SERVICE, FIELD_SERVICE_HANDLE, "J"),
    (CLASS_WMI_OBJECT, FIELD_OBJECT_HANDLE, "J"),
];

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Indicate(Vec<Value>),
    Status {
        flags: i32,
        result: i32,
        param: Option<String>,
        object: Value,
    },
}

/// Managed `WMIObjectSink` instance; records what the bridge delivers.
#[derive(Default)]
pub struct Listener {
    events: Mutex<Vec<Event>>,
    fail_indicate: AtomicBool,
    active: AtomicUsize,
    overlaps: AtomicUsize,
}

impl Listener {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Makes `indicate` throw.
    pub fn fail_indicate(&self, fail: bool) {
        self.fail_indicate.store(fail, Ordering::SeqCst);
    }

    /// Number of times two deliveries were in progress at once.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// `(flags, result)` of every status delivered so far.
    pub fn statuses(&self) -> Vec<(i32, i32)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Status { flags, result, .. } => Some((*flags, *result)),
                Event::Indicate(_) => None,
            })
            .collect()
    }

    /// Every object delivered through `indicate`, in delivery order.
    pub fn indicated(&self) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Indicate(objects) => Some(objects.clone()),
                Event::Status { .. } => None,
            })
            .flatten()
            .collect()
    }

    pub fn wait_for_terminal(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self
                .statuses()
                .iter()
                .any(|(flags, _)| *flags == status::WBEM_STATUS_COMPLETE)
            {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn record(&self, event: Event) {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        thread::sleep(Duration::from_micros(100));
        self.events.lock().push(event);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug)]
enum Val {
    Prim(JValue),
    Obj(Option<u64>),
}

enum Obj {
    Boxed { class: &'static str, value: JValue },
    Str(String),
    List(Vec<Option<u64>>),
    Array(Vec<Option<u64>>),
    Instance {
        class: &'static str,
        args: Vec<Val>,
        fields: HashMap<&'static str, JValue>,
    },
    Listener(Arc<Listener>),
    Status(i32),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum RefKind {
    Local,
    Global,
}

#[derive(Default)]
struct Heap {
    next: u64,
    objects: HashMap<u64, Obj>,
    refs: HashMap<u64, (u64, RefKind)>,
}

impl Heap {
    fn alloc(&mut self, obj: Obj) -> u64 {
        self.next += 1;
        self.objects.insert(self.next, obj);
        self.next
    }

    fn new_ref(&mut self, oid: u64, kind: RefKind) -> ObjectRef {
        self.next += 1;
        self.refs.insert(self.next, (oid, kind));
        ObjectRef::from_raw(self.next).expect("ids start at 1")
    }

    fn local(&mut self, obj: Obj) -> ObjectRef {
        let oid = self.alloc(obj);
        self.new_ref(oid, RefKind::Local)
    }

    fn oid(&self, r: ObjectRef) -> Result<u64> {
        self.refs
            .get(&r.as_raw())
            .map(|(oid, _)| *oid)
            .ok_or_else(|| Error::Managed(format!("dangling reference {}", r.as_raw())))
    }

    fn obj(&self, r: ObjectRef) -> Result<&Obj> {
        let oid = self.oid(r)?;
        self.objects
            .get(&oid)
            .ok_or_else(|| Error::Managed(format!("no object {oid}")))
    }

    fn intern(&self, v: JValue) -> Result<Val> {
        Ok(match v {
            JValue::Object(None) => Val::Obj(None),
            JValue::Object(Some(r)) => Val::Obj(Some(self.oid(r)?)),
            p => Val::Prim(p),
        })
    }

    fn out(&mut self, oid: Option<u64>) -> JValue {
        JValue::Object(oid.map(|o| self.new_ref(o, RefKind::Local)))
    }

    fn class_of(&self, oid: u64) -> &'static str {
        match &self.objects[&oid] {
            Obj::Boxed { class, .. } | Obj::Instance { class, .. } => *class,
            Obj::Str(_) => CLASS_STRING,
            Obj::List(_) => CLASS_ARRAY_LIST,
            Obj::Array(_) => "[Lorg/jkiss/wmi/service/WMIObject;",
            Obj::Listener(_) => CLASS_WMI_OBJECT_SINK,
            Obj::Status(_) => CLASS_WMI_OBJECT_SINK_STATUS,
        }
    }

    fn string(&self, oid: Option<u64>) -> Option<String> {
        match oid.and_then(|o| self.objects.get(&o)) {
            Some(Obj::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }

    fn snapshot(&self, oid: Option<u64>) -> Value {
        let Some(oid) = oid else {
            return Value::Null;
        };
        match &self.objects[&oid] {
            Obj::Boxed { class, value } if *class == CLASS_DATE => match value {
                JValue::Long(ms) => json!({ "date_ms": ms }),
                _ => Value::Null,
            },
            Obj::Boxed { value, .. } => match *value {
                JValue::Boolean(v) => json!(v),
                JValue::Byte(v) => json!(v),
                JValue::Char(v) => json!(v),
                JValue::Short(v) => json!(v),
                JValue::Int(v) => json!(v),
                JValue::Long(v) => json!(v),
                JValue::Float(v) => json!(v),
                JValue::Double(v) => json!(v),
                _ => Value::Null,
            },
            Obj::Str(s) => json!(s),
            Obj::List(items) | Obj::Array(items) => {
                Value::Array(items.iter().map(|i| self.snapshot(*i)).collect())
            }
            Obj::Instance {
                class,
                args,
                fields,
            } if *class == CLASS_WMI_OBJECT => {
                let handle = match fields.get(FIELD_OBJECT_HANDLE) {
                    Some(JValue::Long(h)) => *h,
                    _ => 0,
                };
                let properties: Vec<Value> = self
                    .list_items(&args[1])
                    .into_iter()
                    .map(|p| match self.objects.get(&p) {
                        Some(Obj::Instance { args, .. }) => {
                            let name = self.string(obj_of(&args[0]));
                            let cim_type = match args[1] {
                                Val::Prim(JValue::Int(t)) => t,
                                _ => -1,
                            };
                            json!([name, cim_type, self.snapshot(obj_of(&args[2]))])
                        }
                        _ => Value::Null,
                    })
                    .collect();
                let methods: Vec<Value> = self
                    .list_items(&args[2])
                    .into_iter()
                    .map(|p| match self.objects.get(&p) {
                        Some(Obj::Instance { args, .. }) => json!({
                            "name": self.string(obj_of(&args[0])),
                            "in": self.snapshot(obj_of(&args[1])),
                            "out": self.snapshot(obj_of(&args[2])),
                        }),
                        _ => Value::Null,
                    })
                    .collect();
                json!({ "handle": handle, "properties": properties, "methods": methods })
            }
            Obj::Instance { class, .. } => json!({ "instance": class }),
            Obj::Listener(_) => json!("listener"),
            Obj::Status(code) => json!({ "status": code }),
        }
    }

    fn list_items(&self, v: &Val) -> Vec<u64> {
        match obj_of(v).and_then(|o| self.objects.get(&o)) {
            Some(Obj::List(items)) => items.iter().flatten().copied().collect(),
            _ => Vec::new(),
        }
    }
}

fn obj_of(v: &Val) -> Option<u64> {
    match v {
        Val::Obj(o) => *o,
        Val::Prim(_) => None,
    }
}

fn prim_matches(sig: &str, v: &JValue) -> bool {
    matches!(
        (sig, v),
        ("(B)V", JValue::Byte(_))
            | ("(C)V", JValue::Char(_))
            | ("(Z)V", JValue::Boolean(_))
            | ("(S)V", JValue::Short(_))
            | ("(I)V", JValue::Int(_))
            | ("(J)V", JValue::Long(_))
            | ("(F)V", JValue::Float(_))
            | ("(D)V", JValue::Double(_))
    )
}

pub struct FakeVm {
    heap: Mutex<Heap>,
    attached: Mutex<HashSet<ThreadId>>,
    attaches: AtomicUsize,
    detaches: AtomicUsize,
    violations: AtomicUsize,
    live_classes: AtomicUsize,
    missing: HashSet<String>,
    fail_set_field: AtomicBool,
    fail_attach: AtomicBool,
}

impl FakeVm {
    pub fn new() -> Arc<Self> {
        Self::without_classes(&[])
    }

    /// A runtime in which `missing` cannot be found.
    pub fn without_classes(missing: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(Heap::default()),
            attached: Mutex::new(HashSet::new()),
            attaches: AtomicUsize::new(0),
            detaches: AtomicUsize::new(0),
            violations: AtomicUsize::new(0),
            live_classes: AtomicUsize::new(0),
            missing: missing.iter().map(|s| s.to_string()).collect(),
            fail_set_field: AtomicBool::new(false),
            fail_attach: AtomicBool::new(false),
        })
    }

    /// Makes every `set_field` fail until switched off again.
    pub fn fail_set_field(&self, fail: bool) {
        self.fail_set_field.store(fail, Ordering::SeqCst);
    }

    /// Makes `attach_current_thread` fail until switched off again.
    pub fn fail_attach(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::SeqCst);
    }

    fn check_attached(&self) -> Result<()> {
        if self.is_current_thread_attached() {
            Ok(())
        } else {
            self.violations.fetch_add(1, Ordering::SeqCst);
            Err(Error::Managed("call from a thread that is not attached".into()))
        }
    }

    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    pub fn attach_count(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    pub fn detach_count(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }

    pub fn attached_threads(&self) -> usize {
        self.attached.lock().len()
    }

    pub fn live_classes(&self) -> usize {
        self.live_classes.load(Ordering::SeqCst)
    }

    pub fn global_refs(&self) -> usize {
        self.heap
            .lock()
            .refs
            .values()
            .filter(|(_, kind)| *kind == RefKind::Global)
            .count()
    }

    pub fn new_service(&self) -> ObjectRef {
        let mut fields = HashMap::new();
        fields.insert(FIELD_SERVICE_HANDLE, JValue::Long(0));
        self.heap.lock().local(Obj::Instance {
            class: CLASS_WMI_SERVICE,
            args: Vec::new(),
            fields,
        })
    }

    pub fn new_listener(&self) -> (ObjectRef, Arc<Listener>) {
        let listener = Arc::new(Listener::default());
        let r = self.heap.lock().local(Obj::Listener(listener.clone()));
        (r, listener)
    }

    /// A second local reference to the object behind `r`.
    pub fn alias(&self, r: ObjectRef) -> ObjectRef {
        let mut heap = self.heap.lock();
        let oid = heap.oid(r).expect("live reference");
        heap.new_ref(oid, RefKind::Local)
    }

    pub fn new_boxed(&self, class: &'static str, value: JValue) -> ObjectRef {
        self.heap.lock().local(Obj::Boxed { class, value })
    }

    pub fn new_str(&self, s: &str) -> ObjectRef {
        self.heap.lock().local(Obj::Str(s.to_string()))
    }

    pub fn new_list(&self, items: &[Option<ObjectRef>]) -> ObjectRef {
        let mut heap = self.heap.lock();
        let items = items
            .iter()
            .map(|i| i.map(|r| heap.oid(r).expect("live reference")))
            .collect();
        heap.local(Obj::List(items))
    }

    pub fn class_of(&self, r: ObjectRef) -> &'static str {
        let heap = self.heap.lock();
        let oid = heap.oid(r).expect("live reference");
        heap.class_of(oid)
    }

    pub fn snapshot(&self, r: Option<ObjectRef>) -> Value {
        let heap = self.heap.lock();
        let oid = r.map(|r| heap.oid(r).expect("live reference"));
        heap.snapshot(oid)
    }

    /// Elements of a managed array, as fresh local references.
    pub fn array_items(&self, r: ObjectRef) -> Vec<ObjectRef> {
        let mut heap = self.heap.lock();
        let items = match heap.obj(r) {
            Ok(Obj::Array(items)) => items.clone(),
            _ => panic!("not an array"),
        };
        items
            .into_iter()
            .map(|i| heap.new_ref(i.expect("non-null element"), RefKind::Local))
            .collect()
    }

    pub fn handle_of(&self, r: ObjectRef) -> i64 {
        let heap = self.heap.lock();
        match heap.obj(r) {
            Ok(Obj::Instance { fields, .. }) => fields
                .values()
                .find_map(|v| v.as_long())
                .unwrap_or_default(),
            _ => panic!("not an instance"),
        }
    }

    fn class_name(&self, class: ClassRef) -> Result<&'static str> {
        CLASSES
            .get(class.as_raw() as usize - 1)
            .copied()
            .ok_or_else(|| Error::Managed("unknown class reference".into()))
    }

    fn method(&self, method: MethodId) -> Result<&'static MethodDef> {
        METHODS
            .get(method.as_raw() as usize - 1)
            .ok_or_else(|| Error::Managed("unknown method id".into()))
    }

    fn lookup_method(
        &self,
        class: ClassRef,
        name: &str,
        sig: &str,
        is_static: bool,
    ) -> Result<Option<MethodId>> {
        self.check_attached()?;
        let class = self.class_name(class)?;
        Ok(METHODS
            .iter()
            .position(|d| {
                d.class == class && d.name == name && d.sig == sig && d.is_static == is_static
            })
            .and_then(|i| MethodId::from_raw(i as u64 + 1)))
    }

    fn deliver(&self, listener: &Listener, event: Event) -> Result<JValue> {
        if matches!(event, Event::Indicate(_)) && listener.fail_indicate.load(Ordering::SeqCst) {
            return Err(Error::Managed("listener threw".into()));
        }
        listener.record(event);
        Ok(JValue::Void)
    }
}

impl ManagedVm for FakeVm {
    fn is_current_thread_attached(&self) -> bool {
        self.attached.lock().contains(&thread::current().id())
    }

    fn attach_current_thread(&self) -> Result<()> {
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(Error::Managed("attach refused".into()));
        }
        self.attached.lock().insert(thread::current().id());
        self.attaches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn detach_current_thread(&self) {
        self.attached.lock().remove(&thread::current().id());
        self.detaches.fetch_add(1, Ordering::SeqCst);
    }

    fn env(&self) -> &dyn ManagedEnv {
        self
    }
}

impl ManagedEnv for FakeVm {
    fn find_class(&self, name: &str) -> Result<Option<ClassRef>> {
        self.check_attached()?;
        if self.missing.contains(name) {
            return Ok(None);
        }
        let found = CLASSES
            .iter()
            .position(|c| *c == name)
            .and_then(|i| ClassRef::from_raw(i as u64 + 1));
        if found.is_some() {
            self.live_classes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(found)
    }

    fn release_class(&self, _class: ClassRef) {
        self.live_classes.fetch_sub(1, Ordering::SeqCst);
    }

    fn method_id(&self, class: ClassRef, name: &str, sig: &str) -> Result<Option<MethodId>> {
        self.lookup_method(class, name, sig, false)
    }

    fn static_method_id(
        &self,
        class: ClassRef,
        name: &str,
        sig: &str,
    ) -> Result<Option<MethodId>> {
        self.lookup_method(class, name, sig, true)
    }

    fn field_id(&self, class: ClassRef, name: &str, sig: &str) -> Result<Option<FieldId>> {
        self.check_attached()?;
        let class = self.class_name(class)?;
        Ok(FIELDS
            .iter()
            .position(|(c, n, s)| *c == class && *n == name && *s == sig)
            .and_then(|i| FieldId::from_raw(i as u64 + 1)))
    }

    fn new_object(&self, class: ClassRef, ctor: MethodId, args: &[JValue]) -> Result<ObjectRef> {
        self.check_attached()?;
        let class = self.class_name(class)?;
        let def = self.method(ctor)?;
        if def.name != "<init>" || def.class != class {
            return Err(Error::Managed(format!("{}.{} is not a constructor of {class}", def.class, def.name)));
        }
        let mut heap = self.heap.lock();
        let obj = match class {
            CLASS_ARRAY_LIST => Obj::List(Vec::new()),
            CLASS_WMI_OBJECT | CLASS_WMI_OBJECT_PROPERTY | CLASS_WMI_OBJECT_METHOD => {
                let args = args
                    .iter()
                    .map(|a| heap.intern(*a))
                    .collect::<Result<Vec<_>>>()?;
                if args.len() != 3 {
                    return Err(Error::Managed(format!("{class} takes 3 arguments")));
                }
                let mut fields = HashMap::new();
                if class == CLASS_WMI_OBJECT {
                    match args[0] {
                        Val::Prim(v @ JValue::Long(_)) => {
                            fields.insert(FIELD_OBJECT_HANDLE, v);
                        }
                        _ => return Err(Error::Managed("WMIObject handle must be a long".into())),
                    }
                }
                Obj::Instance {
                    class,
                    args,
                    fields,
                }
            }
            _ => match args {
                [value] if prim_matches(def.sig, value) => Obj::Boxed {
                    class,
                    value: *value,
                },
                _ => {
                    return Err(Error::Managed(format!(
                        "bad arguments {args:?} for {class}{}",
                        def.sig
                    )))
                }
            },
        };
        Ok(heap.local(obj))
    }

    fn call_method(&self, obj: ObjectRef, method: MethodId, args: &[JValue]) -> Result<JValue> {
        self.check_attached()?;
        let def = self.method(method)?;
        let mut heap = self.heap.lock();
        let oid = heap.oid(obj)?;
        match (def.class, def.name) {
            (CLASS_OBJECT, "equals") => {
                let other = match args {
                    [JValue::Object(other)] => other.map(|r| heap.oid(r)).transpose()?,
                    _ => return Err(Error::Managed("equals takes one object".into())),
                };
                Ok(JValue::Boolean(other == Some(oid)))
            }
            (CLASS_LIST, name) => {
                let item = match args {
                    [JValue::Object(item)] => Some(item.map(|r| heap.oid(r)).transpose()?),
                    _ => None,
                };
                let Some(Obj::List(items)) = heap.objects.get_mut(&oid) else {
                    return Err(Error::Managed("not a list".into()));
                };
                match (name, item, args) {
                    ("add", Some(item), _) => {
                        items.push(item);
                        Ok(JValue::Boolean(true))
                    }
                    ("size", _, _) => Ok(JValue::Int(items.len() as i32)),
                    ("get", _, [JValue::Int(i)]) => {
                        let item = *items
                            .get(*i as usize)
                            .ok_or_else(|| Error::Managed(format!("index {i} out of bounds")))?;
                        Ok(heap.out(item))
                    }
                    _ => Err(Error::Managed(format!("bad call List.{name}"))),
                }
            }
            (CLASS_WMI_OBJECT_SINK, "indicate") => {
                let listener = match heap.objects.get(&oid) {
                    Some(Obj::Listener(l)) => l.clone(),
                    _ => return Err(Error::Managed("not a listener".into())),
                };
                let objects = match args {
                    [JValue::Object(Some(array))] => {
                        let array = heap.oid(*array)?;
                        match heap.snapshot(Some(array)) {
                            Value::Array(items) => items,
                            _ => return Err(Error::Managed("indicate expects an array".into())),
                        }
                    }
                    _ => return Err(Error::Managed("indicate expects an array".into())),
                };
                drop(heap);
                self.deliver(&listener, Event::Indicate(objects))
            }
            (CLASS_WMI_OBJECT_SINK, "setStatus") => {
                let listener = match heap.objects.get(&oid) {
                    Some(Obj::Listener(l)) => l.clone(),
                    _ => return Err(Error::Managed("not a listener".into())),
                };
                let [JValue::Object(status), JValue::Int(result), JValue::Object(param), JValue::Object(object)] =
                    args
                else {
                    return Err(Error::Managed("setStatus takes 4 arguments".into()));
                };
                let flags = match status.map(|s| heap.obj(s)).transpose()? {
                    Some(Obj::Status(code)) => *code,
                    _ => return Err(Error::Managed("status must be a WMIObjectSinkStatus".into())),
                };
                let param = param.map(|p| heap.oid(p)).transpose()?;
                let param = heap.string(param);
                let object = object.map(|o| heap.oid(o)).transpose()?;
                let object = heap.snapshot(object);
                let result = *result;
                drop(heap);
                self.deliver(
                    &listener,
                    Event::Status {
                        flags,
                        result,
                        param,
                        object,
                    },
                )
            }
            (class, _) => match heap.objects.get(&oid) {
                Some(Obj::Boxed { class: c, value }) if *c == class => Ok(*value),
                _ => Err(Error::Managed(format!("{}.{} on a {}", def.class, def.name, heap.class_of(oid)))),
            },
        }
    }

    fn call_static_method(
        &self,
        class: ClassRef,
        method: MethodId,
        args: &[JValue],
    ) -> Result<JValue> {
        self.check_attached()?;
        let class = self.class_name(class)?;
        let def = self.method(method)?;
        match (class, def.name, args) {
            (CLASS_WMI_OBJECT_SINK_STATUS, "fromCode", [JValue::Int(code)]) => {
                let mut heap = self.heap.lock();
                let r = heap.local(Obj::Status(*code));
                Ok(JValue::object(r))
            }
            _ => Err(Error::Managed(format!("bad static call {class}.{}", def.name))),
        }
    }

    fn get_field(&self, obj: ObjectRef, field: FieldId) -> Result<JValue> {
        self.check_attached()?;
        let (_, name, _) = FIELDS[field.as_raw() as usize - 1];
        match self.heap.lock().obj(obj)? {
            Obj::Instance { fields, .. } => Ok(fields.get(name).copied().unwrap_or(JValue::Long(0))),
            _ => Err(Error::Managed(format!("no field {name}"))),
        }
    }

    fn set_field(&self, obj: ObjectRef, field: FieldId, value: JValue) -> Result<()> {
        self.check_attached()?;
        if self.fail_set_field.load(Ordering::SeqCst) {
            return Err(Error::Managed("field write refused".into()));
        }
        let (_, name, _) = FIELDS[field.as_raw() as usize - 1];
        let mut heap = self.heap.lock();
        let oid = heap.oid(obj)?;
        match heap.objects.get_mut(&oid) {
            Some(Obj::Instance { fields, .. }) => {
                fields.insert(name, value);
                Ok(())
            }
            _ => Err(Error::Managed(format!("no field {name}"))),
        }
    }

    fn is_instance_of(&self, obj: ObjectRef, class: ClassRef) -> Result<bool> {
        self.check_attached()?;
        let class = self.class_name(class)?;
        let heap = self.heap.lock();
        let actual = heap.class_of(heap.oid(obj)?);
        Ok(actual == class
            || class == CLASS_OBJECT
            || (class == CLASS_LIST && actual == CLASS_ARRAY_LIST))
    }

    fn new_string(&self, value: &str) -> Result<ObjectRef> {
        self.check_attached()?;
        Ok(self.heap.lock().local(Obj::Str(value.to_string())))
    }

    fn get_string(&self, obj: ObjectRef) -> Result<String> {
        self.check_attached()?;
        match self.heap.lock().obj(obj)? {
            Obj::Str(s) => Ok(s.clone()),
            _ => Err(Error::Managed("not a string".into())),
        }
    }

    fn new_object_array(&self, _element: ClassRef, items: &[Option<ObjectRef>]) -> Result<ObjectRef> {
        self.check_attached()?;
        let mut heap = self.heap.lock();
        let items = items
            .iter()
            .map(|i| i.map(|r| heap.oid(r)).transpose())
            .collect::<Result<Vec<_>>>()?;
        Ok(heap.local(Obj::Array(items)))
    }

    fn new_global_ref(&self, obj: ObjectRef) -> Result<ObjectRef> {
        self.check_attached()?;
        let mut heap = self.heap.lock();
        let oid = heap.oid(obj)?;
        Ok(heap.new_ref(oid, RefKind::Global))
    }

    fn delete_global_ref(&self, obj: ObjectRef) {
        self.delete_ref(obj, RefKind::Global);
    }

    fn delete_local_ref(&self, obj: ObjectRef) {
        self.delete_ref(obj, RefKind::Local);
    }
}

impl FakeVm {
    fn delete_ref(&self, obj: ObjectRef, kind: RefKind) {
        if self.check_attached().is_err() {
            return;
        }
        let mut heap = self.heap.lock();
        match heap.refs.get(&obj.as_raw()) {
            Some((_, k)) if *k == kind => {
                heap.refs.remove(&obj.as_raw());
            }
            _ => {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}
