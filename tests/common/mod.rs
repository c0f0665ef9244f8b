#![allow(dead_code)]

pub mod fake_vm;

use std::sync::Arc;

pub use fake_vm::{Event, FakeVm, Listener};
pub use mock::{AsyncCall, CaptureLogger, MockObject, MockProvider};

use wmi_bridge::{
    value::cim, Bridge, BridgeOptions, ConnectParams, ManagedVm, ObjectRef, Result, TaggedValue,
};

/// A bridge over a fake runtime and a mock provider, with the test thread attached as the
/// managed caller.
pub struct Harness {
    pub vm: Arc<FakeVm>,
    pub provider: MockProvider,
    pub logger: Arc<CaptureLogger>,
    pub bridge: Bridge,
}

impl Harness {
    pub fn new() -> Result<Self> {
        let vm = FakeVm::new();
        vm.attach_current_thread()?;
        let provider = MockProvider::new();
        let logger = Arc::new(CaptureLogger::default());
        let bridge = Bridge::new(
            vm.clone(),
            BridgeOptions::new(Arc::new(provider.clone())).with_logger(logger.clone()),
        )?;
        Ok(Self {
            vm,
            provider,
            logger,
            bridge,
        })
    }

    pub fn env(&self) -> &dyn wmi_bridge::ManagedEnv {
        self.vm.env()
    }

    /// A managed service with an initialized, connected session.
    pub fn connected_service(&self) -> Result<ObjectRef> {
        let service = self.vm.new_service();
        self.bridge.init_service(self.env(), service)?;
        self.bridge.connect(self.env(), service, &local_params())?;
        Ok(service)
    }
}

pub fn local_params() -> ConnectParams {
    ConnectParams {
        resource: "root\\cimv2".into(),
        ..Default::default()
    }
}

/// `Win32_Process`-shaped fixture with a name and a pid.
pub fn process(name: &str, pid: i32) -> Arc<dyn wmi_bridge::NativeObject> {
    MockObject::new("Win32_Process")
        .prop("Name", cim::CIM_STRING, TaggedValue::String(name.into()))
        .prop("ProcessId", cim::CIM_SINT32, TaggedValue::Int(pid))
        .build()
}
