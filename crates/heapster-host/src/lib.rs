//! The interface between the profiler and the managed runtime that
//! hosts it.
//!
//! The agent binding (JVMTI/JNI thunks, event dispatch, native-method
//! registration plumbing) lives outside this workspace; everything the
//! profiler needs from it is expressed through the [`HostRuntime`]
//! trait so that the core can be driven by the real runtime or by the
//! in-memory [`fake::FakeRuntime`] in tests.

use thiserror::Error;

pub mod fake;
pub mod monitor;

pub use monitor::{Monitor, MonitorGuard};

pub type HostResult<T> = Result<T, HostError>;

/// Failure reported by a host primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// The runtime is not in a phase where the primitive is available.
    /// Stack capture reports this for allocations that happen while
    /// the runtime is starting up or shutting down.
    #[error("wrong runtime phase")]
    WrongPhase,
    /// Carries the error name supplied by the runtime,
    /// eg. `JVMTI_ERROR_INVALID_OBJECT`.
    #[error("host runtime error: {0}")]
    Failed(String),
}

impl HostError {
    pub fn failed<S: Into<String>>(name: S) -> Self {
        Self::Failed(name.into())
    }
}

/// Abort after logging a diagnostic for a host primitive that must not
/// fail. Monitor, tagging and allocation failures signal runtime
/// corruption; there is no way to continue profiling safely and the
/// host callbacks have no error channel to report through.
pub fn fatal_host_error(context: &str, err: &HostError) -> ! {
    tracing::error!("{context}: {err}");
    std::process::abort();
}

/// Opaque method identifier assigned by the runtime. Stable for the
/// lifetime of the process; the pointer-width payload is what the
/// profile format emits for each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub usize);

/// Opaque reference to a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(pub usize);

/// Opaque reference to a managed thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadRef(pub usize);

/// Opaque reference to a loaded class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassRef(pub usize);

/// Identifier of a named raw monitor created on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorId(pub usize);

/// Capabilities the agent requires from the runtime at load time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub class_file_load_hook: bool,
    pub tag_objects: bool,
    pub object_free_events: bool,
}

/// Runtime events the agent subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostEvent {
    VmStart,
    VmDeath,
    ClassFileLoad,
    ObjectFree,
}

/// The agent entry points that can back a managed native method.
/// The binding layer maps each variant to its `extern "C"` thunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeHook {
    NewObject,
    DumpProfile,
    ClearProfile,
    SetSamplingPeriod,
}

/// One native method to register on the managed helper class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeMethod {
    pub name: &'static str,
    pub signature: &'static str,
    pub hook: NativeHook,
}

/// Transformed class bytes copied into storage obtained from the
/// runtime's own allocator, ready to hand back through the class-file
/// load hook's output parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedClassData {
    pub handle: usize,
    pub len: usize,
}

/// The primitives the profiler needs from the managed runtime.
pub trait HostRuntime: Send + Sync {
    fn add_capabilities(&self, caps: &Capabilities) -> HostResult<()>;
    fn enable_event(&self, event: HostEvent) -> HostResult<()>;

    fn create_raw_monitor(&self, name: &str) -> HostResult<MonitorId>;
    fn raw_monitor_enter(&self, monitor: MonitorId) -> HostResult<()>;
    fn raw_monitor_exit(&self, monitor: MonitorId) -> HostResult<()>;

    fn object_size(&self, object: ObjectRef) -> HostResult<u64>;

    /// Associate a 64-bit tag with `object`. A tag of 0 means
    /// untagged; the runtime reports the tag back through the
    /// object-free event.
    fn set_tag(&self, object: ObjectRef, tag: u64) -> HostResult<()>;

    /// Capture up to `max_frames` frames of `thread`'s current stack,
    /// starting `start_depth` frames below the top. Frames are ordered
    /// from the innermost call outwards.
    fn stack_trace(
        &self,
        thread: ThreadRef,
        start_depth: usize,
        max_frames: usize,
    ) -> HostResult<Vec<MethodId>>;

    fn method_name(&self, method: MethodId) -> HostResult<String>;
    fn method_declaring_class(&self, method: MethodId) -> HostResult<ClassRef>;

    /// JVM signature of the class, eg. `Ljava/lang/String;`.
    fn class_signature(&self, class: ClassRef) -> HostResult<String>;

    /// Copy `data` into a buffer obtained from the runtime's
    /// allocator, so that ownership can be handed back to the runtime.
    fn allocate_class_data(&self, data: &[u8]) -> HostResult<StagedClassData>;

    fn force_gc(&self) -> HostResult<()>;

    fn find_class(&self, name: &str) -> HostResult<ClassRef>;
    fn register_natives(&self, class: ClassRef, methods: &[NativeMethod]) -> HostResult<()>;
    fn set_static_int_field(&self, class: ClassRef, field: &str, value: i32) -> HostResult<()>;
    fn set_static_boolean_field(&self, class: ClassRef, field: &str, value: bool)
        -> HostResult<()>;
}
