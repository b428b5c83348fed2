//! An in-memory stand-in for the managed runtime, used by the test
//! suites across the workspace.
//!
//! The fake models just enough of the host to drive the profiler end
//! to end: objects with sizes and tags, scripted per-thread stacks, a
//! method/class symbol table, raw monitors, and a staging area for
//! rewritten class data. Captured stacks are prefixed with the two
//! forwarding frames the managed helper contributes on a real runtime,
//! so the hook's start-depth handling is exercised for real.

use crate::{
    Capabilities, ClassRef, HostError, HostEvent, HostResult, HostRuntime, MethodId, MonitorId,
    NativeMethod, ObjectRef, StagedClassData, ThreadRef,
};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
struct FakeMonitor {
    locked: Mutex<bool>,
    cond: Condvar,
}

impl FakeMonitor {
    fn enter(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.cond.wait(&mut locked);
        }
        *locked = true;
    }

    fn exit(&self) {
        let mut locked = self.locked.lock();
        *locked = false;
        self.cond.notify_one();
    }
}

struct FakeObject {
    size: u64,
    tag: u64,
}

struct FakeMethod {
    name: String,
    class: ClassRef,
}

#[derive(Default)]
struct State {
    monitors: Vec<Arc<FakeMonitor>>,
    objects: HashMap<ObjectRef, FakeObject>,
    next_object: usize,
    stacks: HashMap<ThreadRef, Vec<MethodId>>,
    methods: HashMap<MethodId, FakeMethod>,
    next_method: usize,
    class_signatures: HashMap<ClassRef, String>,
    classes_by_signature: HashMap<String, ClassRef>,
    classes_by_name: HashMap<String, ClassRef>,
    next_class: usize,
    broken_methods: HashSet<MethodId>,
    staged: Vec<Vec<u8>>,
    capabilities: Option<Capabilities>,
    events: Vec<HostEvent>,
    natives: Vec<NativeMethod>,
    int_fields: HashMap<(ClassRef, String), i32>,
    bool_fields: HashMap<(ClassRef, String), bool>,
    gc_count: usize,
    wrong_phase: bool,
}

pub struct FakeRuntime {
    state: Mutex<State>,
    forwarding: [MethodId; 2],
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        let runtime = FakeRuntime {
            state: Mutex::new(State::default()),
            forwarding: [MethodId(0), MethodId(0)],
        };
        // The helper's native hook and its managed wrapper sit at the
        // top of every captured stack.
        let native = runtime.define_method("_newObject", "LHeapster;");
        let wrapper = runtime.define_method("newObject", "LHeapster;");
        FakeRuntime {
            forwarding: [native, wrapper],
            ..runtime
        }
    }

    fn intern_class(state: &mut State, signature: &str) -> ClassRef {
        if let Some(class) = state.classes_by_signature.get(signature) {
            return *class;
        }
        let class = ClassRef(0x400 + state.next_class);
        state.next_class += 1;
        state.class_signatures.insert(class, signature.to_string());
        state
            .classes_by_signature
            .insert(signature.to_string(), class);
        class
    }

    /// Add a method to the symbol table, interning its declaring class
    /// by JVM signature.
    pub fn define_method(&self, name: &str, class_signature: &str) -> MethodId {
        let mut state = self.state.lock();
        let class = Self::intern_class(&mut state, class_signature);
        let method = MethodId(0x1000 + state.next_method * 0x40);
        state.next_method += 1;
        state.methods.insert(
            method,
            FakeMethod {
                name: name.to_string(),
                class,
            },
        );
        method
    }

    /// Make a class findable by name, as `find_class` requires.
    pub fn define_class(&self, name: &str) -> ClassRef {
        let mut state = self.state.lock();
        let class = Self::intern_class(&mut state, &format!("L{name};"));
        state.classes_by_name.insert(name.to_string(), class);
        class
    }

    /// Script the application frames `stack_trace` reports for
    /// `thread`, innermost first. The helper's two forwarding frames
    /// are prepended automatically.
    pub fn set_stack(&self, thread: ThreadRef, frames: Vec<MethodId>) {
        self.state.lock().stacks.insert(thread, frames);
    }

    pub fn new_object(&self, size: u64) -> ObjectRef {
        let mut state = self.state.lock();
        let object = ObjectRef(0x10000 + state.next_object);
        state.next_object += 1;
        state.objects.insert(object, FakeObject { size, tag: 0 });
        object
    }

    pub fn tag_of(&self, object: ObjectRef) -> u64 {
        self.state
            .lock()
            .objects
            .get(&object)
            .map(|o| o.tag)
            .unwrap_or(0)
    }

    /// Make symbol lookups for `method` fail.
    pub fn break_method_symbols(&self, method: MethodId) {
        self.state.lock().broken_methods.insert(method);
    }

    /// Report `WrongPhase` from subsequent stack captures.
    pub fn set_wrong_phase(&self, wrong: bool) {
        self.state.lock().wrong_phase = wrong;
    }

    pub fn staged_class_data(&self, staged: StagedClassData) -> Vec<u8> {
        self.state.lock().staged[staged.handle].clone()
    }

    pub fn capabilities(&self) -> Option<Capabilities> {
        self.state.lock().capabilities
    }

    pub fn enabled_events(&self) -> Vec<HostEvent> {
        self.state.lock().events.clone()
    }

    pub fn registered_natives(&self) -> Vec<NativeMethod> {
        self.state.lock().natives.clone()
    }

    pub fn static_int_field(&self, class: ClassRef, field: &str) -> Option<i32> {
        self.state
            .lock()
            .int_fields
            .get(&(class, field.to_string()))
            .copied()
    }

    pub fn static_boolean_field(&self, class: ClassRef, field: &str) -> Option<bool> {
        self.state
            .lock()
            .bool_fields
            .get(&(class, field.to_string()))
            .copied()
    }

    pub fn gc_count(&self) -> usize {
        self.state.lock().gc_count
    }
}

impl HostRuntime for FakeRuntime {
    fn add_capabilities(&self, caps: &Capabilities) -> HostResult<()> {
        self.state.lock().capabilities = Some(*caps);
        Ok(())
    }

    fn enable_event(&self, event: HostEvent) -> HostResult<()> {
        self.state.lock().events.push(event);
        Ok(())
    }

    fn create_raw_monitor(&self, _name: &str) -> HostResult<MonitorId> {
        let mut state = self.state.lock();
        state.monitors.push(Arc::new(FakeMonitor::default()));
        Ok(MonitorId(state.monitors.len() - 1))
    }

    fn raw_monitor_enter(&self, monitor: MonitorId) -> HostResult<()> {
        let entry = self
            .state
            .lock()
            .monitors
            .get(monitor.0)
            .cloned()
            .ok_or_else(|| HostError::failed("JVMTI_ERROR_INVALID_MONITOR"))?;
        // Block outside of the state lock so that other threads can
        // still reach the exit path.
        entry.enter();
        Ok(())
    }

    fn raw_monitor_exit(&self, monitor: MonitorId) -> HostResult<()> {
        let entry = self
            .state
            .lock()
            .monitors
            .get(monitor.0)
            .cloned()
            .ok_or_else(|| HostError::failed("JVMTI_ERROR_INVALID_MONITOR"))?;
        entry.exit();
        Ok(())
    }

    fn object_size(&self, object: ObjectRef) -> HostResult<u64> {
        self.state
            .lock()
            .objects
            .get(&object)
            .map(|o| o.size)
            .ok_or_else(|| HostError::failed("JVMTI_ERROR_INVALID_OBJECT"))
    }

    fn set_tag(&self, object: ObjectRef, tag: u64) -> HostResult<()> {
        let mut state = self.state.lock();
        let object = state
            .objects
            .get_mut(&object)
            .ok_or_else(|| HostError::failed("JVMTI_ERROR_INVALID_OBJECT"))?;
        object.tag = tag;
        Ok(())
    }

    fn stack_trace(
        &self,
        thread: ThreadRef,
        start_depth: usize,
        max_frames: usize,
    ) -> HostResult<Vec<MethodId>> {
        let state = self.state.lock();
        if state.wrong_phase {
            return Err(HostError::WrongPhase);
        }
        let scripted = state.stacks.get(&thread).cloned().unwrap_or_default();
        let full: Vec<MethodId> = self
            .forwarding
            .iter()
            .copied()
            .chain(scripted)
            .collect();
        Ok(full
            .into_iter()
            .skip(start_depth)
            .take(max_frames)
            .collect())
    }

    fn method_name(&self, method: MethodId) -> HostResult<String> {
        let state = self.state.lock();
        if state.broken_methods.contains(&method) {
            return Err(HostError::failed("JVMTI_ERROR_INVALID_METHODID"));
        }
        state
            .methods
            .get(&method)
            .map(|m| m.name.clone())
            .ok_or_else(|| HostError::failed("JVMTI_ERROR_INVALID_METHODID"))
    }

    fn method_declaring_class(&self, method: MethodId) -> HostResult<ClassRef> {
        let state = self.state.lock();
        if state.broken_methods.contains(&method) {
            return Err(HostError::failed("JVMTI_ERROR_INVALID_METHODID"));
        }
        state
            .methods
            .get(&method)
            .map(|m| m.class)
            .ok_or_else(|| HostError::failed("JVMTI_ERROR_INVALID_METHODID"))
    }

    fn class_signature(&self, class: ClassRef) -> HostResult<String> {
        self.state
            .lock()
            .class_signatures
            .get(&class)
            .cloned()
            .ok_or_else(|| HostError::failed("JVMTI_ERROR_INVALID_CLASS"))
    }

    fn allocate_class_data(&self, data: &[u8]) -> HostResult<StagedClassData> {
        let mut state = self.state.lock();
        state.staged.push(data.to_vec());
        Ok(StagedClassData {
            handle: state.staged.len() - 1,
            len: data.len(),
        })
    }

    fn force_gc(&self) -> HostResult<()> {
        self.state.lock().gc_count += 1;
        Ok(())
    }

    fn find_class(&self, name: &str) -> HostResult<ClassRef> {
        self.state
            .lock()
            .classes_by_name
            .get(name)
            .copied()
            .ok_or_else(|| HostError::failed("NoClassDefFoundError"))
    }

    fn register_natives(&self, _class: ClassRef, methods: &[NativeMethod]) -> HostResult<()> {
        self.state.lock().natives.extend_from_slice(methods);
        Ok(())
    }

    fn set_static_int_field(&self, class: ClassRef, field: &str, value: i32) -> HostResult<()> {
        self.state
            .lock()
            .int_fields
            .insert((class, field.to_string()), value);
        Ok(())
    }

    fn set_static_boolean_field(&self, class: ClassRef, field: &str, value: bool) -> HostResult<()> {
        self.state
            .lock()
            .bool_fields
            .insert((class, field.to_string()), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_capture_skips_forwarding_frames() {
        let fake = FakeRuntime::new();
        let thread = ThreadRef(1);
        let leaf = fake.define_method("make", "LFactory;");
        fake.set_stack(thread, vec![leaf]);

        let frames = fake.stack_trace(thread, 2, 100).unwrap();
        assert_eq!(frames, vec![leaf]);

        // Without the skip the helper frames are visible.
        let frames = fake.stack_trace(thread, 0, 100).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(fake.method_name(frames[0]).unwrap(), "_newObject");
    }

    #[test]
    fn objects_carry_tags() {
        let fake = FakeRuntime::new();
        let object = fake.new_object(24);
        assert_eq!(fake.object_size(object).unwrap(), 24);
        assert_eq!(fake.tag_of(object), 0);

        fake.set_tag(object, 7).unwrap();
        assert_eq!(fake.tag_of(object), 7);
    }

    #[test]
    fn missing_object_reports_host_error() {
        let fake = FakeRuntime::new();
        assert_eq!(
            fake.object_size(ObjectRef(999)),
            Err(HostError::failed("JVMTI_ERROR_INVALID_OBJECT"))
        );
    }
}
