//! The heapster agent: a sampling heap profiler for a managed
//! runtime.
//!
//! Every class the runtime loads is rewritten so that object and
//! array allocations call back into [`Agent::record_allocation`]
//! through the managed helper class. A geometric sampler picks roughly
//! one allocation per sampling period of allocated bytes; sampled
//! allocations are aggregated per call site and tagged so that the
//! runtime's object-free event can return their bytes when they die.
//! [`Agent::dump_profile`] emits the aggregate in the
//! google-perftools heap format.

use anyhow::Context;
use heapster_host::{
    fatal_host_error, Capabilities, HostError, HostEvent, HostRuntime, Monitor, NativeHook,
    NativeMethod, ObjectRef, StagedClassData, ThreadRef,
};
use heapster_sampler::Sampler;
use heapster_sites::{hash_stack, Site, SiteTable, MAX_FRAMES};
use humansize::{format_size, DECIMAL};
use std::sync::{Arc, OnceLock};

mod config;
mod instrument;

pub use config::{AgentConfig, PROFILE_PATH_ENV, SAMPLE_PERIOD_ENV};
pub use instrument::{ClassRewriter, RewriteRequest};


/// Name of the managed helper class the instrumentation calls into.
pub const HELPER_CLASS: &str = "Heapster";
pub const HELPER_CLASS_DESCRIPTOR: &str = "LHeapster;";

const HELPER_FIELD_IS_READY: &str = "isReady";
const HELPER_FIELD_IS_PROFILING: &str = "isProfiling";

/// Helper method invoked by rewritten bytecode on every allocation;
/// shared by object-creation and array-creation sites.
pub const OBJECT_HOOK_METHOD: &str = "newObject";
pub const OBJECT_HOOK_SIGNATURE: &str = "(Ljava/lang/Object;)V";

/// Frames of the helper's own forwarding code at the top of every
/// captured stack.
const HOOK_FRAMES: usize = 2;

const NATIVE_METHODS: &[NativeMethod] = &[
    NativeMethod {
        name: "_newObject",
        signature: "(Ljava/lang/Object;Ljava/lang/Object;)V",
        hook: NativeHook::NewObject,
    },
    NativeMethod {
        name: "_dumpProfile",
        signature: "(Z)[B",
        hook: NativeHook::DumpProfile,
    },
    NativeMethod {
        name: "_clearProfile",
        signature: "()V",
        hook: NativeHook::ClearProfile,
    },
    NativeMethod {
        name: "_setSamplingPeriod",
        signature: "(I)V",
        hook: NativeHook::SetSamplingPeriod,
    },
];

/// One sampled live object. Holding the site's `Arc` is what keeps an
/// orphaned site alive until its last object is freed.
struct Allocation {
    site: Arc<Site>,
    size: u64,
}

/// Everything guarded by the table monitor.
struct ProfileState {
    table: SiteTable,
    /// Live sampled objects, keyed by the tag set on the managed
    /// object. Tag 0 means unsampled, so tags start at 1.
    live: ahash::HashMap<u64, Allocation>,
    next_tag: u64,
    class_count: u32,
    vm_started: bool,
}

pub struct Agent {
    host: Arc<dyn HostRuntime>,
    rewriter: Arc<dyn ClassRewriter>,
    config: AgentConfig,
    state: Monitor<ProfileState>,
    sampler: Monitor<Sampler>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Agent {
    /// Wire the agent into the host runtime: capabilities, event
    /// subscriptions, the two named monitors, the sampler and the
    /// (empty) call-site table.
    pub fn new(
        host: Arc<dyn HostRuntime>,
        rewriter: Arc<dyn ClassRewriter>,
        config: AgentConfig,
    ) -> anyhow::Result<Self> {
        host.add_capabilities(&Capabilities {
            class_file_load_hook: true,
            tag_objects: true,
            object_free_events: true,
        })
        .context("failed to add capabilities")?;

        for event in [
            HostEvent::VmStart,
            HostEvent::VmDeath,
            HostEvent::ClassFileLoad,
            HostEvent::ObjectFree,
        ] {
            host.enable_event(event)
                .with_context(|| format!("failed to enable {event:?} events"))?;
        }

        let state = Monitor::new(
            host.clone(),
            "heapster state",
            ProfileState {
                table: SiteTable::new(),
                live: ahash::HashMap::default(),
                next_tag: 1,
                class_count: 0,
                vm_started: false,
            },
        )
        .context("failed to create the state monitor")?;

        let sampler = Monitor::new(
            host.clone(),
            "sampler state",
            Sampler::new(0, config.sample_period),
        )
        .context("failed to create the sampler monitor")?;

        Ok(Agent {
            host,
            rewriter,
            config,
            state,
            sampler,
        })
    }

    /// Allocation hook, called by the managed helper with every object
    /// the rewritten bytecode reports.
    pub fn record_allocation(&self, thread: ThreadRef, object: ObjectRef) {
        let size = self
            .host
            .object_size(object)
            .unwrap_or_else(|err| fatal_host_error("failed to get size of object", &err));

        {
            let mut sampler = self.sampler.lock();
            if !sampler.sample_allocation(size) {
                return;
            }
        }

        // Start the capture below the helper's own forwarding frames.
        let frames = match self.host.stack_trace(thread, HOOK_FRAMES, MAX_FRAMES) {
            Ok(frames) => frames,
            // Allocations during shutdown phases are unrecoverable;
            // drop the sample.
            Err(HostError::WrongPhase) => return,
            Err(err) => fatal_host_error("failed to capture allocation stack", &err),
        };

        let hash = hash_stack(&frames);
        let tag = {
            let mut state = self.state.lock();
            let site = state.table.record_allocation(hash, &frames, size);
            let tag = state.next_tag;
            state.next_tag += 1;
            state.live.insert(tag, Allocation { site, size });
            tag
        };

        // Tagging is synchronous within the hook, so a sampled object
        // can never reach the free event untagged.
        self.host
            .set_tag(object, tag)
            .unwrap_or_else(|err| fatal_host_error("failed to tag sampled object", &err));
    }

    /// Object-free hook; runs on GC threads with the tag of a sampled
    /// object.
    pub fn object_free(&self, tag: u64) {
        let mut state = self.state.lock();
        let Some(allocation) = state.live.remove(&tag) else {
            tracing::debug!("object-free event for unknown tag {tag}");
            return;
        };
        allocation.site.release_bytes(allocation.size);
        // Dropping the record drops its site reference; for a site
        // orphaned by clear_profile whose last object this was, that
        // frees the site.
    }

    /// Class-file load hook. Returns staged class data to hand back to
    /// the runtime, or None to let the class load unmodified.
    pub fn class_file_load(&self, name: Option<&str>, class_data: &[u8]) -> Option<StagedClassData> {
        let class_name = match name {
            Some(name) => name.to_string(),
            None => match self.rewriter.class_name(class_data) {
                Some(name) => name,
                None => {
                    tracing::error!("failed to find classname in class data");
                    std::process::abort();
                }
            },
        };

        // The helper class must not observe its own allocations.
        if class_name == HELPER_CLASS {
            return None;
        }

        let (class_num, is_system_class) = {
            let mut state = self.state.lock();
            let class_num = state.class_count;
            state.class_count += 1;
            (class_num, !state.vm_started)
        };

        let rewritten = self.rewriter.rewrite(&RewriteRequest {
            class_num,
            class_name: &class_name,
            class_data,
            is_system_class,
            helper_class: HELPER_CLASS,
            helper_class_descriptor: HELPER_CLASS_DESCRIPTOR,
            object_hook_method: OBJECT_HOOK_METHOD,
            object_hook_signature: OBJECT_HOOK_SIGNATURE,
            array_hook_method: OBJECT_HOOK_METHOD,
            array_hook_signature: OBJECT_HOOK_SIGNATURE,
        })?;

        let staged = self
            .host
            .allocate_class_data(&rewritten)
            .unwrap_or_else(|err| {
                fatal_host_error("failed to allocate buffer for rewritten class", &err)
            });
        Some(staged)
    }

    /// VM-start hook: the helper class is loadable now. Register its
    /// natives and let it start forwarding allocations.
    pub fn vm_start(&self) -> anyhow::Result<()> {
        self.state.lock().vm_started = true;

        let helper = self
            .host
            .find_class(HELPER_CLASS)
            .with_context(|| format!("failed to find the helper class ({HELPER_CLASS})"))?;

        self.host
            .register_natives(helper, NATIVE_METHODS)
            .with_context(|| format!("failed to register natives for {HELPER_CLASS}"))?;

        self.host
            .set_static_int_field(helper, HELPER_FIELD_IS_READY, 1)
            .with_context(|| format!("failed to set {HELPER_FIELD_IS_READY}"))?;

        // With a dump path configured, profiling starts immediately
        // rather than waiting for someone to flip the switch.
        if self.config.profile_path.is_some() {
            self.host
                .set_static_boolean_field(helper, HELPER_FIELD_IS_PROFILING, true)
                .with_context(|| format!("failed to set {HELPER_FIELD_IS_PROFILING}"))?;
        }

        Ok(())
    }

    /// VM-death hook: write the profile to the configured path, if
    /// any. A dying VM gets a logged error at most.
    pub fn vm_death(&self) {
        let Some(path) = &self.config.profile_path else {
            return;
        };

        let profile = self.dump_profile(false);
        match heapster_profile::write_profile(path, &profile) {
            Ok(()) => tracing::info!(
                "profile written to {} ({})",
                path.display(),
                format_size(profile.len() as u64, DECIMAL),
            ),
            Err(err) => {
                tracing::error!("failed to write profile to {}: {err:#}", path.display())
            }
        }
    }

    /// Serialize the current profile. When `force_gc` is set, a full
    /// collection drains freed-but-unreported objects first so the
    /// snapshot reflects live data only.
    pub fn dump_profile(&self, force_gc: bool) -> Vec<u8> {
        if force_gc {
            if let Err(err) = self.host.force_gc() {
                tracing::warn!("failed to force garbage collection: {err}");
            }
        }

        let state = self.state.lock();
        let profile = heapster_profile::serialize(self.host.as_ref(), &state.table);

        let (nsites, live_bytes) = state
            .table
            .sites()
            .fold((0u64, 0u64), |(n, b), site| (n + 1, b + site.num_bytes()));
        tracing::debug!("dumped {nsites} sites with {live_bytes} live sampled bytes");

        profile
    }

    /// Forget all accumulated sites. Sites that still have live
    /// sampled bytes stick around, inactive, until their objects are
    /// freed; subsequent allocations repopulate the table from
    /// scratch.
    pub fn clear_profile(&self) {
        self.state.lock().table.clear();
    }

    /// Re-seed the sampler with a new mean sampling period, in bytes.
    pub fn set_sampling_period(&self, period: u64) {
        self.sampler.lock().init(0, period);
    }
}

static AGENT: OnceLock<Agent> = OnceLock::new();

/// Install the process-wide agent instance. The host's event callbacks
/// carry no user data, so they trampoline through [`agent`].
pub fn initialize(
    host: Arc<dyn HostRuntime>,
    rewriter: Arc<dyn ClassRewriter>,
    config: AgentConfig,
) -> anyhow::Result<&'static Agent> {
    let instance = Agent::new(host, rewriter, config)?;
    AGENT
        .set(instance)
        .map_err(|_| anyhow::anyhow!("heapster agent is already initialized"))?;
    Ok(agent())
}

pub fn agent() -> &'static Agent {
    AGENT.get().expect("heapster agent is not initialized")
}
