//! The bytecode-rewriter collaborator surface.
//!
//! The rewriter itself lives outside this workspace; the agent only
//! depends on its contract: after a successful rewrite, every object
//! instantiation and array allocation in the class invokes the named
//! helper method with the newly created reference as its argument.

/// Everything the rewriter needs for one class.
#[derive(Debug, Clone, Copy)]
pub struct RewriteRequest<'a> {
    /// Monotonic number assigned to this class by load order.
    pub class_num: u32,
    pub class_name: &'a str,
    pub class_data: &'a [u8],
    /// Classes loaded before VM start get a minimal instrumentation
    /// variant that is safe to execute before the helper is ready.
    pub is_system_class: bool,
    pub helper_class: &'a str,
    pub helper_class_descriptor: &'a str,
    pub object_hook_method: &'a str,
    pub object_hook_signature: &'a str,
    pub array_hook_method: &'a str,
    pub array_hook_signature: &'a str,
}

pub trait ClassRewriter: Send + Sync {
    /// Extract the class name from raw class bytes, for load events
    /// that carry no name.
    fn class_name(&self, class_data: &[u8]) -> Option<String>;

    /// Rewrite the class, or return None to leave it untouched.
    fn rewrite(&self, request: &RewriteRequest) -> Option<Vec<u8>>;
}
