//! Profile emission in the google-perftools heap format: a text
//! symbol block followed by a binary profile block.
//!
//! The binary block is pointer-width words in host byte order; the
//! format is little-endian-host only and cross-architecture use needs
//! a byte-swap step that is out of scope here.

use heapster_host::{HostRuntime, MethodId};
use heapster_sites::SiteTable;

pub mod decode;
mod io;

pub use io::write_profile;

const WORD: usize = std::mem::size_of::<usize>();

/// Fixed header of the binary profile block; pprof recognizes this as
/// a heap profile.
pub(crate) const PROFILE_HEADER: [usize; 5] = [0, 3, 0, 1, 0];

/// Serialize the call-site table into the two-block profile format.
/// Callers must hold the table monitor for the duration.
pub fn serialize(host: &dyn HostRuntime, table: &SiteTable) -> Vec<u8> {
    let mut out = Vec::new();

    out.extend_from_slice(b"--- symbol\n");
    out.extend_from_slice(b"binary=heapster\n");

    let mut seen = ahash::HashSet::default();
    for site in table.sites() {
        // Sites with no live bytes contribute nothing to the symbol
        // table.
        if site.num_bytes() == 0 {
            continue;
        }
        for &method in site.stack() {
            if seen.contains(&method) {
                continue;
            }
            let Some(line) = symbolize(host, method) else {
                continue;
            };
            out.extend_from_slice(line.as_bytes());
            seen.insert(method);
        }
    }
    out.extend_from_slice(b"---\n");

    out.extend_from_slice(b"--- profile\n");
    for word in PROFILE_HEADER {
        push_word(&mut out, word);
    }
    for site in table.sites() {
        push_word(&mut out, site.num_bytes() as usize);
        push_word(&mut out, site.nframes());
        for &method in site.stack() {
            push_word(&mut out, method.0);
        }
    }

    out
}

/// Resolve one frame to its symbol line. A failed lookup skips the
/// frame rather than aborting the dump.
fn symbolize(host: &dyn HostRuntime, method: MethodId) -> Option<String> {
    let name = host.method_name(method).ok()?;
    let class = host.method_declaring_class(method).ok()?;
    let signature = host.class_signature(class).ok()?;
    Some(format!(
        "{:#0width$x} {signature}{name}\n",
        method.0,
        width = 2 + WORD * 2
    ))
}

fn push_word(out: &mut Vec<u8>, word: usize) {
    out.extend_from_slice(&word.to_ne_bytes());
}
