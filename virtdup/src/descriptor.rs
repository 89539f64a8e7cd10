//! Domain XML transformation.
//!
//! The descriptor is treated as structured text: each identity-bearing field
//! is individually matched and replaced, everything around it passes through
//! byte-for-byte. Disk source paths are rewritten only when their filename is
//! prefixed by the source domain name; anything else is a shared image and
//! stays untouched.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::errors::{DupError, DupResult};
use crate::ids::IdSource;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<name>.*</name>").expect("valid name pattern"));
static UUID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<uuid>.*</uuid>").expect("valid uuid pattern"));
static MAC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<mac address='[^']*'/>").expect("valid mac pattern"));
static ANY_SOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(<source file=')(\S*/)(\S+)('.*/>)$").expect("valid source pattern")
});

/// Source-path pattern anchored on the domain name as filename prefix.
///
/// Capture groups: 1 = attribute opening, 2 = directory, 3 = the name
/// prefix, 4 = filename remainder, 5 = attribute close.
fn prefixed_source_re(vm_name: &str) -> Regex {
    Regex::new(&format!(
        r"(?m)(<source file=')(\S*/)({})(\S+)('.*/>)$",
        regex::escape(vm_name)
    ))
    .expect("valid prefixed source pattern")
}

/// One disk image to duplicate for a target clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePlan {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// Reject XML that lacks the fields every libvirt descriptor carries.
pub fn require_fields(xml: &str) -> DupResult<()> {
    if !NAME_RE.is_match(xml) {
        return Err(DupError::Descriptor("name"));
    }
    if !UUID_RE.is_match(xml) {
        return Err(DupError::Descriptor("uuid"));
    }
    Ok(())
}

/// Derive a target descriptor from the source one.
///
/// Name and UUID are replaced wholesale, each `<mac address=../>` gets its
/// own fresh address, and disk sources prefixed by `source_name` have just
/// the prefix swapped for `target_name`. Field order and surrounding
/// structure are preserved verbatim.
pub fn rewrite(
    xml: &str,
    source_name: &str,
    target_name: &str,
    ids: &mut dyn IdSource,
) -> DupResult<String> {
    require_fields(xml)?;

    let out = NAME_RE
        .replace(xml, |_: &Captures| format!("<name>{target_name}</name>"))
        .into_owned();
    let out = UUID_RE
        .replace(&out, |_: &Captures| {
            format!("<uuid>{}</uuid>", ids.domain_uuid())
        })
        .into_owned();
    let out = MAC_RE
        .replace_all(&out, |_: &Captures| {
            format!("<mac address='{}'/>", ids.mac_address())
        })
        .into_owned();
    let out = prefixed_source_re(source_name)
        .replace_all(&out, |c: &Captures| {
            format!("{}{}{}{}{}", &c[1], &c[2], target_name, &c[4], &c[5])
        })
        .into_owned();

    tracing::debug!(from = source_name, to = target_name, "descriptor derived");
    Ok(out)
}

/// The (source image, duplicated image) pairs a target clone needs.
pub fn image_plans(xml: &str, source_name: &str, target_name: &str) -> Vec<ImagePlan> {
    prefixed_source_re(source_name)
        .captures_iter(xml)
        .map(|c| ImagePlan {
            source: PathBuf::from(format!("{}{}{}", &c[2], &c[3], &c[4])),
            target: PathBuf::from(format!("{}{}{}", &c[2], target_name, &c[4])),
        })
        .collect()
}

/// Disk sources whose filename is not prefixed by the domain name: images
/// shared among VMs, reported but never rewritten or duplicated.
pub fn shared_images(xml: &str, source_name: &str) -> Vec<PathBuf> {
    ANY_SOURCE_RE
        .captures_iter(xml)
        .filter(|c| !c[3].starts_with(source_name))
        .map(|c| PathBuf::from(format!("{}{}", &c[2], &c[3])))
        .collect()
}
