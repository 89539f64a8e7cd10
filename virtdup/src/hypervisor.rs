//! libvirt driven through the `virsh` command-line interface.
//!
//! Domain lifecycle stays with libvirt; this adapter only issues the
//! state/dump/destroy/undefine/define calls the cloning flow needs and
//! reports their output verbatim in errors.

use std::io::Write;

use crate::errors::{DupError, DupResult};
use crate::util::cmd::{run, run_ok};

/// Thin adapter over `virsh`.
#[derive(Debug, Default)]
pub struct Virsh;

impl Virsh {
    pub fn new() -> Self {
        Self
    }

    /// Current state string for a domain (`running`, `shut off`, ...), or
    /// `None` when libvirt does not know the name.
    pub fn dom_state(&self, name: &str) -> DupResult<Option<String>> {
        let out = run("virsh", &["domstate", name])?;
        if out.success() {
            Ok(Some(out.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// The domain's persisted XML.
    pub fn dumpxml(&self, name: &str) -> DupResult<String> {
        Ok(run_ok("virsh", &["dumpxml", name])?.stdout)
    }

    /// Force-stop an active domain.
    pub fn destroy(&self, name: &str) -> DupResult<()> {
        run_ok("virsh", &["destroy", name])?;
        Ok(())
    }

    /// Remove a domain definition from libvirt.
    pub fn undefine(&self, name: &str) -> DupResult<()> {
        run_ok("virsh", &["undefine", name])?;
        Ok(())
    }

    /// Define a domain from in-memory XML via a transient file, confirmed by
    /// the `defined` acknowledgment virsh prints.
    pub fn define_xml(&self, xml: &str, tag: &str) -> DupResult<()> {
        let mut file = tempfile::Builder::new()
            .prefix("virt_dup_domxml_")
            .suffix(&format!(".{tag}.xml"))
            .tempfile()
            .map_err(|e| DupError::io(std::env::temp_dir(), e))?;
        file.write_all(xml.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| DupError::io(file.path(), e))?;

        let path = file.path().display().to_string();
        tracing::info!(tag, "virsh define {path}");
        let out = run_ok("virsh", &["define", path.as_str()])?;
        if !out.stdout.contains("defined") {
            return Err(DupError::tool(
                "virsh",
                format!("define not acknowledged: {}", out.stdout.trim()),
            ));
        }
        Ok(())
    }

    /// Make `name` resolve to `xml`, destroying and undefining any existing
    /// domain of that name first. Non-reversible for whatever was defined
    /// under that name before.
    pub fn replace_domain(&self, name: &str, xml: &str) -> DupResult<()> {
        if let Some(state) = self.dom_state(name)? {
            if !state.contains("shut off") {
                tracing::info!(domain = name, state = %state, "target domain is active, destroying it");
                self.destroy(name)?;
            }
            tracing::info!(domain = name, "target domain already defined, undefining it");
            self.undefine(name)?;
        }
        self.define_xml(xml, name)
    }
}
