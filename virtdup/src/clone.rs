//! Per-target clone orchestration.
//!
//! Targets are processed strictly in sequence: the NBD slot pool is global
//! host state and its discover-then-attach step must not be raced. One
//! target failing releases everything it acquired (LIFO) and the run moves
//! on; only an unusable source descriptor stops the whole run.

use std::path::Path;

use crate::descriptor;
use crate::errors::{DupError, DupResult};
use crate::hypervisor::Virsh;
use crate::identity::{NetworkMode, rewrite_identity};
use crate::ids::{IdSource, RandomIds};
use crate::imaging;
use crate::layout::classify_device;
use crate::mounts::{Mounter, SysMounter};
use crate::nbd::{DeviceStager, NbdPool, QemuNbd};
use crate::util::cmd::run_ok;

/// One requested clone: target name plus its resolved network treatment.
#[derive(Debug, Clone)]
pub struct CloneRequest {
    pub name: String,
    pub network: NetworkMode,
}

/// Outcome of one requested clone.
#[derive(Debug)]
pub struct TargetOutcome {
    pub name: String,
    pub result: DupResult<()>,
}

/// Per-target outcomes of one run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<TargetOutcome>,
}

impl RunReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &TargetOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &TargetOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }
}

/// Drives one duplication run; every capability injected, nothing
/// process-global.
pub struct CloneEngine {
    virsh: Virsh,
    stager: DeviceStager,
    mounter: Box<dyn Mounter>,
    ids: Box<dyn IdSource>,
}

impl CloneEngine {
    /// Production wiring: qemu-nbd on the host pool, kernel mounts, random
    /// identifiers. Loads the nbd module so device nodes exist.
    pub fn host_default() -> DupResult<Self> {
        run_ok("modprobe", &["nbd", "max_part=8"])?;
        Ok(Self::new(
            Virsh::new(),
            DeviceStager::new(NbdPool::host(), Box::new(QemuNbd)),
            Box::new(SysMounter),
            Box::new(RandomIds),
        ))
    }

    pub fn new(
        virsh: Virsh,
        stager: DeviceStager,
        mounter: Box<dyn Mounter>,
        ids: Box<dyn IdSource>,
    ) -> Self {
        Self {
            virsh,
            stager,
            mounter,
            ids,
        }
    }

    /// Clone `source` into every requested target, sequentially.
    ///
    /// A missing source domain or an XML without its mandatory fields is
    /// fatal; any later failure is confined to the target it struck and
    /// recorded in the report.
    pub fn run(&mut self, source: &str, requests: &[CloneRequest]) -> DupResult<RunReport> {
        if self.virsh.dom_state(source)?.is_none() {
            return Err(DupError::tool(
                "virsh",
                format!("the virtual machine '{source}' doesn't exist"),
            ));
        }
        let xml = self.virsh.dumpxml(source)?;
        descriptor::require_fields(&xml)?;

        for image in descriptor::shared_images(&xml, source) {
            tracing::info!(image = %image.display(), "image is shared among VMs, left untouched");
        }

        let mut report = RunReport::default();
        for request in requests {
            tracing::info!(source, clone = %request.name, "cloning");
            let result = self.clone_one(&xml, source, request);
            if let Err(e) = &result {
                tracing::error!(clone = %request.name, error = %e, "clone failed");
            }
            report.outcomes.push(TargetOutcome {
                name: request.name.clone(),
                result,
            });
        }
        Ok(report)
    }

    fn clone_one(&mut self, xml: &str, source: &str, request: &CloneRequest) -> DupResult<()> {
        let new_xml = descriptor::rewrite(xml, source, &request.name, self.ids.as_mut())?;
        self.virsh.replace_domain(&request.name, &new_xml)?;

        for plan in descriptor::image_plans(xml, source, &request.name) {
            tracing::info!(
                src = %plan.source.display(),
                dst = %plan.target.display(),
                "duplicating image"
            );
            imaging::duplicate(&plan.source, &plan.target)?;

            if !imaging::is_qcow2(&plan.target)? {
                tracing::info!(
                    image = %plan.target.display(),
                    "not a qcow2 image, guest identity left as-is"
                );
                continue;
            }
            self.rewrite_guest(&plan.target, request)?;
        }
        Ok(())
    }

    /// Stage the duplicated image and rewrite identity inside it. The device
    /// goes back to the pool on every path, after all inner mounts are gone.
    fn rewrite_guest(&mut self, image: &Path, request: &CloneRequest) -> DupResult<()> {
        let dev = self.stager.stage(image)?;

        let worked = classify_device(&dev, self.mounter.as_ref(), &request.name).and_then(|root| {
            tracing::info!(
                layout = ?root.layout,
                etc = %root.etc_dir().display(),
                "configuration root resolved"
            );
            let rewritten = rewrite_identity(root.etc_dir(), &request.name, &request.network);
            let released = root.release();
            rewritten.and(released)
        });

        let detached = self.stager.release(dev);
        worked.and(detached)
    }
}
