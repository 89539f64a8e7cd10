//! Guest storage-topology classification.
//!
//! Four layouts reach `/etc` differently: a plain root partition, a writable
//! btrfs root, an immutable (read-only) root whose `/etc` is an overlay
//! within the same partition, and the split layout where a read-only root
//! and a separate writable var partition are joined by an overlay. A
//! read-only btrfs root without the immutable-OS release marker is ambiguous
//! until its var companion shows up later in partition order, so the scan
//! defers judgment instead of failing.

use std::path::{Path, PathBuf};

use crate::errors::{DupError, DupResult};
use crate::mounts::{
    Mounter, OverlayMount, OverlaySpec, PartitionMount, mount_overlay, mount_partition,
};
use crate::nbd::{Partition, StagedDevice, dev_node};
use crate::util::cmd::run_ok;

/// Filesystems a guest root can live on.
const ROOT_FSTYPES: [&str; 4] = ["btrfs", "ext4", "ocfs2", "xfs"];

/// How a guest's configuration root is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestLayout {
    /// A single writable partition carries `/etc` directly.
    Plain,
    /// Writable btrfs root, `/etc` directly on it.
    CowNormal,
    /// Read-only root whose `/etc` overlay resolves within the same
    /// partition.
    ImmutableOverlay,
    /// Read-only root plus a separate writable var partition, joined by an
    /// overlay.
    SplitRootVar,
}

/// Everything the pure classifier needs to know about one mounted
/// partition.
#[derive(Debug, Clone)]
pub struct PartitionFacts {
    pub name: String,
    pub fstype: String,
    /// `/etc`, `/boot` and `/var` all present.
    pub root_shaped: bool,
    /// btrfs read-only property; `None` on other filesystems.
    pub read_only: Option<bool>,
    /// Release metadata identifies an immutable (transactional-update) OS.
    pub immutable_marker: bool,
    /// Carries the `lib/overlay` state directory of a split var partition.
    pub overlay_state: bool,
}

/// Scan state threaded across partitions.
#[derive(Debug, Default)]
pub struct ScanState {
    /// Read-only root seen earlier, pending its var companion.
    pub deferred_root: Option<String>,
}

/// Outcome of looking at one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStep {
    Classified(GuestLayout),
    /// Remembered as split-root candidate; keep scanning.
    Deferred,
    Skip,
}

/// One pure classification step per partition, in listed order.
pub fn scan_partition(state: &mut ScanState, facts: &PartitionFacts) -> ScanStep {
    if !ROOT_FSTYPES.contains(&facts.fstype.as_str()) {
        return ScanStep::Skip;
    }

    if facts.fstype != "btrfs" {
        return if facts.root_shaped {
            ScanStep::Classified(GuestLayout::Plain)
        } else {
            ScanStep::Skip
        };
    }

    match facts.read_only {
        Some(false) if facts.root_shaped && state.deferred_root.is_none() => {
            return ScanStep::Classified(GuestLayout::CowNormal);
        }
        Some(true) if facts.root_shaped => {
            if facts.immutable_marker {
                return ScanStep::Classified(GuestLayout::ImmutableOverlay);
            }
            state.deferred_root = Some(facts.name.clone());
            return ScanStep::Deferred;
        }
        _ => {}
    }

    if facts.overlay_state && state.deferred_root.is_some() {
        return ScanStep::Classified(GuestLayout::SplitRootVar);
    }
    ScanStep::Skip
}

/// A resolved configuration root and the mounts keeping it reachable.
///
/// Field order mirrors teardown order: overlay first, then the root
/// partition (acquired last in the split layout), then the var partition.
pub struct ConfigRoot<'m> {
    pub layout: GuestLayout,
    etc: PathBuf,
    overlay: Option<OverlayMount<'m>>,
    root_mount: PartitionMount<'m>,
    var_mount: Option<PartitionMount<'m>>,
}

impl<'m> ConfigRoot<'m> {
    /// The writable directory holding the guest's identity configuration.
    pub fn etc_dir(&self) -> &Path {
        &self.etc
    }

    /// LIFO teardown. Every unmount is attempted; the first error wins.
    pub fn release(self) -> DupResult<()> {
        let ConfigRoot {
            overlay,
            root_mount,
            var_mount,
            ..
        } = self;
        let mut result = Ok(());
        if let Some(overlay) = overlay {
            result = result.and(overlay.unmount());
        }
        result = result.and(root_mount.unmount());
        if let Some(var) = var_mount {
            result = result.and(var.unmount());
        }
        result
    }
}

/// Walk the staged device's partitions and resolve the guest's writable
/// configuration root.
pub fn classify_device<'m>(
    dev: &StagedDevice,
    mounter: &'m dyn Mounter,
    tag: &str,
) -> DupResult<ConfigRoot<'m>> {
    let mut state = ScanState::default();

    for part in dev.partitions()? {
        if !ROOT_FSTYPES.contains(&part.fstype.as_str()) {
            continue;
        }
        let mut mount = mount_partition(mounter, &part.device_path(), &part.fstype, tag)?;
        let facts = gather_facts(&part, mount.path())?;
        tracing::debug!(partition = %facts.name, fstype = %facts.fstype,
            root_shaped = facts.root_shaped, read_only = ?facts.read_only,
            "inspecting partition");

        match scan_partition(&mut state, &facts) {
            ScanStep::Classified(GuestLayout::Plain) => {
                return Ok(plain_root(GuestLayout::Plain, mount));
            }
            ScanStep::Classified(GuestLayout::CowNormal) => {
                // /var may live on its own subvolume; surface it so the
                // guest tree is complete while it is being rewritten.
                mount.mount_var_subvolume()?;
                return Ok(plain_root(GuestLayout::CowNormal, mount));
            }
            ScanStep::Classified(GuestLayout::ImmutableOverlay) => {
                return immutable_overlay_root(mounter, mount, tag);
            }
            ScanStep::Classified(GuestLayout::SplitRootVar) => {
                // scan_partition only yields SplitRootVar with a root
                // deferred earlier in this scan.
                let Some(root_name) = state.deferred_root.clone() else {
                    continue;
                };
                return split_root_var_root(mounter, &root_name, mount, tag);
            }
            ScanStep::Deferred | ScanStep::Skip => mount.unmount()?,
        }
    }

    Err(DupError::UnknownLayout {
        device: dev.path().display().to_string(),
    })
}

fn plain_root(layout: GuestLayout, mount: PartitionMount<'_>) -> ConfigRoot<'_> {
    ConfigRoot {
        layout,
        etc: mount.path().join("etc"),
        overlay: None,
        root_mount: mount,
        var_mount: None,
    }
}

/// Immutable single-partition layout: the overlay triple resolves entirely
/// within this mount.
fn immutable_overlay_root<'m>(
    mounter: &'m dyn Mounter,
    mut root: PartitionMount<'m>,
    tag: &str,
) -> DupResult<ConfigRoot<'m>> {
    let resolved = (|| {
        // The var subvolume (when present) backs the overlay's writable
        // upper side.
        root.mount_var_subvolume()?;
        let root_path = root.path().to_path_buf();
        let spec = etc_overlay_spec(&root_path)?
            .substitute("/sysroot/etc", &root_path.join("etc").display().to_string())
            .substitute("/sysroot/var", &root_path.join("var").display().to_string());
        mount_overlay(mounter, &spec, tag)
    })();

    match resolved {
        Ok(overlay) => Ok(ConfigRoot {
            layout: GuestLayout::ImmutableOverlay,
            etc: overlay.path().to_path_buf(),
            overlay: Some(overlay),
            root_mount: root,
            var_mount: None,
        }),
        Err(e) => {
            if let Err(u) = root.unmount() {
                tracing::warn!(error = %u, "root unmount after failed overlay resolution");
            }
            Err(e)
        }
    }
}

/// Split layout: remount the deferred read-only root, then join it with the
/// var partition already mounted as `var`.
fn split_root_var_root<'m>(
    mounter: &'m dyn Mounter,
    root_name: &str,
    var: PartitionMount<'m>,
    tag: &str,
) -> DupResult<ConfigRoot<'m>> {
    let root = match mount_partition(mounter, &dev_node(root_name), "btrfs", tag) {
        Ok(mount) => mount,
        Err(e) => {
            if let Err(u) = var.unmount() {
                tracing::warn!(error = %u, "var unmount after failed root remount");
            }
            return Err(e);
        }
    };

    let resolved = (|| {
        let spec = etc_overlay_spec(root.path())?
            .substitute("/sysroot/etc", &root.path().join("etc").display().to_string())
            .substitute("/sysroot/var", &var.path().display().to_string());
        mount_overlay(mounter, &spec, tag)
    })();

    match resolved {
        Ok(overlay) => Ok(ConfigRoot {
            layout: GuestLayout::SplitRootVar,
            etc: overlay.path().to_path_buf(),
            overlay: Some(overlay),
            root_mount: root,
            var_mount: Some(var),
        }),
        Err(e) => {
            if let Err(u) = root.unmount() {
                tracing::warn!(error = %u, "root unmount after failed overlay resolution");
            }
            if let Err(u) = var.unmount() {
                tracing::warn!(error = %u, "var unmount after failed overlay resolution");
            }
            Err(e)
        }
    }
}

fn gather_facts(part: &Partition, mount: &Path) -> DupResult<PartitionFacts> {
    let root_shaped = is_root_shaped(mount);
    let read_only = if part.fstype == "btrfs" {
        Some(btrfs_read_only(mount)?)
    } else {
        None
    };
    Ok(PartitionFacts {
        name: part.name.clone(),
        fstype: part.fstype.clone(),
        root_shaped,
        read_only,
        immutable_marker: root_shaped && immutable_release(&mount.join("etc")),
        overlay_state: mount.join("lib/overlay").is_dir(),
    })
}

fn is_root_shaped(mount: &Path) -> bool {
    mount.join("etc").exists() && mount.join("boot").exists() && mount.join("var").exists()
}

/// btrfs `ro` property of a mounted subvolume.
fn btrfs_read_only(mount: &Path) -> DupResult<bool> {
    let out = run_ok(
        "btrfs",
        &[
            "property".to_string(),
            "get".to_string(),
            "-ts".to_string(),
            mount.display().to_string(),
            "ro".to_string(),
        ],
    )?;
    Ok(out.stdout.trim() == "ro=true")
}

/// Value of `key` in an os-release style `KEY="value"` file.
fn release_value(etc: &Path, key: &str) -> Option<String> {
    let text = std::fs::read_to_string(etc.join("os-release")).ok()?;
    text.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix('=')?;
        Some(rest.trim().trim_matches('"').to_string())
    })
}

/// Whether release metadata marks this root as an immutable
/// (transactional-update) OS.
fn immutable_release(etc: &Path) -> bool {
    let id = release_value(etc, "ID").unwrap_or_default();
    let variant = release_value(etc, "VARIANT_ID").unwrap_or_default();
    id.contains("microos") || variant == "sle-micro" || variant == "microos"
}

/// Overlay triple for `/etc` out of the guest's own fstab.
fn etc_overlay_spec(root: &Path) -> DupResult<OverlaySpec> {
    let fstab = root.join("etc/fstab");
    if !fstab.exists() {
        return Err(DupError::Missing(fstab));
    }
    let text = std::fs::read_to_string(&fstab).map_err(|e| DupError::io(&fstab, e))?;
    // Prefer the line that mounts an overlay onto /etc; fall back to the
    // whole file when the fstab is formatted unusually.
    let scope = text
        .lines()
        .find(|l| l.contains("overlay") && l.split_whitespace().nth(1) == Some("/etc"))
        .unwrap_or(text.as_str());
    OverlaySpec::from_fstab(scope, &fstab.display().to_string())
}
