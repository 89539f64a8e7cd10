//! Scratch mounts with guaranteed teardown.
//!
//! Partition mounts, their btrfs `/var` subvolume companions, and synthetic
//! overlay mounts all share the same discipline: a scratch `TempDir`, an
//! explicit consuming `unmount()` so failures propagate, and a `Drop`
//! backstop so teardown runs on every exit path. Companions unmount before
//! their primary, and the scratch directory disappears with the `TempDir`.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tempfile::TempDir;

use crate::errors::{DupError, DupResult};
use crate::util::cmd::run_ok;

/// mount(2)/umount(2) seam. Production goes through the kernel; tests record
/// call order and inject failures.
pub trait Mounter {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: &str,
        options: Option<&str>,
    ) -> DupResult<()>;

    fn unmount(&self, target: &Path) -> DupResult<()>;
}

/// Production mounter backed by mount(2)/umount(2).
#[derive(Debug, Default)]
pub struct SysMounter;

impl Mounter for SysMounter {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: &str,
        options: Option<&str>,
    ) -> DupResult<()> {
        nix::mount::mount(
            Some(source),
            target,
            Some(fstype),
            nix::mount::MsFlags::empty(),
            options,
        )
        .map_err(|errno| DupError::mount(target, errno))
    }

    fn unmount(&self, target: &Path) -> DupResult<()> {
        nix::mount::umount(target).map_err(|errno| DupError::mount(target, errno))
    }
}

fn scratch_dir(prefix: &str, tag: &str) -> DupResult<TempDir> {
    tempfile::Builder::new()
        .prefix(prefix)
        .suffix(&format!(".{tag}"))
        .tempdir()
        .map_err(|e| DupError::io(std::env::temp_dir(), e))
}

/// A partition mounted at a scratch directory, with an optional btrfs
/// `/var` subvolume companion bound to the same lifetime.
pub struct PartitionMount<'m> {
    mounter: &'m dyn Mounter,
    dir: TempDir,
    device: PathBuf,
    var_mounted: bool,
    unmounted: bool,
}

/// Mount `device` (carrying filesystem `fstype`) at a fresh scratch
/// directory.
pub fn mount_partition<'m>(
    mounter: &'m dyn Mounter,
    device: &Path,
    fstype: &str,
    tag: &str,
) -> DupResult<PartitionMount<'m>> {
    let dir = scratch_dir("virt_dup_mnt_", tag)?;
    mounter.mount(device, dir.path(), fstype, None)?;
    tracing::debug!(device = %device.display(), mountpoint = %dir.path().display(), "partition mounted");
    Ok(PartitionMount {
        mounter,
        dir,
        device: device.to_path_buf(),
        var_mounted: false,
        unmounted: false,
    })
}

impl<'m> PartitionMount<'m> {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// For btrfs roots: if the filesystem carries a top-level `var`
    /// subvolume, mount it at `<scratch>/var` as a companion. Returns
    /// whether a companion was mounted.
    pub fn mount_var_subvolume(&mut self) -> DupResult<bool> {
        let out = run_ok(
            "btrfs",
            &[
                "subvolume".to_string(),
                "list".to_string(),
                self.dir.path().display().to_string(),
            ],
        )?;
        match var_subvolume(&out.stdout) {
            Some(subvol) => {
                self.mount_companion(&subvol)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn mount_companion(&mut self, subvol: &str) -> DupResult<()> {
        let target = self.dir.path().join("var");
        self.mounter.mount(
            &self.device,
            &target,
            "btrfs",
            Some(&format!("subvol={subvol}")),
        )?;
        self.var_mounted = true;
        tracing::debug!(subvol, mountpoint = %target.display(), "var subvolume companion mounted");
        Ok(())
    }

    /// Unmount companion first, then primary. The scratch directory is
    /// removed when the `TempDir` drops. The primary unmount is attempted
    /// even if the companion's fails; the first error wins.
    pub fn unmount(mut self) -> DupResult<()> {
        self.unmounted = true;
        let mut companion_err = None;
        if self.var_mounted {
            self.var_mounted = false;
            if let Err(e) = self.mounter.unmount(&self.dir.path().join("var")) {
                companion_err = Some(e);
            }
        }
        let primary = self.mounter.unmount(self.dir.path());
        match companion_err {
            Some(e) => Err(e),
            None => primary,
        }
    }
}

impl Drop for PartitionMount<'_> {
    fn drop(&mut self) {
        if self.unmounted {
            return;
        }
        if self.var_mounted {
            if let Err(e) = self.mounter.unmount(&self.dir.path().join("var")) {
                tracing::warn!(error = %e, "companion unmount failed during teardown");
            }
        }
        if let Err(e) = self.mounter.unmount(self.dir.path()) {
            tracing::warn!(
                mountpoint = %self.dir.path().display(),
                error = %e,
                "unmount failed during teardown"
            );
        }
    }
}

/// Pick the `var` subvolume path out of `btrfs subvolume list` output.
fn var_subvolume(listing: &str) -> Option<String> {
    for line in listing.lines() {
        let mut toks = line.split_whitespace();
        while let Some(tok) = toks.next() {
            if tok != "path" {
                continue;
            }
            if let Some(path) = toks.next() {
                if path == "var" || path == "@/var" {
                    return Some(path.to_string());
                }
            }
            break;
        }
    }
    None
}

static LOWER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"lowerdir=([^,\s]+)").expect("valid lowerdir pattern"));
static UPPER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"upperdir=([^,\s]+)").expect("valid upperdir pattern"));
static WORK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"workdir=([^,\s]+)").expect("valid workdir pattern"));

/// The three directories behind a guest's `/etc` overlay mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlaySpec {
    pub lower: String,
    pub upper: String,
    pub work: String,
}

impl OverlaySpec {
    /// Extract the overlay triple from a guest fstab. Any of the three
    /// values missing means the layout is not one this engine understands;
    /// `origin` names the file for the error.
    pub fn from_fstab(text: &str, origin: &str) -> DupResult<Self> {
        let grab = |re: &Regex| re.captures(text).map(|c| c[1].to_string());
        match (grab(&LOWER_RE), grab(&UPPER_RE), grab(&WORK_RE)) {
            (Some(lower), Some(upper), Some(work)) => Ok(Self { lower, upper, work }),
            _ => Err(DupError::UnknownLayout {
                device: origin.to_string(),
            }),
        }
    }

    /// Rewrite a guest-internal mount-root prefix to a host-side staged
    /// path in all three directories.
    pub fn substitute(&self, from: &str, to: &str) -> Self {
        Self {
            lower: self.lower.replace(from, to),
            upper: self.upper.replace(from, to),
            work: self.work.replace(from, to),
        }
    }

    /// mount(8)-style option string for the synthetic overlay.
    pub fn options(&self) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lower, self.upper, self.work
        )
    }
}

/// A synthetic overlay presenting the merged view of a resolved spec.
pub struct OverlayMount<'m> {
    mounter: &'m dyn Mounter,
    dir: TempDir,
    unmounted: bool,
}

/// Mount an overlay described by `spec` (already path-substituted to
/// host-side staged directories) at a fresh scratch directory.
pub fn mount_overlay<'m>(
    mounter: &'m dyn Mounter,
    spec: &OverlaySpec,
    tag: &str,
) -> DupResult<OverlayMount<'m>> {
    let dir = scratch_dir("virt_dup_overlay_", tag)?;
    mounter.mount(
        Path::new("overlay"),
        dir.path(),
        "overlay",
        Some(&spec.options()),
    )?;
    tracing::debug!(options = %spec.options(), mountpoint = %dir.path().display(), "overlay mounted");
    Ok(OverlayMount {
        mounter,
        dir,
        unmounted: false,
    })
}

impl<'m> OverlayMount<'m> {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Single unmount of the merged view.
    pub fn unmount(mut self) -> DupResult<()> {
        self.unmounted = true;
        self.mounter.unmount(self.dir.path())
    }
}

impl Drop for OverlayMount<'_> {
    fn drop(&mut self) {
        if self.unmounted {
            return;
        }
        if let Err(e) = self.mounter.unmount(self.dir.path()) {
            tracing::warn!(
                mountpoint = %self.dir.path().display(),
                error = %e,
                "overlay unmount failed during teardown"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Debug, PartialEq, Eq, Clone)]
    enum Call {
        Mount(PathBuf),
        Unmount(PathBuf),
    }

    /// Records mount/unmount order; optionally fails every mount of one
    /// fstype.
    struct Recording {
        calls: RefCell<Vec<Call>>,
        fail_fstype: Option<&'static str>,
    }

    impl Recording {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                fail_fstype: None,
            }
        }

        fn failing_on(fstype: &'static str) -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                fail_fstype: Some(fstype),
            }
        }

        /// Every successful mount has exactly one unmount, in reverse
        /// order.
        fn assert_balanced(&self) {
            let mut stack: Vec<PathBuf> = Vec::new();
            for call in self.calls.borrow().iter() {
                match call {
                    Call::Mount(t) => stack.push(t.clone()),
                    Call::Unmount(t) => {
                        assert_eq!(stack.pop().as_ref(), Some(t), "unmount out of order");
                    }
                }
            }
            assert!(stack.is_empty(), "unbalanced mounts: {stack:?}");
        }
    }

    impl Mounter for Recording {
        fn mount(
            &self,
            _source: &Path,
            target: &Path,
            fstype: &str,
            _options: Option<&str>,
        ) -> DupResult<()> {
            if self.fail_fstype == Some(fstype) {
                return Err(DupError::mount(
                    target,
                    nix::Error::from(nix::errno::Errno::EPERM),
                ));
            }
            self.calls.borrow_mut().push(Call::Mount(target.to_path_buf()));
            Ok(())
        }

        fn unmount(&self, target: &Path) -> DupResult<()> {
            self.calls.borrow_mut().push(Call::Unmount(target.to_path_buf()));
            Ok(())
        }
    }

    const MICROOS_FSTAB: &str = "\
LABEL=ROOT / btrfs ro 0 0
overlay /etc overlay defaults,lowerdir=/sysroot/var/lib/overlay/1/etc:/sysroot/etc,upperdir=/sysroot/var/lib/overlay/etc,workdir=/sysroot/var/lib/overlay/work-etc,x-systemd.requires-mounts-for=/var 0 0
LABEL=VAR /var btrfs defaults 0 0
";

    #[test]
    fn test_overlay_spec_extraction() {
        let spec = OverlaySpec::from_fstab(MICROOS_FSTAB, "fstab").unwrap();
        assert_eq!(spec.lower, "/sysroot/var/lib/overlay/1/etc:/sysroot/etc");
        assert_eq!(spec.upper, "/sysroot/var/lib/overlay/etc");
        assert_eq!(spec.work, "/sysroot/var/lib/overlay/work-etc");
    }

    #[test]
    fn test_overlay_spec_requires_all_three() {
        let err =
            OverlaySpec::from_fstab("overlay /etc overlay lowerdir=/a,upperdir=/b 0 0", "fstab")
                .unwrap_err();
        assert!(matches!(err, DupError::UnknownLayout { .. }));
    }

    #[test]
    fn test_overlay_spec_substitution() {
        let spec = OverlaySpec::from_fstab(MICROOS_FSTAB, "fstab")
            .unwrap()
            .substitute("/sysroot/etc", "/mnt/root/etc")
            .substitute("/sysroot/var", "/mnt/var");
        assert_eq!(spec.lower, "/mnt/var/lib/overlay/1/etc:/mnt/root/etc");
        assert_eq!(spec.upper, "/mnt/var/lib/overlay/etc");
        assert_eq!(spec.work, "/mnt/var/lib/overlay/work-etc");
        assert!(spec.options().starts_with("lowerdir=/mnt/var/"));
    }

    #[test]
    fn test_var_subvolume_parse() {
        let listing = "\
ID 256 gen 31 top level 5 path @
ID 257 gen 31 top level 256 path @/var
ID 258 gen 20 top level 256 path @/home
";
        assert_eq!(var_subvolume(listing).as_deref(), Some("@/var"));
        assert_eq!(
            var_subvolume("ID 259 gen 4 top level 5 path var").as_deref(),
            Some("var")
        );
        assert_eq!(var_subvolume("ID 260 gen 4 top level 5 path home"), None);
    }

    #[test]
    fn test_partition_mount_unmount_reverse_order() {
        let rec = Recording::new();
        let mut mount = mount_partition(&rec, Path::new("/dev/fake1"), "btrfs", "t").unwrap();
        mount.mount_companion("@/var").unwrap();
        mount.unmount().unwrap();
        rec.assert_balanced();
        assert_eq!(rec.calls.borrow().len(), 4);
    }

    #[test]
    fn test_drop_backstop_unmounts() {
        let rec = Recording::new();
        {
            let _mount = mount_partition(&rec, Path::new("/dev/fake1"), "ext4", "t").unwrap();
            // dropped without an explicit unmount
        }
        rec.assert_balanced();
        assert_eq!(rec.calls.borrow().len(), 2);
    }

    #[test]
    fn test_failed_overlay_leaves_no_mount_behind() {
        let rec = Recording::failing_on("overlay");
        let part = mount_partition(&rec, Path::new("/dev/fake2"), "btrfs", "t").unwrap();
        let spec = OverlaySpec {
            lower: "/a".into(),
            upper: "/b".into(),
            work: "/c".into(),
        };
        assert!(mount_overlay(&rec, &spec, "t").is_err());
        part.unmount().unwrap();
        rec.assert_balanced();
    }
}
