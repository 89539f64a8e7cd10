//! NBD staging: exposing a disk image as a kernel block device.
//!
//! Slot discovery and readiness both go through sysfs: a connected device
//! carries a `pid` attribute under `/sys/block/nbdN`, and its `size`
//! attribute turns non-zero once the kernel has finished device setup.
//! The attach call can return before that happens, hence the bounded
//! readiness poll.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::errors::{DupError, DupResult};
use crate::util::cmd::{run, run_ok};

/// Bounded slot pool: `/dev/nbd0` .. `/dev/nbd99`.
pub const POOL_SIZE: usize = 100;

/// Attach/detach transport for an NBD device.
///
/// Production goes through `qemu-nbd`; tests substitute a fake that
/// manipulates a synthetic sysfs tree.
pub trait NbdControl {
    fn connect(&self, device: &Path, image: &Path) -> DupResult<()>;
    fn disconnect(&self, device: &Path) -> DupResult<()>;
}

/// `qemu-nbd`-backed transport.
#[derive(Debug, Default)]
pub struct QemuNbd;

impl NbdControl for QemuNbd {
    fn connect(&self, device: &Path, image: &Path) -> DupResult<()> {
        run_ok(
            "qemu-nbd",
            &[
                format!("--connect={}", device.display()),
                image.display().to_string(),
            ],
        )?;
        Ok(())
    }

    fn disconnect(&self, device: &Path) -> DupResult<()> {
        let out = run_ok(
            "qemu-nbd",
            &["--disconnect".to_string(), device.display().to_string()],
        )?;
        if !out.stdout.contains("disconnected") {
            return Err(DupError::tool(
                "qemu-nbd",
                format!("disconnect not acknowledged: {}", out.stdout.trim()),
            ));
        }
        Ok(())
    }
}

/// The bounded host-wide NBD slot pool.
///
/// Slots are global host state shared with anything else attaching NBD
/// devices, so discovery re-scans the kernel table before every attach.
/// `sysfs` points at `/sys/block` in production; tests point it at a
/// temporary tree.
#[derive(Debug, Clone)]
pub struct NbdPool {
    sysfs: PathBuf,
    dev_dir: PathBuf,
}

impl Default for NbdPool {
    fn default() -> Self {
        Self::host()
    }
}

impl NbdPool {
    pub fn host() -> Self {
        Self {
            sysfs: PathBuf::from("/sys/block"),
            dev_dir: PathBuf::from("/dev"),
        }
    }

    pub fn with_roots(sysfs: impl Into<PathBuf>, dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            sysfs: sysfs.into(),
            dev_dir: dev_dir.into(),
        }
    }

    pub fn device_path(&self, slot: usize) -> PathBuf {
        self.dev_dir.join(format!("nbd{slot}"))
    }

    fn slot_dir(&self, slot: usize) -> PathBuf {
        self.sysfs.join(format!("nbd{slot}"))
    }

    /// Whether the kernel currently has a server attached to `slot`.
    pub fn in_use(&self, slot: usize) -> bool {
        self.slot_dir(slot).join("pid").exists()
    }

    /// Lowest existing slot with no attachment.
    ///
    /// Check-then-attach over this shared pool is only safe because targets
    /// are processed sequentially; parallel callers would need a reservation
    /// step around this scan.
    pub fn find_free(&self) -> DupResult<usize> {
        for slot in 0..POOL_SIZE {
            if !self.slot_dir(slot).is_dir() {
                continue;
            }
            if !self.in_use(slot) {
                return Ok(slot);
            }
        }
        Err(DupError::NoFreeDevice {
            pool_size: POOL_SIZE,
        })
    }

    /// Device size as sysfs reports it; 0 while the kernel is still setting
    /// the device up (or when the slot does not exist).
    fn size(&self, slot: usize) -> u64 {
        std::fs::read_to_string(self.slot_dir(slot).join("size"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// A partition surfaced by a staged device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub fstype: String,
}

impl Partition {
    pub fn device_path(&self) -> PathBuf {
        dev_node(&self.name)
    }
}

pub(crate) fn dev_node(name: &str) -> PathBuf {
    Path::new("/dev").join(name)
}

fn parse_partitions(listing: &str) -> Vec<Partition> {
    listing
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            match (cols.next(), cols.next()) {
                (Some(name), Some(fstype)) => Some(Partition {
                    name: name.to_string(),
                    fstype: fstype.to_string(),
                }),
                _ => None,
            }
        })
        .collect()
}

/// One image attached to an NBD slot.
///
/// Handed back to [`DeviceStager::release`] on every exit path; `Drop` only
/// warns, because detach confirmation can fail and that failure must stay
/// observable.
#[derive(Debug)]
pub struct StagedDevice {
    slot: usize,
    device: PathBuf,
    image: PathBuf,
    released: bool,
}

impl StagedDevice {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn path(&self) -> &Path {
        &self.device
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    /// Partitions carrying a detected filesystem, in `lsblk` listing order.
    /// The partition table is settled with `partprobe` first.
    pub fn partitions(&self) -> DupResult<Vec<Partition>> {
        run_ok("partprobe", &[self.device.display().to_string()])?;
        let out = run_ok(
            "lsblk",
            &[
                "-lno".to_string(),
                "NAME,FSTYPE".to_string(),
                self.device.display().to_string(),
            ],
        )?;
        Ok(parse_partitions(&out.stdout))
    }
}

impl Drop for StagedDevice {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                device = %self.device.display(),
                "staged device dropped without release"
            );
        }
    }
}

/// Bounds for the post-attach readiness poll and the post-detach
/// confirmation re-check.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPoll {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ReadinessPoll {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(300),
        }
    }
}

/// Stages disk images onto NBD slots and guarantees their return.
pub struct DeviceStager {
    pool: NbdPool,
    ctl: Box<dyn NbdControl>,
    poll: ReadinessPoll,
}

impl DeviceStager {
    pub fn new(pool: NbdPool, ctl: Box<dyn NbdControl>) -> Self {
        Self::with_poll(pool, ctl, ReadinessPoll::default())
    }

    pub fn with_poll(pool: NbdPool, ctl: Box<dyn NbdControl>, poll: ReadinessPoll) -> Self {
        Self { pool, ctl, poll }
    }

    /// Attach `image` to the lowest free slot and wait until the kernel
    /// reports a usable device.
    pub fn stage(&self, image: &Path) -> DupResult<StagedDevice> {
        let slot = self.pool.find_free()?;
        let device = self.pool.device_path(slot);
        tracing::debug!(device = %device.display(), image = %image.display(), "attaching image");
        self.ctl.connect(&device, image)?;

        if let Err(e) = self.wait_ready(slot) {
            // Give the slot back before surfacing the failure; a dangling
            // attachment would poison every later free-slot scan.
            if let Err(detach) = self.ctl.disconnect(&device) {
                tracing::warn!(
                    device = %device.display(),
                    error = %detach,
                    "disconnect after failed staging also failed"
                );
            }
            return Err(e);
        }

        Ok(StagedDevice {
            slot,
            device,
            image: image.to_path_buf(),
            released: false,
        })
    }

    /// Detach and confirm the kernel let go of the slot.
    pub fn release(&self, mut dev: StagedDevice) -> DupResult<()> {
        dev.released = true;
        self.ctl.disconnect(&dev.device)?;
        // Flush stale partition state; the exit code is irrelevant once the
        // device itself is gone.
        let _ = run("partprobe", &[dev.device.display().to_string()]);

        for attempt in 0..self.poll.attempts {
            if attempt > 0 {
                thread::sleep(self.poll.delay);
            }
            if !self.pool.in_use(dev.slot) {
                tracing::debug!(device = %dev.device.display(), "device released");
                return Ok(());
            }
        }
        Err(DupError::StaleDevice {
            device: dev.device.display().to_string(),
        })
    }

    fn wait_ready(&self, slot: usize) -> DupResult<()> {
        for attempt in 0..self.poll.attempts {
            if attempt > 0 {
                thread::sleep(self.poll.delay);
            }
            if self.pool.size(slot) > 0 {
                tracing::debug!(slot, attempt, "device ready");
                return Ok(());
            }
        }
        Err(DupError::StageTimeout {
            device: self.pool.device_path(slot).display().to_string(),
            attempts: self.poll.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Simulates the kernel side of qemu-nbd against a fake sysfs tree.
    struct FakeNbd {
        sysfs: PathBuf,
        /// Size the device reports once "attached"; 0 simulates a device
        /// that never finishes setup.
        size: u64,
    }

    impl NbdControl for FakeNbd {
        fn connect(&self, device: &Path, _image: &Path) -> DupResult<()> {
            let slot_dir = self.sysfs.join(device.file_name().unwrap());
            fs::write(slot_dir.join("pid"), "4242").unwrap();
            fs::write(slot_dir.join("size"), self.size.to_string()).unwrap();
            Ok(())
        }

        fn disconnect(&self, device: &Path) -> DupResult<()> {
            let slot_dir = self.sysfs.join(device.file_name().unwrap());
            fs::remove_file(slot_dir.join("pid")).unwrap();
            Ok(())
        }
    }

    fn fixture(slots: usize) -> (TempDir, NbdPool) {
        let tmp = TempDir::new().unwrap();
        let sysfs = tmp.path().join("sys/block");
        let dev = tmp.path().join("dev");
        fs::create_dir_all(&dev).unwrap();
        for slot in 0..slots {
            fs::create_dir_all(sysfs.join(format!("nbd{slot}"))).unwrap();
        }
        let pool = NbdPool::with_roots(&sysfs, &dev);
        (tmp, pool)
    }

    fn fast_poll() -> ReadinessPoll {
        ReadinessPoll {
            attempts: 3,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_find_free_picks_lowest() {
        let (tmp, pool) = fixture(4);
        let sysfs = tmp.path().join("sys/block");
        fs::write(sysfs.join("nbd0/pid"), "1").unwrap();
        fs::write(sysfs.join("nbd1/pid"), "2").unwrap();
        assert_eq!(pool.find_free().unwrap(), 2);
    }

    #[test]
    fn test_exhausted_pool_is_an_error() {
        let (tmp, pool) = fixture(3);
        let sysfs = tmp.path().join("sys/block");
        for slot in 0..3 {
            fs::write(sysfs.join(format!("nbd{slot}/pid")), "1").unwrap();
        }
        assert!(matches!(
            pool.find_free().unwrap_err(),
            DupError::NoFreeDevice { .. }
        ));
    }

    #[test]
    fn test_stage_and_release_round_trip() {
        let (tmp, pool) = fixture(2);
        let stager = DeviceStager::with_poll(
            pool.clone(),
            Box::new(FakeNbd {
                sysfs: tmp.path().join("sys/block"),
                size: 8_388_608,
            }),
            fast_poll(),
        );

        let dev = stager.stage(Path::new("/img/a.qcow2")).unwrap();
        assert_eq!(dev.slot(), 0);
        assert!(pool.in_use(0));

        stager.release(dev).unwrap();
        assert!(!pool.in_use(0));
        assert_eq!(pool.find_free().unwrap(), 0);
    }

    #[test]
    fn test_staging_timeout_releases_slot() {
        let (tmp, pool) = fixture(2);
        let stager = DeviceStager::with_poll(
            pool.clone(),
            Box::new(FakeNbd {
                sysfs: tmp.path().join("sys/block"),
                size: 0,
            }),
            fast_poll(),
        );

        let before = pool.find_free().unwrap();
        let err = stager.stage(Path::new("/img/a.qcow2")).unwrap_err();
        assert!(matches!(err, DupError::StageTimeout { attempts: 3, .. }));

        // No leaked handle: the same slot scans as free again.
        assert_eq!(pool.find_free().unwrap(), before);
    }

    #[test]
    fn test_second_stage_takes_next_slot() {
        let (tmp, pool) = fixture(3);
        let stager = DeviceStager::with_poll(
            pool.clone(),
            Box::new(FakeNbd {
                sysfs: tmp.path().join("sys/block"),
                size: 1024,
            }),
            fast_poll(),
        );

        let first = stager.stage(Path::new("/img/a.qcow2")).unwrap();
        let second = stager.stage(Path::new("/img/b.qcow2")).unwrap();
        assert_eq!((first.slot(), second.slot()), (0, 1));

        stager.release(second).unwrap();
        stager.release(first).unwrap();
    }

    #[test]
    fn test_parse_partitions_skips_bare_disk_row() {
        let listing = "nbd0\nnbd0p1 ext4\nnbd0p2 btrfs\n";
        let parts = parse_partitions(listing);
        assert_eq!(
            parts,
            vec![
                Partition {
                    name: "nbd0p1".into(),
                    fstype: "ext4".into()
                },
                Partition {
                    name: "nbd0p2".into(),
                    fstype: "btrfs".into()
                },
            ]
        );
        assert_eq!(parts[0].device_path(), PathBuf::from("/dev/nbd0p1"));
    }
}
