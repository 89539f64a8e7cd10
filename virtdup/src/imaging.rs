//! Disk image duplication and format sniffing.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::errors::{DupError, DupResult};

/// qcow magic, "QFI\xfb".
const QCOW_MAGIC: [u8; 4] = [0x51, 0x46, 0x49, 0xfb];

/// Duplicate `src` to `dst`, sharing data blocks where the filesystem
/// supports reflink and falling back to a byte copy where it does not.
///
/// The clone is fsynced before returning so libvirt never references a
/// half-written image.
pub fn duplicate(src: &Path, dst: &Path) -> DupResult<()> {
    match reflink_copy::reflink_or_copy(src, dst).map_err(|e| DupError::io(dst, e))? {
        None => tracing::debug!(src = %src.display(), dst = %dst.display(), "image reflinked"),
        Some(bytes) => tracing::info!(
            src = %src.display(),
            dst = %dst.display(),
            bytes,
            "no reflink support here, image byte-copied"
        ),
    }

    File::open(dst)
        .and_then(|f| f.sync_all())
        .map_err(|e| DupError::io(dst, e))
}

/// Whether `path` is a qcow2 image, judged by its magic bytes.
///
/// Only qcow2 clones are staged for identity rewriting; raw images are
/// duplicated and left alone.
pub fn is_qcow2(path: &Path) -> DupResult<bool> {
    let mut file = File::open(path).map_err(|e| DupError::io(path, e))?;
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == QCOW_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(DupError::io(path, e)),
    }
}
