use std::fs;
use std::io::{self, Write};
use std::path::Path;

use retrokit_security::ValidatedPath;

pub const OWNER_ONLY_MODE: u32 = 0o600;
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Replaces `path` with `content` so readers only ever see the old or the new bytes.
///
/// An existing target keeps its permission bits; a new file gets [`DEFAULT_FILE_MODE`].
pub fn write_atomic(path: &ValidatedPath, content: &[u8]) -> io::Result<()> {
    persist_atomically(path.as_path(), content, None)
}

pub fn write_atomic_with_mode(path: &ValidatedPath, content: &[u8], mode: u32) -> io::Result<()> {
    persist_atomically(path.as_path(), content, Some(mode))
}

pub(crate) fn persist_atomically(
    target: &Path,
    content: &[u8],
    mode: Option<u32>,
) -> io::Result<()> {
    persist_atomically_with_hook(target, content, mode, &mut |_| Ok(()))
}

pub(crate) fn persist_atomically_with_hook(
    target: &Path,
    content: &[u8],
    mode: Option<u32>,
    before_rename: &mut dyn FnMut(&Path) -> io::Result<()>,
) -> io::Result<()> {
    let dir = target.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("atomic write target has no parent: {}", target.display()),
        )
    })?;

    let final_mode = match mode {
        Some(mode) => mode,
        None => existing_mode(target)?.unwrap_or(DEFAULT_FILE_MODE),
    };

    // Random suffix from tempfile; the name must not be guessable ahead of time.
    let mut temp = tempfile::Builder::new()
        .prefix(".retrokit-")
        .suffix(".tmp")
        .rand_bytes(16)
        .tempfile_in(dir)?;
    set_mode(temp.as_file(), OWNER_ONLY_MODE)?;
    temp.write_all(content)?;
    temp.flush()?;
    temp.as_file().sync_all()?;
    set_mode(temp.as_file(), final_mode)?;

    before_rename(temp.path())?;

    temp.persist(target).map_err(|err| err.error)?;
    sync_dir(dir);
    Ok(())
}

fn existing_mode(target: &Path) -> io::Result<Option<u32>> {
    match fs::symlink_metadata(target) {
        Ok(metadata) => Ok(Some(mode_of(&metadata))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(unix)]
pub(crate) fn mode_of(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn mode_of(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        DEFAULT_FILE_MODE
    }
}

#[cfg(unix)]
fn set_mode(file: &fs::File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &fs::File, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
