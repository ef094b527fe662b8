//! Persisting a [`CredentialBundle`] to its well-known paths.
//!
//! Both files are staged next to their destination and renamed into place only
//! after both writes succeeded, so a failed write never leaves a bundle half
//! on disk.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use tracing::debug;

use super::{generate::CredentialBundle, CredentialPaths, ProvisionError};

/// Mode of the private key file: owner read/write only.
pub const KEY_FILE_MODE: u32 = 0o600;

/// Write `bundle` to `paths`, replacing whatever is there.
///
/// # Errors
///
/// Returns [`ProvisionError::Write`] if staging or renaming either file fails.
/// Staged files are removed on failure.
pub fn persist(paths: &CredentialPaths, bundle: &CredentialBundle) -> Result<(), ProvisionError> {
    let cert_staged = staging_path(&paths.cert);
    let key_staged = staging_path(&paths.key);

    let staged = write_file(&cert_staged, bundle.cert_pem.as_bytes(), None)
        .and_then(|()| write_file(&key_staged, &bundle.key_pem, Some(KEY_FILE_MODE)));
    if let Err(e) = staged {
        discard(&cert_staged);
        discard(&key_staged);
        return Err(e);
    }

    if let Err(e) = rename(&key_staged, &paths.key) {
        discard(&cert_staged);
        discard(&key_staged);
        return Err(e);
    }
    if let Err(e) = rename(&cert_staged, &paths.cert) {
        discard(&cert_staged);
        return Err(e);
    }
    debug!(cert = %paths.cert.display(), key = %paths.key.display(), "credential files written");
    Ok(())
}

/// Sibling path `.<name>.tmp` used while staging `path`.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

fn write_file(path: &Path, contents: &[u8], mode: Option<u32>) -> Result<(), ProvisionError> {
    let to_err = |source| ProvisionError::Write {
        path: path.to_path_buf(),
        source,
    };

    // A leftover staging file would keep its old mode.
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(to_err(e)),
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    set_mode(&mut options, mode);

    let mut file = options.open(path).map_err(to_err)?;
    file.write_all(contents).map_err(to_err)?;
    file.sync_all().map_err(to_err)
}

#[cfg(unix)]
fn set_mode(options: &mut OpenOptions, mode: Option<u32>) {
    use std::os::unix::fs::OpenOptionsExt;
    if let Some(mode) = mode {
        options.mode(mode);
    }
}

#[cfg(not(unix))]
fn set_mode(_options: &mut OpenOptions, _mode: Option<u32>) {}

fn rename(from: &Path, to: &Path) -> Result<(), ProvisionError> {
    fs::rename(from, to).map_err(|source| ProvisionError::Write {
        path: to.to_path_buf(),
        source,
    })
}

fn discard(path: &Path) {
    let _ = fs::remove_file(path);
}
