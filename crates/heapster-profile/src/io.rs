//! Profile-file writing for the dump-on-death path.

use nix::errno::Errno;
use nix::unistd::write;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Write `data` to `path`, truncating any previous profile. The file
/// is created user read/write only. Short writes are resumed and
/// EINTR/EAGAIN retried so that a profile emitted from a dying VM is
/// never left partial.
pub fn write_profile(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;

    let mut pos = 0;
    while pos < data.len() {
        match write(&file, &data[pos..]) {
            Ok(0) => anyhow::bail!("zero-length write to {}", path.display()),
            Ok(n) => pos += n,
            Err(Errno::EINTR | Errno::EAGAIN) => continue,
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.heap");

        write_profile(&path, b"first profile contents").unwrap();
        write_profile(&path, b"second").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.heap");
        write_profile(&path, b"data").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn unwritable_path_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("profile.heap");
        assert!(write_profile(&path, b"data").is_err());
    }
}
