use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Replaces `path` with `bytes` through a temp file in the same directory so
/// readers never observe a partial write.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let staging = staging_file(path)?;
    finish(staging, path, bytes)
}

/// [`write_atomically`] for secrets: the file is owner-only before any
/// byte is written to it.
pub fn write_private(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let staging = staging_file(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staging
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    finish(staging, path, bytes)
}

fn staging_file(path: &Path) -> io::Result<NamedTempFile> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    NamedTempFile::new_in(parent)
}

fn finish(mut staging: NamedTempFile, path: &Path, bytes: &[u8]) -> io::Result<()> {
    staging.write_all(bytes)?;
    staging.flush()?;
    staging.as_file().sync_all()?;
    staging.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Reads `path`, mapping a missing file to `None`.
pub fn read_if_exists(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.json");
        write_atomically(&path, b"first").unwrap();
        write_atomically(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        // no staging files left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn private_write_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("secret.json");
        fs::write(&path, b"old").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        write_private(&path, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempdir().unwrap();
        assert!(read_if_exists(&dir.path().join("absent")).unwrap().is_none());
    }
}
