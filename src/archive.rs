//! Tar packing of job directories and SHA-256 checksums.
//!
//! Everything here is blocking file I/O; async callers go through
//! `tokio::task::spawn_blocking`.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{FleetError, Result};

/// Pack the contents of `source_dir` into the tar file `dest`.
pub fn pack(dest: &Path, source_dir: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(dest)?;
    let mut builder = tar::Builder::new(file);
    builder
        .append_dir_all(".", source_dir)
        .map_err(|e| FleetError::Archive(format!("packing {}: {}", source_dir.display(), e)))?;
    builder
        .into_inner()
        .map_err(|e| FleetError::Archive(e.to_string()))?;
    Ok(())
}

/// Unpack the tar file `archive` into `dest_dir`, creating it if needed.
pub fn unpack(archive: &Path, dest_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dest_dir)?;
    let mut archive_reader = tar::Archive::new(File::open(archive)?);
    archive_reader
        .unpack(dest_dir)
        .map_err(|e| FleetError::Archive(format!("unpacking {}: {}", archive.display(), e)))
}

/// Lowercase hex SHA-256 of a file.
pub fn checksum(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Remove the regular files directly inside `dir`, keeping subdirectories.
pub fn clear_files(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_then_unpack_preserves_tree() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("main.c"), b"int main() {}").unwrap();
        std::fs::create_dir(src.path().join("data")).unwrap();
        std::fs::write(src.path().join("data/input.txt"), b"42").unwrap();

        let out = tempfile::tempdir().unwrap();
        let tar_path = out.path().join("temp/1.tar");
        pack(&tar_path, src.path()).unwrap();

        let dest = out.path().join("unpacked");
        unpack(&tar_path, &dest).unwrap();
        assert_eq!(std::fs::read(dest.join("main.c")).unwrap(), b"int main() {}");
        assert_eq!(std::fs::read(dest.join("data/input.txt")).unwrap(), b"42");
    }

    #[test]
    fn checksum_is_sha256_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            checksum(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn clear_files_keeps_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.out"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("logs")).unwrap();
        std::fs::write(dir.path().join("logs/compilerOutput"), b"ok").unwrap();

        assert_eq!(clear_files(dir.path()).unwrap(), 1);
        assert!(!dir.path().join("a.out").exists());
        assert!(dir.path().join("logs/compilerOutput").exists());
    }
}
