// chrestore/src/utils/fs_helper.rs
use nix::unistd::Uid;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::clickhouse::Disk;
use crate::errors::{RestoreError, Result};
use crate::metadata::TableMetadata;
use crate::utils::table_path_encode;

/// File owner applied to everything the restore writes into the server's
/// directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Not running as root; files keep the owner of the current process.
    Unprivileged,
    Owner { uid: u32, gid: u32 },
}

impl Ownership {
    /// Takes the owner of `default_data_path` when running as root.
    pub fn resolve(default_data_path: &Path) -> Result<Self> {
        if !Uid::effective().is_root() {
            return Ok(Self::Unprivileged);
        }
        let meta = fs::metadata(default_data_path)?;
        Ok(Self::Owner {
            uid: meta.uid(),
            gid: meta.gid(),
        })
    }

    pub fn apply(&self, path: &Path) -> Result<()> {
        match self {
            Self::Unprivileged => Ok(()),
            Self::Owner { uid, gid } => Ok(std::os::unix::fs::chown(path, Some(*uid), Some(*gid))?),
        }
    }
}

/// Creates `path` and hands it to `ownership`. An existing directory is fine.
pub fn mkdir(path: &Path, ownership: &Ownership) -> Result<()> {
    match fs::create_dir(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => {}
        Err(e) => return Err(e.into()),
    }
    ownership.apply(path)
}

/// Creates `path` with its missing parents; every directory it creates is
/// handed to `ownership`.
pub fn mkdir_all(path: &Path, ownership: &Ownership) -> Result<()> {
    let missing: Vec<&Path> = path.ancestors().take_while(|p| !p.as_os_str().is_empty() && !p.is_dir()).collect();
    for dir in missing.into_iter().rev() {
        mkdir(dir, ownership)?;
    }
    Ok(())
}

/// Location of one captured part inside a backup on `disk`. Backups made
/// before multi-disk support keep parts directly under the table directory.
pub fn backup_part_path(disk: &Disk, backup_name: &str, table: &TableMetadata, part: &str) -> PathBuf {
    let table_dir = disk
        .path
        .join("backup")
        .join(backup_name)
        .join("shadow")
        .join(table_path_encode(&table.database))
        .join(table_path_encode(&table.table));
    let multi_disk = table_dir.join(&disk.name).join(part);
    if multi_disk.exists() {
        multi_disk
    } else {
        table_dir.join(part)
    }
}

/// Hard-links every captured part of `table` into `<data path>/detached/<part>`.
///
/// `disks` are the live disks (backup disks already remapped),
/// `dst_data_paths` maps a disk name to the destination table data path
/// on that disk. Existing links are kept, so the copy can be repeated.
pub fn copy_data_to_detached(
    backup_name: &str,
    table: &TableMetadata,
    disks: &[Disk],
    dst_data_paths: &HashMap<String, PathBuf>,
    ownership: &Ownership,
) -> Result<()> {
    for (disk_name, parts) in &table.parts {
        if parts.is_empty() {
            continue;
        }
        let disk = disks
            .iter()
            .find(|d| &d.name == disk_name)
            .ok_or_else(|| RestoreError::UnknownDataPath(format!("disk '{}' not found", disk_name)))?;
        let data_path = dst_data_paths.get(disk_name).ok_or_else(|| {
            RestoreError::UnknownDataPath(format!(
                "table {} has no data path on disk '{}'",
                table.table, disk_name
            ))
        })?;
        let detached = data_path.join("detached");
        mkdir_all(&detached, ownership)?;
        for part in parts {
            let src = backup_part_path(disk, backup_name, table, &part.name);
            let dst = detached.join(&part.name);
            if dst.exists() && !dst.is_dir() {
                return Err(RestoreError::query(format!("'{}' should be directory or absent", dst.display())));
            }
            debug!(src = %src.display(), dst = %dst.display(), "link part");
            link_tree(&src, &dst, ownership)?;
        }
    }
    Ok(())
}

fn link_tree(src: &Path, dst: &Path, ownership: &Ownership) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| RestoreError::query(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            mkdir(&target, ownership)?;
        } else if file_type.is_file() {
            match fs::hard_link(entry.path(), &target) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
            ownership.apply(&target)?;
        }
    }
    Ok(())
}

/// Recursively copies `src` into `dst`, overwriting files that exist in both.
/// Returns `false` when `src` does not exist.
pub fn copy_dir_merge(src: &Path, dst: &Path, ownership: &Ownership) -> Result<bool> {
    if !src.exists() {
        return Ok(false);
    }
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| RestoreError::query(e.to_string()))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            mkdir_all(&target, ownership)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)?;
            ownership.apply(&target)?;
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Part;

    fn fixture(root: &Path, multi_disk: bool) -> anyhow::Result<TableMetadata> {
        let mut table_dir = root.join("backup/b1/shadow/db1/t1");
        if multi_disk {
            table_dir = table_dir.join("default");
        }
        let part = table_dir.join("202301_1_1_0");
        fs::create_dir_all(part.join("projections"))?;
        fs::write(part.join("data.bin"), b"data")?;
        fs::write(part.join("projections/p.bin"), b"proj")?;

        let mut table = TableMetadata {
            database: "db1".to_string(),
            table: "t1".to_string(),
            ..Default::default()
        };
        table.parts.insert("default".to_string(), vec![Part::new("202301_1_1_0")]);
        Ok(table)
    }

    #[test]
    fn test_copy_data_to_detached_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = fixture(dir.path(), true)?;
        let disks = vec![Disk::new("default", dir.path(), "local")];
        let data_path = dir.path().join("data/db1/t1");
        let paths = HashMap::from([("default".to_string(), data_path.clone())]);

        copy_data_to_detached("b1", &table, &disks, &paths, &Ownership::Unprivileged)?;
        copy_data_to_detached("b1", &table, &disks, &paths, &Ownership::Unprivileged)?;

        let linked = data_path.join("detached/202301_1_1_0/data.bin");
        assert_eq!(fs::read(&linked)?, b"data");
        assert!(data_path.join("detached/202301_1_1_0/projections/p.bin").is_file());
        let src = fs::metadata(dir.path().join("backup/b1/shadow/db1/t1/default/202301_1_1_0/data.bin"))?;
        assert_eq!(fs::metadata(&linked)?.ino(), src.ino());
        Ok(())
    }

    #[test]
    fn test_copy_data_to_detached_legacy_layout() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = fixture(dir.path(), false)?;
        let disks = vec![Disk::new("default", dir.path(), "local")];
        let data_path = dir.path().join("data/db1/t1");
        let paths = HashMap::from([("default".to_string(), data_path.clone())]);

        copy_data_to_detached("b1", &table, &disks, &paths, &Ownership::Unprivileged)?;
        assert!(data_path.join("detached/202301_1_1_0/data.bin").is_file());
        Ok(())
    }

    #[test]
    fn test_copy_data_rejects_file_at_part_path() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = fixture(dir.path(), true)?;
        let disks = vec![Disk::new("default", dir.path(), "local")];
        let data_path = dir.path().join("data/db1/t1");
        fs::create_dir_all(data_path.join("detached"))?;
        fs::write(data_path.join("detached/202301_1_1_0"), b"")?;
        let paths = HashMap::from([("default".to_string(), data_path)]);

        assert!(copy_data_to_detached("b1", &table, &disks, &paths, &Ownership::Unprivileged).is_err());
        Ok(())
    }

    #[test]
    fn test_copy_data_requires_data_path_for_disk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = fixture(dir.path(), true)?;
        let disks = vec![Disk::new("default", dir.path(), "local")];
        let result = copy_data_to_detached("b1", &table, &disks, &HashMap::new(), &Ownership::Unprivileged);
        assert!(matches!(result, Err(RestoreError::UnknownDataPath(_))));
        Ok(())
    }

    #[test]
    fn test_copy_dir_merge() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("access");
        let dst = dir.path().join("live_access");
        fs::create_dir_all(src.join("nested"))?;
        fs::write(src.join("users.sql"), b"new")?;
        fs::write(src.join("nested/roles.sql"), b"roles")?;
        fs::create_dir_all(&dst)?;
        fs::write(dst.join("users.sql"), b"old")?;
        fs::write(dst.join("keep.sql"), b"keep")?;

        assert!(copy_dir_merge(&src, &dst, &Ownership::Unprivileged)?);
        assert_eq!(fs::read(dst.join("users.sql"))?, b"new");
        assert_eq!(fs::read(dst.join("keep.sql"))?, b"keep");
        assert_eq!(fs::read(dst.join("nested/roles.sql"))?, b"roles");
        assert!(!copy_dir_merge(&dir.path().join("absent"), &dst, &Ownership::Unprivileged)?);
        Ok(())
    }

    #[test]
    fn test_unprivileged_ownership_is_noop() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        Ownership::Unprivileged.apply(&dir.path().join("does-not-exist"))?;
        let resolved = Ownership::resolve(dir.path())?;
        resolved.apply(dir.path())?;
        Ok(())
    }

    #[test]
    fn test_mkdir_all_hands_every_created_directory_to_owner() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root_meta = fs::metadata(dir.path())?;
        // only root may give directories away
        let (uid, gid) = if Uid::effective().is_root() {
            (4242, 4242)
        } else {
            (root_meta.uid(), root_meta.gid())
        };
        let owner = Ownership::Owner { uid, gid };
        let leaf = dir.path().join("data/db1/t1/detached");
        mkdir_all(&leaf, &owner)?;
        mkdir_all(&leaf, &owner)?;

        for created in ["data", "data/db1", "data/db1/t1", "data/db1/t1/detached"] {
            let meta = fs::metadata(dir.path().join(created))?;
            assert!(meta.is_dir());
            assert_eq!((meta.uid(), meta.gid()), (uid, gid), "{created}");
        }
        assert_eq!(fs::metadata(dir.path())?.uid(), root_meta.uid());
        Ok(())
    }
}
