//! Atomic copy-on-write snapshots of service live data.
//!
//! A snapshot attempt walks `Idle -> Validating -> Capturing -> Finalizing` and
//! ends `Complete` or `Failed`. The clone is produced by the filesystem's
//! native snapshot primitive at a `.pending-<id>` path inside the snapshots
//! directory and only becomes visible under its final `<id>` name through a
//! single rename. Attempts for one service are serialized by an exclusive
//! non-blocking lock; a second attempt fails fast instead of queueing.
use chrono::{DateTime, Local};
use fs2::FileExt;
use serde::Serialize;
use std::{
    fs::{self, File, OpenOptions},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, info, warn};

use crate::{
    collaborator::{Collaborator, Invocation},
    constants::{
        BTRFS_SUBVOLUME_ROOT_INODE, CONVERSION_PARKED_DIR_NAME, CONVERSION_VOLUME_DIR_NAME,
        LIVEDATA_DIR_NAME, PENDING_SNAPSHOT_PREFIX, SNAPSHOT_LOCK_FILE_NAME,
    },
    error::DockyardError,
    registry::Service,
};

/// Filesystem capability used by the snapshot manager.
pub trait CowCloner: Send + Sync {
    /// Whether `path` lives on a filesystem with atomic subvolume snapshots.
    fn supports(&self, path: &Path) -> Result<bool, DockyardError>;

    /// Whether `path` is the root of a snapshottable subvolume.
    fn is_subvolume(&self, path: &Path) -> Result<bool, DockyardError>;

    /// Atomically clones `source` to `destination`, which must not exist.
    fn clone_subvolume(
        &self,
        source: &Path,
        destination: &Path,
        readonly: bool,
    ) -> Result<(), DockyardError>;

    /// Creates an empty subvolume at `path`.
    fn create_subvolume(&self, path: &Path) -> Result<(), DockyardError>;

    /// Deletes the subvolume at `path`.
    fn delete_subvolume(&self, path: &Path) -> Result<(), DockyardError>;
}

/// btrfs implementation driven through the `btrfs` helper.
pub struct BtrfsCloner<'a> {
    collaborator: &'a dyn Collaborator,
}

impl<'a> BtrfsCloner<'a> {
    /// Uses `collaborator` to run `btrfs subvolume ...`.
    pub fn new(collaborator: &'a dyn Collaborator) -> Self {
        Self { collaborator }
    }

    fn subvolume(&self, args: &[&str], path: &Path) -> Result<(), DockyardError> {
        let mut argv: Vec<String> = vec!["subvolume".into()];
        argv.extend(args.iter().map(|arg| arg.to_string()));
        argv.push(path.to_string_lossy().to_string());
        self.collaborator.run(&Invocation::btrfs(argv))?;
        Ok(())
    }
}

impl CowCloner for BtrfsCloner<'_> {
    fn supports(&self, path: &Path) -> Result<bool, DockyardError> {
        use nix::sys::statfs::{BTRFS_SUPER_MAGIC, statfs};
        let stats =
            statfs(path).map_err(|errno| DockyardError::at_path(path, std::io::Error::from(errno)))?;
        Ok(stats.filesystem_type() == BTRFS_SUPER_MAGIC)
    }

    fn is_subvolume(&self, path: &Path) -> Result<bool, DockyardError> {
        let metadata = fs::metadata(path).map_err(|e| DockyardError::at_path(path, e))?;
        Ok(metadata.is_dir()
            && metadata.ino() == BTRFS_SUBVOLUME_ROOT_INODE
            && self.supports(path)?)
    }

    fn clone_subvolume(
        &self,
        source: &Path,
        destination: &Path,
        readonly: bool,
    ) -> Result<(), DockyardError> {
        let mut argv: Vec<String> = vec!["subvolume".into(), "snapshot".into()];
        if readonly {
            argv.push("-r".into());
        }
        argv.push(source.to_string_lossy().to_string());
        argv.push(destination.to_string_lossy().to_string());
        self.collaborator.run(&Invocation::btrfs(argv))?;
        Ok(())
    }

    fn create_subvolume(&self, path: &Path) -> Result<(), DockyardError> {
        self.subvolume(&["create"], path)
    }

    fn delete_subvolume(&self, path: &Path) -> Result<(), DockyardError> {
        self.subvolume(&["delete"], path)
    }
}

/// Lifecycle of a snapshot record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SnapshotStatus {
    /// Clone exists only at its temporary path.
    Pending,
    /// Renamed into place; complete and immutable.
    Complete,
    /// Abandoned; nothing was published.
    Failed,
}

/// One snapshot of a service's live data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRecord {
    /// Owning service.
    pub service: String,
    /// Sortable identifier: `YYYYMMDD-HHMMSS` plus a two-digit counter.
    pub timestamp_id: String,
    /// `snapshots_path/<timestamp_id>`.
    pub path: PathBuf,
    /// Current status.
    pub status: SnapshotStatus,
}

/// States of a single snapshot attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SnapshotPhase {
    /// Nothing started yet.
    Idle,
    /// Checking live data, filesystem support and the subvolume.
    Validating,
    /// Cloning into the pending path under the service lock.
    Capturing,
    /// Renaming the pending clone to its final id.
    Finalizing,
    /// Published.
    Complete,
    /// Abandoned; the pending clone was removed.
    Failed,
}

/// Whether a service can be snapshotted right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SnapshotReadiness {
    /// `livedata/` is a subvolume on a CoW filesystem.
    Ready,
    /// `livedata/` is on a CoW filesystem but is a plain directory.
    NeedsConversion,
    /// `livedata/` is on a filesystem without atomic snapshots.
    UnsupportedFs,
    /// Snapshotting is switched off for the service.
    Disabled,
    /// The service has no `livedata/`.
    NoLivedata,
}

/// Exclusive per-service snapshot lock, released on drop.
struct SnapshotLock {
    file: File,
    path: PathBuf,
}

impl SnapshotLock {
    fn acquire(service: &Service) -> Result<Self, DockyardError> {
        let path = service.root_path.join(SNAPSHOT_LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| DockyardError::at_path(&path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Acquired snapshot lock {}", path.display());
                Ok(Self { file, path })
            }
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(DockyardError::SnapshotInProgressConflict {
                    service: service.name.clone(),
                })
            }
            Err(err) => Err(DockyardError::at_path(&path, err)),
        }
    }
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!("Failed to release {}: {err}", self.path.display());
        }
    }
}

/// Whether `name` is a finalized snapshot directory name.
pub fn is_timestamp_id(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 17
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| if i == 8 { *b == b'-' } else { b.is_ascii_digit() })
}

/// Picks the first free id for `now` inside `snapshots_path`.
///
/// A name counts as taken when either the final or the pending directory exists.
pub fn next_timestamp_id(snapshots_path: &Path, now: DateTime<Local>) -> String {
    let base = now.format("%Y%m%d-%H%M%S").to_string();
    let mut counter: u32 = 0;
    loop {
        let candidate = format!("{base}{counter:02}");
        let taken = snapshots_path.join(&candidate).exists()
            || snapshots_path
                .join(format!("{PENDING_SNAPSHOT_PREFIX}{candidate}"))
                .exists();
        if !taken {
            return candidate;
        }
        counter += 1;
    }
}

/// Runs snapshot attempts against a [`CowCloner`].
pub struct SnapshotManager<'a> {
    cloner: &'a dyn CowCloner,
    writable: bool,
}

impl<'a> SnapshotManager<'a> {
    /// Creates a manager producing read-only snapshots unless `writable` is set.
    pub fn new(cloner: &'a dyn CowCloner, writable: bool) -> Self {
        Self { cloner, writable }
    }

    /// Reports whether `service` can be snapshotted.
    pub fn readiness(&self, service: &Service) -> SnapshotReadiness {
        let Some(live) = service.live_data_path.as_deref() else {
            return SnapshotReadiness::NoLivedata;
        };
        if !service.snapshot_enabled {
            return SnapshotReadiness::Disabled;
        }
        match self.cloner.supports(live) {
            Ok(true) => {}
            Ok(false) | Err(_) => return SnapshotReadiness::UnsupportedFs,
        }
        match self.cloner.is_subvolume(live) {
            Ok(true) => SnapshotReadiness::Ready,
            Ok(false) | Err(_) => SnapshotReadiness::NeedsConversion,
        }
    }

    fn validate<'s>(&self, service: &'s Service) -> Result<&'s Path, DockyardError> {
        let unsupported = |reason: &str| DockyardError::SnapshotUnsupportedFilesystem {
            service: service.name.clone(),
            reason: reason.to_string(),
        };

        let live = service
            .live_data_path
            .as_deref()
            .filter(|path| path.is_dir())
            .ok_or_else(|| unsupported("service has no livedata/ directory"))?;
        if !service.snapshot_enabled {
            return Err(unsupported("snapshots are disabled for this service"));
        }
        if !self.cloner.supports(live)? {
            return Err(unsupported(
                "livedata/ is not on a filesystem with atomic copy-on-write snapshots",
            ));
        }
        if !self.cloner.is_subvolume(live)? {
            return Err(unsupported(&format!(
                "livedata/ is a plain directory; run `dockyard snapshot --convert {}` while the service is stopped",
                service.name
            )));
        }
        Ok(live)
    }

    /// Takes one atomic snapshot of `service`'s live data.
    ///
    /// Validation failures create nothing. Capture or finalization failures
    /// remove the temporary clone and return [`DockyardError::SnapshotFailed`].
    pub fn snapshot(&self, service: &Service) -> Result<SnapshotRecord, DockyardError> {
        let mut phase = SnapshotPhase::Idle;
        let mut advance = |next: SnapshotPhase| {
            debug!("Snapshot of '{}': {phase} -> {next}", service.name);
            phase = next;
        };

        advance(SnapshotPhase::Validating);
        let live = match self.validate(service) {
            Ok(live) => live,
            Err(err) => {
                advance(SnapshotPhase::Failed);
                return Err(err);
            }
        };

        let _lock = SnapshotLock::acquire(service)?;
        fs::create_dir_all(&service.snapshots_path)
            .map_err(|e| DockyardError::at_path(&service.snapshots_path, e))?;
        self.remove_stale_pending(service);

        let timestamp_id = next_timestamp_id(&service.snapshots_path, Local::now());
        let mut record = SnapshotRecord {
            service: service.name.clone(),
            path: service.snapshots_path.join(&timestamp_id),
            timestamp_id,
            status: SnapshotStatus::Pending,
        };
        let pending = service
            .snapshots_path
            .join(format!("{PENDING_SNAPSHOT_PREFIX}{}", record.timestamp_id));

        advance(SnapshotPhase::Capturing);
        if let Err(err) = self.cloner.clone_subvolume(live, &pending, !self.writable) {
            advance(SnapshotPhase::Failed);
            return Err(self.abandon(record.clone(), &pending, err));
        }

        advance(SnapshotPhase::Finalizing);
        if let Err(err) = fs::rename(&pending, &record.path) {
            advance(SnapshotPhase::Failed);
            let err = DockyardError::at_path(&record.path, err);
            return Err(self.abandon(record.clone(), &pending, err));
        }

        advance(SnapshotPhase::Complete);
        record.status = SnapshotStatus::Complete;
        info!(
            "Snapshot {} of '{}' written to {}",
            record.timestamp_id,
            service.name,
            record.path.display()
        );
        Ok(record)
    }

    fn abandon(
        &self,
        mut record: SnapshotRecord,
        pending: &Path,
        cause: DockyardError,
    ) -> DockyardError {
        if pending.exists() {
            if let Err(err) = self.remove_clone(pending) {
                warn!(
                    "Could not remove temporary clone {}: {err}",
                    pending.display()
                );
            }
        }
        record.status = SnapshotStatus::Failed;
        DockyardError::SnapshotFailed {
            record: Box::new(record),
            source: Box::new(cause),
        }
    }

    fn remove_clone(&self, path: &Path) -> Result<(), DockyardError> {
        if self.cloner.is_subvolume(path).unwrap_or(false) {
            self.cloner.delete_subvolume(path)
        } else {
            fs::remove_dir_all(path).map_err(|e| DockyardError::at_path(path, e))
        }
    }

    fn remove_stale_pending(&self, service: &Service) {
        let Ok(entries) = fs::read_dir(&service.snapshots_path) else {
            return;
        };
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(PENDING_SNAPSHOT_PREFIX) {
                continue;
            }
            let path = entry.path();
            warn!("Removing interrupted snapshot {}", path.display());
            if let Err(err) = self.remove_clone(&path) {
                warn!("Could not remove {}: {err}", path.display());
            }
        }
    }

    /// Snapshots of `service` in id order.
    ///
    /// Leftover temporary clones are listed as pending.
    pub fn history(&self, service: &Service) -> Result<Vec<SnapshotRecord>, DockyardError> {
        let entries = match fs::read_dir(&service.snapshots_path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(DockyardError::at_path(&service.snapshots_path, err)),
        };

        let mut records: Vec<SnapshotRecord> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let (timestamp_id, status) = match name.strip_prefix(PENDING_SNAPSHOT_PREFIX) {
                    Some(id) if is_timestamp_id(id) => (id.to_string(), SnapshotStatus::Pending),
                    None if is_timestamp_id(&name) => (name, SnapshotStatus::Complete),
                    _ => return None,
                };
                Some(SnapshotRecord {
                    service: service.name.clone(),
                    timestamp_id,
                    path: entry.path(),
                    status,
                })
            })
            .collect();

        records.sort_by(|a, b| a.timestamp_id.cmp(&b.timestamp_id));
        Ok(records)
    }

    /// Turns a plain `livedata/` directory into a subvolume.
    ///
    /// The caller must make sure no container of the service is running.
    /// Returns `false` when `livedata/` already is a subvolume.
    pub fn convert_to_subvolume(&self, service: &Service) -> Result<bool, DockyardError> {
        let unsupported = |reason: &str| DockyardError::SnapshotUnsupportedFilesystem {
            service: service.name.clone(),
            reason: reason.to_string(),
        };

        let root = &service.root_path;
        let live = root.join(LIVEDATA_DIR_NAME);
        let volume = root.join(CONVERSION_VOLUME_DIR_NAME);
        let parked = root.join(CONVERSION_PARKED_DIR_NAME);

        let _lock = SnapshotLock::acquire(service)?;
        self.recover_conversion(service, &live, &volume, &parked)?;

        if !live.is_dir() {
            return Err(unsupported("service has no livedata/ directory"));
        }
        if !self.cloner.supports(&live)? {
            return Err(unsupported(
                "livedata/ is not on a filesystem with atomic copy-on-write snapshots",
            ));
        }
        if self.cloner.is_subvolume(&live)? {
            info!("livedata/ of '{}' is already a subvolume", service.name);
            return Ok(false);
        }

        info!("Converting livedata/ of '{}' into a subvolume", service.name);
        self.cloner.create_subvolume(&volume)?;
        if let Err(err) = copy_tree(&live, &volume) {
            if let Err(cleanup) = self.cloner.delete_subvolume(&volume) {
                warn!("Could not remove {}: {cleanup}", volume.display());
            }
            return Err(err);
        }

        fs::rename(&live, &parked).map_err(|e| DockyardError::at_path(&live, e))?;
        if let Err(err) = fs::rename(&volume, &live) {
            fs::rename(&parked, &live).map_err(|e| DockyardError::at_path(&parked, e))?;
            return Err(DockyardError::at_path(&volume, err));
        }
        fs::remove_dir_all(&parked).map_err(|e| DockyardError::at_path(&parked, e))?;

        info!("livedata/ of '{}' is now a subvolume", service.name);
        Ok(true)
    }

    /// Repairs what an interrupted conversion left behind.
    fn recover_conversion(
        &self,
        service: &Service,
        live: &Path,
        volume: &Path,
        parked: &Path,
    ) -> Result<(), DockyardError> {
        if parked.exists() {
            if live.exists() {
                warn!(
                    "Removing previous livedata/ of '{}' left by an earlier conversion",
                    service.name
                );
                fs::remove_dir_all(parked).map_err(|e| DockyardError::at_path(parked, e))?;
            } else {
                warn!(
                    "Restoring livedata/ of '{}' from an interrupted conversion",
                    service.name
                );
                fs::rename(parked, live).map_err(|e| DockyardError::at_path(parked, e))?;
            }
        }
        if volume.exists() {
            warn!(
                "Removing partial subvolume {} from an interrupted conversion",
                volume.display()
            );
            self.remove_clone(volume)?;
        }
        Ok(())
    }
}

/// Recursively copies `source` into the existing directory `destination`.
///
/// Permissions are copied; ownership is copied when the process is allowed to.
/// Symlinks are recreated, never followed.
pub fn copy_tree(source: &Path, destination: &Path) -> Result<(), DockyardError> {
    let entries = fs::read_dir(source).map_err(|e| DockyardError::at_path(source, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| DockyardError::at_path(source, e))?;
        let from = entry.path();
        let to = destination.join(entry.file_name());
        let metadata = fs::symlink_metadata(&from).map_err(|e| DockyardError::at_path(&from, e))?;
        let file_type = metadata.file_type();

        if file_type.is_symlink() {
            let target = fs::read_link(&from).map_err(|e| DockyardError::at_path(&from, e))?;
            std::os::unix::fs::symlink(&target, &to).map_err(|e| DockyardError::at_path(&to, e))?;
        } else if file_type.is_dir() {
            fs::create_dir(&to).map_err(|e| DockyardError::at_path(&to, e))?;
            copy_tree(&from, &to)?;
            fs::set_permissions(&to, metadata.permissions())
                .map_err(|e| DockyardError::at_path(&to, e))?;
        } else {
            fs::copy(&from, &to).map_err(|e| DockyardError::at_path(&from, e))?;
        }

        if let Err(err) =
            std::os::unix::fs::lchown(&to, Some(metadata.uid()), Some(metadata.gid()))
        {
            debug!("Keeping default owner for {}: {err}", to.display());
        }
    }
    Ok(())
}
