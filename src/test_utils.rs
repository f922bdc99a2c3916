use std::{
    collections::HashSet,
    fs,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
};

use crate::{
    collaborator::{Collaborator, CommandOutput, InterruptPolicy, Invocation},
    error::DockyardError,
    registry::Service,
    snapshot::{CowCloner, copy_tree},
};

/// Global lock for environment variable modifications in tests.
/// All tests that modify environment variables (especially HOME) should acquire this lock
/// to prevent race conditions between parallel test executions.
pub static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A service descriptor that points at a directory which need not exist.
pub fn sample_service(name: &str) -> Service {
    let root = PathBuf::from("/srv").join(name);
    Service {
        name: name.to_string(),
        definition_path: root.join("compose.yaml"),
        override_path: None,
        subservices: vec!["app".to_string()],
        live_data_path: None,
        snapshots_path: root.join("livedata-snapshots"),
        snapshot_enabled: false,
        depends_on: Vec::new(),
        anonymous_volumes: Vec::new(),
        livedata_owner: None,
        shell: None,
        search_path: PathBuf::from("/srv"),
        root_path: root,
    }
}

type Responder = dyn Fn(&Invocation) -> CommandOutput + Send + Sync;

/// Records every invocation and answers from a scripted responder.
pub struct FakeCollaborator {
    responder: Box<Responder>,
    calls: Mutex<Vec<Invocation>>,
    policies: Mutex<Vec<InterruptPolicy>>,
}

impl Default for FakeCollaborator {
    fn default() -> Self {
        Self::with_responder(|_| CommandOutput::ok(""))
    }
}

impl FakeCollaborator {
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&Invocation) -> CommandOutput + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            policies: Mutex::new(Vec::new()),
        }
    }

    /// Every invocation so far, captured and attached, in order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Operation arguments (compose scoping stripped) of every call.
    pub fn operations(&self) -> Vec<Vec<String>> {
        self.calls()
            .iter()
            .map(|call| call.operation_args().to_vec())
            .collect()
    }

    /// Interrupt policies passed to `attach`.
    pub fn attach_policies(&self) -> Vec<InterruptPolicy> {
        self.policies.lock().unwrap().clone()
    }
}

impl Collaborator for FakeCollaborator {
    fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, DockyardError> {
        self.calls.lock().unwrap().push(invocation.clone());
        Ok((self.responder)(invocation))
    }

    fn attach(
        &self,
        invocation: &Invocation,
        policy: InterruptPolicy,
    ) -> Result<i32, DockyardError> {
        self.calls.lock().unwrap().push(invocation.clone());
        self.policies.lock().unwrap().push(policy);
        Ok((self.responder)(invocation).status_code.unwrap_or(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CowMode {
    /// Every directory counts as a subvolume.
    AllSubvolumes,
    /// Only directories created by the fake count, tracked by inode.
    Tracked,
    /// No copy-on-write support at all.
    Unsupported,
}

/// Stands in for a CoW filesystem by copying directories.
pub struct FakeCloner {
    mode: CowMode,
    fail_capture: bool,
    subvolumes: Mutex<HashSet<u64>>,
    clones: Mutex<Vec<(bool, PathBuf)>>,
}

impl Default for FakeCloner {
    fn default() -> Self {
        Self::with_mode(CowMode::AllSubvolumes)
    }
}

impl FakeCloner {
    fn with_mode(mode: CowMode) -> Self {
        Self {
            mode,
            fail_capture: false,
            subvolumes: Mutex::new(HashSet::new()),
            clones: Mutex::new(Vec::new()),
        }
    }

    pub fn unsupported() -> Self {
        Self::with_mode(CowMode::Unsupported)
    }

    /// CoW-capable, but existing directories are plain until converted.
    pub fn without_subvolumes() -> Self {
        Self::with_mode(CowMode::Tracked)
    }

    /// Leaves a half-written clone behind and reports failure.
    pub fn failing_after_partial_copy() -> Self {
        Self {
            fail_capture: true,
            ..Self::default()
        }
    }

    /// `(readonly, source)` of every clone request.
    pub fn clone_calls(&self) -> Vec<(bool, PathBuf)> {
        self.clones.lock().unwrap().clone()
    }

    fn track(&self, path: &Path) {
        let inode = fs::metadata(path).unwrap().ino();
        self.subvolumes.lock().unwrap().insert(inode);
    }
}

impl CowCloner for FakeCloner {
    fn supports(&self, _path: &Path) -> Result<bool, DockyardError> {
        Ok(self.mode != CowMode::Unsupported)
    }

    fn is_subvolume(&self, path: &Path) -> Result<bool, DockyardError> {
        Ok(match self.mode {
            CowMode::AllSubvolumes => path.is_dir(),
            CowMode::Tracked => fs::metadata(path)
                .map(|m| self.subvolumes.lock().unwrap().contains(&m.ino()))
                .unwrap_or(false),
            CowMode::Unsupported => false,
        })
    }

    fn clone_subvolume(
        &self,
        source: &Path,
        destination: &Path,
        readonly: bool,
    ) -> Result<(), DockyardError> {
        self.clones
            .lock()
            .unwrap()
            .push((readonly, source.to_path_buf()));
        fs::create_dir(destination).map_err(|e| DockyardError::at_path(destination, e))?;
        if self.fail_capture {
            fs::write(destination.join("partial"), "half").unwrap();
            return Err(DockyardError::CollaboratorExecutionError {
                command: "btrfs subvolume snapshot".into(),
                code: Some(1),
                stderr: "ERROR: cannot snapshot: No space left on device".into(),
            });
        }
        copy_tree(source, destination)?;
        self.track(destination);
        Ok(())
    }

    fn create_subvolume(&self, path: &Path) -> Result<(), DockyardError> {
        fs::create_dir(path).map_err(|e| DockyardError::at_path(path, e))?;
        self.track(path);
        Ok(())
    }

    fn delete_subvolume(&self, path: &Path) -> Result<(), DockyardError> {
        fs::remove_dir_all(path).map_err(|e| DockyardError::at_path(path, e))
    }
}
