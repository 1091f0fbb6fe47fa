//! Isolated project replicas and the pool that leases them.
//!
//! A replica is an on-disk copy of the built test project. Exactly one round owns a replica
//! at a time through a [`ReplicaLease`]; dropping the lease returns the replica to the pool,
//! on every path including errors and panics. Replicas a round has mutated are marked dirty
//! and restored from their pristine images before the next lease hands them out.

use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info};
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::artifact::{ArtifactError, ReplicaArtifacts};

const SKIP_NAMES: &[&str] = &[".git", ".hg", ".svn", ".vs", ".idea", ".mutation-rounds"];

/// Where the test executable and the mutable assemblies live, relative to a project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    /// Test executable path.
    pub test_executable: PathBuf,
    /// Assembly image files mutations are applied to.
    pub assemblies: Vec<PathBuf>,
}

impl ProjectLayout {
    /// Layout with a test executable and no assemblies.
    pub fn new(test_executable: impl Into<PathBuf>) -> Self {
        Self {
            test_executable: test_executable.into(),
            assemblies: Vec::new(),
        }
    }

    /// Add an assembly image file.
    pub fn with_assembly(mut self, assembly: impl Into<PathBuf>) -> Self {
        self.assemblies.push(assembly.into());
        self
    }
}

/// Replica pool errors.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// A pool needs at least one replica.
    #[error("replica pool needs at least one replica")]
    Empty,
    /// Filesystem failure while copying, capturing or restoring a replica.
    #[error("io error on {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The pool no longer hands out replicas.
    #[error("replica pool is closed")]
    Closed,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ReplicaError + '_ {
    move |source| ReplicaError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One isolated copy of the test project.
#[derive(Debug)]
pub struct Replica {
    index: usize,
    root: PathBuf,
    test_executable: PathBuf,
    assemblies: Vec<PathBuf>,
    pristine: Vec<Vec<u8>>,
    dirty: bool,
}

impl Replica {
    /// Open the replica rooted at `root` and capture its pristine assembly images.
    pub async fn open(
        index: usize,
        root: impl Into<PathBuf>,
        layout: &ProjectLayout,
    ) -> Result<Self, ReplicaError> {
        let root = root.into();
        let assemblies: Vec<PathBuf> = layout
            .assemblies
            .iter()
            .map(|assembly| root.join(assembly))
            .collect();

        let mut pristine = Vec::with_capacity(assemblies.len());
        for path in &assemblies {
            pristine.push(tokio::fs::read(path).await.map_err(io_error(path))?);
        }

        Ok(Self {
            index,
            test_executable: root.join(&layout.test_executable),
            root,
            assemblies,
            pristine,
            dirty: false,
        })
    }

    /// Replica index, unique within its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Replica root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute test executable path inside the replica.
    pub fn test_executable(&self) -> &Path {
        &self.test_executable
    }

    /// Absolute assembly image paths inside the replica.
    pub fn assembly_paths(&self) -> &[PathBuf] {
        &self.assemblies
    }

    /// Load this replica's compiled representation.
    pub async fn load_artifacts(&self) -> Result<ReplicaArtifacts, ArtifactError> {
        ReplicaArtifacts::load(self.index, &self.assemblies).await
    }

    /// Record that the replica's files no longer match the pristine build.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Whether the replica needs a restore before reuse.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the pristine images back.
    pub async fn restore(&mut self) -> Result<(), ReplicaError> {
        for (path, raw) in self.assemblies.iter().zip(&self.pristine) {
            tokio::fs::write(path, raw).await.map_err(io_error(path))?;
        }
        self.dirty = false;
        debug!("replica {} restored to pristine images", self.index);
        Ok(())
    }
}

#[derive(Debug)]
struct PoolShared {
    free: Mutex<Vec<Replica>>,
    permits: Arc<Semaphore>,
    size: usize,
    leases: AtomicUsize,
    releases: AtomicUsize,
    // Dropped last, together with the final lease.
    _root: Option<TempDir>,
}

impl PoolShared {
    fn take(&self) -> Option<Replica> {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    fn put_back(&self, replica: Replica) {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(replica);
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Finite pool of replicas, one lease per concurrent round.
#[derive(Debug, Clone)]
pub struct ReplicaPool {
    shared: Arc<PoolShared>,
}

impl ReplicaPool {
    /// Pool over replicas that already exist on disk.
    pub fn from_replicas(replicas: Vec<Replica>) -> Result<Self, ReplicaError> {
        Self::build(replicas, None)
    }

    /// Copy `project` into `count` replicas under a fresh temp directory.
    ///
    /// The directory is removed once the pool and every outstanding lease are dropped.
    pub async fn provision(
        project: &Path,
        layout: &ProjectLayout,
        count: usize,
    ) -> Result<Self, ReplicaError> {
        if count == 0 {
            return Err(ReplicaError::Empty);
        }

        let temp_root = tempfile::Builder::new()
            .prefix("mutation-rounds-")
            .tempdir()
            .map_err(io_error(project))?;

        let mut replicas = Vec::with_capacity(count);
        for index in 0..count {
            let dest = temp_root.path().join(format!("replica-{index}"));
            let src = project.to_path_buf();
            let copy_dest = dest.clone();
            tokio::task::spawn_blocking(move || copy_tree(&src, &copy_dest))
                .await
                .map_err(|err| ReplicaError::Io {
                    path: dest.clone(),
                    source: std::io::Error::other(err),
                })?
                .map_err(io_error(&dest))?;
            replicas.push(Replica::open(index, dest, layout).await?);
        }

        info!(
            "provisioned {count} replica(s) of {} under {}",
            project.display(),
            temp_root.path().display()
        );
        Self::build(replicas, Some(temp_root))
    }

    fn build(replicas: Vec<Replica>, root: Option<TempDir>) -> Result<Self, ReplicaError> {
        if replicas.is_empty() {
            return Err(ReplicaError::Empty);
        }
        let size = replicas.len();
        Ok(Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(replicas),
                permits: Arc::new(Semaphore::new(size)),
                size,
                leases: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
                _root: root,
            }),
        })
    }

    /// Wait for a free replica and lease it, restoring it first if a previous round left it
    /// dirty.
    pub async fn acquire(&self) -> Result<ReplicaLease, ReplicaError> {
        let permit = Arc::clone(&self.shared.permits)
            .acquire_owned()
            .await
            .map_err(|_| ReplicaError::Closed)?;
        let replica = self.shared.take().ok_or(ReplicaError::Closed)?;
        self.shared.leases.fetch_add(1, Ordering::SeqCst);

        let mut lease = ReplicaLease {
            replica: Some(replica),
            shared: Arc::clone(&self.shared),
            _permit: permit,
        };
        if lease.is_dirty() {
            lease.restore().await?;
        }
        Ok(lease)
    }

    /// Stop handing out replicas. Pending and future acquires fail with
    /// [`ReplicaError::Closed`].
    pub fn close(&self) {
        self.shared.permits.close();
    }

    /// Number of replicas.
    pub fn len(&self) -> usize {
        self.shared.size
    }

    /// Always false: a pool holds at least one replica.
    pub fn is_empty(&self) -> bool {
        self.shared.size == 0
    }

    /// Replicas currently free.
    pub fn available(&self) -> usize {
        self.shared.permits.available_permits()
    }

    /// Leases handed out so far.
    pub fn leases(&self) -> usize {
        self.shared.leases.load(Ordering::SeqCst)
    }

    /// Leases returned so far.
    pub fn releases(&self) -> usize {
        self.shared.releases.load(Ordering::SeqCst)
    }
}

/// Exclusive use of one replica. Dropping the lease releases it exactly once.
#[derive(Debug)]
pub struct ReplicaLease {
    replica: Option<Replica>,
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for ReplicaLease {
    type Target = Replica;

    fn deref(&self) -> &Replica {
        self.replica
            .as_ref()
            .expect("replica is held until the lease drops")
    }
}

impl DerefMut for ReplicaLease {
    fn deref_mut(&mut self) -> &mut Replica {
        self.replica
            .as_mut()
            .expect("replica is held until the lease drops")
    }
}

impl Drop for ReplicaLease {
    fn drop(&mut self) {
        // The replica goes back before the permit, so a woken acquirer always finds it.
        if let Some(replica) = self.replica.take() {
            debug!("replica {} released", replica.index());
            self.shared.put_back(replica);
        }
    }
}

fn should_skip(name: &str) -> bool {
    SKIP_NAMES.contains(&name)
}

/// Recursively copy `src` into `dst`, skipping version-control and tool state directories.
/// Symlinks and special files are not copied.
pub fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if should_skip(&name.to_string_lossy()) {
            continue;
        }
        let src_path = entry.path();
        let dst_path = dst.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&src_path, &dst_path)?;
        } else if file_type.is_file() {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}
