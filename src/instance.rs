//! Single-instance coordination
//!
//! The first process to take an exclusive `flock` on the lock file becomes
//! the owner. It publishes a Unix socket once it can process deliveries;
//! later launches find the lock held, connect to that socket, hand over
//! their flag field and exit. The kernel drops the lock when the owner dies,
//! so a crashed owner never blocks the next launch.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::constants::ipc::{
    DELIVERY_TIMEOUT, LOCATE_ATTEMPTS, LOCATE_RETRY_DELAY, LOCK_FILENAME, SOCKET_FILENAME,
};
use crate::ipc::{Envelope, IpcFlags, OwnerClient, OwnerServer, Reply};

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("failed to claim instance lock {path}: {source}")]
    Claim {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("instance lock is held but no running instance answers at {0}")]
    OwnerNotFound(PathBuf),

    #[error("failed to deliver flags to the running instance: {0:#}")]
    Delivery(anyhow::Error),

    #[error("running instance rejected the flag update")]
    Rejected,

    #[error("failed to publish instance socket: {0:#}")]
    Publish(anyhow::Error),
}

/// Proof of ownership. Released when dropped or when the process exits.
pub struct InstanceLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl InstanceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub enum Claim {
    Claimed(InstanceLock),
    AlreadyOwned,
}

/// Outcome of the startup protocol; failures come back as `InstanceError`
pub enum Role {
    /// This process holds the lock and must run the event loop
    Owner(InstanceLock),

    /// Flags were handed to the running owner; exit now
    Delegate,
}

/// Named lock + socket pair inside one runtime directory
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    dir: PathBuf,
}

impl InstanceRegistry {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILENAME)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.dir.join(SOCKET_FILENAME)
    }

    /// Try to become the owner without blocking
    pub fn try_claim(&self) -> Result<Claim, InstanceError> {
        let path = self.lock_path();
        let claim_err = |source: io::Error| InstanceError::Claim {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(claim_err)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(claim_err)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                record_pid(&lock);
                info!(path = %path.display(), "Claimed instance lock");
                Ok(Claim::Claimed(InstanceLock { _lock: lock, path }))
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                debug!(path = %path.display(), "Instance lock already held");
                Ok(Claim::AlreadyOwned)
            }
            Err((_, errno)) => Err(claim_err(io::Error::from(errno))),
        }
    }

    /// Publish the ready socket. Requiring the lock keeps a non-owner from
    /// ever removing the owner's socket.
    pub fn publish(&self, _lock: &InstanceLock) -> Result<OwnerServer, InstanceError> {
        OwnerServer::bind_to(self.socket_path()).map_err(InstanceError::Publish)
    }

    /// Find the owner's socket, retrying briefly while the owner finishes
    /// publishing it
    pub fn locate(&self) -> Option<OwnerClient> {
        let path = self.socket_path();
        for attempt in 1..=LOCATE_ATTEMPTS {
            match OwnerClient::connect_to(&path, DELIVERY_TIMEOUT) {
                Ok(client) => return Some(client),
                Err(e) => {
                    debug!(attempt, error = %e, "Owner socket not ready");
                    if attempt < LOCATE_ATTEMPTS {
                        thread::sleep(LOCATE_RETRY_DELAY);
                    }
                }
            }
        }
        None
    }
}

/// Write our pid into the lock file so a human can see who holds it
fn record_pid(lock: &Flock<File>) {
    let mut file: &File = lock;
    let result = file
        .set_len(0)
        .and_then(|_| writeln!(file, "{}", std::process::id()));
    if let Err(e) = result {
        warn!(error = %e, "Failed to record pid in instance lock");
    }
}

/// Hand `flags` to the running owner and wait for its answer
pub fn forward(registry: &InstanceRegistry, flags: IpcFlags) -> Result<(), InstanceError> {
    let client = registry
        .locate()
        .ok_or_else(|| InstanceError::OwnerNotFound(registry.socket_path()))?;

    let reply = client
        .deliver(&Envelope::flags_update(flags))
        .map_err(InstanceError::Delivery)?;

    match reply {
        Reply::Handled => {
            info!(flags = flags.bits(), "Forwarded flags to running instance");
            Ok(())
        }
        Reply::Rejected => Err(InstanceError::Rejected),
    }
}

/// Become the owner, or forward `flags` to the existing one
pub fn start(registry: &InstanceRegistry, flags: IpcFlags) -> Result<Role, InstanceError> {
    match registry.try_claim()? {
        Claim::Claimed(lock) => Ok(Role::Owner(lock)),
        Claim::AlreadyOwned => {
            forward(registry, flags)?;
            Ok(Role::Delegate)
        }
    }
}
