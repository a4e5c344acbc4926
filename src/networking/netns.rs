// Network namespace handling.
//
// setns() affects only the calling OS thread. Anything that must run inside
// another namespace goes to a freshly spawned std::thread, never a tokio
// task, and that thread exits when the work is done so it is never reused.

use crate::networking::error::{NetworkError, NetworkResult};
use crate::networking::netlink::NetlinkHandle;
use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// An open handle on a network namespace.
#[derive(Debug)]
pub struct NetNs {
    file: File,
    path: PathBuf,
}

impl NetNs {
    /// Open the namespace bind-mounted at `path`. A missing path maps to
    /// `NetworkError::NotFound` so teardown can treat it as already gone.
    pub fn open(path: impl AsRef<Path>) -> NetworkResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                NetworkError::NotFound(format!("netns {}", path.display()))
            } else {
                NetworkError::Namespace(format!("failed to open {}: {}", path.display(), e))
            }
        })?;
        Ok(Self { file, path })
    }

    /// The namespace of the calling thread.
    pub fn current() -> NetworkResult<Self> {
        Self::open(THREAD_NETNS)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` on a dedicated OS thread switched into this namespace.
    pub async fn run<F, T>(&self, f: F) -> NetworkResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let target = self.file.try_clone()?;
        let (tx, rx) = tokio::sync::oneshot::channel();

        thread::spawn(move || {
            let _ = tx.send(switched(&target, f));
        });

        rx.await
            .map_err(|_| NetworkError::Namespace("in-namespace thread panicked".to_string()))?
    }

    /// Open a netlink connection whose socket lives in this namespace. The
    /// socket is created on a switched thread and keeps its namespace after
    /// that thread exits; the connection itself is driven by the caller's runtime.
    pub async fn netlink(&self) -> NetworkResult<NetlinkHandle> {
        let runtime = tokio::runtime::Handle::current();
        let (reader, rt, _) = self
            .run(move || {
                let _guard = runtime.enter();
                rtnetlink::new_connection()
            })
            .await??;
        Ok(NetlinkHandle::spawn(reader, rt))
    }
}

impl AsRawFd for NetNs {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Enter `target`, run `f`, then switch back to the thread's original namespace.
fn switched<T>(target: &File, f: impl FnOnce() -> T) -> NetworkResult<T> {
    let origin = File::open(THREAD_NETNS)
        .map_err(|e| NetworkError::Namespace(format!("failed to open {}: {}", THREAD_NETNS, e)))?;

    setns(target, CloneFlags::CLONE_NEWNET)
        .map_err(|e| NetworkError::Namespace(format!("setns failed: {}", e)))?;

    let out = f();

    if let Err(e) = setns(&origin, CloneFlags::CLONE_NEWNET) {
        // The thread is about to exit anyway; it just must not run anything else.
        tracing::error!(error = %e, "failed to switch back to original netns");
    }
    Ok(out)
}

/// Cooperative cancellation shared by the workers of one `NsGroup`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs workers inside namespaces on their own threads. The first failure is
/// kept and cancels the rest; `wait` joins everything and returns it.
pub struct NsGroup<E> {
    cancel: CancelToken,
    first_err: Arc<Mutex<Option<E>>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl<E> NsGroup<E>
where
    E: From<NetworkError> + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            cancel: CancelToken::default(),
            first_err: Arc::new(Mutex::new(None)),
            threads: Vec::new(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, netns: &NetNs, name: &str, f: F) -> NetworkResult<()>
    where
        F: FnOnce(&CancelToken) -> Result<(), E> + Send + 'static,
    {
        let target = netns.file.try_clone()?;
        let cancel = self.cancel.clone();
        let slot = Arc::clone(&self.first_err);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let result = match switched(&target, || f(&cancel)) {
                    Ok(inner) => inner,
                    Err(e) => Err(E::from(e)),
                };
                if let Err(e) = result {
                    record_first(&slot, &cancel, e);
                }
            })?;
        self.threads.push(handle);
        Ok(())
    }

    /// Block until every worker has finished.
    pub fn wait(self) -> Result<(), E> {
        for handle in self.threads {
            if handle.join().is_err() {
                record_first(
                    &self.first_err,
                    &self.cancel,
                    E::from(NetworkError::Namespace("netns worker panicked".to_string())),
                );
            }
        }
        let first = match self.first_err.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<E> Default for NsGroup<E>
where
    E: From<NetworkError> + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// Store before cancelling: a sibling that observes the cancel must not be
// able to record its own cancellation error ahead of the cause.
fn record_first<E>(slot: &Mutex<Option<E>>, cancel: &CancelToken, err: E) {
    {
        let mut guard = match slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_none() {
            *guard = Some(err);
        }
    }
    cancel.cancel();
}
