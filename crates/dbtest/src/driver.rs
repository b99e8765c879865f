//! The `Driver` trait -- the capability set every backend implements.
//!
//! The registry hands drivers out as `Box<dyn Driver>`, so the trait must
//! stay object-safe.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::DriverError;

/// Where a driver instance is in its lifecycle.
///
/// `Running` covers both "starting" and "running": a started driver is
/// running once its process handle is set and its monitor is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Unstarted,
    Running,
    Stopped,
}

/// Opaque, cheaply clonable handle to a backend's native client.
///
/// Clones share the same underlying client; use [`ClientHandle::downcast`]
/// or [`ClientHandle::downcast_ref`] with the backend's client type.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<dyn Any + Send + Sync>,
}

impl ClientHandle {
    pub fn new<T: Any + Send + Sync>(client: T) -> Self {
        Self {
            inner: Arc::new(client),
        }
    }

    /// Borrow the client as `T`, if that is its type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Share the client as `Arc<T>`, if that is its type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.inner).downcast::<T>().ok()
    }

    /// Whether both handles refer to the very same client.
    pub fn same_client(&self, other: &ClientHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("ptr", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

/// A disposable database server plus the client connected to it.
///
/// One driver instance supervises exactly one server process for its
/// whole life. Once [`Driver::stop`] has run the instance is terminal;
/// get a fresh one from the registry.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Backend name this driver is registered under (e.g. "postgres").
    fn name(&self) -> &str;

    /// Store the configuration. Must be called before the first
    /// [`Driver::client`]; changing it afterwards has no effect on the
    /// running server.
    fn set_config(&mut self, config: Config);

    /// Current lifecycle state.
    fn state(&self) -> DriverState;

    /// Connection URL of the running server, if started.
    fn connection_url(&self) -> Option<String>;

    /// Return the connected client, starting the server on first use.
    ///
    /// The first call:
    /// 1. Picks a free local port.
    /// 2. Launches the server process and its monitor.
    /// 3. Connects within `config.connect_timeout`.
    /// 4. Wipes any residual state.
    ///
    /// Later calls return the same cached handle.
    async fn client(&mut self) -> Result<ClientHandle, DriverError>;

    /// Remove all test-created state, keeping the server running.
    ///
    /// A no-op when the server was never started. Backend bookkeeping
    /// namespaces are left untouched.
    async fn wipe(&mut self) -> Result<(), DriverError>;

    /// Disconnect the client, stop the server and wait (bounded) for it to
    /// exit. Calling it again is a no-op.
    async fn stop(&mut self) -> Result<(), DriverError>;

    /// Fail with [`DriverError::Crashed`] if the server died unexpectedly.
    fn check(&self) -> Result<(), DriverError>;
}

// Compile-time assertion: Driver must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Driver) {}
};
