//! Disposable database servers for integration tests.
//!
//! A test asks the registry for a named backend, gets a [`Driver`], and
//! uses its client. The first [`Driver::client`] call launches an isolated
//! server on a free loopback port; [`Driver::wipe`] resets it between
//! tests and [`Driver::stop`] tears it down within a bounded time.
//!
//! ```ignore
//! let mut server = dbtest::new("postgres")?;
//! let pool = server.client().await?.downcast::<sqlx::PgPool>().unwrap();
//! // ... run assertions against `pool` ...
//! server.wipe().await?;
//! server.stop().await?;
//! ```
//!
//! Every failure is returned as a [`DriverError`] whose [`ErrorKind`]
//! separates setup mistakes, a broken environment, launch failures,
//! crashes, shutdown timeouts, connect timeouts and backend errors.

pub mod config;
pub mod driver;
pub mod error;
pub mod postgres;
pub mod registry;
pub mod runtime;
pub mod supervisor;

pub use config::{Config, CrashPolicy};
pub use driver::{ClientHandle, Driver, DriverState};
pub use error::{CrashReport, DriverError, ErrorKind};
pub use registry::{
    DriverFactory, DriverRegistry, new, new_with_config, register_driver, registered_drivers,
};
