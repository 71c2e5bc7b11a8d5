//! Runs unmodified daemons and commands against a simulated clock and a
//! synthetic user directory.
//!
//! The simulated clock lives in a small named shared memory region written
//! by a simulation driver; the users come from a `users.sim` file next to
//! the daemon configuration. A process calls [`init`] once (or preloads the
//! library built with the `preload` feature, which does it on load) and then
//! reads time through [`SimContext::clock`] and users through
//! [`SimContext::identity`]. Until the region exists the clock falls back to
//! the real one.
#![deny(unsafe_op_in_unsafe_fn)]

use once_cell::sync::OnceCell;

mod auxv;
pub mod clock;
pub mod config;
mod context;
pub mod error;
pub mod identity;
pub mod region;
pub mod resolver;
pub mod sched_plugin;
#[cfg(feature = "preload")]
mod trampolines;
pub mod users;
mod vdso;

pub use clock::{ClockSource, RealClock, SimulatedClock, TimeInterposer, TimeVal, MICROS_STEP};
pub use config::ShimConfig;
pub use context::SimContext;
pub use error::{LoadError, NotFoundError, ResourceError, SymbolResolutionError};
pub use identity::{IdentityRecord, IdentitySource, RealIdentity, SimulatedIdentity};
pub use region::{RegionAttacher, SharedRegion};
pub use users::{IdentityDirectory, SimulatedUser};

static CONTEXT: OnceCell<SimContext> = OnceCell::new();

/// Builds the process-wide context from the environment on first call and
/// returns it on every call.
pub fn init() -> &'static SimContext {
    CONTEXT.get_or_init(|| build(ShimConfig::from_env()))
}

/// Like [`init`], but the first call uses `config` instead of the
/// environment. Once the context exists `config` is ignored; with the
/// `preload` feature that happens as soon as the library is loaded.
pub fn init_with(config: ShimConfig) -> &'static SimContext {
    let mut config = Some(config);
    let ctx = CONTEXT.get_or_init(|| build(config.take().unwrap_or_default()));
    if config.is_some() {
        log::warn!("simulation context already initialised, ignoring the given configuration");
    }
    ctx
}

fn build(config: ShimConfig) -> SimContext {
    let ctx = SimContext::new(config);
    ctx.warm_up();
    ctx
}

/// The process-wide context, if [`init`] has run.
pub fn context() -> Option<&'static SimContext> {
    CONTEXT.get()
}
