use std::sync::atomic::AtomicBool;

use log::{debug, error};

use crate::clock::TimeInterposer;
use crate::config::ShimConfig;
use crate::identity::{RealIdentity, SimulatedIdentity};
use crate::region::RegionAttacher;
use crate::resolver::RealFunctionResolver;
use crate::users::IdentityDirectory;

/// Everything a process needs to answer clock and identity queries: the
/// shared region slot, the resolved real functions and the user directory.
/// None of it is shared with other processes except the region's contents.
pub struct SimContext {
    config: ShimConfig,
    attacher: RegionAttacher,
    resolver: RealFunctionResolver,
    users: IdentityDirectory,
    attach_failure_reported: AtomicBool,
}

impl SimContext {
    pub fn new(config: ShimConfig) -> Self {
        SimContext {
            attacher: RegionAttacher::new(config.region_name()),
            resolver: RealFunctionResolver::new(),
            users: IdentityDirectory::new(config.users_file()),
            attach_failure_reported: AtomicBool::new(false),
            config,
        }
    }

    /// Attaches the region, loads the users and resolves the real clock up
    /// front, logging whatever is unavailable. Lookups retry lazily anyway.
    pub fn warm_up(&self) {
        if let Err(e) = self.attacher.ensure_attached() {
            error!("cannot attach or build the shared region: {}", e);
        }
        if let Err(e) = self.users.load() {
            error!("cannot load simulated users: {}", e);
        }
        // Failures are logged by the resolver.
        let _ = self.resolver.real_time();
        let _ = self.resolver.real_gettimeofday();
        debug!("simulation context ready");
    }

    pub fn config(&self) -> &ShimConfig {
        &self.config
    }

    pub fn region(&self) -> &RegionAttacher {
        &self.attacher
    }

    pub fn resolver(&self) -> &RealFunctionResolver {
        &self.resolver
    }

    pub fn users(&self) -> &IdentityDirectory {
        &self.users
    }

    pub fn clock(&self) -> TimeInterposer<'_> {
        TimeInterposer::new(&self.attacher, &self.resolver, &self.attach_failure_reported)
    }

    pub fn identity(&self) -> SimulatedIdentity<'_> {
        SimulatedIdentity::new(&self.users)
    }

    pub fn real_identity(&self) -> RealIdentity<'_> {
        RealIdentity::new(&self.resolver)
    }
}
