// With `preload` the constructor builds the context from the environment
// before any test runs.
#![cfg(not(feature = "preload"))]

mod tests {
    use simshim::{ClockSource, IdentitySource, SharedRegion, ShimConfig};
    use std::io::Write;

    #[test]
    fn explicit_config_reaches_the_global_context() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("users.sim"))
            .unwrap()
            .write_all(b"alice:1001\n")
            .unwrap();
        let name = format!("/simshim_init_with_{}", std::process::id());
        let config = ShimConfig::default()
            .with_region_name(name.clone())
            .with_conf_path("/nonexistent/slurm.conf")
            .with_users_dir(dir.path());

        let ctx = simshim::init_with(config);
        assert_eq!(ctx.config().region_name(), name);
        assert_eq!(ctx.identity().resolve_by_name("alice").unwrap().uid, 1001);

        // Already built: later configs and plain `init` get the same context.
        let again = simshim::init_with(ShimConfig::default().with_region_name("/other"));
        assert!(std::ptr::eq(ctx, again));
        assert!(std::ptr::eq(ctx, simshim::init()));
        assert_eq!(again.config().region_name(), name);

        ctx.region().ensure_attached().unwrap().set_simulated_seconds(321);
        assert_eq!(simshim::init().clock().time(), 321);
        SharedRegion::remove(&name).unwrap();
    }
}
