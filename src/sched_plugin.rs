//! The scheduler plugin interface that shimmed controller processes load.
//! The shim neither implements nor calls it; it is declared here so plugins
//! built against the simulated environment share one definition.

/// Error number in the scheduler's own numbering.
pub type SchedErrno = i32;

pub trait SchedulerPlugin {
    /// Initialize the external scheduler adapter.
    fn init(&mut self) -> Result<(), SchedErrno>;

    /// Terminate the external scheduler and release its resources.
    fn fini(&mut self) -> Result<(), SchedErrno>;

    /// For passive schedulers, run one scheduling pass.
    fn schedule(&mut self) -> Result<(), SchedErrno>;

    /// Initial priority for a newly submitted job.
    fn initial_priority(&mut self, max_prio: u32) -> u32;

    /// Some job is pending.
    fn job_is_pending(&mut self);

    /// Plugin-specific error number of the last failure.
    fn errno(&self) -> SchedErrno;

    /// Plugin-specific description of `errnum`.
    fn strerror(&self, errnum: SchedErrno) -> String;
}
