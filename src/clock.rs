use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error};

use crate::region::{RegionAttacher, SharedRegion};
use crate::resolver::RealFunctionResolver;

/// Amount the shared sub-second counter moves on every combined read.
pub const MICROS_STEP: u32 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeVal {
    pub seconds: i64,
    pub micros: i64,
}

/// Something that can answer `time(2)` and `gettimeofday(2)`.
pub trait ClockSource {
    fn time(&self) -> i64;
    fn time_of_day(&self) -> TimeVal;
}

/// The operating system clock, reached through the resolved libc functions.
pub struct RealClock<'a> {
    resolver: &'a RealFunctionResolver,
}

impl<'a> RealClock<'a> {
    pub fn new(resolver: &'a RealFunctionResolver) -> Self {
        RealClock { resolver }
    }
}

impl ClockSource for RealClock<'_> {
    fn time(&self) -> i64 {
        match self.resolver.real_time() {
            Ok(real_time) => {
                let now = unsafe { real_time(ptr::null_mut()) };
                now as i64
            }
            Err(_) => {
                error!("no clock available, reporting the epoch");
                0
            }
        }
    }

    fn time_of_day(&self) -> TimeVal {
        let real_gettimeofday = match self.resolver.real_gettimeofday() {
            Ok(f) => f,
            Err(_) => {
                error!("no clock available, reporting the epoch");
                return TimeVal::default();
            }
        };
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        if unsafe { real_gettimeofday(&mut tv, ptr::null_mut()) } != 0 {
            error!(
                "real gettimeofday failed: {}",
                std::io::Error::last_os_error()
            );
        }
        TimeVal {
            seconds: tv.tv_sec as i64,
            micros: tv.tv_usec as i64,
        }
    }
}

/// The clock published by the simulation driver in the shared region.
///
/// Seconds come from the driver verbatim. Every combined read also bumps the
/// shared sub-second counter by [`MICROS_STEP`], so consecutive readings
/// inside one simulated second keep increasing.
pub struct SimulatedClock<'a> {
    region: &'a SharedRegion,
}

impl<'a> SimulatedClock<'a> {
    pub fn new(region: &'a SharedRegion) -> Self {
        SimulatedClock { region }
    }
}

impl ClockSource for SimulatedClock<'_> {
    fn time(&self) -> i64 {
        self.region.simulated_seconds() as i64
    }

    fn time_of_day(&self) -> TimeVal {
        let seconds = self.region.simulated_seconds() as i64;
        let micros = self.region.advance_micros(MICROS_STEP) as i64;
        TimeVal { seconds, micros }
    }
}

/// Picks the simulated clock when the shared region can be attached and the
/// real one otherwise, on every call. Never fails.
pub struct TimeInterposer<'a> {
    attacher: &'a RegionAttacher,
    resolver: &'a RealFunctionResolver,
    reported: &'a AtomicBool,
}

impl<'a> TimeInterposer<'a> {
    pub fn new(
        attacher: &'a RegionAttacher,
        resolver: &'a RealFunctionResolver,
        reported: &'a AtomicBool,
    ) -> Self {
        TimeInterposer {
            attacher,
            resolver,
            reported,
        }
    }

    fn with_source<R>(&self, f: impl FnOnce(&dyn ClockSource) -> R) -> R {
        match self.attacher.ensure_attached() {
            Ok(region) => f(&SimulatedClock::new(region)),
            Err(e) => {
                if !self.reported.swap(true, Ordering::Relaxed) {
                    error!("simulated clock unavailable, using the real one: {}", e);
                } else {
                    debug!("simulated clock unavailable: {}", e);
                }
                f(&RealClock::new(self.resolver))
            }
        }
    }

    pub fn is_simulated(&self) -> bool {
        self.attacher.ensure_attached().is_ok()
    }
}

impl ClockSource for TimeInterposer<'_> {
    fn time(&self) -> i64 {
        self.with_source(|clock| clock.time())
    }

    fn time_of_day(&self) -> TimeVal {
        self.with_source(|clock| clock.time_of_day())
    }
}
