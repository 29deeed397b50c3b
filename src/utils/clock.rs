use chrono::{Local, NaiveDateTime};

/// Source of local wall-clock time. Schedule points are wall-clock times of
/// day, so everything is compared as naive local time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}
