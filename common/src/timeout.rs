use std::{cell::Cell, thread, time::Duration};

/// A bounded polling budget: `polls` attempts separated by `interval`.
///
/// Hardware status bits are never waited on indefinitely. Callers loop on the
/// condition and call [`Timeout::run`] once per iteration; it sleeps for one
/// interval and fails once the budget is spent.
pub struct Timeout {
    remaining: Cell<u32>,
    interval: Duration,
}

impl Timeout {
    #[inline]
    pub fn new(polls: u32, interval: Duration) -> Self {
        Self {
            remaining: Cell::new(polls),
            interval,
        }
    }

    #[inline]
    pub fn from_micros(polls: u32, micros: u64) -> Self {
        Self::new(polls, Duration::from_micros(micros))
    }

    #[inline]
    pub fn from_millis(polls: u32, millis: u64) -> Self {
        Self::new(polls, Duration::from_millis(millis))
    }

    #[inline]
    pub fn remaining(&self) -> u32 {
        self.remaining.get()
    }

    #[inline]
    pub fn run(&self) -> Result<(), ()> {
        match self.remaining.get() {
            0 => Err(()),
            polls => {
                self.remaining.set(polls - 1);
                if self.interval.is_zero() {
                    thread::yield_now();
                } else {
                    thread::sleep(self.interval);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn budget_is_bounded() {
        let timeout = Timeout::from_micros(3, 0);
        assert!(timeout.run().is_ok());
        assert!(timeout.run().is_ok());
        assert!(timeout.run().is_ok());
        assert_eq!(timeout.remaining(), 0);
        assert!(timeout.run().is_err());
    }

    #[test]
    fn condition_met_before_budget() {
        let timeout = Timeout::from_micros(10, 0);
        let mut ready = 0;
        while ready < 4 {
            timeout.run().unwrap();
            ready += 1;
        }
        assert_eq!(timeout.remaining(), 6);
    }
}
