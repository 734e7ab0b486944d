use std::{thread, time};

pub struct Deadline(time::Instant);

impl Deadline {
    /// Create a new deadline that times out after the provided duration.
    pub fn after(timeout: time::Duration) -> Self {
        Self(time::Instant::now() + timeout)
    }

    /// If there is enough time to sleep before the deadline, sleeps and returns
    /// Ok. Otherwise, returns Err.
    pub fn sleep(&self, duration: time::Duration) -> Result<(), ()> {
        if time::Instant::now() + duration < self.0 {
            thread::sleep(duration);
            Ok(())
        } else {
            Err(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_fails_once_expired() {
        let deadline = Deadline::after(time::Duration::from_millis(20));
        assert!(deadline.sleep(time::Duration::from_millis(1)).is_ok());
        assert!(deadline
            .sleep(time::Duration::from_millis(100))
            .is_err());
    }
}
