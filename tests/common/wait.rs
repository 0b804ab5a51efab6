use std::{
    thread,
    time::{Duration, Instant},
};

/// Poll `condition` until it holds, panicking with `what` if it still does not after `timeout`.
pub(crate) fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting until {}", what);
        }
        thread::sleep(Duration::from_millis(5));
    }
}
