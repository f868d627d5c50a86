use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{info, warn};

struct Bucket {
    max_msg_sec: u32,
    sleep: Duration,
    counter: u32,
    last_second: u64,
}

/// Rate limiter for inbound message paths: a counter over the current
/// wall-clock second that puts the calling thread to sleep once it reaches
/// the cap. The sleep lands on the transport's receive thread, which is the
/// path that must slow down.
pub struct Throttle {
    bucket: Mutex<Bucket>,
}

impl Throttle {
    pub fn new(max_msg_sec: u32, sleep_sec: f64) -> Self {
        Throttle {
            bucket: Mutex::new(Bucket {
                max_msg_sec,
                sleep: Duration::from_secs_f64(sleep_sec),
                counter: 0,
                last_second: wall_clock_second(),
            }),
        }
    }

    pub fn set_max_msg_sec(&self, max_msg_sec: u32) {
        info!("Set max_msg_sec({max_msg_sec})");
        self.bucket.lock().expect("throttle lock poisoned").max_msg_sec = max_msg_sec;
    }

    pub fn set_sleep_sec(&self, sleep_sec: f64) {
        info!("Set sleep_sec({sleep_sec})");
        self.bucket.lock().expect("throttle lock poisoned").sleep =
            Duration::from_secs_f64(sleep_sec);
    }

    /// Count one message. Returns `true` when the cap was hit and the caller
    /// has already been slept for the configured duration.
    pub fn throttle(&self) -> bool {
        let mut bucket = self.bucket.lock().expect("throttle lock poisoned");

        let now = wall_clock_second();
        if now != bucket.last_second {
            bucket.counter = 1;
            bucket.last_second = now;
            return false;
        }

        bucket.counter += 1;
        if bucket.counter < bucket.max_msg_sec {
            return false;
        }

        warn!(
            "Throttle: sleeping for {:?}. counter({}) max_msg_sec({})",
            bucket.sleep, bucket.counter, bucket.max_msg_sec
        );
        std::thread::sleep(bucket.sleep);

        true
    }
}

fn wall_clock_second() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
