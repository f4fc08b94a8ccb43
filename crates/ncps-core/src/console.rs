//! Interactive console control thread (C7, §4.7).
//!
//! Reads single characters from standard input: `p` pauses every worker
//! (they sleep in the wait-list/ready loop until resumed), `r` resumes, and
//! `b` cycles the display verbosity 0 -> 1 -> 2 -> 0. Unrecognized bytes are
//! ignored, matching `console_input_thread_fn` in the original.

use std::io::Read;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::engine::SharedControls;

/// The periodic report's verbosity, cycled by the console thread and read by
/// the supervisor's display loop. Not part of [`SharedControls`] since no
/// worker consults it, only the supervisor's own reporting code.
#[derive(Default)]
pub struct DisplayBrief(AtomicU8);

impl DisplayBrief {
    /// Starts at `initial` (0 = verbose, 1 = brief, 2 = brief2).
    pub fn new(initial: u8) -> Self {
        Self(AtomicU8::new(initial))
    }

    /// The current display level.
    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }

    fn cycle(&self) -> u8 {
        let prev = self.0.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some((v + 1) % 3));
        (prev.unwrap_or(0) + 1) % 3
    }
}

/// Spawns the console thread. It exits once stdin is closed, a read fails, or
/// [`SharedControls::stop`] is observed set.
pub fn spawn(controls: Arc<SharedControls>, brief: Arc<DisplayBrief>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut lock = stdin.lock();
        let mut byte = [0u8; 1];
        loop {
            if controls.stop.load(Ordering::Relaxed) {
                return;
            }
            match lock.read(&mut byte) {
                Ok(0) => return,
                Ok(_) => match byte[0] {
                    b'p' => {
                        controls.pause_all_activity.store(true, Ordering::Relaxed);
                        tracing::info!("console: paused");
                    }
                    b'r' => {
                        controls.pause_all_activity.store(false, Ordering::Relaxed);
                        tracing::info!("console: resumed");
                    }
                    b'b' => {
                        let level = brief.cycle();
                        tracing::info!(level, "console: brief level cycled");
                    }
                    _ => {}
                },
                Err(_) => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brief_cycles_zero_one_two_zero() {
        let b = DisplayBrief::new(0);
        assert_eq!(b.cycle(), 1);
        assert_eq!(b.cycle(), 2);
        assert_eq!(b.cycle(), 0);
    }
}
