//! Client-side port-walking policy (§6 "Port-walk policy").
//!
//! Each worker owns one [`PortWalker`] that hands out `(local_port,
//! remote_port)` pairs for successive connects, either advancing only the
//! local port (the default) or the full cartesian product of local x remote
//! when `-xconnect` is given. A wrap of the local port back to the start of
//! its range sets a flag the supervisor surfaces once per interval.

use crate::config::PortRange;

/// Walks `(local_port, remote_port)` pairs for one worker's connects.
#[derive(Debug, Clone)]
pub struct PortWalker {
    local:       Option<PortRange>,
    remote:      PortRange,
    cartesian:   bool,
    local_cur:   u16,
    remote_cur:  u16,
    wrapped:     bool,
}

impl PortWalker {
    /// `local` is `None` when the client uses ephemeral local ports
    /// (`-bcp 0`), in which case `next()` always returns `local_port = 0`
    /// and `xconnect` has no effect.
    pub fn new(local: Option<PortRange>, remote: PortRange, remote_start_offset: u32, cartesian: bool) -> Self {
        let remote_cur = remote.start.wrapping_add(remote_start_offset as u16);
        Self {
            local,
            remote,
            cartesian,
            local_cur: local.map_or(0, |r| r.start),
            remote_cur,
            wrapped: false,
        }
    }

    /// The pair to use for the next connect.
    pub fn current(&self) -> (u16, u16) {
        (self.local_cur, self.remote_cur)
    }

    /// Advances to the next pair per §6's policy. Returns `true` if the
    /// local port just wrapped back to the start of its range (a "port
    /// wrap" event, surfaced at most once per reporting interval).
    pub fn advance(&mut self) -> bool {
        let Some(local) = self.local else {
            return false;
        };

        if self.cartesian {
            let remote_end = self.remote.end_exclusive();
            let next_remote = u32::from(self.remote_cur) + 1;
            if next_remote < remote_end {
                self.remote_cur = next_remote as u16;
                return false;
            }
            self.remote_cur = self.remote.start;
            self.advance_local(local)
        } else {
            self.advance_local(local)
        }
    }

    fn advance_local(&mut self, local: PortRange) -> bool {
        let end = local.end_exclusive();
        let next = u32::from(self.local_cur) + 1;
        if next < end {
            self.local_cur = next as u16;
            false
        } else {
            self.local_cur = local.start;
            self.wrapped = true;
            true
        }
    }

    /// Consumes and clears the port-wrap-around flag (the supervisor polls
    /// this once per display interval, per §11).
    pub fn take_wrapped(&mut self) -> bool {
        std::mem::replace(&mut self.wrapped, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u16, count: u32) -> PortRange {
        PortRange { start, count }
    }

    #[test]
    fn non_cartesian_only_advances_local_port() {
        let mut w = PortWalker::new(Some(range(100, 3)), range(200, 1), 0, false);
        assert_eq!(w.current(), (100, 200));
        assert!(!w.advance());
        assert_eq!(w.current(), (101, 200));
        assert!(!w.advance());
        assert_eq!(w.current(), (102, 200));
        assert!(w.advance());
        assert_eq!(w.current(), (100, 200));
    }

    #[test]
    fn cartesian_product_visits_every_pair_before_wrapping() {
        let mut w = PortWalker::new(Some(range(30_000, 4)), range(20_000, 3), 0, true);
        let mut seen = std::collections::HashSet::new();
        seen.insert(w.current());
        let mut wraps = 0;
        for _ in 0..11 {
            if w.advance() {
                wraps += 1;
            }
            seen.insert(w.current());
        }
        assert_eq!(seen.len(), 12);
        assert_eq!(wraps, 0);
        // The 13th connect's advance wraps back to the very first pair.
        assert!(w.advance());
        assert_eq!(w.current(), (30_000, 20_000));
    }

    #[test]
    fn ephemeral_local_port_never_wraps() {
        let mut w = PortWalker::new(None, range(20_000, 3), 0, true);
        assert_eq!(w.current().0, 0);
        for _ in 0..10 {
            assert!(!w.advance());
        }
    }

    proptest::proptest! {
        #[test]
        fn cartesian_round_trip_wraps_exactly_once_per_full_cycle(
            local_count in 1u32..6,
            remote_count in 1u32..6,
        ) {
            let mut w = PortWalker::new(Some(range(30_000, local_count)), range(20_000, remote_count), 0, true);
            let total_pairs = u64::from(local_count) * u64::from(remote_count);
            let mut wraps = 0u64;
            let first = w.current();
            for _ in 0..total_pairs {
                if w.advance() {
                    wraps += 1;
                }
            }
            proptest::prop_assert_eq!(wraps, 1);
            proptest::prop_assert_eq!(w.current(), first);
        }
    }
}
