//! Channel arbitration.
//!
//! The memory controller services at most one request per port per cycle;
//! the arbiter picks which of the K requesting channels wins. Two policies
//! are supported:
//!
//! * Round-robin: a pointer `r` nominates channel `r`; if it is not
//!   requesting, the first requesting channel after it (modulo K) wins. The
//!   pointer advances by one every cycle whether or not a transfer occurred.
//! * Fixed priority: channel 0 beats channel 1 beats ... beats K-1,
//!   independent of history.

/// Arbitration policy for a group of channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Arbitration {
    #[default]
    RoundRobin,
    Priority,
}

#[derive(Debug)]
pub struct Arbiter {
    policy: Arbitration,
    channels: usize,
    pointer: usize,
}

impl Arbiter {
    pub fn new(policy: Arbitration, channels: usize) -> Self {
        Self {
            policy,
            channels,
            pointer: 0,
        }
    }

    /// Pick the winning channel among those with `valids[c] == true`, or
    /// None when nobody is requesting. Pure combinational selection; call
    /// [`Arbiter::advance`] once per cycle to rotate the round-robin
    /// pointer.
    pub fn select(&self, valids: &[bool]) -> Option<usize> {
        debug_assert_eq!(valids.len(), self.channels);
        match self.policy {
            Arbitration::Priority => valids.iter().position(|&v| v),
            Arbitration::RoundRobin => (0..self.channels)
                .map(|n| (self.pointer + n) % self.channels)
                .find(|&c| valids[c]),
        }
    }

    /// Rotate the round-robin pointer. Runs every cycle, transfer or not.
    pub fn advance(&mut self) {
        if self.channels > 0 {
            self.pointer = (self.pointer + 1) % self.channels;
        }
    }

    /// Return the pointer to its reset position.
    pub fn clear(&mut self) {
        self.pointer = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_priority_always_prefers_low_channels() {
        let arb = Arbiter::new(Arbitration::Priority, 3);
        assert_eq!(arb.select(&[false, true, true]), Some(1));
        assert_eq!(arb.select(&[true, true, true]), Some(0));
        assert_eq!(arb.select(&[false, false, true]), Some(2));
        assert_eq!(arb.select(&[false, false, false]), None);
    }

    #[test]
    fn check_round_robin_rotates_preference() {
        let mut arb = Arbiter::new(Arbitration::RoundRobin, 3);
        // Pointer at 0
        assert_eq!(arb.select(&[true, true, true]), Some(0));
        arb.advance();
        assert_eq!(arb.select(&[true, true, true]), Some(1));
        arb.advance();
        assert_eq!(arb.select(&[true, true, true]), Some(2));
        arb.advance();
        assert_eq!(arb.select(&[true, true, true]), Some(0));
    }

    #[test]
    fn check_round_robin_skips_idle_channels() {
        let mut arb = Arbiter::new(Arbitration::RoundRobin, 4);
        arb.advance(); // pointer = 1
        assert_eq!(arb.select(&[true, false, false, true]), Some(3));
    }

    #[test]
    fn check_pointer_advances_without_requests() {
        let mut arb = Arbiter::new(Arbitration::RoundRobin, 2);
        assert_eq!(arb.select(&[false, false]), None);
        arb.advance();
        // The idle cycle still moved the pointer
        assert_eq!(arb.select(&[true, true]), Some(1));
    }

    #[test]
    fn check_clear_resets_pointer() {
        let mut arb = Arbiter::new(Arbitration::RoundRobin, 3);
        arb.advance();
        arb.advance();
        arb.clear();
        assert_eq!(arb.select(&[true, true, true]), Some(0));
    }
}
