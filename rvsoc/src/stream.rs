//! Valid/ready stream carrier.
//!
//! Every bus in the model is built from the same handshake: a producer
//! asserts `valid` alongside its payload, a consumer asserts `ready`, and a
//! transfer happens only on a cycle where both agree. In this software
//! rendering the forward half of the handshake is a [`Stream`] value
//! regenerated by the producer each cycle from its registered state, and the
//! backward half is a plain `bool` supplied by whoever consumes it. A
//! producer must keep offering the same payload until it observes the
//! transfer (the hold-stable contract), which here falls out naturally from
//! producing the offer as a function of state that only changes on accept.

/// One cycle's worth of the forward signals of a valid/ready handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stream<T> {
    pub valid: bool,
    pub data: T,
}

impl<T: Default> Default for Stream<T> {
    fn default() -> Self {
        Self::idle()
    }
}

impl<T: Default> Stream<T> {
    /// No offer this cycle. The payload carries its default value and must
    /// not be inspected.
    pub fn idle() -> Self {
        Self {
            valid: false,
            data: T::default(),
        }
    }
}

impl<T> Stream<T> {
    /// Offer `data` this cycle.
    pub fn offer(data: T) -> Self {
        Self { valid: true, data }
    }

    /// True when the transfer completes this cycle.
    pub fn fires(&self, ready: bool) -> bool {
        self.valid && ready
    }

    /// The payload, if one is being offered.
    pub fn get(&self) -> Option<&T> {
        if self.valid {
            Some(&self.data)
        } else {
            None
        }
    }
}
