//! Counters for retry attempts, message IDs, and protocol escalation limits.

/// Counter errors.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The counter wrapped past its maximum value.
    Exceeded,
}

/// A wrapping counter with a protocol-defined maximum value.
#[derive(Debug, Clone, Copy)]
pub struct Counter {
    value: u8,
    max_value: u8,
}

/// The protocol counters and their maximum values.
///
/// See USB PD R3.2, [Table 6.70].
#[derive(Debug, Clone, Copy)]
pub enum CounterType {
    /// nBusyCount.
    Busy,
    /// nCapsCount, bounding Source_Capabilities sends towards a silent partner.
    Caps,
    /// nDiscoverIdentityCount, bounding SOP' Discover_Identity attempts.
    DiscoverIdentity,
    /// nHardResetCount.
    HardReset,
    /// MessageIDCounter, a rolling 3-bit message ID.
    MessageId,
    /// nRetryCount, additional transmissions while waiting for GoodCRC.
    Retry,
    /// Source_Capabilities attempts towards a silent partner. When the
    /// counter wraps after the sixth attempt, the partner is considered
    /// non-PD and the port falls back to Type-C-only operation.
    SourceCapTry,
}

impl Counter {
    /// Create a counter of the given type, starting at zero.
    pub fn new(counter_type: CounterType) -> Self {
        let max_value = match counter_type {
            CounterType::Busy => 5,
            CounterType::Caps => 50,
            CounterType::DiscoverIdentity => 20,
            CounterType::HardReset => 2,
            CounterType::MessageId => 7,
            CounterType::Retry => 2,
            CounterType::SourceCapTry => 5,
        };

        Self { value: 0, max_value }
    }

    /// Create a counter with a caller-chosen maximum, e.g. the configured
    /// cable discovery attempt count.
    pub fn new_with_max(max_value: u8) -> Self {
        Self { value: 0, max_value }
    }

    /// Create a counter of the given type with an initial value.
    pub fn new_from_value(counter_type: CounterType, value: u8) -> Self {
        let mut counter = Self::new(counter_type);
        counter.set(value);
        counter
    }

    /// Set the counter, wrapping at the maximum value.
    pub fn set(&mut self, value: u8) {
        self.value = value % (self.max_value + 1);
    }

    /// The current value.
    pub fn value(&self) -> u8 {
        self.value
    }

    /// The maximum value before wrap-around.
    pub fn max_value(&self) -> u8 {
        self.max_value
    }

    /// Increment, reporting [`Error::Exceeded`] on wrap-around.
    pub fn increment(&mut self) -> Result<(), Error> {
        self.set(self.value + 1);

        if self.value == 0 {
            Err(Error::Exceeded)
        } else {
            Ok(())
        }
    }

    /// Reset to zero.
    pub fn reset(&mut self) {
        self.value = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::{Counter, CounterType, Error};

    #[test]
    fn message_id_wraps_modulo_8() {
        let mut counter = Counter::new(CounterType::MessageId);

        for expected in 1..=7 {
            counter.increment().unwrap();
            assert_eq!(counter.value(), expected);
        }

        // The eighth increment wraps back to zero and reports the overrun.
        assert_eq!(counter.increment(), Err(Error::Exceeded));
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn retry_counter_allows_two_retries() {
        let mut counter = Counter::new(CounterType::Retry);
        assert!(counter.increment().is_ok());
        assert!(counter.increment().is_ok());
        assert_eq!(counter.increment(), Err(Error::Exceeded));
    }

    #[test]
    fn custom_maximum() {
        let mut counter = Counter::new_with_max(1);
        assert!(counter.increment().is_ok());
        assert_eq!(counter.increment(), Err(Error::Exceeded));
    }
}
