//! Fault channel for asynchronous failures
//!
//! A subject may run background threads (a write-behind writer, for example)
//! that hit a failure nobody is waiting on. The channel is a single-slot,
//! thread-safe cell: the first report wins, later reports are dropped. The
//! harness polls it after every synchronous call and once more before it
//! declares that no failure was observed.

use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;

/// Receiving side of a fault channel
pub struct FaultChannel<E> {
    slot: Arc<OnceCell<E>>,
}

/// Sending side of a fault channel; cheap to clone into callbacks
pub struct FaultReporter<E> {
    slot: Arc<OnceCell<E>>,
}

impl<E> FaultChannel<E> {
    /// Create an empty channel
    pub fn new() -> Self {
        FaultChannel {
            slot: Arc::new(OnceCell::new()),
        }
    }

    /// A reporter writing into this channel
    pub fn reporter(&self) -> FaultReporter<E> {
        FaultReporter {
            slot: Arc::clone(&self.slot),
        }
    }

    /// The recorded fault, if any
    pub fn poll(&self) -> Option<&E> {
        self.slot.get()
    }

    /// Whether a fault has been recorded
    pub fn is_faulted(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Take the recorded fault out of the channel
    ///
    /// Returns `None` while a reporter still holds the slot, or if nothing was
    /// recorded. Intended for the end of a scenario once the subject is closed.
    pub fn into_fault(self) -> Option<E> {
        Arc::try_unwrap(self.slot).ok().and_then(OnceCell::into_inner)
    }
}

impl<E> Default for FaultChannel<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> FaultReporter<E> {
    /// Record `fault` unless one was recorded already
    ///
    /// Returns `true` if this call won the slot.
    pub fn report(&self, fault: E) -> bool {
        self.slot.set(fault).is_ok()
    }
}

impl<E> Clone for FaultReporter<E> {
    fn clone(&self) -> Self {
        FaultReporter {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for FaultChannel<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultChannel")
            .field("fault", &self.slot.get())
            .finish()
    }
}

impl<E> fmt::Debug for FaultReporter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultReporter").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn test_empty_channel() {
        let channel: FaultChannel<String> = FaultChannel::new();
        assert!(channel.poll().is_none());
        assert!(!channel.is_faulted());
    }

    #[test]
    fn test_first_report_wins() {
        let channel = FaultChannel::new();
        let reporter = channel.reporter();
        assert!(reporter.report("first"));
        assert!(!reporter.report("second"));
        assert_eq!(channel.poll(), Some(&"first"));
    }

    #[test]
    fn test_single_winner_across_threads() {
        let channel = FaultChannel::new();
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reporter = channel.reporter();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    reporter.report(i)
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(channel.is_faulted());
    }

    #[test]
    fn test_into_fault_after_reporters_dropped() {
        let channel = FaultChannel::new();
        let reporter = channel.reporter();
        reporter.report(42u32);
        drop(reporter);
        assert_eq!(channel.into_fault(), Some(42));
    }
}
