//! Polled reset countdown for the manifestation phase.

use core::cell::Cell;

use critical_section::Mutex;

/// Number of main-loop ticks between manifestation and device reset.
pub const RESET_POLL_TICKS: u32 = 500;

/// Countdown that turns the end of a DFU session into a device reset.
///
/// The DFU class driver arms the countdown when the state machine parks in
/// "manifestation, waiting for reset". A low-priority main-loop task then
/// calls [`check_reset()`](ResetWatchdog::check_reset) once per tick; on the
/// tick the counter hits zero the call returns `true` exactly once, and the
/// caller must detach the USB device and perform a full system reset.
///
/// The counter is armed from USB interrupt context and decremented from the
/// main loop, so both sides touch it only inside a critical section.
pub struct ResetWatchdog {
    ticks: u32,
    counter: Mutex<Cell<u32>>,
}

impl ResetWatchdog {
    /// Creates a watchdog that fires `ticks` calls after [`arm()`](Self::arm).
    pub const fn new(ticks: u32) -> Self {
        ResetWatchdog {
            ticks,
            counter: Mutex::new(Cell::new(0)),
        }
    }

    /// Starts the countdown.
    pub fn arm(&self) {
        critical_section::with(|cs| self.counter.borrow(cs).set(self.ticks));
    }

    /// Cancels a running countdown.
    pub fn disarm(&self) {
        critical_section::with(|cs| self.counter.borrow(cs).set(0));
    }

    /// Decrements a running countdown by one tick.
    ///
    /// Returns `true` exactly once per armed cycle, on the tick the counter
    /// reaches zero. Returns `false` while disarmed, while still counting,
    /// and on every call after the countdown has fired.
    pub fn check_reset(&self) -> bool {
        critical_section::with(|cs| {
            let counter = self.counter.borrow(cs);
            match counter.get() {
                0 => false,
                n => {
                    counter.set(n - 1);
                    n == 1
                }
            }
        })
    }
}
