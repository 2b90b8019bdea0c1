use crate::types::U31_MAX;

/// The peer (or we) pushed a window past 2^31-1, or sent more octets than
/// the window allowed. Always a FLOW_CONTROL_ERROR at the scope it occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlowControlViolation;

/// Signed flow-control credit.
///
/// A SETTINGS-driven delta may push the value negative; it must never exceed
/// the positive bound. https://httpwg.org/specs/rfc7540.html#FlowControl
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Window(i32);

impl Window {
    pub(crate) fn new(size: u32) -> Self {
        debug_assert!(size <= U31_MAX);
        Self(size as i32)
    }

    /// Credit currently usable; zero while the window is negative.
    pub(crate) fn available(self) -> u32 {
        if self.0 < 0 {
            0
        } else {
            self.0 as u32
        }
    }

    /// Applies a WINDOW_UPDATE increment.
    pub(crate) fn increase(&mut self, increment: u32) -> Result<(), FlowControlViolation> {
        let next = i64::from(self.0) + i64::from(increment);
        if next > i64::from(U31_MAX) {
            return Err(FlowControlViolation);
        }
        self.0 = next as i32;
        Ok(())
    }

    /// Spends credit for octets actually written. The caller checks
    /// `available` first.
    pub(crate) fn consume(&mut self, amount: u32) {
        debug_assert!(amount <= self.available());
        self.0 -= amount as i32;
    }

    /// Applies a signed INITIAL_WINDOW_SIZE delta. Negative underflow is
    /// unreachable with legal setting values, so only the positive bound is
    /// checked.
    pub(crate) fn adjust(&mut self, delta: i64) -> Result<(), FlowControlViolation> {
        let next = i64::from(self.0) + delta;
        if next > i64::from(U31_MAX) {
            return Err(FlowControlViolation);
        }
        self.0 = next.max(i64::from(i32::MIN)) as i32;
        Ok(())
    }
}

/// Incoming flow-control accounting: how much the peer may still send, and
/// when to hand credit back.
///
/// Once consumption crosses half the initial window, the window is restored
/// to its initial size and the increment to advertise is returned.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecvFlow {
    window: Window,
    init: u32,
}

impl RecvFlow {
    pub(crate) fn new(init: u32) -> Self {
        Self {
            window: Window::new(init),
            init,
        }
    }

    /// Accounts for received flow-controlled octets. `Ok(Some(n))` means a
    /// WINDOW_UPDATE with increment `n` is due.
    pub(crate) fn recv(&mut self, len: u32) -> Result<Option<u32>, FlowControlViolation> {
        if len > self.window.available() {
            return Err(FlowControlViolation);
        }
        self.window.consume(len);
        let spent = self.init.saturating_sub(self.window.available());
        if spent > 0 && spent >= self.init / 2 {
            self.window = Window::new(self.init);
            return Ok(Some(spent));
        }
        Ok(None)
    }

    /// Retargets the initial window after our INITIAL_WINDOW_SIZE proposal
    /// was acknowledged, shifting the live window by the delta.
    pub(crate) fn set_init(&mut self, init: u32) -> Result<(), FlowControlViolation> {
        let delta = i64::from(init) - i64::from(self.init);
        self.window.adjust(delta)?;
        self.init = init;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_bounds() {
        let mut w = Window::new(U31_MAX - 1);
        assert!(w.increase(1).is_ok());
        assert_eq!(w.available(), U31_MAX);
        assert_eq!(w.increase(1), Err(FlowControlViolation));
    }

    #[test]
    fn consume_and_refill() {
        let mut w = Window::new(10);
        w.consume(10);
        assert_eq!(w.available(), 0);
        w.increase(3).unwrap();
        assert_eq!(w.available(), 3);
    }

    #[test]
    fn negative_after_adjust() {
        let mut w = Window::new(5);
        w.adjust(-10).unwrap();
        assert_eq!(w.available(), 0);
        w.increase(7).unwrap();
        assert_eq!(w.available(), 2);
    }

    #[test]
    fn recv_replenishes_at_half() {
        let mut flow = RecvFlow::new(100);
        assert_eq!(flow.recv(20).unwrap(), None);
        assert_eq!(flow.recv(30).unwrap(), Some(50));
        // window restored; accounting starts over
        assert_eq!(flow.recv(49).unwrap(), None);
        assert_eq!(flow.recv(1).unwrap(), Some(50));
    }

    #[test]
    fn recv_overrun_is_violation() {
        let mut flow = RecvFlow::new(10);
        assert_eq!(flow.recv(11), Err(FlowControlViolation));
    }
}
