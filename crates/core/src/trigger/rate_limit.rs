/// Trailing-edge coalescing window for one device.
///
/// The first offer opens a window `interval` seconds long. Offers made while
/// the window is open replace the pending value, and whatever is pending when
/// the window closes is released. Consecutive releases are therefore always at
/// least `interval` apart.
#[derive(Debug, Clone)]
pub struct Coalescer<T> {
    pending: Option<T>,
    window_end: Option<f64>,
}

impl<T> Default for Coalescer<T> {
    fn default() -> Self {
        Self {
            pending: None,
            window_end: None,
        }
    }
}

impl<T> Coalescer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages `value`, opening a window at `now` if none is open.
    pub fn offer(&mut self, now: f64, interval: f64, value: T) {
        if self.window_end.is_none() {
            self.window_end = Some(now + interval);
        }
        self.pending = Some(value);
    }

    /// Releases the pending value once its window has closed.
    pub fn poll(&mut self, now: f64) -> Option<T> {
        match self.window_end {
            Some(end) if now >= end => {
                self.window_end = None;
                self.pending.take()
            }
            _ => None,
        }
    }

    /// Value waiting for the window to close.
    pub fn pending(&self) -> Option<&T> {
        self.pending.as_ref()
    }
}
