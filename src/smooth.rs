//! Discrete stepping toward a target value, shared by the gamma and
//! backlight smoothing timers.

#[derive(Debug, Clone, Copy)]
pub struct Ramp {
    current: i32,
    target: i32,
    step: i32,
}

impl Ramp {
    /// `step` is an absolute increment per tick and must be positive.
    pub fn new(current: i32, target: i32, step: i32) -> Self {
        Self {
            current,
            target,
            step: step.max(1),
        }
    }

    /// Move one step toward the target, clamping at it, and return the
    /// new value.
    pub fn advance(&mut self) -> i32 {
        let delta = self.target - self.current;
        if delta.abs() <= self.step {
            self.current = self.target;
        } else {
            self.current += self.step * delta.signum();
        }
        self.current
    }

    pub fn finished(&self) -> bool {
        self.current == self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_up_and_clamps() {
        let mut r = Ramp::new(100, 350, 100);
        assert_eq!(r.advance(), 200);
        assert_eq!(r.advance(), 300);
        assert_eq!(r.advance(), 350);
        assert!(r.finished());
        // Advancing a finished ramp is a no-op.
        assert_eq!(r.advance(), 350);
    }

    #[test]
    fn steps_down() {
        let mut r = Ramp::new(6500, 6350, 50);
        assert_eq!(r.advance(), 6450);
        assert_eq!(r.advance(), 6400);
        assert_eq!(r.advance(), 6350);
        assert!(r.finished());
    }

    #[test]
    fn zero_step_is_coerced() {
        let mut r = Ramp::new(0, 3, 0);
        assert_eq!(r.advance(), 1);
        assert_eq!(r.advance(), 2);
        assert_eq!(r.advance(), 3);
    }

    #[test]
    fn starts_finished_when_already_at_target() {
        let r = Ramp::new(42, 42, 5);
        assert!(r.finished());
    }
}
