//! Per-epoch learning rate schedules

use std::f32::consts::PI;

use super::optim::Optimizer;

/// A learning rate that moves once per epoch
pub trait LRScheduler {
    /// Rate for the current epoch
    fn get_lr(&self) -> f32;

    /// Advance to the next epoch
    fn step(&mut self);
}

/// Half-cosine decay from `initial` to `floor` over `period` epochs, then flat at `floor`.
#[derive(Debug, Clone)]
pub struct CosineAnnealingLR {
    initial: f32,
    floor: f32,
    period: usize,
    epoch: usize,
}

impl CosineAnnealingLR {
    /// `period` is normally the number of fine-tune epochs
    pub fn new(initial: f32, period: usize, floor: f32) -> Self {
        CosineAnnealingLR { initial, floor, period, epoch: 0 }
    }

    /// Push the current rate into `optimizer`
    pub fn apply<O: Optimizer + ?Sized>(&self, optimizer: &mut O) {
        optimizer.set_lr(self.get_lr());
    }
}

impl LRScheduler for CosineAnnealingLR {
    fn get_lr(&self) -> f32 {
        match self.epoch.checked_sub(self.period) {
            Some(_) => self.floor,
            None => {
                let phase = PI * self.epoch as f32 / self.period as f32;
                self.floor + (self.initial - self.floor) * (1.0 + phase.cos()) / 2.0
            }
        }
    }

    fn step(&mut self) {
        self.epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn starts_at_max_and_ends_at_floor() {
        let mut sched = CosineAnnealingLR::new(5e-4, 100, 1e-6);
        assert_abs_diff_eq!(sched.get_lr(), 5e-4, epsilon = 1e-9);

        for _ in 0..50 {
            sched.step();
        }
        assert_abs_diff_eq!(sched.get_lr(), (5e-4 + 1e-6) / 2.0, epsilon = 1e-8);

        for _ in 0..60 {
            sched.step();
        }
        assert_eq!(sched.get_lr(), 1e-6);
    }

    #[test]
    fn decreases_monotonically_over_the_period() {
        let mut sched = CosineAnnealingLR::new(1.0, 10, 0.0);
        let mut last = sched.get_lr();
        for _ in 0..10 {
            sched.step();
            let lr = sched.get_lr();
            assert!(lr <= last);
            last = lr;
        }
    }
}
