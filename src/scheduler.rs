use std::f64::consts::PI;

use tracing::debug;

/// Cosine annealing with warm restarts.
///
/// Drive it with `step()` once when the optimizer is created and once after every
/// optimizer update. The first call returns the base rates unchanged; after that the
/// step index starts at `last_epoch + 1`, so the rate is back at its base value on the
/// `t_max`-th call and a new cycle begins there.
#[derive(Debug, Clone)]
pub struct CosineWithRestarts {
    base_lrs: Vec<f64>,
    t_max: usize,
    eta_min: f64,
    factor: f64,
    last_epoch: i64,
    last_restart: i64,
    cycle_counter: i64,
    cycle_factor: f64,
    updated_cycle_len: i64,
    restarts: usize,
    initialized: bool,
}

impl CosineWithRestarts {
    /// `t_max` is clamped to at least one step.
    pub fn new(base_lrs: Vec<f64>, t_max: usize, eta_min: f64, factor: f64) -> Self {
        let t_max = t_max.max(1);
        CosineWithRestarts {
            base_lrs,
            t_max,
            eta_min,
            factor,
            last_epoch: -1,
            last_restart: 0,
            cycle_counter: 0,
            cycle_factor: 1.0,
            updated_cycle_len: t_max as i64,
            restarts: 0,
            initialized: false,
        }
    }

    /// Advances one step and returns the learning rate for each base rate.
    pub fn step(&mut self) -> Vec<f64> {
        self.last_epoch += 1;
        self.get_lr()
    }

    fn get_lr(&mut self) -> Vec<f64> {
        if !self.initialized {
            self.initialized = true;
            return self.base_lrs.clone();
        }

        let step = self.last_epoch + 1;
        self.cycle_counter = step - self.last_restart;
        let position = self.cycle_counter % self.updated_cycle_len;
        let phase = PI * position as f64 / self.updated_cycle_len as f64;
        let lrs = self
            .base_lrs
            .iter()
            .map(|lr| self.eta_min + ((lr - self.eta_min) / 2.0) * (phase.cos() + 1.0))
            .collect();

        if position == 0 {
            self.cycle_factor *= self.factor;
            self.cycle_counter = 0;
            self.updated_cycle_len = ((self.cycle_factor * self.t_max as f64) as i64).max(1);
            self.last_restart = step;
            self.restarts += 1;
            debug!(
                step,
                cycle_len = self.updated_cycle_len,
                "learning rate warm restart"
            );
        }
        lrs
    }

    pub fn cycle_len(&self) -> i64 {
        self.updated_cycle_len
    }

    pub fn restarts(&self) -> usize {
        self.restarts
    }

    pub fn last_restart(&self) -> i64 {
        self.last_restart
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_first_call_returns_base_rates() {
        let mut scheduler = CosineWithRestarts::new(vec![0.1, 0.01], 10, 0.0, 1.0);
        assert_eq!(scheduler.step(), vec![0.1, 0.01]);
        assert_eq!(scheduler.restarts(), 0);
    }

    #[test]
    fn test_full_cycle_returns_to_base_rate() {
        let t_max = 6;
        let mut scheduler = CosineWithRestarts::new(vec![0.1], t_max, 0.0, 1.0);
        let start = scheduler.step()[0];
        let mut rates = Vec::new();
        for _ in 1..t_max {
            rates.push(scheduler.step()[0]);
        }
        // Every rate inside the cycle is below the start; the last one is back at it.
        let (last, inside) = rates.split_last().unwrap();
        assert!(inside.iter().all(|&lr| lr < start));
        assert!(close(*last, start));
        assert_eq!(scheduler.restarts(), 1);
        assert_eq!(scheduler.last_restart(), t_max as i64);
        assert_eq!(scheduler.cycle_len(), t_max as i64);
    }

    #[test]
    fn test_rate_follows_cosine_between_restarts() {
        let (lr, eta_min, t_max) = (1.0, 0.1, 4);
        let mut scheduler = CosineWithRestarts::new(vec![lr], t_max, eta_min, 1.0);
        scheduler.step();
        // The second call is step 2 of the cycle.
        let expected = eta_min + (lr - eta_min) / 2.0 * ((PI * 2.0 / 4.0).cos() + 1.0);
        assert!(close(scheduler.step()[0], expected));
        let expected = eta_min + (lr - eta_min) / 2.0 * ((PI * 3.0 / 4.0).cos() + 1.0);
        assert!(close(scheduler.step()[0], expected));
        assert!(close(scheduler.step()[0], lr));
    }

    #[test]
    fn test_factor_grows_cycle_length() {
        let mut scheduler = CosineWithRestarts::new(vec![0.5], 3, 0.0, 2.0);
        for _ in 0..3 {
            scheduler.step();
        }
        assert_eq!(scheduler.restarts(), 1);
        assert_eq!(scheduler.cycle_len(), 6);
        // The next restart lands six steps after the first.
        for _ in 0..5 {
            scheduler.step();
            assert_eq!(scheduler.restarts(), 1);
        }
        assert!(close(scheduler.step()[0], 0.5));
        assert_eq!(scheduler.restarts(), 2);
        assert_eq!(scheduler.last_restart(), 9);
        assert_eq!(scheduler.cycle_len(), 12);
    }

    #[test]
    fn test_rates_never_drop_below_floor() {
        let mut scheduler = CosineWithRestarts::new(vec![0.2], 7, 0.05, 1.0);
        for _ in 0..50 {
            let lr = scheduler.step()[0];
            assert!((0.05..=0.2 + 1e-12).contains(&lr));
        }
    }
}
