use ndarray::{Array, Dimension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta_1: f64,
    pub beta_2: f64,
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        AdamConfig {
            learning_rate: 1e-4,
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-7,
        }
    }
}

/// First and second moment estimates of one parameter tensor
#[derive(Debug, Default)]
struct Moments {
    first: Vec<f32>,
    second: Vec<f32>,
}

/// Adam with bias-corrected moments.
/// Parameters are addressed by slot, which every model visits in the same order on each step.
#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    beta_1: f32,
    beta_2: f32,
    epsilon: f32,
    time: i32,
    moments: Vec<Moments>,
}

impl Adam {
    pub fn new(config: &AdamConfig) -> Adam {
        Adam {
            learning_rate: config.learning_rate as f32,
            beta_1: config.beta_1 as f32,
            beta_2: config.beta_2 as f32,
            epsilon: config.epsilon as f32,
            time: 0,
            moments: Vec::new(),
        }
    }

    /// Number of steps taken so far
    pub fn steps(&self) -> i32 {
        self.time
    }

    /// Advance the step counter. Call once per batch before the updates.
    pub fn begin_step(&mut self) {
        self.time += 1;
    }

    pub fn update<D: Dimension>(
        &mut self,
        slot: usize,
        param: &mut Array<f32, D>,
        grad: &Array<f32, D>,
    ) {
        if self.moments.len() <= slot {
            self.moments.resize_with(slot + 1, Moments::default);
        }
        let moments = &mut self.moments[slot];
        if moments.first.len() != param.len() {
            moments.first = vec![0.0; param.len()];
            moments.second = vec![0.0; param.len()];
        }

        let time = self.time.max(1);
        let correction_1 = 1.0 - self.beta_1.powi(time);
        let correction_2 = 1.0 - self.beta_2.powi(time);

        for ((p, g), (m, v)) in param
            .iter_mut()
            .zip(grad.iter())
            .zip(moments.first.iter_mut().zip(moments.second.iter_mut()))
        {
            *m = self.beta_1 * *m + (1.0 - self.beta_1) * g;
            *v = self.beta_2 * *v + (1.0 - self.beta_2) * g * g;

            let m_hat = *m / correction_1;
            let v_hat = *v / correction_2;
            *p -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut adam = Adam::new(&AdamConfig {
            learning_rate: 0.01,
            ..AdamConfig::default()
        });
        let mut param = array![1.0f32, -2.0, 0.5];
        let grad = array![3.0f32, -0.5, 0.0];

        adam.begin_step();
        adam.update(0, &mut param, &grad);

        // Bias correction makes the first update lr * sign(g)
        assert!((param[0] - 0.99).abs() < 1e-5);
        assert!((param[1] + 1.99).abs() < 1e-5);
        assert_eq!(param[2], 0.5);
    }

    #[test]
    fn slots_keep_independent_state() {
        let mut adam = Adam::new(&AdamConfig::default());
        let mut a = array![[0.0f32, 0.0]];
        let mut b = array![0.0f32];

        for _ in 0..3 {
            adam.begin_step();
            adam.update(0, &mut a, &array![[1.0, -1.0]]);
            adam.update(1, &mut b, &array![2.0]);
        }

        assert_eq!(adam.steps(), 3);
        assert!(a[[0, 0]] < 0.0 && a[[0, 1]] > 0.0);
        assert!(b[0] < 0.0);
        assert!((a[[0, 0]] - b[0]).abs() < 1e-6);
    }

    #[test]
    fn minimizes_a_quadratic() {
        let mut adam = Adam::new(&AdamConfig {
            learning_rate: 0.1,
            ..AdamConfig::default()
        });
        let mut x = array![5.0f32];

        for _ in 0..500 {
            let grad = &x * 2.0;
            adam.begin_step();
            adam.update(0, &mut x, &grad);
        }

        assert!(x[0].abs() < 0.1, "{}", x[0]);
    }
}
