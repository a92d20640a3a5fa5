//! Optimizers and learning-rate schedules for the built-in model.

use pawpular_core::{OptimizerKind, ParamsConfig, SchedulerKind};

/// Optimizer with its per-parameter state.
#[derive(Debug, Clone)]
pub enum Optimizer {
    Sgd {
        momentum: f64,
        weight_decay: f64,
        velocity: Vec<f64>,
    },
    Adam {
        beta1: f64,
        beta2: f64,
        eps: f64,
        weight_decay: f64,
        m: Vec<f64>,
        v: Vec<f64>,
        t: u64,
    },
}

impl Optimizer {
    pub fn from_params(params: &ParamsConfig, n_params: usize) -> Self {
        match params.optimizer {
            OptimizerKind::Sgd => Optimizer::Sgd {
                momentum: params.momentum,
                weight_decay: params.weight_decay,
                velocity: vec![0.0; n_params],
            },
            OptimizerKind::Adam => Optimizer::Adam {
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
                weight_decay: params.weight_decay,
                m: vec![0.0; n_params],
                v: vec![0.0; n_params],
                t: 0,
            },
        }
    }

    /// Apply one update. Weight decay is added to the gradient (L2 penalty).
    pub fn step(&mut self, weights: &mut [f64], grads: &[f64], lr: f64) {
        match self {
            Optimizer::Sgd {
                momentum,
                weight_decay,
                velocity,
            } => {
                for ((w, g), vel) in weights.iter_mut().zip(grads).zip(velocity.iter_mut()) {
                    let g = g + *weight_decay * *w;
                    *vel = *momentum * *vel + g;
                    *w -= lr * *vel;
                }
            }
            Optimizer::Adam {
                beta1,
                beta2,
                eps,
                weight_decay,
                m,
                v,
                t,
            } => {
                *t += 1;
                let bias1 = 1.0 - beta1.powi(*t as i32);
                let bias2 = 1.0 - beta2.powi(*t as i32);
                for (((w, g), m), v) in weights
                    .iter_mut()
                    .zip(grads)
                    .zip(m.iter_mut())
                    .zip(v.iter_mut())
                {
                    let g = g + *weight_decay * *w;
                    *m = *beta1 * *m + (1.0 - *beta1) * g;
                    *v = *beta2 * *v + (1.0 - *beta2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    *w -= lr * m_hat / (v_hat.sqrt() + *eps);
                }
            }
        }
    }
}

/// Learning rate as a function of the global step and epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct LrScheduler {
    kind: SchedulerKind,
    base_lr: f64,
    min_lr: f64,
    step_size: usize,
    gamma: f64,
    total_steps: usize,
}

impl LrScheduler {
    pub fn new(params: &ParamsConfig, steps_per_epoch: usize) -> Self {
        Self {
            kind: params.scheduler,
            base_lr: params.lr,
            min_lr: params.min_lr,
            step_size: params.step_size.max(1),
            gamma: params.gamma,
            total_steps: (steps_per_epoch * params.epoch).max(1),
        }
    }

    pub fn lr(&self, global_step: usize, epoch: usize) -> f64 {
        match self.kind {
            SchedulerKind::Constant => self.base_lr,
            SchedulerKind::Cosine => {
                let progress = global_step.min(self.total_steps) as f64 / self.total_steps as f64;
                let cosine = (std::f64::consts::PI * progress).cos();
                self.min_lr + 0.5 * (self.base_lr - self.min_lr) * (1.0 + cosine)
            }
            SchedulerKind::Step => {
                self.base_lr * self.gamma.powi((epoch / self.step_size) as i32)
            }
        }
    }
}
