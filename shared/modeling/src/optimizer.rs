use tch::{COptimizer, Kind, TchError, Tensor};

/// AdamW over a fixed set of variables.
///
/// Parameters are registered in the order given; pass the name-sorted list
/// from [`crate::stable_variables`] so optimizer state lines up across
/// replicas.
#[derive(Debug)]
pub struct AdamW {
    optimizer: COptimizer,
    lr: f64,
}

impl AdamW {
    pub fn new(vars: &[(String, Tensor)], lr: f64) -> Result<Self, TchError> {
        let mut optimizer = COptimizer::adamw(lr, 0.9, 0.999, 0.01, 1e-8, false)?;
        for (_, tensor) in vars {
            optimizer.add_parameters(tensor, 0)?;
        }
        Ok(Self { optimizer, lr })
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f64) -> Result<(), TchError> {
        self.optimizer.set_learning_rate(lr)?;
        self.lr = lr;
        Ok(())
    }

    pub fn zero_grad(&mut self) -> Result<(), TchError> {
        self.optimizer.zero_grad()
    }

    pub fn step(&mut self) -> Result<(), TchError> {
        self.optimizer.step()
    }
}

/// Scale all gradients so their global L2 norm does not exceed `max_norm`.
/// Returns the pre-clip norm.
pub fn clip_global_grad_norm(vars: &[(String, Tensor)], max_norm: f64) -> f64 {
    let _guard = tch::no_grad_guard();
    let mut total_sq = 0f64;
    for (_, var) in vars {
        let grad = var.grad();
        if grad.defined() {
            total_sq += grad
                .to_kind(Kind::Float)
                .square()
                .sum(Kind::Float)
                .double_value(&[]);
        }
    }
    let total = total_sq.sqrt();
    if total > max_norm {
        let scale = max_norm / (total + 1e-6);
        for (_, var) in vars {
            let mut grad = var.grad();
            if grad.defined() {
                let scaled = &grad * scale;
                let _ = grad.copy_(&scaled);
            }
        }
    }
    total
}

/// Sum of per-parameter gradient L2 norms. With gradients already averaged
/// across ranks this is representative of every replica, so only the
/// coordinator computes it.
pub fn grad_norm_sum(vars: &[(String, Tensor)]) -> f64 {
    let _guard = tch::no_grad_guard();
    vars.iter()
        .map(|(_, var)| {
            let grad = var.grad();
            if grad.defined() {
                grad.to_kind(Kind::Float)
                    .square()
                    .sum(Kind::Float)
                    .double_value(&[])
                    .sqrt()
            } else {
                0.0
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, Device};

    fn var_with_grad() -> (nn::VarStore, Vec<(String, Tensor)>) {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().var("w", &[4], nn::Init::Const(1.0));
        let loss = (&w * &w).sum(Kind::Float);
        loss.backward();
        let vars = vec![("w".to_string(), w)];
        (vs, vars)
    }

    #[test]
    fn test_grad_norm_sum() {
        let (_vs, vars) = var_with_grad();
        // d(w*w)/dw = 2 per element, norm = sqrt(4 * 4) = 4
        assert!((grad_norm_sum(&vars) - 4.0).abs() < 1e-5);
    }

    #[test]
    fn test_clip_reduces_global_norm() {
        let (_vs, vars) = var_with_grad();
        let pre = clip_global_grad_norm(&vars, 2.0);
        assert!((pre - 4.0).abs() < 1e-5);
        assert!(grad_norm_sum(&vars) <= 2.0 + 1e-4);
    }

    #[test]
    fn test_clip_is_noop_below_threshold() {
        let (_vs, vars) = var_with_grad();
        clip_global_grad_norm(&vars, 100.0);
        assert!((grad_norm_sum(&vars) - 4.0).abs() < 1e-5);
    }

    #[test]
    fn test_adamw_step_moves_parameters() {
        let (_vs, vars) = var_with_grad();
        let before = vars[0].1.double_value(&[0]);
        let mut optimizer = AdamW::new(&vars, 0.1).unwrap();
        optimizer.step().unwrap();
        let after = vars[0].1.double_value(&[0]);
        assert!((before - after).abs() > 1e-6);
    }

    #[test]
    fn test_set_lr() {
        let (_vs, vars) = var_with_grad();
        let mut optimizer = AdamW::new(&vars, 0.1).unwrap();
        optimizer.set_lr(0.01).unwrap();
        assert_eq!(optimizer.lr(), 0.01);
    }
}
