//! Group Normalization layer.
//!
//! Channels are split into `groups` contiguous groups and every group is
//! normalized with its own mean and variance, computed per sample over the
//! group's channels and all trailing (spatial) positions. Nothing depends on
//! the batch dimension, so the layer behaves identically for a batch of 1 and
//! a batch of 1024 and has no train/eval distinction.
//!
//! Group Normalization <https://arxiv.org/abs/1803.08494>

use std::borrow::Borrow;

use tch::{nn, Tensor};

use crate::{ExperimentError, Result};

/// Group-normalization config.
#[derive(Debug, Clone, Copy)]
pub struct GroupNormConfig {
    pub eps: f64,
    pub affine: bool,
}

impl Default for GroupNormConfig {
    fn default() -> Self {
        Self {
            eps: 1e-5,
            affine: true,
        }
    }
}

/// Normalizes `xs` of shape `(N, C, *)` over `groups` channel groups, without
/// any affine transform.
pub fn group_norm(xs: &Tensor, groups: i64, eps: f64) -> Result<Tensor> {
    let size = xs.size();
    if size.len() < 2 {
        return Err(ExperimentError::Shape(format!(
            "group norm expects at least (batch, channels), got {:?}",
            size
        )));
    }
    check_grouping(groups, size[1])?;
    check_eps(eps)?;
    Ok(normalize_groups(xs, groups, eps))
}

fn check_eps(eps: f64) -> Result<()> {
    if !(eps.is_finite() && eps > 0.0) {
        return Err(ExperimentError::Config(format!(
            "group norm epsilon must be a positive finite number, got {}",
            eps
        )));
    }
    Ok(())
}

fn check_grouping(groups: i64, channels: i64) -> Result<()> {
    if groups <= 0 || channels <= 0 {
        return Err(ExperimentError::Config(format!(
            "group norm needs positive groups and channels, got groups={} channels={}",
            groups, channels
        )));
    }
    if channels % groups != 0 {
        return Err(ExperimentError::Config(format!(
            "number of channels ({}) must be divisible by the number of groups ({})",
            channels, groups
        )));
    }
    Ok(())
}

fn normalize_groups(xs: &Tensor, groups: i64, eps: f64) -> Tensor {
    let size = xs.size();
    let grouped = xs.reshape(&[size[0], groups, -1]);

    // biased variance, as in the paper
    let mean = grouped.mean_dim(&[-1i64][..], true, grouped.kind());
    let var = grouped.var_dim(&[-1i64][..], false, true);

    let normalized = (&grouped - &mean) / (var + eps).sqrt();
    normalized.reshape(&size)
}

/// A group-normalization layer with optional per-channel scale and shift.
#[derive(Debug)]
pub struct GroupNorm {
    config: GroupNormConfig,
    /// Per-channel scale, initialised to 1.
    pub ws: Option<Tensor>,
    /// Per-channel shift, initialised to 0.
    pub bs: Option<Tensor>,
    pub num_groups: i64,
    pub num_channels: i64,
}

impl GroupNorm {
    pub fn new<'a, T: Borrow<nn::Path<'a>>>(
        vs: T,
        num_groups: i64,
        num_channels: i64,
        config: GroupNormConfig,
    ) -> Result<Self> {
        check_grouping(num_groups, num_channels)?;
        check_eps(config.eps)?;

        let vs = vs.borrow();
        let (ws, bs) = if config.affine {
            let ws = vs.var("weight", &[num_channels], nn::Init::Const(1.));
            let bs = vs.var("bias", &[num_channels], nn::Init::Const(0.));
            (Some(ws), Some(bs))
        } else {
            (None, None)
        };

        Ok(Self {
            config,
            ws,
            bs,
            num_groups,
            num_channels,
        })
    }

    pub fn eps(&self) -> f64 {
        self.config.eps
    }

    /// Forward pass that checks the input layout first.
    pub fn f_forward(&self, xs: &Tensor) -> Result<Tensor> {
        let size = xs.size();
        if size.len() < 2 {
            return Err(ExperimentError::Shape(format!(
                "group norm expects at least (batch, channels), got {:?}",
                size
            )));
        }
        if size[1] != self.num_channels {
            return Err(ExperimentError::Shape(format!(
                "group norm configured for {} channels, got input {:?}",
                self.num_channels, size
            )));
        }
        Ok(self.apply_affine(normalize_groups(xs, self.num_groups, self.config.eps)))
    }

    fn apply_affine(&self, normalized: Tensor) -> Tensor {
        // (C,) viewed as (1, C, 1, ...) to broadcast over batch and trailing dims
        let mut shape = vec![1i64; normalized.dim()];
        shape[1] = self.num_channels;

        let scaled = match &self.ws {
            Some(ws) => normalized * ws.reshape(&shape),
            None => normalized,
        };
        match &self.bs {
            Some(bs) => scaled + bs.reshape(&shape),
            None => scaled,
        }
    }
}

impl nn::Module for GroupNorm {
    fn forward(&self, xs: &Tensor) -> Tensor {
        self.apply_affine(normalize_groups(xs, self.num_groups, self.config.eps))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tch::{kind::FLOAT_CPU, nn::Module, Device, Kind};

    use super::*;

    /// Largest absolute deviation from 0 of the per-group mean and from 1 of
    /// the per-group variance.
    fn group_stats_error(ys: &Tensor, groups: i64) -> (f64, f64) {
        let n = ys.size()[0];
        let grouped = ys.reshape(&[n, groups, -1]);
        let mean = grouped.mean_dim(&[-1i64][..], false, Kind::Float);
        let var = grouped.var_dim(&[-1i64][..], false, false);
        let mean_err = mean.abs().max().double_value(&[]);
        let var_err = (var - 1.0).abs().max().double_value(&[]);
        (mean_err, var_err)
    }

    #[test]
    fn test_output_shape_matches_input() {
        let vs = nn::VarStore::new(Device::Cpu);
        let gn = GroupNorm::new(vs.root() / "gn", 16, 64, Default::default()).unwrap();

        let xs = Tensor::randn(&[2, 64, 8, 8], FLOAT_CPU) * 3.0 + 7.0;
        let ys = gn.forward(&xs);

        assert_eq!(ys.size(), vec![2, 64, 8, 8]);
    }

    #[test]
    fn test_groups_have_zero_mean_unit_variance() {
        let xs = Tensor::randn(&[2, 64, 8, 8], FLOAT_CPU) * 3.0 + 7.0;
        let ys = group_norm(&xs, 16, 1e-5).unwrap();

        let (mean_err, var_err) = group_stats_error(&ys, 16);
        assert!(mean_err < 1e-4, "group mean off by {}", mean_err);
        assert!(var_err < 1e-3, "group variance off by {}", var_err);
    }

    #[test]
    fn test_samples_are_normalized_independently() {
        // second sample scaled by 100: a batch statistic would leak into the first
        let a = Tensor::randn(&[1, 8, 4, 4], FLOAT_CPU);
        let b = Tensor::randn(&[1, 8, 4, 4], FLOAT_CPU) * 100.0;
        let batch = Tensor::cat(&[&a, &b], 0);

        let alone = group_norm(&a, 2, 1e-5).unwrap();
        let batched = group_norm(&batch, 2, 1e-5).unwrap().narrow(0, 0, 1);

        assert!(alone.allclose(&batched, 1e-5, 1e-5, false));
    }

    #[test]
    fn test_matches_libtorch_group_norm() {
        let vs = nn::VarStore::new(Device::Cpu);
        let gn = GroupNorm::new(vs.root() / "gn", 4, 12, Default::default()).unwrap();
        tch::no_grad(|| {
            let _ = gn.ws.as_ref().unwrap().shallow_clone().uniform_(0.5, 1.5);
            let _ = gn.bs.as_ref().unwrap().shallow_clone().uniform_(-0.5, 0.5);
        });

        let xs = Tensor::randn(&[3, 12, 5, 5], FLOAT_CPU);
        let ours = gn.forward(&xs);
        let reference =
            Tensor::group_norm(&xs, 4, gn.ws.as_ref(), gn.bs.as_ref(), gn.eps(), false);

        assert!(ours.allclose(&reference, 1e-4, 1e-5, false));
    }

    #[test]
    fn test_affine_parameters_initialised() {
        let vs = nn::VarStore::new(Device::Cpu);
        let gn = GroupNorm::new(vs.root() / "gn", 4, 16, Default::default()).unwrap();

        let ws = gn.ws.as_ref().unwrap();
        let bs = gn.bs.as_ref().unwrap();
        assert_eq!(ws.size(), vec![16]);
        assert_eq!(ws.min().double_value(&[]), 1.0);
        assert_eq!(ws.max().double_value(&[]), 1.0);
        assert_eq!(bs.abs().max().double_value(&[]), 0.0);

        let names: Vec<String> = vs.variables().into_keys().collect();
        assert!(names.contains(&"gn.weight".to_string()));
        assert!(names.contains(&"gn.bias".to_string()));
    }

    #[test]
    fn test_non_affine_has_no_parameters() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = GroupNormConfig {
            affine: false,
            ..Default::default()
        };
        let gn = GroupNorm::new(vs.root() / "gn", 2, 8, config).unwrap();

        assert!(gn.ws.is_none() && gn.bs.is_none());
        assert!(vs.variables().is_empty());
    }

    #[test]
    fn test_indivisible_channels_rejected() {
        let vs = nn::VarStore::new(Device::Cpu);
        let result = GroupNorm::new(vs.root() / "gn", 16, 60, Default::default());
        assert_matches!(result, Err(ExperimentError::Config(_)));

        let xs = Tensor::randn(&[2, 60, 4, 4], FLOAT_CPU);
        assert_matches!(group_norm(&xs, 16, 1e-5), Err(ExperimentError::Config(_)));
    }

    #[test]
    fn test_bad_groups_and_eps_rejected() {
        let vs = nn::VarStore::new(Device::Cpu);
        assert_matches!(
            GroupNorm::new(vs.root() / "zero", 0, 8, Default::default()),
            Err(ExperimentError::Config(_))
        );

        let config = GroupNormConfig {
            eps: 0.0,
            ..Default::default()
        };
        assert_matches!(
            GroupNorm::new(vs.root() / "eps", 2, 8, config),
            Err(ExperimentError::Config(_))
        );

        let xs = Tensor::randn(&[2, 8, 3, 3], FLOAT_CPU);
        for eps in [0.0, -1e-5, f64::NAN, f64::INFINITY] {
            assert_matches!(group_norm(&xs, 2, eps), Err(ExperimentError::Config(_)));
        }
    }

    #[test]
    fn test_validated_forward_rejects_wrong_layout() {
        let vs = nn::VarStore::new(Device::Cpu);
        let gn = GroupNorm::new(vs.root() / "gn", 4, 16, Default::default()).unwrap();

        let wrong_channels = Tensor::randn(&[2, 8, 4, 4], FLOAT_CPU);
        assert_matches!(gn.f_forward(&wrong_channels), Err(ExperimentError::Shape(_)));

        let flat = Tensor::randn(&[16], FLOAT_CPU);
        assert_matches!(gn.f_forward(&flat), Err(ExperimentError::Shape(_)));

        let ok = Tensor::randn(&[2, 16, 4, 4], FLOAT_CPU);
        assert_eq!(gn.f_forward(&ok).unwrap().size(), vec![2, 16, 4, 4]);
    }

    #[test]
    fn test_accepts_any_trailing_dims() {
        let xs = Tensor::randn(&[4, 6, 10], FLOAT_CPU);
        let ys = group_norm(&xs, 3, 1e-5).unwrap();
        assert_eq!(ys.size(), vec![4, 6, 10]);

        let (mean_err, _) = group_stats_error(&ys, 3);
        assert!(mean_err < 1e-4);
    }

    #[test]
    fn test_constant_group_stays_finite() {
        let xs = Tensor::ones(&[2, 8, 3, 3], FLOAT_CPU) * 5.0;
        let ys = group_norm(&xs, 4, 1e-5).unwrap();

        assert!(ys.isfinite().all().double_value(&[]) > 0.0);
        assert!(ys.abs().max().double_value(&[]) < 1e-6);
    }

    #[test]
    fn test_gradients_are_finite() {
        let vs = nn::VarStore::new(Device::Cpu);
        let gn = GroupNorm::new(vs.root() / "gn", 4, 8, Default::default()).unwrap();

        let xs = Tensor::randn(&[2, 8, 4, 4], FLOAT_CPU).set_requires_grad(true);
        let weights = Tensor::randn(&[2, 8, 4, 4], FLOAT_CPU);
        let loss = (gn.forward(&xs) * weights).sum(Kind::Float);
        loss.backward();

        for grad in [
            xs.grad(),
            gn.ws.as_ref().unwrap().grad(),
            gn.bs.as_ref().unwrap().grad(),
        ] {
            assert!(grad.defined());
            assert!(grad.isfinite().all().double_value(&[]) > 0.0);
            assert!(grad.abs().sum(Kind::Float).double_value(&[]) > 0.0);
        }
    }

    #[test]
    fn test_renormalizing_is_near_identity() {
        let xs = Tensor::randn(&[2, 16, 6, 6], FLOAT_CPU) * 4.0 - 2.0;
        let once = group_norm(&xs, 4, 1e-10).unwrap();
        let twice = group_norm(&once, 4, 1e-10).unwrap();

        assert!(once.allclose(&twice, 1e-4, 1e-4, false));
    }
}
