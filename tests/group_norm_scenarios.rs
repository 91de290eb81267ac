use assert_matches::assert_matches;
use group_norm_cifar10::{group_norm, ExperimentError, GroupNorm, GroupNormVgg, ModelConfig};
use tch::{kind::FLOAT_CPU, nn, nn::Module, nn::ModuleT, Device, Kind, Tensor};

#[test]
fn sixty_four_channels_in_sixteen_groups() {
    let vs = nn::VarStore::new(Device::Cpu);
    let gn = GroupNorm::new(vs.root() / "gn", 16, 64, Default::default()).unwrap();

    let xs = Tensor::randn(&[2, 64, 8, 8], FLOAT_CPU) * 5.0 + 2.0;
    assert_eq!(gn.forward(&xs).size(), vec![2, 64, 8, 8]);

    // each group covers 4 channels × 8 × 8 positions
    let normalized = group_norm(&xs, 16, 1e-5).unwrap().reshape(&[2, 16, 4 * 8 * 8]);
    let mean = normalized.mean_dim(&[-1i64][..], false, Kind::Float);
    let var = normalized.var_dim(&[-1i64][..], false, false);
    assert!(mean.abs().max().double_value(&[]) < 1e-4);
    assert!((var - 1.0).abs().max().double_value(&[]) < 1e-3);
}

#[test]
fn batch_of_one_is_supported() {
    let xs = Tensor::randn(&[1, 32, 4, 4], FLOAT_CPU);
    let ys = group_norm(&xs, 8, 1e-5).unwrap();
    assert_eq!(ys.size(), vec![1, 32, 4, 4]);
    assert!(ys.isfinite().all().double_value(&[]) > 0.0);
}

#[test]
fn indivisible_groups_are_a_config_error() {
    let vs = nn::VarStore::new(Device::Cpu);
    assert_matches!(
        GroupNorm::new(vs.root() / "gn", 16, 100, Default::default()),
        Err(ExperimentError::Config(_))
    );

    let config = ModelConfig {
        groups: 48,
        ..Default::default()
    };
    assert_matches!(
        GroupNormVgg::new(&vs.root(), config),
        Err(ExperimentError::Config(_))
    );
}

#[test]
fn model_gradients_reach_every_group_norm() {
    let vs = nn::VarStore::new(Device::Cpu);
    let config = ModelConfig {
        image_size: 8,
        stages: vec![vec![8], vec![16]],
        groups: 4,
        ..Default::default()
    };
    let model = GroupNormVgg::new(&vs.root(), config).unwrap();

    let images = Tensor::randn(&[4, 3, 8, 8], FLOAT_CPU);
    let labels = Tensor::from_slice(&[0i64, 3, 7, 9]);
    let loss = model.forward_t(&images, true).cross_entropy_for_logits(&labels);
    loss.backward();

    let norms: Vec<_> = vs
        .variables()
        .into_iter()
        .filter(|(name, _)| name.contains(".norm."))
        .collect();
    assert_eq!(norms.len(), 4);
    for (name, var) in norms {
        let grad = var.grad();
        assert!(grad.defined(), "{} has no gradient", name);
        assert!(grad.isfinite().all().double_value(&[]) > 0.0, "{} gradient not finite", name);
    }
}
