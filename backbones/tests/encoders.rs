//! Shape and error checks for the matting encoders.

use burn::{
    backend::{Autodiff, NdArray},
    module::AutodiffModule,
    nn::BatchNorm,
    prelude::*,
    tensor::{BasicOps, Distribution, ElementConversion},
};
use matting_backbones::{
    build_encoder, is_training, Encoder, EncoderError, EncoderWrapper, NormLayers, Pretrained,
    ResNetEncConfig, Vgg16Config,
};
use serde_json::json;

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<TestBackend>;

const VGG_MID_SHAPES: [[usize; 4]; 5] = [
    [2, 64, 32, 32],
    [2, 128, 16, 16],
    [2, 256, 8, 8],
    [2, 512, 4, 4],
    [2, 512, 2, 2],
];

/// Whether a batch norm has updated its running statistics.
fn running_stats_moved<B: Backend>(bn: &BatchNorm<B, 2>) -> bool {
    let mean: f32 = bn.running_mean.value_sync().abs().sum().into_scalar().elem();
    let var: f32 = bn
        .running_var
        .value_sync()
        .sub_scalar(1.0)
        .abs()
        .sum()
        .into_scalar()
        .elem();
    mean > 0.0 || var > 0.0
}

/// Checks that every norm layer ran in `train_state` during the last forward pass.
fn check_norm_state<B: Backend>(norms: &[&BatchNorm<B, 2>], train_state: bool) -> bool {
    norms
        .iter()
        .all(|bn| running_stats_moved(bn) == train_state)
}

fn assert_tensor_with_shape<B, const D: usize, K>(tensor: &Tensor<B, D, K>, shape: [usize; D])
where
    B: Backend,
    K: BasicOps<B>,
{
    assert_eq!(tensor.dims(), shape);
}

fn assert_mid_feat_shape<B: Backend>(mid_feat: &[Tensor<B, 4>], target_shape: &[[usize; 4]; 5]) {
    assert_eq!(mid_feat.len(), 5);
    for (feat, shape) in mid_feat.iter().zip(target_shape) {
        assert_tensor_with_shape(feat, *shape);
    }
}

/// Uniform `[0, 1)` input, image and trimap stacked on the channel axis.
fn demo_inputs<B: Backend>(input_shape: [usize; 4], device: &Device<B>) -> Tensor<B, 4> {
    Tensor::random(input_shape, Distribution::Default, device)
}

fn check_vgg16<B: Backend>(device: &Device<B>) {
    let model = Vgg16Config::new()
        .init::<B>(device)
        .unwrap()
        .init_weights(Pretrained::Default, device)
        .unwrap();
    let output = model.forward(demo_inputs([2, 4, 64, 64], device));
    assert_tensor_with_shape(&output.out, [2, 512, 2, 2]);
    assert_mid_feat_shape(&output.features, &VGG_MID_SHAPES);

    let model = Vgg16Config::new()
        .with_batch_norm(true)
        .init::<B>(device)
        .unwrap()
        .init_weights(Pretrained::Default, device)
        .unwrap();
    let output = model.forward(demo_inputs([2, 4, 64, 64], device));
    assert_tensor_with_shape(&output.out, [2, 512, 2, 2]);
    assert_mid_feat_shape(&output.features, &VGG_MID_SHAPES);

    let model = Vgg16Config::new()
        .with_aspp(true)
        .with_dilations(vec![6, 12, 18])
        .init::<B>(device)
        .unwrap()
        .init_weights(Pretrained::Default, device)
        .unwrap();
    let output = model.forward(demo_inputs([2, 4, 64, 64], device));
    assert_tensor_with_shape(&output.out, [2, 256, 2, 2]);
    assert_mid_feat_shape(&output.features, &VGG_MID_SHAPES);
}

fn check_resnet_encoder<B: Backend>(device: &Device<B>) {
    let model = ResNetEncConfig::new("BasicBlock".to_string(), vec![3, 4, 4, 2], 4)
        .init::<B>(device)
        .unwrap()
        .init_weights(Pretrained::Default, device)
        .unwrap();
    // trimap has 1 channel
    let feat = model.forward(demo_inputs([2, 4, 64, 64], device));
    assert_tensor_with_shape(&feat, [2, 512, 2, 2]);

    let model = ResNetEncConfig::new("BasicBlock".to_string(), vec![3, 4, 4, 2], 6)
        .with_late_downsample(true)
        .init::<B>(device)
        .unwrap()
        .init_weights(Pretrained::Default, device)
        .unwrap();
    // both image and trimap have 3 channels
    let feat = model.forward(demo_inputs([2, 6, 64, 64], device));
    assert_tensor_with_shape(&feat, [2, 512, 2, 2]);
}

#[test]
fn test_vgg16_encoder() {
    check_vgg16::<TestBackend>(&Default::default());
}

#[test]
fn vgg16_max_indices_match_features() {
    let device = Default::default();
    let model = Vgg16Config::new()
        .with_batch_norm(true)
        .init::<TestBackend>(&device)
        .unwrap();

    let output = model.forward(demo_inputs([2, 4, 64, 64], &device));
    assert_eq!(output.max_indices.len(), 5);
    for (indices, shape) in output.max_indices.iter().zip(&VGG_MID_SHAPES) {
        assert_tensor_with_shape(indices, *shape);
    }
}

#[test]
fn vgg16_norm_layers_train_under_autodiff() {
    let device = Default::default();
    assert!(is_training::<TestAutodiffBackend>());

    let model = Vgg16Config::new()
        .with_aspp(true)
        .with_dilations(vec![6, 12, 18])
        .init::<TestAutodiffBackend>(&device)
        .unwrap()
        .init_weights(Pretrained::Default, &device)
        .unwrap();
    let output = model.forward(demo_inputs([2, 4, 64, 64], &device));
    assert_tensor_with_shape(&output.out, [2, 256, 2, 2]);

    let norms = model.norm_layers();
    assert!(!norms.is_empty());
    assert!(check_norm_state(&norms, true));
}

#[test]
fn vgg16_bn_norm_layers_train_under_autodiff() {
    let device = Default::default();
    let model = Vgg16Config::new()
        .with_batch_norm(true)
        .init::<TestAutodiffBackend>(&device)
        .unwrap()
        .init_weights(Pretrained::Default, &device)
        .unwrap();
    let output = model.forward(demo_inputs([2, 4, 64, 64], &device));
    assert_tensor_with_shape(&output.out, [2, 512, 2, 2]);
    assert_mid_feat_shape(&output.features, &VGG_MID_SHAPES);

    let norms = model.norm_layers();
    // 13 stage convs plus conv6
    assert_eq!(norms.len(), 14);
    assert!(check_norm_state(&norms, true));
}

#[test]
fn vgg16_bn_valid_copy_keeps_running_stats() {
    let device = Default::default();
    let model = Vgg16Config::new()
        .with_batch_norm(true)
        .init::<TestAutodiffBackend>(&device)
        .unwrap()
        .valid();
    assert!(!is_training::<TestBackend>());

    let output = model.forward(demo_inputs([2, 4, 64, 64], &device));
    assert_tensor_with_shape(&output.out, [2, 512, 2, 2]);
    assert!(check_norm_state(&model.norm_layers(), false));
}

#[test]
fn test_resnet_encoder() {
    let device = Default::default();

    let result = ResNetEncConfig::new("UnknownBlock".to_string(), vec![3, 4, 4, 2], 3)
        .init::<TestBackend>(&device);
    assert!(matches!(result, Err(EncoderError::NotImplemented { .. })));

    let result = build_encoder::<TestBackend>(
        &json!({
            "type": "ResNetEnc",
            "block": "BasicBlock",
            "layers": [3, 4, 4, 2],
            "in_channels": 3,
            "late_downsample": false,
            "pretrained": []
        }),
        &device,
    );
    match result {
        Err(EncoderError::TypeMismatch { received }) => assert_eq!(received, "list"),
        _ => panic!("Expected TypeMismatch error"),
    }

    check_resnet_encoder::<TestBackend>(&device);
}

#[test]
fn resnet_encoder_norm_layers_train_under_autodiff() {
    let device = Default::default();
    let model = ResNetEncConfig::new("BasicBlock".to_string(), vec![1, 1, 1, 1], 4)
        .init::<TestAutodiffBackend>(&device)
        .unwrap();

    let feat = model.forward(demo_inputs([2, 4, 64, 64], &device));
    assert_tensor_with_shape(&feat, [2, 512, 2, 2]);
    assert!(check_norm_state(&model.norm_layers(), true));
}

#[test]
fn unknown_block_through_builder() {
    let device = Default::default();
    let result = build_encoder::<TestBackend>(
        &json!({
            "type": "ResNetEnc",
            "block": "UnknownBlock",
            "layers": [3, 4, 4, 2],
            "in_channels": 3,
            "late_downsample": false
        }),
        &device,
    );

    match result {
        Err(err @ EncoderError::NotImplemented { .. }) => {
            assert_eq!(err.to_string(), "UnknownBlock is not implemented.");
        }
        _ => panic!("Expected NotImplemented error"),
    }
}

#[test]
fn missing_checkpoint_is_a_weight_loading_error() {
    let device = Default::default();
    let result = build_encoder::<TestBackend>(
        &json!({
            "type": "VGG16",
            "in_channels": 4,
            "batch_norm": false,
            "aspp": false,
            "dilations": [12, 24, 36],
            "pretrained": "missing/vgg16.mpk"
        }),
        &device,
    );
    assert!(matches!(result, Err(EncoderError::WeightLoading { .. })));
}

#[test]
fn built_encoders_share_output_contract() {
    let device = Default::default();
    let descriptions = [
        json!({
            "type": "VGG16",
            "in_channels": 4,
            "batch_norm": false,
            "aspp": false,
            "dilations": [12, 24, 36]
        }),
        json!({
            "type": "ResNetEnc",
            "block": "BasicBlock",
            "layers": [1, 1, 1, 1],
            "in_channels": 4,
            "late_downsample": true
        }),
        json!({
            "type": "ResShortcutEnc",
            "block": "BasicBlock",
            "layers": [1, 1, 1, 1],
            "in_channels": 4,
            "late_downsample": false
        }),
    ];

    for description in &descriptions {
        let encoder = build_encoder::<TestBackend>(description, &device).unwrap();
        let output = encoder.encode(demo_inputs([2, 4, 64, 64], &device));
        assert_tensor_with_shape(&output.out, [2, encoder.out_channels(), 2, 2]);
        let expected_indices = match encoder {
            EncoderWrapper::Vgg16(_) => 5,
            _ => 0,
        };
        assert_eq!(output.max_indices.len(), expected_indices);
    }
}

#[cfg(feature = "wgpu")]
mod gpu {
    use burn::backend::Wgpu;

    use super::*;

    #[test]
    fn test_vgg16_encoder_gpu() {
        check_vgg16::<Wgpu>(&Default::default());
    }

    #[test]
    fn test_resnet_encoder_gpu() {
        check_resnet_encoder::<Wgpu>(&Default::default());
    }
}
