use std::error::Error;
use std::time::Instant;

use clap::Parser;
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use se3_layers::layers::{
    Layer, NTfm3DInput, NTfm3DLayer, PoseDecoder, TransitionInput, TransitionLayer,
};
use se3_layers::loss::{Reduction, motion_normalized_loss_3d, pose_consistency_loss};
use se3_layers::mask::{MaskDecoder, MaskMode, SharpeningSchedule, TrainingClock};
use se3_layers::points::{BlendMode, CameraIntrinsics, PivotSource, depth_to_points, ntfm3d};
use se3_layers::transform::{CompositionOrder, DeltaFrame, TransitionOutput};
use se3_layers::{
    ImageBatch, Mask, ParamBatch, PixelMap, PoseModelConfig, RotationKind, Rt, TransformBatch,
    init_logger_with_level,
};
use tracing::{Level, debug, info};

#[derive(Parser)]
#[command(name = "synthetic_pass")]
#[command(about = "Run one forward/backward pass of the SE(3) pipeline on synthetic data")]
struct Args {
    /// Number of examples in the batch
    #[arg(short, long, default_value = "4")]
    batch_size: usize,

    /// Number of rigid bodies
    #[arg(short = 'k', long, default_value = "8")]
    num_bodies: usize,

    /// Image height in pixels
    #[arg(long, default_value = "120")]
    height: usize,

    /// Image width in pixels
    #[arg(long, default_value = "160")]
    width: usize,

    /// Rotation parameterization: "se3aa", "se3euler", "se3quat", "se3spquat" or "affine"
    #[arg(short, long, default_value = "se3aa")]
    rotation: String,

    /// Motion parameters carry a pivot
    #[arg(long)]
    pivot: bool,

    /// Accumulate the bodies along a kinematic chain
    #[arg(long)]
    kinematic_chain: bool,

    /// Fold the kinematic chain right to left
    #[arg(long)]
    right_to_left: bool,

    /// Mask decoder: "softmax", "sigmoid" or "wt_sharpening"
    #[arg(short, long, default_value = "wt_sharpening")]
    mask: String,

    /// Blend mode of the point transform: "ntfm3d" or "ntfm3ddelta"
    #[arg(long, default_value = "ntfm3d")]
    blend: String,

    /// Frame of the transition deltas: "global" or "local"
    #[arg(long, default_value = "global")]
    delta_frame: String,

    /// Pivots for the deltas: "ptmean", "maskmean", "maskmeannograd" or "posecenter"
    #[arg(long)]
    pivot_source: Option<String>,

    /// Point loss: "mse", "abs", "normmsesqrt" or "normmsesqrtpt"
    #[arg(short, long, default_value = "mse")]
    loss: String,

    /// Training iteration driving the sharpening schedule
    #[arg(long, default_value = "1000")]
    iteration: u64,

    /// Random seed for the synthetic scene
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn random_params(
    rng: &mut StdRng,
    batch: usize,
    bodies: usize,
    width: usize,
    scale: f64,
) -> ParamBatch {
    ParamBatch::from_fn(batch, bodies, |_, _| {
        DVector::from_fn(width, |_, _| scale * rng.random_range(-1.0..1.0))
    })
}

fn gradient_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logger_with_level(if args.verbose { Level::DEBUG } else { Level::INFO });

    let mut config = PoseModelConfig::new()
        .with_num_bodies(args.num_bodies)
        .with_rotation(args.rotation.parse::<RotationKind>()?)
        .with_pivot(args.pivot)
        .with_mask_mode(args.mask.parse::<MaskMode>()?)
        .with_blend_mode(args.blend.parse::<BlendMode>()?)
        .with_loss_type(args.loss.parse()?)
        .with_sharpening(SharpeningSchedule::default())
        .with_delta_frame(args.delta_frame.parse::<DeltaFrame>()?);
    if let Some(source) = &args.pivot_source {
        config = config.with_pivot_source(source.parse::<PivotSource>()?);
    }
    if args.kinematic_chain {
        config =
            config.with_kinematic_chain(CompositionOrder::from_right_to_left(args.right_to_left));
    }
    config.validate()?;
    info!(
        "synthetic pass: batch={} bodies={} image={}x{} rotation={} mask={}",
        args.batch_size, args.num_bodies, args.height, args.width, config.rotation, config.mask_mode
    );

    let mut rng = StdRng::seed_from_u64(args.seed);
    let (b, k, h, w) = (args.batch_size, args.num_bodies, args.height, args.width);
    let width = config.param_width();

    // Scene: a tilted plane seen by a pinhole camera.
    let intrinsics = CameraIntrinsics::new(w as f64, w as f64, w as f64 / 2.0, h as f64 / 2.0);
    let depth = PixelMap::from_fn(b, 1, h, w, |_, _, pix| {
        1.0 + 0.5 * (pix % w) as f64 / w as f64 + 0.01 * rng.random_range(-1.0..1.0)
    });
    let points = depth_to_points(&depth, &intrinsics)?;

    let start = Instant::now();

    // Forward.
    let mut pose_decoder = PoseDecoder::from_config(&config)?;
    let poses = pose_decoder.forward(random_params(&mut rng, b, k, width, 0.1))?;
    let mut delta_decoder = PoseDecoder::from_config(&config)?;
    let deltas = delta_decoder.forward(random_params(&mut rng, b, k, width, 0.05))?;

    let mask_decoder = MaskDecoder::from_config(&config);
    let clock = TrainingClock::resume(args.iteration);
    let logits: Mask = ImageBatch::from_fn(b, k, h, w, |_, _, _| rng.random_range(-3.0..3.0));
    let decoded = mask_decoder.decode(&logits, &clock, true, &mut rng)?;

    let mut transition = TransitionLayer::from_config(&config);
    let next = transition.forward(TransitionInput {
        poses,
        deltas,
        points: Some(points.clone()),
        masks: Some(decoded.masks.clone()),
    })?;

    let mut transform_layer = NTfm3DLayer::new(config.blend_mode);
    let predicted = transform_layer.forward(NTfm3DInput {
        points: points.clone(),
        masks: decoded.masks.clone(),
        transforms: next.next_pose.clone(),
    })?;

    // Ground truth from a separate set of motions.
    let mut truth_decoder = PoseDecoder::from_config(&config)?;
    let true_poses = truth_decoder.forward(random_params(&mut rng, b, k, width, 0.1))?;
    let target = ntfm3d(&points, &decoded.masks, &true_poses, config.blend_mode)?;
    let mut motion = target.clone();
    for (m, p) in motion.data_mut().iter_mut().zip(points.data()) {
        *m -= p;
    }

    let point_loss = motion_normalized_loss_3d(
        &predicted,
        &target,
        &motion,
        None,
        config.loss_type,
        &config.motion_normalization,
    )?;
    let pose_loss = pose_consistency_loss(&next.next_pose, &true_poses, Reduction::Mean)?;
    info!(
        "{} loss = {:.6e}, pose consistency = {:.6e}",
        config.loss_type, point_loss.value, pose_loss.value
    );

    // Backward.
    let transform_grads = transform_layer.backward(&point_loss.grad_input)?;
    let mut grad_poses = transform_grads.transforms.clone();
    for (g, extra) in grad_poses.items_mut().iter_mut().zip(pose_loss.grad_input.iter()) {
        *g += extra;
    }
    let transition_grads = transition.backward(&TransitionOutput {
        next_pose: grad_poses,
        delta_global: TransformBatch::from_fn(b, k, |_, _| Rt::zeros()),
    })?;
    let grad_params = pose_decoder.backward(&transition_grads.poses)?;
    let grad_delta_params = delta_decoder.backward(&transition_grads.deltas)?;

    let mut grad_masks = transform_grads.masks;
    if let Some(extra) = &transition_grads.masks {
        for (g, e) in grad_masks.data_mut().iter_mut().zip(extra.data()) {
            *g += e;
        }
    }
    let grad_logits = mask_decoder.backward(&logits, &decoded, &grad_masks)?;
    let elapsed = start.elapsed();

    let param_values: Vec<f64> = grad_params
        .iter()
        .chain(grad_delta_params.iter())
        .flat_map(|p| p.iter().copied())
        .collect();
    let param_norm = gradient_norm(&param_values);
    let logit_norm = gradient_norm(grad_logits.data());
    debug!(
        "gradient sizes: {} parameters, {} logits",
        param_values.len(),
        grad_logits.len()
    );
    info!(
        "|dL/dparams| = {:.6e}, |dL/dlogits| = {:.6e}, elapsed {:.2} ms",
        param_norm,
        logit_norm,
        elapsed.as_secs_f64() * 1000.0
    );

    if !(param_norm.is_finite() && logit_norm.is_finite()) {
        return Err("non-finite gradients in synthetic pass".into());
    }
    Ok(())
}
