//! Rigid transform assembly and algebra.
//!
//! - [`assemble`]: motion parameters → `[R | t]` / `[R | t | p]`
//! - [`algebra`]: inverse, pairwise composition, kinematic chains
//! - [`pivot`]: rotation about a pivot, collapsed into the translation
//! - [`transition`]: applying a delta in the global or body frame

pub mod algebra;
pub mod assemble;
pub mod pivot;
pub mod transition;

pub use algebra::{
    CompositionOrder, compose_chain, compose_chain_backward, compose_pair_batch,
    compose_pair_batch_backward, compose_rt_pair, compose_rt_pair_backward, inverse_batch,
    inverse_batch_backward, rt_inverse, rt_inverse_backward,
};
pub use assemble::{AssembledTransforms, Se3ToRt};
pub use pivot::{attach_pivots, attach_pivots_backward, collapse_rt_pivots, collapse_rt_pivots_backward};
pub use transition::{DeltaFrame, TransitionOutput, apply_delta, apply_delta_backward};
