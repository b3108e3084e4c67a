use kiln_dtype::DType;

use crate::error::Error;
use crate::planner::{self, AliasRejection, PlanOptions, SlotRole};
use crate::signature::{AliasRule, BufferRequest, Dim, SignatureDescriptor, SizeExpr, TensorSpec};
use crate::test::helpers::*;
use crate::validator::BoundDims;

fn bound(pairs: &[(&str, usize)]) -> BoundDims {
    pairs.iter().map(|&(name, v)| (name, v)).collect()
}

#[test]
fn test_static_outputs_get_own_slots() {
    let plan = planner::layout(&conv_block_descriptor(), &BoundDims::new(), PlanOptions::default()).unwrap();

    assert_eq!(plan.slots().len(), 1);
    assert_eq!(plan.slots()[0].size, 16 * 112 * 112 * 4);
    assert_eq!(plan.slots()[0].role, SlotRole::Output(0));
    assert_eq!(plan.output_shape(0), [1, 16, 112, 112]);
    assert!(plan.dims().is_empty());
    assert_eq!(plan.peak_bytes(), plan.unaliased_bytes());
}

#[test]
fn test_symbolic_output_resolved() {
    let descriptor = SignatureDescriptor::new(
        vec![TensorSpec::new(DType::Float32, [Dim::symbol("b"), Dim::symbol("k")])],
        vec![TensorSpec::new(DType::Float64, [Dim::symbol("k"), Dim::Fixed(2), Dim::symbol("b")])],
    );

    let plan = planner::layout(&descriptor, &bound(&[("b", 3), ("k", 5)]), PlanOptions::default()).unwrap();
    assert_eq!(plan.output_shape(0), [5, 2, 3]);
    assert_eq!(plan.slots()[0].size, 5 * 2 * 3 * 8);
    assert_eq!(plan.slots()[0].alignment, 8);
    assert_eq!(plan.dims(), [3, 5]);
}

#[test]
fn test_unbound_output_symbol() {
    let descriptor = SignatureDescriptor::new(
        vec![TensorSpec::new(DType::Float32, [Dim::symbol("n")])],
        vec![TensorSpec::new(DType::Float32, [Dim::symbol("m")])],
    );

    let err = planner::layout(&descriptor, &bound(&[("n", 4)]), PlanOptions::default()).unwrap_err();
    match err {
        Error::UnresolvedShape { buffer, symbol } => {
            assert_eq!(buffer, "output 0");
            assert_eq!(symbol, "m");
        }
        other => panic!("expected UnresolvedShape, got {other}"),
    }
}

#[test]
fn test_unbound_scratch_symbol() {
    let descriptor = SignatureDescriptor::new(vec![], vec![])
        .with_scratch(BufferRequest::new("workspace", SizeExpr::scaled(16, ["tiles"])));

    let err = planner::layout(&descriptor, &BoundDims::new(), PlanOptions::default()).unwrap_err();
    assert!(matches!(err, Error::UnresolvedShape { ref buffer, .. } if buffer == "workspace"), "got {err}");
}

#[test]
fn test_scaled_scratch_overflow() {
    let descriptor = SignatureDescriptor::new(vec![], vec![])
        .with_scratch(BufferRequest::new("huge", SizeExpr::scaled(usize::MAX, ["n"])));

    let err = planner::layout(&descriptor, &bound(&[("n", 2)]), PlanOptions::default()).unwrap_err();
    assert!(matches!(err, Error::InvalidDescriptor { .. }), "got {err}");
}

#[test]
fn test_alias_shares_scratch_slot() {
    let plan = planner::layout(&staged_descriptor(), &bound(&[("n", 16)]), PlanOptions::default()).unwrap();

    assert_eq!(plan.slots().len(), 1);
    assert_eq!(plan.output_slot(0), plan.scratch_slot(0));
    assert_eq!(plan.slots()[0].role, SlotRole::Shared { scratch: 0, output: 0 });
    assert_eq!(plan.aliases().len(), 1);
    assert!(plan.rejected().is_empty());
    assert_eq!(plan.peak_bytes(), 64);
    assert_eq!(plan.unaliased_bytes(), 128);
}

#[test]
fn test_alias_falls_back_when_scratch_too_small() {
    let vector = TensorSpec::new(DType::Float32, [Dim::symbol("n")]);
    let descriptor = SignatureDescriptor::new(vec![vector.clone()], vec![vector])
        .with_scratch(BufferRequest::new("staging", 32usize).aliasable(0))
        .with_alias(0, 0, 1);

    let plan = planner::layout(&descriptor, &bound(&[("n", 16)]), PlanOptions::default()).unwrap();
    assert_eq!(plan.slots().len(), 2);
    assert_ne!(plan.output_slot(0), plan.scratch_slot(0));
    assert_eq!(plan.rejected()[0].reason, AliasRejection::TooSmall { scratch_size: 32, output_size: 64 });
    assert_eq!(plan.peak_bytes(), plan.unaliased_bytes());
}

#[test]
fn test_alias_falls_back_when_misaligned() {
    let output = TensorSpec::new(DType::Float32, [4usize]).with_alignment(128);
    let descriptor = SignatureDescriptor::new(vec![], vec![output])
        .with_scratch(BufferRequest::new("staging", 16usize).aliasable(0))
        .with_alias(0, 0, 1);

    let plan = planner::layout(&descriptor, &BoundDims::new(), PlanOptions::default()).unwrap();
    assert!(plan.aliases().is_empty());
    assert_eq!(
        plan.rejected()[0].reason,
        AliasRejection::Misaligned { scratch_alignment: 64, output_alignment: 128 }
    );
    assert_eq!(plan.slots()[plan.output_slot(0)].alignment, 128);
}

#[test]
fn test_aliasing_disabled() {
    let options = PlanOptions { enable_aliasing: false };
    let plan = planner::layout(&staged_descriptor(), &bound(&[("n", 16)]), options).unwrap();

    assert_eq!(plan.slots().len(), 2);
    assert_eq!(plan.rejected()[0].reason, AliasRejection::Disabled);
    assert_eq!(plan.slots()[plan.output_slot(0)].role, SlotRole::Output(0));
}

#[test]
fn test_check_alias_rules() {
    let rule = AliasRule { output: 0, scratch: 0, produced_at: 2 };

    let live = BufferRequest::new("t", 64usize);
    assert_eq!(planner::check_alias(&rule, &live, 64, 64, 4), Err(AliasRejection::NotAliasable));

    let late = BufferRequest::new("t", 64usize).aliasable(3);
    assert_eq!(
        planner::check_alias(&rule, &late, 64, 64, 4),
        Err(AliasRejection::LifetimeOverlap { last_use: 3, produced_at: 2 })
    );

    let dead = BufferRequest::new("t", 64usize).aliasable(2);
    assert_eq!(planner::check_alias(&rule, &dead, 64, 64, 4), Ok(()));
    assert_eq!(planner::check_alias(&rule, &dead, 64, 32, 64), Ok(()));
}

#[test]
fn test_plan_is_deterministic() {
    let dims = bound(&[("n", 10)]);
    let first = planner::layout(&staged_descriptor(), &dims, PlanOptions::default()).unwrap();
    let second = planner::layout(&staged_descriptor(), &dims, PlanOptions::default()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_scratch_slots_come_first() {
    let descriptor = SignatureDescriptor::new(vec![], vec![TensorSpec::new(DType::Int32, [2usize])])
        .with_scratch(BufferRequest::new("a", 8usize))
        .with_scratch(BufferRequest::new("b", 24usize).with_alignment(16));

    let plan = planner::layout(&descriptor, &BoundDims::new(), PlanOptions::default()).unwrap();
    let roles: Vec<_> = plan.slots().iter().map(|s| s.role).collect();
    assert_eq!(roles, [SlotRole::Scratch(0), SlotRole::Scratch(1), SlotRole::Output(0)]);
    assert_eq!(plan.slots()[1].alignment, 16);
    assert_eq!(plan.peak_bytes(), 8 + 24 + 8);
}

#[test]
fn test_total_plan_size_overflow() {
    let half = usize::MAX / 2 + 1;
    let descriptor = SignatureDescriptor::new(vec![], vec![])
        .with_scratch(BufferRequest::new("lo", half))
        .with_scratch(BufferRequest::new("hi", half));

    let err = planner::layout(&descriptor, &BoundDims::new(), PlanOptions::default()).unwrap_err();
    assert!(matches!(err, Error::InvalidDescriptor { ref reason } if reason.contains("overflows")), "got {err}");
}
