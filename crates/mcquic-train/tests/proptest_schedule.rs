//! Property tests for schedules and gradient clipping.

use mcquic_neural::Gradients;
use mcquic_train::{clip_gradients, LearningRateScheduler, SchedulerConfig, SchedulerType};
use proptest::prelude::*;

fn scheduler_type() -> impl Strategy<Value = SchedulerType> {
    prop_oneof![
        Just(SchedulerType::Constant),
        Just(SchedulerType::Linear),
        Just(SchedulerType::Cosine),
        Just(SchedulerType::WarmupCosine),
        Just(SchedulerType::Exponential),
        Just(SchedulerType::Step),
        Just(SchedulerType::OneCycle),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 100,
        ..ProptestConfig::default()
    })]

    #[test]
    fn prop_lr_finite_and_bounded(
        kind in scheduler_type(),
        initial in 1e-5f32..1.0,
        ratio in 0.0f32..1.0,
        warmup in 0u64..50,
        total in 50u64..500,
    ) {
        let config = SchedulerConfig {
            initial_lr: initial,
            final_lr: initial * ratio,
            warmup_steps: warmup,
            total_steps: total,
            scheduler_type: kind,
        };
        let mut scheduler = LearningRateScheduler::new(config);
        for _ in 0..total + 10 {
            let lr = scheduler.step();
            prop_assert!(lr.is_finite());
            prop_assert!(lr >= 0.0);
            prop_assert!(lr <= initial * 10.0 * (1.0 + 1e-5));
        }
    }

    #[test]
    fn prop_clip_bounds_norm(
        values in prop::collection::vec(-100.0f32..100.0, 1..64),
        max_norm in 0.01f32..10.0,
    ) {
        let mut grads = Gradients::new();
        grads.insert("w".into(), values);
        clip_gradients(&mut grads, max_norm);
        let norm: f32 = grads["w"].iter().map(|g| g * g).sum::<f32>().sqrt();
        prop_assert!(norm <= max_norm * (1.0 + 1e-4));
    }
}
