//! Weight vector pipeline: threshold, normalize, transition.

use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::config::TransitionConfig;

pub(crate) type WeightVec = BTreeMap<String, Decimal>;

/// Zero out entries below the minimum threshold.
pub(crate) fn apply_threshold(weights: &WeightVec, min_threshold: Decimal) -> WeightVec {
    weights
        .iter()
        .map(|(style, w)| {
            let w = if *w < min_threshold { Decimal::ZERO } else { *w };
            (style.clone(), w)
        })
        .collect()
}

/// Scale positive entries to sum to one. An all-zero vector is returned
/// unchanged so a fully thresholded regime allocates nothing.
pub(crate) fn normalize(weights: &WeightVec) -> WeightVec {
    let total: Decimal = weights.values().filter(|w| **w > Decimal::ZERO).sum();
    if total <= Decimal::ZERO {
        return weights.clone();
    }
    weights
        .iter()
        .map(|(style, w)| {
            let w = if *w > Decimal::ZERO { *w / total } else { Decimal::ZERO };
            (style.clone(), w)
        })
        .collect()
}

/// Move the current vector toward the target, capping per-style movement
/// at `max_step_per_tick` in gradual mode, then renormalize. Immediate
/// mode or an empty current vector jumps straight to the target.
pub(crate) fn apply_transition(
    current: &WeightVec,
    target: &WeightVec,
    transition: &TransitionConfig,
) -> WeightVec {
    if transition.mode != "gradual" || current.is_empty() {
        return target.clone();
    }

    let styles: std::collections::BTreeSet<&String> =
        current.keys().chain(target.keys()).collect();

    let stepped: WeightVec = styles
        .into_iter()
        .map(|style| {
            let from = current.get(style).copied().unwrap_or(Decimal::ZERO);
            let to = target.get(style).copied().unwrap_or(Decimal::ZERO);
            let diff = to - from;
            let step = transition.max_step_per_tick;
            let next = if diff > step {
                from + step
            } else if diff < -step {
                from - step
            } else {
                to
            };
            (style.clone(), next)
        })
        .collect();

    normalize(&stepped)
}
