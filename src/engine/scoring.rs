//! Utility scoring: considerations to a final score per (bot, action).
//!
//! For each consideration, in declaration order: evaluate the expression
//! over the bot's variables (raw), linearly map into [0, 1] against the
//! configured range (ranged), reshape through the named curve (curved),
//! and weight (the consideration's contribution). Contributions multiply
//! into a running product; a contribution of exactly zero vetoes the
//! whole action, and an evaluation failure zeroes it with the reason
//! recorded. The product is then pulled back toward 1 by the averaging
//! correction before the action weight is applied.
//!
//! The numbers work best with consideration scores near 0..1 and the
//! action weight doing the cross-action prioritization; the correction
//! keeps many-consideration actions from being crushed by geometric
//! shrinkage while preserving the zero-veto property.

use std::collections::HashMap;

use tracing::warn;

use super::session::GroupRuntime;
use crate::curves::CurveTable;
use crate::expr::Expression;
use crate::types::{Action, BotActionData};

/// Linearly map a raw score into [0, 1] against [start, end], clamped at
/// the interval ends.
pub fn range_map(raw: f64, start: f64, end: f64) -> f64 {
    if end <= start {
        // Degenerate range: everything at or past the end is 1.
        return if raw >= end { 1.0 } else { 0.0 };
    }
    ((raw - start) / (end - start)).clamp(0.0, 1.0)
}

/// The averaging correction applied to the consideration product.
///
/// With `n` considerations and running product `p`:
/// `mod_factor = 1 - 1/n`, `make_up = (1 - p) * mod_factor`, and the
/// result is `p + make_up * p`. One consideration passes through
/// unchanged; as `n` grows the result is pulled toward 1 for any `p > 0`;
/// `p = 0` stays 0. Zero considerations score 0.
///
/// This is a bespoke heuristic, not a statistical formula; action weight
/// tuning downstream is calibrated against this exact shape.
pub fn average_and_fixup(product: f64, count: usize) -> (f64, Vec<String>) {
    let mut details = Vec::new();

    if count == 0 {
        details.push("There are 0 consideration scores.  Nothing to calculate: 0".to_string());
        return (0.0, details);
    }

    let mod_factor = 1.0 - (1.0 / count as f64);
    let make_up = (1.0 - product) * mod_factor;
    let combined = product + make_up * product;

    details.push(format!(
        "Unweighted considerations score:  Running product: {product:.2}  Count: {count}  \
         Mod: {mod_factor:.2}  Make up: {make_up:.2}  Combined: {combined:.2}"
    ));

    (combined, details)
}

/// Score every action of the group for every bot.
///
/// Expressions compile once per pass; bots are locked one at a time while
/// their action data is written. Scoring failures never abort the pass:
/// an action that cannot be scored for a bot scores 0 for that bot with
/// the reason recorded in its details.
pub fn score_group(group: &GroupRuntime, curves: &CurveTable) {
    let spec = &group.spec;

    // Compile each consideration expression once; None marks a broken
    // expression, which vetoes its action for every bot.
    let mut compiled: HashMap<(usize, usize), Option<Expression>> = HashMap::new();
    for (action_index, action) in spec.actions.iter().enumerate() {
        for (consider_index, consider) in action.considerations.iter().enumerate() {
            let expression = match Expression::parse(&consider.evaluate) {
                Ok(expression) => Some(expression),
                Err(err) => {
                    warn!(
                        group = %spec.name,
                        action = %action.name,
                        consideration = %consider.name,
                        %err,
                        "consideration expression failed to compile"
                    );
                    None
                }
            };
            compiled.insert((action_index, consider_index), expression);
        }
    }

    for handle in group.bot_handles() {
        let mut bot = handle.lock().expect("bot poisoned");
        let variables = bot.variables.clone();

        for (action_index, action) in spec.actions.iter().enumerate() {
            let data = bot
                .action_data
                .entry(action.name.clone())
                .or_insert_with(BotActionData::default);
            data.clear_scores();

            score_action(action, action_index, &compiled, &variables, curves, data);
        }
    }
}

/// Score one action against one bot's variable snapshot, writing the
/// intermediate values and narrative into its action data.
fn score_action(
    action: &Action,
    action_index: usize,
    compiled: &HashMap<(usize, usize), Option<Expression>>,
    variables: &HashMap<String, f64>,
    curves: &CurveTable,
    data: &mut BotActionData,
) {
    let mut product = 1.0_f64;
    let mut count = 0_usize;
    let mut aborted = false;

    for (consider_index, consider) in action.considerations.iter().enumerate() {
        count += 1;

        let Some(Some(expression)) = compiled.get(&(action_index, consider_index)) else {
            data.details.push(format!(
                "Consideration expression invalid, aborting: {}",
                consider.name
            ));
            aborted = true;
            break;
        };

        let raw = match expression.evaluate(variables) {
            Ok(raw) => raw,
            Err(err) => {
                // An evaluation failure is an explicit veto with a recorded
                // reason, not an error; the rest of the pass continues.
                data.details.push(format!(
                    "Consideration evaluation failed, aborting: {}: {err}",
                    consider.name
                ));
                aborted = true;
                break;
            }
        };

        let ranged = range_map(raw, consider.range_start, consider.range_end);

        let curve = match curves.get(&consider.curve) {
            Ok(curve) => curve,
            Err(err) => {
                warn!(consideration = %consider.name, %err, "missing curve");
                data.details.push(format!(
                    "Consideration curve missing, aborting: {}: {}",
                    consider.name, consider.curve
                ));
                aborted = true;
                break;
            }
        };
        let curved = curve.value_at(ranged);

        let contribution = curved * consider.weight;

        data.raw_scores.insert(consider.name.clone(), raw);
        data.ranged_scores.insert(consider.name.clone(), ranged);
        data.curved_scores.insert(consider.name.clone(), curved);
        data.final_scores.insert(consider.name.clone(), contribution);
        data.details.push(format!(
            "Calculation flow for consideration \"{}\":  Raw: {raw:.2} -> Ranged: {ranged:.2} \
             -> Curved: {curved:.2} -> Weighted: {contribution:.2}",
            consider.name
        ));

        // Exactly zero is a deliberate veto: the action can never execute
        // this tick, regardless of the other considerations.
        if contribution == 0.0 {
            data.details
                .push(format!("Consideration is 0, vetoing: {}", consider.name));
            product = 0.0;
            break;
        }

        product *= contribution;
    }

    let combined = if aborted {
        data.details
            .push("Scoring aborted; final score is 0".to_string());
        0.0
    } else if product == 0.0 {
        0.0
    } else {
        let (combined, fixup_details) = average_and_fixup(product, count);
        data.details.extend(fixup_details);
        combined
    };

    let mut final_score = combined * action.weight;
    if action.weight_min > 0.0 && final_score > 0.0 && final_score < action.weight_min {
        data.details.push(format!(
            "Final score {final_score:.2} raised to weight floor {:.2}",
            action.weight_min
        ));
        final_score = action.weight_min;
    }

    data.details.push(format!(
        "Combined considerations: {combined:.2} * Action weight: {:.2} = Final score: {final_score:.2}",
        action.weight
    ));
    data.final_score = final_score;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curves::Curve;
    use crate::types::{Bot, BotGroup, Consideration};
    use chrono::Utc;

    fn identity_curves() -> CurveTable {
        let mut table = CurveTable::new();
        // 101 samples of y = x over [0, 1].
        table.insert(Curve {
            name: "linear".to_string(),
            values: (0..=100).map(|i| i as f64 * 0.01).collect(),
        });
        table.insert(Curve {
            name: "zero".to_string(),
            values: vec![0.0, 0.0],
        });
        table
    }

    fn consideration(name: &str, evaluate: &str, weight: f64) -> Consideration {
        Consideration {
            name: name.to_string(),
            weight,
            curve: "linear".to_string(),
            range_start: 0.0,
            range_end: 1.0,
            evaluate: evaluate.to_string(),
        }
    }

    fn group_with_action(action: Action) -> GroupRuntime {
        let group = GroupRuntime::new(BotGroup {
            name: "web".to_string(),
            actions: vec![action],
            ..Default::default()
        });
        let mut bot = Bot::new("web-1", Utc::now());
        bot.variables.insert("cpu".to_string(), 0.9);
        bot.variables.insert("mem".to_string(), 0.5);
        group.add_bot(bot);
        group
    }

    fn scored_data(group: &GroupRuntime, action: &str) -> BotActionData {
        let bot = group.find_bot("web-1").unwrap();
        let bot = bot.lock().unwrap();
        bot.action_data[action].clone()
    }

    #[test]
    fn range_map_clamps_to_interval_ends() {
        assert_eq!(range_map(-5.0, 0.0, 10.0), 0.0);
        assert_eq!(range_map(0.0, 0.0, 10.0), 0.0);
        assert_eq!(range_map(5.0, 0.0, 10.0), 0.5);
        assert_eq!(range_map(10.0, 0.0, 10.0), 1.0);
        assert_eq!(range_map(15.0, 0.0, 10.0), 1.0);
    }

    #[test]
    fn fixup_passes_single_consideration_through() {
        let (score, _) = average_and_fixup(0.9, 1);
        assert!((score - 0.9).abs() < 1e-12);
        let (score, _) = average_and_fixup(0.3, 1);
        assert!((score - 0.3).abs() < 1e-12);
    }

    #[test]
    fn fixup_approaches_one_as_count_grows() {
        let (few, _) = average_and_fixup(0.5, 2);
        let (many, _) = average_and_fixup(0.5, 100);
        let (huge, _) = average_and_fixup(0.5, 1_000_000);
        assert!(few < many && many < huge);
        assert!(huge < 1.0);
        assert!(huge > 0.99);
    }

    #[test]
    fn fixup_preserves_zero_and_handles_empty() {
        assert_eq!(average_and_fixup(0.0, 5).0, 0.0);
        assert_eq!(average_and_fixup(0.7, 0).0, 0.0);
    }

    #[test]
    fn fixup_matches_the_exact_formula() {
        // n = 2, p = 0.6: mod = 0.5, make_up = 0.2, combined = 0.72
        let (score, _) = average_and_fixup(0.6, 2);
        assert!((score - 0.72).abs() < 1e-12);
    }

    #[test]
    fn single_consideration_scores_through_the_full_flow() {
        let group = group_with_action(Action {
            name: "restart".to_string(),
            weight: 2.0,
            considerations: vec![consideration("load", "cpu", 1.0)],
            ..Default::default()
        });

        score_group(&group, &identity_curves());

        let data = scored_data(&group, "restart");
        // raw 0.9 -> ranged 0.9 -> curved 0.9 -> contribution 0.9,
        // fixup(0.9, 1) = 0.9, * weight 2.0 = 1.8
        assert!((data.raw_scores["load"] - 0.9).abs() < 1e-9);
        assert!((data.final_score - 1.8).abs() < 1e-9);
        assert!(!data.details.is_empty());
    }

    #[test]
    fn zero_contribution_vetoes_regardless_of_others() {
        let group = group_with_action(Action {
            name: "restart".to_string(),
            weight: 10.0,
            considerations: vec![
                consideration("good", "cpu", 1.0),
                // The zero curve forces this contribution to 0.
                Consideration {
                    curve: "zero".to_string(),
                    ..consideration("veto", "mem", 5.0)
                },
                consideration("unreached", "cpu", 1.0),
            ],
            ..Default::default()
        });

        score_group(&group, &identity_curves());

        let data = scored_data(&group, "restart");
        assert_eq!(data.final_score, 0.0);
        // The veto short-circuits; the trailing consideration never ran.
        assert!(!data.raw_scores.contains_key("unreached"));
        assert!(data.details.iter().any(|d| d.contains("vetoing")));
    }

    #[test]
    fn evaluation_failure_zeroes_with_reason() {
        let group = group_with_action(Action {
            name: "restart".to_string(),
            weight: 2.0,
            considerations: vec![consideration("broken", "no_such_variable", 1.0)],
            ..Default::default()
        });

        score_group(&group, &identity_curves());

        let data = scored_data(&group, "restart");
        assert_eq!(data.final_score, 0.0);
        assert!(data
            .details
            .iter()
            .any(|d| d.contains("evaluation failed")));
    }

    #[test]
    fn missing_curve_zeroes_the_action_not_the_pass() {
        let group = group_with_action(Action {
            name: "restart".to_string(),
            weight: 2.0,
            considerations: vec![Consideration {
                curve: "no_such_curve".to_string(),
                ..consideration("load", "cpu", 1.0)
            }],
            ..Default::default()
        });

        score_group(&group, &identity_curves());
        assert_eq!(scored_data(&group, "restart").final_score, 0.0);
    }

    #[test]
    fn weight_floor_raises_positive_scores() {
        let group = group_with_action(Action {
            name: "restart".to_string(),
            weight: 1.0,
            weight_min: 0.75,
            considerations: vec![consideration("mem", "mem", 1.0)],
            ..Default::default()
        });

        score_group(&group, &identity_curves());
        // 0.5 through the identity pipeline, below the 0.75 floor.
        assert!((scored_data(&group, "restart").final_score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn averaging_correction_applies_across_considerations() {
        let group = group_with_action(Action {
            name: "restart".to_string(),
            weight: 1.0,
            considerations: vec![
                consideration("a", "cpu", 1.0),
                consideration("b", "mem", 1.0),
            ],
            ..Default::default()
        });

        score_group(&group, &identity_curves());

        // product = 0.9 * 0.5 = 0.45; fixup: mod 0.5, make_up 0.275,
        // combined = 0.45 + 0.275 * 0.45 = 0.57375
        let data = scored_data(&group, "restart");
        assert!((data.final_score - 0.57375).abs() < 1e-9);
    }
}
