//! Helpers for automation scripts: case filtering, parameter-sweep
//! expansion, and plot comparison plumbing.

use std::sync::Arc;

use serde_json::Value;

use crate::sim::{Simulation, render_value};

/// An ordered parameter set, as consumed by [`Simulation`] builders.
pub type Opts = Vec<(String, Value)>;

/// Keep the cases whose parameters exactly match every given pair.
pub fn filter_cases(cases: &[Arc<Simulation>], params: &[(&str, Value)]) -> Vec<Arc<Simulation>> {
    filter_cases_by(cases, |sim| {
        params
            .iter()
            .all(|(key, expected)| sim.get_param(key) == Some(expected))
    })
}

/// Keep the cases satisfying `predicate`.
pub fn filter_cases_by(
    cases: &[Arc<Simulation>],
    predicate: impl Fn(&Simulation) -> bool,
) -> Vec<Arc<Simulation>> {
    cases
        .iter()
        .filter(|sim| predicate(sim))
        .cloned()
        .collect()
}

/// Keep the named cases, ordered as `names` lists them.
pub fn filter_by_name(cases: &[Arc<Simulation>], names: &[&str]) -> Vec<Arc<Simulation>> {
    let mut selected: Vec<Arc<Simulation>> = cases
        .iter()
        .filter(|sim| names.contains(&sim.name()))
        .cloned()
        .collect();
    selected.sort_by_key(|sim| names.iter().position(|n| *n == sim.name()));
    selected
}

/// Style hints for one plotted line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineStyle {
    pub color: &'static str,
    pub linestyle: &'static str,
}

/// Cycle over the product of four colors and four dash styles.
pub fn linestyles() -> impl Iterator<Item = LineStyle> {
    const COLORS: [&str; 4] = ["k", "b", "g", "r"];
    const STYLES: [&str; 4] = ["-", "--", "-.", ":"];
    (0..).map(|i: usize| LineStyle {
        color: COLORS[(i / STYLES.len()) % COLORS.len()],
        linestyle: STYLES[i % STYLES.len()],
    })
}

/// Call `method` for each simulation with its label and the next line
/// style; `exact` runs first against the first simulation when given.
pub fn compare_runs<M, E>(sims: &[Arc<Simulation>], labels: &[&str], mut method: M, exact: Option<E>)
where
    M: FnMut(&Simulation, &str, &LineStyle),
    E: FnOnce(&Simulation, &LineStyle),
{
    let mut styles = linestyles();
    if let Some(exact) = exact
        && let Some(first) = sims.first()
    {
        exact(first, &styles.next().expect("linestyles cycle"));
    }
    for sim in sims {
        let style = styles.next().expect("linestyles cycle");
        method(sim, &sim.get_labels(labels), &style);
    }
}

/// Cartesian product of `key -> values` axes, in axis order.
///
/// `mdict(&[("nx", ...), ("re", ...)])` yields one parameter set per
/// combination, later axes varying fastest.
pub fn mdict(axes: &[(&str, Vec<Value>)]) -> Vec<Opts> {
    let mut acc: Vec<Opts> = vec![Vec::new()];
    for (key, values) in axes {
        let mut next = Vec::with_capacity(acc.len() * values.len());
        for opts in &acc {
            for value in values {
                let mut grown = opts.clone();
                grown.push((key.to_string(), value.clone()));
                next.push(grown);
            }
        }
        acc = next;
    }
    acc
}

/// Pairwise merge product of two parameter-set lists.
pub fn dprod(a: &[Opts], b: &[Opts]) -> Vec<Opts> {
    let mut out = Vec::with_capacity(a.len() * b.len());
    for left in a {
        for right in b {
            let mut merged = left.clone();
            merged.extend(right.iter().cloned());
            out.push(merged);
        }
    }
    out
}

/// Encode a parameter set as a filesystem-friendly name.
///
/// Segments join with `_`: `key_value` normally, the bare value for
/// strings, `keyvalue` for keys listed in `keys`, and the bare key for
/// flag parameters. Keys in `ignore` are skipped.
pub fn opts2path(opts: &[(String, Value)], keys: &[&str], ignore: &[&str]) -> String {
    opts.iter()
        .filter(|(key, _)| !ignore.contains(&key.as_str()))
        .map(|(key, value)| match value {
            Value::Null => key.clone(),
            other if keys.contains(&key.as_str()) => format!("{key}{}", render_value(other)),
            Value::String(s) => s.clone(),
            other => format!("{key}_{}", render_value(other)),
        })
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cases() -> Vec<Arc<Simulation>> {
        (0..5)
            .map(|i| {
                Arc::new(
                    Simulation::new(format!("sim/case{i}"), "solver")
                        .param("param1", i)
                        .param("param2", i + 1),
                )
            })
            .collect()
    }

    #[test]
    fn filter_cases_matches_exact_params() {
        let sims = cases();
        let result = filter_cases(&sims, &[("param1", json!(2))]);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].get_param("param1"), Some(&json!(2)));

        assert!(filter_cases(&sims, &[("param1", json!(2)), ("param2", json!(2))]).is_empty());
        let both = filter_cases(&sims, &[("param1", json!(3)), ("param2", json!(4))]);
        assert_eq!(both.len(), 1);
    }

    #[test]
    fn filter_cases_by_predicate() {
        let sims = cases();
        let odd = filter_cases_by(&sims, |s| {
            s.get_param("param1").and_then(Value::as_i64).unwrap_or(0) % 2 == 1
        });
        assert_eq!(odd.len(), 2);
    }

    #[test]
    fn filter_by_name_follows_requested_order() {
        let sims = cases();
        let picked = filter_by_name(&sims, &["case3", "case1"]);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].name(), "case3");
        assert_eq!(picked[1].name(), "case1");
    }

    #[test]
    fn linestyles_cycle_color_major() {
        let styles: Vec<_> = linestyles().take(6).collect();
        assert_eq!(styles[0], LineStyle { color: "k", linestyle: "-" });
        assert_eq!(styles[1], LineStyle { color: "k", linestyle: "--" });
        assert_eq!(styles[4], LineStyle { color: "b", linestyle: "-" });
    }

    #[test]
    fn compare_runs_labels_each_case() {
        let sims = cases();
        let mut seen = Vec::new();
        compare_runs(
            &sims[..2],
            &["param1"],
            |_, label, style| seen.push((label.to_string(), style.clone())),
            Some(|_: &Simulation, style: &LineStyle| {
                assert_eq!(style.linestyle, "-");
            }),
        );
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "param1=0");
        // The exact plot consumed the first style.
        assert_eq!(seen[0].1.linestyle, "--");
    }

    #[test]
    fn mdict_expands_axes_in_order() {
        let sets = mdict(&[
            ("nx", vec![json!(50), json!(100)]),
            ("pst", vec![json!("sun")]),
        ]);
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0][0], ("nx".to_string(), json!(50)));
        assert_eq!(sets[1][0], ("nx".to_string(), json!(100)));
        assert_eq!(sets[0][1], ("pst".to_string(), json!("sun")));
    }

    #[test]
    fn dprod_merges_pairwise() {
        let a = mdict(&[("nx", vec![json!(25), json!(50)])]);
        let b = mdict(&[("re", vec![json!(100), json!(200)])]);
        let product = dprod(&a, &b);
        assert_eq!(product.len(), 4);
        assert_eq!(product[0].len(), 2);
    }

    #[test]
    fn opts2path_encodes_params() {
        let opts: Opts = vec![
            ("nx".to_string(), json!(25)),
            ("pst".to_string(), json!("sun")),
            ("no_periodic".to_string(), Value::Null),
            ("seed".to_string(), json!(7)),
        ];
        assert_eq!(
            opts2path(&opts, &["nx"], &["seed"]),
            "nx25_sun_no_periodic"
        );
        assert_eq!(
            opts2path(&opts, &[], &["pst", "seed"]),
            "nx_25_no_periodic"
        );
    }
}
