//! Conversion of algebraic rules into assignment rules.
//!
//! Equations (rules and reaction-driven species) are matched to the variables
//! they determine with a maximum bipartite matching. An equation left without
//! a variable means the model is overdetermined. Each algebraic rule is then
//! solved symbolically for its matched variable.
use crate::error::{Result, SimulationError};
use crate::math::{MathNode, Operator};
use crate::model::{Model, Rule};
use std::collections::HashMap;

/// Algebraic rule rewritten as `variable = math`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedRule {
    pub variable: String,
    pub math: MathNode,
}

struct Bipartite {
    variables: Vec<String>,
    /// Candidate variables of every equation.
    edges: Vec<Vec<usize>>,
    /// Index into `edges` of each algebraic rule, in rule order.
    algebraic: Vec<(usize, MathNode)>,
}

/// Whether `expr = 0` can be solved for `variable` by [`isolate`]: a single
/// occurrence reached only through sums, differences, products and quotients.
fn solvable_for(expr: &MathNode, variable: &str) -> bool {
    if expr.count_name(variable) != 1 {
        return false;
    }
    let mut node = expr;
    loop {
        match node {
            MathNode::Name(name) => return name == variable,
            MathNode::Apply(op, args) => {
                let supported = match op {
                    Operator::Plus | Operator::Times => true,
                    Operator::Minus => args.len() <= 2,
                    Operator::Divide => args.len() == 2,
                    _ => false,
                };
                match args.iter().find(|a| a.count_name(variable) == 1) {
                    Some(next) if supported => node = next,
                    _ => return false,
                }
            }
            _ => return false,
        }
    }
}

/// Checks the model for overdetermination and converts its algebraic rules.
pub fn convert_algebraic_rules(model: &Model) -> Result<Vec<ConvertedRule>> {
    let graph = build_bipartite(model);
    for (equation, math) in &graph.algebraic {
        let mut names = Vec::new();
        math.collect_names(&mut names);
        let has_free = names.iter().any(|n| graph.variables.contains(n));
        if graph.edges[*equation].is_empty() && has_free {
            return Err(SimulationError::AlgebraicRule(format!(
                "cannot solve {math} for any of its variables"
            )));
        }
    }
    let matching = maximum_matching(&graph.edges, graph.variables.len());

    if let Some(unmatched) = matching.iter().position(Option::is_none) {
        return Err(SimulationError::ModelOverdetermined(format!(
            "{} equations for {} free variables; equation {unmatched} has no variable left",
            graph.edges.len(),
            graph.variables.len()
        )));
    }

    let mut rules = Vec::with_capacity(graph.algebraic.len());
    for (equation, math) in &graph.algebraic {
        let Some(variable) = matching[*equation] else {
            continue;
        };
        let variable = &graph.variables[variable];
        let solved = isolate(math, variable, MathNode::number(0.0))?;
        rules.push(ConvertedRule {
            variable: variable.clone(),
            math: solved,
        });
    }
    Ok(rules)
}

fn build_bipartite(model: &Model) -> Bipartite {
    let mut variables = Vec::new();
    let mut lookup = HashMap::new();
    let mut add = |id: &str, lookup: &mut HashMap<String, usize>| {
        lookup.insert(id.to_string(), variables.len());
        variables.push(id.to_string());
    };
    for c in model.compartments.iter().filter(|c| !c.constant) {
        add(&c.id, &mut lookup);
    }
    for s in model.species.iter().filter(|s| !s.constant) {
        add(&s.id, &mut lookup);
    }
    for p in model.parameters.iter().filter(|p| !p.constant) {
        add(&p.id, &mut lookup);
    }
    for reaction in &model.reactions {
        for sr in reaction.species_references().filter(|sr| !sr.constant) {
            if let Some(id) = &sr.id {
                add(id, &mut lookup);
            }
        }
    }

    let mut edges = Vec::new();
    let mut algebraic = Vec::new();
    for rule in &model.rules {
        match rule {
            Rule::Assignment { variable, .. } | Rule::Rate { variable, .. } => {
                edges.push(lookup.get(variable).copied().into_iter().collect());
            }
            Rule::Algebraic { math } => {
                let mut names = Vec::new();
                math.collect_names(&mut names);
                let candidates = names
                    .iter()
                    .filter(|n| solvable_for(math, n))
                    .filter_map(|n| lookup.get(n).copied())
                    .collect();
                algebraic.push((edges.len(), math.clone()));
                edges.push(candidates);
            }
        }
    }
    for species in &model.species {
        if species.boundary_condition || species.constant {
            continue;
        }
        let in_reaction = model
            .reactions
            .iter()
            .any(|r| r.species_references().any(|sr| sr.species == species.id));
        if in_reaction {
            edges.push(lookup.get(&species.id).copied().into_iter().collect());
        }
    }

    Bipartite {
        variables,
        edges,
        algebraic,
    }
}

/// Kuhn's augmenting-path matching. Returns the variable matched to each
/// equation.
fn maximum_matching(edges: &[Vec<usize>], variable_count: usize) -> Vec<Option<usize>> {
    let mut owner: Vec<Option<usize>> = vec![None; variable_count];
    for equation in 0..edges.len() {
        let mut visited = vec![false; variable_count];
        augment(equation, edges, &mut owner, &mut visited);
    }
    let mut matched = vec![None; edges.len()];
    for (variable, equation) in owner.iter().enumerate() {
        if let Some(e) = equation {
            matched[*e] = Some(variable);
        }
    }
    matched
}

fn augment(
    equation: usize,
    edges: &[Vec<usize>],
    owner: &mut [Option<usize>],
    visited: &mut [bool],
) -> bool {
    for &variable in &edges[equation] {
        if visited[variable] {
            continue;
        }
        visited[variable] = true;
        let free = match owner[variable] {
            None => true,
            Some(other) => augment(other, edges, owner, visited),
        };
        if free {
            owner[variable] = Some(equation);
            return true;
        }
    }
    false
}

/// Solves `expr = rhs` for `variable`, which must occur exactly once.
fn isolate(expr: &MathNode, variable: &str, rhs: MathNode) -> Result<MathNode> {
    match expr.count_name(variable) {
        1 => {}
        0 => {
            return Err(SimulationError::AlgebraicRule(format!(
                "'{variable}' does not occur in {expr}"
            )))
        }
        n => {
            return Err(SimulationError::AlgebraicRule(format!(
                "'{variable}' occurs {n} times in {expr}"
            )))
        }
    }
    let unsupported = || {
        SimulationError::AlgebraicRule(format!("cannot solve {expr} for '{variable}'"))
    };

    match expr {
        MathNode::Name(name) if name == variable => Ok(rhs),
        MathNode::Apply(op, args) => {
            let pos = args
                .iter()
                .position(|a| a.count_name(variable) == 1)
                .ok_or_else(unsupported)?;
            let others = || {
                args.iter()
                    .enumerate()
                    .filter(|(i, _)| *i != pos)
                    .map(|(_, a)| a.clone())
                    .collect::<Vec<_>>()
            };
            let target = &args[pos];
            let rhs = match (op, args.len(), pos) {
                (Operator::Plus, _, _) => MathNode::apply(
                    Operator::Minus,
                    vec![rhs, MathNode::apply(Operator::Plus, others())],
                ),
                (Operator::Times, _, _) => MathNode::apply(
                    Operator::Divide,
                    vec![rhs, MathNode::apply(Operator::Times, others())],
                ),
                (Operator::Minus, 1, _) => MathNode::apply(Operator::Minus, vec![rhs]),
                (Operator::Minus, 2, 0) => {
                    MathNode::apply(Operator::Plus, vec![rhs, args[1].clone()])
                }
                (Operator::Minus, 2, _) => {
                    MathNode::apply(Operator::Minus, vec![args[0].clone(), rhs])
                }
                (Operator::Divide, 2, 0) => {
                    MathNode::apply(Operator::Times, vec![rhs, args[1].clone()])
                }
                (Operator::Divide, 2, _) => {
                    MathNode::apply(Operator::Divide, vec![args[0].clone(), rhs])
                }
                _ => return Err(unsupported()),
            };
            isolate(target, variable, rhs)
        }
        _ => Err(unsupported()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::parse_formula;
    use crate::model::{Parameter, Reaction};

    fn eval(expr: &MathNode, bindings: &[(&str, f64)]) -> f64 {
        match expr {
            MathNode::Number(v) => *v,
            MathNode::Name(n) => bindings
                .iter()
                .find(|(id, _)| id == n)
                .map(|(_, v)| *v)
                .unwrap_or_else(|| panic!("unbound {n}")),
            MathNode::Apply(op, args) => {
                let v: Vec<f64> = args.iter().map(|a| eval(a, bindings)).collect();
                match (op, v.len()) {
                    (Operator::Plus, _) => v.iter().sum(),
                    (Operator::Times, _) => v.iter().product(),
                    (Operator::Minus, 1) => -v[0],
                    (Operator::Minus, _) => v[0] - v[1],
                    (Operator::Divide, _) => v[0] / v[1],
                    _ => panic!("unsupported op in test"),
                }
            }
            other => panic!("unsupported node {other:?}"),
        }
    }

    fn model_with(rules: Vec<Rule>) -> Model {
        let mut model = Model::new("m");
        model.parameters.push(Parameter::variable("x", 0.0));
        model.parameters.push(Parameter::variable("y", 0.0));
        model.parameters.push(Parameter::new("c", 2.0));
        model.rules = rules;
        model
    }

    #[test]
    fn solves_linear_algebraic_rule_for_matched_variable() {
        // 0 = 3 - 2 * x / (c + 1)  =>  x = 4.5 at c = 2
        let model = model_with(vec![Rule::Algebraic {
            math: parse_formula("3 - 2 * x / (c + 1)").unwrap(),
        }]);
        let rules = convert_algebraic_rules(&model).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].variable, "x");
        let value = eval(&rules[0].math, &[("c", 2.0)]);
        assert!((value - 4.5).abs() < 1e-12);
    }

    #[test]
    fn algebraic_rule_picks_the_variable_not_taken_by_other_rules() {
        let model = model_with(vec![
            Rule::Assignment {
                variable: "x".into(),
                math: parse_formula("c").unwrap(),
            },
            Rule::Algebraic {
                math: parse_formula("x + y - 5").unwrap(),
            },
        ]);
        let rules = convert_algebraic_rules(&model).unwrap();
        assert_eq!(rules[0].variable, "y");
        assert!((eval(&rules[0].math, &[("x", 2.0)]) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_overdetermined_models() {
        let model = model_with(vec![
            Rule::Assignment {
                variable: "x".into(),
                math: parse_formula("c").unwrap(),
            },
            Rule::Algebraic {
                math: parse_formula("x - 1").unwrap(),
            },
        ]);
        let err = convert_algebraic_rules(&model).unwrap_err();
        assert!(matches!(err, SimulationError::ModelOverdetermined(_)));
    }

    #[test]
    fn reaction_species_count_as_determined() {
        let mut model = Model::new("m")
            .with_compartment("cell", 1.0)
            .with_species("A", "cell", 1.0)
            .with_reaction(Reaction::new("r", parse_formula("A").unwrap()).reactant("A", 1.0));
        model.rules.push(Rule::Algebraic {
            math: parse_formula("A - 1").unwrap(),
        });
        assert!(matches!(
            convert_algebraic_rules(&model),
            Err(SimulationError::ModelOverdetermined(_))
        ));
    }

    #[test]
    fn nonlinear_occurrence_is_reported() {
        let model = model_with(vec![Rule::Algebraic {
            math: parse_formula("x * x - 4").unwrap(),
        }]);
        let err = convert_algebraic_rules(&model).unwrap_err();
        assert!(matches!(err, SimulationError::AlgebraicRule(_)));
        assert!(err.to_string().contains("cannot solve"));
    }

    #[test]
    fn nonlinear_variables_are_skipped_in_favour_of_a_solvable_one() {
        let model = model_with(vec![Rule::Algebraic {
            math: parse_formula("x * x + y - 5").unwrap(),
        }]);
        let rules = convert_algebraic_rules(&model).unwrap();
        assert_eq!(rules[0].variable, "y");
        assert!((eval(&rules[0].math, &[("x", 2.0)]) - 1.0).abs() < 1e-12);

        let model = model_with(vec![Rule::Algebraic {
            math: parse_formula("exp(x) - y / 2").unwrap(),
        }]);
        let rules = convert_algebraic_rules(&model).unwrap();
        assert_eq!(rules[0].variable, "y");
    }
}
