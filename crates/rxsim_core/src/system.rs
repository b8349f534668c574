use crate::algebraic::convert_algebraic_rules;
use crate::compiler::{
    compartment_size, truthy, DelayValueProvider, EvalCache, EvalContext, ExpressionGraph,
    GraphBuilder, NodeId, ReactionScope, Scaling, SymbolResolver, ValueRef,
};
use crate::error::{Result, SimulationError};
use crate::events::{
    CompiledEvent, EventBatch, EventRuntime, EventSelector, SeededSelector, TriggerContext,
};
use crate::model::{FunctionDefinition, Model, Rule};
use crate::symbols::{SymbolKind, SymbolTable};
use crate::trajectory::Trajectory;
use crate::traits::{DerivativeSystem, EventSystem};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;

/// Where an assigned value is written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    /// State slot. `scaling` converts the expression's quantity into the
    /// stored one.
    Slot { index: usize, scaling: Scaling },
    /// Compartment size set by an event; contained concentration species are
    /// rescaled so their amount is preserved.
    Compartment { index: usize },
    /// Coefficient of a species reference that has no state slot.
    Stoichiometry { reference: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct SpeciesInfo {
    index: usize,
    compartment: Option<usize>,
    /// Stored as concentration rather than amount.
    concentration: bool,
    only_substance_units: bool,
    boundary: bool,
    constant: bool,
    read: Scaling,
}

impl SpeciesInfo {
    fn in_concentration(&self) -> bool {
        self.concentration && !self.only_substance_units
    }
}

/// Symbol layout and initial values derived from the structural model.
#[derive(Debug, Clone)]
struct Layout {
    symbols: SymbolTable,
    species: HashMap<String, SpeciesInfo>,
    local_slots: HashMap<(usize, String), usize>,
    local_values: Vec<f64>,
    references: HashMap<String, usize>,
    reference_values: Vec<f64>,
    reactions: HashMap<String, usize>,
    y0: Vec<f64>,
}

/// Default quantity kind and substance-units flag for species that leave them
/// unset: whatever most species of the model use, amount on a tie.
fn majority(model: &Model) -> (bool, bool) {
    let amount = model
        .species
        .iter()
        .filter(|s| s.initial_amount.is_some())
        .count();
    let concentration = model
        .species
        .iter()
        .filter(|s| s.initial_amount.is_none() && s.initial_concentration.is_some())
        .count();
    let substance_units = model
        .species
        .iter()
        .filter(|s| s.has_only_substance_units == Some(true))
        .count();
    let total = model.species.len();
    (
        amount >= concentration,
        substance_units > total - substance_units,
    )
}

impl Layout {
    fn new(model: &Model) -> Self {
        let mut symbols = SymbolTable::new();
        let mut y0 = Vec::new();

        for c in &model.compartments {
            symbols.push(SymbolKind::Compartment, &c.id);
            y0.push(c.size.filter(|s| !s.is_nan()).unwrap_or(0.0));
        }

        let (default_amount, default_substance_units) = majority(model);
        let mut species = HashMap::new();
        for s in &model.species {
            let index = symbols.push(SymbolKind::Species, &s.id);
            let (concentration, value) = match (s.initial_amount, s.initial_concentration) {
                (Some(amount), _) => (false, amount),
                (None, Some(conc)) => (true, conc),
                (None, None) => (!default_amount, 0.0),
            };
            let only_substance_units = s
                .has_only_substance_units
                .unwrap_or(default_substance_units);
            let compartment = model.compartments.iter().position(|c| c.id == s.compartment);
            let spatial = compartment.map_or(0.0, |c| model.compartments[c].spatial_dimensions);
            let read = match compartment {
                Some(c) if spatial > 0.0 => match (concentration, only_substance_units) {
                    (false, false) => Scaling::DivideBySize(c),
                    (true, true) => Scaling::MultiplyBySize(c),
                    _ => Scaling::Identity,
                },
                _ => Scaling::Identity,
            };
            species.insert(
                s.id.clone(),
                SpeciesInfo {
                    index,
                    compartment,
                    concentration,
                    only_substance_units,
                    boundary: s.boundary_condition,
                    constant: s.constant,
                    read,
                },
            );
            y0.push(value);
        }

        let mut references = HashMap::new();
        let mut reference_values = Vec::new();
        let mut reaction_ids = HashMap::new();
        let mut local_slots = HashMap::new();
        let mut local_values = Vec::new();
        for (r, reaction) in model.reactions.iter().enumerate() {
            reaction_ids.insert(reaction.id.clone(), r);
            for sr in reaction.species_references() {
                if let Some(id) = &sr.id {
                    references.insert(id.clone(), reference_values.len());
                }
                reference_values.push(sr.stoichiometry);
            }
            if let Some(law) = &reaction.kinetic_law {
                for p in &law.local_parameters {
                    local_slots.insert((r, p.id.clone()), local_values.len());
                    local_values.push(p.value.unwrap_or(0.0));
                }
            }
        }

        // Species references driven by a rate rule get a state slot.
        for rule in &model.rules {
            if let Rule::Rate { variable, .. } = rule {
                let reference = model
                    .reactions
                    .iter()
                    .flat_map(|r| r.species_references())
                    .find(|sr| sr.id.as_deref() == Some(variable.as_str()) && !sr.constant);
                if let Some(sr) = reference {
                    if symbols.index_of(variable).is_none() {
                        symbols.push(SymbolKind::Stoichiometry, variable);
                        y0.push(sr.stoichiometry);
                    }
                }
            }
        }

        for p in &model.parameters {
            symbols.push(SymbolKind::Parameter, &p.id);
            y0.push(p.value.unwrap_or(0.0));
        }

        Self {
            symbols,
            species,
            local_slots,
            local_values,
            references,
            reference_values,
            reactions: reaction_ids,
            y0,
        }
    }

    fn target(&self, id: &str, for_event: bool) -> Option<Target> {
        if let Some(info) = self.species.get(id) {
            return Some(Target::Slot {
                index: info.index,
                scaling: info.read.inverse(),
            });
        }
        if let Some(index) = self.symbols.index_of(id) {
            if for_event && self.symbols.kind(index) == Some(SymbolKind::Compartment) {
                return Some(Target::Compartment { index });
            }
            return Some(Target::Slot {
                index,
                scaling: Scaling::Identity,
            });
        }
        self.references
            .get(id)
            .map(|reference| Target::Stoichiometry {
                reference: *reference,
            })
    }
}

struct Resolver<'a> {
    model: &'a Model,
    layout: &'a Layout,
}

impl SymbolResolver for Resolver<'_> {
    fn resolve(&self, name: &str, scope: Option<ReactionScope>) -> Option<ValueRef> {
        if let Some(scope) = scope {
            if let Some(slot) = self.layout.local_slots.get(&(scope.0, name.to_string())) {
                return Some(ValueRef::LocalParameter { scope, slot: *slot });
            }
        }
        if let Some(info) = self.layout.species.get(name) {
            return Some(ValueRef::Species {
                index: info.index,
                scaling: info.read,
            });
        }
        if let Some(index) = self.layout.symbols.index_of(name) {
            return Some(ValueRef::State(index));
        }
        if let Some(reference) = self.layout.references.get(name) {
            return Some(ValueRef::Stoichiometry(*reference));
        }
        self.layout
            .reactions
            .get(name)
            .map(|r| ValueRef::ReactionRate(*r))
    }

    fn state_identifier(&self, index: usize) -> Option<&str> {
        self.layout.symbols.identifier(index)
    }

    fn function(&self, name: &str) -> Option<&FunctionDefinition> {
        self.model.function_definitions.iter().find(|f| f.id == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CoefficientSource {
    Constant(f64),
    /// State slot of a rate-rule driven species reference.
    Slot(usize),
    /// Entry of the per-run stoichiometry table.
    Table(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct StoichiometryTerm {
    species: usize,
    reaction: usize,
    /// -1 for reactants, +1 for products.
    sign: f64,
    source: CoefficientSource,
    /// Compartment to divide by when the species is tracked as concentration.
    divide_by: Option<usize>,
}

#[derive(Debug, Clone)]
struct AssignmentRule {
    target: Target,
    math: NodeId,
}

#[derive(Debug, Clone)]
struct RateRule {
    index: usize,
    scaling: Scaling,
    /// Concentration species diluted by a changing compartment.
    dilute: Vec<usize>,
    math: NodeId,
}

/// Everything derived from the structural model. Immutable once built and
/// shared between forked runs.
#[derive(Debug)]
pub struct CompiledModel {
    graph: ExpressionGraph,
    layout: Layout,
    reaction_ids: Vec<String>,
    reaction_fast: Vec<bool>,
    has_fast: bool,
    terms: Vec<StoichiometryTerm>,
    stoichiometry_math: Vec<(usize, NodeId)>,
    rate_rules: Vec<RateRule>,
    assignment_rules: Vec<AssignmentRule>,
    initial_assignments: Vec<(Target, NodeId)>,
    constraints: Vec<NodeId>,
    events: Vec<CompiledEvent>,
    /// Concentration species of every compartment, by compartment index.
    compartment_species: Vec<Vec<usize>>,
}

impl CompiledModel {
    fn build(model: &Model) -> Result<Self> {
        let layout = Layout::new(model);
        let resolver = Resolver {
            model,
            layout: &layout,
        };
        let mut builder = GraphBuilder::new(&resolver);

        let mut kinetic_laws = Vec::with_capacity(model.reactions.len());
        let mut terms = Vec::new();
        let mut stoichiometry_math = Vec::new();
        let mut ordinal = 0;
        for (r, reaction) in model.reactions.iter().enumerate() {
            let scope = Some(ReactionScope(r));
            kinetic_laws.push(match &reaction.kinetic_law {
                Some(law) => Some(builder.compile(&law.math, scope)?),
                None => None,
            });

            let signed = reaction
                .reactants
                .iter()
                .map(|sr| (-1.0, sr))
                .chain(reaction.products.iter().map(|sr| (1.0, sr)));
            for (sign, sr) in signed {
                let reference = ordinal;
                ordinal += 1;
                let slot = sr
                    .id
                    .as_deref()
                    .and_then(|id| layout.symbols.index_of(id))
                    .filter(|i| layout.symbols.kind(*i) == Some(SymbolKind::Stoichiometry));
                let source = if let Some(slot) = slot {
                    CoefficientSource::Slot(slot)
                } else if let Some(math) = &sr.stoichiometry_math {
                    stoichiometry_math.push((reference, builder.compile(math, scope)?));
                    CoefficientSource::Table(reference)
                } else if sr.id.is_some() {
                    CoefficientSource::Table(reference)
                } else {
                    CoefficientSource::Constant(sr.stoichiometry)
                };
                let Some(info) = layout.species.get(&sr.species) else {
                    warn!(
                        "reaction '{}' references unknown species '{}'",
                        reaction.id, sr.species
                    );
                    continue;
                };
                if info.boundary || info.constant {
                    continue;
                }
                terms.push(StoichiometryTerm {
                    species: info.index,
                    reaction: r,
                    sign,
                    source,
                    divide_by: info.compartment.filter(|_| info.in_concentration()),
                });
            }
        }

        let mut compartment_species = vec![Vec::new(); model.compartments.len()];
        for info in layout.species.values() {
            if let (Some(c), true) = (info.compartment, info.concentration) {
                compartment_species[c].push(info.index);
            }
        }
        compartment_species.iter_mut().for_each(|s| s.sort_unstable());

        let mut rate_rules = Vec::new();
        let mut assignment_rules = Vec::new();
        for rule in &model.rules {
            match rule {
                Rule::Assignment { variable, math } => {
                    let target = layout
                        .target(variable, false)
                        .ok_or_else(|| unknown_symbol(variable))?;
                    assignment_rules.push(AssignmentRule {
                        target,
                        math: builder.compile(math, None)?,
                    });
                }
                Rule::Rate { variable, math } => {
                    let index = layout
                        .symbols
                        .index_of(variable)
                        .ok_or_else(|| unknown_symbol(variable))?;
                    let scaling = layout
                        .species
                        .get(variable)
                        .map_or(Scaling::Identity, |info| info.read.inverse());
                    let dilute = match layout.symbols.kind(index) {
                        Some(SymbolKind::Compartment) => compartment_species[index].clone(),
                        _ => Vec::new(),
                    };
                    rate_rules.push(RateRule {
                        index,
                        scaling,
                        dilute,
                        math: builder.compile(math, None)?,
                    });
                }
                Rule::Algebraic { .. } => {}
            }
        }
        for rule in &convert_algebraic_rules(model)? {
            let target = layout
                .target(&rule.variable, false)
                .ok_or_else(|| unknown_symbol(&rule.variable))?;
            assignment_rules.push(AssignmentRule {
                target,
                math: builder.compile(&rule.math, None)?,
            });
        }

        let mut initial_assignments = Vec::new();
        for ia in &model.initial_assignments {
            match layout.target(&ia.symbol, false) {
                Some(target) => {
                    initial_assignments.push((target, builder.compile(&ia.math, None)?))
                }
                None => warn!(
                    "initial assignment for '{}' does not target a compartment, species, parameter or species reference",
                    ia.symbol
                ),
            }
        }

        let mut constraints = Vec::with_capacity(model.constraints.len());
        for constraint in &model.constraints {
            constraints.push(builder.compile(&constraint.math, None)?);
        }

        let mut events = Vec::with_capacity(model.events.len());
        for event in &model.events {
            let mut assignments = Vec::with_capacity(event.assignments.len());
            for a in &event.assignments {
                let target = layout
                    .target(&a.variable, true)
                    .ok_or_else(|| unknown_symbol(&a.variable))?;
                assignments.push((target, builder.compile(&a.math, None)?));
            }
            events.push(CompiledEvent {
                id: event.id.clone(),
                trigger: builder.compile(&event.trigger, None)?,
                delay: event.delay.as_ref().map(|d| builder.compile(d, None)).transpose()?,
                priority: event
                    .priority
                    .as_ref()
                    .map(|p| builder.compile(p, None))
                    .transpose()?,
                persistent: event.persistent,
                use_values_from_trigger_time: event.use_values_from_trigger_time,
                assignments,
            });
        }

        let mut graph = builder.finish();
        graph.set_kinetic_laws(kinetic_laws);
        let reaction_fast: Vec<bool> = model.reactions.iter().map(|r| r.fast).collect();

        Ok(Self {
            graph,
            reaction_ids: model.reactions.iter().map(|r| r.id.clone()).collect(),
            has_fast: reaction_fast.iter().any(|f| *f),
            reaction_fast,
            terms,
            stoichiometry_math,
            rate_rules,
            assignment_rules,
            initial_assignments,
            constraints,
            events,
            compartment_species,
            layout,
        })
    }

    pub fn graph(&self) -> &ExpressionGraph {
        &self.graph
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.layout.symbols
    }
}

/// Per-run mutable state: the working copy of Y plus everything that is
/// evaluated against it.
#[derive(Debug, Clone)]
struct RunState {
    time: f64,
    stamp: u64,
    y: Vec<f64>,
    local_parameters: Vec<f64>,
    stoichiometry: Vec<f64>,
    cache: EvalCache,
}

impl RunState {
    fn new(y: Vec<f64>, local_parameters: Vec<f64>, stoichiometry: Vec<f64>, nodes: usize) -> Self {
        Self {
            time: 0.0,
            stamp: 1,
            y,
            local_parameters,
            stoichiometry,
            cache: EvalCache::new(nodes),
        }
    }

    /// Invalidates every cached node value.
    fn touch(&mut self) {
        self.stamp += 1;
    }

    fn set_state(&mut self, t: f64, y: &[f64]) {
        self.time = t;
        self.y.copy_from_slice(y);
        self.touch();
    }

    fn eval(
        &mut self,
        graph: &ExpressionGraph,
        delay: Option<&dyn DelayValueProvider>,
        node: NodeId,
    ) -> Result<f64> {
        let ctx = EvalContext {
            time: self.time,
            stamp: self.stamp,
            state: &self.y,
            local_parameters: &self.local_parameters,
            stoichiometry: &self.stoichiometry,
            delay,
        };
        graph.evaluate(node, &ctx, &mut self.cache)
    }

    /// Converts an expression value into what `target` stores.
    fn stored_value(&self, target: &Target, value: f64) -> f64 {
        match target {
            Target::Slot { scaling, .. } => scaling.apply(value, &self.y),
            _ => value,
        }
    }

    /// Writes a stored value; returns the changed state slot, if any.
    fn store(&mut self, target: &Target, value: f64) -> Option<(usize, f64)> {
        let changed = match *target {
            Target::Slot { index, .. } | Target::Compartment { index } => {
                self.y[index] = value;
                Some((index, value))
            }
            Target::Stoichiometry { reference } => {
                self.stoichiometry[reference] = value;
                None
            }
        };
        self.touch();
        changed
    }
}

struct Evaluation<'s> {
    graph: &'s ExpressionGraph,
    run: &'s mut RunState,
    delay: Option<&'s dyn DelayValueProvider>,
}

impl TriggerContext for Evaluation<'_> {
    fn evaluate(&mut self, node: NodeId) -> Result<f64> {
        self.run.eval(self.graph, self.delay, node)
    }

    fn assignment_value(&mut self, target: &Target, node: NodeId) -> Result<f64> {
        let value = self.evaluate(node)?;
        Ok(self.run.stored_value(target, value))
    }
}

enum DelaySource {
    None,
    External(Arc<dyn DelayValueProvider + Send + Sync>),
    History(Trajectory),
}

impl DelaySource {
    fn provider(&self) -> Option<&dyn DelayValueProvider> {
        match self {
            DelaySource::None => None,
            DelaySource::External(provider) => Some(&**provider),
            DelaySource::History(history) => Some(history),
        }
    }

    fn fork(&self) -> Self {
        match self {
            DelaySource::None => DelaySource::None,
            DelaySource::External(provider) => DelaySource::External(Arc::clone(provider)),
            DelaySource::History(history) => {
                DelaySource::History(Trajectory::new(history.identifiers().to_vec()))
            }
        }
    }
}

fn unknown_symbol(id: &str) -> SimulationError {
    SimulationError::UnknownSymbol(id.to_string())
}

fn selector(seed: Option<u64>) -> Box<dyn EventSelector> {
    match seed {
        Some(seed) => Box::new(SeededSelector::new(seed)),
        None => Box::new(SeededSelector::from_entropy()),
    }
}

/// A reaction-network model compiled into a differential-equation system.
pub struct ReactionSystem {
    source: Arc<Model>,
    model: Arc<CompiledModel>,
    run: RunState,
    velocities: Vec<f64>,
    events: EventRuntime,
    constraint_violations: Vec<Vec<f64>>,
    initial_violations: Vec<Vec<f64>>,
    fast_pass: bool,
    /// Time the fast pass is frozen at.
    fast_time: f64,
    delay: DelaySource,
    initial_values: Vec<f64>,
    initial_stoichiometry: Vec<f64>,
    seed: Option<u64>,
}

impl std::fmt::Debug for ReactionSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactionSystem")
            .field("model", &self.source.id)
            .field("dimension", &self.run.y.len())
            .field("time", &self.run.time)
            .finish_non_exhaustive()
    }
}

impl ReactionSystem {
    /// Initializes the system. Event ties are broken with entropy-seeded
    /// randomness.
    pub fn new(model: Model) -> Result<Self> {
        Self::with_seed(model, None)
    }

    pub fn with_seed(model: Model, seed: Option<u64>) -> Result<Self> {
        Self::build(Arc::new(model), seed, DelaySource::None)
    }

    fn build(source: Arc<Model>, seed: Option<u64>, delay: DelaySource) -> Result<Self> {
        let model = Arc::new(CompiledModel::build(&source)?);
        let layout = &model.layout;
        let run = RunState::new(
            layout.y0.clone(),
            layout.local_values.clone(),
            layout.reference_values.clone(),
            model.graph.len(),
        );
        let mut system = Self {
            velocities: vec![0.0; model.reaction_ids.len()],
            events: EventRuntime::new(model.events.len(), selector(seed)),
            constraint_violations: vec![Vec::new(); model.constraints.len()],
            initial_violations: Vec::new(),
            fast_pass: false,
            fast_time: 0.0,
            delay,
            initial_values: Vec::new(),
            initial_stoichiometry: Vec::new(),
            seed,
            run,
            source,
            model,
        };

        system.apply_initial_assignments()?;
        system.check_constraints(0.0)?;
        system.apply_assignment_rules()?;
        // Rules may read initial-assignment results and the other way round.
        system.apply_initial_assignments()?;

        system.initial_values = system.run.y.clone();
        system.initial_stoichiometry = system.run.stoichiometry.clone();
        system.initial_violations = system.constraint_violations.clone();
        info!(
            "initialized model '{}': {} state variables, {} reactions, {} rules, {} events",
            system.source.id,
            system.run.y.len(),
            system.model.reaction_ids.len(),
            system.model.rate_rules.len() + system.model.assignment_rules.len(),
            system.model.events.len()
        );
        Ok(system)
    }

    fn apply_initial_assignments(&mut self) -> Result<()> {
        let model = Arc::clone(&self.model);
        for (target, node) in &model.initial_assignments {
            let value = self.run.eval(&model.graph, self.delay.provider(), *node)?;
            let stored = self.run.stored_value(target, value);
            self.run.store(target, stored);
        }
        Ok(())
    }

    fn apply_assignment_rules(&mut self) -> Result<Vec<(usize, f64)>> {
        let model = Arc::clone(&self.model);
        let mut updates = Vec::new();
        for rule in &model.assignment_rules {
            let value = self.run.eval(&model.graph, self.delay.provider(), rule.math)?;
            let stored = self.run.stored_value(&rule.target, value);
            if let Some(change) = self.run.store(&rule.target, stored) {
                updates.push(change);
            }
        }
        Ok(updates)
    }

    fn check_constraints(&mut self, t: f64) -> Result<()> {
        let model = Arc::clone(&self.model);
        for (i, node) in model.constraints.iter().enumerate() {
            let holds = truthy(self.run.eval(&model.graph, self.delay.provider(), *node)?);
            let log = &mut self.constraint_violations[i];
            if holds && log.last() != Some(&t) {
                log.push(t);
            }
        }
        Ok(())
    }

    /// Computes dY/dt at (t, Y) into `change_rate`. During the fast pass only
    /// fast reactions contribute and `t` is replaced by the frozen time.
    pub fn compute_derivatives(
        &mut self,
        t: f64,
        y: &[f64],
        change_rate: &mut [f64],
    ) -> Result<()> {
        let dimension = self.run.y.len();
        if y.len() != dimension {
            return Err(SimulationError::DimensionMismatch {
                expected: dimension,
                got: y.len(),
                what: "state vector",
            });
        }
        if change_rate.len() != dimension {
            return Err(SimulationError::DimensionMismatch {
                expected: dimension,
                got: change_rate.len(),
                what: "change rate buffer",
            });
        }
        let t = if self.fast_pass { self.fast_time } else { t };
        let model = Arc::clone(&self.model);
        let graph = &model.graph;
        self.run.set_state(t, y);
        change_rate.fill(0.0);

        for (reference, node) in &model.stoichiometry_math {
            let value = self.run.eval(graph, self.delay.provider(), *node)?;
            self.run.stoichiometry[*reference] = value;
        }

        let rate_rules = if self.fast_pass {
            &[][..]
        } else {
            &model.rate_rules[..]
        };
        for rule in rate_rules {
            let value = self.run.eval(graph, self.delay.provider(), rule.math)?;
            change_rate[rule.index] += rule.scaling.apply(value, &self.run.y);
        }
        for rule in rate_rules.iter().filter(|r| !r.dilute.is_empty()) {
            let size = compartment_size(&self.run.y, rule.index);
            let rate = change_rate[rule.index];
            for &s in &rule.dilute {
                change_rate[s] -= rate * self.run.y[s] / size;
            }
        }

        self.apply_assignment_rules()?;

        for r in 0..self.velocities.len() {
            let active = !model.has_fast || model.reaction_fast[r] == self.fast_pass;
            self.velocities[r] = match graph.kinetic_law(r) {
                Some(law) if active => self.run.eval(graph, self.delay.provider(), law)?,
                _ => 0.0,
            };
        }

        for term in &model.terms {
            let coefficient = match term.source {
                CoefficientSource::Constant(c) => c,
                CoefficientSource::Slot(i) => self.run.y[i],
                CoefficientSource::Table(i) => self.run.stoichiometry[i],
            };
            let mut delta = term.sign * coefficient * self.velocities[term.reaction];
            if let Some(c) = term.divide_by {
                delta /= compartment_size(&self.run.y, c);
            }
            change_rate[term.species] += delta;
        }

        if self.fast_pass {
            return Ok(());
        }
        self.check_constraints(t)
    }

    /// Velocities of the last derivative evaluation, in reaction order.
    pub fn reaction_velocities(&self) -> &[f64] {
        &self.velocities
    }

    pub fn reaction_ids(&self) -> &[String] {
        &self.model.reaction_ids
    }

    pub fn initial_values(&self) -> &[f64] {
        &self.initial_values
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.model.layout.symbols
    }

    pub fn compiled(&self) -> &CompiledModel {
        &self.model
    }

    pub fn model(&self) -> &Model {
        &self.source
    }

    /// Times at which each constraint evaluated to true.
    pub fn constraint_violations(&self) -> &[Vec<f64>] {
        &self.constraint_violations
    }

    /// Number of values `set_parameters` expects: global parameters followed
    /// by the local parameters of every reaction.
    pub fn parameter_count(&self) -> usize {
        self.source.parameters.len() + self.run.local_parameters.len()
    }

    /// Overwrites global then reaction-local parameter values. Models with
    /// initial assignments or events are re-initialized from scratch.
    pub fn set_parameters(&mut self, values: &[f64]) -> Result<()> {
        let expected = self.parameter_count();
        if values.len() != expected {
            return Err(SimulationError::DimensionMismatch {
                expected,
                got: values.len(),
                what: "parameter vector",
            });
        }
        let globals = self.source.parameters.len();

        if !self.source.initial_assignments.is_empty() || !self.source.events.is_empty() {
            let mut model = (*self.source).clone();
            for (p, v) in model.parameters.iter_mut().zip(values) {
                p.value = Some(*v);
            }
            let mut locals = values[globals..].iter();
            for law in model.reactions.iter_mut().filter_map(|r| r.kinetic_law.as_mut()) {
                for (p, v) in law.local_parameters.iter_mut().zip(locals.by_ref()) {
                    p.value = Some(*v);
                }
            }
            let rebuilt = Self::build(Arc::new(model), self.seed, self.delay.fork())?;
            let previous = std::mem::replace(self, rebuilt);
            self.events.set_selector(previous.events.into_selector());
            return Ok(());
        }

        let source = Arc::clone(&self.source);
        for (p, v) in source.parameters.iter().zip(values) {
            if let Some(i) = self.model.layout.symbols.index_of(&p.id) {
                self.initial_values[i] = *v;
            }
        }
        self.run.local_parameters.copy_from_slice(&values[globals..]);
        self.run.y.copy_from_slice(&self.initial_values);
        self.run.touch();
        self.apply_assignment_rules()?;
        self.initial_values.copy_from_slice(&self.run.y);
        Ok(())
    }

    /// Routes `delay(x, d)` lookups to an external provider.
    pub fn register_delay_provider(
        &mut self,
        provider: Arc<dyn DelayValueProvider + Send + Sync>,
    ) {
        self.delay = DelaySource::External(provider);
        self.run.touch();
    }

    /// Records every committed sample and answers delay lookups from that
    /// history, unless an external provider is registered.
    pub fn record_delay_history(&mut self) {
        if matches!(self.delay, DelaySource::None) {
            let identifiers = self.symbols().identifiers().to_vec();
            self.delay = DelaySource::History(Trajectory::new(identifiers));
        }
    }

    pub fn uses_delays(&self) -> bool {
        self.model.graph.contains_delay()
    }

    /// Replaces the tie-break source for simultaneous events.
    pub fn set_event_selector(&mut self, selector: Box<dyn EventSelector>) {
        self.events.set_selector(selector);
    }

    /// Independent run over the same compiled model, starting from the
    /// initial values. Evaluation caches, event state and constraint logs are
    /// not shared.
    pub fn fork(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            model: Arc::clone(&self.model),
            run: RunState::new(
                self.initial_values.clone(),
                self.run.local_parameters.clone(),
                self.initial_stoichiometry.clone(),
                self.model.graph.len(),
            ),
            velocities: vec![0.0; self.velocities.len()],
            events: EventRuntime::new(self.model.events.len(), selector(self.seed)),
            constraint_violations: self.initial_violations.clone(),
            initial_violations: self.initial_violations.clone(),
            fast_pass: false,
            fast_time: 0.0,
            delay: self.delay.fork(),
            initial_values: self.initial_values.clone(),
            initial_stoichiometry: self.initial_stoichiometry.clone(),
            seed: self.seed,
        }
    }

    /// Returns to the state right after initialization.
    pub fn reset(&mut self) {
        *self = self.fork();
    }
}

impl DerivativeSystem for ReactionSystem {
    fn dimension(&self) -> usize {
        self.run.y.len()
    }

    fn evaluate(&mut self, t: f64, y: &[f64], out: &mut [f64]) -> Result<()> {
        self.compute_derivatives(t, y, out)
    }

    fn identifiers(&self) -> Vec<String> {
        self.symbols().identifiers().to_vec()
    }

    fn auxiliary_ids(&self) -> Vec<String> {
        self.model.reaction_ids.clone()
    }

    fn auxiliary_values(&mut self, t: f64, y: &[f64]) -> Result<Vec<f64>> {
        let mut scratch = vec![0.0; y.len()];
        self.compute_derivatives(t, y, &mut scratch)?;
        Ok(self.velocities.clone())
    }

    fn has_fast_processes(&self) -> bool {
        self.model.has_fast
    }

    fn set_fast_process_computation(&mut self, fast: bool, t: f64) {
        self.fast_pass = fast;
        self.fast_time = t;
    }

    fn accept_step(&mut self, t: f64, y: &[f64]) {
        if self.fast_pass {
            return;
        }
        if let DelaySource::History(history) = &mut self.delay {
            history.push(t, y.to_vec());
        }
    }
}

impl EventSystem for ReactionSystem {
    fn has_events_or_rules(&self) -> bool {
        !self.source.rules.is_empty() || !self.model.events.is_empty()
    }

    fn event_assignments(
        &mut self,
        t: f64,
        previous_t: f64,
        y: &[f64],
    ) -> Result<Option<EventBatch>> {
        if self.model.events.is_empty() {
            return Ok(None);
        }
        let model = Arc::clone(&self.model);
        self.run.set_state(t, y);
        let selection = {
            let mut ctx = Evaluation {
                graph: &model.graph,
                run: &mut self.run,
                delay: self.delay.provider(),
            };
            self.events.next_batch(&model.events, t, previous_t, &mut ctx)?
        };
        let Some(selection) = selection else {
            return Ok(None);
        };

        let event = &model.events[selection.event];
        let mut assignments = Vec::new();
        for ((target, _), value) in event.assignments.iter().zip(selection.values) {
            if let Target::Compartment { index } = *target {
                let old = self.run.y[index];
                if old != 0.0 && value != 0.0 {
                    for &s in &model.compartment_species[index] {
                        let rescaled = self.run.y[s] * old / value;
                        self.run.y[s] = rescaled;
                        assignments.push((s, rescaled));
                    }
                }
            }
            if let Some(change) = self.run.store(target, value) {
                assignments.push(change);
            }
        }
        Ok(Some(EventBatch {
            event_id: event.id.clone(),
            time: t,
            assignments,
        }))
    }

    fn assignment_rule_updates(&mut self, t: f64, y: &[f64]) -> Result<Vec<(usize, f64)>> {
        self.run.set_state(t, y);
        self.apply_assignment_rules()
    }

    fn next_event_time(&self, after: f64) -> Option<f64> {
        self.events.next_scheduled_time(after)
    }

    fn record_sample(&mut self, t: f64, y: &[f64]) {
        if let DelaySource::History(history) = &mut self.delay {
            history.push(t, y.to_vec());
        }
    }
}
