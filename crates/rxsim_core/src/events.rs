use crate::compiler::{truthy, NodeId};
use crate::error::Result;
use crate::system::Target;
use log::debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Event with its expressions compiled into the model graph.
#[derive(Debug, Clone)]
pub struct CompiledEvent {
    pub id: String,
    pub trigger: NodeId,
    pub delay: Option<NodeId>,
    pub priority: Option<NodeId>,
    pub persistent: bool,
    pub use_values_from_trigger_time: bool,
    pub assignments: Vec<(Target, NodeId)>,
}

/// State changes produced by executing one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub event_id: String,
    pub time: f64,
    /// New values of state-vector slots, in application order.
    pub assignments: Vec<(usize, f64)>,
}

/// Event picked for execution and the values of its assignments.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub event: usize,
    pub values: Vec<f64>,
}

/// Evaluation access the runtime needs from the owning system.
pub trait TriggerContext {
    fn evaluate(&mut self, node: NodeId) -> Result<f64>;

    /// Value of an assignment right-hand side, converted to the quantity the
    /// target slot stores.
    fn assignment_value(&mut self, target: &Target, node: NodeId) -> Result<f64>;
}

/// Picks one event out of equally ranked candidates.
pub trait EventSelector: Send {
    /// Returns an index in `0..candidates`.
    fn choose(&mut self, candidates: usize) -> usize;
}

/// Uniform choice driven by a seedable small RNG.
pub struct SeededSelector {
    rng: SmallRng,
}

impl SeededSelector {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: SmallRng::from_entropy(),
        }
    }
}

impl EventSelector for SeededSelector {
    fn choose(&mut self, candidates: usize) -> usize {
        if candidates <= 1 {
            0
        } else {
            self.rng.gen_range(0..candidates)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PendingExecution {
    time: f64,
    fired_at: f64,
    values: Option<Vec<f64>>,
}

#[derive(Debug, Clone)]
struct EventState {
    /// Trigger was true at the last check. Starts true so a trigger that holds
    /// at the start of the simulation does not fire.
    fired: bool,
    last_fired: f64,
    /// Scheduled executions ordered by time.
    pending: Vec<PendingExecution>,
    priority: f64,
}

impl EventState {
    fn new() -> Self {
        Self {
            fired: true,
            last_fired: f64::NEG_INFINITY,
            pending: Vec::new(),
            priority: f64::NEG_INFINITY,
        }
    }

    fn schedule(&mut self, execution: PendingExecution) {
        let at = self
            .pending
            .iter()
            .position(|p| p.time > execution.time)
            .unwrap_or(self.pending.len());
        self.pending.insert(at, execution);
    }

    fn is_due(&self, t: f64) -> bool {
        self.pending.first().is_some_and(|p| p.time <= t)
    }
}

/// Per-run state machine of all events of a model.
pub struct EventRuntime {
    states: Vec<EventState>,
    selector: Box<dyn EventSelector>,
}

impl std::fmt::Debug for EventRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRuntime")
            .field("states", &self.states)
            .finish_non_exhaustive()
    }
}

impl EventRuntime {
    pub fn new(count: usize, selector: Box<dyn EventSelector>) -> Self {
        Self {
            states: (0..count).map(|_| EventState::new()).collect(),
            selector,
        }
    }

    pub fn set_selector(&mut self, selector: Box<dyn EventSelector>) {
        self.selector = selector;
    }

    /// Gives back the tie-break source, for a rebuilt runtime to take over.
    pub fn into_selector(self) -> Box<dyn EventSelector> {
        self.selector
    }

    /// Earliest scheduled execution strictly after `after`.
    pub fn next_scheduled_time(&self, after: f64) -> Option<f64> {
        self.states
            .iter()
            .flat_map(|s| s.pending.iter().map(|p| p.time))
            .filter(|time| *time > after)
            .min_by(f64::total_cmp)
    }

    /// Advances the event state machine to time `t` and executes at most one
    /// ready event. Callers repeat until `None` before moving time forward.
    pub fn next_batch(
        &mut self,
        events: &[CompiledEvent],
        t: f64,
        previous_t: f64,
        ctx: &mut dyn TriggerContext,
    ) -> Result<Option<Selection>> {
        if events.is_empty() {
            return Ok(None);
        }

        // Scheduled executions: rewind and abort.
        for (event, state) in events.iter().zip(self.states.iter_mut()) {
            if state.pending.is_empty() {
                continue;
            }
            state.pending.retain(|p| p.fired_at <= t);
            if state.last_fired > t {
                state.last_fired = previous_t.min(t);
            }
            if !event.persistent && !truthy(ctx.evaluate(event.trigger)?) {
                debug!("event '{}' aborted at t = {t}", event.id);
                state.pending.clear();
            }
        }

        // Trigger transitions.
        for (event, state) in events.iter().zip(self.states.iter_mut()) {
            let value = truthy(ctx.evaluate(event.trigger)?);
            if value && !state.fired {
                state.fired = true;
                state.last_fired = t;
                let time = match event.delay {
                    Some(delay) => t + ctx.evaluate(delay)?,
                    None => t,
                };
                let values = if event.use_values_from_trigger_time {
                    let mut values = Vec::with_capacity(event.assignments.len());
                    for (target, node) in &event.assignments {
                        values.push(ctx.assignment_value(target, *node)?);
                    }
                    Some(values)
                } else {
                    None
                };
                debug!("event '{}' triggered at t = {t}, executes at {time}", event.id);
                state.schedule(PendingExecution {
                    time,
                    fired_at: t,
                    values,
                });
            } else if !value && state.fired {
                state.fired = false;
            }
        }

        // Ready set and priorities.
        let mut ready = Vec::new();
        for (index, (event, state)) in events.iter().zip(self.states.iter_mut()).enumerate() {
            if !state.is_due(t) {
                continue;
            }
            state.priority = match event.priority {
                Some(node) => {
                    let p = ctx.evaluate(node)?;
                    if p.is_nan() {
                        f64::NEG_INFINITY
                    } else {
                        p
                    }
                }
                None => f64::NEG_INFINITY,
            };
            ready.push(index);
        }
        if ready.is_empty() {
            return Ok(None);
        }

        let highest = ready
            .iter()
            .map(|i| self.states[*i].priority)
            .fold(f64::NEG_INFINITY, f64::max);
        let tied: Vec<usize> = ready
            .into_iter()
            .filter(|i| self.states[*i].priority == highest)
            .collect();
        let chosen = tied[self.selector.choose(tied.len()).min(tied.len() - 1)];

        let event = &events[chosen];
        let state = &mut self.states[chosen];
        let execution = state.pending.remove(0);
        let values = match execution.values {
            Some(values) => values,
            None => {
                let mut values = Vec::with_capacity(event.assignments.len());
                for (target, node) in &event.assignments {
                    values.push(ctx.assignment_value(target, *node)?);
                }
                values
            }
        };
        debug!("event '{}' executed at t = {t}", event.id);
        Ok(Some(Selection {
            event: chosen,
            values,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{
        EvalCache, EvalContext, ExpressionGraph, GraphBuilder, ReactionScope, Scaling,
        SymbolResolver, ValueRef,
    };
    use crate::math::parse_formula;
    use crate::model::FunctionDefinition;

    struct Names;

    impl SymbolResolver for Names {
        fn resolve(&self, name: &str, _scope: Option<ReactionScope>) -> Option<ValueRef> {
            match name {
                "x" => Some(ValueRef::State(0)),
                "p" => Some(ValueRef::State(1)),
                _ => None,
            }
        }

        fn function(&self, _name: &str) -> Option<&FunctionDefinition> {
            None
        }
    }

    struct Harness {
        graph: ExpressionGraph,
        cache: EvalCache,
        state: Vec<f64>,
        time: f64,
        stamp: u64,
    }

    impl TriggerContext for Harness {
        fn evaluate(&mut self, node: NodeId) -> Result<f64> {
            let ctx = EvalContext {
                time: self.time,
                stamp: self.stamp,
                state: &self.state,
                local_parameters: &[],
                stoichiometry: &[],
                delay: None,
            };
            self.graph.evaluate(node, &ctx, &mut self.cache)
        }

        fn assignment_value(&mut self, _target: &Target, node: NodeId) -> Result<f64> {
            self.evaluate(node)
        }
    }

    fn event(
        builder: &mut GraphBuilder,
        id: &str,
        trigger: &str,
        delay: Option<&str>,
        priority: Option<&str>,
        value: &str,
    ) -> CompiledEvent {
        let mut compile = |f: &str| builder.compile(&parse_formula(f).unwrap(), None).unwrap();
        CompiledEvent {
            id: id.to_string(),
            trigger: compile(trigger),
            delay: delay.map(&mut compile),
            priority: priority.map(&mut compile),
            persistent: true,
            use_values_from_trigger_time: true,
            assignments: vec![(
                Target::Slot {
                    index: 0,
                    scaling: Scaling::Identity,
                },
                compile(value),
            )],
        }
    }

    fn harness(graph: ExpressionGraph, state: Vec<f64>) -> Harness {
        let cache = EvalCache::new(graph.len());
        Harness {
            graph,
            cache,
            state,
            time: 0.0,
            stamp: 0,
        }
    }

    fn step(
        runtime: &mut EventRuntime,
        events: &[CompiledEvent],
        h: &mut Harness,
        t: f64,
        previous: f64,
    ) -> Option<Selection> {
        h.time = t;
        h.stamp += 1;
        runtime.next_batch(events, t, previous, h).unwrap()
    }

    #[test]
    fn trigger_true_at_start_does_not_fire_until_a_new_rising_edge() {
        let mut builder = GraphBuilder::new(&Names);
        let events = vec![event(&mut builder, "e", "x < 5", None, None, "10")];
        let mut h = harness(builder.finish(), vec![0.0, 0.0]);
        let mut runtime = EventRuntime::new(1, Box::new(SeededSelector::new(1)));

        assert!(step(&mut runtime, &events, &mut h, 0.0, 0.0).is_none());
        assert!(step(&mut runtime, &events, &mut h, 1.0, 0.0).is_none());
        h.state[0] = 6.0;
        assert!(step(&mut runtime, &events, &mut h, 2.0, 1.0).is_none());
        h.state[0] = 1.0;
        let fired = step(&mut runtime, &events, &mut h, 3.0, 2.0).expect("rising edge fires");
        assert_eq!(fired.values, vec![10.0]);
        assert!(step(&mut runtime, &events, &mut h, 3.0, 3.0).is_none());
    }

    #[test]
    fn delayed_event_executes_at_trigger_time_plus_delay() {
        let mut builder = GraphBuilder::new(&Names);
        let events = vec![event(&mut builder, "e", "time >= 2", Some("3"), None, "time")];
        let mut h = harness(builder.finish(), vec![0.0, 0.0]);
        let mut runtime = EventRuntime::new(1, Box::new(SeededSelector::new(1)));

        assert!(step(&mut runtime, &events, &mut h, 0.0, 0.0).is_none());
        assert!(step(&mut runtime, &events, &mut h, 2.0, 0.0).is_none());
        assert_eq!(runtime.next_scheduled_time(2.0), Some(5.0));
        assert!(step(&mut runtime, &events, &mut h, 4.5, 2.0).is_none());
        let fired = step(&mut runtime, &events, &mut h, 5.0, 4.5).expect("due at 5");
        // value captured at trigger time
        assert_eq!(fired.values, vec![2.0]);
        assert_eq!(runtime.next_scheduled_time(f64::NEG_INFINITY), None);
    }

    #[test]
    fn non_persistent_event_is_aborted_when_trigger_falls() {
        let mut builder = GraphBuilder::new(&Names);
        let mut e = event(&mut builder, "e", "x > 1", Some("2"), None, "0");
        e.persistent = false;
        let events = vec![e];
        let mut h = harness(builder.finish(), vec![0.0, 0.0]);
        let mut runtime = EventRuntime::new(1, Box::new(SeededSelector::new(1)));

        step(&mut runtime, &events, &mut h, 0.0, 0.0);
        h.state[0] = 2.0;
        assert!(step(&mut runtime, &events, &mut h, 1.0, 0.0).is_none());
        assert_eq!(runtime.next_scheduled_time(1.0), Some(3.0));
        h.state[0] = 0.0;
        assert!(step(&mut runtime, &events, &mut h, 2.0, 1.0).is_none());
        assert_eq!(runtime.next_scheduled_time(2.0), None);
        assert!(step(&mut runtime, &events, &mut h, 3.0, 2.0).is_none());
    }

    #[test]
    fn highest_priority_runs_first_and_all_ready_events_drain() {
        let mut builder = GraphBuilder::new(&Names);
        let events = vec![
            event(&mut builder, "low", "time > 0.5", None, Some("1"), "1"),
            event(&mut builder, "high", "time > 0.5", None, Some("p"), "2"),
        ];
        let mut h = harness(builder.finish(), vec![0.0, 5.0]);
        let mut runtime = EventRuntime::new(2, Box::new(SeededSelector::new(3)));

        step(&mut runtime, &events, &mut h, 0.0, 0.0);
        let first = step(&mut runtime, &events, &mut h, 1.0, 0.0).unwrap();
        assert_eq!(first.event, 1);
        let second = step(&mut runtime, &events, &mut h, 1.0, 1.0).unwrap();
        assert_eq!(second.event, 0);
        assert!(step(&mut runtime, &events, &mut h, 1.0, 1.0).is_none());
    }

    #[test]
    fn ties_are_broken_within_the_maximal_set_reproducibly() {
        let run = |seed: u64| {
            let mut builder = GraphBuilder::new(&Names);
            let events = vec![
                event(&mut builder, "a", "time > 0.5", None, Some("2"), "1"),
                event(&mut builder, "b", "time > 0.5", None, Some("1"), "2"),
                event(&mut builder, "c", "time > 0.5", None, Some("2"), "3"),
                event(&mut builder, "d", "time > 0.5", None, Some("2"), "4"),
            ];
            let mut h = harness(builder.finish(), vec![0.0, 0.0]);
            let mut runtime = EventRuntime::new(4, Box::new(SeededSelector::new(seed)));
            step(&mut runtime, &events, &mut h, 0.0, 0.0);
            let mut order = Vec::new();
            while let Some(sel) = step(&mut runtime, &events, &mut h, 1.0, 0.0) {
                order.push(sel.event);
            }
            order
        };

        for seed in 0..20 {
            let order = run(seed);
            assert_eq!(order.len(), 4);
            assert!([0, 2, 3].contains(&order[0]), "first pick must have priority 2");
            assert_eq!(order[3], 1, "lowest priority runs last");
            assert_eq!(order, run(seed), "same seed, same order");
        }
    }

    struct Fixed(usize);

    impl EventSelector for Fixed {
        fn choose(&mut self, candidates: usize) -> usize {
            self.0.min(candidates - 1)
        }
    }

    #[test]
    fn injected_selector_decides_ties_without_priorities() {
        let mut builder = GraphBuilder::new(&Names);
        let events = vec![
            event(&mut builder, "a", "time > 0.5", None, None, "1"),
            event(&mut builder, "b", "time > 0.5", None, None, "2"),
        ];
        let mut h = harness(builder.finish(), vec![0.0, 0.0]);
        let mut runtime = EventRuntime::new(2, Box::new(Fixed(1)));
        step(&mut runtime, &events, &mut h, 0.0, 0.0);
        assert_eq!(step(&mut runtime, &events, &mut h, 1.0, 0.0).unwrap().event, 1);
        assert_eq!(step(&mut runtime, &events, &mut h, 1.0, 1.0).unwrap().event, 0);
    }
}
