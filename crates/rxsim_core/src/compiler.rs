use crate::error::{Result, SimulationError};
use crate::math::{MathNode, Operator};
use crate::model::FunctionDefinition;
use log::warn;
use std::collections::{HashMap, HashSet};

/// Avogadro's constant in 1/mol.
pub const AVOGADRO: f64 = 6.02214179e23;

const MAX_CALL_DEPTH: usize = 64;
const MAX_EVAL_DEPTH: usize = 512;

/// Handle of a compiled node inside an [`ExpressionGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Identity of the reaction owning a set of local parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReactionScope(pub usize);

/// Conversion between the quantity stored in the state vector and the
/// quantity an expression refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scaling {
    Identity,
    /// Stored as amount, read as concentration.
    DivideBySize(usize),
    /// Stored as concentration, read as amount.
    MultiplyBySize(usize),
}

impl Scaling {
    pub fn apply(self, value: f64, state: &[f64]) -> f64 {
        match self {
            Scaling::Identity => value,
            Scaling::DivideBySize(c) | Scaling::MultiplyBySize(c) => {
                self.with_size(value, compartment_size(state, c))
            }
        }
    }

    /// Same as [`Scaling::apply`] with the compartment size given directly.
    pub fn with_size(self, value: f64, size: f64) -> f64 {
        let size = if size != 0.0 { size } else { 1.0 };
        match self {
            Scaling::Identity => value,
            Scaling::DivideBySize(_) => value / size,
            Scaling::MultiplyBySize(_) => value * size,
        }
    }

    pub fn inverse(self) -> Scaling {
        match self {
            Scaling::Identity => Scaling::Identity,
            Scaling::DivideBySize(c) => Scaling::MultiplyBySize(c),
            Scaling::MultiplyBySize(c) => Scaling::DivideBySize(c),
        }
    }
}

/// Size of compartment `index`, with an empty compartment read as 1.
pub fn compartment_size(state: &[f64], index: usize) -> f64 {
    match state.get(index) {
        Some(&size) if size != 0.0 => size,
        _ => 1.0,
    }
}

/// What a named leaf reads at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueRef {
    /// Compartment, parameter or stoichiometry slot of the state vector.
    State(usize),
    Species { index: usize, scaling: Scaling },
    /// Reaction-local parameter. The scope tag keeps identical names of two
    /// reactions apart.
    LocalParameter { scope: ReactionScope, slot: usize },
    /// Current coefficient of a species reference without a state slot.
    Stoichiometry(usize),
    /// Instantaneous rate of the reaction with this index.
    ReactionRate(usize),
    /// Identifier that does not resolve; reads as 0.
    Unresolved,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Constant(f64),
    Time,
    Avogadro,
    Value(ValueRef),
    /// Positional argument of the function frame `frame`.
    Argument { frame: usize, position: usize },
    Apply(Operator, Vec<NodeId>),
    /// Call site of a user function with its own compiled body.
    Call {
        function: String,
        frame: usize,
        body: NodeId,
        args: Vec<NodeId>,
    },
    Delay {
        identifier: String,
        /// Compartment whose past size scales a species read.
        compartment: Option<String>,
        symbol: NodeId,
        delay: NodeId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum NodeKey {
    Constant(u64),
    Time,
    Avogadro,
    Value(ValueRef),
    Argument(usize, usize),
    Apply(Operator, Vec<NodeId>),
    Call(usize),
    Delay(NodeId, NodeId),
}

/// Past values of model quantities, queried by `delay(x, d)`.
pub trait DelayValueProvider {
    fn value_at(&self, time: f64, identifier: &str) -> f64;
}

/// Name lookup used while compiling.
pub trait SymbolResolver {
    fn resolve(&self, name: &str, scope: Option<ReactionScope>) -> Option<ValueRef>;

    fn function(&self, name: &str) -> Option<&FunctionDefinition>;

    /// Identifier of state slot `index`.
    fn state_identifier(&self, _index: usize) -> Option<&str> {
        None
    }
}

/// Arena of compiled nodes shared by every expression of one model.
#[derive(Debug, Clone, Default)]
pub struct ExpressionGraph {
    nodes: Vec<NodeKind>,
    kinetic_laws: Vec<Option<NodeId>>,
}

/// Inputs of one evaluation. `stamp` identifies the (time, state) pair; the
/// caller bumps it whenever either changes.
pub struct EvalContext<'a> {
    pub time: f64,
    pub stamp: u64,
    pub state: &'a [f64],
    pub local_parameters: &'a [f64],
    pub stoichiometry: &'a [f64],
    pub delay: Option<&'a dyn DelayValueProvider>,
}

/// Last computed value of every node, tagged with the stamp it belongs to.
#[derive(Debug, Clone, Default)]
pub struct EvalCache {
    entries: Vec<(u64, f64)>,
}

impl EvalCache {
    pub fn new(len: usize) -> Self {
        Self {
            entries: vec![(0, 0.0); len],
        }
    }

    fn get(&self, id: NodeId, stamp: u64) -> Option<f64> {
        match self.entries.get(id.0) {
            Some(&(s, value)) if s == stamp && stamp != 0 => Some(value),
            _ => None,
        }
    }

    fn store(&mut self, id: NodeId, stamp: u64, value: f64) {
        if id.0 >= self.entries.len() {
            self.entries.resize(id.0 + 1, (0, 0.0));
        }
        self.entries[id.0] = (stamp, value);
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = (0, 0.0));
    }
}

impl ExpressionGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.0]
    }

    pub fn set_kinetic_laws(&mut self, laws: Vec<Option<NodeId>>) {
        self.kinetic_laws = laws;
    }

    pub fn kinetic_law(&self, reaction: usize) -> Option<NodeId> {
        self.kinetic_laws.get(reaction).copied().flatten()
    }

    pub fn contains_delay(&self) -> bool {
        self.nodes.iter().any(|n| matches!(n, NodeKind::Delay { .. }))
    }

    pub fn evaluate(&self, id: NodeId, ctx: &EvalContext, cache: &mut EvalCache) -> Result<f64> {
        let mut evaluator = Evaluator {
            graph: self,
            ctx,
            cache,
            frames: Vec::new(),
            depth: 0,
        };
        evaluator.eval(id)
    }

    pub fn evaluate_bool(
        &self,
        id: NodeId,
        ctx: &EvalContext,
        cache: &mut EvalCache,
    ) -> Result<bool> {
        Ok(truthy(self.evaluate(id, ctx, cache)?))
    }
}

/// Boolean view of a numeric value; NaN counts as false.
pub fn truthy(value: f64) -> bool {
    value.abs() > 0.0
}

fn from_bool(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

struct Evaluator<'g, 'c, 'a> {
    graph: &'g ExpressionGraph,
    ctx: &'c EvalContext<'a>,
    cache: &'c mut EvalCache,
    frames: Vec<(usize, Vec<f64>)>,
    depth: usize,
}

impl Evaluator<'_, '_, '_> {
    fn eval(&mut self, id: NodeId) -> Result<f64> {
        if let Some(value) = self.cache.get(id, self.ctx.stamp) {
            return Ok(value);
        }
        self.depth += 1;
        if self.depth > MAX_EVAL_DEPTH {
            return Err(SimulationError::ModelEvaluation(
                "expression nesting too deep, possibly a cyclic reaction-rate reference".into(),
            ));
        }
        let value = self.eval_uncached(id);
        self.depth -= 1;
        let value = value?;
        // Argument-dependent nodes belong to exactly one call site.
        self.cache.store(id, self.ctx.stamp, value);
        Ok(value)
    }

    fn eval_uncached(&mut self, id: NodeId) -> Result<f64> {
        let graph = self.graph;
        let node = graph.nodes.get(id.0).ok_or_else(|| {
            SimulationError::ModelEvaluation(format!("node {} out of range", id.0))
        })?;
        match node {
            NodeKind::Constant(v) => Ok(*v),
            NodeKind::Time => Ok(self.ctx.time),
            NodeKind::Avogadro => Ok(AVOGADRO),
            NodeKind::Value(value) => self.read(*value),
            NodeKind::Argument { frame, position } => self
                .frames
                .iter()
                .rev()
                .find(|(f, _)| f == frame)
                .and_then(|(_, values)| values.get(*position).copied())
                .ok_or_else(|| {
                    SimulationError::ModelEvaluation(format!(
                        "function argument {position} evaluated outside its call"
                    ))
                }),
            NodeKind::Apply(op, args) => self.apply(*op, args),
            NodeKind::Call {
                frame, body, args, ..
            } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(*arg)?);
                }
                self.frames.push((*frame, values));
                let result = self.eval(*body);
                self.frames.pop();
                result
            }
            NodeKind::Delay {
                identifier,
                compartment,
                symbol,
                delay,
            } => {
                let d = self.eval(*delay)?;
                if d <= 0.0 {
                    return self.eval(*symbol);
                }
                let scaling = match graph.nodes.get(symbol.0) {
                    Some(NodeKind::Value(ValueRef::Species { scaling, .. })) => *scaling,
                    _ => Scaling::Identity,
                };
                match self.ctx.delay {
                    Some(provider) => {
                        let past = self.ctx.time - d;
                        let raw = provider.value_at(past, identifier);
                        Ok(match compartment {
                            Some(c) => scaling.with_size(raw, provider.value_at(past, c)),
                            None => scaling.apply(raw, self.ctx.state),
                        })
                    }
                    None => {
                        warn!("no delay value provider registered; delay({identifier}) reads 0");
                        Ok(0.0)
                    }
                }
            }
        }
    }

    fn read(&mut self, value: ValueRef) -> Result<f64> {
        let ctx = self.ctx;
        let lookup = |table: &[f64], index: usize, what: &str| {
            table.get(index).copied().ok_or_else(|| {
                SimulationError::ModelEvaluation(format!("{what} index {index} out of range"))
            })
        };
        match value {
            ValueRef::State(i) => lookup(ctx.state, i, "state"),
            ValueRef::Species { index, scaling } => {
                let raw = lookup(ctx.state, index, "species")?;
                Ok(scaling.apply(raw, ctx.state))
            }
            ValueRef::LocalParameter { slot, .. } => {
                lookup(ctx.local_parameters, slot, "local parameter")
            }
            ValueRef::Stoichiometry(i) => lookup(ctx.stoichiometry, i, "stoichiometry"),
            ValueRef::ReactionRate(r) => match self.graph.kinetic_law(r) {
                Some(law) => self.eval(law),
                None => Ok(0.0),
            },
            ValueRef::Unresolved => Ok(0.0),
        }
    }

    fn apply(&mut self, op: Operator, args: &[NodeId]) -> Result<f64> {
        // Lazy forms first.
        match op {
            Operator::Piecewise => {
                let mut pairs = args.chunks_exact(2);
                for pair in pairs.by_ref() {
                    if truthy(self.eval(pair[1])?) {
                        return self.eval(pair[0]);
                    }
                }
                return match pairs.remainder() {
                    [otherwise] => self.eval(*otherwise),
                    _ => Ok(f64::NAN),
                };
            }
            Operator::And => {
                for arg in args {
                    if !truthy(self.eval(*arg)?) {
                        return Ok(0.0);
                    }
                }
                return Ok(1.0);
            }
            Operator::Or => {
                for arg in args {
                    if truthy(self.eval(*arg)?) {
                        return Ok(1.0);
                    }
                }
                return Ok(0.0);
            }
            _ => {}
        }

        let mut v = Vec::with_capacity(args.len());
        for arg in args {
            v.push(self.eval(*arg)?);
        }
        let a = v.first().copied().unwrap_or(0.0);
        let b = v.get(1).copied().unwrap_or(0.0);
        let result = match op {
            Operator::Plus => v.iter().sum(),
            Operator::Times => v.iter().product(),
            Operator::Minus if v.len() == 1 => -a,
            Operator::Minus => a - b,
            Operator::Divide => a / b,
            Operator::Power => a.powf(b),
            Operator::Abs => a.abs(),
            Operator::Exp => a.exp(),
            Operator::Ln => a.ln(),
            Operator::Log if v.len() == 1 => a.log10(),
            Operator::Log => b.ln() / a.ln(),
            Operator::Root if v.len() == 1 => a.sqrt(),
            Operator::Root => nth_root(a, b),
            Operator::Floor => a.floor(),
            Operator::Ceiling => a.ceil(),
            Operator::Factorial => factorial(a),
            Operator::Sin => a.sin(),
            Operator::Cos => a.cos(),
            Operator::Tan => a.tan(),
            Operator::Sec => 1.0 / a.cos(),
            Operator::Csc => 1.0 / a.sin(),
            Operator::Cot => 1.0 / a.tan(),
            Operator::Sinh => a.sinh(),
            Operator::Cosh => a.cosh(),
            Operator::Tanh => a.tanh(),
            Operator::Arcsin => a.asin(),
            Operator::Arccos => a.acos(),
            Operator::Arctan => a.atan(),
            Operator::Min => v.iter().copied().fold(f64::INFINITY, f64::min),
            Operator::Max => v.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Operator::Quotient => (a / b).trunc(),
            Operator::Rem => a % b,
            Operator::Eq => from_bool(v.windows(2).all(|w| w[0] == w[1])),
            Operator::Neq => from_bool(a != b),
            Operator::Lt => from_bool(v.windows(2).all(|w| w[0] < w[1])),
            Operator::Leq => from_bool(v.windows(2).all(|w| w[0] <= w[1])),
            Operator::Gt => from_bool(v.windows(2).all(|w| w[0] > w[1])),
            Operator::Geq => from_bool(v.windows(2).all(|w| w[0] >= w[1])),
            Operator::Xor => from_bool(v.iter().filter(|x| truthy(**x)).count() % 2 == 1),
            Operator::Not => from_bool(!truthy(a)),
            Operator::Piecewise | Operator::And | Operator::Or => unreachable!(),
        };
        Ok(result)
    }
}

fn nth_root(degree: f64, x: f64) -> f64 {
    if degree == 2.0 {
        x.sqrt()
    } else if x < 0.0 && degree.fract() == 0.0 && (degree as i64) % 2 != 0 {
        -(-x).powf(1.0 / degree)
    } else {
        x.powf(1.0 / degree)
    }
}

fn factorial(n: f64) -> f64 {
    if n < 0.0 || n.fract() != 0.0 {
        return f64::NAN;
    }
    if n > 170.0 {
        return f64::INFINITY;
    }
    (1..=n as u64).map(|k| k as f64).product()
}

// --- Compilation ---

struct Bindings<'b> {
    frame: usize,
    names: &'b [String],
    depth: usize,
}

/// Compiles raw expressions into a shared [`ExpressionGraph`].
pub struct GraphBuilder<'r> {
    graph: ExpressionGraph,
    resolver: &'r dyn SymbolResolver,
    dedup: HashMap<NodeKey, NodeId>,
    next_frame: usize,
    warned: HashSet<String>,
}

impl<'r> GraphBuilder<'r> {
    pub fn new(resolver: &'r dyn SymbolResolver) -> Self {
        Self {
            graph: ExpressionGraph::default(),
            resolver,
            dedup: HashMap::new(),
            next_frame: 0,
            warned: HashSet::new(),
        }
    }

    /// Compiles `expr`. Local parameter names are looked up in `scope` first.
    pub fn compile(&mut self, expr: &MathNode, scope: Option<ReactionScope>) -> Result<NodeId> {
        self.compile_in(expr, scope, None)
    }

    pub fn finish(self) -> ExpressionGraph {
        self.graph
    }

    fn intern(&mut self, key: NodeKey, kind: NodeKind) -> NodeId {
        if let Some(id) = self.dedup.get(&key) {
            return *id;
        }
        let id = NodeId(self.graph.nodes.len());
        self.graph.nodes.push(kind);
        self.dedup.insert(key, id);
        id
    }

    fn constant(&mut self, value: f64) -> NodeId {
        self.intern(NodeKey::Constant(value.to_bits()), NodeKind::Constant(value))
    }

    fn compile_in(
        &mut self,
        expr: &MathNode,
        scope: Option<ReactionScope>,
        bindings: Option<&Bindings>,
    ) -> Result<NodeId> {
        match expr {
            MathNode::Number(v) => Ok(self.constant(*v)),
            MathNode::Boolean(b) => Ok(self.constant(from_bool(*b))),
            MathNode::Time => Ok(self.intern(NodeKey::Time, NodeKind::Time)),
            MathNode::Avogadro => Ok(self.intern(NodeKey::Avogadro, NodeKind::Avogadro)),
            MathNode::Name(name) => Ok(self.compile_name(name, scope, bindings)),
            MathNode::Apply(op, args) => {
                check_arity(*op, args.len())?;
                let mut children = Vec::with_capacity(args.len());
                for arg in args {
                    children.push(self.compile_in(arg, scope, bindings)?);
                }
                let key = NodeKey::Apply(*op, children.clone());
                Ok(self.intern(key, NodeKind::Apply(*op, children)))
            }
            MathNode::Call(name, args) => self.compile_call(name, args, scope, bindings),
            MathNode::Delay(symbol, delay) => {
                let identifier = match symbol.as_ref() {
                    MathNode::Name(id) => id.clone(),
                    other => {
                        return Err(SimulationError::MalformedExpression(format!(
                            "delay expects a symbol as first argument, got {other}"
                        )))
                    }
                };
                let symbol = self.compile_in(symbol, scope, bindings)?;
                let delay = self.compile_in(delay, scope, bindings)?;
                let compartment = match self.graph.nodes[symbol.0] {
                    NodeKind::Value(ValueRef::Species {
                        scaling: Scaling::DivideBySize(c) | Scaling::MultiplyBySize(c),
                        ..
                    }) => self.resolver.state_identifier(c).map(str::to_string),
                    _ => None,
                };
                Ok(self.intern(
                    NodeKey::Delay(symbol, delay),
                    NodeKind::Delay {
                        identifier,
                        compartment,
                        symbol,
                        delay,
                    },
                ))
            }
        }
    }

    fn compile_name(
        &mut self,
        name: &str,
        scope: Option<ReactionScope>,
        bindings: Option<&Bindings>,
    ) -> NodeId {
        if let Some(b) = bindings {
            if let Some(position) = b.names.iter().position(|n| n == name) {
                return self.intern(
                    NodeKey::Argument(b.frame, position),
                    NodeKind::Argument {
                        frame: b.frame,
                        position,
                    },
                );
            }
        }
        // Function bodies only see their arguments and global symbols.
        let scope = if bindings.is_some() { None } else { scope };
        let value = match self.resolver.resolve(name, scope) {
            Some(value) => value,
            None => {
                if self.warned.insert(name.to_string()) {
                    warn!("identifier '{name}' does not resolve to any model symbol; it reads 0");
                }
                ValueRef::Unresolved
            }
        };
        self.intern(NodeKey::Value(value), NodeKind::Value(value))
    }

    fn compile_call(
        &mut self,
        name: &str,
        args: &[MathNode],
        scope: Option<ReactionScope>,
        bindings: Option<&Bindings>,
    ) -> Result<NodeId> {
        let resolver = self.resolver;
        let function = resolver.function(name).ok_or_else(|| {
            SimulationError::MalformedExpression(format!("call of undefined function '{name}'"))
        })?;
        if function.arguments.len() != args.len() {
            return Err(SimulationError::MalformedExpression(format!(
                "function '{name}' expects {} arguments, got {}",
                function.arguments.len(),
                args.len()
            )));
        }
        let depth = bindings.map_or(0, |b| b.depth) + 1;
        if depth > MAX_CALL_DEPTH {
            return Err(SimulationError::MalformedExpression(format!(
                "function '{name}' nests too deeply, possibly recursive"
            )));
        }
        let mut compiled_args = Vec::with_capacity(args.len());
        for arg in args {
            compiled_args.push(self.compile_in(arg, scope, bindings)?);
        }

        let frame = self.next_frame;
        self.next_frame += 1;
        let inner = Bindings {
            frame,
            names: &function.arguments,
            depth,
        };
        let body = self.compile_in(&function.body, None, Some(&inner))?;
        Ok(self.intern(
            NodeKey::Call(frame),
            NodeKind::Call {
                function: name.to_string(),
                frame,
                body,
                args: compiled_args,
            },
        ))
    }
}

fn check_arity(op: Operator, count: usize) -> Result<()> {
    let (min, max) = op.arity();
    if count < min || max.is_some_and(|m| count > m) {
        return Err(SimulationError::MalformedExpression(format!(
            "operator '{}' cannot take {count} arguments",
            op.name()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::parse_formula;

    struct Fixture {
        functions: Vec<FunctionDefinition>,
    }

    impl SymbolResolver for Fixture {
        fn resolve(&self, name: &str, scope: Option<ReactionScope>) -> Option<ValueRef> {
            match (name, scope) {
                ("k", Some(scope)) => Some(ValueRef::LocalParameter {
                    scope,
                    slot: scope.0,
                }),
                ("x", _) => Some(ValueRef::State(0)),
                ("y", _) => Some(ValueRef::State(1)),
                ("conc", _) => Some(ValueRef::Species {
                    index: 1,
                    scaling: Scaling::DivideBySize(2),
                }),
                ("r0", _) => Some(ValueRef::ReactionRate(0)),
                _ => None,
            }
        }

        fn function(&self, name: &str) -> Option<&FunctionDefinition> {
            self.functions.iter().find(|f| f.id == name)
        }

        fn state_identifier(&self, index: usize) -> Option<&str> {
            ["x", "y", "cell"].get(index).copied()
        }
    }

    fn fixture() -> Fixture {
        Fixture {
            functions: vec![FunctionDefinition {
                id: "sq".into(),
                arguments: vec!["a".into()],
                body: parse_formula("a * a").unwrap(),
            }],
        }
    }

    fn ctx<'a>(state: &'a [f64], locals: &'a [f64], stamp: u64) -> EvalContext<'a> {
        EvalContext {
            time: 1.5,
            stamp,
            state,
            local_parameters: locals,
            stoichiometry: &[],
            delay: None,
        }
    }

    fn eval(formula: &str, state: &[f64]) -> f64 {
        let fixture = fixture();
        let mut builder = GraphBuilder::new(&fixture);
        let id = builder.compile(&parse_formula(formula).unwrap(), None).unwrap();
        let graph = builder.finish();
        let mut cache = EvalCache::new(graph.len());
        graph.evaluate(id, &ctx(state, &[], 1), &mut cache).unwrap()
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        match result {
            Ok(value) => panic!("expected error containing '{needle}', got {value:?}"),
            Err(err) => assert!(
                err.to_string().contains(needle),
                "error '{err}' does not contain '{needle}'"
            ),
        }
    }

    #[test]
    fn identical_subexpressions_share_one_node() {
        let fixture = fixture();
        let mut builder = GraphBuilder::new(&fixture);
        let a = builder.compile(&parse_formula("x * (y + 1)").unwrap(), None).unwrap();
        let b = builder.compile(&parse_formula("x * (y + 1)").unwrap(), None).unwrap();
        let c = builder.compile(&parse_formula("y + 1").unwrap(), None).unwrap();
        assert_eq!(a, b);
        let graph = builder.finish();
        match graph.node(a) {
            NodeKind::Apply(Operator::Times, children) => assert_eq!(children[1], c),
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn local_parameters_of_different_reactions_never_merge() {
        let fixture = fixture();
        let mut builder = GraphBuilder::new(&fixture);
        let expr = parse_formula("k * x").unwrap();
        let first = builder.compile(&expr, Some(ReactionScope(0))).unwrap();
        let again = builder.compile(&expr, Some(ReactionScope(0))).unwrap();
        let second = builder.compile(&expr, Some(ReactionScope(1))).unwrap();
        assert_eq!(first, again);
        assert_ne!(first, second);

        let graph = builder.finish();
        let mut cache = EvalCache::new(graph.len());
        let state = [2.0, 0.0];
        let locals = [3.0, 5.0];
        let c = ctx(&state, &locals, 1);
        assert_eq!(graph.evaluate(first, &c, &mut cache).unwrap(), 6.0);
        assert_eq!(graph.evaluate(second, &c, &mut cache).unwrap(), 10.0);
    }

    #[test]
    fn cached_values_are_reused_until_the_stamp_changes() {
        let fixture = fixture();
        let mut builder = GraphBuilder::new(&fixture);
        let id = builder.compile(&parse_formula("x + 1").unwrap(), None).unwrap();
        let graph = builder.finish();
        let mut cache = EvalCache::new(graph.len());

        assert_eq!(graph.evaluate(id, &ctx(&[1.0], &[], 7), &mut cache).unwrap(), 2.0);
        // Same stamp: cached value even though the state differs.
        assert_eq!(graph.evaluate(id, &ctx(&[5.0], &[], 7), &mut cache).unwrap(), 2.0);
        assert_eq!(graph.evaluate(id, &ctx(&[5.0], &[], 8), &mut cache).unwrap(), 6.0);
    }

    #[test]
    fn evaluates_operators_and_time() {
        assert_eq!(eval("2 ^ 3 - 1", &[]), 7.0);
        assert_eq!(eval("time * 2", &[]), 3.0);
        assert_eq!(eval("piecewise(10, x > 1, 20)", &[0.5]), 20.0);
        assert_eq!(eval("piecewise(10, x > 1, 20)", &[1.5]), 10.0);
        assert!((eval("root(3, -8)", &[]) + 2.0).abs() < 1e-12);
        assert_eq!(eval("factorial(5)", &[]), 120.0);
        assert_eq!(eval("max(1, x, 3)", &[7.0]), 7.0);
        assert_eq!(eval("true && !false", &[]), 1.0);
        assert!((eval("log(2, 8)", &[]) - 3.0).abs() < 1e-12);
        assert!((eval("avogadro", &[]) - AVOGADRO).abs() < 1.0);
    }

    #[test]
    fn non_finite_results_are_values_not_errors() {
        assert!(eval("1 / 0", &[]).is_infinite());
        assert!(eval("ln(-1)", &[]).is_nan());
    }

    #[test]
    fn species_scaling_reads_concentration() {
        // amount 6 in a compartment of size 3
        assert_eq!(eval("conc", &[0.0, 6.0, 3.0]), 2.0);
        // empty compartment reads as size 1
        assert_eq!(eval("conc", &[0.0, 6.0, 0.0]), 6.0);
    }

    #[test]
    fn user_functions_substitute_arguments_per_call_site() {
        let fixture = fixture();
        let mut builder = GraphBuilder::new(&fixture);
        let a = builder.compile(&parse_formula("sq(x)").unwrap(), None).unwrap();
        let b = builder.compile(&parse_formula("sq(x)").unwrap(), None).unwrap();
        assert_ne!(a, b, "each call site owns its body");
        let nested = builder
            .compile(&parse_formula("sq(sq(y) + 1)").unwrap(), None)
            .unwrap();
        let graph = builder.finish();
        let mut cache = EvalCache::new(graph.len());
        let c = ctx(&[3.0, 2.0], &[], 1);
        assert_eq!(graph.evaluate(a, &c, &mut cache).unwrap(), 9.0);
        assert_eq!(graph.evaluate(nested, &c, &mut cache).unwrap(), 25.0);
    }

    #[test]
    fn unresolved_names_and_missing_delay_provider_read_zero() {
        assert_eq!(eval("nowhere + 1", &[]), 1.0);
        assert_eq!(eval("delay(x, 1)", &[4.0]), 0.0);
        assert_eq!(eval("delay(x, 0)", &[4.0]), 4.0);
    }

    #[test]
    fn delay_queries_the_provider_at_shifted_time() {
        struct Linear;
        impl DelayValueProvider for Linear {
            fn value_at(&self, time: f64, _identifier: &str) -> f64 {
                10.0 * time
            }
        }
        let fixture = fixture();
        let mut builder = GraphBuilder::new(&fixture);
        let id = builder.compile(&parse_formula("delay(x, 0.5)").unwrap(), None).unwrap();
        let graph = builder.finish();
        let mut cache = EvalCache::new(graph.len());
        let provider = Linear;
        let c = EvalContext {
            delay: Some(&provider),
            ..ctx(&[0.0], &[], 1)
        };
        assert_eq!(graph.evaluate(id, &c, &mut cache).unwrap(), 10.0);
    }

    #[test]
    fn delayed_species_reads_use_the_past_compartment_size() {
        struct History;
        impl DelayValueProvider for History {
            fn value_at(&self, time: f64, identifier: &str) -> f64 {
                match identifier {
                    "conc" => 8.0,
                    // the compartment was half as large half a time unit ago
                    "cell" if time < 1.5 => 2.0,
                    "cell" => 4.0,
                    _ => 0.0,
                }
            }
        }
        let fixture = fixture();
        let mut builder = GraphBuilder::new(&fixture);
        let past = builder.compile(&parse_formula("delay(conc, 0.5)").unwrap(), None).unwrap();
        let now = builder.compile(&parse_formula("delay(conc, 0)").unwrap(), None).unwrap();
        let graph = builder.finish();
        let mut cache = EvalCache::new(graph.len());
        let provider = History;
        // amount 8 stored in slot 1, compartment size 4 in slot 2
        let c = EvalContext {
            delay: Some(&provider),
            ..ctx(&[0.0, 8.0, 4.0], &[], 1)
        };
        assert_eq!(graph.evaluate(past, &c, &mut cache).unwrap(), 4.0);
        assert_eq!(graph.evaluate(now, &c, &mut cache).unwrap(), 2.0);
    }

    #[test]
    fn reaction_rate_reads_the_kinetic_law() {
        let fixture = fixture();
        let mut builder = GraphBuilder::new(&fixture);
        let law = builder.compile(&parse_formula("2 * x").unwrap(), None).unwrap();
        let reader = builder.compile(&parse_formula("r0 + 1").unwrap(), None).unwrap();
        let mut graph = builder.finish();
        graph.set_kinetic_laws(vec![Some(law)]);
        let mut cache = EvalCache::new(graph.len());
        assert_eq!(graph.evaluate(reader, &ctx(&[4.0], &[], 1), &mut cache).unwrap(), 9.0);
    }

    #[test]
    fn rejects_bad_arity_and_unknown_functions() {
        let fixture = fixture();
        let mut builder = GraphBuilder::new(&fixture);
        let bad = MathNode::apply(Operator::Divide, vec![MathNode::number(1.0)]);
        assert_err_contains(builder.compile(&bad, None), "cannot take 1 arguments");
        assert_err_contains(
            builder.compile(&parse_formula("nope(1)").unwrap(), None),
            "undefined function",
        );
        assert_err_contains(
            builder.compile(&parse_formula("sq(1, 2)").unwrap(), None),
            "expects 1 arguments",
        );
    }
}
