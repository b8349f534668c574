//! Structural model handed to the simulation core.
//!
//! These types are deliberately plain data: a parser for any model description
//! format fills them in, and [`crate::system::ReactionSystem`] compiles them.
use crate::math::MathNode;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(default)]
    pub function_definitions: Vec<FunctionDefinition>,
    #[serde(default)]
    pub compartments: Vec<Compartment>,
    #[serde(default)]
    pub species: Vec<Species>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub initial_assignments: Vec<InitialAssignment>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub id: String,
    pub arguments: Vec<String>,
    pub body: MathNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compartment {
    pub id: String,
    /// Unset sizes start at 0 unless an initial assignment or rule provides one.
    pub size: Option<f64>,
    #[serde(default = "default_dimensions")]
    pub spatial_dimensions: f64,
    #[serde(default = "default_true")]
    pub constant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Species {
    pub id: String,
    pub compartment: String,
    pub initial_amount: Option<f64>,
    pub initial_concentration: Option<f64>,
    /// `None` defers to the majority setting over all species of the model.
    pub has_only_substance_units: Option<bool>,
    #[serde(default)]
    pub boundary_condition: bool,
    #[serde(default)]
    pub constant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub id: String,
    pub value: Option<f64>,
    #[serde(default = "default_true")]
    pub constant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesReference {
    /// Species references with an id can be addressed by rules and events.
    pub id: Option<String>,
    pub species: String,
    #[serde(default = "default_stoichiometry")]
    pub stoichiometry: f64,
    pub stoichiometry_math: Option<MathNode>,
    #[serde(default = "default_true")]
    pub constant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KineticLaw {
    pub math: MathNode,
    #[serde(default)]
    pub local_parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: String,
    #[serde(default)]
    pub reactants: Vec<SpeciesReference>,
    #[serde(default)]
    pub products: Vec<SpeciesReference>,
    pub kinetic_law: Option<KineticLaw>,
    #[serde(default)]
    pub fast: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Rule {
    Assignment { variable: String, math: MathNode },
    Rate { variable: String, math: MathNode },
    /// `0 = math`
    Algebraic { math: MathNode },
}

impl Rule {
    pub fn math(&self) -> &MathNode {
        match self {
            Rule::Assignment { math, .. } | Rule::Rate { math, .. } | Rule::Algebraic { math } => {
                math
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialAssignment {
    pub symbol: String,
    pub math: MathNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub math: MathNode,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventAssignment {
    pub variable: String,
    pub math: MathNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub trigger: MathNode,
    #[serde(default = "default_true")]
    pub persistent: bool,
    pub delay: Option<MathNode>,
    pub priority: Option<MathNode>,
    #[serde(default = "default_true")]
    pub use_values_from_trigger_time: bool,
    #[serde(default)]
    pub assignments: Vec<EventAssignment>,
}

fn default_true() -> bool {
    true
}

fn default_dimensions() -> f64 {
    3.0
}

fn default_stoichiometry() -> f64 {
    1.0
}

// --- Builders ---

impl Model {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_compartment(mut self, id: &str, size: f64) -> Self {
        self.compartments.push(Compartment::new(id, size));
        self
    }

    /// Adds a species given by initial concentration.
    pub fn with_species(mut self, id: &str, compartment: &str, concentration: f64) -> Self {
        self.species
            .push(Species::with_concentration(id, compartment, concentration));
        self
    }

    pub fn with_parameter(mut self, id: &str, value: f64) -> Self {
        self.parameters.push(Parameter::new(id, value));
        self
    }

    pub fn with_reaction(mut self, reaction: Reaction) -> Self {
        self.reactions.push(reaction);
        self
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_event(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }

    pub fn with_initial_assignment(mut self, symbol: &str, math: MathNode) -> Self {
        self.initial_assignments.push(InitialAssignment {
            symbol: symbol.to_string(),
            math,
        });
        self
    }

    pub fn with_constraint(mut self, math: MathNode) -> Self {
        self.constraints.push(Constraint {
            math,
            message: None,
        });
        self
    }

    pub fn with_function(mut self, id: &str, arguments: &[&str], body: MathNode) -> Self {
        self.function_definitions.push(FunctionDefinition {
            id: id.to_string(),
            arguments: arguments.iter().map(|a| a.to_string()).collect(),
            body,
        });
        self
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn reaction(&self, id: &str) -> Option<&Reaction> {
        self.reactions.iter().find(|r| r.id == id)
    }
}

impl Compartment {
    pub fn new(id: &str, size: f64) -> Self {
        Self {
            id: id.to_string(),
            size: Some(size),
            spatial_dimensions: default_dimensions(),
            constant: true,
        }
    }
}

impl Species {
    pub fn with_concentration(id: &str, compartment: &str, concentration: f64) -> Self {
        Self {
            id: id.to_string(),
            compartment: compartment.to_string(),
            initial_amount: None,
            initial_concentration: Some(concentration),
            has_only_substance_units: None,
            boundary_condition: false,
            constant: false,
        }
    }

    pub fn with_amount(id: &str, compartment: &str, amount: f64) -> Self {
        Self {
            initial_amount: Some(amount),
            initial_concentration: None,
            ..Self::with_concentration(id, compartment, 0.0)
        }
    }
}

impl Parameter {
    pub fn new(id: &str, value: f64) -> Self {
        Self {
            id: id.to_string(),
            value: Some(value),
            constant: true,
        }
    }

    pub fn variable(id: &str, value: f64) -> Self {
        Self {
            constant: false,
            ..Self::new(id, value)
        }
    }
}

impl SpeciesReference {
    pub fn new(species: &str, stoichiometry: f64) -> Self {
        Self {
            id: None,
            species: species.to_string(),
            stoichiometry,
            stoichiometry_math: None,
            constant: true,
        }
    }
}

impl Reaction {
    pub fn new(id: &str, math: MathNode) -> Self {
        Self {
            id: id.to_string(),
            reactants: Vec::new(),
            products: Vec::new(),
            kinetic_law: Some(KineticLaw {
                math,
                local_parameters: Vec::new(),
            }),
            fast: false,
        }
    }

    pub fn reactant(mut self, species: &str, stoichiometry: f64) -> Self {
        self.reactants
            .push(SpeciesReference::new(species, stoichiometry));
        self
    }

    pub fn product(mut self, species: &str, stoichiometry: f64) -> Self {
        self.products
            .push(SpeciesReference::new(species, stoichiometry));
        self
    }

    pub fn local_parameter(mut self, id: &str, value: f64) -> Self {
        if let Some(law) = self.kinetic_law.as_mut() {
            law.local_parameters.push(Parameter::new(id, value));
        }
        self
    }

    pub fn fast(mut self) -> Self {
        self.fast = true;
        self
    }

    /// Reactants first, then products.
    pub fn species_references(&self) -> impl Iterator<Item = &SpeciesReference> {
        self.reactants.iter().chain(self.products.iter())
    }
}

impl Event {
    pub fn new(id: &str, trigger: MathNode) -> Self {
        Self {
            id: id.to_string(),
            trigger,
            persistent: true,
            delay: None,
            priority: None,
            use_values_from_trigger_time: true,
            assignments: Vec::new(),
        }
    }

    pub fn delay(mut self, delay: MathNode) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn priority(mut self, priority: MathNode) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn assign(mut self, variable: &str, math: MathNode) -> Self {
        self.assignments.push(EventAssignment {
            variable: variable.to_string(),
            math,
        });
        self
    }
}
