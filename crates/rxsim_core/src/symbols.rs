use std::collections::HashMap;

/// Category of a state-vector slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Compartment,
    Species,
    /// Stoichiometry of a species reference driven by a rate rule.
    Stoichiometry,
    Parameter,
}

/// Bijection between state-vector indices and model identifiers.
///
/// Slots are laid out as compartments, species, rate-rule stoichiometries and
/// global parameters, in that order. The table is rebuilt on every structural
/// initialization and stays fixed for the duration of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolTable {
    identifiers: Vec<String>,
    kinds: Vec<SymbolKind>,
    positions: HashMap<String, usize>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a slot. Kinds must be pushed in layout order.
    pub fn push(&mut self, kind: SymbolKind, id: &str) -> usize {
        debug_assert!(
            self.kinds.last().map_or(true, |last| rank(*last) <= rank(kind)),
            "symbols pushed out of layout order"
        );
        let index = self.identifiers.len();
        self.identifiers.push(id.to_string());
        self.kinds.push(kind);
        self.positions.insert(id.to_string(), index);
        index
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn identifier(&self, index: usize) -> Option<&str> {
        self.identifiers.get(index).map(String::as_str)
    }

    pub fn kind(&self, index: usize) -> Option<SymbolKind> {
        self.kinds.get(index).copied()
    }

    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }
}

fn rank(kind: SymbolKind) -> u8 {
    match kind {
        SymbolKind::Compartment => 0,
        SymbolKind::Species => 1,
        SymbolKind::Stoichiometry => 2,
        SymbolKind::Parameter => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_bijective_and_ordered() {
        let mut table = SymbolTable::new();
        table.push(SymbolKind::Compartment, "cell");
        table.push(SymbolKind::Species, "A");
        table.push(SymbolKind::Species, "B");
        table.push(SymbolKind::Parameter, "k");

        assert_eq!(table.len(), 4);
        for (i, id) in table.identifiers().iter().enumerate() {
            assert_eq!(table.index_of(id), Some(i));
            assert_eq!(table.identifier(i), Some(id.as_str()));
        }
        assert_eq!(table.kind(1), Some(SymbolKind::Species));
        assert_eq!(table.kind(3), Some(SymbolKind::Parameter));
        assert_eq!(table.index_of("missing"), None);
    }
}
