use crate::error::{Result, SimulationError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Built-in operators and functions understood by the expression compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Plus,
    /// Binary subtraction, or negation with a single argument.
    Minus,
    Times,
    Divide,
    Power,
    Abs,
    Exp,
    Ln,
    /// `log(x)` is base 10, `log(b, x)` is base `b`.
    Log,
    /// `root(x)` is the square root, `root(n, x)` the n-th root.
    Root,
    Floor,
    Ceiling,
    Factorial,
    Sin,
    Cos,
    Tan,
    Sec,
    Csc,
    Cot,
    Sinh,
    Cosh,
    Tanh,
    Arcsin,
    Arccos,
    Arctan,
    Min,
    Max,
    Quotient,
    Rem,
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    And,
    Or,
    Xor,
    Not,
    /// `piecewise(v1, c1, v2, c2, ..., otherwise)`
    Piecewise,
}

impl Operator {
    /// Maps a function name as written in a formula to an operator.
    pub fn from_name(name: &str) -> Option<Self> {
        let op = match name {
            "plus" => Operator::Plus,
            "minus" => Operator::Minus,
            "times" => Operator::Times,
            "divide" => Operator::Divide,
            "pow" | "power" => Operator::Power,
            "abs" => Operator::Abs,
            "exp" => Operator::Exp,
            "ln" => Operator::Ln,
            "log" | "log10" => Operator::Log,
            "sqrt" | "root" => Operator::Root,
            "floor" => Operator::Floor,
            "ceil" | "ceiling" => Operator::Ceiling,
            "factorial" => Operator::Factorial,
            "sin" => Operator::Sin,
            "cos" => Operator::Cos,
            "tan" => Operator::Tan,
            "sec" => Operator::Sec,
            "csc" => Operator::Csc,
            "cot" => Operator::Cot,
            "sinh" => Operator::Sinh,
            "cosh" => Operator::Cosh,
            "tanh" => Operator::Tanh,
            "asin" | "arcsin" => Operator::Arcsin,
            "acos" | "arccos" => Operator::Arccos,
            "atan" | "arctan" => Operator::Arctan,
            "min" => Operator::Min,
            "max" => Operator::Max,
            "quotient" => Operator::Quotient,
            "rem" => Operator::Rem,
            "eq" => Operator::Eq,
            "neq" => Operator::Neq,
            "lt" => Operator::Lt,
            "leq" => Operator::Leq,
            "gt" => Operator::Gt,
            "geq" => Operator::Geq,
            "and" => Operator::And,
            "or" => Operator::Or,
            "xor" => Operator::Xor,
            "not" => Operator::Not,
            "piecewise" => Operator::Piecewise,
            _ => return None,
        };
        Some(op)
    }

    pub fn name(self) -> &'static str {
        match self {
            Operator::Plus => "plus",
            Operator::Minus => "minus",
            Operator::Times => "times",
            Operator::Divide => "divide",
            Operator::Power => "pow",
            Operator::Abs => "abs",
            Operator::Exp => "exp",
            Operator::Ln => "ln",
            Operator::Log => "log",
            Operator::Root => "root",
            Operator::Floor => "floor",
            Operator::Ceiling => "ceiling",
            Operator::Factorial => "factorial",
            Operator::Sin => "sin",
            Operator::Cos => "cos",
            Operator::Tan => "tan",
            Operator::Sec => "sec",
            Operator::Csc => "csc",
            Operator::Cot => "cot",
            Operator::Sinh => "sinh",
            Operator::Cosh => "cosh",
            Operator::Tanh => "tanh",
            Operator::Arcsin => "arcsin",
            Operator::Arccos => "arccos",
            Operator::Arctan => "arctan",
            Operator::Min => "min",
            Operator::Max => "max",
            Operator::Quotient => "quotient",
            Operator::Rem => "rem",
            Operator::Eq => "eq",
            Operator::Neq => "neq",
            Operator::Lt => "lt",
            Operator::Leq => "leq",
            Operator::Gt => "gt",
            Operator::Geq => "geq",
            Operator::And => "and",
            Operator::Or => "or",
            Operator::Xor => "xor",
            Operator::Not => "not",
            Operator::Piecewise => "piecewise",
        }
    }

    /// Accepted argument counts as an inclusive range (`None` = unbounded).
    pub fn arity(self) -> (usize, Option<usize>) {
        match self {
            Operator::Plus | Operator::Times | Operator::And | Operator::Or | Operator::Xor => {
                (0, None)
            }
            Operator::Minus | Operator::Log | Operator::Root => (1, Some(2)),
            Operator::Min | Operator::Max | Operator::Piecewise => (1, None),
            Operator::Eq | Operator::Lt | Operator::Leq | Operator::Gt | Operator::Geq => {
                (2, None)
            }
            Operator::Divide
            | Operator::Power
            | Operator::Quotient
            | Operator::Rem
            | Operator::Neq => (2, Some(2)),
            _ => (1, Some(1)),
        }
    }
}

/// Raw symbolic expression as handed over by the model description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MathNode {
    Number(f64),
    Boolean(bool),
    /// Simulation time.
    Time,
    /// Avogadro's number.
    Avogadro,
    /// Reference to a compartment, species, parameter, species reference,
    /// reaction, local parameter or function argument.
    Name(String),
    Apply(Operator, Vec<MathNode>),
    /// Call of a user-defined function.
    Call(String, Vec<MathNode>),
    /// `delay(symbol, delay)`
    Delay(Box<MathNode>, Box<MathNode>),
}

impl MathNode {
    pub fn number(value: f64) -> Self {
        MathNode::Number(value)
    }

    pub fn name(id: impl Into<String>) -> Self {
        MathNode::Name(id.into())
    }

    pub fn apply(op: Operator, args: Vec<MathNode>) -> Self {
        MathNode::Apply(op, args)
    }

    /// Collects every referenced identifier, including call arguments.
    pub fn collect_names(&self, out: &mut Vec<String>) {
        match self {
            MathNode::Name(id) => {
                if !out.iter().any(|n| n == id) {
                    out.push(id.clone());
                }
            }
            MathNode::Apply(_, args) | MathNode::Call(_, args) => {
                for arg in args {
                    arg.collect_names(out);
                }
            }
            MathNode::Delay(symbol, delay) => {
                symbol.collect_names(out);
                delay.collect_names(out);
            }
            MathNode::Number(_) | MathNode::Boolean(_) | MathNode::Time | MathNode::Avogadro => {}
        }
    }

    /// Number of occurrences of `id` as a name leaf.
    pub fn count_name(&self, id: &str) -> usize {
        match self {
            MathNode::Name(name) => usize::from(name == id),
            MathNode::Apply(_, args) | MathNode::Call(_, args) => {
                args.iter().map(|a| a.count_name(id)).sum()
            }
            MathNode::Delay(symbol, delay) => symbol.count_name(id) + delay.count_name(id),
            _ => 0,
        }
    }
}

impl fmt::Display for MathNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MathNode::Number(v) => write!(f, "{v}"),
            MathNode::Boolean(b) => write!(f, "{b}"),
            MathNode::Time => write!(f, "time"),
            MathNode::Avogadro => write!(f, "avogadro"),
            MathNode::Name(id) => write!(f, "{id}"),
            MathNode::Apply(op, args) => write_call(f, op.name(), args),
            MathNode::Call(name, args) => write_call(f, name, args),
            MathNode::Delay(symbol, delay) => write!(f, "delay({symbol}, {delay})"),
        }
    }
}

fn write_call(f: &mut fmt::Formatter<'_>, name: &str, args: &[MathNode]) -> fmt::Result {
    write!(f, "{name}(")?;
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{arg}")?;
    }
    write!(f, ")")
}

// --- Formula parser ---

/// Parses an infix formula such as `k1 * S1 / (Km + S1)` into a [`MathNode`].
pub fn parse_formula(input: &str) -> Result<MathNode> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(SimulationError::MalformedExpression(format!(
            "unexpected trailing input in '{input}'"
        )));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            // Exponent only when followed by digits, so `2e` stays an error
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            let value = text.parse::<f64>().map_err(|_| {
                SimulationError::MalformedExpression(format!("invalid number '{text}'"))
            })?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Identifier(chars[start..i].iter().collect()));
        } else {
            let next = chars.get(i + 1).copied();
            let (token, width) = match (c, next) {
                ('=', Some('=')) => (Token::EqEq, 2),
                ('!', Some('=')) => (Token::NotEq, 2),
                ('<', Some('=')) => (Token::Le, 2),
                ('>', Some('=')) => (Token::Ge, 2),
                ('&', Some('&')) => (Token::AndAnd, 2),
                ('|', Some('|')) => (Token::OrOr, 2),
                ('<', _) => (Token::Lt, 1),
                ('>', _) => (Token::Gt, 1),
                ('!', _) => (Token::Bang, 1),
                ('+', _) => (Token::Plus, 1),
                ('-', _) => (Token::Minus, 1),
                ('*', _) => (Token::Star, 1),
                ('/', _) => (Token::Slash, 1),
                ('^', _) => (Token::Caret, 1),
                ('(', _) => (Token::LParen, 1),
                (')', _) => (Token::RParen, 1),
                (',', _) => (Token::Comma, 1),
                _ => {
                    return Err(SimulationError::MalformedExpression(format!(
                        "unexpected character '{c}' in '{input}'"
                    )))
                }
            };
            tokens.push(token);
            i += width;
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_rparen(&mut self) -> Result<()> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err(malformed("expected ')'")),
        }
    }

    fn parse_or(&mut self) -> Result<MathNode> {
        let mut left = self.parse_and()?;
        while let Some(Token::OrOr) = self.peek() {
            self.consume();
            let right = self.parse_and()?;
            left = MathNode::Apply(Operator::Or, vec![left, right]);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<MathNode> {
        let mut left = self.parse_comparison()?;
        while let Some(Token::AndAnd) = self.peek() {
            self.consume();
            let right = self.parse_comparison()?;
            left = MathNode::Apply(Operator::And, vec![left, right]);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<MathNode> {
        let left = self.parse_term()?;
        let op = match self.peek() {
            Some(Token::EqEq) => Operator::Eq,
            Some(Token::NotEq) => Operator::Neq,
            Some(Token::Lt) => Operator::Lt,
            Some(Token::Le) => Operator::Leq,
            Some(Token::Gt) => Operator::Gt,
            Some(Token::Ge) => Operator::Geq,
            _ => return Ok(left),
        };
        self.consume();
        let right = self.parse_term()?;
        Ok(MathNode::Apply(op, vec![left, right]))
    }

    fn parse_term(&mut self) -> Result<MathNode> {
        let mut left = self.parse_factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => Operator::Plus,
                Some(Token::Minus) => Operator::Minus,
                _ => break,
            };
            self.consume();
            let right = self.parse_factor()?;
            left = MathNode::Apply(op, vec![left, right]);
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<MathNode> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => Operator::Times,
                Some(Token::Slash) => Operator::Divide,
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = MathNode::Apply(op, vec![left, right]);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<MathNode> {
        match self.peek() {
            Some(Token::Minus) => {
                self.consume();
                let operand = self.parse_unary()?;
                Ok(MathNode::Apply(Operator::Minus, vec![operand]))
            }
            Some(Token::Bang) => {
                self.consume();
                let operand = self.parse_unary()?;
                Ok(MathNode::Apply(Operator::Not, vec![operand]))
            }
            _ => self.parse_power(),
        }
    }

    // Right associative: a^b^c = a^(b^c), and -a^b = -(a^b).
    fn parse_power(&mut self) -> Result<MathNode> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(MathNode::Apply(Operator::Power, vec![base, exponent]));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<MathNode> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(MathNode::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let args = self.parse_arguments()?;
                    call_node(name, args)
                } else {
                    Ok(named_leaf(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(token) => Err(malformed(&format!("unexpected token {token:?}"))),
            None => Err(malformed("unexpected end of formula")),
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<MathNode>> {
        let mut args = Vec::new();
        if let Some(Token::RParen) = self.peek() {
            self.consume();
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            match self.consume() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                _ => return Err(malformed("expected ',' or ')' in argument list")),
            }
        }
    }
}

fn named_leaf(name: String) -> MathNode {
    match name.as_str() {
        "time" => MathNode::Time,
        "avogadro" => MathNode::Avogadro,
        "true" => MathNode::Boolean(true),
        "false" => MathNode::Boolean(false),
        "pi" => MathNode::Number(std::f64::consts::PI),
        "exponentiale" => MathNode::Number(std::f64::consts::E),
        "INF" | "inf" | "infinity" => MathNode::Number(f64::INFINITY),
        "NaN" | "nan" | "notanumber" => MathNode::Number(f64::NAN),
        _ => MathNode::Name(name),
    }
}

fn call_node(name: String, mut args: Vec<MathNode>) -> Result<MathNode> {
    if name == "delay" {
        if args.len() != 2 {
            return Err(malformed("delay expects exactly two arguments"));
        }
        let delay = args.pop().map(Box::new);
        let symbol = args.pop().map(Box::new);
        return match (symbol, delay) {
            (Some(symbol), Some(delay)) => Ok(MathNode::Delay(symbol, delay)),
            _ => Err(malformed("delay expects exactly two arguments")),
        };
    }
    match Operator::from_name(&name) {
        Some(op) => {
            // log10 and sqrt are fixed-base aliases
            if name == "log10" && args.len() == 1 {
                args.insert(0, MathNode::Number(10.0));
            }
            if name == "sqrt" && args.len() == 1 {
                args.insert(0, MathNode::Number(2.0));
            }
            Ok(MathNode::Apply(op, args))
        }
        None => Ok(MathNode::Call(name, args)),
    }
}

fn malformed(message: &str) -> SimulationError {
    SimulationError::MalformedExpression(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_precedence_and_associativity() {
        let expr = parse_formula("1 + 2 * x ^ 2 ^ 3").expect("formula should parse");
        let expected = MathNode::apply(
            Operator::Plus,
            vec![
                MathNode::number(1.0),
                MathNode::apply(
                    Operator::Times,
                    vec![
                        MathNode::number(2.0),
                        MathNode::apply(
                            Operator::Power,
                            vec![
                                MathNode::name("x"),
                                MathNode::apply(
                                    Operator::Power,
                                    vec![MathNode::number(2.0), MathNode::number(3.0)],
                                ),
                            ],
                        ),
                    ],
                ),
            ],
        );
        assert_eq!(expr, expected);
    }

    #[test]
    fn parses_scientific_notation_and_constants() {
        assert_eq!(parse_formula("1.5e-3").unwrap(), MathNode::Number(1.5e-3));
        assert_eq!(parse_formula("time").unwrap(), MathNode::Time);
        assert_eq!(parse_formula("true").unwrap(), MathNode::Boolean(true));
    }

    #[test]
    fn parses_logical_and_comparison() {
        let expr = parse_formula("time >= 2 && !(S < 1)").unwrap();
        match expr {
            MathNode::Apply(Operator::And, args) => {
                assert!(matches!(args[0], MathNode::Apply(Operator::Geq, _)));
                assert!(matches!(args[1], MathNode::Apply(Operator::Not, _)));
            }
            other => panic!("unexpected tree {other:?}"),
        }
    }

    #[test]
    fn parses_calls_delay_and_user_functions() {
        let expr = parse_formula("piecewise(1, x > 0, 0) + f(a, b) + delay(S, 2)").unwrap();
        let mut names = Vec::new();
        expr.collect_names(&mut names);
        assert_eq!(names, vec!["x", "a", "b", "S"]);
        assert!(format!("{expr}").contains("f(a, b)"));
        assert!(format!("{expr}").contains("delay(S, 2)"));
    }

    #[test]
    fn sqrt_and_log10_gain_explicit_base() {
        assert_eq!(
            parse_formula("sqrt(x)").unwrap(),
            MathNode::apply(Operator::Root, vec![MathNode::number(2.0), MathNode::name("x")])
        );
        assert_eq!(
            parse_formula("log10(x)").unwrap(),
            MathNode::apply(Operator::Log, vec![MathNode::number(10.0), MathNode::name("x")])
        );
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_formula("1 +").is_err());
        assert!(parse_formula("(x").is_err());
        assert!(parse_formula("x $ y").is_err());
        assert!(parse_formula("delay(x)").is_err());
        assert!(parse_formula("a b").is_err());
    }

    #[test]
    fn counts_name_occurrences() {
        let expr = parse_formula("x * y + x").unwrap();
        assert_eq!(expr.count_name("x"), 2);
        assert_eq!(expr.count_name("z"), 0);
    }
}
