//! Formula language used by parameter definitions, algebraic variables, flows,
//! delays and outputs.
//!
//! Formulas are parsed into an [Expr] tree, which is then bound against a
//! [SymbolTable] into a [BoundExpr] whose identifiers are resolved to slots.
//! Binding is where undefined symbols are reported, so a compiled model never
//! evaluates a name it does not know.
//!
//! ```
//! use pkpdsim::model::expr::Expr;
//!
//! let expr = Expr::parse("tvCl * (BW/70)^dCldBW * exp(nCl)").unwrap();
//! let symbols: Vec<String> = expr.symbols().into_iter().collect();
//! assert_eq!(symbols, vec!["BW", "dCldBW", "nCl", "tvCl"]);
//! ```
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

mod eval;
mod parser;

pub use eval::{ilogit, logit, BoundExpr, Builtin, Env, Slot, SymbolTable};
pub use parser::{tokenize, Parser, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
        };
        write!(f, "{}", symbol)
    }
}

/// Unbound expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Number(f64),
    Ident(String),
    Neg(Box<Expr>),
    Binary {
        lhs: Box<Expr>,
        op: BinaryOp,
        rhs: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

/// Formula syntax error at a character offset
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub pos: usize,
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(pos: usize, message: impl Into<String>) -> Self {
        ParseError {
            pos,
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at character {}: {}", self.pos, self.message)
    }
}

impl std::error::Error for ParseError {}

impl Expr {
    /// Parse a formula. The whole input must be consumed.
    pub fn parse(source: &str) -> Result<Expr, ParseError> {
        Parser::new(source)?.parse()
    }

    /// Identifiers referenced by the expression, excluding function names.
    pub fn symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Ident(name) => {
                out.insert(name.clone());
            }
            Expr::Neg(rhs) => rhs.collect_symbols(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_symbols(out);
                rhs.collect_symbols(out);
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.collect_symbols(out)),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(v) => write!(f, "{}", v),
            Expr::Ident(name) => write!(f, "{}", name),
            Expr::Neg(rhs) => write!(f, "-({})", rhs),
            Expr::Binary { lhs, op, rhs } => write!(f, "({} {} {})", lhs, op, rhs),
            Expr::Call { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_power_with_higher_precedence_than_product() {
        let expr = Expr::parse("2 * 3 ^ 2").unwrap();
        assert_eq!(expr.to_string(), "(2 * (3 ^ 2))");
    }

    #[test]
    fn power_is_right_associative() {
        let expr = Expr::parse("2 ^ 3 ^ 2").unwrap();
        assert_eq!(expr.to_string(), "(2 ^ (3 ^ 2))");
    }

    #[test]
    fn rejects_trailing_tokens() {
        assert!(Expr::parse("a b").is_err());
        assert!(Expr::parse("(a + b").is_err());
        assert!(Expr::parse("a $ b").is_err());
    }

    #[test]
    fn leading_minus_binds_looser_than_power() {
        assert_eq!(Expr::parse("-x^2").unwrap().to_string(), "-((x ^ 2))");
        assert_eq!(Expr::parse("-a * b").unwrap().to_string(), "(-(a) * b)");
        assert_eq!(Expr::parse("2^-1").unwrap().to_string(), "(2 ^ -(1))");
    }

    #[test]
    fn comparisons_bind_looser_than_arithmetic() {
        let expr = Expr::parse("t + 1 >= 2 * tlag").unwrap();
        assert_eq!(expr.to_string(), "((t + 1) >= (2 * tlag))");
        assert!(Expr::parse("a && b").is_err());
        assert!(Expr::parse("a ? b : c").is_err());
    }

    #[test]
    fn collects_symbols_without_function_names() {
        let expr = Expr::parse("1 - C/(C + IC50) + exp(-t/tau)").unwrap();
        let symbols: Vec<_> = expr.symbols().into_iter().collect();
        assert_eq!(symbols, vec!["C", "IC50", "t", "tau"]);
    }

    #[test]
    fn scientific_notation() {
        let expr = Expr::parse("1.5e-3 * x").unwrap();
        match expr {
            Expr::Binary { lhs, .. } => assert_eq!(*lhs, Expr::Number(1.5e-3)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
