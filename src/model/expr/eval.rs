use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{BinaryOp, Expr};
use crate::error::PkpdError;

/// Where a bound identifier reads its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    Time,
    State(usize),
    Param(usize),
    Algebraic(usize),
    Delay(usize),
    Covariate(usize),
    Theta(usize),
    Eta(usize),
    Kappa(usize),
}

/// Name to [Slot] lookup used while binding.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    slots: HashMap<String, Slot>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`. Fails if the name is already taken.
    pub fn insert(&mut self, name: &str, slot: Slot) -> Result<(), PkpdError> {
        if self.slots.contains_key(name) {
            return Err(PkpdError::DuplicateSymbol {
                symbol: name.to_string(),
            });
        }
        self.slots.insert(name.to_string(), slot);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Slot> {
        self.slots.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }
}

/// Values visible to a bound expression during evaluation.
///
/// Slices that a given context does not use stay empty; a slot that falls
/// outside its slice evaluates to NaN.
#[derive(Debug, Clone, Copy, Default)]
pub struct Env<'a> {
    pub time: f64,
    pub states: &'a [f64],
    pub params: &'a [f64],
    pub algebraic: &'a [f64],
    pub delays: &'a [f64],
    pub covariates: &'a [f64],
    pub theta: &'a [f64],
    pub eta: &'a [f64],
    pub kappa: &'a [f64],
}

impl Env<'_> {
    #[inline]
    fn read(&self, slot: Slot) -> f64 {
        let (values, index) = match slot {
            Slot::Time => return self.time,
            Slot::State(i) => (self.states, i),
            Slot::Param(i) => (self.params, i),
            Slot::Algebraic(i) => (self.algebraic, i),
            Slot::Delay(i) => (self.delays, i),
            Slot::Covariate(i) => (self.covariates, i),
            Slot::Theta(i) => (self.theta, i),
            Slot::Eta(i) => (self.eta, i),
            Slot::Kappa(i) => (self.kappa, i),
        };
        values.get(index).copied().unwrap_or(f64::NAN)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Builtin {
    Exp,
    Ln,
    Log10,
    Sqrt,
    Abs,
    Floor,
    Ceil,
    Pow,
    Min,
    Max,
    If,
    Ilogit,
    Logit,
}

impl Builtin {
    fn lookup(name: &str, arity: usize) -> Option<Builtin> {
        let builtin = match (name, arity) {
            ("exp", 1) => Builtin::Exp,
            ("ln" | "log", 1) => Builtin::Ln,
            ("log10", 1) => Builtin::Log10,
            ("sqrt", 1) => Builtin::Sqrt,
            ("abs", 1) => Builtin::Abs,
            ("floor", 1) => Builtin::Floor,
            ("ceil", 1) => Builtin::Ceil,
            ("pow", 2) => Builtin::Pow,
            ("min", 2) => Builtin::Min,
            ("max", 2) => Builtin::Max,
            ("if", 3) => Builtin::If,
            ("ilogit", 1) => Builtin::Ilogit,
            ("logit", 1) => Builtin::Logit,
            _ => return None,
        };
        Some(builtin)
    }

    fn apply(self, args: &[f64]) -> f64 {
        let a = |i: usize| args.get(i).copied().unwrap_or(f64::NAN);
        match self {
            Builtin::Exp => a(0).exp(),
            Builtin::Ln => a(0).ln(),
            Builtin::Log10 => a(0).log10(),
            Builtin::Sqrt => a(0).sqrt(),
            Builtin::Abs => a(0).abs(),
            Builtin::Floor => a(0).floor(),
            Builtin::Ceil => a(0).ceil(),
            Builtin::Pow => a(0).powf(a(1)),
            Builtin::Min => a(0).min(a(1)),
            Builtin::Max => a(0).max(a(1)),
            Builtin::If => {
                if a(0) != 0.0 {
                    a(1)
                } else {
                    a(2)
                }
            }
            Builtin::Ilogit => ilogit(a(0)),
            Builtin::Logit => logit(a(0)),
        }
    }
}

/// Inverse logit, `1 / (1 + exp(-x))`.
#[inline]
pub fn ilogit(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

#[inline]
pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// Expression with every identifier resolved to a [Slot].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BoundExpr {
    Const(f64),
    Slot(Slot),
    Neg(Box<BoundExpr>),
    Binary(BinaryOp, Box<BoundExpr>, Box<BoundExpr>),
    Call(Builtin, Vec<BoundExpr>),
}

impl Expr {
    /// Resolve identifiers against `table`.
    ///
    /// `context` names the owner of the formula and ends up in error messages.
    pub fn bind(&self, table: &SymbolTable, context: &str) -> Result<BoundExpr, PkpdError> {
        let bound = match self {
            Expr::Number(v) => BoundExpr::Const(*v),
            Expr::Ident(name) => match table.get(name) {
                Some(slot) => BoundExpr::Slot(slot),
                None => {
                    return Err(PkpdError::UnresolvedParameter {
                        symbol: name.clone(),
                        context: context.to_string(),
                    })
                }
            },
            Expr::Neg(rhs) => BoundExpr::Neg(Box::new(rhs.bind(table, context)?)),
            Expr::Binary { lhs, op, rhs } => BoundExpr::Binary(
                *op,
                Box::new(lhs.bind(table, context)?),
                Box::new(rhs.bind(table, context)?),
            ),
            Expr::Call { name, args } => {
                let builtin = Builtin::lookup(name, args.len()).ok_or_else(|| {
                    PkpdError::UnknownFunction {
                        name: name.clone(),
                        arity: args.len(),
                        context: context.to_string(),
                    }
                })?;
                let args = args
                    .iter()
                    .map(|arg| arg.bind(table, context))
                    .collect::<Result<Vec<_>, _>>()?;
                BoundExpr::Call(builtin, args)
            }
        };
        Ok(bound)
    }
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

impl BoundExpr {
    pub fn eval(&self, env: &Env) -> f64 {
        match self {
            BoundExpr::Const(v) => *v,
            BoundExpr::Slot(slot) => env.read(*slot),
            BoundExpr::Neg(rhs) => -rhs.eval(env),
            BoundExpr::Binary(op, lhs, rhs) => {
                let a = lhs.eval(env);
                let b = rhs.eval(env);
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Pow => a.powf(b),
                    BinaryOp::Lt => flag(a < b),
                    BinaryOp::Gt => flag(a > b),
                    BinaryOp::Le => flag(a <= b),
                    BinaryOp::Ge => flag(a >= b),
                    BinaryOp::Eq => flag(a == b),
                    BinaryOp::Ne => flag(a != b),
                }
            }
            BoundExpr::Call(builtin, args) => match args.len() {
                1 => builtin.apply(&[args[0].eval(env)]),
                2 => builtin.apply(&[args[0].eval(env), args[1].eval(env)]),
                _ => {
                    let values: Vec<f64> = args.iter().map(|a| a.eval(env)).collect();
                    builtin.apply(&values)
                }
            },
        }
    }

    /// True when any slot read by the expression satisfies `pred`.
    pub fn reads(&self, pred: &impl Fn(Slot) -> bool) -> bool {
        match self {
            BoundExpr::Const(_) => false,
            BoundExpr::Slot(slot) => pred(*slot),
            BoundExpr::Neg(rhs) => rhs.reads(pred),
            BoundExpr::Binary(_, lhs, rhs) => lhs.reads(pred) || rhs.reads(pred),
            BoundExpr::Call(_, args) => args.iter().any(|a| a.reads(pred)),
        }
    }

    /// True when the expression reads no slot at all.
    pub fn is_constant(&self) -> bool {
        match self {
            BoundExpr::Const(_) => true,
            BoundExpr::Slot(_) => false,
            BoundExpr::Neg(rhs) => rhs.is_constant(),
            BoundExpr::Binary(_, lhs, rhs) => lhs.is_constant() && rhs.is_constant(),
            BoundExpr::Call(_, args) => args.iter().all(|a| a.is_constant()),
        }
    }
}
