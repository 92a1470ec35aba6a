//! Filter expression builder.
//!
//! Filters are immutable values wrapping a clause in the driver's filter
//! language. Combining them with `&`, `|` and `!` yields new filters whose
//! clauses are parenthesized only where the driver would otherwise group
//! the operands differently.
//!
//! ```rust,ignore
//! use divert::prelude::*;
//!
//! let filter = (Field::TCP | Field::UDP) & Field::OUTBOUND;
//! assert_eq!(filter.clause(), "(tcp or udp) and outbound");
//! ```

pub mod field;

pub use field::{Field, Value};

use crate::error::{DivertError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use std::str::FromStr;

lazy_static! {
    static ref TOP_LEVEL_OR: Regex = Regex::new(r"\s(or|\|\|)\s").expect("valid pattern");
    static ref TOP_LEVEL_AND: Regex = Regex::new(r"\s(and|&&)\s").expect("valid pattern");
}

/// A filter expression.
///
/// Equality and hashing use the rendered clause, so two filters built in
/// different ways compare equal whenever they render identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Filter {
    clause: String,
}

#[derive(Clone, Copy)]
enum Operator {
    And,
    Or,
}

impl Operator {
    fn keyword(self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
        }
    }

    /// Pattern matching a depth-zero use of the opposite operator.
    fn conflicting(self) -> &'static Regex {
        match self {
            Self::And => &TOP_LEVEL_OR,
            Self::Or => &TOP_LEVEL_AND,
        }
    }
}

impl Filter {
    /// Wraps raw filter text.
    ///
    /// # Errors
    ///
    /// Returns `ArgumentInvalid` if the parentheses in `clause` are unbalanced.
    pub fn new(clause: impl Into<String>) -> Result<Self> {
        let clause = clause.into();
        check_balanced("filter", &clause)?;
        Ok(Self { clause })
    }

    /// Matches every packet.
    pub fn always() -> Self {
        Self::from(true)
    }

    /// Matches nothing.
    pub fn never() -> Self {
        Self::from(false)
    }

    /// The rendered clause in the driver's filter language.
    pub fn clause(&self) -> &str {
        &self.clause
    }

    pub fn into_clause(self) -> String {
        self.clause
    }

    fn trusted(clause: String) -> Self {
        Self { clause }
    }

    fn combine(&self, operator: Operator, other: &Filter) -> Self {
        Self::trusted(format!(
            "{} {} {}",
            operand(&self.clause, operator),
            operator.keyword(),
            operand(&other.clause, operator)
        ))
    }
}

/// Reduces every outermost parenthesized group to `()`, e.g.
/// `(a and (b or c)) or d` becomes `() or d`. Returns `None` when the
/// parentheses do not balance.
fn collapse_parentheses(clause: &str) -> Option<String> {
    let mut collapsed = String::with_capacity(clause.len());
    let mut depth = 0usize;
    for c in clause.chars() {
        match c {
            '(' => {
                if depth == 0 {
                    collapsed.push('(');
                }
                depth += 1;
            }
            ')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    collapsed.push(')');
                }
            }
            _ if depth == 0 => collapsed.push(c),
            _ => {}
        }
    }
    (depth == 0).then_some(collapsed)
}

fn check_balanced(name: &'static str, text: &str) -> Result<()> {
    match collapse_parentheses(text) {
        Some(_) => Ok(()),
        None => Err(DivertError::invalid_argument(
            name,
            format!("unbalanced parentheses in `{text}`"),
        )),
    }
}

fn has_top_level(clause: &str, pattern: &Regex) -> bool {
    collapse_parentheses(clause).is_some_and(|collapsed| pattern.is_match(&collapsed))
}

fn operand(clause: &str, operator: Operator) -> String {
    if has_top_level(clause, operator.conflicting()) {
        format!("({clause})")
    } else {
        clause.to_string()
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.clause)
    }
}

impl FromStr for Filter {
    type Err = DivertError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<&str> for Filter {
    type Error = DivertError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for Filter {
    type Error = DivertError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<bool> for Filter {
    fn from(value: bool) -> Self {
        Self::trusted(if value { "true" } else { "false" }.to_string())
    }
}

impl From<Field> for Filter {
    fn from(field: Field) -> Self {
        Self::trusted(field.name().to_string())
    }
}

impl PartialEq<str> for Filter {
    fn eq(&self, other: &str) -> bool {
        self.clause == other
    }
}

impl PartialEq<&str> for Filter {
    fn eq(&self, other: &&str) -> bool {
        self.clause == *other
    }
}

impl Not for Filter {
    type Output = Filter;

    fn not(self) -> Filter {
        let single_token = collapse_parentheses(&self.clause)
            .is_some_and(|collapsed| !collapsed.trim().contains(char::is_whitespace));
        if single_token {
            Filter::trusted(format!("not {}", self.clause))
        } else {
            Filter::trusted(format!("not ({})", self.clause))
        }
    }
}

macro_rules! combinator {
    ($trait:ident, $method:ident, $operator:expr) => {
        impl $trait<Filter> for Filter {
            type Output = Filter;

            fn $method(self, rhs: Filter) -> Filter {
                self.combine($operator, &rhs)
            }
        }

        impl $trait<Field> for Filter {
            type Output = Filter;

            fn $method(self, rhs: Field) -> Filter {
                self.combine($operator, &Filter::from(rhs))
            }
        }

        impl $trait<Filter> for Field {
            type Output = Filter;

            fn $method(self, rhs: Filter) -> Filter {
                Filter::from(self).combine($operator, &rhs)
            }
        }

        impl $trait<Field> for Field {
            type Output = Filter;

            fn $method(self, rhs: Field) -> Filter {
                Filter::from(self).combine($operator, &Filter::from(rhs))
            }
        }
    };
}

combinator!(BitAnd, bitand, Operator::And);
combinator!(BitOr, bitor, Operator::Or);
