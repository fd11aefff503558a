//! Audience filter expressions.
//!
//! A filter map (`key -> value`) parses into a small AST rather than being
//! concatenated into SQL text. A key suffixed with `NOT` inverts the
//! comparison to `!=` and joins its alternates with `AND`; comma-separated
//! values split into alternates; keys combine with `AND` in lexicographic
//! key order, so the same map always yields the same clause.
//!
//! The AST has three renderings: a canonical text clause (snapshots, cursor
//! declarations), a parameterized `$n` clause for the Postgres driver, and
//! a direct row matcher used by the in-memory push db.

use std::collections::BTreeMap;

use crate::error::{DispatchError, Result};
use crate::storage::PushUser;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterExpr {
    Eq { column: String, value: String },
    Neq { column: String, value: String },
    Or(Vec<FilterExpr>),
    And(Vec<FilterExpr>),
}

/// A conjunction of per-key filter terms. Empty means "no clause".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    terms: Vec<FilterExpr>,
}

impl Filters {
    /// Parse a filter map. Key order in the output is the map's sorted key
    /// order, making the rendered clause deterministic.
    pub fn from_map(filters: &BTreeMap<String, String>) -> Result<Filters> {
        let mut terms = Vec::with_capacity(filters.len());
        for (key, value) in filters {
            let (column, negated) = match key.strip_suffix("NOT") {
                Some(stripped) => (stripped.trim_end_matches('_'), true),
                None => (key.as_str(), false),
            };
            validate_column(column)?;

            let alternates: Vec<&str> = value.split(',').collect();
            let mut leaves = Vec::with_capacity(alternates.len());
            for alt in alternates {
                leaves.push(if negated {
                    FilterExpr::Neq {
                        column: column.to_string(),
                        value: alt.to_string(),
                    }
                } else {
                    FilterExpr::Eq {
                        column: column.to_string(),
                        value: alt.to_string(),
                    }
                });
            }
            terms.push(match (leaves.len(), negated) {
                (1, _) => leaves.remove(0),
                (_, false) => FilterExpr::Or(leaves),
                (_, true) => FilterExpr::And(leaves),
            });
        }
        Ok(Filters { terms })
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Canonical text rendering; multi-value groups are parenthesized and
    /// single quotes in values are doubled.
    pub fn to_clause(&self) -> String {
        self.terms
            .iter()
            .map(render_term)
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// Parameterized rendering starting at placeholder `$next_param`.
    /// Returns the clause and the bind values in placeholder order.
    pub fn to_sql(&self, next_param: usize) -> (String, Vec<String>) {
        let mut params = Vec::new();
        let mut index = next_param;
        let clause = self
            .terms
            .iter()
            .map(|term| render_term_sql(term, &mut index, &mut params))
            .collect::<Vec<_>>()
            .join(" AND ");
        (clause, params)
    }

    /// Evaluate the filter against one user row.
    pub fn matches(&self, user: &PushUser) -> bool {
        self.terms.iter().all(|term| eval(term, user))
    }
}

fn validate_column(column: &str) -> Result<()> {
    let well_formed = !column.is_empty()
        && column
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if well_formed {
        Ok(())
    } else {
        Err(DispatchError::Validation(format!(
            "invalid filter column: {:?}",
            column
        )))
    }
}

fn render_term(term: &FilterExpr) -> String {
    match term {
        FilterExpr::Eq { column, value } => {
            format!("\"{}\"='{}'", column, value.replace('\'', "''"))
        }
        FilterExpr::Neq { column, value } => {
            format!("\"{}\"!='{}'", column, value.replace('\'', "''"))
        }
        FilterExpr::Or(children) => {
            let inner = children.iter().map(render_term).collect::<Vec<_>>();
            format!("({})", inner.join(" OR "))
        }
        FilterExpr::And(children) => {
            let inner = children.iter().map(render_term).collect::<Vec<_>>();
            format!("({})", inner.join(" AND "))
        }
    }
}

fn render_term_sql(term: &FilterExpr, index: &mut usize, params: &mut Vec<String>) -> String {
    match term {
        FilterExpr::Eq { column, value } => {
            params.push(value.clone());
            *index += 1;
            format!("\"{}\" = ${}", column, *index - 1)
        }
        FilterExpr::Neq { column, value } => {
            params.push(value.clone());
            *index += 1;
            format!("\"{}\" != ${}", column, *index - 1)
        }
        FilterExpr::Or(children) => {
            let inner: Vec<String> = children
                .iter()
                .map(|c| render_term_sql(c, index, params))
                .collect();
            format!("({})", inner.join(" OR "))
        }
        FilterExpr::And(children) => {
            let inner: Vec<String> = children
                .iter()
                .map(|c| render_term_sql(c, index, params))
                .collect();
            format!("({})", inner.join(" AND "))
        }
    }
}

fn eval(term: &FilterExpr, user: &PushUser) -> bool {
    match term {
        FilterExpr::Eq { column, value } => user.attr(column).map_or(false, |v| v == value.as_str()),
        FilterExpr::Neq { column, value } => user.attr(column).map_or(true, |v| v != value.as_str()),
        FilterExpr::Or(children) => children.iter().any(|c| eval(c, user)),
        FilterExpr::And(children) => children.iter().all(|c| eval(c, user)),
    }
}
