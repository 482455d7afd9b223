// Row filter expressions
//
// Grammar: clause ('&' clause)*
//          clause = column op number
//          column = ident | 'quoted' | "quoted" | matrix['quoted']
//          op     = > | >= | < | <= | == | !=

use crate::domain::error::{DomainError, Result};
use crate::domain::table::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl CompareOp {
    fn eval(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CompareOp::Gt => lhs > rhs,
            CompareOp::Ge => lhs >= rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Le => lhs <= rhs,
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub column: String,
    pub op: CompareOp,
    pub value: f64,
}

/// Conjunction of column comparisons
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowFilter {
    clauses: Vec<Clause>,
}

impl RowFilter {
    pub fn parse(expr: &str) -> Result<Self> {
        if expr.trim().is_empty() {
            return Ok(Self::default());
        }
        let clauses = expr
            .split('&')
            .map(parse_clause)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { clauses })
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Keep only rows matching every clause. Unknown columns are an error.
    pub fn apply(&self, table: Table) -> Result<Table> {
        if self.clauses.is_empty() {
            return Ok(table);
        }

        let resolved = self
            .clauses
            .iter()
            .map(|clause| {
                table
                    .column_index(&clause.column)
                    .map(|idx| (idx, clause.op, clause.value))
                    .ok_or_else(|| {
                        DomainError::InvalidFilter(format!("unknown column '{}'", clause.column))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(table.retain_rows(|values| {
            resolved
                .iter()
                .all(|(idx, op, rhs)| op.eval(values[*idx], *rhs))
        }))
    }
}

fn parse_clause(raw: &str) -> Result<Clause> {
    let raw = raw.trim();
    let (column_part, op, value_part) = split_on_operator(raw)
        .ok_or_else(|| DomainError::InvalidFilter(format!("missing comparison in '{}'", raw)))?;

    let column = parse_column(column_part.trim())?;
    let value: f64 = value_part.trim().parse().map_err(|_| {
        DomainError::InvalidFilter(format!("'{}' is not a number", value_part.trim()))
    })?;

    Ok(Clause { column, op, value })
}

fn split_on_operator(raw: &str) -> Option<(&str, CompareOp, &str)> {
    // Two-character operators first so ">=" is not read as ">"
    const OPERATORS: [(&str, CompareOp); 6] = [
        (">=", CompareOp::Ge),
        ("<=", CompareOp::Le),
        ("==", CompareOp::Eq),
        ("!=", CompareOp::Ne),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
    ];

    OPERATORS.iter().find_map(|(token, op)| {
        raw.find(token)
            .map(|pos| (&raw[..pos], *op, &raw[pos + token.len()..]))
    })
}

fn parse_column(raw: &str) -> Result<String> {
    let inner = raw
        .strip_prefix("matrix[")
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(raw)
        .trim();

    let unquoted = ['\'', '"']
        .iter()
        .find_map(|q| inner.strip_prefix(*q).and_then(|s| s.strip_suffix(*q)))
        .unwrap_or(inner);

    if unquoted.is_empty() {
        return Err(DomainError::InvalidFilter("empty column name".to_string()));
    }
    let is_bare = unquoted.len() == inner.len();
    if is_bare
        && !unquoted
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(DomainError::InvalidFilter(format!(
            "invalid column name '{}'",
            unquoted
        )));
    }
    Ok(unquoted.to_string())
}
