//! Statement builders
//!
//! Renders the SQL text for the mapper's SELECT/INSERT helpers. Only row
//! values are ever bound through placeholders; table names, column names,
//! predicates, and raw conflict clauses are interpolated verbatim and must
//! come from trusted code.

use std::fmt::Write;

/// Conflict handling for an INSERT statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnConflict {
    /// `ON CONFLICT DO NOTHING`
    DoNothing,
    /// `ON CONFLICT (<keys>) DO UPDATE SET ...`, updating every inserted column
    DoUpdate { keys: Vec<String> },
    /// `ON CONFLICT <clause>`, with the clause supplied verbatim by the caller
    Raw(String),
}

impl OnConflict {
    /// Render the clause, including its leading space.
    ///
    /// `DoUpdate` assignments reuse the placeholders of the first VALUES
    /// tuple, so the updated row equals the row that failed to insert.
    fn render(&self, columns: &[String], out: &mut String) {
        match self {
            OnConflict::DoNothing => out.push_str(" ON CONFLICT DO NOTHING"),
            OnConflict::DoUpdate { keys } => {
                out.push_str(" ON CONFLICT (");
                out.push_str(&keys.join(","));
                out.push_str(") DO UPDATE SET ");
                for (i, column) in columns.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{} = ${}", column, i + 1);
                }
            }
            OnConflict::Raw(clause) => {
                out.push_str(" ON CONFLICT ");
                out.push_str(clause);
            }
        }
    }
}

/// A `SELECT <columns> FROM <table> [WHERE <predicate>];` statement
#[derive(Debug, Clone)]
pub struct Select {
    table: String,
    columns: String,
    predicate: Option<String>,
}

impl Select {
    pub fn new(table: &str, columns: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: columns.to_string(),
            predicate: None,
        }
    }

    /// Attach a WHERE predicate, interpolated verbatim
    pub fn filter(mut self, predicate: &str) -> Self {
        self.predicate = Some(predicate.to_string());
        self
    }

    pub fn sql(&self) -> String {
        let mut sql = format!("SELECT {} FROM {}", self.columns, self.table);
        if let Some(predicate) = &self.predicate {
            sql.push_str(" WHERE ");
            sql.push_str(predicate);
        }
        sql.push(';');
        sql
    }
}

/// An `INSERT INTO <table> (<columns>) VALUES ...` statement with
/// sequentially numbered placeholders
#[derive(Debug, Clone)]
pub struct Insert {
    table: String,
    columns: Vec<String>,
    rows: usize,
    on_conflict: Option<OnConflict>,
}

impl Insert {
    pub fn new(table: &str, columns: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: 1,
            on_conflict: None,
        }
    }

    /// Number of VALUES tuples to render (placeholder numbering continues
    /// across tuples)
    pub fn rows(mut self, rows: usize) -> Self {
        self.rows = rows;
        self
    }

    pub fn on_conflict(mut self, conflict: OnConflict) -> Self {
        self.on_conflict = Some(conflict);
        self
    }

    pub fn sql(&self) -> String {
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ",
            self.table,
            self.columns.join(",")
        );
        let mut placeholder = 0;
        for row in 0..self.rows {
            if row > 0 {
                sql.push(',');
            }
            sql.push('(');
            for i in 0..self.columns.len() {
                if i > 0 {
                    sql.push(',');
                }
                placeholder += 1;
                let _ = write!(sql, "${}", placeholder);
            }
            sql.push(')');
        }
        if let Some(conflict) = &self.on_conflict {
            conflict.render(&self.columns, &mut sql);
        }
        sql
    }
}
