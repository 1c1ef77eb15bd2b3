//! SQL templates keyed by TPC-H query id, with table names resolved for one database.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{BenchError, Result};
use crate::stream::Scalar;

pub const FIRST_QUERY_ID: u32 = 1;
pub const LAST_QUERY_ID: u32 = 23;
/// Query 23 is a refresh pair stored as several statements in one file.
pub const MULTI_STATEMENT_QUERY_ID: u32 = 23;
pub const FRAGMENT_SEPARATOR: &str = ":split:";

/// `:partsupp` must be rewritten before `:part`.
pub const TABLE_NAMES: [&str; 8] = [
    "region", "nation", "customer", "lineitem", "orders", "partsupp", "part", "supplier",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Template {
    Single(String),
    /// Statements that make up one logical query, in execution order.
    Fragments(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: BTreeMap<u32, Template>,
}

impl TemplateSet {
    pub fn from_entries(entries: impl IntoIterator<Item = (u32, Template)>) -> Self {
        Self {
            templates: entries.into_iter().collect(),
        }
    }

    /// Read `<dir>/<id>.sql` for every query id and bind table names to `database_id`.
    pub fn load(dir: &Path, database_id: &Scalar) -> Result<Self> {
        let mut templates = BTreeMap::new();
        for query_id in FIRST_QUERY_ID..=LAST_QUERY_ID {
            let path = dir.join(format!("{query_id}.sql"));
            let raw = std::fs::read_to_string(&path)
                .map_err(|source| BenchError::TemplateLoad { path, source })?;
            let sql = resolve_table_names(&raw, database_id);
            let template = if query_id == MULTI_STATEMENT_QUERY_ID {
                Template::Fragments(split_fragments(&sql))
            } else {
                Template::Single(sql)
            };
            templates.insert(query_id, template);
        }
        Ok(Self { templates })
    }

    pub fn get(&self, query_id: u32) -> Result<&Template> {
        self.templates
            .get(&query_id)
            .ok_or(BenchError::UnknownQuery(query_id))
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

pub fn resolve_table_names(sql: &str, database_id: &Scalar) -> String {
    let suffix = format!("_{database_id}");
    TABLE_NAMES.iter().fold(sql.to_string(), |acc, table| {
        acc.replace(&format!(":{table}"), &format!("{table}{suffix}"))
    })
}

pub fn split_fragments(sql: &str) -> Vec<String> {
    sql.split(FRAGMENT_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Render `$n` placeholders with literal values for logging. Strings are quoted.
///
/// Substitution runs from the highest index down so `$1` never clobbers `$10`.
pub fn fill_binds(sql: &str, binds: &[Scalar]) -> String {
    let mut result = sql.to_string();
    for (i, bind) in binds.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let literal = match bind {
            Scalar::Text(s) => format!("'{s}'"),
            other => other.to_string(),
        };
        result = result.replace(&placeholder, &literal);
    }
    result
}

/// Collapse a multi-line statement onto one log line.
pub fn one_line(sql: &str) -> String {
    sql.replace('\n', " ")
}
