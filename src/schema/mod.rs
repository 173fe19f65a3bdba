// ABOUTME: Structured description of a project's database schema
// ABOUTME: Produced by the schema inspector and rendered back to SQL for the target

pub mod ddl;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub extensions: Vec<Extension>,
    pub tables: Vec<Table>,
    pub indexes: Vec<Index>,
    pub views: Vec<View>,
    pub functions: Vec<Function>,
    pub triggers: Vec<Trigger>,
    pub policies: Vec<Policy>,
    pub roles: Vec<Role>,
    pub publications: Vec<Publication>,
}

impl DatabaseSchema {
    pub fn table(&self, qualified_name: &str) -> Option<&Table> {
        self.tables
            .iter()
            .find(|t| t.qualified_name() == qualified_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extension {
    pub name: String,
    pub schema: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub schema: String,
    pub name: String,
    pub columns: Vec<Column>,
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub rls_enabled: bool,
}

impl Table {
    /// `schema.name`, the form used in filters and exclusion lists.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn quoted_name(&self) -> String {
        quote_qualified(&self.schema, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub name: String,
    /// Output of `pg_get_constraintdef`, e.g. `PRIMARY KEY (id)`.
    pub definition: String,
}

impl Constraint {
    pub fn is_foreign_key(&self) -> bool {
        self.definition
            .trim_start()
            .to_uppercase()
            .starts_with("FOREIGN KEY")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub schema: String,
    pub name: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub schema: String,
    pub name: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub schema: String,
    pub table: String,
    pub name: String,
    /// ALL, SELECT, INSERT, UPDATE or DELETE.
    pub command: String,
    pub permissive: bool,
    pub roles: Vec<String>,
    pub using: Option<String>,
    pub with_check: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub can_login: bool,
    pub inherit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub name: String,
    pub all_tables: bool,
    /// Qualified `schema.table` names; empty when `all_tables` is set.
    pub tables: Vec<String>,
    /// Published operations, e.g. `insert`, `update`, `delete`, `truncate`.
    pub operations: Vec<String>,
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Quote a `schema.table` (or bare `table`, assumed public) name.
pub fn quote_table_path(path: &str) -> String {
    match path.split_once('.') {
        Some((schema, name)) => quote_qualified(schema, name),
        None => quote_qualified("public", path),
    }
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
