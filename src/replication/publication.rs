// ABOUTME: Publication planning for realtime setup
// ABOUTME: Diffs source publications against the target and renders the SQL to converge them

use std::collections::HashSet;

use crate::schema::{quote_ident, quote_table_path, Publication};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicationChange {
    Create {
        name: String,
        all_tables: bool,
        tables: Vec<String>,
        operations: Vec<String>,
    },
    AddTables {
        name: String,
        tables: Vec<String>,
    },
}

impl PublicationChange {
    pub fn to_sql(&self) -> String {
        match self {
            PublicationChange::Create {
                name,
                all_tables,
                tables,
                operations,
            } => {
                let mut sql = format!("CREATE PUBLICATION {}", quote_ident(name));
                if *all_tables {
                    sql.push_str(" FOR ALL TABLES");
                } else if !tables.is_empty() {
                    sql.push_str(&format!(" FOR TABLE {}", quoted_list(tables)));
                }
                if !operations.is_empty() {
                    sql.push_str(&format!(" WITH (publish = '{}')", operations.join(", ")));
                }
                sql
            }
            PublicationChange::AddTables { name, tables } => format!(
                "ALTER PUBLICATION {} ADD TABLE {}",
                quote_ident(name),
                quoted_list(tables)
            ),
        }
    }
}

fn quoted_list(tables: &[String]) -> String {
    tables
        .iter()
        .map(|t| quote_table_path(t))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Changes needed so the target publishes what the source publishes.
///
/// Tables missing from `target_tables` are left out; a publication cannot
/// reference a table that does not exist.
pub fn plan_publications(
    source: &[Publication],
    target: &[Publication],
    target_tables: &HashSet<String>,
) -> Vec<PublicationChange> {
    let mut changes = Vec::new();

    for publication in source {
        let wanted: Vec<String> = publication
            .tables
            .iter()
            .filter(|t| target_tables.contains(*t))
            .cloned()
            .collect();

        match target.iter().find(|p| p.name == publication.name) {
            None => changes.push(PublicationChange::Create {
                name: publication.name.clone(),
                all_tables: publication.all_tables,
                tables: wanted,
                operations: publication.operations.clone(),
            }),
            Some(existing) if existing.all_tables => {}
            Some(existing) => {
                let missing: Vec<String> = wanted
                    .into_iter()
                    .filter(|t| !existing.tables.contains(t))
                    .collect();
                if !missing.is_empty() {
                    changes.push(PublicationChange::AddTables {
                        name: publication.name.clone(),
                        tables: missing,
                    });
                }
            }
        }
    }

    changes
}
