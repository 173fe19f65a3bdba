// ABOUTME: Renders an inspected schema into ordered, idempotent SQL statements
// ABOUTME: Structure statements and security statements are rendered separately

use std::collections::BTreeSet;

use super::{quote_ident, quote_literal, quote_qualified, DatabaseSchema, Policy, Table};

/// Statements that recreate the schema structure on an empty target.
///
/// Order: schemas, extensions, tables, foreign keys, functions, views,
/// indexes, triggers. Foreign keys are deferred so table order does not matter.
pub fn render_schema(schema: &DatabaseSchema) -> Vec<String> {
    let mut statements = Vec::new();

    let schemas: BTreeSet<&str> = schema
        .tables
        .iter()
        .map(|t| t.schema.as_str())
        .chain(schema.views.iter().map(|v| v.schema.as_str()))
        .chain(schema.functions.iter().map(|f| f.schema.as_str()))
        .chain(schema.extensions.iter().map(|e| e.schema.as_str()))
        .filter(|s| *s != "public")
        .collect();
    for name in schemas {
        statements.push(format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(name)));
    }

    for ext in &schema.extensions {
        statements.push(format!(
            "CREATE EXTENSION IF NOT EXISTS {} WITH SCHEMA {}",
            quote_ident(&ext.name),
            quote_ident(&ext.schema)
        ));
    }

    for table in &schema.tables {
        statements.push(render_table(table));
    }

    for table in &schema.tables {
        for constraint in table.constraints.iter().filter(|c| c.is_foreign_key()) {
            statements.push(format!(
                "ALTER TABLE {} ADD CONSTRAINT {} {}",
                table.quoted_name(),
                quote_ident(&constraint.name),
                constraint.definition
            ));
        }
    }

    for function in &schema.functions {
        statements.push(function.definition.trim().trim_end_matches(';').to_string());
    }

    for view in &schema.views {
        statements.push(format!(
            "CREATE OR REPLACE VIEW {} AS {}",
            quote_qualified(&view.schema, &view.name),
            view.definition.trim().trim_end_matches(';')
        ));
    }

    for index in &schema.indexes {
        statements.push(make_if_not_exists(&index.definition));
    }

    for trigger in &schema.triggers {
        statements.push(replace_prefix(
            &trigger.definition,
            "CREATE TRIGGER",
            "CREATE OR REPLACE TRIGGER",
        ));
    }

    statements
}

/// Roles, row-level security switches and policies.
pub fn render_security(schema: &DatabaseSchema) -> Vec<String> {
    let mut statements = Vec::new();

    for role in &schema.roles {
        let mut options = vec![if role.can_login { "LOGIN" } else { "NOLOGIN" }];
        options.push(if role.inherit { "INHERIT" } else { "NOINHERIT" });
        statements.push(format!(
            "DO $$ BEGIN IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = {}) THEN CREATE ROLE {} {}; END IF; END $$",
            quote_literal(&role.name),
            quote_ident(&role.name),
            options.join(" ")
        ));
    }

    for table in schema.tables.iter().filter(|t| t.rls_enabled) {
        statements.push(format!(
            "ALTER TABLE {} ENABLE ROW LEVEL SECURITY",
            table.quoted_name()
        ));
    }

    for policy in &schema.policies {
        let target = quote_qualified(&policy.schema, &policy.table);
        statements.push(format!(
            "DROP POLICY IF EXISTS {} ON {}",
            quote_ident(&policy.name),
            target
        ));
        statements.push(render_policy(policy, &target));
    }

    statements
}

fn render_table(table: &Table) -> String {
    let mut lines: Vec<String> = table
        .columns
        .iter()
        .map(|col| {
            let mut line = format!("{} {}", quote_ident(&col.name), col.data_type);
            if !col.nullable {
                line.push_str(" NOT NULL");
            }
            if let Some(default) = &col.default {
                line.push_str(" DEFAULT ");
                line.push_str(default);
            }
            line
        })
        .collect();

    for constraint in table.constraints.iter().filter(|c| !c.is_foreign_key()) {
        lines.push(format!(
            "CONSTRAINT {} {}",
            quote_ident(&constraint.name),
            constraint.definition
        ));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        table.quoted_name(),
        lines.join(", ")
    )
}

fn render_policy(policy: &Policy, target: &str) -> String {
    let mut sql = format!(
        "CREATE POLICY {} ON {} AS {} FOR {}",
        quote_ident(&policy.name),
        target,
        if policy.permissive {
            "PERMISSIVE"
        } else {
            "RESTRICTIVE"
        },
        policy.command.to_uppercase()
    );

    if !policy.roles.is_empty() {
        let roles: Vec<String> = policy
            .roles
            .iter()
            .map(|r| if r == "public" { r.clone() } else { quote_ident(r) })
            .collect();
        sql.push_str(&format!(" TO {}", roles.join(", ")));
    }
    if let Some(using) = &policy.using {
        sql.push_str(&format!(" USING ({})", using));
    }
    if let Some(check) = &policy.with_check {
        sql.push_str(&format!(" WITH CHECK ({})", check));
    }
    sql
}

fn make_if_not_exists(definition: &str) -> String {
    let trimmed = definition.trim();
    if trimmed.to_uppercase().contains("IF NOT EXISTS") {
        return trimmed.to_string();
    }
    let unique = replace_prefix(trimmed, "CREATE UNIQUE INDEX", "CREATE UNIQUE INDEX IF NOT EXISTS");
    if unique != trimmed {
        return unique;
    }
    replace_prefix(trimmed, "CREATE INDEX", "CREATE INDEX IF NOT EXISTS")
}

fn replace_prefix(text: &str, prefix: &str, replacement: &str) -> String {
    let trimmed = text.trim();
    match trimmed.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => {
            format!("{}{}", replacement, &trimmed[prefix.len()..])
        }
        _ => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, Constraint, Extension, Index, Role, Trigger};

    fn sample() -> DatabaseSchema {
        DatabaseSchema {
            extensions: vec![Extension {
                name: "pgcrypto".to_string(),
                schema: "extensions".to_string(),
            }],
            tables: vec![
                Table {
                    schema: "public".to_string(),
                    name: "orders".to_string(),
                    columns: vec![
                        Column {
                            name: "id".to_string(),
                            data_type: "bigint".to_string(),
                            nullable: false,
                            default: None,
                        },
                        Column {
                            name: "user_id".to_string(),
                            data_type: "uuid".to_string(),
                            nullable: true,
                            default: None,
                        },
                    ],
                    constraints: vec![
                        Constraint {
                            name: "orders_pkey".to_string(),
                            definition: "PRIMARY KEY (id)".to_string(),
                        },
                        Constraint {
                            name: "orders_user_fk".to_string(),
                            definition: "FOREIGN KEY (user_id) REFERENCES app.users(id)"
                                .to_string(),
                        },
                    ],
                    rls_enabled: true,
                },
                Table {
                    schema: "app".to_string(),
                    name: "users".to_string(),
                    columns: vec![Column {
                        name: "id".to_string(),
                        data_type: "uuid".to_string(),
                        nullable: false,
                        default: Some("gen_random_uuid()".to_string()),
                    }],
                    constraints: vec![],
                    rls_enabled: false,
                },
            ],
            indexes: vec![Index {
                schema: "public".to_string(),
                table: "orders".to_string(),
                name: "orders_user_idx".to_string(),
                definition: "CREATE INDEX orders_user_idx ON public.orders USING btree (user_id)"
                    .to_string(),
            }],
            triggers: vec![Trigger {
                schema: "public".to_string(),
                table: "orders".to_string(),
                name: "touch".to_string(),
                definition: "CREATE TRIGGER touch BEFORE UPDATE ON public.orders FOR EACH ROW EXECUTE FUNCTION touch()".to_string(),
            }],
            roles: vec![Role {
                name: "reporting".to_string(),
                can_login: false,
                inherit: true,
            }],
            policies: vec![Policy {
                schema: "public".to_string(),
                table: "orders".to_string(),
                name: "own orders".to_string(),
                command: "select".to_string(),
                permissive: true,
                roles: vec!["authenticated".to_string()],
                using: Some("auth.uid() = user_id".to_string()),
                with_check: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_foreign_keys_come_after_all_tables() {
        let statements = render_schema(&sample());
        let last_table = statements
            .iter()
            .rposition(|s| s.starts_with("CREATE TABLE"))
            .unwrap();
        let fk = statements
            .iter()
            .position(|s| s.contains("FOREIGN KEY"))
            .unwrap();
        assert!(fk > last_table);
        assert!(!statements[..=last_table]
            .iter()
            .any(|s| s.contains("FOREIGN KEY")));
    }

    #[test]
    fn test_table_rendering() {
        let statements = render_schema(&sample());
        assert!(statements.contains(&"CREATE SCHEMA IF NOT EXISTS \"app\"".to_string()));
        assert!(statements.contains(
            &"CREATE TABLE IF NOT EXISTS \"app\".\"users\" (\"id\" uuid NOT NULL DEFAULT gen_random_uuid())"
                .to_string()
        ));
    }

    #[test]
    fn test_indexes_and_triggers_are_idempotent() {
        let statements = render_schema(&sample());
        assert!(statements
            .iter()
            .any(|s| s.starts_with("CREATE INDEX IF NOT EXISTS orders_user_idx")));
        assert!(statements
            .iter()
            .any(|s| s.starts_with("CREATE OR REPLACE TRIGGER touch")));
    }

    #[test]
    fn test_security_statements() {
        let statements = render_security(&sample());
        assert!(statements[0].contains("CREATE ROLE \"reporting\" NOLOGIN INHERIT"));
        assert!(statements
            .contains(&"ALTER TABLE \"public\".\"orders\" ENABLE ROW LEVEL SECURITY".to_string()));
        let policy = statements.last().unwrap();
        assert_eq!(
            policy,
            "CREATE POLICY \"own orders\" ON \"public\".\"orders\" AS PERMISSIVE FOR SELECT TO \"authenticated\" USING (auth.uid() = user_id)"
        );
    }

    #[test]
    fn test_make_if_not_exists_unique() {
        assert_eq!(
            make_if_not_exists("CREATE UNIQUE INDEX a ON t (x)"),
            "CREATE UNIQUE INDEX IF NOT EXISTS a ON t (x)"
        );
    }
}
