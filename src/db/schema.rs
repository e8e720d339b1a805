use sqlx::SqlitePool;

pub const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

pub async fn apply(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = split_sql_statements(SCHEMA_SQL);
    for statement in &statements {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::debug!(statements = statements.len(), "schema applied");
    Ok(())
}

pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut in_line_comment = false;

    for ch in sql.chars() {
        if in_line_comment {
            if ch == '\n' {
                in_line_comment = false;
                current.push(ch);
            }
            continue;
        }

        match ch {
            '-' if !in_single_quote && !in_double_quote && current.ends_with('-') => {
                current.pop();
                in_line_comment = true;
                continue;
            }
            '\'' if !in_double_quote => in_single_quote = !in_single_quote,
            '"' if !in_single_quote => in_double_quote = !in_double_quote,
            ';' if !in_single_quote && !in_double_quote => {
                let stmt = current.trim();
                if !stmt.is_empty() {
                    statements.push(stmt.to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }

        current.push(ch);
    }

    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }

    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_semicolons_outside_quotes() {
        let sql = "CREATE TABLE a (x TEXT DEFAULT ';');\n-- note; here\nINSERT INTO \"b;c\" VALUES (1);";
        let statements = split_sql_statements(sql);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "CREATE TABLE a (x TEXT DEFAULT ';')");
        assert_eq!(statements[1], "INSERT INTO \"b;c\" VALUES (1)");
    }

    #[test]
    fn embedded_schema_has_every_table() {
        let statements = split_sql_statements(SCHEMA_SQL);
        for table in [
            "departments",
            "users",
            "sessions",
            "groups",
            "modules",
            "module_prerequisites",
            "questions",
            "assessments",
            "assessment_questions",
            "submissions",
            "notices",
            "notice_reads",
            "performance_metrics",
        ] {
            let needle = format!("CREATE TABLE IF NOT EXISTS \"{table}\"");
            assert!(
                statements.iter().any(|s| s.starts_with(&needle)),
                "missing table {table}"
            );
        }
    }
}
