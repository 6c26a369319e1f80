//! SQL text generation: the introspection statement, the row-as-JSON select,
//! the partial-update template, and the update-statement compiler.
//!
//! The update template carries a `{fields}` placeholder for the SET list and
//! a `{pk}` placeholder for the primary-key parameter; Postgres parameters
//! are positional, so the key's `$n` is only known once the changed fields
//! are counted.
use crate::types::{bind_partition_key, bind_value, BindValue};
use crate::{Result, SchemaQuery, StoreError, TableIdent};
use serde_json::Value;

/// A compiled partial UPDATE: final SQL plus its typed parameter list, with
/// the primary-key parameter last.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub sql: String,
    pub params: Vec<BindValue>,
}

/// Double-quote an identifier, escaping embedded quotes. Needed because
/// column names are carried verbatim in JSON payloads and unquoted
/// identifiers would fold to lowercase.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Schema discovery statement for one table.
///
/// Table identity comes from operator configuration, not from request
/// payloads, so inlining it here is not an injection surface.
pub fn introspection_query(table: &TableIdent) -> String {
    let schema = table.schema.replace('\'', "''");
    let name = table.table.replace('\'', "''");
    format!(
        "SELECT c.column_name AS column_name, \
           (c.is_nullable = 'YES') AS is_nullable, \
           (c.is_identity = 'YES') AS is_identity, \
           lower(c.udt_name) AS sql_type, \
           COALESCE(c.character_maximum_length, 0) AS char_size, \
           COALESCE(c.numeric_precision, 0) AS num_precision, \
           COALESCE(c.numeric_scale, 0) AS num_scale, \
           EXISTS (\
             SELECT 1 \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON kcu.constraint_name = tc.constraint_name \
              AND kcu.table_schema = tc.table_schema \
             WHERE tc.constraint_type = 'PRIMARY KEY' \
               AND tc.table_schema = c.table_schema \
               AND tc.table_name = c.table_name \
               AND kcu.column_name = c.column_name\
           ) AS is_primary_key \
         FROM information_schema.columns c \
         WHERE c.table_schema = '{schema}' AND c.table_name = '{name}' \
         ORDER BY c.ordinal_position"
    )
}

/// Read-one-row-as-JSON select, keyed by primary key (`$1`).
pub fn select_row_json(schema: &SchemaQuery) -> Result<String> {
    let primary_key = schema.primary_key()?;
    let select_list = schema
        .columns_all
        .iter()
        .map(|c| quote_ident(&c.column_name))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!(
        "SELECT row_to_json(r)::text FROM (SELECT {select_list} FROM {table} WHERE {pk} = $1) r",
        table = schema.table.qualified(),
        pk = quote_ident(&primary_key.column_name),
    ))
}

/// Partial-update template with `{fields}` and `{pk}` placeholders.
pub fn update_template(schema: &SchemaQuery) -> Result<String> {
    let primary_key = schema.primary_key()?;
    Ok(format!(
        "UPDATE {table} SET {{fields}} WHERE {pk} = {{pk}}",
        table = schema.table.qualified(),
        pk = quote_ident(&primary_key.column_name),
    ))
}

/// Expand the template against the changed-fields object.
///
/// Fields with no matching writable column are silently ignored; they are
/// stray or computed fields, not errors. A payload where nothing matches
/// compiles to no SET list and is rejected instead of producing bad SQL.
pub fn compile_update(
    template: &str,
    partition_key: &str,
    schema: &SchemaQuery,
    changes: &Value,
) -> Result<UpdateStatement> {
    let fields = changes.as_object().ok_or_else(|| StoreError::InvalidValue {
        column: String::new(),
        reason: "changed-fields payload is not a JSON object".to_string(),
    })?;

    let mut set_list = Vec::with_capacity(fields.len());
    let mut params = Vec::with_capacity(fields.len() + 1);

    for (name, value) in fields {
        let Some(column) = schema.column_no_pk(name) else {
            continue;
        };
        params.push(bind_value(column, value)?);
        set_list.push(format!(
            "{} = ${}",
            quote_ident(&column.column_name),
            params.len()
        ));
    }

    if set_list.is_empty() {
        return Err(StoreError::NoMappedColumns);
    }

    // The primary-key parameter is always bound last.
    params.push(bind_partition_key(schema.primary_key()?, partition_key)?);

    let sql = template
        .replace("{fields}", &set_list.join(", "))
        .replace("{pk}", &format!("${}", params.len()));

    Ok(UpdateStatement { sql, params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SchemaColumn;
    use serde_json::json;

    fn col(name: &str, sql_type: &str, pk: bool) -> SchemaColumn {
        SchemaColumn {
            column_name: name.to_string(),
            is_primary_key: pk,
            is_identity: pk,
            is_nullable: !pk,
            sql_type: sql_type.to_string(),
            size: 0,
            precision: 0,
            scale: 0,
        }
    }

    fn schema() -> SchemaQuery {
        let columns = vec![
            col("PrimaryKey", "int4", true),
            col("ForeignKey", "int4", false),
            col("IsYes", "bool", false),
            col("Label", "varchar", false),
        ];
        SchemaQuery {
            query: String::new(),
            table: TableIdent::new("dbo", "RudimentaryEntity"),
            primary_key: Some(columns[0].clone()),
            columns_no_pk: columns[1..].to_vec(),
            columns_all: columns,
        }
    }

    #[test]
    fn set_list_matches_payload_fields_and_binds_pk_last() {
        let schema = schema();
        let template = update_template(&schema).unwrap();
        let changes = json!({"ForeignKey": 77, "IsYes": false});

        let statement = compile_update(&template, "5002", &schema, &changes).unwrap();

        assert_eq!(
            statement.sql,
            "UPDATE \"dbo\".\"RudimentaryEntity\" SET \
             \"ForeignKey\" = $1, \"IsYes\" = $2 WHERE \"PrimaryKey\" = $3"
        );
        assert_eq!(
            statement.params,
            vec![
                BindValue::Int(Some(77)),
                BindValue::Bool(Some(false)),
                BindValue::Int(Some(5002)),
            ]
        );
    }

    #[test]
    fn stray_fields_are_ignored() {
        let schema = schema();
        let template = update_template(&schema).unwrap();
        let changes = json!({"Label": "x", "Computed": 1, "PrimaryKey": 5002});

        let statement = compile_update(&template, "5002", &schema, &changes).unwrap();

        // "Computed" has no column; the pk field never enters the SET list.
        assert!(statement.sql.contains("\"Label\" = $1"));
        assert!(!statement.sql.contains("Computed"));
        assert_eq!(statement.params.len(), 2);
    }

    #[test]
    fn all_stray_payload_is_rejected() {
        let schema = schema();
        let template = update_template(&schema).unwrap();
        let changes = json!({"Computed": 1});

        assert!(matches!(
            compile_update(&template, "5002", &schema, &changes),
            Err(StoreError::NoMappedColumns)
        ));
    }

    #[test]
    fn select_quotes_identifiers() {
        let select = select_row_json(&schema()).unwrap();
        assert_eq!(
            select,
            "SELECT row_to_json(r)::text FROM (SELECT \"PrimaryKey\", \"ForeignKey\", \
             \"IsYes\", \"Label\" FROM \"dbo\".\"RudimentaryEntity\" \
             WHERE \"PrimaryKey\" = $1) r"
        );
    }

    #[test]
    fn missing_primary_key_is_fatal() {
        let mut schema = schema();
        schema.primary_key = None;
        assert!(matches!(
            update_template(&schema),
            Err(StoreError::NoPrimaryKey(_))
        ));
    }
}
