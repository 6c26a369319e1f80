//! Managed record types and the schema fixture for the in-memory backend.
//!
//! Field names serialize in PascalCase to match the column names the store
//! reports; the engine matches payload fields to columns case-sensitively.
use crate::config::Entity;
use chrono::NaiveDateTime;
use conflux_engine::Resource;
use conflux_store::{SchemaColumn, SchemaQuery, TableIdent};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
#[allow(dead_code)]
pub struct RudimentaryEntity {
    pub primary_key: i32,
    pub foreign_key: Option<i32>,
    pub reference_id: Option<Uuid>,
    pub is_yes: Option<bool>,
    pub lucky_number: Option<i32>,
    pub dollar_amount: Option<f64>,
    pub math_calculation: Option<f64>,
    pub label: Option<String>,
    pub right_now: Option<NaiveDateTime>,
}

impl Resource for RudimentaryEntity {
    fn partition_key(&self) -> String {
        self.primary_key.to_string()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
#[allow(dead_code)]
pub struct IntegersEntity {
    pub integers_id: i32,
    pub number1: Option<i32>,
    pub number2: Option<i32>,
    pub number3: Option<i32>,
}

impl Resource for IntegersEntity {
    fn partition_key(&self) -> String {
        self.integers_id.to_string()
    }
}

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

/// Schema the in-memory backend reports; mirrors the Postgres table the
/// service targets by default.
pub fn rudimentary_schema() -> SchemaQuery {
    let columns = vec![
        col("PrimaryKey", "int4", true),
        col("ForeignKey", "int4", false),
        col("ReferenceId", "uuid", false),
        col("IsYes", "bool", false),
        col("LuckyNumber", "int4", false),
        col("DollarAmount", "numeric", false),
        col("MathCalculation", "float8", false),
        col("Label", "varchar", false),
        col("RightNow", "timestamp", false),
    ];
    SchemaQuery {
        query: String::new(),
        table: TableIdent::new("public", "RudimentaryEntity"),
        primary_key: Some(columns[0].clone()),
        columns_no_pk: columns[1..].to_vec(),
        columns_all: columns,
    }
}

/// Schema for the all-integer table, the second record type the service can
/// manage.
pub fn integers_schema() -> SchemaQuery {
    let columns = vec![
        col("IntegersId", "int4", true),
        col("Number1", "int4", false),
        col("Number2", "int4", false),
        col("Number3", "int4", false),
    ];
    SchemaQuery {
        query: String::new(),
        table: TableIdent::new("public", "Integers"),
        primary_key: Some(columns[0].clone()),
        columns_no_pk: columns[1..].to_vec(),
        columns_all: columns,
    }
}

pub fn integers_row(integers_id: i32) -> Value {
    json!({
        "IntegersId": integers_id,
        "Number1": 0,
        "Number2": 0,
        "Number3": 0
    })
}

/// Schema plus one seed row for the in-memory backend, per managed entity.
pub fn memory_fixture(entity: Entity) -> (SchemaQuery, &'static str, Value) {
    match entity {
        Entity::Rudimentary => (rudimentary_schema(), "5002", sample_row(5002)),
        Entity::Integers => (integers_schema(), "1", integers_row(1)),
    }
}

/// Seed row for local runs against the in-memory backend.
pub fn sample_row(primary_key: i32) -> Value {
    json!({
        "PrimaryKey": primary_key,
        "ForeignKey": 10,
        "ReferenceId": "903988d3-b96d-430b-a34b-bb1f0db7c9f7",
        "IsYes": true,
        "LuckyNumber": 7,
        "DollarAmount": 100.00,
        "MathCalculation": 0.678593902,
        "Label": "Poisonous",
        "RightNow": "2021-10-17T03:19:54.5433333"
    })
}
