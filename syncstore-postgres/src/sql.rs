//! Compilation of filters and sort keys to PostgreSQL.
//!
//! Record bodies live in a JSONB `data` column, next to the `id`, `last_modified` and
//! `deleted` columns. Every field is read as a nullable JSONB expression, where SQL
//! `NULL` stands for an unset field, and compared through:
//!
//! - a kind rank (number 0, string 1, boolean 2, array 3, object 4, unset 5);
//! - one typed key per kind, `NULL` for values of another kind.
//!
//! This reproduces the ordering of `syncstore_core::evaluator`: kinds order first, then
//! values. Arrays and objects compare through their `jsonb` text under the `C`
//! collation, which `canonical_json` reproduces.

use serde_json::Value;
use sqlx::{Postgres, postgres::PgArguments, query::Query};

use syncstore_core::{
    error::StorageError,
    query::{Comparison, Filter, FilterVisitor, Sort, SortDirection},
    record::{DELETED_FIELD, ID_FIELD, MODIFIED_FIELD},
};

const UNSET_RANK: u8 = 5;

/// A bind parameter. The variant decides the SQL type of the placeholder.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlParam {
    Text(String),
    BigInt(i64),
    Float(f64),
    Bool(bool),
    Json(Value),
}

impl SqlParam {
    fn cast(&self) -> &'static str {
        match self {
            SqlParam::Text(_) => "text",
            SqlParam::BigInt(_) => "bigint",
            SqlParam::Float(_) => "float8",
            SqlParam::Bool(_) => "boolean",
            SqlParam::Json(_) => "jsonb",
        }
    }
}

/// Positional parameters of one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SqlParams(Vec<SqlParam>);

impl SqlParams {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter and returns its typed placeholder, such as `$3::text`.
    pub(crate) fn push(&mut self, param: SqlParam) -> String {
        let cast = param.cast();
        self.0.push(param);
        format!("${}::{cast}", self.0.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn bind<'q>(
        self,
        mut query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        for param in self.0 {
            query = match param {
                SqlParam::Text(value) => query.bind(value),
                SqlParam::BigInt(value) => query.bind(value),
                SqlParam::Float(value) => query.bind(value),
                SqlParam::Bool(value) => query.bind(value),
                SqlParam::Json(value) => query.bind(value),
            };
        }
        query
    }
}

/// Quotes a string literal. Assumes `standard_conforming_strings`, the default since 9.1.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// The JSONB expression reading a possibly dotted field; `NULL` when unset.
///
/// A literal key containing dots wins over the nested path, as in `Record::resolve`.
pub(crate) fn field_expr(field: &str) -> String {
    match field {
        ID_FIELD => "to_jsonb(id)".to_string(),
        MODIFIED_FIELD => "to_jsonb(last_modified)".to_string(),
        DELETED_FIELD => "(CASE WHEN deleted THEN 'true'::jsonb END)".to_string(),
        _ => {
            let literal = format!("data -> {}", quote_literal(field));
            if !field.contains('.') {
                return format!("NULLIF({literal}, 'null'::jsonb)");
            }

            let nested = field
                .split('.')
                .map(quote_literal)
                .fold("data".to_string(), |expr, key| format!("{expr} -> {key}"));
            format!("NULLIF(COALESCE({literal}, {nested}), 'null'::jsonb)")
        }
    }
}

fn rank_expr(expr: &str) -> String {
    format!(
        "COALESCE(CASE jsonb_typeof({expr}) WHEN 'number' THEN 0 WHEN 'string' THEN 1 \
         WHEN 'boolean' THEN 2 WHEN 'array' THEN 3 WHEN 'object' THEN 4 END, {UNSET_RANK})"
    )
}

fn number_key(expr: &str) -> String {
    format!("(CASE WHEN jsonb_typeof({expr}) = 'number' THEN ({expr})::float8 END)")
}

fn string_key(expr: &str) -> String {
    format!("(CASE WHEN jsonb_typeof({expr}) = 'string' THEN {expr} #>> '{{}}' END) COLLATE \"C\"")
}

fn bool_key(expr: &str) -> String {
    format!("(CASE WHEN jsonb_typeof({expr}) = 'boolean' THEN ({expr})::boolean END)")
}

fn container_key(expr: &str, kind: &str) -> String {
    format!("(CASE WHEN jsonb_typeof({expr}) = '{kind}' THEN ({expr})::text END) COLLATE \"C\"")
}

/// What a filter value is compared through.
enum Operand {
    /// Typed key of the field, and the placeholder of the value.
    Typed { key: String, rank: u8, param: String },
    Unset,
}

/// Compiles filters into boolean SQL expressions, collecting their parameters.
///
/// Every filter compiles to a `COALESCE(.., FALSE)` expression, so the three-valued
/// logic of SQL never leaks out of a single comparison.
pub(crate) struct FilterCompiler<'p> {
    params: &'p mut SqlParams,
}

impl<'p> FilterCompiler<'p> {
    pub(crate) fn new(params: &'p mut SqlParams) -> Self {
        Self { params }
    }

    fn operand(&mut self, expr: &str, value: &Value) -> Operand {
        match value {
            Value::Null => Operand::Unset,
            Value::Number(number) => Operand::Typed {
                key: number_key(expr),
                rank: 0,
                param: self
                    .params
                    .push(SqlParam::Float(number.as_f64().unwrap_or(f64::NAN))),
            },
            Value::String(string) => Operand::Typed {
                key: string_key(expr),
                rank: 1,
                param: self.params.push(SqlParam::Text(string.clone())),
            },
            Value::Bool(boolean) => Operand::Typed {
                key: bool_key(expr),
                rank: 2,
                param: self.params.push(SqlParam::Bool(*boolean)),
            },
            Value::Array(_) => Operand::Typed {
                key: container_key(expr, "array"),
                rank: 3,
                param: format!("({})::text", self.params.push(SqlParam::Json(value.clone()))),
            },
            Value::Object(_) => Operand::Typed {
                key: container_key(expr, "object"),
                rank: 4,
                param: format!("({})::text", self.params.push(SqlParam::Json(value.clone()))),
            },
        }
    }
}

fn ordering_operator(operator: Comparison) -> (&'static str, &'static str) {
    match operator {
        Comparison::Gt => (">", ">"),
        Comparison::Min => (">=", ">"),
        Comparison::Lt => ("<", "<"),
        Comparison::Max => ("<=", "<"),
        Comparison::Eq | Comparison::Not => ("=", "="),
    }
}

impl FilterVisitor for FilterCompiler<'_> {
    type Output = String;
    type Error = StorageError;

    fn visit_filter(&mut self, filter: &Filter) -> Result<Self::Output, Self::Error> {
        let expr = field_expr(&filter.field);
        let operand = self.operand(&expr, &filter.value);

        let predicate = match (filter.operator, operand) {
            (Comparison::Eq, Operand::Unset) => format!("{expr} IS NULL"),
            (Comparison::Not, Operand::Unset) => format!("{expr} IS NOT NULL"),
            (Comparison::Eq, Operand::Typed { key, param, .. }) => format!("{key} = {param}"),
            (Comparison::Not, Operand::Typed { key, param, .. }) => {
                format!("({key} = {param}) IS NOT TRUE")
            }
            (operator, Operand::Typed { key, rank, param }) => {
                let (op, strict) = ordering_operator(operator);
                format!("{} {strict} {rank} OR {key} {op} {param}", rank_expr(&expr))
            }
            (operator, Operand::Unset) => {
                let (op, _) = ordering_operator(operator);
                format!("{} {op} {UNSET_RANK}", rank_expr(&expr))
            }
        };

        Ok(format!("COALESCE(({predicate}), FALSE)"))
    }

    fn combine_all(&mut self, outputs: Vec<Self::Output>) -> Result<Self::Output, Self::Error> {
        Ok(match outputs.len() {
            0 => "TRUE".to_string(),
            _ => format!("({})", outputs.join(" AND ")),
        })
    }

    fn combine_any(&mut self, outputs: Vec<Self::Output>) -> Result<Self::Output, Self::Error> {
        Ok(match outputs.len() {
            0 => "FALSE".to_string(),
            _ => format!("({})", outputs.join(" OR ")),
        })
    }
}

/// The `ORDER BY` clause of a sort specification, ending with the id tie-break.
pub(crate) fn order_by(sorting: &[Sort]) -> String {
    let mut keys = Vec::with_capacity(sorting.len() * 6 + 1);

    for sort in sorting {
        let expr = field_expr(&sort.field);
        let direction = match sort.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };

        keys.push(format!("{} {direction}", rank_expr(&expr)));
        keys.push(format!("{} {direction}", number_key(&expr)));
        keys.push(format!("{} {direction}", string_key(&expr)));
        keys.push(format!("{} {direction}", bool_key(&expr)));
        keys.push(format!("{} {direction}", container_key(&expr, "array")));
        keys.push(format!("{} {direction}", container_key(&expr, "object")));
    }
    keys.push("id COLLATE \"C\" ASC".to_string());

    format!("ORDER BY {}", keys.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(filters: &[Filter]) -> (String, SqlParams) {
        let mut params = SqlParams::new();
        let sql = FilterCompiler::new(&mut params).visit_all(filters).unwrap();
        (sql, params)
    }

    #[test]
    fn literals_are_quoted() {
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(field_expr("it's"), "NULLIF(data -> 'it''s', 'null'::jsonb)");
    }

    #[test]
    fn dotted_fields_fall_back_to_nested_path() {
        assert_eq!(
            field_expr("author.name"),
            "NULLIF(COALESCE(data -> 'author.name', data -> 'author' -> 'name'), 'null'::jsonb)"
        );
    }

    #[test]
    fn storage_fields_read_columns() {
        assert_eq!(field_expr("id"), "to_jsonb(id)");
        assert_eq!(field_expr("last_modified"), "to_jsonb(last_modified)");
        assert!(field_expr("deleted").contains("WHEN deleted"));
    }

    #[test]
    fn equality_binds_a_typed_parameter() {
        let (sql, params) = compile(&[Filter::eq("status", 1)]);

        assert_eq!(params, SqlParams(vec![SqlParam::Float(1.0)]));
        assert!(sql.contains("THEN (NULLIF(data -> 'status', 'null'::jsonb))::float8 END) = $1::float8"));
        assert!(sql.starts_with("(COALESCE(("));
    }

    #[test]
    fn unset_values_bind_nothing() {
        let (sql, params) = compile(&[Filter::eq("title", json!(null)), Filter::gt("title", json!(null))]);

        assert_eq!(params.len(), 0);
        assert!(sql.contains("NULLIF(data -> 'title', 'null'::jsonb) IS NULL"));
        assert!(sql.contains(", 5) > 5"));
    }

    #[test]
    fn strict_comparisons_let_unset_values_through_rank() {
        let (sql, params) = compile(&[Filter::gt("title", "b")]);

        assert_eq!(params, SqlParams(vec![SqlParam::Text("b".to_string())]));
        assert!(sql.contains(", 5) > 1 OR "));
        assert!(sql.contains("COLLATE \"C\" > $1::text"));
    }

    #[test]
    fn containers_compare_as_jsonb_text() {
        let (sql, params) = compile(&[Filter::min("tags", json!(["a"]))]);

        assert_eq!(params, SqlParams(vec![SqlParam::Json(json!(["a"]))]));
        assert!(sql.contains(", 5) > 3 OR "));
        assert!(sql.contains("= 'array' THEN (NULLIF(data -> 'tags', 'null'::jsonb))::text END)"));
        assert!(sql.contains("COLLATE \"C\" >= ($1::jsonb)::text"));
    }

    #[test]
    fn container_equality_uses_the_same_key() {
        let (sql, _) = compile(&[Filter::ne("meta", json!({"a": 1}))]);

        assert!(sql.contains("= 'object' THEN"));
        assert!(sql.contains("COLLATE \"C\" = ($1::jsonb)::text) IS NOT TRUE"));
    }

    #[test]
    fn empty_combinations() {
        let mut params = SqlParams::new();
        let mut compiler = FilterCompiler::new(&mut params);

        assert_eq!(compiler.visit_all(&[]).unwrap(), "TRUE");
        assert_eq!(compiler.visit_any(&[]).unwrap(), "FALSE");
    }

    #[test]
    fn rules_are_or_of_and() {
        let mut params = SqlParams::new();
        let sql = FilterCompiler::new(&mut params)
            .visit_any(&[
                vec![Filter::eq("a", 1), Filter::gt("id", "x")],
                vec![Filter::gt("a", 1)],
            ])
            .unwrap();

        assert_eq!(params.len(), 3);
        assert!(sql.starts_with("(("));
        assert!(sql.contains(") OR ("));
        assert!(sql.contains("$3::float8"));
    }

    #[test]
    fn order_by_ends_with_id() {
        let clause = order_by(&[Sort::desc("last_modified")]);

        assert!(clause.starts_with("ORDER BY COALESCE(CASE jsonb_typeof(to_jsonb(last_modified))"));
        assert!(clause.contains("END, 5) DESC"));
        assert!(clause.contains("= 'object' THEN (to_jsonb(last_modified))::text END) COLLATE \"C\" DESC"));
        assert!(clause.ends_with("id COLLATE \"C\" ASC"));
        assert_eq!(order_by(&[]), "ORDER BY id COLLATE \"C\" ASC");
    }
}
