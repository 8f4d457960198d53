use std::collections::{BTreeMap, HashSet};

use sqlparser::ast::{
    Array, BinaryOperator, DictionaryField, Expr, FunctionArg, FunctionArgExpr,
    FunctionArgOperator, GroupByExpr, Ident, ObjectName, Query, Select, SelectItem, SetExpr,
    Statement, TableFactor, TableFunctionArgs, TableWithJoins, Value,
};
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;

use crate::error::{Result, ServerError};
use crate::model::access::{CatalogSchemaTable, ObjectKind};

static DIALECT: DuckDbDialect = DuckDbDialect {};

/// Parses sql into its statement list, engine dialect.
pub fn parse_sql(sql: &str) -> Result<Vec<Statement>> {
    Ok(Parser::parse_sql(&DIALECT, sql)?)
}

/// The first top-level statement of a parsed query.
pub fn first_statement(mut statements: Vec<Statement>) -> Result<Statement> {
    if statements.is_empty() {
        return Err(ServerError::InvalidQuery(
            "query contains no statements".to_string(),
        ));
    }
    Ok(statements.remove(0))
}

/// Parses a WHERE-clause fragment into an expression in the engine dialect.
pub fn compile_filter_string(filter: &str) -> Result<Expr> {
    let mut parser = Parser::new(&DIALECT).try_with_sql(filter)?;
    Ok(parser.parse_expr()?)
}

/// Collects every base table reference and table function invocation in the
/// statement, walking FROM clauses, joins, subqueries and CTE bodies.
/// Unqualified base table names are resolved against the passed defaults.
/// CTE aliases are not tables and are skipped.
pub fn all_tables_or_paths(
    statement: &Statement,
    default_db: &str,
    default_schema: &str,
) -> Result<Vec<CatalogSchemaTable>> {
    let query = match statement {
        Statement::Query(q) => q,
        other => {
            return Err(ServerError::InvalidQuery(format!(
                "only read-only queries are supported, found statement: {other}"
            )))
        }
    };
    let cte_names = collect_cte_names(query);
    let mut found = vec![];
    collect_query(query, default_db, default_schema, &cte_names, &mut found);
    Ok(found)
}

/// Stamps every unqualified base table reference with the default catalog
/// and schema so downstream rewrites are unambiguous. Table functions and
/// CTE references are left untouched.
pub fn with_updated_database_schema(
    statement: &mut Statement,
    db: &str,
    schema: &str,
) -> Result<()> {
    let query = as_query_mut(statement)?;
    let cte_names = collect_cte_names(query);
    stamp_query(query, db, schema, &cte_names);
    Ok(())
}

/// ANDs `filter` into the WHERE clause of the first SELECT referencing a
/// base table.
pub fn add_filter_to_base_table(statement: &mut Statement, filter: &Expr) -> Result<()> {
    let query = as_query_mut(statement)?;
    let cte_names = collect_cte_names(query);
    let select = find_select_mut(query, &cte_names, SelectTarget::BaseTable).ok_or_else(|| {
        ServerError::InvalidQuery("no base table found to apply row filter to".to_string())
    })?;
    select.selection = Some(and_filter(select.selection.take(), filter));
    Ok(())
}

/// ANDs `filter` into the WHERE clause of the first SELECT reading from a
/// table function. When that function is `read_parquet` over a hive layout,
/// the `hive_partitioning` and `hive_types` named arguments are injected if
/// absent so partition columns survive the rewrite.
pub fn add_filter_to_table_function(
    statement: &mut Statement,
    filter: &Expr,
    hive_types: Option<&BTreeMap<String, String>>,
) -> Result<()> {
    let query = as_query_mut(statement)?;
    let cte_names = collect_cte_names(query);
    let select =
        find_select_mut(query, &cte_names, SelectTarget::TableFunction).ok_or_else(|| {
            ServerError::InvalidQuery("no table function found to apply row filter to".to_string())
        })?;
    if let Some(types) = hive_types {
        for table in &mut select.from {
            if let TableFactor::Table {
                name,
                args: Some(args),
                ..
            } = &mut table.relation
            {
                if function_name(name) == "read_parquet" {
                    ensure_hive_args(args, types);
                    break;
                }
            }
        }
    }
    select.selection = Some(and_filter(select.selection.take(), filter));
    Ok(())
}

/// Injects `hive_partitioning = true` and `hive_types = {...}` named
/// arguments when not already present.
pub fn ensure_hive_args(args: &mut TableFunctionArgs, types: &BTreeMap<String, String>) {
    if !has_named_arg(args, "hive_partitioning") {
        args.args.push(named_arg(
            "hive_partitioning",
            Expr::Value(Value::Boolean(true)),
        ));
    }
    if !has_named_arg(args, "hive_types") {
        let fields = types
            .iter()
            .map(|(col, sql_type)| DictionaryField {
                key: Ident::with_quote('\'', col.clone()),
                value: Box::new(Expr::Identifier(Ident::new(sql_type.clone()))),
            })
            .collect();
        args.args
            .push(named_arg("hive_types", Expr::Dictionary(fields)));
    }
}

/// Injects hive partitioning arguments into the top level table function,
/// leaving anything already present alone. Used by the split planner so
/// single-file shards keep their partition columns.
pub fn ensure_top_level_hive_args(
    statement: &mut Statement,
    types: &BTreeMap<String, String>,
) -> Result<()> {
    let query = as_query_mut(statement)?;
    if let SetExpr::Select(select) = query.body.as_mut() {
        if let Some(first) = select.from.first_mut() {
            if let TableFactor::Table {
                args: Some(args), ..
            } = &mut first.relation
            {
                ensure_hive_args(args, types);
            }
        }
    }
    Ok(())
}

/// The table function invocation at the top level FROM of the statement, if
/// any: `(function_name, first path argument)`.
pub fn top_level_table_function(statement: &Statement) -> Option<(String, String)> {
    let query = match statement {
        Statement::Query(q) => q,
        _ => return None,
    };
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return None,
    };
    let first = select.from.first()?;
    match &first.relation {
        TableFactor::Table {
            name,
            args: Some(args),
            ..
        } => Some((function_name(name), path_argument(args).unwrap_or_default())),
        _ => None,
    }
}

/// Replaces the path argument of the top level table function with `source`,
/// optionally renaming the function itself (used to turn `read_delta` shards
/// into `read_parquet` reads).
pub fn replace_table_function_source(
    statement: &mut Statement,
    new_name: Option<&str>,
    source: Expr,
) -> Result<()> {
    let query = as_query_mut(statement)?;
    let select = match query.body.as_mut() {
        SetExpr::Select(s) => s,
        _ => {
            return Err(ServerError::InvalidQuery(
                "top level query is not a plain select".to_string(),
            ))
        }
    };
    let first = select.from.first_mut().ok_or_else(|| {
        ServerError::InvalidQuery("top level select has no FROM clause".to_string())
    })?;
    match &mut first.relation {
        TableFactor::Table {
            name,
            args: Some(args),
            ..
        } => {
            if let Some(new_name) = new_name {
                *name = ObjectName(vec![Ident::new(new_name)]);
            }
            let replaced = args.args.iter_mut().find_map(|arg| match arg {
                FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
                    if matches!(e, Expr::Value(Value::SingleQuotedString(_)) | Expr::Array(_)) =>
                {
                    Some(e)
                }
                _ => None,
            });
            match replaced {
                Some(slot) => *slot = source,
                None => args
                    .args
                    .insert(0, FunctionArg::Unnamed(FunctionArgExpr::Expr(source))),
            }
            Ok(())
        }
        _ => Err(ServerError::InvalidQuery(
            "top level FROM is not a table function".to_string(),
        )),
    }
}

/// A single quoted string literal expression.
pub fn string_literal(value: &str) -> Expr {
    Expr::Value(Value::SingleQuotedString(value.to_string()))
}

/// A `['a', 'b', ...]` list literal expression.
pub fn string_list_literal<'a, I: IntoIterator<Item = &'a str>>(values: I) -> Expr {
    Expr::Array(Array {
        elem: values.into_iter().map(string_literal).collect(),
        named: false,
    })
}

fn as_query_mut(statement: &mut Statement) -> Result<&mut Query> {
    match statement {
        Statement::Query(q) => Ok(q),
        other => Err(ServerError::InvalidQuery(format!(
            "only read-only queries are supported, found statement: {other}"
        ))),
    }
}

fn collect_cte_names(query: &Query) -> HashSet<String> {
    let mut names = HashSet::new();
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            names.insert(cte.alias.name.value.clone());
        }
    }
    names
}

fn and_filter(existing: Option<Expr>, filter: &Expr) -> Expr {
    match existing {
        Some(e) => Expr::BinaryOp {
            left: Box::new(e),
            op: BinaryOperator::And,
            right: Box::new(Expr::Nested(Box::new(filter.clone()))),
        },
        None => filter.clone(),
    }
}

fn named_arg(name: &str, value: Expr) -> FunctionArg {
    FunctionArg::Named {
        name: Ident::new(name),
        arg: FunctionArgExpr::Expr(value),
        operator: FunctionArgOperator::Equals,
    }
}

fn has_named_arg(args: &TableFunctionArgs, name: &str) -> bool {
    args.args.iter().any(|arg| match arg {
        FunctionArg::Named { name: n, .. } => n.value.eq_ignore_ascii_case(name),
        _ => false,
    })
}

fn function_name(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|i| i.value.to_lowercase())
        .unwrap_or_default()
}

/// The first unnamed string (or string list) argument of a table function,
/// i.e. the path it reads from.
fn path_argument(args: &TableFunctionArgs) -> Option<String> {
    args.args.iter().find_map(|arg| match arg {
        FunctionArg::Unnamed(FunctionArgExpr::Expr(Expr::Value(Value::SingleQuotedString(s)))) => {
            Some(s.clone())
        }
        FunctionArg::Unnamed(FunctionArgExpr::Expr(Expr::Array(arr))) => {
            arr.elem.iter().find_map(|e| match e {
                Expr::Value(Value::SingleQuotedString(s)) => Some(s.clone()),
                _ => None,
            })
        }
        _ => None,
    })
}

fn collect_query(
    query: &Query,
    db: &str,
    schema: &str,
    cte_names: &HashSet<String>,
    found: &mut Vec<CatalogSchemaTable>,
) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            collect_query(&cte.query, db, schema, cte_names, found);
        }
    }
    collect_set_expr(&query.body, db, schema, cte_names, found);
}

fn collect_set_expr(
    body: &SetExpr,
    db: &str,
    schema: &str,
    cte_names: &HashSet<String>,
    found: &mut Vec<CatalogSchemaTable>,
) {
    match body {
        SetExpr::Select(select) => collect_select(select, db, schema, cte_names, found),
        SetExpr::Query(q) => collect_query(q, db, schema, cte_names, found),
        SetExpr::SetOperation { left, right, .. } => {
            collect_set_expr(left, db, schema, cte_names, found);
            collect_set_expr(right, db, schema, cte_names, found);
        }
        _ => {}
    }
}

fn collect_select(
    select: &Select,
    db: &str,
    schema: &str,
    cte_names: &HashSet<String>,
    found: &mut Vec<CatalogSchemaTable>,
) {
    for table in &select.from {
        collect_table_with_joins(table, db, schema, cte_names, found);
    }
    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                collect_expr(expr, db, schema, cte_names, found)
            }
            _ => {}
        }
    }
    if let Some(selection) = &select.selection {
        collect_expr(selection, db, schema, cte_names, found);
    }
    if let GroupByExpr::Expressions(exprs, _) = &select.group_by {
        for expr in exprs {
            collect_expr(expr, db, schema, cte_names, found);
        }
    }
    if let Some(having) = &select.having {
        collect_expr(having, db, schema, cte_names, found);
    }
}

fn collect_table_with_joins(
    table: &TableWithJoins,
    db: &str,
    schema: &str,
    cte_names: &HashSet<String>,
    found: &mut Vec<CatalogSchemaTable>,
) {
    collect_table_factor(&table.relation, db, schema, cte_names, found);
    for join in &table.joins {
        collect_table_factor(&join.relation, db, schema, cte_names, found);
    }
}

fn collect_table_factor(
    factor: &TableFactor,
    db: &str,
    schema: &str,
    cte_names: &HashSet<String>,
    found: &mut Vec<CatalogSchemaTable>,
) {
    match factor {
        TableFactor::Table {
            name,
            args: Some(args),
            ..
        } => {
            found.push(CatalogSchemaTable {
                catalog: None,
                schema: None,
                table_or_path: path_argument(args).unwrap_or_default(),
                kind: ObjectKind::TableFunction,
                function_name: Some(function_name(name)),
                hive_partitioning: has_named_arg(args, "hive_partitioning"),
            });
        }
        TableFactor::Table {
            name, args: None, ..
        } => {
            let idents: Vec<String> = name.0.iter().map(|i| i.value.clone()).collect();
            if idents.len() == 1 && cte_names.contains(&idents[0]) {
                return;
            }
            let (catalog, schm, table) = match idents.len() {
                1 => (db.to_string(), schema.to_string(), idents[0].clone()),
                2 => (db.to_string(), idents[0].clone(), idents[1].clone()),
                _ => (
                    idents[0].clone(),
                    idents[1].clone(),
                    idents.last().cloned().unwrap_or_default(),
                ),
            };
            found.push(CatalogSchemaTable {
                catalog: Some(catalog),
                schema: Some(schm),
                table_or_path: table,
                kind: ObjectKind::BaseTable,
                function_name: None,
                hive_partitioning: false,
            });
        }
        TableFactor::Derived { subquery, .. } => {
            collect_query(subquery, db, schema, cte_names, found)
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => collect_table_with_joins(table_with_joins, db, schema, cte_names, found),
        _ => {}
    }
}

/// Walks expressions only far enough to find nested query scopes.
fn collect_expr(
    expr: &Expr,
    db: &str,
    schema: &str,
    cte_names: &HashSet<String>,
    found: &mut Vec<CatalogSchemaTable>,
) {
    match expr {
        Expr::Subquery(q) => collect_query(q, db, schema, cte_names, found),
        Expr::InSubquery { expr, subquery, .. } => {
            collect_expr(expr, db, schema, cte_names, found);
            collect_query(subquery, db, schema, cte_names, found);
        }
        Expr::Exists { subquery, .. } => collect_query(subquery, db, schema, cte_names, found),
        Expr::BinaryOp { left, right, .. } => {
            collect_expr(left, db, schema, cte_names, found);
            collect_expr(right, db, schema, cte_names, found);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::Cast { expr, .. } => {
            collect_expr(expr, db, schema, cte_names, found)
        }
        Expr::InList { expr, list, .. } => {
            collect_expr(expr, db, schema, cte_names, found);
            for item in list {
                collect_expr(item, db, schema, cte_names, found);
            }
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            collect_expr(expr, db, schema, cte_names, found);
            collect_expr(low, db, schema, cte_names, found);
            collect_expr(high, db, schema, cte_names, found);
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(operand) = operand {
                collect_expr(operand, db, schema, cte_names, found);
            }
            for expr in conditions.iter().chain(results) {
                collect_expr(expr, db, schema, cte_names, found);
            }
            if let Some(else_result) = else_result {
                collect_expr(else_result, db, schema, cte_names, found);
            }
        }
        _ => {}
    }
}

fn stamp_query(query: &mut Query, db: &str, schema: &str, cte_names: &HashSet<String>) {
    if let Some(with) = &mut query.with {
        for cte in &mut with.cte_tables {
            stamp_query(&mut cte.query, db, schema, cte_names);
        }
    }
    stamp_set_expr(&mut query.body, db, schema, cte_names);
}

fn stamp_set_expr(body: &mut SetExpr, db: &str, schema: &str, cte_names: &HashSet<String>) {
    match body {
        SetExpr::Select(select) => {
            for table in &mut select.from {
                stamp_table_factor(&mut table.relation, db, schema, cte_names);
                for join in &mut table.joins {
                    stamp_table_factor(&mut join.relation, db, schema, cte_names);
                }
            }
            for item in &mut select.projection {
                match item {
                    SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                        stamp_expr(expr, db, schema, cte_names)
                    }
                    _ => {}
                }
            }
            if let Some(selection) = &mut select.selection {
                stamp_expr(selection, db, schema, cte_names);
            }
            if let GroupByExpr::Expressions(exprs, _) = &mut select.group_by {
                for expr in exprs {
                    stamp_expr(expr, db, schema, cte_names);
                }
            }
            if let Some(having) = &mut select.having {
                stamp_expr(having, db, schema, cte_names);
            }
        }
        SetExpr::Query(q) => stamp_query(q, db, schema, cte_names),
        SetExpr::SetOperation { left, right, .. } => {
            stamp_set_expr(left, db, schema, cte_names);
            stamp_set_expr(right, db, schema, cte_names);
        }
        _ => {}
    }
}

/// Mirrors [collect_expr]: finds nested query scopes inside expressions and
/// stamps their table references.
fn stamp_expr(expr: &mut Expr, db: &str, schema: &str, cte_names: &HashSet<String>) {
    match expr {
        Expr::Subquery(q) => stamp_query(q, db, schema, cte_names),
        Expr::InSubquery { expr, subquery, .. } => {
            stamp_expr(expr, db, schema, cte_names);
            stamp_query(subquery, db, schema, cte_names);
        }
        Expr::Exists { subquery, .. } => stamp_query(subquery, db, schema, cte_names),
        Expr::BinaryOp { left, right, .. } => {
            stamp_expr(left, db, schema, cte_names);
            stamp_expr(right, db, schema, cte_names);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::Cast { expr, .. } => {
            stamp_expr(expr, db, schema, cte_names)
        }
        Expr::InList { expr, list, .. } => {
            stamp_expr(expr, db, schema, cte_names);
            for item in list {
                stamp_expr(item, db, schema, cte_names);
            }
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            stamp_expr(expr, db, schema, cte_names);
            stamp_expr(low, db, schema, cte_names);
            stamp_expr(high, db, schema, cte_names);
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(operand) = operand {
                stamp_expr(operand, db, schema, cte_names);
            }
            for expr in conditions.iter_mut().chain(results.iter_mut()) {
                stamp_expr(expr, db, schema, cte_names);
            }
            if let Some(else_result) = else_result {
                stamp_expr(else_result, db, schema, cte_names);
            }
        }
        _ => {}
    }
}

fn stamp_table_factor(
    factor: &mut TableFactor,
    db: &str,
    schema: &str,
    cte_names: &HashSet<String>,
) {
    match factor {
        TableFactor::Table {
            name, args: None, ..
        } => {
            let idents = &mut name.0;
            match idents.len() {
                1 if !cte_names.contains(&idents[0].value) => {
                    let table = idents.pop().expect("length checked");
                    idents.push(Ident::new(db));
                    idents.push(Ident::new(schema));
                    idents.push(table);
                }
                2 => {
                    idents.insert(0, Ident::new(db));
                }
                _ => {}
            }
        }
        TableFactor::Derived { subquery, .. } => stamp_query(subquery, db, schema, cte_names),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            stamp_table_factor(&mut table_with_joins.relation, db, schema, cte_names);
            for join in &mut table_with_joins.joins {
                stamp_table_factor(&mut join.relation, db, schema, cte_names);
            }
        }
        _ => {}
    }
}

#[derive(Clone, Copy)]
enum SelectTarget {
    BaseTable,
    TableFunction,
}

/// DFS for the first SELECT whose FROM clause contains the wanted kind of
/// reference, visiting CTE bodies before the main body to mirror the
/// reference collection order.
fn find_select_mut<'a>(
    query: &'a mut Query,
    cte_names: &HashSet<String>,
    target: SelectTarget,
) -> Option<&'a mut Select> {
    if let Some(with) = &mut query.with {
        for cte in &mut with.cte_tables {
            let found = find_select_mut(&mut cte.query, cte_names, target);
            if found.is_some() {
                return found;
            }
        }
    }
    find_select_in_set_expr(&mut query.body, cte_names, target)
}

fn find_select_in_set_expr<'a>(
    body: &'a mut SetExpr,
    cte_names: &HashSet<String>,
    target: SelectTarget,
) -> Option<&'a mut Select> {
    match body {
        SetExpr::Select(select) => {
            let matched = select.from.iter().any(|t| {
                factor_matches(&t.relation, cte_names, &target)
                    || t.joins
                        .iter()
                        .any(|j| factor_matches(&j.relation, cte_names, &target))
            });
            if matched {
                return Some(select);
            }
            // descend into derived subqueries within this FROM
            for table in &mut select.from {
                if let TableFactor::Derived { subquery, .. } = &mut table.relation {
                    let found = find_select_mut(subquery, cte_names, target);
                    if found.is_some() {
                        return found;
                    }
                }
            }
            None
        }
        SetExpr::Query(q) => find_select_mut(q, cte_names, target),
        SetExpr::SetOperation { left, right, .. } => {
            let in_left = find_select_in_set_expr(left, cte_names, target);
            if in_left.is_some() {
                return in_left;
            }
            find_select_in_set_expr(right, cte_names, target)
        }
        _ => None,
    }
}

fn factor_matches(factor: &TableFactor, cte_names: &HashSet<String>, target: &SelectTarget) -> bool {
    match (factor, target) {
        (TableFactor::Table { args: Some(_), .. }, SelectTarget::TableFunction) => true,
        (
            TableFactor::Table {
                name, args: None, ..
            },
            SelectTarget::BaseTable,
        ) => !(name.0.len() == 1 && cte_names.contains(&name.0[0].value)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(sql: &str) -> Statement {
        first_statement(parse_sql(sql).unwrap()).unwrap()
    }

    #[test]
    fn collects_base_tables_with_defaults() {
        let stmt = parse_one("select * from t1 join s2.t2 on t1.a = t2.a");
        let refs = all_tables_or_paths(&stmt, "memory", "main").unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].catalog.as_deref(), Some("memory"));
        assert_eq!(refs[0].schema.as_deref(), Some("main"));
        assert_eq!(refs[0].table_or_path, "t1");
        assert_eq!(refs[1].schema.as_deref(), Some("s2"));
        assert_eq!(refs[1].table_or_path, "t2");
    }

    #[test]
    fn collects_table_functions_and_paths() {
        let stmt = parse_one(
            "select * from read_parquet('example/hive_table/*/*/*.parquet', hive_partitioning = true)",
        );
        let refs = all_tables_or_paths(&stmt, "memory", "main").unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, ObjectKind::TableFunction);
        assert_eq!(refs[0].function_name.as_deref(), Some("read_parquet"));
        assert_eq!(refs[0].table_or_path, "example/hive_table/*/*/*.parquet");
        assert!(refs[0].hive_partitioning);
    }

    #[test]
    fn generate_series_has_empty_path() {
        let stmt = parse_one("select * from generate_series(10)");
        let refs = all_tables_or_paths(&stmt, "memory", "main").unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].function_name.as_deref(), Some("generate_series"));
        assert_eq!(refs[0].table_or_path, "");
    }

    #[test]
    fn cte_aliases_are_not_tables() {
        let stmt = parse_one("with c as (select * from t1) select * from c");
        let refs = all_tables_or_paths(&stmt, "memory", "main").unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].table_or_path, "t1");
    }

    #[test]
    fn subqueries_are_walked() {
        let stmt = parse_one(
            "select * from (select a from inner_t) sub where a in (select b from filter_t)",
        );
        let refs = all_tables_or_paths(&stmt, "memory", "main").unwrap();
        let names: Vec<_> = refs.iter().map(|r| r.table_or_path.as_str()).collect();
        assert_eq!(names, vec!["inner_t", "filter_t"]);
    }

    #[test]
    fn projection_subqueries_are_collected() {
        let stmt = parse_one("select (select secret from restricted_t) as x from allowed_t");
        let refs = all_tables_or_paths(&stmt, "memory", "main").unwrap();
        let names: Vec<_> = refs.iter().map(|r| r.table_or_path.as_str()).collect();
        assert_eq!(names, vec!["allowed_t", "restricted_t"]);
    }

    #[test]
    fn group_by_and_having_subqueries_are_collected() {
        let stmt = parse_one(
            "select a, count(*) from t1 group by case when a in (select g from groups_t) \
             then a else 0 end having count(*) > (select m from limits_t)",
        );
        let refs = all_tables_or_paths(&stmt, "memory", "main").unwrap();
        let names: Vec<_> = refs.iter().map(|r| r.table_or_path.as_str()).collect();
        assert_eq!(names, vec!["t1", "groups_t", "limits_t"]);
    }

    #[test]
    fn stamp_reaches_expression_subqueries() {
        let mut stmt = parse_one(
            "select (select v from inner_t) from outer_t where a in (select b from filter_t)",
        );
        with_updated_database_schema(&mut stmt, "memory", "main").unwrap();
        assert_eq!(
            stmt.to_string(),
            "SELECT (SELECT v FROM memory.main.inner_t) FROM memory.main.outer_t \
             WHERE a IN (SELECT b FROM memory.main.filter_t)"
        );
    }

    #[test]
    fn stamps_unqualified_names() {
        let mut stmt = parse_one("select * from t1 join s.t2 on t1.a = t2.a");
        with_updated_database_schema(&mut stmt, "memory", "main").unwrap();
        assert_eq!(
            stmt.to_string(),
            "SELECT * FROM memory.main.t1 JOIN memory.s.t2 ON t1.a = t2.a"
        );
    }

    #[test]
    fn stamp_leaves_ctes_and_functions_alone() {
        let mut stmt = parse_one("with c as (select * from t1) select * from c");
        with_updated_database_schema(&mut stmt, "memory", "main").unwrap();
        assert_eq!(
            stmt.to_string(),
            "WITH c AS (SELECT * FROM memory.main.t1) SELECT * FROM c"
        );

        let mut stmt = parse_one("select * from generate_series(10)");
        with_updated_database_schema(&mut stmt, "memory", "main").unwrap();
        assert_eq!(stmt.to_string(), "SELECT * FROM generate_series(10)");
    }

    #[test]
    fn filter_added_to_base_table() {
        let mut stmt = parse_one("select a from t1 where a > 3");
        let filter = compile_filter_string("region = 'emea'").unwrap();
        add_filter_to_base_table(&mut stmt, &filter).unwrap();
        assert_eq!(
            stmt.to_string(),
            "SELECT a FROM t1 WHERE a > 3 AND (region = 'emea')"
        );
    }

    #[test]
    fn filter_added_without_existing_predicate() {
        let mut stmt = parse_one("select a from t1");
        let filter = compile_filter_string("region = 'emea'").unwrap();
        add_filter_to_base_table(&mut stmt, &filter).unwrap();
        assert_eq!(stmt.to_string(), "SELECT a FROM t1 WHERE region = 'emea'");
    }

    #[test]
    fn filter_targets_cte_body_when_table_lives_there() {
        let mut stmt = parse_one("with c as (select * from t1) select * from c");
        let filter = compile_filter_string("a = 1").unwrap();
        add_filter_to_base_table(&mut stmt, &filter).unwrap();
        assert_eq!(
            stmt.to_string(),
            "WITH c AS (SELECT * FROM t1 WHERE a = 1) SELECT * FROM c"
        );
    }

    #[test]
    fn hive_rewrite_matches_reference_shape() {
        let mut stmt = parse_one("select * from read_parquet('example/hive_table/*/*/*.parquet')");
        let filter = compile_filter_string("p = '1'").unwrap();
        let mut types = BTreeMap::new();
        types.insert("dt".to_string(), "DATE".to_string());
        types.insert("p".to_string(), "VARCHAR".to_string());
        add_filter_to_table_function(&mut stmt, &filter, Some(&types)).unwrap();
        assert_eq!(
            stmt.to_string(),
            "SELECT * FROM read_parquet('example/hive_table/*/*/*.parquet', \
             hive_partitioning = true, hive_types = {'dt': DATE, 'p': VARCHAR}) WHERE p = '1'"
        );
    }

    #[test]
    fn hive_args_not_duplicated() {
        let mut stmt = parse_one(
            "select * from read_parquet('x/*.parquet', hive_partitioning = true, hive_types = {'p': VARCHAR})",
        );
        let filter = compile_filter_string("p = '1'").unwrap();
        let mut types = BTreeMap::new();
        types.insert("p".to_string(), "VARCHAR".to_string());
        add_filter_to_table_function(&mut stmt, &filter, Some(&types)).unwrap();
        assert_eq!(
            stmt.to_string(),
            "SELECT * FROM read_parquet('x/*.parquet', hive_partitioning = true, \
             hive_types = {'p': VARCHAR}) WHERE p = '1'"
        );
    }

    #[test]
    fn top_level_table_function_detected() {
        let stmt = parse_one("select * from read_delta('example/delta_table')");
        let (name, path) = top_level_table_function(&stmt).unwrap();
        assert_eq!(name, "read_delta");
        assert_eq!(path, "example/delta_table");

        let stmt = parse_one("select * from t1");
        assert!(top_level_table_function(&stmt).is_none());
    }

    #[test]
    fn replaces_path_with_single_file() {
        let mut stmt =
            parse_one("select * from read_parquet('data/*.parquet', hive_partitioning = true)");
        replace_table_function_source(&mut stmt, None, string_literal("data/part-0.parquet"))
            .unwrap();
        assert_eq!(
            stmt.to_string(),
            "SELECT * FROM read_parquet('data/part-0.parquet', hive_partitioning = true)"
        );
    }

    #[test]
    fn rewrites_delta_to_parquet_file_list() {
        let mut stmt = parse_one("select * from read_delta('example/delta_table') where v > 1");
        replace_table_function_source(
            &mut stmt,
            Some("read_parquet"),
            string_list_literal(["/tmp/d/f1.parquet", "/tmp/d/f2.parquet"]),
        )
        .unwrap();
        assert_eq!(
            stmt.to_string(),
            "SELECT * FROM read_parquet(['/tmp/d/f1.parquet', '/tmp/d/f2.parquet']) WHERE v > 1"
        );
    }

    #[test]
    fn rejects_non_query_statements() {
        let stmt = parse_one("insert into t1 values (1)");
        assert!(all_tables_or_paths(&stmt, "memory", "main").is_err());
    }
}
