use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use globset::GlobBuilder;
use sqlparser::ast::Statement;
use tracing::debug;

use crate::error::{Result, ServerError};
use crate::execute::ast_utils::{
    ensure_top_level_hive_args, replace_table_function_source, string_list_literal, string_literal,
    top_level_table_function,
};
use crate::execute::hive;

/// Expands a partitioned-source query into one sub-query per shard of
/// `split_size` files. Returns None when the top level FROM is not a
/// recognized partitioned source, in which case the query runs unsplit.
/// Zero shards is legal and yields zero rows.
pub async fn plan_splits(
    statement: &Statement,
    split_size: usize,
) -> Result<Option<Vec<Statement>>> {
    let Some((function, path)) = top_level_table_function(statement) else {
        return Ok(None);
    };
    match function.as_str() {
        "read_parquet" if !path.is_empty() => {
            let shards = plan_parquet(statement, &path, split_size)?;
            Ok(Some(shards))
        }
        "read_delta" if !path.is_empty() => {
            let shards = plan_delta(statement, &path, split_size).await?;
            Ok(Some(shards))
        }
        _ => Ok(None),
    }
}

fn plan_parquet(statement: &Statement, path: &str, split_size: usize) -> Result<Vec<Statement>> {
    let files = expand_parquet_source(path)?;
    debug!("split planning expanded {path} into {} files", files.len());
    let hive_types = hive::hive_types_for_path(path);
    let mut shards = vec![];
    for chunk in files.chunks(split_size.max(1)) {
        let mut shard = statement.clone();
        let source = if chunk.len() == 1 {
            string_literal(&chunk[0])
        } else {
            string_list_literal(chunk.iter().map(String::as_str))
        };
        replace_table_function_source(&mut shard, None, source)?;
        if let Some(types) = &hive_types {
            ensure_top_level_hive_args(&mut shard, types)?;
        }
        shards.push(shard);
    }
    Ok(shards)
}

async fn plan_delta(statement: &Statement, path: &str, split_size: usize) -> Result<Vec<Statement>> {
    if !Path::new(path).exists() {
        return Err(ServerError::NotFound(format!(
            "delta table path {path} not found"
        )));
    }
    let table = deltalake::open_table(path).await?;
    let mut files: Vec<String> = table
        .get_file_uris()?
        .map(|uri| match uri.strip_prefix("file://") {
            Some(stripped) => stripped.to_string(),
            None => uri,
        })
        .collect();
    files.sort();
    debug!(
        "split planning found {} add files in delta table {path}",
        files.len()
    );

    let partition_columns = table.metadata()?.partition_columns.clone();
    let hive_types = if partition_columns.is_empty() {
        None
    } else {
        let schema = table.get_schema()?;
        let mut types = BTreeMap::new();
        for field in schema.fields() {
            if partition_columns.contains(field.name()) {
                types.insert(field.name().clone(), delta_sql_type(field.data_type()));
            }
        }
        Some(types)
    };

    let mut shards = vec![];
    for chunk in files.chunks(split_size.max(1)) {
        let mut shard = statement.clone();
        replace_table_function_source(
            &mut shard,
            Some("read_parquet"),
            string_list_literal(chunk.iter().map(String::as_str)),
        )?;
        if let Some(types) = &hive_types {
            ensure_top_level_hive_args(&mut shard, types)?;
        }
        shards.push(shard);
    }
    Ok(shards)
}

/// Lists the parquet files a path argument refers to: glob patterns are
/// expanded segment-aware, bare directories are walked recursively and a
/// plain file path stands for itself. An unreachable root is an error while
/// an empty match set is not.
fn expand_parquet_source(path: &str) -> Result<Vec<String>> {
    let is_glob = path.contains('*') || path.contains('?') || path.contains('[');
    if !is_glob {
        let root = Path::new(path);
        if root.is_file() {
            return Ok(vec![path.to_string()]);
        }
        if !root.is_dir() {
            return Err(ServerError::NotFound(format!("path {path} not found")));
        }
        let mut files = vec![];
        walk_parquet_files(root, &mut files)?;
        files.sort();
        return Ok(files);
    }

    let root = glob_fixed_prefix(path);
    if !root.as_os_str().is_empty() && !root.is_dir() {
        return Err(ServerError::NotFound(format!(
            "path {} not found",
            root.display()
        )));
    }
    let matcher = GlobBuilder::new(path)
        .literal_separator(true)
        .build()
        .map_err(|e| ServerError::InvalidQuery(format!("invalid path glob {path}: {e}")))?
        .compile_matcher();

    let walk_root = if root.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        root
    };
    let mut all = vec![];
    walk_all_files(&walk_root, &mut all)?;
    let mut files: Vec<String> = all
        .into_iter()
        .filter(|f| matcher.is_match(f))
        .collect();
    files.sort();
    Ok(files)
}

fn walk_parquet_files(dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_parquet_files(&path, out)?;
        } else if path.extension().is_some_and(|e| e == "parquet") {
            out.push(path.display().to_string());
        }
    }
    Ok(())
}

fn walk_all_files(dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_all_files(&path, out)?;
        } else {
            out.push(path.display().to_string());
        }
    }
    Ok(())
}

fn glob_fixed_prefix(path: &str) -> PathBuf {
    let mut prefix = PathBuf::new();
    for segment in Path::new(path).components() {
        let part = segment.as_os_str().to_string_lossy();
        if part.contains('*') || part.contains('?') || part.contains('[') {
            break;
        }
        prefix.push(segment);
    }
    prefix
}

fn delta_sql_type(data_type: &deltalake::kernel::DataType) -> String {
    use deltalake::kernel::{DataType, PrimitiveType};
    match data_type {
        DataType::Primitive(p) => match p {
            PrimitiveType::String => "VARCHAR".to_string(),
            PrimitiveType::Long => "BIGINT".to_string(),
            PrimitiveType::Integer => "INTEGER".to_string(),
            PrimitiveType::Short => "SMALLINT".to_string(),
            PrimitiveType::Byte => "TINYINT".to_string(),
            PrimitiveType::Float => "FLOAT".to_string(),
            PrimitiveType::Double => "DOUBLE".to_string(),
            PrimitiveType::Boolean => "BOOLEAN".to_string(),
            PrimitiveType::Date => "DATE".to_string(),
            _ => "VARCHAR".to_string(),
        },
        _ => "VARCHAR".to_string(),
    }
}
