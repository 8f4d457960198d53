use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

/// Splits a path glob into its fixed directory prefix and the glob suffix.
/// `example/hive_table/*/*/*.parquet` -> (`example/hive_table`, rest).
fn fixed_prefix(path: &str) -> PathBuf {
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

/// Infers the hive partition columns of a dataset from its directory layout.
/// Walks from the fixed prefix of `path` down to the first data file and
/// reads `key=value` path segments in order. Values parsing as `%Y-%m-%d`
/// are typed DATE, everything else VARCHAR. Returns None when the layout is
/// not hive partitioned or the path does not exist.
pub fn hive_types_for_path(path: &str) -> Option<BTreeMap<String, String>> {
    let root = fixed_prefix(path);
    let mut current = root.clone();
    let mut types = BTreeMap::new();
    loop {
        let mut entries = std::fs::read_dir(&current).ok()?;
        let next = entries.find_map(|e| {
            let e = e.ok()?;
            let name = e.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                return None;
            }
            Some((e.path(), name))
        })?;
        let (next_path, name) = next;
        if next_path.is_dir() {
            if let Some((key, value)) = name.split_once('=') {
                types.insert(key.to_string(), infer_sql_type(value));
            }
            current = next_path;
        } else {
            break;
        }
    }
    if types.is_empty() {
        None
    } else {
        Some(types)
    }
}

fn infer_sql_type(value: &str) -> String {
    if NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok() {
        "DATE".to_string()
    } else {
        "VARCHAR".to_string()
    }
}
