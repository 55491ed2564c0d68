use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::SyncError;

/// Column names preferred as the X signal, compared case-insensitively.
const X_SIGNAL_CANDIDATES: [&str; 3] = ["time", "t", "x"];

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub path: PathBuf,
    pub columns: Vec<Column>,
}

impl Dataset {
    pub fn signal_names(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map_or(0, |column| column.values.len())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedDataset {
    pub dataset: Dataset,
    pub default_x_signal: String,
}

/// Turns a dataset file into named columns. Only column names and the chosen
/// default X signal are used by the sync core.
pub trait DatasetLoader: Send + Sync {
    fn load_dataset(&self, path: &Path) -> Result<LoadedDataset, SyncError>;
}

/// Loads comma-separated files with a header row and numeric cells. Empty
/// cells read as NaN.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvDatasetLoader;

impl DatasetLoader for CsvDatasetLoader {
    fn load_dataset(&self, path: &Path) -> Result<LoadedDataset, SyncError> {
        let text = std::fs::read_to_string(path).map_err(|err| SyncError::io(path.display().to_string(), err))?;
        let dataset = parse_csv(path, &text)?;
        let default_x_signal = default_x_signal(&dataset.columns)
            .ok_or_else(|| SyncError::dataset(path.display().to_string(), "no columns"))?;
        log::debug!(
            "loaded '{}': {} columns, {} rows, X = '{}'",
            path.display(),
            dataset.columns.len(),
            dataset.row_count(),
            default_x_signal
        );
        Ok(LoadedDataset {
            dataset,
            default_x_signal,
        })
    }
}

fn parse_csv(path: &Path, text: &str) -> Result<Dataset, SyncError> {
    let fail = |message: String| SyncError::dataset(path.display().to_string(), message);
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());

    let (_, header) = lines.next().ok_or_else(|| fail("file is empty".to_string()))?;
    let names: Vec<String> = header.split(',').map(clean_cell).collect();
    let mut seen = HashSet::new();
    for name in &names {
        if name.is_empty() {
            return Err(fail("header contains an empty column name".to_string()));
        }
        if !seen.insert(name.as_str()) {
            return Err(fail(format!("duplicate column '{name}'")));
        }
    }

    let mut columns: Vec<Column> = names
        .into_iter()
        .map(|name| Column {
            name,
            values: Vec::new(),
        })
        .collect();
    for (index, line) in lines {
        let cells: Vec<String> = line.split(',').map(clean_cell).collect();
        if cells.len() != columns.len() {
            return Err(fail(format!(
                "line {} has {} fields, expected {}",
                index + 1,
                cells.len(),
                columns.len()
            )));
        }
        for (column, cell) in columns.iter_mut().zip(cells) {
            let value = if cell.is_empty() {
                f64::NAN
            } else {
                cell.parse::<f64>()
                    .map_err(|_| fail(format!("line {}: '{}' is not a number", index + 1, cell)))?
            };
            column.values.push(value);
        }
    }

    Ok(Dataset {
        path: path.to_path_buf(),
        columns,
    })
}

fn clean_cell(cell: &str) -> String {
    cell.trim().trim_matches('"').trim().to_string()
}

fn default_x_signal(columns: &[Column]) -> Option<String> {
    columns
        .iter()
        .find(|column| X_SIGNAL_CANDIDATES.iter().any(|c| column.name.eq_ignore_ascii_case(c)))
        .or_else(|| columns.first())
        .map(|column| column.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(contents: &str) -> Result<LoadedDataset, SyncError> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, contents).unwrap();
        CsvDatasetLoader.load_dataset(&path)
    }

    #[test]
    fn loads_columns_and_prefers_time_as_x() {
        let loaded = load("vin, \"Time\" ,iout\n1.0,0.0,2\n\n1.5,0.001,\n").unwrap();
        assert_eq!(loaded.default_x_signal, "Time");
        assert_eq!(loaded.dataset.signal_names(), vec!["vin", "Time", "iout"]);
        assert_eq!(loaded.dataset.row_count(), 2);
        let iout = loaded.dataset.column("iout").unwrap();
        assert_eq!(iout.values[0], 2.0);
        assert!(iout.values[1].is_nan());
    }

    #[test]
    fn falls_back_to_first_column() {
        let loaded = load("freq,gain\n10,1\n").unwrap();
        assert_eq!(loaded.default_x_signal, "freq");
    }

    #[test]
    fn malformed_input_is_descriptive() {
        let err = load("a,b\n1,2,3\n").unwrap_err();
        assert!(err.to_string().contains("line 2 has 3 fields"), "{err}");
        let err = load("a,b\n1,x\n").unwrap_err();
        assert!(err.to_string().contains("'x' is not a number"), "{err}");
        assert!(load("a,a\n1,2\n").is_err());
        assert!(load("\n\n").is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = CsvDatasetLoader.load_dataset(Path::new("/definitely/not/here.csv")).unwrap_err();
        assert!(matches!(err, SyncError::Io { .. }));
    }
}
