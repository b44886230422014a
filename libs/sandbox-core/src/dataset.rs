// Tabular query results and the equivalence checks used to grade them.
//
// Two datasets are compared after normalizing both sides according to the
// selected output tests, then checked for plain structural equality.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetColumn {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

impl DatasetColumn {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: None,
        }
    }

    pub fn typed(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: Some(data_type.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub columns: Vec<DatasetColumn>,
    /// Cells in column order
    pub rows: Vec<Vec<Value>>,
}

/// How strictly a produced dataset must match the expected one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputTest {
    MatchOutput,
    IgnoreColumnOrder,
    IgnoreRowOrder,
    IgnoreColumnAndRowOrder,
    /// Columns of the produced dataset absent from the expected one are dropped
    IgnoreExtraColumns,
    IgnoreColumnTypes,
}

impl Dataset {
    /// Columns sorted by name, cells moved along with their column
    pub fn sorted_columns(&self) -> Dataset {
        let mut order: Vec<usize> = (0..self.columns.len()).collect();
        order.sort_by(|&a, &b| self.columns[a].name.cmp(&self.columns[b].name));

        Dataset {
            columns: order.iter().map(|&i| self.columns[i].clone()).collect(),
            rows: self.rows.iter().map(|row| pick(row, &order)).collect(),
        }
    }

    /// Rows sorted by their JSON rendering
    pub fn sorted_rows(&self) -> Dataset {
        let mut rows = self.rows.clone();
        rows.sort_by_cached_key(|row| Value::Array(row.clone()).to_string());
        Dataset {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Keep only the columns whose name appears in `reference`
    pub fn without_extra_columns(&self, reference: &Dataset) -> Dataset {
        let kept: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, col)| reference.columns.iter().any(|r| r.name == col.name))
            .map(|(i, _)| i)
            .collect();

        Dataset {
            columns: kept.iter().map(|&i| self.columns[i].clone()).collect(),
            rows: self.rows.iter().map(|row| pick(row, &kept)).collect(),
        }
    }

    pub fn without_column_types(&self) -> Dataset {
        Dataset {
            columns: self
                .columns
                .iter()
                .map(|col| DatasetColumn::new(col.name.clone()))
                .collect(),
            rows: self.rows.clone(),
        }
    }
}

fn pick(row: &[Value], indexes: &[usize]) -> Vec<Value> {
    indexes
        .iter()
        .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Compare `actual` against `expected` under a single output test
pub fn are_equivalent(expected: &Dataset, actual: &Dataset, test: OutputTest) -> bool {
    satisfies(expected, actual, &[test])
}

/// Compare `actual` against `expected` with every normalization in `tests` applied.
/// An empty set means an exact match.
pub fn satisfies(expected: &Dataset, actual: &Dataset, tests: &[OutputTest]) -> bool {
    let wants = |test: OutputTest| tests.contains(&test);
    let ignore_columns = wants(OutputTest::IgnoreColumnOrder)
        || wants(OutputTest::IgnoreColumnAndRowOrder);
    let ignore_rows =
        wants(OutputTest::IgnoreRowOrder) || wants(OutputTest::IgnoreColumnAndRowOrder);

    let mut expected = expected.clone();
    let mut actual = actual.clone();

    if wants(OutputTest::IgnoreExtraColumns) {
        actual = actual.without_extra_columns(&expected);
    }
    if wants(OutputTest::IgnoreColumnTypes) {
        expected = expected.without_column_types();
        actual = actual.without_column_types();
    }
    if ignore_columns {
        expected = expected.sorted_columns();
        actual = actual.sorted_columns();
    }
    if ignore_rows {
        expected = expected.sorted_rows();
        actual = actual.sorted_rows();
    }

    expected == actual
}
