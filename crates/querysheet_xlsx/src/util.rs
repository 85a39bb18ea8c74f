//! Stateless helpers: column labels, grid shaping and range addressing.

use std::collections::BTreeMap;

use polars::prelude::{AnyValue, DataFrame};

use crate::conf::{N_COLUMN_ALPHABET_SIZE, N_LEN_EXCEL_SHEET_NAME_MAX, TUP_EXCEL_ILLEGAL};
use crate::spec::{
    EnumCellValue, RangeError, RowMapping, SpecGrid, SpecQueryResult, SpecRangeAddress,
};

////////////////////////////////////////////////////////////////////////////////
// #region ColumnNaming

/// Convert a 1-based column index to its spreadsheet label (`1 -> A`, `27 -> AA`).
///
/// Labels are bijective base-26 numerals: digits run `1..=26` (`A..=Z`) and
/// there is no zero digit, so a remainder of 0 stands for `Z` and that full
/// 26 is subtracted before dividing. Returns `None` for `n <= 0`.
pub fn column_name(n: i64) -> Option<String> {
    if n <= 0 {
        return None;
    }

    let l_letters: Vec<char> = std::iter::successors(Some(n), |&n_rest| {
        let n_next = (n_rest - derive_bijective_digit(n_rest)) / N_COLUMN_ALPHABET_SIZE;
        (n_next > 0).then_some(n_next)
    })
    .map(|n_rest| char::from(b'A' + (derive_bijective_digit(n_rest) - 1) as u8))
    .collect();

    Some(l_letters.into_iter().rev().collect())
}

fn derive_bijective_digit(n: i64) -> i64 {
    match n % N_COLUMN_ALPHABET_SIZE {
        0 => N_COLUMN_ALPHABET_SIZE,
        n_rem => n_rem,
    }
}

/// Inverse of [`column_name`]; case-insensitive.
///
/// Returns `None` for empty labels, non-letters, or values overflowing `i64`.
pub fn column_index(label: &str) -> Option<i64> {
    if label.is_empty() {
        return None;
    }

    label.bytes().try_fold(0i64, |n_acc, chr| {
        if !chr.is_ascii_alphabetic() {
            return None;
        }
        let n_digit = i64::from(chr.to_ascii_uppercase() - b'A') + 1;
        n_acc
            .checked_mul(N_COLUMN_ALPHABET_SIZE)?
            .checked_add(n_digit)
    })
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region GridShaping

/// Assemble header + data rows into a rectangular grid.
///
/// Row 0 is `columns`; each data row takes values in the same order. A row
/// without a value for some column gets a blank cell, never a shorter row.
/// Keys not named in `columns` are ignored.
pub fn build_grid(columns: &[String], rows: &[RowMapping]) -> SpecGrid {
    let mut l_rows = Vec::with_capacity(rows.len() + 1);
    l_rows.push(
        columns
            .iter()
            .map(|c_name| EnumCellValue::String(c_name.clone()))
            .collect::<Vec<_>>(),
    );

    for row in rows {
        l_rows.push(
            columns
                .iter()
                .map(|c_name| row.get(c_name).cloned().unwrap_or(EnumCellValue::None))
                .collect(),
        );
    }

    SpecGrid::from_rows(l_rows)
}

/// List `(data row index, column name)` pairs the rows could not supply.
pub fn derive_missing_cells(columns: &[String], rows: &[RowMapping]) -> Vec<(usize, String)> {
    let mut l_missing = Vec::new();
    for (n_idx_row, row) in rows.iter().enumerate() {
        for c_name in columns {
            if !row.contains_key(c_name) {
                l_missing.push((n_idx_row, c_name.clone()));
            }
        }
    }
    l_missing
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region RangeAddressing

/// Range covering the whole grid, header row included (`A1:<last col><height>`).
pub fn compute_range(grid: &SpecGrid) -> Result<SpecRangeAddress, RangeError> {
    derive_range_address(grid.width(), grid.height())
}

/// Range covering only the header row (`A1:<last col>1`).
pub fn compute_header_range(grid: &SpecGrid) -> Result<SpecRangeAddress, RangeError> {
    derive_range_address(grid.width(), 1)
}

/// Range for a `width` x `height` block at `A1`, header row included in `height`.
///
/// Needs no grid, so callers that only know the shape avoid materializing rows.
pub fn derive_range_address(width: usize, height: usize) -> Result<SpecRangeAddress, RangeError> {
    let col_last_label = i64::try_from(width)
        .ok()
        .and_then(column_name)
        .ok_or(RangeError::InvalidColumnCount)?;

    Ok(SpecRangeAddress {
        col_last: width,
        col_last_label,
        row_last: height,
    })
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region DataFrameLikeUtils

/// Convert a DataFrame into a query snapshot; nulls become blank cells.
pub fn derive_query_result_from_dataframe(
    query: &str,
    df: &DataFrame,
) -> Result<SpecQueryResult, String> {
    let l_colnames: Vec<String> = df
        .get_column_names_str()
        .into_iter()
        .map(ToString::to_string)
        .collect();
    let l_cols = df.get_columns();

    let mut l_rows = Vec::with_capacity(df.height());
    for n_idx_row in 0..df.height() {
        let mut row = BTreeMap::new();
        for (c_name, col) in l_colnames.iter().zip(l_cols) {
            let value = col
                .get(n_idx_row)
                .map_err(|err| format!("Failed to access cell value: {err}"))?;
            row.insert(c_name.clone(), derive_cell_value_from_any_value(value));
        }
        l_rows.push(row);
    }

    Ok(SpecQueryResult {
        query: query.to_string(),
        columns: l_colnames,
        rows: l_rows,
    })
}

fn derive_cell_value_from_any_value(value: AnyValue<'_>) -> EnumCellValue {
    match value {
        AnyValue::Null => EnumCellValue::None,
        AnyValue::String(val) => EnumCellValue::String(val.to_string()),
        AnyValue::StringOwned(val) => EnumCellValue::String(val.to_string()),
        AnyValue::Boolean(val) => EnumCellValue::Boolean(val),
        AnyValue::UInt8(val) => EnumCellValue::Integer(i64::from(val)),
        AnyValue::UInt16(val) => EnumCellValue::Integer(i64::from(val)),
        AnyValue::UInt32(val) => EnumCellValue::Integer(i64::from(val)),
        AnyValue::UInt64(val) => match i64::try_from(val) {
            Ok(val) => EnumCellValue::Integer(val),
            Err(_) => EnumCellValue::Number(val as f64),
        },
        AnyValue::Int8(val) => EnumCellValue::Integer(i64::from(val)),
        AnyValue::Int16(val) => EnumCellValue::Integer(i64::from(val)),
        AnyValue::Int32(val) => EnumCellValue::Integer(i64::from(val)),
        AnyValue::Int64(val) => EnumCellValue::Integer(val),
        AnyValue::Float32(val) => EnumCellValue::Number(f64::from(val)),
        AnyValue::Float64(val) => EnumCellValue::Number(val),
        _ => EnumCellValue::String(value.to_string()),
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region SheetNormalization

/// Replace invalid chars and trim to valid Excel sheet name.
pub fn sanitize_sheet_name(name: &str, replace_to: &str) -> String {
    let mut c_name = name.to_string();
    for c_illegal in TUP_EXCEL_ILLEGAL {
        c_name = c_name.replace(c_illegal, replace_to);
    }
    c_name = c_name.trim().trim_matches('\'').to_string();
    if c_name.is_empty() {
        c_name = "Sheet".to_string();
    }

    c_name.chars().take(N_LEN_EXCEL_SHEET_NAME_MAX).collect()
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
