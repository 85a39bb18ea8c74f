//! Shared grid/range models, sink options and error types.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use rust_xlsxwriter::{Workbook, XlsxError};

use crate::conf::{C_CELL_ORIGIN, derive_default_xlsx_formats};

////////////////////////////////////////////////////////////////////////////////
// #region CellFormatSpecification

/// Cell format specification, converted to `rust_xlsxwriter::Format` at write time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SpecCellFormat {
    /// Font family name.
    pub font_name: Option<String>,
    /// Font size in points.
    pub font_size: Option<i64>,
    /// Bold style.
    pub bold: Option<bool>,
    /// Italic style.
    pub italic: Option<bool>,

    /// Horizontal alignment.
    pub align: Option<String>,
    /// Vertical alignment.
    pub valign: Option<String>,
    /// Text wrap.
    pub text_wrap: Option<bool>,

    /// Number format code.
    pub num_format: Option<String>,
    /// Background fill color.
    pub bg_color: Option<String>,
    /// Font color.
    pub font_color: Option<String>,
}

impl SpecCellFormat {
    /// Return a new format by overlaying `patch` onto `self`.
    pub fn with_(&self, patch: SpecCellFormat) -> SpecCellFormat {
        self.merge(&patch)
    }

    /// Merge two formats with right-side non-`None` overwrite semantics.
    pub fn merge(&self, other: &SpecCellFormat) -> SpecCellFormat {
        SpecCellFormat {
            font_name: other.font_name.clone().or_else(|| self.font_name.clone()),
            font_size: other.font_size.or(self.font_size),
            bold: other.bold.or(self.bold),
            italic: other.italic.or(self.italic),
            align: other.align.clone().or_else(|| self.align.clone()),
            valign: other.valign.clone().or_else(|| self.valign.clone()),
            text_wrap: other.text_wrap.or(self.text_wrap),
            num_format: other.num_format.clone().or_else(|| self.num_format.clone()),
            bg_color: other.bg_color.clone().or_else(|| self.bg_color.clone()),
            font_color: other.font_color.clone().or_else(|| self.font_color.clone()),
        }
    }
}

/// Format presets by value kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecXlsxFormatSet {
    /// Text cells.
    pub fmt_text: SpecCellFormat,
    /// Integer cells.
    pub fmt_integer: SpecCellFormat,
    /// Floating point cells.
    pub fmt_decimal: SpecCellFormat,
    /// Boolean cells.
    pub fmt_boolean: SpecCellFormat,
    /// Header row cells.
    pub fmt_header: SpecCellFormat,
}

impl Default for SpecXlsxFormatSet {
    fn default() -> Self {
        let mut dict_fmt = derive_default_xlsx_formats();
        let mut take = |key: &str| dict_fmt.remove(key).unwrap_or_default();
        Self {
            fmt_text: take("text"),
            fmt_integer: take("integer"),
            fmt_decimal: take("decimal"),
            fmt_boolean: take("boolean"),
            fmt_header: take("header"),
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region GridSpecification

/// One scalar cell of a query result.
#[derive(Debug, Clone, PartialEq)]
pub enum EnumCellValue {
    /// Missing/blank value.
    None,
    /// Text value.
    String(String),
    /// Integer value.
    Integer(i64),
    /// Floating point value.
    Number(f64),
    /// Boolean value.
    Boolean(bool),
}

impl EnumCellValue {
    /// Whether the cell is blank.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl From<&str> for EnumCellValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for EnumCellValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for EnumCellValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for EnumCellValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for EnumCellValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl<T> From<Option<T>> for EnumCellValue
where
    T: Into<EnumCellValue>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::None, Into::into)
    }
}

impl fmt::Display for EnumCellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::String(val) => write!(f, "{val}"),
            Self::Integer(val) => write!(f, "{val}"),
            Self::Number(val) => write!(f, "{val}"),
            Self::Boolean(val) => write!(f, "{}", if *val { "TRUE" } else { "FALSE" }),
        }
    }
}

/// One data row keyed by column name.
pub type RowMapping = BTreeMap<String, EnumCellValue>;

/// Snapshot of a query result handed to a sink.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpecQueryResult {
    /// Query text or identifier the rows came from.
    pub query: String,
    /// Selected column names, in output order.
    pub columns: Vec<String>,
    /// Result rows.
    pub rows: Vec<RowMapping>,
}

/// Rectangular header + data grid.
///
/// Row 0 holds the column names; every row has the header's width.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpecGrid {
    rows: Vec<Vec<EnumCellValue>>,
}

impl SpecGrid {
    pub(crate) fn from_rows(rows: Vec<Vec<EnumCellValue>>) -> Self {
        debug_assert!(
            rows.iter()
                .all(|row| rows.first().is_none_or(|header| header.len() == row.len())),
            "All grid rows must have the header's width."
        );
        Self { rows }
    }

    /// All rows, header first.
    pub fn rows(&self) -> &[Vec<EnumCellValue>] {
        &self.rows
    }

    /// Header row (empty when the grid has no rows at all).
    pub fn header(&self) -> &[EnumCellValue] {
        self.rows.first().map(Vec::as_slice).unwrap_or_default()
    }

    /// Data rows below the header.
    pub fn body(&self) -> &[Vec<EnumCellValue>] {
        self.rows.get(1..).unwrap_or(&[])
    }

    /// Number of columns (header width).
    pub fn width(&self) -> usize {
        self.header().len()
    }

    /// Number of rows, header included.
    pub fn height(&self) -> usize {
        self.rows.len()
    }
}

/// Rectangular cell range anchored at `A1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpecRangeAddress {
    /// 1-based index of the last column.
    pub col_last: usize,
    /// Label of the last column (`B` for 2).
    pub col_last_label: String,
    /// 1-based index of the last row.
    pub row_last: usize,
}

impl SpecRangeAddress {
    /// Bottom-right cell, e.g. `B3`.
    pub fn cell_bottom_right(&self) -> String {
        format!("{}{}", self.col_last_label, self.row_last)
    }
}

impl fmt::Display for SpecRangeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{C_CELL_ORIGIN}:{}", self.cell_bottom_right())
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region SinkOptions

/// What to do when a named target sheet does not exist in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnumSheetMissingRule {
    /// Append a new sheet with the requested name (default).
    #[default]
    Create,
    /// Fail the write.
    Error,
}

/// Autofit rule for column width inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnumAutofitColumnsRule {
    /// Disable autofit.
    None,
    /// Infer width from header cells only.
    Header,
    /// Infer width from both header and body cells (default).
    #[default]
    All,
}

/// Autofit policy for per-sheet write call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecAutofitCellsPolicy {
    /// Autofit width inference rule.
    pub rule_columns: EnumAutofitColumnsRule,
    /// Max body rows inspected when body-based inference is active.
    pub height_body_inferred_max: Option<usize>,
    /// Minimum final width.
    pub width_cell_min: usize,
    /// Maximum final width.
    pub width_cell_max: usize,
    /// Width padding added after inference.
    pub width_cell_padding: usize,
}

impl Default for SpecAutofitCellsPolicy {
    fn default() -> Self {
        Self {
            rule_columns: EnumAutofitColumnsRule::All,
            height_body_inferred_max: Some(20_000),
            width_cell_min: 8,
            width_cell_max: 60,
            width_cell_padding: 2,
        }
    }
}

/// Record handed to the post-processing hook once the grid is written.
pub struct SpecPostProcessContext<'a> {
    /// Query whose result was written.
    pub query: &'a SpecQueryResult,
    /// Workbook session holding the target sheet.
    pub workbook: &'a mut Workbook,
    /// Container the workbook is saved to.
    pub path_container: &'a Path,
    /// Name of the sheet that received the grid.
    pub sheet_name: &'a str,
    /// Range covering header and data.
    pub range_data: &'a SpecRangeAddress,
}

/// Caller-supplied callback run after a successful write.
pub type PostProcessingHook = Box<dyn FnMut(&mut SpecPostProcessContext<'_>) -> Result<(), String>>;

/// Container-level options of one writer session.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecXlsxSinkOptions {
    /// Existing workbook to open; a new workbook is created when `None` or missing on disk.
    pub target_container: Option<PathBuf>,
    /// Per-kind cell formats.
    pub formats: SpecXlsxFormatSet,
    /// Write missing cells as `missing_value_str` instead of blank.
    pub if_keep_missing_values: bool,
    /// Replacement text for missing cells when kept.
    pub missing_value_str: String,
    /// Replacement text for NaN.
    pub nan_str: String,
}

impl Default for SpecXlsxSinkOptions {
    fn default() -> Self {
        Self {
            target_container: None,
            formats: SpecXlsxFormatSet::default(),
            if_keep_missing_values: false,
            missing_value_str: "NA".to_string(),
            nan_str: "NaN".to_string(),
        }
    }
}

/// Per-write call options.
pub struct SpecXlsxSheetWriteOptions {
    /// Sheet to write into; the first sheet when `None`.
    pub target_sheet: Option<String>,
    /// Behavior for a named sheet that does not exist yet.
    pub rule_sheet_missing: EnumSheetMissingRule,
    /// Freeze panes below the header row.
    pub if_freeze_header: bool,
    /// Column autofit policy.
    pub policy_autofit: SpecAutofitCellsPolicy,
    /// Callback run after the write.
    pub post_processing_hook: Option<PostProcessingHook>,
}

impl Default for SpecXlsxSheetWriteOptions {
    fn default() -> Self {
        Self {
            target_sheet: None,
            rule_sheet_missing: EnumSheetMissingRule::Create,
            if_freeze_header: true,
            policy_autofit: SpecAutofitCellsPolicy::default(),
            post_processing_hook: None,
        }
    }
}

impl fmt::Debug for SpecXlsxSheetWriteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpecXlsxSheetWriteOptions")
            .field("target_sheet", &self.target_sheet)
            .field("rule_sheet_missing", &self.rule_sheet_missing)
            .field("if_freeze_header", &self.if_freeze_header)
            .field("policy_autofit", &self.policy_autofit)
            .field(
                "post_processing_hook",
                &self.post_processing_hook.as_ref().map(|_| "<hook>"),
            )
            .finish()
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region ReportSpecification

/// Sheet region produced by one write call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecSheetWrite {
    /// Actual sheet name in workbook.
    pub sheet_name: String,
    /// Range covering header and data.
    pub range_data: SpecRangeAddress,
    /// Range covering the header row only.
    pub range_header: SpecRangeAddress,
    /// Whether the sheet was created by this call.
    pub if_created: bool,
}

/// Per-write call report.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpecXlsxReport {
    /// Sheet regions written by the call.
    pub sheets: Vec<SpecSheetWrite>,
    /// Non-fatal warnings.
    pub warnings: Vec<String>,
}

impl SpecXlsxReport {
    /// Add a warning message.
    pub fn warn(&mut self, msg: impl AsRef<str>) {
        log::warn!("{}", msg.as_ref());
        self.warnings.push(msg.as_ref().to_string());
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Errors

/// Range computation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    /// The header row is empty, so no column bound exists.
    InvalidColumnCount,
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidColumnCount => {
                write!(f, "Cannot address a grid with zero columns.")
            }
        }
    }
}

impl std::error::Error for RangeError {}

/// "Top-level write failed" errors of [`crate::writer::XlsxQueryWriter`].
#[derive(Debug)]
pub enum XlsxWriteError {
    /// Grid could not be addressed.
    Range(RangeError),
    /// Named sheet is absent and creation is disabled.
    SheetMissing(String),
    /// Grid exceeds worksheet row/column limits.
    SheetLimit {
        /// Grid height, header included.
        height: usize,
        /// Grid width.
        width: usize,
    },
    /// Existing container could not be read.
    ContainerOpen {
        /// Container path.
        path: PathBuf,
        /// Underlying reader error text.
        message: String,
    },
    /// Writer was already closed.
    Closed,
    /// Input payload could not be decoded.
    InvalidInput(String),
    /// Underlying workbook error.
    Xlsx(XlsxError),
}

impl fmt::Display for XlsxWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range(err) => write!(f, "{err}"),
            Self::SheetMissing(name) => {
                write!(f, "Sheet not found in container: {name:?}")
            }
            Self::SheetLimit { height, width } => write!(
                f,
                "Grid of {height} rows x {width} columns exceeds Excel sheet limits."
            ),
            Self::ContainerOpen { path, message } => {
                write!(f, "Failed to open container {}: {message}", path.display())
            }
            Self::Closed => write!(f, "Cannot write after close()."),
            Self::InvalidInput(msg) => write!(f, "{msg}"),
            Self::Xlsx(err) => write!(f, "xlsx write error: {err}"),
        }
    }
}

impl std::error::Error for XlsxWriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Range(err) => Some(err),
            Self::Xlsx(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RangeError> for XlsxWriteError {
    fn from(err: RangeError) -> Self {
        Self::Range(err)
    }
}

impl From<XlsxError> for XlsxWriteError {
    fn from(err: XlsxError) -> Self {
        Self::Xlsx(err)
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
