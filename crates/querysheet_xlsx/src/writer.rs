//! XLSX sink that writes query grids into a workbook container.

use std::io::Cursor;
use std::path::PathBuf;

use calamine::{Data, Reader, open_workbook_auto};
use polars::prelude::{DataFrame, IpcReader, SerReader};
use rust_xlsxwriter::{Format, FormatAlign, Workbook, Worksheet};

use crate::conf::{C_SHEET_NAME_DEFAULT, N_NCOLS_EXCEL_MAX, N_NROWS_EXCEL_MAX};
use crate::spec::{
    EnumAutofitColumnsRule, EnumCellValue, EnumSheetMissingRule, SpecAutofitCellsPolicy,
    SpecCellFormat, SpecGrid, SpecPostProcessContext, SpecQueryResult, SpecSheetWrite,
    SpecXlsxReport, SpecXlsxSheetWriteOptions, SpecXlsxSinkOptions, XlsxWriteError,
};
use crate::util::{
    build_grid, compute_header_range, compute_range, derive_missing_cells,
    derive_query_result_from_dataframe, sanitize_sheet_name,
};

/// Formats resolved once per write call.
struct SpecResolvedFormats {
    fmt_text: Format,
    fmt_integer: Format,
    fmt_decimal: Format,
    fmt_boolean: Format,
    fmt_header: Format,
}

/// Stateful workbook session.
///
/// The workbook is buffered in memory until [`Self::close`] is called.
pub struct XlsxQueryWriter {
    path_file_out: PathBuf,
    workbook: Workbook,
    options: SpecXlsxSinkOptions,
    l_sheet_names: Vec<String>,
    l_reports: Vec<SpecXlsxReport>,
    if_closed: bool,
}

impl XlsxQueryWriter {
    /// Create a writer for a new, empty workbook saved to `path_file_out`.
    pub fn new(path_file_out: PathBuf, options: SpecXlsxSinkOptions) -> Self {
        Self {
            path_file_out,
            workbook: Workbook::new(),
            options,
            l_sheet_names: Vec::new(),
            l_reports: Vec::new(),
            if_closed: false,
        }
    }

    /// Open an existing container, or start a new one when `path_container` does not exist.
    ///
    /// Sheet names, order and cell values of the existing file are carried over;
    /// its styling is not.
    pub fn open(
        path_container: PathBuf,
        options: SpecXlsxSinkOptions,
    ) -> Result<Self, XlsxWriteError> {
        let mut writer = Self::new(path_container, options);
        if writer.path_file_out.is_file() {
            writer.load_container()?;
        }
        Ok(writer)
    }

    /// Pick [`Self::open`] or [`Self::new`] from `options.target_container`.
    pub fn from_options(
        path_file_default: PathBuf,
        options: SpecXlsxSinkOptions,
    ) -> Result<Self, XlsxWriteError> {
        match options.target_container.clone() {
            Some(path_container) => Self::open(path_container, options),
            None => Ok(Self::new(path_file_default, options)),
        }
    }

    /// Return output file path as string.
    pub fn file_out(&self) -> String {
        self.path_file_out.to_string_lossy().to_string()
    }

    /// Sheet names currently in the workbook, in order.
    pub fn sheet_names(&self) -> &[String] {
        &self.l_sheet_names
    }

    /// Return immutable snapshot of per-write reports.
    pub fn report(&self) -> Vec<SpecXlsxReport> {
        self.l_reports.clone()
    }

    /// Flush workbook to disk. Idempotent.
    pub fn close(&mut self) -> Result<(), XlsxWriteError> {
        if self.if_closed {
            return Ok(());
        }
        self.workbook.save(&self.path_file_out)?;
        self.if_closed = true;
        log::debug!("Saved workbook {}", self.path_file_out.display());
        Ok(())
    }

    /// Write one query result as header + data grid starting at `A1`.
    ///
    /// Range computation and limit checks run before any cell is touched, so a
    /// query without columns fails without creating a sheet. A new target sheet
    /// is filled detached and only joins the workbook once every cell is
    /// written; a failed write into an existing sheet may leave partial cells.
    /// A failing post-processing hook only adds a warning to the returned report.
    pub fn write_query(
        &mut self,
        query: &SpecQueryResult,
        mut options: SpecXlsxSheetWriteOptions,
    ) -> Result<SpecXlsxReport, XlsxWriteError> {
        if self.if_closed {
            return Err(XlsxWriteError::Closed);
        }
        validate_policy_autofit(&options.policy_autofit).map_err(XlsxWriteError::InvalidInput)?;

        let grid = build_grid(&query.columns, &query.rows);
        let range_data = compute_range(&grid)?;
        let range_header = compute_header_range(&grid)?;
        if grid.height() > N_NROWS_EXCEL_MAX || grid.width() > N_NCOLS_EXCEL_MAX {
            return Err(XlsxWriteError::SheetLimit {
                height: grid.height(),
                width: grid.width(),
            });
        }

        let mut report = SpecXlsxReport::default();

        let l_missing = derive_missing_cells(&query.columns, &query.rows);
        if let Some((n_idx_row, c_name)) = l_missing.first() {
            report.warn(format!(
                "{} cell(s) missing from query rows were written blank (first: row {n_idx_row}, column {c_name:?}).",
                l_missing.len()
            ));
        }

        let (sheet_name, if_created) = self.resolve_target_sheet(
            options.target_sheet.as_deref(),
            options.rule_sheet_missing,
            &mut report,
        )?;
        log::debug!(
            "Writing range {range_data} (header {range_header}) to sheet {sheet_name:?}"
        );

        let formats = resolve_formats(&self.options);
        if if_created {
            let mut worksheet = Worksheet::new();
            worksheet.set_name(&sheet_name)?;
            render_sheet(&mut worksheet, &grid, &formats, &self.options, &options)?;
            self.workbook.push_worksheet(worksheet);
            self.l_sheet_names.push(sheet_name.clone());
        } else {
            let worksheet = self.workbook.worksheet_from_name(&sheet_name)?;
            render_sheet(worksheet, &grid, &formats, &self.options, &options)?;
        }

        report.sheets.push(SpecSheetWrite {
            sheet_name: sheet_name.clone(),
            range_data: range_data.clone(),
            range_header,
            if_created,
        });

        if let Some(mut hook) = options.post_processing_hook.take() {
            let mut ctx = SpecPostProcessContext {
                query,
                workbook: &mut self.workbook,
                path_container: &self.path_file_out,
                sheet_name: &sheet_name,
                range_data: &range_data,
            };
            let res_hook = hook(&mut ctx);
            // The hook may add or rename sheets.
            self.sync_sheet_names();
            if let Err(msg) = res_hook {
                report.warn(format!(
                    "Post-processing hook failed for sheet {sheet_name:?}: {msg}"
                ));
            }
        }

        self.l_reports.push(report.clone());
        Ok(report)
    }

    /// Write a DataFrame as one query result.
    pub fn write_dataframe(
        &mut self,
        query: &str,
        df: &DataFrame,
        options: SpecXlsxSheetWriteOptions,
    ) -> Result<SpecXlsxReport, XlsxWriteError> {
        let query_result =
            derive_query_result_from_dataframe(query, df).map_err(XlsxWriteError::InvalidInput)?;
        self.write_query(&query_result, options)
    }

    /// Write IPC-serialized DataFrame bytes as one query result.
    pub fn write_ipc_bytes(
        &mut self,
        query: &str,
        v_ipc_df: &[u8],
        options: SpecXlsxSheetWriteOptions,
    ) -> Result<SpecXlsxReport, XlsxWriteError> {
        if self.if_closed {
            return Err(XlsxWriteError::Closed);
        }
        let df = derive_dataframe_from_ipc_bytes(v_ipc_df).map_err(XlsxWriteError::InvalidInput)?;
        self.write_dataframe(query, &df, options)
    }

    /// Pick the sheet a write goes to; `true` when it still has to be created.
    fn resolve_target_sheet(
        &mut self,
        target_sheet: Option<&str>,
        rule_sheet_missing: EnumSheetMissingRule,
        report: &mut SpecXlsxReport,
    ) -> Result<(String, bool), XlsxWriteError> {
        let Some(c_name_raw) = target_sheet else {
            return match self.l_sheet_names.first() {
                Some(c_name) => Ok((c_name.clone(), false)),
                None => Ok((C_SHEET_NAME_DEFAULT.to_string(), true)),
            };
        };

        let c_name = sanitize_sheet_name(c_name_raw, "_");
        if c_name != c_name_raw {
            report.warn(format!(
                "Sheet name {c_name_raw:?} is not valid in Excel; using {c_name:?}."
            ));
        }

        // Excel compares sheet names case-insensitively over full Unicode.
        let c_name_lower = c_name.to_lowercase();
        if let Some(c_name_existing) = self
            .l_sheet_names
            .iter()
            .find(|c_existing| c_existing.to_lowercase() == c_name_lower)
        {
            return Ok((c_name_existing.clone(), false));
        }

        match rule_sheet_missing {
            EnumSheetMissingRule::Create => Ok((c_name, true)),
            EnumSheetMissingRule::Error => Err(XlsxWriteError::SheetMissing(c_name)),
        }
    }

    fn sync_sheet_names(&mut self) {
        self.l_sheet_names = self
            .workbook
            .worksheets()
            .iter()
            .map(Worksheet::name)
            .collect();
    }

    fn create_sheet(&mut self, name: &str) -> Result<String, XlsxWriteError> {
        let worksheet = self.workbook.add_worksheet();
        worksheet.set_name(name)?;
        self.l_sheet_names.push(name.to_string());
        Ok(name.to_string())
    }

    fn load_container(&mut self) -> Result<(), XlsxWriteError> {
        let path_container = self.path_file_out.clone();
        let map_open_err = |message: String| XlsxWriteError::ContainerOpen {
            path: path_container.clone(),
            message,
        };

        let mut workbook_src =
            open_workbook_auto(&path_container).map_err(|err| map_open_err(err.to_string()))?;
        let fmt_datetime = Format::new().set_num_format("yyyy-mm-dd hh:mm:ss");

        for c_name in workbook_src.sheet_names() {
            let range = workbook_src
                .worksheet_range(&c_name)
                .map_err(|err| map_open_err(format!("sheet {c_name:?}: {err}")))?;
            let (n_row_start, n_col_start) = range.start().unwrap_or((0, 0));

            let c_name_created = self.create_sheet(&c_name)?;
            let worksheet = self.workbook.worksheet_from_name(&c_name_created)?;
            for (n_row, n_col, cell) in range.used_cells() {
                write_loaded_cell(
                    worksheet,
                    n_row_start as usize + n_row,
                    n_col_start as usize + n_col,
                    cell,
                    &fmt_datetime,
                )?;
            }
        }

        log::debug!(
            "Loaded container {} with sheets {:?}",
            path_container.display(),
            self.l_sheet_names
        );
        Ok(())
    }
}

fn render_sheet(
    worksheet: &mut Worksheet,
    grid: &SpecGrid,
    formats: &SpecResolvedFormats,
    options_sink: &SpecXlsxSinkOptions,
    options_sheet: &SpecXlsxSheetWriteOptions,
) -> Result<(), XlsxWriteError> {
    write_grid(worksheet, grid, formats, options_sink)?;
    if options_sheet.if_freeze_header {
        worksheet.set_freeze_panes(1, 0)?;
    }
    apply_autofit(worksheet, grid, &options_sheet.policy_autofit)
}

fn write_grid(
    worksheet: &mut Worksheet,
    grid: &SpecGrid,
    formats: &SpecResolvedFormats,
    options: &SpecXlsxSinkOptions,
) -> Result<(), XlsxWriteError> {
    for (n_idx_col, value) in grid.header().iter().enumerate() {
        worksheet.write_string_with_format(
            0,
            cast_col_num(n_idx_col)?,
            value.to_string(),
            &formats.fmt_header,
        )?;
    }

    for (n_idx_row, row) in grid.body().iter().enumerate() {
        for (n_idx_col, value) in row.iter().enumerate() {
            write_cell_with_format(worksheet, n_idx_row + 1, n_idx_col, value, formats, options)?;
        }
    }
    Ok(())
}

fn write_cell_with_format(
    worksheet: &mut Worksheet,
    row_idx: usize,
    col_idx: usize,
    value: &EnumCellValue,
    formats: &SpecResolvedFormats,
    options: &SpecXlsxSinkOptions,
) -> Result<(), XlsxWriteError> {
    let n_row = cast_row_num(row_idx)?;
    let n_col = cast_col_num(col_idx)?;
    match value {
        EnumCellValue::None => {
            if options.if_keep_missing_values {
                worksheet.write_string_with_format(
                    n_row,
                    n_col,
                    &options.missing_value_str,
                    &formats.fmt_text,
                )?;
            } else {
                worksheet.write_blank(n_row, n_col, &formats.fmt_text)?;
            }
        }
        EnumCellValue::String(val) => {
            worksheet.write_string_with_format(n_row, n_col, val, &formats.fmt_text)?;
        }
        EnumCellValue::Integer(val) => {
            worksheet.write_number_with_format(n_row, n_col, *val as f64, &formats.fmt_integer)?;
        }
        EnumCellValue::Number(val) if val.is_finite() => {
            worksheet.write_number_with_format(n_row, n_col, *val, &formats.fmt_decimal)?;
        }
        EnumCellValue::Number(val) => {
            let c_text = if val.is_nan() {
                options.nan_str.clone()
            } else if val.is_sign_positive() {
                "Inf".to_string()
            } else {
                "-Inf".to_string()
            };
            worksheet.write_string_with_format(n_row, n_col, c_text, &formats.fmt_text)?;
        }
        EnumCellValue::Boolean(val) => {
            worksheet.write_boolean_with_format(n_row, n_col, *val, &formats.fmt_boolean)?;
        }
    }
    Ok(())
}

fn write_loaded_cell(
    worksheet: &mut Worksheet,
    row_idx: usize,
    col_idx: usize,
    cell: &Data,
    fmt_datetime: &Format,
) -> Result<(), XlsxWriteError> {
    let n_row = cast_row_num(row_idx)?;
    let n_col = cast_col_num(col_idx)?;
    match cell {
        Data::Empty => {}
        Data::String(val) | Data::DateTimeIso(val) | Data::DurationIso(val) => {
            worksheet.write_string(n_row, n_col, val)?;
        }
        Data::Float(val) => {
            worksheet.write_number(n_row, n_col, *val)?;
        }
        Data::Int(val) => {
            worksheet.write_number(n_row, n_col, *val as f64)?;
        }
        Data::Bool(val) => {
            worksheet.write_boolean(n_row, n_col, *val)?;
        }
        Data::DateTime(val) => {
            worksheet.write_number_with_format(n_row, n_col, val.as_f64(), fmt_datetime)?;
        }
        Data::Error(err) => {
            worksheet.write_string(n_row, n_col, err.to_string())?;
        }
    }
    Ok(())
}

fn apply_autofit(
    worksheet: &mut Worksheet,
    grid: &SpecGrid,
    policy_autofit: &SpecAutofitCellsPolicy,
) -> Result<(), XlsxWriteError> {
    if matches!(policy_autofit.rule_columns, EnumAutofitColumnsRule::None) {
        return Ok(());
    }

    let mut l_width_by_col: Vec<usize> = grid
        .header()
        .iter()
        .map(|value| estimate_width_len(value))
        .collect();

    if matches!(policy_autofit.rule_columns, EnumAutofitColumnsRule::All) {
        let n_rows_inspected = policy_autofit
            .height_body_inferred_max
            .unwrap_or(usize::MAX);
        for row in grid.body().iter().take(n_rows_inspected) {
            for (n_width, value) in l_width_by_col.iter_mut().zip(row) {
                *n_width = usize::max(*n_width, estimate_width_len(value));
            }
        }
    }

    let n_min = usize::max(1, policy_autofit.width_cell_min);
    let n_max = usize::min(255, usize::max(n_min, policy_autofit.width_cell_max));
    for (n_idx_col, n_width_recorded) in l_width_by_col.into_iter().enumerate() {
        let n_width_final = usize::min(
            n_max,
            usize::max(n_min, n_width_recorded + policy_autofit.width_cell_padding),
        );
        worksheet.set_column_width(cast_col_num(n_idx_col)?, n_width_final as f64)?;
    }
    Ok(())
}

/// Estimate displayed width units for one cell value.
pub fn estimate_width_len(value: &EnumCellValue) -> usize {
    match value {
        EnumCellValue::None => 0,
        EnumCellValue::Number(n) if n.is_finite() => format!("{n}").len(),
        _ => estimate_unicode_string_width(&value.to_string()),
    }
}

fn estimate_unicode_string_width(s: &str) -> usize {
    let n_ascii = s.chars().filter(|chr| chr.is_ascii()).count();
    let n_non_ascii = s.chars().count().saturating_sub(n_ascii);
    n_ascii + (n_non_ascii as f64 * 1.6).round() as usize
}

fn resolve_formats(options: &SpecXlsxSinkOptions) -> SpecResolvedFormats {
    SpecResolvedFormats {
        fmt_text: derive_rust_xlsx_format(&options.formats.fmt_text),
        fmt_integer: derive_rust_xlsx_format(&options.formats.fmt_integer),
        fmt_decimal: derive_rust_xlsx_format(&options.formats.fmt_decimal),
        fmt_boolean: derive_rust_xlsx_format(&options.formats.fmt_boolean),
        fmt_header: derive_rust_xlsx_format(&options.formats.fmt_header),
    }
}

fn derive_dataframe_from_ipc_bytes(v_ipc_df: &[u8]) -> Result<DataFrame, String> {
    IpcReader::new(Cursor::new(v_ipc_df))
        .finish()
        .map_err(|err| format!("Failed to read IPC DataFrame bytes: {err}"))
}

fn validate_policy_autofit(policy_autofit: &SpecAutofitCellsPolicy) -> Result<(), String> {
    if policy_autofit.width_cell_min == 0 {
        return Err("policy_autofit.width_cell_min must be >= 1.".to_string());
    }
    if policy_autofit.width_cell_max < policy_autofit.width_cell_min {
        return Err(
            "policy_autofit.width_cell_max must be >= policy_autofit.width_cell_min.".to_string(),
        );
    }
    Ok(())
}

fn derive_rust_xlsx_format(spec: &SpecCellFormat) -> Format {
    let mut format = Format::new();

    if let Some(val) = &spec.font_name {
        format = format.set_font_name(val.clone());
    }
    if let Some(val) = spec.font_size {
        format = format.set_font_size(val as f64);
    }
    if spec.bold.unwrap_or(false) {
        format = format.set_bold();
    }
    if spec.italic.unwrap_or(false) {
        format = format.set_italic();
    }

    for val in [&spec.align, &spec.valign].into_iter().flatten() {
        if let Some(align) = derive_format_align(val) {
            format = format.set_align(align);
        }
    }

    if let Some(val) = &spec.num_format {
        format = format.set_num_format(val.clone());
    }
    if let Some(val) = &spec.bg_color {
        format = format.set_background_color(val.as_str());
    }
    if let Some(val) = &spec.font_color {
        format = format.set_font_color(val.as_str());
    }
    if spec.text_wrap.unwrap_or(false) {
        format = format.set_text_wrap();
    }

    format
}

fn derive_format_align(align: &str) -> Option<FormatAlign> {
    let value = align.trim().to_ascii_lowercase();
    match value.as_str() {
        "general" => Some(FormatAlign::General),
        "left" => Some(FormatAlign::Left),
        "center" => Some(FormatAlign::Center),
        "right" => Some(FormatAlign::Right),
        "fill" => Some(FormatAlign::Fill),
        "justify" => Some(FormatAlign::Justify),
        "top" => Some(FormatAlign::Top),
        "bottom" => Some(FormatAlign::Bottom),
        "vcenter" | "vertical_center" => Some(FormatAlign::VerticalCenter),
        _ => None,
    }
}

fn cast_row_num(value: usize) -> Result<u32, XlsxWriteError> {
    u32::try_from(value)
        .map_err(|_| XlsxWriteError::InvalidInput(format!("row index overflow: {value}")))
}

fn cast_col_num(value: usize) -> Result<u16, XlsxWriteError> {
    u16::try_from(value)
        .map_err(|_| XlsxWriteError::InvalidInput(format!("column index overflow: {value}")))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::io::Read;
    use std::path::Path;
    use std::rc::Rc;

    use calamine::{Data, Reader, Xlsx, open_workbook};
    use polars::prelude::{IpcWriter, SerWriter};

    use super::*;
    use crate::spec::{PostProcessingHook, RangeError};
    use crate::testing::TestDir;

    fn hook<F>(f: F) -> PostProcessingHook
    where
        F: FnMut(&mut SpecPostProcessContext<'_>) -> Result<(), String> + 'static,
    {
        Box::new(f)
    }

    fn query_measurements() -> SpecQueryResult {
        let mut row_1 = BTreeMap::new();
        row_1.insert("id".to_string(), EnumCellValue::Integer(1));
        row_1.insert("measurement".to_string(), EnumCellValue::from("x"));
        let mut row_2 = BTreeMap::new();
        row_2.insert("id".to_string(), EnumCellValue::Integer(2));
        row_2.insert("measurement".to_string(), EnumCellValue::from("y"));

        SpecQueryResult {
            query: "select id, measurement from samples".to_string(),
            columns: vec!["id".to_string(), "measurement".to_string()],
            rows: vec![row_1, row_2],
        }
    }

    fn read_sheet(path: &Path, sheet_name: &str) -> calamine::Range<Data> {
        let mut workbook: Xlsx<_> = open_workbook(path).expect("open written workbook");
        workbook
            .worksheet_range(sheet_name)
            .expect("read written sheet")
    }

    fn cell(range: &calamine::Range<Data>, row: u32, col: u32) -> Option<Data> {
        range.get_value((row, col)).cloned()
    }

    #[test]
    fn write_query_creates_first_sheet_in_new_container() {
        let dir = TestDir::new();
        let path_out = dir.path().join("out.xlsx");
        let mut writer = XlsxQueryWriter::new(path_out.clone(), SpecXlsxSinkOptions::default());

        let report = writer
            .write_query(&query_measurements(), SpecXlsxSheetWriteOptions::default())
            .expect("write");
        writer.close().expect("close");

        assert!(report.warnings.is_empty());
        assert_eq!(report.sheets.len(), 1);
        assert_eq!(report.sheets[0].sheet_name, "Sheet1");
        assert!(report.sheets[0].if_created);
        assert_eq!(report.sheets[0].range_data.to_string(), "A1:B3");
        assert_eq!(report.sheets[0].range_header.to_string(), "A1:B1");

        let range = read_sheet(&path_out, "Sheet1");
        assert_eq!(cell(&range, 0, 0), Some(Data::String("id".to_string())));
        assert_eq!(
            cell(&range, 0, 1),
            Some(Data::String("measurement".to_string()))
        );
        assert_eq!(cell(&range, 1, 0), Some(Data::Float(1.0)));
        assert_eq!(cell(&range, 2, 1), Some(Data::String("y".to_string())));
    }

    #[test]
    fn write_query_without_columns_fails_before_touching_workbook() {
        let dir = TestDir::new();
        let mut writer =
            XlsxQueryWriter::new(dir.path().join("out.xlsx"), SpecXlsxSinkOptions::default());
        let query = SpecQueryResult {
            query: "select".to_string(),
            columns: vec![],
            rows: vec![BTreeMap::new()],
        };

        let err = writer
            .write_query(&query, SpecXlsxSheetWriteOptions::default())
            .expect_err("empty header must fail");
        assert!(matches!(
            err,
            XlsxWriteError::Range(RangeError::InvalidColumnCount)
        ));
        assert!(writer.sheet_names().is_empty());
        assert!(writer.report().is_empty());
    }

    #[test]
    fn write_query_missing_sheet_respects_rule() {
        let dir = TestDir::new();
        let mut writer =
            XlsxQueryWriter::new(dir.path().join("out.xlsx"), SpecXlsxSinkOptions::default());

        let err = writer
            .write_query(
                &query_measurements(),
                SpecXlsxSheetWriteOptions {
                    target_sheet: Some("Results".to_string()),
                    rule_sheet_missing: EnumSheetMissingRule::Error,
                    ..Default::default()
                },
            )
            .expect_err("missing sheet must fail");
        assert!(matches!(err, XlsxWriteError::SheetMissing(ref name) if name == "Results"));

        let report = writer
            .write_query(
                &query_measurements(),
                SpecXlsxSheetWriteOptions {
                    target_sheet: Some("Results".to_string()),
                    ..Default::default()
                },
            )
            .expect("create missing sheet");
        assert!(report.sheets[0].if_created);
        assert_eq!(writer.sheet_names(), &["Results".to_string()]);

        let report = writer
            .write_query(
                &query_measurements(),
                SpecXlsxSheetWriteOptions {
                    target_sheet: Some("results".to_string()),
                    rule_sheet_missing: EnumSheetMissingRule::Error,
                    ..Default::default()
                },
            )
            .expect("reuse existing sheet");
        assert_eq!(report.sheets[0].sheet_name, "Results");
        assert!(!report.sheets[0].if_created);
    }

    #[test]
    fn open_existing_container_keeps_sheets_and_adds_target() {
        let dir = TestDir::new();
        let path_out = dir.path().join("book.xlsx");

        let mut writer = XlsxQueryWriter::new(path_out.clone(), SpecXlsxSinkOptions::default());
        writer
            .write_query(
                &query_measurements(),
                SpecXlsxSheetWriteOptions {
                    target_sheet: Some("First".to_string()),
                    ..Default::default()
                },
            )
            .expect("write first");
        writer.close().expect("close first");

        let mut writer = XlsxQueryWriter::from_options(
            dir.path().join("unused.xlsx"),
            SpecXlsxSinkOptions {
                target_container: Some(path_out.clone()),
                ..Default::default()
            },
        )
        .expect("open container");
        assert_eq!(writer.sheet_names(), &["First".to_string()]);
        assert_eq!(writer.file_out(), path_out.to_string_lossy());

        let mut row = BTreeMap::new();
        row.insert("total".to_string(), EnumCellValue::Number(2.5));
        let query = SpecQueryResult {
            query: "select total".to_string(),
            columns: vec!["total".to_string()],
            rows: vec![row],
        };
        writer
            .write_query(
                &query,
                SpecXlsxSheetWriteOptions {
                    target_sheet: Some("Second".to_string()),
                    ..Default::default()
                },
            )
            .expect("write second");
        writer.close().expect("close second");

        let range_first = read_sheet(&path_out, "First");
        assert_eq!(cell(&range_first, 2, 1), Some(Data::String("y".to_string())));
        let range_second = read_sheet(&path_out, "Second");
        assert_eq!(
            cell(&range_second, 0, 0),
            Some(Data::String("total".to_string()))
        );
        assert_eq!(cell(&range_second, 1, 0), Some(Data::Float(2.5)));
    }

    #[test]
    fn default_target_on_opened_container_overlays_first_sheet() {
        let dir = TestDir::new();
        let path_out = dir.path().join("book.xlsx");

        let mut writer = XlsxQueryWriter::new(path_out.clone(), SpecXlsxSinkOptions::default());
        writer
            .write_query(&query_measurements(), SpecXlsxSheetWriteOptions::default())
            .expect("write");
        writer.close().expect("close");

        let mut writer =
            XlsxQueryWriter::open(path_out.clone(), SpecXlsxSinkOptions::default()).expect("open");
        let query = SpecQueryResult {
            query: "select name".to_string(),
            columns: vec!["name".to_string()],
            rows: vec![],
        };
        let report = writer
            .write_query(&query, SpecXlsxSheetWriteOptions::default())
            .expect("overlay");
        writer.close().expect("close");

        assert_eq!(report.sheets[0].sheet_name, "Sheet1");
        assert_eq!(report.sheets[0].range_data.to_string(), "A1:A1");
        let range = read_sheet(&path_out, "Sheet1");
        assert_eq!(cell(&range, 0, 0), Some(Data::String("name".to_string())));
        assert_eq!(
            cell(&range, 0, 1),
            Some(Data::String("measurement".to_string()))
        );
    }

    #[test]
    fn post_processing_hook_receives_context_and_failures_only_warn() {
        let dir = TestDir::new();
        let path_out = dir.path().join("hook.xlsx");
        let mut writer = XlsxQueryWriter::new(path_out.clone(), SpecXlsxSinkOptions::default());

        let l_seen = Rc::new(RefCell::new(Vec::new()));
        let l_seen_hook = Rc::clone(&l_seen);
        let report = writer
            .write_query(
                &query_measurements(),
                SpecXlsxSheetWriteOptions {
                    target_sheet: Some("Data".to_string()),
                    post_processing_hook: Some(hook(move |ctx| {
                        l_seen_hook.borrow_mut().push(format!(
                            "{}|{}|{}",
                            ctx.query.query, ctx.sheet_name, ctx.range_data
                        ));
                        let n_row = ctx.range_data.row_last as u32;
                        ctx.workbook
                            .worksheet_from_name(ctx.sheet_name)
                            .map_err(|err| err.to_string())?
                            .write_string(n_row, 0, "total")
                            .map_err(|err| err.to_string())?;
                        Ok(())
                    })),
                    ..Default::default()
                },
            )
            .expect("write with hook");
        assert!(report.warnings.is_empty());
        assert_eq!(
            l_seen.borrow().as_slice(),
            &["select id, measurement from samples|Data|A1:B3".to_string()]
        );

        let report = writer
            .write_query(
                &query_measurements(),
                SpecXlsxSheetWriteOptions {
                    target_sheet: Some("Other".to_string()),
                    post_processing_hook: Some(hook(|_| Err("boom".to_string()))),
                    ..Default::default()
                },
            )
            .expect("hook failure must not fail the write");
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("boom"));
        assert_eq!(report.sheets[0].sheet_name, "Other");

        writer.close().expect("close");
        let range = read_sheet(&path_out, "Data");
        assert_eq!(cell(&range, 3, 0), Some(Data::String("total".to_string())));
    }

    #[test]
    fn missing_row_values_are_blank_and_reported() {
        let dir = TestDir::new();
        let path_out = dir.path().join("missing.xlsx");
        let mut writer = XlsxQueryWriter::new(
            path_out.clone(),
            SpecXlsxSinkOptions {
                if_keep_missing_values: true,
                ..Default::default()
            },
        );

        let mut query = query_measurements();
        query.rows[1].remove("measurement");
        let report = writer
            .write_query(&query, SpecXlsxSheetWriteOptions::default())
            .expect("write");
        writer.close().expect("close");

        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("\"measurement\""));
        let range = read_sheet(&path_out, "Sheet1");
        assert_eq!(cell(&range, 2, 1), Some(Data::String("NA".to_string())));
    }

    #[test]
    fn write_after_close_is_rejected() {
        let dir = TestDir::new();
        let mut writer =
            XlsxQueryWriter::new(dir.path().join("out.xlsx"), SpecXlsxSinkOptions::default());
        writer.close().expect("close");
        writer.close().expect("close is idempotent");

        let err = writer
            .write_query(&query_measurements(), SpecXlsxSheetWriteOptions::default())
            .expect_err("closed writer");
        assert!(matches!(err, XlsxWriteError::Closed));
    }

    #[test]
    fn write_dataframe_goes_through_query_path() {
        let dir = TestDir::new();
        let path_out = dir.path().join("df.xlsx");
        let mut writer = XlsxQueryWriter::new(path_out.clone(), SpecXlsxSinkOptions::default());
        let df = polars::df!(
            "id" => [1i64, 2, 3],
            "flag" => [true, false, true]
        )
        .expect("dataframe");

        let report = writer
            .write_dataframe("frame", &df, SpecXlsxSheetWriteOptions::default())
            .expect("write");
        writer.close().expect("close");

        assert_eq!(report.sheets[0].range_data.to_string(), "A1:B4");
        let range = read_sheet(&path_out, "Sheet1");
        assert_eq!(cell(&range, 3, 1), Some(Data::Bool(true)));
    }

    fn read_zip_part(path: &Path, c_part: &str) -> String {
        let file = std::fs::File::open(path).expect("open xlsx");
        let mut archive = zip::ZipArchive::new(file).expect("xlsx is a zip archive");
        let mut c_xml = String::new();
        archive
            .by_name(c_part)
            .expect("xlsx part")
            .read_to_string(&mut c_xml)
            .expect("read xlsx part");
        c_xml
    }

    fn section<'a>(c_xml: &'a str, c_open: &str, c_close: &str) -> &'a str {
        let Some(n_start) = c_xml.find(c_open) else {
            return "";
        };
        let n_end = c_xml[n_start..]
            .find(c_close)
            .map_or(c_xml.len(), |n_end| n_start + n_end);
        &c_xml[n_start..n_end]
    }

    fn attr_values(c_xml: &str, c_attr: &str) -> Vec<String> {
        let c_key = format!(" {c_attr}=\"");
        c_xml
            .match_indices(&c_key)
            .filter_map(|(n_idx, _)| {
                let c_rest = &c_xml[n_idx + c_key.len()..];
                c_rest.find('"').map(|n_end| c_rest[..n_end].to_string())
            })
            .collect()
    }

    fn cell_style(c_sheet_xml: &str, c_ref: &str) -> usize {
        let c_key = format!("<c r=\"{c_ref}\"");
        let n_start = c_sheet_xml.find(&c_key).expect("cell present");
        let c_tag = &c_sheet_xml[n_start..];
        let c_tag = &c_tag[..c_tag.find('>').expect("cell tag end")];
        attr_values(c_tag, "s")
            .first()
            .map_or(0, |c_idx| c_idx.parse().expect("style index"))
    }

    fn style_is_bold(c_styles_xml: &str, n_xf: usize) -> bool {
        let c_xf = section(c_styles_xml, "<cellXfs", "</cellXfs>")
            .split("<xf ")
            .nth(n_xf + 1)
            .expect("cell xf");
        let n_font: usize = attr_values(&format!(" {c_xf}"), "fontId")
            .first()
            .map_or(0, |c_idx| c_idx.parse().expect("font index"));
        section(c_styles_xml, "<fonts", "</fonts>")
            .split("</font>")
            .nth(n_font)
            .expect("font")
            .contains("<b/>")
    }

    fn column_widths(c_sheet_xml: &str) -> Vec<f64> {
        attr_values(section(c_sheet_xml, "<cols>", "</cols>"), "width")
            .iter()
            .map(|c_width| c_width.parse().expect("column width"))
            .collect()
    }

    #[test]
    fn sheet_names_match_case_insensitively_beyond_ascii() {
        let dir = TestDir::new();
        let path_out = dir.path().join("unicode.xlsx");
        let mut writer = XlsxQueryWriter::new(path_out.clone(), SpecXlsxSinkOptions::default());

        writer
            .write_query(
                &query_measurements(),
                SpecXlsxSheetWriteOptions {
                    target_sheet: Some("Äpfel".to_string()),
                    ..Default::default()
                },
            )
            .expect("write first");
        let report = writer
            .write_query(
                &query_measurements(),
                SpecXlsxSheetWriteOptions {
                    target_sheet: Some("äpfel".to_string()),
                    rule_sheet_missing: EnumSheetMissingRule::Error,
                    ..Default::default()
                },
            )
            .expect("lowercase name resolves to the existing sheet");

        assert_eq!(report.sheets[0].sheet_name, "Äpfel");
        assert!(!report.sheets[0].if_created);
        assert_eq!(writer.sheet_names(), &["Äpfel".to_string()]);
        writer.close().expect("close");
    }

    #[test]
    fn sheets_added_by_hook_are_visible_to_later_writes() {
        let dir = TestDir::new();
        let path_out = dir.path().join("hook_sheets.xlsx");
        let mut writer = XlsxQueryWriter::new(path_out.clone(), SpecXlsxSinkOptions::default());

        writer
            .write_query(
                &query_measurements(),
                SpecXlsxSheetWriteOptions {
                    target_sheet: Some("Data".to_string()),
                    post_processing_hook: Some(hook(|ctx| {
                        ctx.workbook
                            .add_worksheet()
                            .set_name("Summary")
                            .map_err(|err| err.to_string())?;
                        Ok(())
                    })),
                    ..Default::default()
                },
            )
            .expect("write with hook");
        assert_eq!(
            writer.sheet_names(),
            &["Data".to_string(), "Summary".to_string()]
        );

        let report = writer
            .write_query(
                &query_measurements(),
                SpecXlsxSheetWriteOptions {
                    target_sheet: Some("Summary".to_string()),
                    rule_sheet_missing: EnumSheetMissingRule::Error,
                    ..Default::default()
                },
            )
            .expect("hook sheet is found");
        assert!(!report.sheets[0].if_created);

        let report = writer
            .write_query(
                &query_measurements(),
                SpecXlsxSheetWriteOptions {
                    target_sheet: Some("SUMMARY".to_string()),
                    ..Default::default()
                },
            )
            .expect("hook sheet is reused");
        assert_eq!(report.sheets[0].sheet_name, "Summary");
        assert!(!report.sheets[0].if_created);

        writer.close().expect("close");
        let range = read_sheet(&path_out, "Summary");
        assert_eq!(cell(&range, 0, 0), Some(Data::String("id".to_string())));
    }

    #[test]
    fn failed_write_leaves_no_new_sheet_behind() {
        let dir = TestDir::new();
        let path_out = dir.path().join("atomic.xlsx");
        let mut writer = XlsxQueryWriter::new(path_out.clone(), SpecXlsxSinkOptions::default());

        let mut row = BTreeMap::new();
        row.insert("note".to_string(), EnumCellValue::from("x".repeat(40_000)));
        let query_too_long = SpecQueryResult {
            query: "select note".to_string(),
            columns: vec!["note".to_string()],
            rows: vec![row],
        };
        let options_notes = || SpecXlsxSheetWriteOptions {
            target_sheet: Some("Notes".to_string()),
            ..Default::default()
        };

        let err = writer
            .write_query(&query_too_long, options_notes())
            .expect_err("over-long string must fail");
        assert!(matches!(err, XlsxWriteError::Xlsx(_)));
        assert!(writer.sheet_names().is_empty());
        assert!(writer.report().is_empty());

        let report = writer
            .write_query(&query_measurements(), options_notes())
            .expect("retry");
        assert!(report.sheets[0].if_created);
        assert_eq!(writer.sheet_names(), &["Notes".to_string()]);
        writer.close().expect("close");

        let range = read_sheet(&path_out, "Notes");
        assert_eq!(cell(&range, 0, 0), Some(Data::String("id".to_string())));
    }

    #[test]
    fn write_ipc_bytes_decodes_frame() {
        let dir = TestDir::new();
        let path_out = dir.path().join("ipc.xlsx");
        let mut writer = XlsxQueryWriter::new(path_out.clone(), SpecXlsxSinkOptions::default());

        let mut df = polars::df!(
            "name" => ["a", "b"],
            "score" => [1.5f64, 2.5]
        )
        .expect("dataframe");
        let mut v_ipc_df = Vec::new();
        IpcWriter::new(&mut v_ipc_df)
            .finish(&mut df)
            .expect("serialize ipc");

        let report = writer
            .write_ipc_bytes("frame", &v_ipc_df, SpecXlsxSheetWriteOptions::default())
            .expect("write ipc");
        assert_eq!(report.sheets[0].range_data.to_string(), "A1:B3");

        let err = writer
            .write_ipc_bytes("broken", b"not ipc", SpecXlsxSheetWriteOptions::default())
            .expect_err("garbage bytes");
        assert!(matches!(err, XlsxWriteError::InvalidInput(_)));

        writer.close().expect("close");
        let range = read_sheet(&path_out, "Sheet1");
        assert_eq!(cell(&range, 0, 1), Some(Data::String("score".to_string())));
        assert_eq!(cell(&range, 2, 0), Some(Data::String("b".to_string())));
        assert_eq!(cell(&range, 2, 1), Some(Data::Float(2.5)));
    }

    #[test]
    fn grid_wider_than_excel_is_rejected() {
        let dir = TestDir::new();
        let mut writer =
            XlsxQueryWriter::new(dir.path().join("wide.xlsx"), SpecXlsxSinkOptions::default());
        let query = SpecQueryResult {
            query: "select *".to_string(),
            columns: (0..=N_NCOLS_EXCEL_MAX).map(|idx| format!("c{idx}")).collect(),
            rows: vec![],
        };

        let err = writer
            .write_query(&query, SpecXlsxSheetWriteOptions::default())
            .expect_err("too wide");
        assert!(matches!(
            err,
            XlsxWriteError::SheetLimit {
                height: 1,
                width: 16_385
            }
        ));
        assert!(writer.sheet_names().is_empty());
    }

    #[test]
    fn non_finite_numbers_are_written_as_text() {
        let dir = TestDir::new();
        let path_out = dir.path().join("non_finite.xlsx");
        let mut writer = XlsxQueryWriter::new(path_out.clone(), SpecXlsxSinkOptions::default());
        let query = SpecQueryResult {
            query: "select v".to_string(),
            columns: vec!["v".to_string()],
            rows: [f64::NAN, f64::INFINITY, f64::NEG_INFINITY]
                .into_iter()
                .map(|val| BTreeMap::from([("v".to_string(), EnumCellValue::Number(val))]))
                .collect(),
        };

        writer
            .write_query(&query, SpecXlsxSheetWriteOptions::default())
            .expect("write");
        writer.close().expect("close");

        let range = read_sheet(&path_out, "Sheet1");
        assert_eq!(cell(&range, 1, 0), Some(Data::String("NaN".to_string())));
        assert_eq!(cell(&range, 2, 0), Some(Data::String("Inf".to_string())));
        assert_eq!(cell(&range, 3, 0), Some(Data::String("-Inf".to_string())));
    }

    #[test]
    fn header_row_gets_bold_format() {
        let dir = TestDir::new();
        let path_out = dir.path().join("header.xlsx");
        let mut writer = XlsxQueryWriter::new(path_out.clone(), SpecXlsxSinkOptions::default());
        writer
            .write_query(&query_measurements(), SpecXlsxSheetWriteOptions::default())
            .expect("write");
        writer.close().expect("close");

        let c_sheet_xml = read_zip_part(&path_out, "xl/worksheets/sheet1.xml");
        let c_styles_xml = read_zip_part(&path_out, "xl/styles.xml");
        assert!(style_is_bold(&c_styles_xml, cell_style(&c_sheet_xml, "A1")));
        assert!(style_is_bold(&c_styles_xml, cell_style(&c_sheet_xml, "B1")));
        assert!(!style_is_bold(&c_styles_xml, cell_style(&c_sheet_xml, "B2")));
        assert!(!style_is_bold(&c_styles_xml, cell_style(&c_sheet_xml, "A3")));
    }

    #[test]
    fn autofit_rules_and_freeze_flag_shape_the_sheet() {
        let dir = TestDir::new();
        let path_out = dir.path().join("autofit.xlsx");
        let mut writer = XlsxQueryWriter::new(path_out.clone(), SpecXlsxSinkOptions::default());
        let query = SpecQueryResult {
            query: "select a, b".to_string(),
            columns: vec!["a".to_string(), "b".to_string()],
            rows: vec![BTreeMap::from([
                ("a".to_string(), EnumCellValue::Integer(1)),
                ("b".to_string(), EnumCellValue::from("x".repeat(30))),
            ])],
        };

        for (c_sheet, rule_columns, if_freeze_header) in [
            ("NoFit", EnumAutofitColumnsRule::None, false),
            ("HeaderFit", EnumAutofitColumnsRule::Header, true),
            ("AllFit", EnumAutofitColumnsRule::All, true),
        ] {
            writer
                .write_query(
                    &query,
                    SpecXlsxSheetWriteOptions {
                        target_sheet: Some(c_sheet.to_string()),
                        if_freeze_header,
                        policy_autofit: SpecAutofitCellsPolicy {
                            rule_columns,
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                )
                .expect("write");
        }
        writer.close().expect("close");

        let c_xml_none = read_zip_part(&path_out, "xl/worksheets/sheet1.xml");
        assert!(column_widths(&c_xml_none).is_empty());
        assert!(!c_xml_none.contains("state=\"frozen\""));

        let c_xml_header = read_zip_part(&path_out, "xl/worksheets/sheet2.xml");
        let l_width_header = column_widths(&c_xml_header);
        assert!(!l_width_header.is_empty());
        assert!(l_width_header.windows(2).all(|pair| pair[0] == pair[1]));
        assert!(c_xml_header.contains("state=\"frozen\""));

        let c_xml_all = read_zip_part(&path_out, "xl/worksheets/sheet3.xml");
        let l_width_all = column_widths(&c_xml_all);
        assert_eq!(l_width_all.len(), 2);
        assert!(l_width_all[1] > l_width_all[0]);
        assert!(l_width_all[1] > l_width_header[0]);
    }

    #[test]
    fn estimate_width_len_counts_wide_chars() {
        assert_eq!(estimate_width_len(&EnumCellValue::None), 0);
        assert_eq!(estimate_width_len(&EnumCellValue::from("abc")), 3);
        assert_eq!(estimate_width_len(&EnumCellValue::Integer(12345)), 5);
        assert_eq!(estimate_width_len(&EnumCellValue::from("测试")), 3);
    }
}
