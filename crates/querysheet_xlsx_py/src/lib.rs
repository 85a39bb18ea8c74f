use std::path::PathBuf;

use pyo3::IntoPyObjectExt;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyAny, PyBool, PyBytes, PyDict, PyFloat, PyInt, PyList, PyString, PyTuple};
use querysheet_xlsx::spec::{
    EnumAutofitColumnsRule, EnumCellValue, EnumSheetMissingRule, PostProcessingHook, RangeError,
    RowMapping, SpecAutofitCellsPolicy, SpecCellFormat, SpecPostProcessContext, SpecQueryResult,
    SpecSheetWrite, SpecXlsxReport, SpecXlsxSheetWriteOptions, SpecXlsxSinkOptions,
    XlsxWriteError,
};
use querysheet_xlsx::util::{
    build_grid as rs_build_grid, column_index as rs_column_index, column_name as rs_column_name,
    compute_header_range as rs_compute_header_range,
    derive_range_address as rs_derive_range_address,
};
use querysheet_xlsx::writer::XlsxQueryWriter as RsXlsxQueryWriter;

const N_BRIDGE_ABI_VERSION: u64 = 1;
const C_BRIDGE_CONTRACT_VERSION: &str = "querysheet.xlsx.writer.v1";
const C_BRIDGE_TRANSPORT: &str = "polars_ipc";

#[pyclass(name = "XlsxQueryWriter")]
struct PyXlsxQueryWriter {
    #[pyo3(get)]
    file_out: String,
    inner: RsXlsxQueryWriter,
}

#[pymethods]
impl PyXlsxQueryWriter {
    #[new]
    #[pyo3(signature = (
        file_out,
        target_container = None,
        fmt_text = None,
        fmt_integer = None,
        fmt_decimal = None,
        fmt_boolean = None,
        fmt_header = None,
        if_keep_missing_values = false,
        missing_value_str = None
    ))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        file_out: String,
        target_container: Option<String>,
        fmt_text: Option<&Bound<'_, PyAny>>,
        fmt_integer: Option<&Bound<'_, PyAny>>,
        fmt_decimal: Option<&Bound<'_, PyAny>>,
        fmt_boolean: Option<&Bound<'_, PyAny>>,
        fmt_header: Option<&Bound<'_, PyAny>>,
        if_keep_missing_values: bool,
        missing_value_str: Option<String>,
    ) -> PyResult<Self> {
        let mut cfg_options = SpecXlsxSinkOptions {
            target_container: target_container.map(PathBuf::from),
            if_keep_missing_values,
            ..Default::default()
        };
        if let Some(c_value) = missing_value_str {
            cfg_options.missing_value_str = c_value;
        }

        let formats = &mut cfg_options.formats;
        for (fmt_slot, fmt_obj) in [
            (&mut formats.fmt_text, fmt_text),
            (&mut formats.fmt_integer, fmt_integer),
            (&mut formats.fmt_decimal, fmt_decimal),
            (&mut formats.fmt_boolean, fmt_boolean),
            (&mut formats.fmt_header, fmt_header),
        ] {
            if let Some(fmt_patch) = parse_spec_cell_format(fmt_obj)? {
                *fmt_slot = fmt_slot.with_(fmt_patch);
            }
        }

        let inner = RsXlsxQueryWriter::from_options(PathBuf::from(&file_out), cfg_options)
            .map_err(convert_write_error)?;
        let file_out = inner.file_out();

        Ok(Self { file_out, inner })
    }

    fn __enter__(slf: PyRefMut<'_, Self>) -> PyRefMut<'_, Self> {
        slf
    }

    #[pyo3(signature = (_exc_type=None, _exc=None, _tb=None))]
    fn __exit__(
        &mut self,
        _exc_type: Option<&Bound<'_, PyAny>>,
        _exc: Option<&Bound<'_, PyAny>>,
        _tb: Option<&Bound<'_, PyAny>>,
    ) -> PyResult<()> {
        self.close()
    }

    fn close(&mut self) -> PyResult<()> {
        self.inner.close().map_err(convert_write_error)
    }

    fn sheet_names(&self) -> Vec<String> {
        self.inner.sheet_names().to_vec()
    }

    fn report(&self, py: Python<'_>) -> PyResult<Py<PyAny>> {
        let l_report_obj = self
            .inner
            .report()
            .iter()
            .map(|report| create_report_object(py, report))
            .collect::<PyResult<Vec<_>>>()?;

        let tup_report = PyTuple::new(py, l_report_obj)?;
        Ok(tup_report.into_any().unbind())
    }

    #[pyo3(signature = (
        columns,
        rows,
        query = "",
        target_sheet = None,
        sheet_missing = "create",
        if_freeze_header = true,
        policy_autofit = None,
        post_processing_hook = None
    ))]
    #[allow(clippy::too_many_arguments)]
    fn write_query(
        &mut self,
        py: Python<'_>,
        columns: Vec<String>,
        rows: &Bound<'_, PyAny>,
        query: &str,
        target_sheet: Option<String>,
        sheet_missing: &str,
        if_freeze_header: bool,
        policy_autofit: Option<&Bound<'_, PyAny>>,
        post_processing_hook: Option<&Bound<'_, PyAny>>,
    ) -> PyResult<Py<PyAny>> {
        let query_result = SpecQueryResult {
            query: query.to_string(),
            columns,
            rows: derive_rows_from_any(rows)?,
        };
        let cfg_sheet_write_options = derive_sheet_write_options(
            target_sheet,
            sheet_missing,
            if_freeze_header,
            policy_autofit,
            post_processing_hook,
        )?;

        let report = self
            .inner
            .write_query(&query_result, cfg_sheet_write_options)
            .map_err(convert_write_error)?;
        emit_python_warnings(py, &report)?;
        create_report_object(py, &report)
    }

    #[pyo3(signature = (
        ipc_bytes,
        query = "",
        target_sheet = None,
        sheet_missing = "create",
        if_freeze_header = true,
        policy_autofit = None,
        post_processing_hook = None
    ))]
    #[allow(clippy::too_many_arguments)]
    fn write_query_ipc(
        &mut self,
        py: Python<'_>,
        ipc_bytes: &Bound<'_, PyBytes>,
        query: &str,
        target_sheet: Option<String>,
        sheet_missing: &str,
        if_freeze_header: bool,
        policy_autofit: Option<&Bound<'_, PyAny>>,
        post_processing_hook: Option<&Bound<'_, PyAny>>,
    ) -> PyResult<Py<PyAny>> {
        let cfg_sheet_write_options = derive_sheet_write_options(
            target_sheet,
            sheet_missing,
            if_freeze_header,
            policy_autofit,
            post_processing_hook,
        )?;

        let report = self
            .inner
            .write_ipc_bytes(query, ipc_bytes.as_bytes(), cfg_sheet_write_options)
            .map_err(convert_write_error)?;
        emit_python_warnings(py, &report)?;
        create_report_object(py, &report)
    }
}

#[pyfunction]
fn column_name(n: i64) -> Option<String> {
    rs_column_name(n)
}

#[pyfunction]
fn column_index(label: &str) -> Option<i64> {
    rs_column_index(label)
}

#[pyfunction]
fn build_grid(py: Python<'_>, columns: Vec<String>, rows: &Bound<'_, PyAny>) -> PyResult<Py<PyAny>> {
    let l_rows = derive_rows_from_any(rows)?;
    let grid = rs_build_grid(&columns, &l_rows);

    let mut l_row_obj = Vec::with_capacity(grid.height());
    for row in grid.rows() {
        let l_cell_obj = row
            .iter()
            .map(|value| convert_cell_value_to_py(py, value))
            .collect::<PyResult<Vec<_>>>()?;
        l_row_obj.push(PyList::new(py, l_cell_obj)?);
    }

    Ok(PyList::new(py, l_row_obj)?.into_any().unbind())
}

#[pyfunction]
#[pyo3(signature = (columns, n_rows = 0))]
fn compute_range(columns: Vec<String>, n_rows: usize) -> PyResult<String> {
    let n_height = n_rows
        .checked_add(1)
        .ok_or_else(|| PyValueError::new_err(format!("n_rows is too large: {n_rows}")))?;
    rs_derive_range_address(columns.len(), n_height)
        .map(|range| range.to_string())
        .map_err(convert_range_error)
}

#[pyfunction]
fn compute_header_range(columns: Vec<String>) -> PyResult<String> {
    let grid = rs_build_grid(&columns, &[]);
    rs_compute_header_range(&grid)
        .map(|range| range.to_string())
        .map_err(convert_range_error)
}

fn derive_sheet_write_options(
    target_sheet: Option<String>,
    sheet_missing: &str,
    if_freeze_header: bool,
    policy_autofit: Option<&Bound<'_, PyAny>>,
    post_processing_hook: Option<&Bound<'_, PyAny>>,
) -> PyResult<SpecXlsxSheetWriteOptions> {
    Ok(SpecXlsxSheetWriteOptions {
        target_sheet,
        rule_sheet_missing: parse_rule_sheet_missing(sheet_missing)?,
        if_freeze_header,
        policy_autofit: parse_spec_autofit_cells_policy(policy_autofit)?.unwrap_or_default(),
        post_processing_hook: post_processing_hook
            .filter(|obj| !obj.is_none())
            .map(|obj| derive_python_hook(obj.clone().unbind())),
    })
}

/// Wrap a Python callable as a post-processing hook.
///
/// The callable is checked when the hook runs, so a non-callable object ends
/// up as a report warning like any other hook failure.
fn derive_python_hook(obj_hook: Py<PyAny>) -> PostProcessingHook {
    Box::new(move |ctx: &mut SpecPostProcessContext<'_>| {
        Python::with_gil(|py| {
            let hook = obj_hook.bind(py);
            if !hook.is_callable() {
                return Err(format!(
                    "post_processing_hook is not callable: {}",
                    hook.get_type()
                        .name()
                        .map(|name| name.to_string())
                        .unwrap_or_else(|_| "<unknown>".to_string())
                ));
            }
            call_python_hook(py, hook, ctx).map_err(|err| err.to_string())
        })
    })
}

fn call_python_hook(
    py: Python<'_>,
    hook: &Bound<'_, PyAny>,
    ctx: &SpecPostProcessContext<'_>,
) -> PyResult<()> {
    let dict_ctx = PyDict::new(py);
    dict_ctx.set_item("query", ctx.query.query.as_str())?;
    dict_ctx.set_item("columns", ctx.query.columns.clone())?;
    dict_ctx.set_item("container", ctx.path_container.to_string_lossy().to_string())?;
    dict_ctx.set_item("sheet", ctx.sheet_name)?;
    dict_ctx.set_item("range", ctx.range_data.to_string())?;
    hook.call1((dict_ctx,))?;
    Ok(())
}

fn emit_python_warnings(py: Python<'_>, report: &SpecXlsxReport) -> PyResult<()> {
    if report.warnings.is_empty() {
        return Ok(());
    }
    let module_warnings = py.import("warnings")?;
    for c_msg in &report.warnings {
        module_warnings.call_method1("warn", (c_msg.as_str(),))?;
    }
    Ok(())
}

fn create_report_object(py: Python<'_>, report: &SpecXlsxReport) -> PyResult<Py<PyAny>> {
    let l_sheet_obj = report
        .sheets
        .iter()
        .map(|sheet| create_sheet_write_object(py, sheet))
        .collect::<PyResult<Vec<_>>>()?;

    let dict_report = PyDict::new(py);
    dict_report.set_item("sheets", PyList::new(py, l_sheet_obj)?)?;
    dict_report.set_item("warnings", report.warnings.clone())?;
    Ok(dict_report.into_any().unbind())
}

fn create_sheet_write_object<'py>(
    py: Python<'py>,
    sheet: &SpecSheetWrite,
) -> PyResult<Bound<'py, PyDict>> {
    let dict_sheet = PyDict::new(py);
    dict_sheet.set_item("sheet_name", sheet.sheet_name.as_str())?;
    dict_sheet.set_item("range_data", sheet.range_data.to_string())?;
    dict_sheet.set_item("range_header", sheet.range_header.to_string())?;
    dict_sheet.set_item("if_created", sheet.if_created)?;
    Ok(dict_sheet)
}

/// Read `rows` as an iterable of dicts.
///
/// Rows that are not dicts and values of unsupported types become blank cells.
fn derive_rows_from_any(rows: &Bound<'_, PyAny>) -> PyResult<Vec<RowMapping>> {
    let mut l_rows = Vec::new();
    for (n_idx_row, res_row) in rows.try_iter()?.enumerate() {
        let row = res_row?;
        let Ok(dict_row) = row.downcast::<PyDict>() else {
            log::warn!(
                "Row {n_idx_row} is not a dict ({}); writing blank cells.",
                row.get_type().name()?
            );
            l_rows.push(RowMapping::new());
            continue;
        };

        let mut dict_cells = RowMapping::new();
        for (key, value) in dict_row.iter() {
            let Ok(c_key) = key.extract::<String>() else {
                log::warn!("Row {n_idx_row} has a non-string key {key}; ignored.");
                continue;
            };
            let value_cell = match convert_py_to_cell_value(&value)? {
                Some(value_cell) => value_cell,
                None => {
                    log::warn!(
                        "Row {n_idx_row} column {c_key:?} holds unsupported type {}; writing blank.",
                        value.get_type().name()?
                    );
                    EnumCellValue::None
                }
            };
            dict_cells.insert(c_key, value_cell);
        }
        l_rows.push(dict_cells);
    }
    Ok(l_rows)
}

/// Map a Python scalar to a cell value; `None` for unsupported types.
fn convert_py_to_cell_value(value: &Bound<'_, PyAny>) -> PyResult<Option<EnumCellValue>> {
    if value.is_none() {
        return Ok(Some(EnumCellValue::None));
    }
    // bool is a subclass of int.
    if let Ok(value_bool) = value.downcast::<PyBool>() {
        return Ok(Some(EnumCellValue::Boolean(value_bool.is_true())));
    }
    if value.is_instance_of::<PyInt>() {
        return Ok(match value.extract::<i64>() {
            Ok(n_value) => Some(EnumCellValue::Integer(n_value)),
            Err(_) => Some(EnumCellValue::Number(value.extract::<f64>()?)),
        });
    }
    if value.is_instance_of::<PyFloat>() {
        return Ok(Some(EnumCellValue::Number(value.extract::<f64>()?)));
    }
    if value.is_instance_of::<PyString>() {
        return Ok(Some(EnumCellValue::String(value.extract::<String>()?)));
    }
    Ok(None)
}

fn convert_cell_value_to_py(py: Python<'_>, value: &EnumCellValue) -> PyResult<Py<PyAny>> {
    match value {
        EnumCellValue::None => Ok(py.None()),
        EnumCellValue::String(c_value) => c_value.as_str().into_py_any(py),
        EnumCellValue::Integer(n_value) => n_value.into_py_any(py),
        EnumCellValue::Number(f_value) => f_value.into_py_any(py),
        EnumCellValue::Boolean(if_value) => if_value.into_py_any(py),
    }
}

fn parse_rule_sheet_missing(value: &str) -> PyResult<EnumSheetMissingRule> {
    match value {
        "create" => Ok(EnumSheetMissingRule::Create),
        "error" => Ok(EnumSheetMissingRule::Error),
        _ => Err(PyValueError::new_err(
            "sheet_missing must be one of: 'create', 'error'.",
        )),
    }
}

fn parse_rule_autofit_columns(value: &str) -> PyResult<EnumAutofitColumnsRule> {
    match value {
        "none" => Ok(EnumAutofitColumnsRule::None),
        "header" => Ok(EnumAutofitColumnsRule::Header),
        "all" => Ok(EnumAutofitColumnsRule::All),
        _ => Err(PyValueError::new_err(
            "policy_autofit.rule_columns must be one of: 'none', 'header', 'all'.",
        )),
    }
}

fn parse_spec_autofit_cells_policy(
    obj: Option<&Bound<'_, PyAny>>,
) -> PyResult<Option<SpecAutofitCellsPolicy>> {
    let Some(obj) = obj else {
        return Ok(None);
    };
    if obj.is_none() {
        return Ok(None);
    }

    let mut policy = SpecAutofitCellsPolicy::default();

    if let Some(v) = extract_optional_attr::<String>(obj, "rule_columns")? {
        policy.rule_columns = parse_rule_autofit_columns(&v)?;
    }
    if obj.hasattr("height_body_inferred_max")? {
        policy.height_body_inferred_max = obj
            .getattr("height_body_inferred_max")?
            .extract::<Option<usize>>()?;
    }
    if let Some(v) = extract_optional_attr::<usize>(obj, "width_cell_min")? {
        policy.width_cell_min = v;
    }
    if let Some(v) = extract_optional_attr::<usize>(obj, "width_cell_max")? {
        policy.width_cell_max = v;
    }
    if let Some(v) = extract_optional_attr::<usize>(obj, "width_cell_padding")? {
        policy.width_cell_padding = v;
    }

    Ok(Some(policy))
}

fn parse_spec_cell_format(obj: Option<&Bound<'_, PyAny>>) -> PyResult<Option<SpecCellFormat>> {
    let Some(obj) = obj else {
        return Ok(None);
    };
    if obj.is_none() {
        return Ok(None);
    }

    Ok(Some(SpecCellFormat {
        font_name: extract_optional_attr::<String>(obj, "font_name")?,
        font_size: extract_optional_attr::<i64>(obj, "font_size")?,
        bold: extract_optional_attr::<bool>(obj, "bold")?,
        italic: extract_optional_attr::<bool>(obj, "italic")?,
        align: extract_optional_attr::<String>(obj, "align")?,
        valign: extract_optional_attr::<String>(obj, "valign")?,
        text_wrap: extract_optional_attr::<bool>(obj, "text_wrap")?,
        num_format: extract_optional_attr::<String>(obj, "num_format")?,
        bg_color: extract_optional_attr::<String>(obj, "bg_color")?,
        font_color: extract_optional_attr::<String>(obj, "font_color")?,
    }))
}

fn extract_optional_attr<T>(obj: &Bound<'_, PyAny>, attr: &str) -> PyResult<Option<T>>
where
    for<'a> T: FromPyObject<'a>,
{
    if !obj.hasattr(attr)? {
        return Ok(None);
    }
    let val = obj.getattr(attr)?;
    if val.is_none() {
        return Ok(None);
    }
    Ok(Some(val.extract::<T>()?))
}

fn convert_range_error(err: RangeError) -> PyErr {
    PyValueError::new_err(err.to_string())
}

fn convert_write_error(err: XlsxWriteError) -> PyErr {
    match err {
        XlsxWriteError::Range(_)
        | XlsxWriteError::SheetMissing(_)
        | XlsxWriteError::SheetLimit { .. }
        | XlsxWriteError::InvalidInput(_) => PyValueError::new_err(err.to_string()),
        XlsxWriteError::ContainerOpen { .. } | XlsxWriteError::Closed | XlsxWriteError::Xlsx(_) => {
            PyRuntimeError::new_err(err.to_string())
        }
    }
}

#[pymodule]
fn _querysheet_xlsx_rs(_py: Python<'_>, module: &Bound<'_, PyModule>) -> PyResult<()> {
    module.add_class::<PyXlsxQueryWriter>()?;
    module.add_function(wrap_pyfunction!(column_name, module)?)?;
    module.add_function(wrap_pyfunction!(column_index, module)?)?;
    module.add_function(wrap_pyfunction!(build_grid, module)?)?;
    module.add_function(wrap_pyfunction!(compute_range, module)?)?;
    module.add_function(wrap_pyfunction!(compute_header_range, module)?)?;
    module.add("__bridge_abi__", N_BRIDGE_ABI_VERSION)?;
    module.add("__bridge_contract__", C_BRIDGE_CONTRACT_VERSION)?;
    module.add("__bridge_transport__", C_BRIDGE_TRANSPORT)?;
    Ok(())
}
