//! `querysheet_xlsx` v1:
//! Rust-side kernel that lays query results out as spreadsheet grids.
//!
//! Modules:
//! - `conf`     : constants and default presets
//! - `spec`     : specs/models/options/errors
//! - `util`     : pure helper functions (column naming, grid and range building)
//! - `writer`   : pure-Rust xlsx sink
//! - `registry` : output handler registration table
pub mod conf;
pub mod registry;
pub mod spec;
pub mod util;
pub mod writer;

#[cfg(test)]
mod testing;

pub use conf::{
    C_CELL_ORIGIN, C_SHEET_NAME_DEFAULT, C_SINK_TAG_XLSX, N_COLUMN_ALPHABET_SIZE,
    N_LEN_EXCEL_SHEET_NAME_MAX, N_NCOLS_EXCEL_MAX, N_NROWS_EXCEL_MAX, TUP_EXCEL_ILLEGAL,
};
pub use registry::{QueryOutputSink, SinkFactory, SinkRegistry, SinkRegistryError};
pub use spec::{
    EnumAutofitColumnsRule, EnumCellValue, EnumSheetMissingRule, PostProcessingHook, RangeError,
    RowMapping, SpecAutofitCellsPolicy, SpecCellFormat, SpecGrid, SpecPostProcessContext,
    SpecQueryResult, SpecRangeAddress, SpecSheetWrite, SpecXlsxFormatSet, SpecXlsxReport,
    SpecXlsxSheetWriteOptions, SpecXlsxSinkOptions, XlsxWriteError,
};
pub use util::{
    build_grid, column_index, column_name, compute_header_range, compute_range,
    derive_missing_cells, derive_query_result_from_dataframe, derive_range_address,
    sanitize_sheet_name,
};
pub use writer::{XlsxQueryWriter, estimate_width_len};
