//! Sheet constants and default preset factories.

use std::collections::BTreeMap;

use crate::spec::SpecCellFormat;

/// Excel worksheet maximum row count.
pub const N_NROWS_EXCEL_MAX: usize = 1_048_576;
/// Excel worksheet maximum column count.
pub const N_NCOLS_EXCEL_MAX: usize = 16_384;
/// Excel sheet name maximum length.
pub const N_LEN_EXCEL_SHEET_NAME_MAX: usize = 31;
/// Characters not allowed in sheet names.
pub const TUP_EXCEL_ILLEGAL: [&str; 7] = ["*", ":", "?", "/", "\\", "[", "]"];

/// Number of letters in the column alphabet (`A`..=`Z`).
pub const N_COLUMN_ALPHABET_SIZE: i64 = 26;
/// Top-left cell every grid is anchored at.
pub const C_CELL_ORIGIN: &str = "A1";
/// Sheet name used when an empty workbook needs its first sheet.
pub const C_SHEET_NAME_DEFAULT: &str = "Sheet1";
/// Type tag of the built-in xlsx sink in [`crate::registry::SinkRegistry`].
pub const C_SINK_TAG_XLSX: &str = "xlsx";

/// Build default named format presets used by [`crate::writer::XlsxQueryWriter`].
///
/// Keys: `text`, `integer`, `decimal`, `boolean`, `header`.
pub fn derive_default_xlsx_formats() -> BTreeMap<String, SpecCellFormat> {
    let cfg_base_fmt_spec = SpecCellFormat {
        font_name: Some("Calibri".to_string()),
        font_size: Some(11),
        valign: Some("vcenter".to_string()),
        ..Default::default()
    };

    let mut dict_fmt = BTreeMap::new();
    dict_fmt.insert("text".to_string(), cfg_base_fmt_spec.clone());
    dict_fmt.insert("boolean".to_string(), cfg_base_fmt_spec.clone());
    dict_fmt.insert(
        "header".to_string(),
        cfg_base_fmt_spec.with_(SpecCellFormat {
            bold: Some(true),
            ..Default::default()
        }),
    );
    dict_fmt.insert(
        "integer".to_string(),
        cfg_base_fmt_spec.with_(SpecCellFormat {
            num_format: Some("0".to_string()),
            ..Default::default()
        }),
    );
    dict_fmt.insert(
        "decimal".to_string(),
        cfg_base_fmt_spec.with_(SpecCellFormat {
            num_format: Some("General".to_string()),
            ..Default::default()
        }),
    );

    dict_fmt
}
