//! Output handler registration table (type tag -> sink factory).

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::conf::C_SINK_TAG_XLSX;
use crate::spec::{
    SpecQueryResult, SpecXlsxReport, SpecXlsxSheetWriteOptions, SpecXlsxSinkOptions,
    XlsxWriteError,
};
use crate::writer::XlsxQueryWriter;

/// Anything that can receive query results and persist them.
pub trait QueryOutputSink {
    /// Write one query result.
    fn write_query(
        &mut self,
        query: &SpecQueryResult,
        options: SpecXlsxSheetWriteOptions,
    ) -> Result<SpecXlsxReport, XlsxWriteError>;

    /// Flush pending output. Must be idempotent.
    fn close(&mut self) -> Result<(), XlsxWriteError>;
}

impl QueryOutputSink for XlsxQueryWriter {
    fn write_query(
        &mut self,
        query: &SpecQueryResult,
        options: SpecXlsxSheetWriteOptions,
    ) -> Result<SpecXlsxReport, XlsxWriteError> {
        XlsxQueryWriter::write_query(self, query, options)
    }

    fn close(&mut self) -> Result<(), XlsxWriteError> {
        XlsxQueryWriter::close(self)
    }
}

/// Builds a sink bound to an output path.
pub type SinkFactory = Box<
    dyn Fn(&Path, SpecXlsxSinkOptions) -> Result<Box<dyn QueryOutputSink>, XlsxWriteError>,
>;

/// Registry lookup/creation failures.
#[derive(Debug)]
pub enum SinkRegistryError {
    /// No factory registered under the tag.
    UnknownTag(String),
    /// Factory failed to build the sink.
    Sink(XlsxWriteError),
}

impl fmt::Display for SinkRegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTag(tag) => write!(f, "No output sink registered for type {tag:?}"),
            Self::Sink(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SinkRegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::UnknownTag(_) => None,
            Self::Sink(err) => Some(err),
        }
    }
}

/// Explicit, caller-owned table of output sinks.
#[derive(Default)]
pub struct SinkRegistry {
    dict_factories: BTreeMap<String, SinkFactory>,
}

impl SinkRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `xlsx` sink.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            C_SINK_TAG_XLSX,
            Box::new(
                |path_file_out: &Path,
                 options: SpecXlsxSinkOptions|
                 -> Result<Box<dyn QueryOutputSink>, XlsxWriteError> {
                    let writer =
                        XlsxQueryWriter::from_options(path_file_out.to_path_buf(), options)?;
                    Ok(Box::new(writer))
                },
            ),
        );
        registry
    }

    /// Register `factory` under `tag`; returns `true` when an earlier factory was replaced.
    pub fn register(&mut self, tag: impl Into<String>, factory: SinkFactory) -> bool {
        self.dict_factories.insert(tag.into(), factory).is_some()
    }

    /// Registered tags in sorted order.
    pub fn tags(&self) -> Vec<&str> {
        self.dict_factories.keys().map(String::as_str).collect()
    }

    /// Build the sink registered under `tag`.
    pub fn create(
        &self,
        tag: &str,
        path_file_out: &Path,
        options: SpecXlsxSinkOptions,
    ) -> Result<Box<dyn QueryOutputSink>, SinkRegistryError> {
        let factory = self
            .dict_factories
            .get(tag)
            .ok_or_else(|| SinkRegistryError::UnknownTag(tag.to_string()))?;
        factory(path_file_out, options).map_err(SinkRegistryError::Sink)
    }
}

impl fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}
