//! Arrow IPC file helpers for data and staging files.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;

use crate::error::Result;

/// Write `batch` to `path` so readers never observe a partial file.
///
/// The batch is written to a sibling temporary file which is then renamed
/// over `path`, replacing any existing file.
pub(crate) fn write_atomic(path: &Path, batch: &RecordBatch) -> Result<u64> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    let written = write_file(&tmp, batch).and_then(|bytes| {
        std::fs::rename(&tmp, path)?;
        Ok(bytes)
    });
    if written.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    written
}

fn write_file(path: &Path, batch: &RecordBatch) -> Result<u64> {
    let file = File::create(path)?;
    let mut writer = FileWriter::try_new(BufWriter::new(file), batch.schema().as_ref())?;
    writer.write(batch)?;
    writer.finish()?;
    let mut inner = writer.into_inner()?;
    std::io::Write::flush(&mut inner)?;
    inner.get_ref().sync_all()?;
    Ok(inner.get_ref().metadata()?.len())
}

/// Read every batch in an IPC file and concatenate them into one.
pub(crate) fn read_file(path: &Path, schema: Option<SchemaRef>) -> Result<RecordBatch> {
    let reader = FileReader::try_new(File::open(path)?, None)?;
    let schema = schema.unwrap_or_else(|| reader.schema());
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(concat_batches(&schema, &batches)?)
}
