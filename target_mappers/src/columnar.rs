//! Columnar (Parquet) encoding for the object-store sink.
//!
//! The arrow schema is inferred from the first record carrying a
//! `new_image` (falling back to the first `old_image`), with a
//! synthetic non-null `operation_type` column appended. Delete-like
//! records contribute their `old_image` cells; everything else its
//! `new_image`. Columns absent from a record are null.

use crate::error::MapperError;
use arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Date32Builder, Float32Builder, Float64Builder,
    Int32Builder, Int64Builder, StringBuilder, TimestampMillisecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use data_types::{CellValue, DecodedRecord, DecodedRow};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::sync::Arc;

/// The synthetic column carrying each record's operation.
pub const OPERATION_TYPE_COLUMN: &str = "operation_type";

/// Serializes the batch into an in-memory Parquet file.
pub fn records_to_parquet(records: &[DecodedRecord]) -> Result<Vec<u8>, MapperError> {
    let template = schema_template(records)?;

    let mut fields = Vec::with_capacity(template.len() + 1);
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(template.len() + 1);
    for (name, sample) in &template {
        fields.push(Field::new(name, arrow_type(sample), true));
        columns.push(build_column(name, sample, records)?);
    }
    fields.push(Field::new(OPERATION_TYPE_COLUMN, DataType::Utf8, false));
    columns.push(operation_column(records));

    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(Arc::clone(&schema), columns)
        .map_err(|e| MapperError::fatal(format!("failed to assemble record batch: {e}")))?;

    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build();
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(props))
        .map_err(|e| MapperError::fatal(format!("failed to open parquet writer: {e}")))?;
    writer
        .write(&batch)
        .map_err(|e| MapperError::fatal(format!("failed to write parquet: {e}")))?;
    writer
        .close()
        .map_err(|e| MapperError::fatal(format!("failed to close parquet writer: {e}")))?;
    Ok(buffer)
}

/// The (column, sample value) pairs the schema derives from.
fn schema_template(
    records: &[DecodedRecord],
) -> Result<Vec<(String, CellValue)>, MapperError> {
    let image = records
        .iter()
        .find_map(|r| r.new_image.as_ref())
        .or_else(|| records.iter().find_map(|r| r.old_image.as_ref()))
        .ok_or_else(|| MapperError::fatal("no record carries an image to derive a schema from"))?;
    Ok(image
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect())
}

fn arrow_type(sample: &CellValue) -> DataType {
    match sample {
        CellValue::Text(_) => DataType::Utf8,
        CellValue::Date(_) => DataType::Date32,
        CellValue::Int(_) => DataType::Int32,
        CellValue::BigInt(_) => DataType::Int64,
        CellValue::Float(_) => DataType::Float32,
        CellValue::Double(_) => DataType::Float64,
        // Preserved exactly rather than squeezed into a fixed scale.
        CellValue::Decimal(_) => DataType::Utf8,
        CellValue::Boolean(_) => DataType::Boolean,
        CellValue::Timestamp(_) => DataType::Timestamp(TimeUnit::Millisecond, None),
        CellValue::Blob(_) => DataType::Binary,
    }
}

fn record_image(record: &DecodedRecord) -> Option<&DecodedRow> {
    record.image_for_operation()
}

fn days_since_epoch(date: &NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
    (*date - epoch).num_days() as i32
}

fn type_error(column: &str, sample: &CellValue, actual: &CellValue) -> MapperError {
    MapperError::unsupported(
        actual.kind(),
        format!("column {column:?} (schema derived {} cells)", sample.kind()),
    )
}

/// Builds one column by pulling the cell out of every record's
/// operative image.
fn build_column(
    column: &str,
    sample: &CellValue,
    records: &[DecodedRecord],
) -> Result<ArrayRef, MapperError> {
    macro_rules! fill {
        ($builder:expr, $variant:path, $map:expr) => {{
            let mut builder = $builder;
            for record in records {
                match record_image(record).and_then(|image| image.get(column)) {
                    None => builder.append_null(),
                    Some($variant(v)) => builder.append_value($map(v)),
                    Some(other) => return Err(type_error(column, sample, other)),
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }};
    }

    Ok(match sample {
        CellValue::Text(_) => fill!(StringBuilder::new(), CellValue::Text, |v: &String| v.clone()),
        CellValue::Date(_) => fill!(Date32Builder::new(), CellValue::Date, days_since_epoch),
        CellValue::Int(_) => fill!(Int32Builder::new(), CellValue::Int, |v: &i32| *v),
        CellValue::BigInt(_) => fill!(Int64Builder::new(), CellValue::BigInt, |v: &i64| *v),
        CellValue::Float(_) => fill!(Float32Builder::new(), CellValue::Float, |v: &f32| *v),
        CellValue::Double(_) => fill!(Float64Builder::new(), CellValue::Double, |v: &f64| *v),
        CellValue::Decimal(_) => fill!(
            StringBuilder::new(),
            CellValue::Decimal,
            |v: &bigdecimal::BigDecimal| v.to_string()
        ),
        CellValue::Boolean(_) => {
            fill!(BooleanBuilder::new(), CellValue::Boolean, |v: &bool| *v)
        }
        CellValue::Timestamp(_) => fill!(
            TimestampMillisecondBuilder::new(),
            CellValue::Timestamp,
            |v: &i64| *v
        ),
        CellValue::Blob(_) => {
            fn blob_slice(v: &Vec<u8>) -> &[u8] {
                v.as_slice()
            }
            fill!(BinaryBuilder::new(), CellValue::Blob, blob_slice)
        }
    })
}

fn operation_column(records: &[DecodedRecord]) -> ArrayRef {
    let mut builder = StringBuilder::new();
    for record in records {
        builder.append_value(record.operation.as_str());
    }
    Arc::new(builder.finish())
}
