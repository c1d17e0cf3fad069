//! Filter wiring shared by every mapper, by composition.

use crate::error::MapperError;
use bigdecimal::ToPrimitive;
use data_types::{CellValue, DecodedRecord, DecodedRow};
use filter_expr::{EvalContext, FilterExpression, Value};
use observability_deps::tracing::{debug, info};
use std::sync::Arc;
use stream_config::ConfigDocument;

/// Holds the compiled `filter-expression`, if one is configured. The
/// compiled form is immutable and shared across shards.
#[derive(Debug, Clone, Default)]
pub struct FilterWiring {
    expression: Option<Arc<FilterExpression>>,
}

impl FilterWiring {
    pub fn from_config(config: &ConfigDocument) -> Result<Self, MapperError> {
        let source = config.get_string("keyspaces-cdc-streams.connector.filter-expression")?;
        let expression = match source {
            Some(source) if !source.trim().is_empty() => Some(Arc::new(
                FilterExpression::compile(&source)
                    .map_err(|e| MapperError::config(e.to_string()))?,
            )),
            _ => None,
        };
        Ok(Self { expression })
    }

    pub fn is_configured(&self) -> bool {
        self.expression.is_some()
    }

    /// Evaluates the expression per record; without one, the input
    /// passes through untouched. A record that fails evaluation is
    /// excluded, never the whole batch.
    pub fn apply(&self, records: Vec<DecodedRecord>) -> Vec<DecodedRecord> {
        let Some(expression) = &self.expression else {
            return records;
        };

        let before = records.len();
        let kept: Vec<DecodedRecord> = records
            .into_iter()
            .filter(|record| {
                let keep = expression.matches(&RecordContext { record });
                if !keep {
                    debug!(
                        sequence_number = %record.sequence_number,
                        "record excluded by filter expression",
                    );
                }
                keep
            })
            .collect();

        if kept.len() < before {
            info!(
                expression = expression.source_text(),
                passed = kept.len(),
                total = before,
                "filter applied",
            );
        }
        kept
    }
}

/// The evaluation context of one record: `metadata.*`, `newImage.<col>`
/// and `oldImage.<col>`.
#[derive(Debug)]
pub struct RecordContext<'a> {
    pub record: &'a DecodedRecord,
}

impl EvalContext for RecordContext<'_> {
    fn field(&self, path: &[String]) -> Value {
        let [root, field] = path else {
            return Value::Null;
        };
        match root.as_str() {
            "metadata" => match field.as_str() {
                "operation" => Value::Str(self.record.operation.as_str().to_string()),
                "sequenceNumber" => Value::Str(self.record.sequence_number.get().to_string()),
                "approximateArrivalTimestamp" => {
                    Value::Number(self.record.arrival_time.timestamp_millis() as f64)
                }
                _ => Value::Null,
            },
            "newImage" => image_field(self.record.new_image.as_ref(), field),
            "oldImage" => image_field(self.record.old_image.as_ref(), field),
            _ => Value::Null,
        }
    }
}

fn image_field(image: Option<&DecodedRow>, field: &str) -> Value {
    match image.and_then(|image| image.get(field)) {
        Some(value) => cell_to_value(value),
        None => Value::Null,
    }
}

fn cell_to_value(value: &CellValue) -> Value {
    match value {
        CellValue::Text(s) => Value::Str(s.clone()),
        CellValue::Date(d) => Value::Str(d.to_string()),
        CellValue::Int(v) => Value::Number(f64::from(*v)),
        CellValue::BigInt(v) => Value::Number(*v as f64),
        CellValue::Float(v) => Value::Number(f64::from(*v)),
        CellValue::Double(v) => Value::Number(*v),
        CellValue::Decimal(v) => v.to_f64().map(Value::Number).unwrap_or(Value::Null),
        CellValue::Boolean(b) => Value::Bool(*b),
        CellValue::Timestamp(v) => Value::Number(*v as f64),
        // No sensible scalar form; filters see blobs as absent.
        CellValue::Blob(_) => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock::Time;
    use data_types::{OperationType, SequenceNumber};

    fn record(seq: &str, operation: OperationType, n: i32) -> DecodedRecord {
        let image = DecodedRow::from([
            ("id".to_string(), CellValue::Text(format!("row-{seq}"))),
            ("n".to_string(), CellValue::Int(n)),
        ]);
        let (new_image, old_image) = if operation.is_delete_like() {
            (None, Some(image))
        } else {
            (Some(image), None)
        };
        DecodedRecord {
            sequence_number: SequenceNumber::from(seq),
            arrival_time: Time::from_timestamp_millis(1_000),
            operation,
            new_image,
            old_image,
        }
    }

    fn wiring(expression: &str) -> FilterWiring {
        let toml = format!(
            "[\"keyspaces-cdc-streams\".connector]\nfilter-expression = {expression:?}\n"
        );
        FilterWiring::from_config(&ConfigDocument::from_toml_str(&toml).unwrap()).unwrap()
    }

    #[test]
    fn test_no_expression_passes_everything() {
        let wiring = FilterWiring::from_config(&ConfigDocument::empty()).unwrap();
        assert!(!wiring.is_configured());

        let records = vec![record("1", OperationType::Insert, 1)];
        assert_eq!(wiring.apply(records.clone()), records);
    }

    #[test]
    fn test_operation_and_field_filtering() {
        let wiring = wiring("metadata.operation == 'INSERT' && newImage.n > 5");
        let records = vec![
            record("10", OperationType::Insert, 10),
            record("11", OperationType::Insert, 3),
            record("12", OperationType::Delete, 10),
        ];

        let kept = wiring.apply(records);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].sequence_number, SequenceNumber::from("10"));
    }

    #[test]
    fn test_metadata_fields_are_exposed() {
        let wiring1 = wiring("metadata.approximateArrivalTimestamp == 1000");
        assert_eq!(wiring1.apply(vec![record("1", OperationType::Insert, 1)]).len(), 1);

        let wiring2 = wiring("metadata.sequenceNumber == '7'");
        assert_eq!(wiring2.apply(vec![record("7", OperationType::Insert, 1)]).len(), 1);
        assert_eq!(wiring2.apply(vec![record("8", OperationType::Insert, 1)]).len(), 0);
    }

    #[test]
    fn test_old_image_lookup() {
        let wiring = wiring("oldImage.n == 4");
        assert_eq!(wiring.apply(vec![record("1", OperationType::Ttl, 4)]).len(), 1);
        assert_eq!(wiring.apply(vec![record("1", OperationType::Insert, 4)]).len(), 0);
    }

    #[test]
    fn test_invalid_expression_is_config_error() {
        let toml = "[\"keyspaces-cdc-streams\".connector]\nfilter-expression = \"n >\"\n";
        let err =
            FilterWiring::from_config(&ConfigDocument::from_toml_str(toml).unwrap()).unwrap_err();
        assert!(matches!(err, MapperError::Config { .. }));
    }
}
