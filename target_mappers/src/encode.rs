//! JSON rendering of decoded records, shared by the object-store JSON
//! format, the queue publisher and the log mapper.

use data_types::{DecodedRecord, DecodedRow};
use serde_json::{json, Value};

/// Renders an image as a JSON object. An empty `include_fields` list
/// means every column; otherwise the image is projected to the listed
/// columns (missing ones are skipped). A missing image renders as
/// `null`.
pub fn image_to_json(image: Option<&DecodedRow>, include_fields: &[String]) -> Value {
    let Some(image) = image else {
        return Value::Null;
    };
    let entries: serde_json::Map<String, Value> = if include_fields.is_empty() {
        image
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect()
    } else {
        include_fields
            .iter()
            .filter_map(|name| {
                image
                    .get(name)
                    .map(|value| (name.clone(), value.to_json()))
            })
            .collect()
    };
    Value::Object(entries)
}

/// The row-oriented representation written by the object-store JSON
/// format: the record's operative image, all columns.
pub fn record_row_json(record: &DecodedRecord) -> Value {
    image_to_json(record.image_for_operation(), &[])
}

/// The full envelope used by the log mapper: metadata plus both images.
pub fn record_envelope_json(record: &DecodedRecord) -> Value {
    json!({
        "sequenceNumber": record.sequence_number.get(),
        "operation": record.operation.as_str(),
        "approximateArrivalTimestamp": record.arrival_time.timestamp_millis(),
        "newImage": image_to_json(record.new_image.as_ref(), &[]),
        "oldImage": image_to_json(record.old_image.as_ref(), &[]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock::Time;
    use data_types::{CellValue, OperationType, SequenceNumber};

    fn insert_record() -> DecodedRecord {
        DecodedRecord {
            sequence_number: SequenceNumber::from("100"),
            arrival_time: Time::from_timestamp_millis(0),
            operation: OperationType::Insert,
            new_image: Some(DecodedRow::from([
                ("id".to_string(), CellValue::Text("x".into())),
                ("n".to_string(), CellValue::Int(7)),
            ])),
            old_image: None,
        }
    }

    #[test]
    fn test_row_json_uses_operative_image() {
        assert_eq!(
            record_row_json(&insert_record()),
            json!({"id": "x", "n": 7})
        );
    }

    #[test]
    fn test_projection() {
        let record = insert_record();
        assert_eq!(
            image_to_json(record.new_image.as_ref(), &["n".to_string()]),
            json!({"n": 7})
        );
        assert_eq!(
            image_to_json(
                record.new_image.as_ref(),
                &["n".to_string(), "absent".to_string()]
            ),
            json!({"n": 7})
        );
        assert_eq!(image_to_json(None, &[]), Value::Null);
    }

    #[test]
    fn test_envelope() {
        let envelope = record_envelope_json(&insert_record());
        assert_eq!(envelope["operation"], "INSERT");
        assert_eq!(envelope["sequenceNumber"], "100");
        assert_eq!(envelope["newImage"]["id"], "x");
        assert_eq!(envelope["oldImage"], Value::Null);
    }
}
