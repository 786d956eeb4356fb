use anyhow::Result;
use arrow::json::ArrayWriter;
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use serde_json::{json, Value};

use crate::object_id::ObjectId;

/// Operator view: the raw id, then the batch as a table.
pub fn render_text(id: &ObjectId, batch: &RecordBatch) -> Result<String> {
    let table = pretty_format_batches(std::slice::from_ref(batch))?;
    Ok(format!(
        "{}\n{}\n({} rows, {} columns)",
        id.escaped(),
        table,
        batch.num_rows(),
        batch.num_columns()
    ))
}

pub fn render_json(id: &ObjectId, batch: &RecordBatch) -> Result<Value> {
    let mut writer = ArrayWriter::new(Vec::new());
    writer.write(batch)?;
    writer.finish()?;
    let buf = writer.into_inner();
    let rows: Value = if buf.is_empty() {
        Value::Array(Vec::new())
    } else {
        serde_json::from_slice(&buf)?
    };

    let columns: Vec<Value> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| {
            json!({
                "name": f.name(),
                "type": f.data_type().to_string(),
                "nullable": f.is_nullable(),
            })
        })
        .collect();

    Ok(json!({
        "object_id": id.to_hex(),
        "object_id_raw": id.escaped(),
        "num_rows": batch.num_rows(),
        "columns": columns,
        "rows": rows,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::sequence_batch;
    use crate::object_id::IdentifierConfig;

    #[test]
    fn text_has_id_header_and_values() {
        let id = IdentifierConfig::default().normalize("42").unwrap();
        let out = render_text(&id, &sequence_batch(3).unwrap()).unwrap();

        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("b\"00000000000000000042\""));
        assert!(out.contains("| i |"));
        assert!(out.contains("| 2 |"));
        assert!(out.ends_with("(3 rows, 1 columns)"));
    }

    #[test]
    fn json_lists_rows_and_columns() {
        let id = IdentifierConfig::default().normalize("7").unwrap();
        let out = render_json(&id, &sequence_batch(2).unwrap()).unwrap();

        assert_eq!(out["num_rows"], 2);
        assert_eq!(out["columns"][0]["name"], "i");
        assert_eq!(out["columns"][0]["type"], "Int64");
        assert_eq!(out["rows"], json!([{"i": 0}, {"i": 1}]));
        assert_eq!(out["object_id_raw"], "b\"00000000000000000007\"");
    }
}
