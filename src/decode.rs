//! Arrow IPC streaming-format codec for store objects.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;
use arrow::array::Int64Array;
use arrow::buffer::Buffer;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::ArrowError;
use arrow::ipc::reader::StreamDecoder;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;

use crate::error::FetchError;

/// Read the first record batch of a stream payload.
///
/// Decoding happens in place: message and body buffers are slices of
/// `buffer`, and lengths claimed by the stream are checked against the bytes
/// actually present. Anything after the first batch is ignored. A payload
/// that is not a stream, has no batches, or ends inside the first batch is a
/// `DecodeError`.
pub fn decode_single_batch(mut buffer: Buffer) -> Result<RecordBatch, FetchError> {
    if buffer.is_empty() {
        return Err(FetchError::DecodeError("buffer is empty".to_string()));
    }

    let mut decoder = StreamDecoder::new();
    // arrow asserts on some malformed layouts instead of returning an error
    let decoded = panic::catch_unwind(AssertUnwindSafe(|| -> Result<Option<RecordBatch>, ArrowError> {
        match decoder.decode(&mut buffer)? {
            Some(batch) => Ok(Some(batch)),
            None => {
                decoder.finish()?;
                Ok(None)
            }
        }
    }));

    match decoded {
        Ok(Ok(Some(batch))) => Ok(batch),
        Ok(Ok(None)) => Err(FetchError::DecodeError("stream contains no record batches".to_string())),
        Ok(Err(e)) => Err(FetchError::DecodeError(format!("invalid stream: {}", e))),
        Err(_) => Err(FetchError::DecodeError("malformed record batch layout".to_string())),
    }
}

/// Serialize batches as one stream. All batches must share a schema.
pub fn encode_stream(batches: &[RecordBatch]) -> Result<Vec<u8>> {
    let first = batches
        .first()
        .ok_or_else(|| anyhow::anyhow!("no record batches to encode"))?;

    let mut writer = StreamWriter::try_new(Vec::new(), &first.schema())?;
    for batch in batches {
        writer.write(batch)?;
    }
    writer.finish()?;
    Ok(writer.into_inner()?)
}

/// One non-null `Int64` column `i` holding `0..rows`.
pub fn sequence_batch(rows: usize) -> Result<RecordBatch> {
    let schema = Schema::new(vec![Field::new("i", DataType::Int64, false)]);
    let values = Int64Array::from_iter_values(0..rows as i64);
    Ok(RecordBatch::try_new(Arc::new(schema), vec![Arc::new(values)])?)
}
