use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use dynfilter_common::{DynamicFilterError, Result};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ProjectionMask;
use rayon::prelude::*;
use std::path::Path;

/// Build-side pages split across execution lanes.
#[derive(Debug, Clone)]
pub struct BuildSide {
    /// schema of the projected pages
    pub schema: SchemaRef,
    pub lanes: Vec<Vec<RecordBatch>>,
    pub row_count: i64,
}

/// Reads a parquet file as build-side input, assigning row groups to lanes
/// round-robin and decoding lanes in parallel.
pub fn read_lane_batches(
    path: &Path,
    columns: Option<&[String]>,
    lanes: usize,
    batch_size: usize,
) -> Result<BuildSide> {
    let lanes = lanes.max(1);
    let file = std::fs::File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let file_schema = builder.schema().clone();
    let row_count = builder.metadata().file_metadata().num_rows();
    let num_row_groups = builder.metadata().num_row_groups();

    // projection keeps file column order, so resolve indices up front
    let indices: Option<Vec<usize>> = columns
        .map(|cols| {
            let mut idx = cols
                .iter()
                .map(|c| {
                    file_schema
                        .index_of(c)
                        .map_err(|_| DynamicFilterError::Other(format!("no such column: {c}")))
                })
                .collect::<Result<Vec<usize>>>()?;
            idx.sort_unstable();
            idx.dedup();
            Ok::<_, DynamicFilterError>(idx)
        })
        .transpose()?;
    let schema: SchemaRef = match &indices {
        Some(idx) => std::sync::Arc::new(file_schema.project(idx)?),
        None => file_schema,
    };

    let assignments: Vec<Vec<usize>> = (0..lanes)
        .map(|lane| (lane..num_row_groups).step_by(lanes).collect())
        .collect();

    let lane_batches = assignments
        .par_iter()
        .map(|row_groups| read_row_groups(path, row_groups, indices.as_deref(), batch_size))
        .collect::<Result<Vec<_>>>()?;

    Ok(BuildSide {
        schema,
        lanes: lane_batches,
        row_count,
    })
}

fn read_row_groups(
    path: &Path,
    row_groups: &[usize],
    indices: Option<&[usize]>,
    batch_size: usize,
) -> Result<Vec<RecordBatch>> {
    if row_groups.is_empty() {
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let builder = if let Some(idx) = indices {
        let mask = ProjectionMask::roots(builder.parquet_schema(), idx.iter().copied());
        builder.with_projection(mask)
    } else {
        builder
    };
    let reader = builder
        .with_row_groups(row_groups.to_vec())
        .with_batch_size(batch_size)
        .build()?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    Ok(batches)
}
