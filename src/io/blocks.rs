//! File-backed block storage for matrices that should not be held in memory

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};

use ndarray::Array2;

use super::delimited::{detect_delimiter, parse_count, tab_writer, write_header, write_row};
use crate::data::{BlockInfo, BlockParams, BlockSink, BlockStore};
use crate::error::{Result, TransformError};

/// A delimited count file read one row block at a time
///
/// Opening the file makes a single pass to record gene ids and the byte
/// offset of the first row of every block. Each [`BlockStore::read_block`]
/// call seeks to that offset and parses only the rows of the block.
#[derive(Debug, Clone)]
pub struct DelimitedBlockFile {
    path: PathBuf,
    delimiter: u8,
    gene_ids: Vec<String>,
    sample_ids: Vec<String>,
    block_offsets: Vec<u64>,
    ranges: Vec<Range<usize>>,
}

impl DelimitedBlockFile {
    pub fn open<P: AsRef<Path>>(path: P, params: &BlockParams) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let delimiter = detect_delimiter(&path)?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .trim(csv::Trim::All)
            .from_path(&path)?;

        let header = reader.headers()?.clone();
        if header.len() < 2 {
            return Err(TransformError::InvalidInputKind {
                reason: "count matrix needs a gene id column and at least one sample".to_string(),
            });
        }
        let sample_ids: Vec<String> = header.iter().skip(1).map(str::to_string).collect();

        let block_rows = params.block_rows.max(1);
        let mut gene_ids = Vec::new();
        let mut block_offsets = Vec::new();
        let mut record = csv::StringRecord::new();
        loop {
            let position = reader.position().byte();
            if !reader.read_record(&mut record)? {
                break;
            }
            if gene_ids.len() % block_rows == 0 {
                block_offsets.push(record.position().map_or(position, |p| p.byte()));
            }
            gene_ids.push(record.get(0).unwrap_or_default().to_string());
        }

        if gene_ids.is_empty() {
            return Err(TransformError::EmptyData {
                reason: "no genes found in count matrix".to_string(),
            });
        }
        let ranges = params.ranges(gene_ids.len());
        log::info!(
            "Indexed {} genes x {} samples in {} blocks from {}",
            gene_ids.len(),
            sample_ids.len(),
            ranges.len(),
            path.display()
        );

        Ok(Self {
            path,
            delimiter,
            gene_ids,
            sample_ids,
            block_offsets,
            ranges,
        })
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }
}

impl BlockStore for DelimitedBlockFile {
    fn dim(&self) -> (usize, usize) {
        (self.gene_ids.len(), self.sample_ids.len())
    }

    fn n_blocks(&self) -> usize {
        self.ranges.len()
    }

    fn block_range(&self, index: usize) -> Range<usize> {
        self.ranges[index].clone()
    }

    fn read_block(&self, index: usize) -> Result<Array2<f64>> {
        let (rows, offset) = match (self.ranges.get(index), self.block_offsets.get(index)) {
            (Some(rows), Some(&offset)) => (rows.clone(), offset),
            _ => {
                return Err(TransformError::InvalidInput {
                    reason: format!("block {} out of range ({} blocks)", index, self.ranges.len()),
                })
            }
        };

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .trim(csv::Trim::All)
            .has_headers(false)
            .from_reader(file);

        let n_samples = self.sample_ids.len();
        let mut block = Array2::zeros((rows.len(), n_samples));
        let mut record = csv::StringRecord::new();
        for local in 0..rows.len() {
            if !reader.read_record(&mut record)? {
                return Err(TransformError::InvalidInput {
                    reason: format!("{} ended inside block {}", self.path.display(), index),
                });
            }
            if record.len() != n_samples + 1 {
                return Err(TransformError::DimensionMismatch {
                    expected: format!("{} columns", n_samples + 1),
                    got: format!("{} columns in row {}", record.len(), rows.start + local + 2),
                });
            }
            for (sample, field) in record.iter().skip(1).enumerate() {
                block[[local, sample]] = parse_count(field)?;
            }
        }
        log::debug!("Read block {} (genes {}..{})", index, rows.start, rows.end);
        Ok(block)
    }
}

/// Writes each finished block straight to a tab-separated file
pub struct DelimitedBlockWriter {
    writer: csv::Writer<File>,
    gene_ids: Vec<String>,
    next_row: usize,
}

impl DelimitedBlockWriter {
    /// Create the file and write the header row
    pub fn create<P: AsRef<Path>>(path: P, gene_ids: Vec<String>, sample_ids: &[String]) -> Result<Self> {
        let mut writer = tab_writer(path)?;
        write_header(&mut writer, sample_ids)?;
        Ok(Self {
            writer,
            gene_ids,
            next_row: 0,
        })
    }

    /// Flush and check every gene was written
    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        if self.next_row != self.gene_ids.len() {
            return Err(TransformError::DimensionMismatch {
                expected: format!("{} rows written", self.gene_ids.len()),
                got: format!("{} rows written", self.next_row),
            });
        }
        Ok(())
    }
}

impl BlockSink for DelimitedBlockWriter {
    fn write_block(&mut self, info: BlockInfo, block: Array2<f64>) -> Result<()> {
        if info.row_offset != self.next_row || info.rows().end > self.gene_ids.len() {
            return Err(TransformError::InvalidInput {
                reason: format!(
                    "block {} starts at row {}, expected row {}",
                    info.index, info.row_offset, self.next_row
                ),
            });
        }
        for (local, row) in block.rows().into_iter().enumerate() {
            write_row(&mut self.writer, &self.gene_ids[info.row_offset + local], row.iter())?;
        }
        self.next_row = info.rows().end;
        Ok(())
    }
}
