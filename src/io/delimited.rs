//! Reading and writing delimited (tab or comma separated) matrices

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use ndarray::Array2;

use crate::data::{CountMatrix, SampleMetadata, TransformedData};
use crate::error::{Result, TransformError};

/// Tab if the header line contains one, comma otherwise
pub(crate) fn detect_delimiter<P: AsRef<Path>>(path: P) -> Result<u8> {
    let mut header = String::new();
    BufReader::new(File::open(path)?).read_line(&mut header)?;
    if header.trim().is_empty() {
        return Err(TransformError::EmptyData {
            reason: "empty file".to_string(),
        });
    }
    Ok(if header.contains('\t') { b'\t' } else { b',' })
}

pub(crate) fn reader_for<P: AsRef<Path>>(path: P) -> Result<csv::Reader<File>> {
    let delimiter = detect_delimiter(&path)?;
    Ok(csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_path(path)?)
}

pub(crate) fn parse_count(field: &str) -> Result<f64> {
    field.parse::<f64>().map_err(|_| TransformError::InvalidInputKind {
        reason: format!("invalid count value: '{}'", field),
    })
}

/// Read a count matrix: first column gene ids, header row sample ids
pub fn read_count_matrix<P: AsRef<Path>>(path: P) -> Result<CountMatrix> {
    let mut reader = reader_for(&path)?;
    let header = reader.headers()?.clone();
    if header.len() < 2 {
        return Err(TransformError::InvalidInputKind {
            reason: "count matrix needs a gene id column and at least one sample".to_string(),
        });
    }
    let sample_ids: Vec<String> = header.iter().skip(1).map(str::to_string).collect();
    let n_samples = sample_ids.len();

    let mut gene_ids = Vec::new();
    let mut values = Vec::new();
    for record in reader.records() {
        let record = record?;
        gene_ids.push(record.get(0).unwrap_or_default().to_string());
        for field in record.iter().skip(1) {
            values.push(parse_count(field)?);
        }
    }

    if gene_ids.is_empty() {
        return Err(TransformError::EmptyData {
            reason: "no genes found in count matrix".to_string(),
        });
    }
    log::info!("Read {} genes x {} samples from {}", gene_ids.len(), n_samples, path.as_ref().display());

    let counts = Array2::from_shape_vec((gene_ids.len(), n_samples), values).map_err(|e| {
        TransformError::DimensionMismatch {
            expected: format!("{} values per row", n_samples),
            got: e.to_string(),
        }
    })?;
    CountMatrix::new(counts, gene_ids, sample_ids)
}

/// Read sample metadata: first column sample ids, remaining columns factors
pub fn read_metadata<P: AsRef<Path>>(path: P) -> Result<SampleMetadata> {
    let mut reader = reader_for(&path)?;
    let header = reader.headers()?.clone();
    let names: Vec<String> = header.iter().skip(1).map(str::to_string).collect();

    let mut sample_ids = Vec::new();
    let mut columns: HashMap<&str, Vec<String>> = names.iter().map(|n| (n.as_str(), Vec::new())).collect();
    for record in reader.records() {
        let record = record?;
        sample_ids.push(record.get(0).unwrap_or_default().to_string());
        for (name, value) in names.iter().zip(record.iter().skip(1)) {
            if let Some(column) = columns.get_mut(name.as_str()) {
                column.push(value.to_string());
            }
        }
    }

    if sample_ids.is_empty() {
        return Err(TransformError::EmptyData {
            reason: "no samples found in metadata".to_string(),
        });
    }

    let mut metadata = SampleMetadata::new(sample_ids);
    for (name, values) in columns {
        metadata.add_condition(name, values)?;
    }
    Ok(metadata)
}

pub(crate) fn tab_writer<P: AsRef<Path>>(path: P) -> Result<csv::Writer<File>> {
    Ok(csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?)
}

pub(crate) fn write_header(writer: &mut csv::Writer<File>, sample_ids: &[String]) -> Result<()> {
    writer.write_record(std::iter::once("gene_id").chain(sample_ids.iter().map(String::as_str)))?;
    Ok(())
}

pub(crate) fn write_row<'a, I>(writer: &mut csv::Writer<File>, gene_id: &str, values: I) -> Result<()>
where
    I: IntoIterator<Item = &'a f64>,
{
    let mut record = csv::StringRecord::new();
    record.push_field(gene_id);
    for v in values {
        record.push_field(&v.to_string());
    }
    writer.write_record(&record)?;
    Ok(())
}

/// Write transformed values as a tab-separated matrix with a header row
pub fn write_transformed<P: AsRef<Path>>(
    path: P,
    gene_ids: &[String],
    sample_ids: &[String],
    data: &TransformedData,
) -> Result<()> {
    let (n_genes, n_samples) = data.dim();
    if gene_ids.len() != n_genes || sample_ids.len() != n_samples {
        return Err(TransformError::DimensionMismatch {
            expected: format!("{} gene ids and {} sample ids", n_genes, n_samples),
            got: format!("{} gene ids and {} sample ids", gene_ids.len(), sample_ids.len()),
        });
    }

    let mut writer = tab_writer(path)?;
    write_header(&mut writer, sample_ids)?;
    match data {
        TransformedData::Blocked(blocks) => {
            for index in 0..blocks.n_blocks() {
                let info = blocks.block_info(index);
                let block = blocks.read_values(index)?;
                for (local, row) in block.rows().into_iter().enumerate() {
                    write_row(&mut writer, &gene_ids[info.row_offset + local], row.iter())?;
                }
            }
        }
        other => {
            let dense = other.to_dense()?;
            for (gene_id, row) in gene_ids.iter().zip(dense.rows()) {
                write_row(&mut writer, gene_id, row.iter())?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_count_matrix() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "gene_id\ts1\ts2\ts3").unwrap();
        writeln!(file, "gene1\t100\t200\t150").unwrap();
        writeln!(file, "gene2\t50\t75\t60").unwrap();

        let matrix = read_count_matrix(file.path()).unwrap();
        assert_eq!(matrix.n_genes(), 2);
        assert_eq!(matrix.n_samples(), 3);
        assert_eq!(matrix.counts()[[1, 2]], 60.0);
        assert_eq!(matrix.sample_ids(), &["s1", "s2", "s3"]);
    }

    #[test]
    fn test_read_comma_separated_with_quotes() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "\"gene\",\"a\",\"b\"").unwrap();
        writeln!(file, "\"g1\",1,2").unwrap();

        let matrix = read_count_matrix(file.path()).unwrap();
        assert_eq!(matrix.gene_ids(), &["g1"]);
        assert_eq!(matrix.counts()[[0, 1]], 2.0);
    }

    #[test]
    fn test_ragged_rows_fail() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "gene\ta\tb").unwrap();
        writeln!(file, "g1\t1").unwrap();
        assert!(matches!(read_count_matrix(file.path()), Err(TransformError::CsvError(_))));
    }

    #[test]
    fn test_non_numeric_count() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "gene\ta").unwrap();
        writeln!(file, "g1\tmany").unwrap();
        assert!(matches!(
            read_count_matrix(file.path()),
            Err(TransformError::InvalidInputKind { .. })
        ));
    }

    #[test]
    fn test_read_metadata() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sample\tcondition\tbatch").unwrap();
        writeln!(file, "s1\tctrl\tA").unwrap();
        writeln!(file, "s2\ttreat\tB").unwrap();

        let metadata = read_metadata(file.path()).unwrap();
        assert_eq!(metadata.n_samples(), 2);
        assert_eq!(metadata.condition("condition").unwrap(), &vec!["ctrl".to_string(), "treat".to_string()]);
    }

    #[test]
    fn test_write_transformed() {
        let file = NamedTempFile::new().unwrap();
        let data = TransformedData::Dense(array![[0.5, 1.0], [2.0, 0.0]]);
        let genes = vec!["g1".to_string(), "g2".to_string()];
        let samples = vec!["a".to_string(), "b".to_string()];
        write_transformed(file.path(), &genes, &samples, &data).unwrap();

        let written = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(written, "gene_id\ta\tb\ng1\t0.5\t1\ng2\t2\t0\n");

        assert!(write_transformed(file.path(), &genes[..1], &samples, &data).is_err());
    }
}
