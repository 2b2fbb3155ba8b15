use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use ndarray::Array2;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::EngineError;

fn read_to_string(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let mut reader: Box<dyn Read> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut content = String::new();
    reader
        .read_to_string(&mut content)
        .with_context(|| format!("failed to read {:?}", path))?;
    Ok(content)
}

/// Reads one observation sequence: a row of `n_cols` integers per line,
/// `#` starting a comment. Gzipped when the name ends in `.gz`.
pub fn read_obs(path: &Path, n_cols: usize) -> Result<Array2<i32>> {
    let content = read_to_string(path)?;
    parse_obs(&content, n_cols).with_context(|| format!("invalid observations in {:?}", path))
}

pub fn parse_obs(content: &str, n_cols: usize) -> Result<Array2<i32>> {
    if n_cols == 0 {
        bail!("n_cols must be > 0");
    }
    let mut data = Vec::new();
    let mut rows = 0usize;
    for (lineno, line) in content.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let start = data.len();
        for field in line.split_whitespace() {
            let v: i32 = field
                .parse()
                .with_context(|| format!("line {}: bad integer {:?}", lineno + 1, field))?;
            data.push(v);
        }
        let got = data.len() - start;
        if got != n_cols {
            bail!("line {}: expected {} columns, found {}", lineno + 1, n_cols, got);
        }
        rows += 1;
    }
    if rows == 0 {
        bail!("no observation rows found");
    }
    Array2::from_shape_vec((rows, n_cols), data).context("failed to reshape observations")
}

/// Reshapes flat row-major buffers, `lengths[i]` rows each, into one
/// matrix per sequence.
pub fn from_raw_buffers(
    lengths: &[usize],
    buffers: &[&[i32]],
    n_cols: usize,
) -> crate::error::Result<Vec<Array2<i32>>> {
    if lengths.len() != buffers.len() {
        return Err(EngineError::invalid_config(format!(
            "{} lengths for {} buffers",
            lengths.len(),
            buffers.len()
        )));
    }
    lengths
        .iter()
        .zip(buffers)
        .enumerate()
        .map(|(i, (&len, buf))| {
            let expected = len.checked_mul(n_cols).ok_or_else(|| {
                EngineError::invalid_config(format!(
                    "buffer {i}: {len} rows x {n_cols} columns overflows"
                ))
            })?;
            if buf.len() != expected {
                return Err(EngineError::invalid_config(format!(
                    "buffer {i} holds {} values, expected {} rows x {} columns",
                    buf.len(),
                    len,
                    n_cols
                )));
            }
            Array2::from_shape_vec((len, n_cols), buf.to_vec())
                .map_err(|e| EngineError::invalid_config(format!("buffer {i}: {e}")))
        })
        .collect()
}
