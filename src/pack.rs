//! Binary container for the precomputed label embeddings.
//!
//! The artifact is a flat, length-prefixed concatenation designed for a
//! sequential single-pass reader with no seeking — the on-device client
//! parses it without a serialization library.
//!
//! Layout (little-endian throughout):
//!   [u32] number_of_categories
//!   Per category:
//!     [u32] name_length
//!     [u8 * name_length] UTF-8 name
//!     [u32] label_count
//!     [u32] embedding_dim
//!     [f32 * label_count * embedding_dim] row-major embedding matrix
//!
//! No checksums, no compression, no padding between sections. Category
//! order matches taxonomy order exactly.

use anyhow::{Context, Result};
use ndarray::Array2;
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

use crate::embed::EmbeddingBundle;

/// Errors from the sequential parser. The writer cannot produce these; they
/// indicate a truncated or foreign file.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unexpected end of data at byte {0}")]
    UnexpectedEof(usize),
    #[error("category name is not valid UTF-8")]
    InvalidName(#[from] std::str::Utf8Error),
    #[error("{0} trailing bytes after the last category record")]
    TrailingBytes(usize),
}

/// Serialize a bundle into `writer`. Declared counts are taken from the
/// matrix shapes, so they always match the float data that follows.
pub fn write_embeddings<W: Write>(writer: &mut W, bundle: &EmbeddingBundle) -> std::io::Result<()> {
    writer.write_all(&(bundle.len() as u32).to_le_bytes())?;

    for (name, matrix) in bundle.iter() {
        let name_bytes = name.as_bytes();
        writer.write_all(&(name_bytes.len() as u32).to_le_bytes())?;
        writer.write_all(name_bytes)?;

        let (label_count, embed_dim) = matrix.dim();
        writer.write_all(&(label_count as u32).to_le_bytes())?;
        writer.write_all(&(embed_dim as u32).to_le_bytes())?;

        // Array2 iteration is logical (row-major) order regardless of the
        // underlying memory layout.
        for &value in matrix.iter() {
            writer.write_all(&value.to_le_bytes())?;
        }
    }

    Ok(())
}

/// Serialize a bundle to an in-memory byte vector.
pub fn pack_embeddings(bundle: &EmbeddingBundle) -> Vec<u8> {
    let mut buf = Vec::new();
    write_embeddings(&mut buf, bundle).expect("writing to a Vec cannot fail");
    buf
}

/// Write the embeddings artifact to `path`, returning its size in bytes.
/// The artifact is small, so it is assembled in memory and written in one
/// scoped open/write/close.
pub fn write_embeddings_file(path: &Path, bundle: &EmbeddingBundle) -> Result<u64> {
    let bytes = pack_embeddings(bundle);
    fs::write(path, &bytes)
        .with_context(|| format!("failed to write embeddings file {}", path.display()))?;
    Ok(bytes.len() as u64)
}

/// Parse an embeddings artifact back into its ordered category list.
/// Consumes the input fully; anything short or left over is an error.
pub fn parse_embeddings(data: &[u8]) -> Result<Vec<(String, Array2<f32>)>, ParseError> {
    let mut offset = 0;

    let category_count = read_u32(data, &mut offset)? as usize;
    let mut categories = Vec::with_capacity(category_count);

    for _ in 0..category_count {
        let name_len = read_u32(data, &mut offset)? as usize;
        let name = std::str::from_utf8(take(data, &mut offset, name_len)?)?.to_string();

        let label_count = read_u32(data, &mut offset)? as usize;
        let embed_dim = read_u32(data, &mut offset)? as usize;

        let float_bytes = take(data, &mut offset, label_count * embed_dim * 4)?;
        let values: Vec<f32> = float_bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let matrix = Array2::from_shape_vec((label_count, embed_dim), values)
            .expect("float count matches the declared shape");

        categories.push((name, matrix));
    }

    if offset != data.len() {
        return Err(ParseError::TrailingBytes(data.len() - offset));
    }

    Ok(categories)
}

fn take<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8], ParseError> {
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or(ParseError::UnexpectedEof(*offset))?;
    let slice = &data[*offset..end];
    *offset = end;
    Ok(slice)
}

fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32, ParseError> {
    let bytes = take(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
