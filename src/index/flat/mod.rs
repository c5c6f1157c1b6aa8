#[cfg(test)]
mod tests;

use crate::embeddings::check_dimension;
use crate::{RagError, Result};

pub const INDEX_MAGIC: [u8; 4] = *b"MCIX";
pub const EMBEDDINGS_MAGIC: [u8; 4] = *b"MCEM";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

/// Exact cosine-similarity index.
///
/// Vectors are L2-normalized on insert and stored row-major, so a query is
/// one inner product per row. Results are exact.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dimension: usize,
    vectors: Vec<f32>,
}

impl FlatIndex {
    #[inline]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
        }
    }

    #[inline]
    pub fn from_embeddings(dimension: usize, embeddings: &[Vec<f32>]) -> Result<Self> {
        let mut index = Self::new(dimension);
        index.vectors.reserve(dimension * embeddings.len());
        for embedding in embeddings {
            index.add(embedding)?;
        }
        Ok(index)
    }

    /// Append one vector; its position is the current length.
    #[inline]
    pub fn add(&mut self, embedding: &[f32]) -> Result<()> {
        check_dimension(self.dimension, embedding)?;
        self.vectors.extend(normalized(embedding));
        Ok(())
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.vectors.len() / self.dimension
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Normalized vector stored at `position`.
    #[inline]
    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimension)?;
        self.vectors.get(start..start + self.dimension)
    }

    /// Up to `top_k` `(position, cosine)` pairs among the positions accepted
    /// by `keep`, best first, lower position first on equal scores.
    #[inline]
    pub fn search<F>(&self, query: &[f32], top_k: usize, keep: F) -> Result<Vec<(usize, f32)>>
    where
        F: Fn(usize) -> bool,
    {
        check_dimension(self.dimension, query)?;
        if top_k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let query = normalized(query);
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .chunks_exact(self.dimension)
            .enumerate()
            .filter(|(position, _)| keep(*position))
            .map(|(position, row)| (position, dot(row, &query)))
            .collect();

        let by_rank =
            |a: &(usize, f32), b: &(usize, f32)| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0));
        if scored.len() > top_k {
            scored.select_nth_unstable_by(top_k - 1, by_rank);
            scored.truncate(top_k);
        }
        scored.sort_unstable_by(by_rank);
        Ok(scored)
    }

    /// Serialized form: magic, format version, dimension, count, then the
    /// normalized vectors as little-endian `f32`.
    #[inline]
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_matrix(INDEX_MAGIC, self.dimension, &self.vectors)
    }

    #[inline]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (dimension, vectors) = decode_matrix(INDEX_MAGIC, bytes)?;
        Ok(Self { dimension, vectors })
    }
}

/// Encode raw embeddings in the same layout as the index file.
#[inline]
pub fn encode_embeddings(dimension: usize, embeddings: &[Vec<f32>]) -> Result<Vec<u8>> {
    let mut flat = Vec::with_capacity(dimension * embeddings.len());
    for embedding in embeddings {
        check_dimension(dimension, embedding)?;
        flat.extend_from_slice(embedding);
    }
    Ok(encode_matrix(EMBEDDINGS_MAGIC, dimension, &flat))
}

#[inline]
pub fn decode_embeddings(bytes: &[u8]) -> Result<Vec<Vec<f32>>> {
    let (dimension, flat) = decode_matrix(EMBEDDINGS_MAGIC, bytes)?;
    if dimension == 0 {
        return Ok(Vec::new());
    }
    Ok(flat.chunks_exact(dimension).map(<[f32]>::to_vec).collect())
}

fn encode_matrix(magic: [u8; 4], dimension: usize, values: &[f32]) -> Vec<u8> {
    let count = if dimension == 0 { 0 } else { values.len() / dimension };
    let mut bytes = Vec::with_capacity(HEADER_LEN + values.len() * 4);
    bytes.extend_from_slice(&magic);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&u32::try_from(dimension).unwrap_or(u32::MAX).to_le_bytes());
    bytes.extend_from_slice(&(count as u64).to_le_bytes());
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_matrix(magic: [u8; 4], bytes: &[u8]) -> Result<(usize, Vec<f32>)> {
    let corrupt = |what: &str| RagError::DataIntegrity(format!("Invalid index file: {what}"));

    let (header, body) = bytes
        .split_at_checked(HEADER_LEN)
        .ok_or_else(|| corrupt("truncated header"))?;
    let (found_magic, rest) = header.split_at(4);
    if found_magic != magic {
        return Err(corrupt("unexpected magic bytes"));
    }
    let (version, rest) = rest.split_at(4);
    let (dimension, count) = rest.split_at(4);

    let version = u32::from_le_bytes(version.try_into().map_err(|_| corrupt("version"))?);
    if version != FORMAT_VERSION {
        return Err(corrupt(&format!("unsupported format version {version}")));
    }
    let dimension = u32::from_le_bytes(dimension.try_into().map_err(|_| corrupt("dimension"))?) as usize;
    let count = u64::from_le_bytes(count.try_into().map_err(|_| corrupt("count"))?);
    let count = usize::try_from(count).map_err(|_| corrupt("count overflows"))?;

    let expected_len = count
        .checked_mul(dimension)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| corrupt("size overflows"))?;
    if body.len() != expected_len {
        return Err(corrupt(&format!(
            "expected {expected_len} bytes of vectors, found {}",
            body.len()
        )));
    }

    let values = body
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok((dimension, values))
}

fn normalized(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        vector.iter().map(|v| v / norm).collect()
    } else {
        vector.to_vec()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
