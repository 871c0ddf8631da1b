use std::fmt::{Display, Formatter};
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use ntuple_error::{NtupleResult, ntuple_bail, ntuple_err};
use serde::{Deserialize, Serialize};

/// A chunk filter. Filters run in pipeline order when a chunk is written and in reverse
/// order when it is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Filter {
    /// Byte transpose of fixed-width elements, grouping the n-th byte of every element.
    Shuffle,
    /// zlib deflate at the given level (0-9).
    Deflate { level: u32 },
}

impl Filter {
    pub const DEFAULT_DEFLATE: Filter = Filter::Deflate { level: 6 };

    pub fn validate(&self) -> NtupleResult<()> {
        if let Filter::Deflate { level } = self {
            if *level > 9 {
                ntuple_bail!("deflate level {} is not in 0..=9", level);
            }
        }
        Ok(())
    }

    /// Apply the filter to an encoded chunk. `width` is the element width for fixed-width
    /// data and `None` for text.
    pub(crate) fn encode(&self, data: Vec<u8>, width: Option<usize>) -> NtupleResult<Vec<u8>> {
        match self {
            Filter::Shuffle => Ok(match width {
                Some(width) if width > 1 => shuffle(&data, width),
                _ => data,
            }),
            Filter::Deflate { level } => {
                let mut encoder = ZlibEncoder::new(
                    Vec::with_capacity(data.len() / 2),
                    Compression::new(*level),
                );
                encoder
                    .write_all(&data)
                    .map_err(|e| ntuple_err!(BackingStore: "deflate failed: {}", e))?;
                encoder
                    .finish()
                    .map_err(|e| ntuple_err!(BackingStore: "deflate failed: {}", e))
            }
        }
    }

    /// Undo [`Filter::encode`].
    pub(crate) fn decode(&self, data: Vec<u8>, width: Option<usize>) -> NtupleResult<Vec<u8>> {
        match self {
            Filter::Shuffle => Ok(match width {
                Some(width) if width > 1 => unshuffle(&data, width),
                _ => data,
            }),
            Filter::Deflate { .. } => {
                let mut out = Vec::with_capacity(data.len() * 2);
                ZlibDecoder::new(data.as_slice())
                    .read_to_end(&mut out)
                    .map_err(|e| ntuple_err!(BackingStore: "inflate failed: {}", e))?;
                Ok(out)
            }
        }
    }
}

impl Display for Filter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Filter::Shuffle => write!(f, "shuffle"),
            Filter::Deflate { level } => write!(f, "deflate({level})"),
        }
    }
}

pub(crate) fn encode_pipeline(
    filters: &[Filter],
    data: Vec<u8>,
    width: Option<usize>,
) -> NtupleResult<Vec<u8>> {
    filters
        .iter()
        .try_fold(data, |data, filter| filter.encode(data, width))
}

pub(crate) fn decode_pipeline(
    filters: &[Filter],
    data: Vec<u8>,
    width: Option<usize>,
) -> NtupleResult<Vec<u8>> {
    filters
        .iter()
        .rev()
        .try_fold(data, |data, filter| filter.decode(data, width))
}

fn shuffle(data: &[u8], width: usize) -> Vec<u8> {
    let n = data.len() / width;
    let mut out = vec![0u8; data.len()];
    for (i, element) in data.chunks_exact(width).enumerate() {
        for (b, byte) in element.iter().enumerate() {
            out[b * n + i] = *byte;
        }
    }
    // Trailing bytes that do not form a whole element are kept as-is.
    let tail = n * width;
    out[tail..].copy_from_slice(&data[tail..]);
    out
}

fn unshuffle(data: &[u8], width: usize) -> Vec<u8> {
    let n = data.len() / width;
    let mut out = vec![0u8; data.len()];
    for i in 0..n {
        for b in 0..width {
            out[i * width + b] = data[b * n + i];
        }
    }
    let tail = n * width;
    out[tail..].copy_from_slice(&data[tail..]);
    out
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn sample() -> Vec<u8> {
        (0u32..1000).flat_map(|v| (v % 17).to_le_bytes()).collect()
    }

    #[test]
    fn shuffle_groups_bytes() {
        let data = vec![1, 2, 3, 4, 5, 6];
        assert_eq!(shuffle(&data, 2), vec![1, 3, 5, 2, 4, 6]);
        assert_eq!(unshuffle(&shuffle(&data, 2), 2), data);
    }

    #[rstest]
    #[case(vec![Filter::Shuffle])]
    #[case(vec![Filter::DEFAULT_DEFLATE])]
    #[case(vec![Filter::Shuffle, Filter::Deflate { level: 9 }])]
    fn pipeline_restores_input(#[case] filters: Vec<Filter>) {
        let encoded = encode_pipeline(&filters, sample(), Some(4)).unwrap();
        assert_eq!(decode_pipeline(&filters, encoded, Some(4)).unwrap(), sample());
    }

    #[test]
    fn deflate_shrinks_repetitive_data() {
        let encoded = encode_pipeline(&[Filter::DEFAULT_DEFLATE], sample(), Some(4)).unwrap();
        assert!(encoded.len() < sample().len() / 4);
    }

    #[test]
    fn corrupt_deflate_stream_is_a_store_error() {
        let err = decode_pipeline(&[Filter::DEFAULT_DEFLATE], vec![1, 2, 3], None).unwrap_err();
        assert_eq!(err.kind(), ntuple_error::ErrorKind::BackingStore);
    }

    #[test]
    fn level_out_of_range() {
        assert!(Filter::Deflate { level: 10 }.validate().is_err());
        assert!(Filter::Deflate { level: 0 }.validate().is_ok());
    }
}
