use bytes::{Buf, BufMut};
use ntuple_error::{NtupleResult, ntuple_bail, ntuple_err};

use crate::dtype::{ByteOrder, ElementType, swap_byte_order};
use crate::filter::{Filter, decode_pipeline, encode_pipeline};
use crate::values::Values;

/// Serialize one chunk of elements into its stored form.
pub(crate) fn encode_chunk(
    values: &Values,
    byte_order: ByteOrder,
    filters: &[Filter],
) -> NtupleResult<Vec<u8>> {
    match values {
        Values::Fixed { element, bytes } => {
            let width = element.byte_width();
            let mut raw = bytes.clone();
            if !byte_order.is_native() {
                swap_byte_order(&mut raw, width.unwrap_or(1));
            }
            encode_pipeline(filters, raw, width)
        }
        Values::Text(strings) => {
            let total: usize = strings.iter().map(|s| s.len() + 4).sum();
            let mut raw = Vec::with_capacity(total);
            for s in strings {
                let len = u32::try_from(s.len())
                    .map_err(|_| ntuple_err!(BackingStore: "text element of {} bytes is too long", s.len()))?;
                raw.put_u32_le(len);
                raw.put_slice(s.as_bytes());
            }
            encode_pipeline(filters, raw, None)
        }
    }
}

/// Inverse of [`encode_chunk`]; the chunk must hold exactly `elements` elements.
pub(crate) fn decode_chunk(
    data: Vec<u8>,
    element: ElementType,
    byte_order: ByteOrder,
    filters: &[Filter],
    elements: usize,
) -> NtupleResult<Values> {
    let width = element.byte_width();
    let mut raw = decode_pipeline(filters, data, width)?;
    match width {
        Some(width) => {
            if raw.len() != elements * width {
                ntuple_bail!(
                    BackingStore: "chunk holds {} bytes, expected {} {} elements",
                    raw.len(),
                    elements,
                    element
                );
            }
            if !byte_order.is_native() {
                swap_byte_order(&mut raw, width);
            }
            Ok(Values::Fixed {
                element,
                bytes: raw,
            })
        }
        None => {
            let mut buf = raw.as_slice();
            let mut strings = Vec::with_capacity(elements);
            while buf.has_remaining() {
                if buf.remaining() < 4 {
                    ntuple_bail!(BackingStore: "truncated text chunk");
                }
                let len = buf.get_u32_le() as usize;
                if buf.remaining() < len {
                    ntuple_bail!(BackingStore: "truncated text chunk");
                }
                let s = String::from_utf8(buf[..len].to_vec())
                    .map_err(|e| ntuple_err!(BackingStore: "text chunk is not UTF-8: {}", e))?;
                buf.advance(len);
                strings.push(s);
            }
            if strings.len() != elements {
                ntuple_bail!(
                    BackingStore: "chunk holds {} text elements, expected {}",
                    strings.len(),
                    elements
                );
            }
            Ok(Values::Text(strings))
        }
    }
}
