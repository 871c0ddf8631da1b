use ntuple_error::{NtupleResult, ntuple_bail, ntuple_err};

use crate::dtype::{ElementType, NativeElement};

/// A run of elements exchanged with a dataset.
///
/// Fixed-width elements are held as native-endian bytes; the dataset converts them to its
/// stored byte order on write and back on read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Values {
    Fixed { element: ElementType, bytes: Vec<u8> },
    Text(Vec<String>),
}

impl Values {
    /// An empty run of `element`s.
    pub fn empty(element: ElementType) -> Self {
        Self::with_capacity(element, 0)
    }

    pub fn with_capacity(element: ElementType, elements: usize) -> Self {
        match element.byte_width() {
            Some(width) => Self::Fixed {
                element,
                bytes: Vec::with_capacity(elements * width),
            },
            None => Self::Text(Vec::with_capacity(elements)),
        }
    }

    /// `len` default-valued elements: zero for numbers, `false`, or the empty string.
    pub fn defaults(element: ElementType, len: usize) -> Self {
        match element.byte_width() {
            Some(width) => Self::Fixed {
                element,
                bytes: vec![0; len * width],
            },
            None => Self::Text(vec![String::new(); len]),
        }
    }

    pub fn from_slice<T: NativeElement>(values: &[T]) -> Self {
        let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
        values.iter().for_each(|v| v.write_ne(&mut bytes));
        Self::Fixed {
            element: T::ELEMENT,
            bytes,
        }
    }

    pub fn from_strings<S: AsRef<str>>(values: &[S]) -> Self {
        Self::Text(values.iter().map(|s| s.as_ref().to_string()).collect())
    }

    pub fn element(&self) -> ElementType {
        match self {
            Self::Fixed { element, .. } => *element,
            Self::Text(_) => ElementType::Text,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Self::Fixed { element, bytes } => bytes.len() / element.byte_width().unwrap_or(1),
            Self::Text(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held in memory, counting text elements at their fixed in-memory width.
    pub fn nbytes(&self) -> usize {
        match self {
            Self::Fixed { bytes, .. } => bytes.len(),
            Self::Text(values) => values.len() * ElementType::Text.memory_width(),
        }
    }

    /// Decode the elements as `T`, which must match the element type exactly.
    pub fn to_vec<T: NativeElement>(&self) -> NtupleResult<Vec<T>> {
        match self {
            Self::Fixed { element, bytes } if *element == T::ELEMENT => {
                let width = element
                    .byte_width()
                    .ok_or_else(|| ntuple_err!("{} has no fixed width", element))?;
                Ok(bytes.chunks_exact(width).map(T::read_ne).collect())
            }
            other => ntuple_bail!(
                "cannot read {} elements as {}",
                other.element(),
                T::ELEMENT
            ),
        }
    }

    pub fn as_strings(&self) -> NtupleResult<&[String]> {
        match self {
            Self::Text(values) => Ok(values),
            other => ntuple_bail!("cannot read {} elements as text", other.element()),
        }
    }

    /// Append the elements of `other`, which must have the same element type.
    pub fn extend_from(&mut self, other: &Values) -> NtupleResult<()> {
        match (self, other) {
            (Self::Fixed { element, bytes }, Self::Fixed { element: e, bytes: b }) if element == e => {
                bytes.extend_from_slice(b);
            }
            (Self::Text(values), Self::Text(v)) => values.extend(v.iter().cloned()),
            (this, other) => ntuple_bail!(
                "cannot append {} elements to {} elements",
                other.element(),
                this.element()
            ),
        }
        Ok(())
    }

    /// A copy of the elements in `[start, start + len)`.
    pub fn slice(&self, start: usize, len: usize) -> NtupleResult<Values> {
        if start + len > self.len() {
            ntuple_bail!(
                "slice [{}, {}) out of bounds for {} elements",
                start,
                start + len,
                self.len()
            );
        }
        Ok(match self {
            Self::Fixed { element, bytes } => {
                let width = element.byte_width().unwrap_or(1);
                Self::Fixed {
                    element: *element,
                    bytes: bytes[start * width..(start + len) * width].to_vec(),
                }
            }
            Self::Text(values) => Self::Text(values[start..start + len].to_vec()),
        })
    }

    /// Overwrite the elements starting at `start` with `src`.
    pub(crate) fn splice_in(&mut self, start: usize, src: &Values) -> NtupleResult<()> {
        if start + src.len() > self.len() {
            ntuple_bail!(
                "splice of {} elements at {} exceeds {} elements",
                src.len(),
                start,
                self.len()
            );
        }
        match (self, src) {
            (Self::Fixed { element, bytes }, Self::Fixed { element: e, bytes: b }) if element == e => {
                let width = element.byte_width().unwrap_or(1);
                bytes[start * width..start * width + b.len()].copy_from_slice(b);
            }
            (Self::Text(values), Self::Text(v)) => {
                values[start..start + v.len()].clone_from_slice(v);
            }
            (this, src) => ntuple_bail!(
                "cannot write {} elements into {} elements",
                src.element(),
                this.element()
            ),
        }
        Ok(())
    }

    /// Empty the run, keeping its allocation.
    pub fn clear(&mut self) {
        match self {
            Self::Fixed { bytes, .. } => bytes.clear(),
            Self::Text(values) => values.clear(),
        }
    }
}

impl<T: NativeElement> From<Vec<T>> for Values {
    fn from(value: Vec<T>) -> Self {
        Self::from_slice(&value)
    }
}

impl From<Vec<String>> for Values {
    fn from(value: Vec<String>) -> Self {
        Self::Text(value)
    }
}
