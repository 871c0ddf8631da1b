use ntuple_store::{ElementType, NativeElement};

/// The value of one column in one inserted row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    /// No value: the row is filled with the column's default elements.
    Default,
    /// Fixed-width elements in native byte order.
    Fixed { element: ElementType, bytes: Vec<u8> },
    Text(Vec<String>),
}

impl Cell {
    pub fn from_slice<T: NativeElement>(values: &[T]) -> Self {
        let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
        values.iter().for_each(|v| v.write_ne(&mut bytes));
        Cell::Fixed {
            element: T::ELEMENT,
            bytes,
        }
    }

    /// The element type, or `None` for [`Cell::Default`].
    pub fn element(&self) -> Option<ElementType> {
        match self {
            Cell::Default => None,
            Cell::Fixed { element, .. } => Some(*element),
            Cell::Text(_) => Some(ElementType::Text),
        }
    }

    /// Number of elements, or `None` for [`Cell::Default`].
    pub fn len(&self) -> Option<usize> {
        match self {
            Cell::Default => None,
            Cell::Fixed { element, bytes } => Some(bytes.len() / element.byte_width().unwrap_or(1)),
            Cell::Text(values) => Some(values.len()),
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Cell::Default)
    }
}

macro_rules! cell_from_native {
    ($($T:ty),+) => {
        $(
            impl From<$T> for Cell {
                fn from(value: $T) -> Self {
                    Cell::from_slice(&[value])
                }
            }

            impl From<&[$T]> for Cell {
                fn from(values: &[$T]) -> Self {
                    Cell::from_slice(values)
                }
            }

            impl<const N: usize> From<[$T; N]> for Cell {
                fn from(values: [$T; N]) -> Self {
                    Cell::from_slice(&values)
                }
            }

            impl<const N: usize> From<&[$T; N]> for Cell {
                fn from(values: &[$T; N]) -> Self {
                    Cell::from_slice(values)
                }
            }

            impl From<Vec<$T>> for Cell {
                fn from(values: Vec<$T>) -> Self {
                    Cell::from_slice(&values)
                }
            }
        )+
    };
}

cell_from_native!(bool, i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(vec![value.to_string()])
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(vec![value])
    }
}

impl From<&[&str]> for Cell {
    fn from(values: &[&str]) -> Self {
        Cell::Text(values.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Cell {
    fn from(values: [&str; N]) -> Self {
        Cell::from(&values[..])
    }
}

impl From<&[String]> for Cell {
    fn from(values: &[String]) -> Self {
        Cell::Text(values.to_vec())
    }
}

impl From<Vec<String>> for Cell {
    fn from(values: Vec<String>) -> Self {
        Cell::Text(values)
    }
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(value: Option<T>) -> Self {
        value.map_or(Cell::Default, Into::into)
    }
}

/// Build a row of [`Cell`]s, one per column.
///
/// ```
/// use ntuple::{Cell, row};
///
/// let row = row![1u32, [0.5f64, 1.5], "muon", Cell::Default];
/// assert_eq!(row.len(), 4);
/// assert!(row[3].is_default());
/// ```
#[macro_export]
macro_rules! row {
    ($($value:expr),* $(,)?) => {
        [$($crate::Cell::from($value)),*]
    };
}
