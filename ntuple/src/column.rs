use std::fmt::{Display, Formatter};

use itertools::Itertools;
use ntuple_error::{NtupleResult, ntuple_bail};
use ntuple_store::{ByteOrder, ElementType, MAX_RANK};

/// How a column's fixed-width elements are encoded on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Representation {
    /// The byte order of the writing host.
    #[default]
    Native,
    LittleEndianIeee,
    BigEndianIeee,
}

impl Representation {
    pub fn byte_order(&self) -> ByteOrder {
        match self {
            Representation::Native => ByteOrder::native(),
            Representation::LittleEndianIeee => ByteOrder::Little,
            Representation::BigEndianIeee => ByteOrder::Big,
        }
    }
}

/// The schema of one column: every row holds `product(extents)` elements of one type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnDescriptor {
    name: String,
    element: ElementType,
    extents: Vec<u64>,
    representation: Representation,
    element_size: usize,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, element: ElementType, extents: &[u64]) -> NtupleResult<Self> {
        let name = name.into();
        if name.is_empty() {
            ntuple_bail!("column name must not be empty");
        }
        if extents.is_empty() {
            ntuple_bail!("column {} must have at least one dimension", name);
        }
        if extents.len() + 1 > MAX_RANK {
            ntuple_bail!(
                UnsupportedRank: "column {} has rank {}; at most {} is supported",
                name,
                extents.len(),
                MAX_RANK - 1
            );
        }
        if extents.contains(&0) {
            ntuple_bail!("column {} has a zero extent in {:?}", name, extents);
        }
        Ok(Self {
            element_size: extents.iter().product::<u64>() as usize,
            name,
            element,
            extents: extents.to_vec(),
            representation: Representation::default(),
        })
    }

    /// A column holding one element per row.
    pub fn scalar(name: impl Into<String>, element: ElementType) -> NtupleResult<Self> {
        Self::new(name, element, &[1])
    }

    pub fn with_representation(mut self, representation: Representation) -> Self {
        self.representation = representation;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element(&self) -> ElementType {
        self.element
    }

    pub fn rank(&self) -> usize {
        self.extents.len()
    }

    pub fn extents(&self) -> &[u64] {
        &self.extents
    }

    /// Number of elements in one row of this column.
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn representation(&self) -> Representation {
        self.representation
    }

    /// The byte order the column's dataset is created with.
    pub fn stored_byte_order(&self) -> ByteOrder {
        self.representation.byte_order()
    }
}

impl Display for ColumnDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}[{}]",
            self.name,
            self.element,
            self.extents.iter().join(", ")
        )
    }
}
