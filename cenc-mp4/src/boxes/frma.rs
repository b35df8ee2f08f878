use super::TypedBox;
use crate::{Atom, FourCc, Reader, Result};

/// Original format box, the sample entry type before it was renamed to `encv` or `enca`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrmaBox {
    pub original_format: FourCc,
}

impl TypedBox for FrmaBox {
    const KIND: FourCc = *b"frma";

    fn parse(atom: &Atom) -> Result<Self> {
        let mut reader = Reader::new(atom.payload().unwrap_or_default());
        Ok(Self {
            original_format: reader.read_array()?,
        })
    }

    fn to_atom(&self) -> Atom {
        Atom::leaf(&Self::KIND, self.original_format.to_vec())
    }
}
