use super::TypedBox;
use crate::{Atom, FourCc, Reader, Result, atom::full_box_payload};

/// Handler reference box. Only the handler type is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HdlrBox {
    pub handler_type: FourCc,
    name: Vec<u8>,
}

impl HdlrBox {
    pub fn is_video(&self) -> bool {
        &self.handler_type == b"vide"
    }

    pub fn is_audio(&self) -> bool {
        &self.handler_type == b"soun"
    }
}

impl TypedBox for HdlrBox {
    const KIND: FourCc = *b"hdlr";

    fn parse(atom: &Atom) -> Result<Self> {
        let mut reader = Reader::new(atom.payload().unwrap_or_default());
        reader.skip(4)?; // version and flags
        reader.skip(4)?; // pre defined
        let handler_type = reader.read_array()?;
        reader.skip(12)?; // reserved
        Ok(Self {
            handler_type,
            name: reader.read_rest().to_vec(),
        })
    }

    fn to_atom(&self) -> Atom {
        let mut payload = vec![0; 4];
        payload.extend_from_slice(&self.handler_type);
        payload.extend_from_slice(&[0; 12]);
        payload.extend_from_slice(&self.name);
        Atom::leaf(&Self::KIND, full_box_payload(0, 0, &payload))
    }
}
