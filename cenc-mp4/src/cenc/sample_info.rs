//! Per sample IVs and subsample maps of one track fragment.
//!
//! A table is filled sample by sample while a fragment is encrypted, or read
//! back out of a fragment with [`SampleInfoTable::from_traf`] before it is
//! decrypted. It also has a flat byte layout of its own, see
//! [`SampleInfoTable::serialize`].

use crate::{
    Atom, Error, FourCc, Reader, Result,
    boxes::{PIFF_SENC_UUID, SaioBox, SaizBox, SencBox, TencBox, TrunBox, TypedBox},
};
use log::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleInfoTable {
    sample_count: u32,
    flags: u8,
    crypt_byte_block: u8,
    skip_byte_block: u8,
    iv_size: u8,
    /// `iv_size` bytes per sample.
    iv_data: Vec<u8>,
    bytes_of_cleartext_data: Vec<u16>,
    bytes_of_encrypted_data: Vec<u32>,
    subsample_map_starts: Vec<usize>,
    subsample_map_lengths: Vec<usize>,
}

impl SampleInfoTable {
    pub fn new(
        flags: u8,
        crypt_byte_block: u8,
        skip_byte_block: u8,
        sample_count: u32,
        iv_size: u8,
    ) -> Self {
        Self {
            sample_count,
            flags,
            crypt_byte_block,
            skip_byte_block,
            iv_size,
            iv_data: vec![0; iv_size as usize * sample_count as usize],
            bytes_of_cleartext_data: Vec::new(),
            bytes_of_encrypted_data: Vec::new(),
            subsample_map_starts: Vec::new(),
            subsample_map_lengths: Vec::new(),
        }
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn crypt_byte_block(&self) -> u8 {
        self.crypt_byte_block
    }

    pub fn skip_byte_block(&self) -> u8 {
        self.skip_byte_block
    }

    pub fn iv_size(&self) -> u8 {
        self.iv_size
    }

    fn iv_slot(&self, sample_index: u32) -> Result<usize> {
        self.check_index(sample_index)?;
        Ok(sample_index as usize * self.iv_size as usize)
    }

    fn check_index(&self, sample_index: u32) -> Result<()> {
        if sample_index >= self.sample_count {
            return Err(Error::out_of_range(format!(
                "sample {} of a table with {} samples",
                sample_index, self.sample_count
            )));
        }

        Ok(())
    }

    pub fn get_iv(&self, sample_index: u32) -> Result<&[u8]> {
        let offset = self.iv_slot(sample_index)?;
        Ok(&self.iv_data[offset..offset + self.iv_size as usize])
    }

    /// Store the IV of a sample. `iv` must be exactly `iv_size` bytes long.
    pub fn set_iv(&mut self, sample_index: u32, iv: &[u8]) -> Result<()> {
        if iv.len() != self.iv_size as usize {
            return Err(Error::invalid_parameters(format!(
                "{} byte IV given to a table of {} byte IVs",
                iv.len(),
                self.iv_size
            )));
        }

        let offset = self.iv_slot(sample_index)?;
        self.iv_data[offset..offset + iv.len()].copy_from_slice(iv);
        Ok(())
    }

    /// Append the subsample map of the next sample. `data` holds
    /// `subsample_count` pairs of `u16 clear, u32 encrypted` sizes.
    pub fn add_subsample_data(&mut self, subsample_count: u16, data: &[u8]) -> Result<()> {
        let mut reader = Reader::new(data);
        let mut subsamples = Vec::with_capacity(subsample_count as usize);

        for _ in 0..subsample_count {
            subsamples.push((reader.read_u16()?, reader.read_u32()?));
        }

        self.push_subsamples(&subsamples);
        Ok(())
    }

    fn push_subsamples(&mut self, subsamples: &[(u16, u32)]) {
        self.subsample_map_starts
            .push(self.bytes_of_cleartext_data.len());
        self.subsample_map_lengths.push(subsamples.len());

        for (cleartext_size, encrypted_size) in subsamples {
            self.bytes_of_cleartext_data.push(*cleartext_size);
            self.bytes_of_encrypted_data.push(*encrypted_size);
        }
    }

    pub fn has_subsample_info(&self) -> bool {
        !self.subsample_map_starts.is_empty()
    }

    /// Subsample count with the clear and encrypted sizes of a sample. A
    /// sample without a map is encrypted as a whole and gets no entries.
    pub fn get_sample_info(&self, sample_index: u32) -> Result<(usize, &[u16], &[u32])> {
        self.check_index(sample_index)?;
        let index = sample_index as usize;

        match (
            self.subsample_map_starts.get(index),
            self.subsample_map_lengths.get(index),
        ) {
            (Some(start), Some(length)) => Ok((
                *length,
                &self.bytes_of_cleartext_data[*start..*start + *length],
                &self.bytes_of_encrypted_data[*start..*start + *length],
            )),
            _ => Ok((0, &[], &[])),
        }
    }

    /// Size of the auxiliary record of a sample, its IV plus its subsample map.
    pub fn sample_info_size(&self, sample_index: u32) -> Result<usize> {
        let (subsample_count, _, _) = self.get_sample_info(sample_index)?;
        let map_size = if self.has_subsample_info() {
            2 + subsample_count * 6
        } else {
            0
        };

        Ok(self.iv_size as usize + map_size)
    }

    /// Sample encryption box holding every record of the table.
    pub fn to_senc(&self) -> Result<SencBox> {
        let mut senc = SencBox::new(self.has_subsample_info());

        for index in 0..self.sample_count {
            let (count, cleartext, encrypted) = self.get_sample_info(index)?;
            let mut info = Vec::new();

            if self.has_subsample_info() {
                let count = u16::try_from(count).map_err(|_| {
                    Error::not_supported(format!(
                        "sample {} has {} subsamples, more than a senc record holds",
                        index, count
                    ))
                })?;
                info.extend_from_slice(&count.to_be_bytes());

                for (x, y) in cleartext.iter().zip(encrypted) {
                    info.extend_from_slice(&x.to_be_bytes());
                    info.extend_from_slice(&y.to_be_bytes());
                }
            }

            senc.add_sample_info(self.get_iv(index)?, &info);
        }

        Ok(senc)
    }

    /// Rebuild the table of a protected track fragment, from its sample
    /// encryption box or else from its `saio`/`saiz` boxes.
    ///
    /// The `saio` offsets point into `aux_data` and are relative to
    /// `aux_base`, which is the fragment's base data offset.
    pub fn from_traf(
        traf: &Atom,
        tenc: &TencBox,
        scheme_type: &FourCc,
        aux_data: &[u8],
        aux_base: u64,
    ) -> Result<Self> {
        let senc = match traf.child(&SencBox::KIND) {
            Some(atom) => Some(SencBox::parse(atom)),
            None => traf.uuid_child(&PIFF_SENC_UUID).map(SencBox::parse_piff),
        };

        let senc_error = match senc.map(|x| x.and_then(|senc| Self::from_senc(&senc, tenc))) {
            Some(Ok(table)) => return Ok(table),
            Some(Err(e)) if e.is_invalid_format() => Some(e),
            Some(Err(e)) => return Err(e),
            None => None,
        };

        let (Some(saio), Some(saiz)) = (SaioBox::from_child(traf)?, SaizBox::from_child(traf)?)
        else {
            return Err(senc_error.unwrap_or_else(|| {
                Error::invalid_format("track fragment has no sample encryption information")
            }));
        };

        if let Some(e) = senc_error {
            trace!("reading sample auxiliary information instead of senc: {}", e);
        }

        for aux_info_type in [saio.aux_info_type, saiz.aux_info_type].into_iter().flatten() {
            if aux_info_type.0 != [0; 4] && aux_info_type.0 != *scheme_type {
                return Err(Error::invalid_format(format!(
                    "auxiliary information of type {} in a {} track",
                    String::from_utf8_lossy(&aux_info_type.0),
                    String::from_utf8_lossy(scheme_type)
                )));
            }
        }

        Self::from_aux_info(traf, &saio, &saiz, tenc, aux_data, aux_base)
    }

    /// Table from a `senc` (or PIFF) sample encryption box. Tracks with a
    /// constant IV store it for every sample.
    pub fn from_senc(senc: &SencBox, tenc: &TencBox) -> Result<Self> {
        let iv_size = senc.iv_size(tenc.default_per_sample_iv_size);
        let samples = senc.samples(iv_size)?;
        let constant_iv = constant_iv(tenc, iv_size)?;

        let mut table = Self::new(
            (senc.flags & 0xFF) as u8,
            tenc.default_crypt_byte_block,
            tenc.default_skip_byte_block,
            senc.sample_count,
            constant_iv.map_or(iv_size, |x| x.len() as u8),
        );

        for (index, sample) in samples.iter().enumerate() {
            table.set_iv(index as u32, constant_iv.unwrap_or(&sample.iv))?;

            if senc.has_subsamples() {
                let subsamples = sample
                    .subsamples
                    .iter()
                    .map(|x| (x.bytes_of_clear_data, x.bytes_of_encrypted_data))
                    .collect::<Vec<_>>();
                table.push_subsamples(&subsamples);
            }
        }

        Ok(table)
    }

    /// Table from the records `saio` and `saiz` point at.
    pub fn from_aux_info(
        traf: &Atom,
        saio: &SaioBox,
        saiz: &SaizBox,
        tenc: &TencBox,
        aux_data: &[u8],
        aux_base: u64,
    ) -> Result<Self> {
        let iv_size = tenc.default_per_sample_iv_size as usize;
        let constant_iv = constant_iv(tenc, iv_size as u8)?;
        let truns = traf
            .children_of(&TrunBox::KIND)
            .map(TrunBox::parse)
            .collect::<Result<Vec<_>>>()?;

        if saio.offsets.is_empty() || (saio.offsets.len() > 1 && saio.offsets.len() != truns.len())
        {
            return Err(Error::invalid_format(format!(
                "saio box has {} offsets for {} track runs",
                saio.offsets.len(),
                truns.len()
            )));
        }

        let mut records = Vec::new();
        let mut has_subsamples = false;
        let mut position = 0;

        for (trun_index, trun) in truns.iter().enumerate() {
            if trun_index == 0 || saio.offsets.len() > 1 {
                position = aux_base
                    .checked_add(saio.offsets[trun_index])
                    .and_then(|x| usize::try_from(x).ok())
                    .ok_or_else(|| Error::invalid_format("saio offset overflows"))?;
            }

            for _ in 0..trun.sample_count() {
                let size = saiz.sample_info_size(records.len())? as usize;
                let record = aux_data.get(position..position + size).ok_or_else(|| {
                    Error::invalid_format(format!(
                        "{} byte auxiliary record at {} is out of bounds",
                        size, position
                    ))
                })?;
                position += size;

                if size < iv_size {
                    return Err(Error::invalid_format(format!(
                        "{} byte auxiliary record cannot hold a {} byte IV",
                        size, iv_size
                    )));
                }

                let mut reader = Reader::new(&record[iv_size..]);
                let mut subsamples = Vec::new();

                if reader.has_more_data() {
                    has_subsamples = true;

                    for _ in 0..reader.read_u16()? {
                        subsamples.push((reader.read_u16()?, reader.read_u32()?));
                    }
                }

                records.push((&record[..iv_size], subsamples));
            }
        }

        let mut table = Self::new(
            if has_subsamples {
                SencBox::FLAG_USE_SUBSAMPLE_ENCRYPTION as u8
            } else {
                0
            },
            tenc.default_crypt_byte_block,
            tenc.default_skip_byte_block,
            records.len() as u32,
            constant_iv.map_or(iv_size as u8, |x| x.len() as u8),
        );

        for (index, (iv, subsamples)) in records.iter().enumerate() {
            table.set_iv(index as u32, constant_iv.unwrap_or(iv))?;

            // every sample needs an entry once any sample has a map
            if has_subsamples {
                table.push_subsamples(subsamples);
            }
        }

        Ok(table)
    }

    /// Flat big-endian layout of the table:
    ///
    /// ```text
    /// u32 sample_count
    /// u8  flags, crypt_byte_block, skip_byte_block, iv_size
    ///     iv_size * sample_count bytes of IVs
    /// u32 entry_count
    ///     entry_count u16 clear sizes
    ///     entry_count u32 encrypted sizes
    /// u32 has_subsamples
    ///     sample_count u32 map starts, sample_count u32 map lengths (if set)
    /// ```
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let expected_iv_data = self.iv_size as usize * self.sample_count as usize;

        if self.iv_data.len() != expected_iv_data
            || self.bytes_of_cleartext_data.len() != self.bytes_of_encrypted_data.len()
            || self.subsample_map_starts.len() != self.subsample_map_lengths.len()
            || (self.has_subsample_info()
                && self.subsample_map_starts.len() != self.sample_count as usize)
        {
            return Err(Error::internal("sample info table is inconsistent"));
        }

        let to_u32 = |x: usize| {
            u32::try_from(x).map_err(|_| Error::internal("sample info table is too large"))
        };

        let mut data = Vec::with_capacity(
            16 + self.iv_data.len()
                + self.bytes_of_cleartext_data.len() * 6
                + self.subsample_map_starts.len() * 8,
        );
        data.extend_from_slice(&self.sample_count.to_be_bytes());
        data.extend_from_slice(&[
            self.flags,
            self.crypt_byte_block,
            self.skip_byte_block,
            self.iv_size,
        ]);
        data.extend_from_slice(&self.iv_data);
        data.extend_from_slice(&to_u32(self.bytes_of_cleartext_data.len())?.to_be_bytes());

        for x in &self.bytes_of_cleartext_data {
            data.extend_from_slice(&x.to_be_bytes());
        }

        for x in &self.bytes_of_encrypted_data {
            data.extend_from_slice(&x.to_be_bytes());
        }

        data.extend_from_slice(&(self.has_subsample_info() as u32).to_be_bytes());

        if self.has_subsample_info() {
            for x in &self.subsample_map_starts {
                data.extend_from_slice(&to_u32(*x)?.to_be_bytes());
            }

            for x in &self.subsample_map_lengths {
                data.extend_from_slice(&to_u32(*x)?.to_be_bytes());
            }
        }

        Ok(data)
    }

    /// Parse the layout written by [`serialize`](Self::serialize).
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);

        let sample_count = reader.read_u32().map_err(truncated)?;
        let [flags, crypt_byte_block, skip_byte_block, iv_size] =
            reader.read_array().map_err(truncated)?;
        let mut table = Self::new(flags, crypt_byte_block, skip_byte_block, 0, iv_size);
        table.sample_count = sample_count;
        table.iv_data = reader
            .read_bytes_u8(iv_size as usize * sample_count as usize)
            .map_err(truncated)?;

        let entry_count = reader.read_u32().map_err(truncated)? as usize;

        if reader.remaining() < entry_count as u64 * 6 {
            return Err(Error::out_of_range("serialized sample info table is truncated"));
        }

        for _ in 0..entry_count {
            table
                .bytes_of_cleartext_data
                .push(reader.read_u16().map_err(truncated)?);
        }

        for _ in 0..entry_count {
            table
                .bytes_of_encrypted_data
                .push(reader.read_u32().map_err(truncated)?);
        }

        if reader.read_u32().map_err(truncated)? != 0 {
            if reader.remaining() < sample_count as u64 * 8 {
                return Err(Error::out_of_range("serialized sample info table is truncated"));
            }

            for _ in 0..sample_count {
                table
                    .subsample_map_starts
                    .push(reader.read_u32().map_err(truncated)? as usize);
            }

            for _ in 0..sample_count {
                table
                    .subsample_map_lengths
                    .push(reader.read_u32().map_err(truncated)? as usize);
            }

            let out_of_bounds = table
                .subsample_map_starts
                .iter()
                .zip(&table.subsample_map_lengths)
                .any(|(start, length)| start + length > entry_count);

            if out_of_bounds {
                return Err(Error::invalid_format(
                    "serialized subsample map points past its entries",
                ));
            }
        }

        Ok(table)
    }
}

fn truncated(_: Error) -> Error {
    Error::out_of_range("serialized sample info table is truncated")
}

fn constant_iv(tenc: &TencBox, iv_size: u8) -> Result<Option<&[u8]>> {
    if iv_size != 0 {
        return Ok(None);
    }

    match tenc.default_constant_iv.as_deref() {
        Some(iv) if !iv.is_empty() => Ok(Some(iv)),
        _ => Err(Error::invalid_format(
            "track has neither per sample IVs nor a constant IV",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::TrunSample;

    fn tenc(iv_size: u8, constant_iv: Option<Vec<u8>>) -> TencBox {
        TencBox {
            version: 1,
            default_is_protected: 1,
            default_crypt_byte_block: if constant_iv.is_some() { 1 } else { 0 },
            default_skip_byte_block: if constant_iv.is_some() { 9 } else { 0 },
            default_per_sample_iv_size: iv_size,
            default_kid: [0xAA; 16],
            default_constant_iv: constant_iv,
        }
    }

    fn table_with_subsamples() -> SampleInfoTable {
        let mut table = SampleInfoTable::new(2, 0, 0, 2, 8);
        table.set_iv(0, &[1; 8]).unwrap();
        table.set_iv(1, &[2; 8]).unwrap();
        table
            .add_subsample_data(2, &[0, 100, 0, 0, 0, 200, 0, 50, 0, 0, 0, 150])
            .unwrap();
        table.add_subsample_data(1, &[0, 7, 0, 0, 0, 32]).unwrap();
        table
    }

    #[test]
    fn test_ivs_and_subsamples() {
        let table = table_with_subsamples();
        assert_eq!(table.get_iv(1).unwrap(), &[2; 8]);
        assert!(matches!(table.get_iv(2), Err(Error::OutOfRange(_))));

        let (count, cleartext, encrypted) = table.get_sample_info(0).unwrap();
        assert_eq!(count, 2);
        assert_eq!(cleartext, &[100, 50]);
        assert_eq!(encrypted, &[200, 150]);
        assert_eq!(table.get_sample_info(1).unwrap().1, &[7]);
        assert!(matches!(table.get_sample_info(2), Err(Error::OutOfRange(_))));
        assert_eq!(table.sample_info_size(0).unwrap(), 8 + 2 + 12);
    }

    #[test]
    fn test_empty_table() {
        let mut table = SampleInfoTable::new(0, 1, 9, 0, 16);
        assert!(matches!(table.get_iv(0), Err(Error::OutOfRange(_))));
        assert!(matches!(table.get_iv(5), Err(Error::OutOfRange(_))));
        assert!(matches!(table.set_iv(0, &[3; 16]), Err(Error::OutOfRange(_))));
        assert!(matches!(table.get_sample_info(0), Err(Error::OutOfRange(_))));

        let data = table.serialize().unwrap();
        assert_eq!(data, [0, 0, 0, 0, 0, 1, 9, 16, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(SampleInfoTable::deserialize(&data).unwrap(), table);
        assert_eq!(
            SampleInfoTable::deserialize(&[0, 0, 0, 0, 0, 0, 0, 16, 0, 0, 0, 0, 0, 0, 0, 0])
                .unwrap()
                .sample_count(),
            0
        );
    }

    #[test]
    fn test_serialization_round_trip() {
        for table in [table_with_subsamples(), {
            let mut table = SampleInfoTable::new(0, 0, 0, 3, 16);
            table.set_iv(2, &[9; 16]).unwrap();
            table
        }] {
            let data = table.serialize().unwrap();
            assert_eq!(SampleInfoTable::deserialize(&data).unwrap(), table);
        }
    }

    #[test]
    fn test_serialized_layout() {
        let data = table_with_subsamples().serialize().unwrap();
        assert_eq!(&data[..8], &[0, 0, 0, 2, 2, 0, 0, 8]);
        // ivs, 3 entries, has subsamples, starts [0, 2], lengths [2, 1]
        assert_eq!(&data[24..28], &[0, 0, 0, 3]);
        assert_eq!(
            &data[46..],
            &[0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 2, 0, 0, 0, 1]
        );
    }

    #[test]
    fn test_truncated_buffer_is_out_of_range() {
        let data = table_with_subsamples().serialize().unwrap();

        for size in [0, 3, 7, 20, 30, data.len() - 1] {
            assert!(matches!(
                SampleInfoTable::deserialize(&data[..size]),
                Err(Error::OutOfRange(_))
            ));
        }
    }

    #[test]
    fn test_inconsistent_table_is_internal() {
        let mut table = table_with_subsamples();
        table.subsample_map_lengths.pop();
        assert!(matches!(table.serialize(), Err(Error::Internal(_))));
    }

    #[test]
    fn test_from_senc_with_constant_iv() {
        let mut senc = SencBox::new(true);
        senc.add_sample_info(&[], &[0, 1, 0, 10, 0, 0, 0, 64]);
        senc.add_sample_info(&[], &[0, 0]);

        let table = SampleInfoTable::from_senc(&senc, &tenc(0, Some(vec![4; 16]))).unwrap();
        assert_eq!(table.sample_count(), 2);
        assert_eq!(table.get_iv(1).unwrap(), &[4; 16]);
        assert_eq!((table.crypt_byte_block(), table.skip_byte_block()), (1, 9));
        assert_eq!(table.get_sample_info(0).unwrap().2, &[64]);
        assert_eq!(table.get_sample_info(1).unwrap().0, 0);

        assert!(
            SampleInfoTable::from_senc(&senc, &tenc(0, None))
                .unwrap_err()
                .is_invalid_format()
        );
    }

    fn traf(senc: Option<&SencBox>, sample_count: usize, aux_offset: u64) -> Atom {
        let trun = TrunBox {
            version: 0,
            flags: TrunBox::FLAG_SAMPLE_SIZE_PRESENT,
            data_offset: None,
            first_sample_flags: None,
            samples: vec![
                TrunSample {
                    sample_size: Some(10),
                    ..Default::default()
                };
                sample_count
            ],
        };

        let mut saiz = SaizBox::new();
        for _ in 0..sample_count {
            saiz.add_sample_info_size(8);
        }

        let mut children = vec![trun.to_atom(), saiz.to_atom(), SaioBox::new(aux_offset).to_atom()];
        children.extend(senc.map(|x| x.to_atom()));
        Atom::container(b"traf", children)
    }

    #[test]
    fn test_from_traf_falls_back_to_aux_info() {
        let mut senc = SencBox::new(false);
        senc.add_sample_info(&[1; 8], &[]);
        senc.add_sample_info(&[2; 8], &[]);
        senc.sample_count = 3;

        let mut aux_data = vec![0; 10];
        aux_data.extend_from_slice(&[1; 8]);
        aux_data.extend_from_slice(&[2; 8]);

        let traf = traf(Some(&senc), 2, 6);
        let table = SampleInfoTable::from_traf(&traf, &tenc(8, None), b"cenc", &aux_data, 4)
            .unwrap();
        assert_eq!(table.sample_count(), 2);
        assert_eq!(table.get_iv(0).unwrap(), &[1; 8]);
        assert_eq!(table.get_iv(1).unwrap(), &[2; 8]);
        assert!(!table.has_subsample_info());
    }

    #[test]
    fn test_from_traf_without_information() {
        let traf = Atom::container(b"traf", vec![]);
        assert!(
            SampleInfoTable::from_traf(&traf, &tenc(8, None), b"cenc", &[], 0)
                .unwrap_err()
                .is_invalid_format()
        );

        let traf = self::traf(None, 2, 100);
        assert!(
            SampleInfoTable::from_traf(&traf, &tenc(8, None), b"cenc", &[0; 50], 0)
                .unwrap_err()
                .is_invalid_format()
        );
    }

    #[test]
    fn test_to_senc() {
        let senc = table_with_subsamples().to_senc().unwrap();
        assert!(senc.has_subsamples());
        assert_eq!(senc.sample_count, 2);
        assert_eq!(senc.sample_info_data.len(), 8 + 2 + 12 + 8 + 2 + 6);
    }

    #[test]
    fn test_to_senc_with_too_many_subsamples() {
        let mut table = SampleInfoTable::new(2, 0, 0, 1, 8);
        table.push_subsamples(&vec![(1, 0); u16::MAX as usize + 1]);
        assert!(table.to_senc().unwrap_err().is_not_supported());
    }
}
