//! High-level common encryption decrypting processor.
//!
//! Restores the clear form of files protected with any of the [`CencVariant`]s.

use super::{
    decrypter::SingleSampleDecrypter,
    fragment::{DataBase, fragment_layout, rewrite_data_offsets, to_data_offset},
    sample_decrypter::SampleDecrypter,
    sample_info::SampleInfoTable,
    variant::{CencVariant, CipherMode, CipherParams},
};
use crate::{
    Atom, Error, FourCc, Result, atom_offsets,
    boxes::{
        FrmaBox, PIFF_SENC_UUID, SaioBox, SaizBox, SchmBox, SencBox, TencBox, TfhdBox, TkhdBox,
        TrexBox, TypedBox,
    },
    parse_atoms,
};
use log::{debug, trace, warn};
use std::{collections::HashMap, path::Path};

/// Builder for creating [`CencDecryptingProcessor`] instances.
///
/// # Example
///
/// ```no_run
/// use cenc_mp4::CencDecryptingProcessor;
///
/// let processor = CencDecryptingProcessor::builder()
///     .key("eb676abbcb345e96bbcf616630f1a3da", "100b6c20940f779a4589152b57d2dacb")?
///     .track_key(2, "2ca3d2cb4a7c8a6d9a7e0f1b2c3d4e5f")?
///     .build()?;
/// # Ok::<(), cenc_mp4::Error>(())
/// ```
#[derive(Default)]
pub struct CencDecryptingProcessorBuilder {
    keys: HashMap<[u8; 16], [u8; 16]>,
    track_keys: HashMap<u32, [u8; 16]>,
}

impl CencDecryptingProcessorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a KID/key pair.
    ///
    /// # Arguments
    ///
    /// * `kid` - The Key ID as a 32-character hexadecimal string (16 bytes)
    /// * `key` - The decryption key as a 32-character hexadecimal string (16 bytes)
    pub fn key(mut self, kid: &str, key: &str) -> Result<Self> {
        self.keys.insert(parse_hex_16(kid)?, parse_hex_16(key)?);
        Ok(self)
    }

    pub fn key_bytes(mut self, kid: [u8; 16], key: [u8; 16]) -> Self {
        self.keys.insert(kid, key);
        self
    }

    /// Add multiple KID/key pairs from a HashMap.
    pub fn keys(mut self, keys: &HashMap<String, String>) -> Result<Self> {
        for (kid, key) in keys {
            self.keys.insert(parse_hex_16(kid)?, parse_hex_16(key)?);
        }
        Ok(self)
    }

    /// Add a key for a track ID. It takes precedence over the KID of the track.
    pub fn track_key(mut self, track_id: u32, key: &str) -> Result<Self> {
        self.track_keys.insert(track_id, parse_hex_16(key)?);
        Ok(self)
    }

    pub fn build(self) -> Result<CencDecryptingProcessor> {
        if self.keys.is_empty() && self.track_keys.is_empty() {
            return Err(Error::invalid_parameters("no keys were provided"));
        }

        Ok(CencDecryptingProcessor {
            keys: self.keys,
            track_keys: self.track_keys,
        })
    }
}

/// Decrypting processor for protected fragmented mp4 data.
///
/// # Example
///
/// ```no_run
/// use cenc_mp4::CencDecryptingProcessor;
/// use std::fs;
///
/// let processor = CencDecryptingProcessor::builder()
///     .key("eb676abbcb345e96bbcf616630f1a3da", "100b6c20940f779a4589152b57d2dacb")?
///     .build()?;
///
/// let init_data = fs::read("init.mp4")?;
/// let segment_data = fs::read("segment.m4s")?;
/// fs::write("init_dec.mp4", processor.decrypt_init(&init_data)?)?;
/// fs::write("segment_dec.m4s", processor.decrypt(&segment_data, Some(&init_data))?)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
///
/// # Thread Safety
///
/// Every call builds its own track state, so a processor can be shared across
/// threads with `Arc<CencDecryptingProcessor>`.
pub struct CencDecryptingProcessor {
    keys: HashMap<[u8; 16], [u8; 16]>,
    track_keys: HashMap<u32, [u8; 16]>,
}

impl CencDecryptingProcessor {
    pub fn builder() -> CencDecryptingProcessorBuilder {
        CencDecryptingProcessorBuilder::new()
    }

    /// Decrypt protected mp4 data.
    ///
    /// # Arguments
    ///
    /// * `input_data` - A media segment, or a complete file when `init_data` is `None`
    /// * `init_data` - Optional initialization segment which describes the tracks of
    ///   `input_data`. It is only read, the output holds the decrypted input alone.
    pub fn decrypt<T: AsRef<[u8]>>(&self, input_data: T, init_data: Option<T>) -> Result<Vec<u8>> {
        let mut state = DecryptionState::new(self);

        if let Some(init) = init_data.as_ref() {
            for moov in parse_atoms(init.as_ref())?.iter().filter(|x| x.is(b"moov")) {
                state.read_moov(moov)?;
            }
        }

        state.process(input_data.as_ref())
    }

    /// Remove the protection scheme boxes from an initialization segment.
    pub fn decrypt_init<T: AsRef<[u8]>>(&self, init_data: T) -> Result<Vec<u8>> {
        DecryptionState::new(self).process(init_data.as_ref())
    }

    /// Decrypt protected mp4 data read from files.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use cenc_mp4::CencDecryptingProcessor;
    ///
    /// let processor = CencDecryptingProcessor::builder()
    ///     .key("eb676abbcb345e96bbcf616630f1a3da", "100b6c20940f779a4589152b57d2dacb")?
    ///     .build()?;
    ///
    /// let decrypted = processor.decrypt_file("segment.m4s", Some("init.mp4"))?;
    /// let decrypted = processor.decrypt_file("encrypted.mp4", None)?;
    /// # Ok::<(), cenc_mp4::Error>(())
    /// ```
    pub fn decrypt_file<P: AsRef<Path>>(
        &self,
        segment_path: P,
        init_path: Option<P>,
    ) -> Result<Vec<u8>> {
        let segment_data = std::fs::read(segment_path.as_ref())?;
        let init_data = init_path.map(|x| std::fs::read(x.as_ref())).transpose()?;
        self.decrypt(&segment_data, init_data.as_ref())
    }

    /// Decrypt protected mp4 data read from files and write it to `output_path`.
    ///
    /// Returns the number of bytes written.
    pub fn decrypt_file_to_file<P: AsRef<Path>>(
        &self,
        segment_path: P,
        init_path: Option<P>,
        output_path: P,
    ) -> Result<usize> {
        let decrypted = self.decrypt_file(segment_path, init_path)?;
        std::fs::write(output_path.as_ref(), &decrypted)?;
        Ok(decrypted.len())
    }

    /// Key for a track, looked up by its track ID first and then by its KID.
    pub fn get_key(&self, track_id: u32, kid: &[u8; 16]) -> Option<&[u8; 16]> {
        self.track_keys
            .get(&track_id)
            .or_else(|| self.keys.get(kid))
    }
}

/// A protected sample description of a track.
struct ProtectedEntry {
    scheme_type: FourCc,
    variant: CencVariant,
    tenc: TencBox,
    params: CipherParams,
    passthrough: bool,
    key: Option<[u8; 16]>,
}

struct DecryptionState<'a> {
    processor: &'a CencDecryptingProcessor,
    /// Sample descriptions by track, `None` for the ones in the clear.
    tracks: HashMap<u32, Vec<Option<ProtectedEntry>>>,
    trex: HashMap<u32, TrexBox>,
}

impl<'a> DecryptionState<'a> {
    fn new(processor: &'a CencDecryptingProcessor) -> Self {
        Self {
            processor,
            tracks: HashMap::new(),
            trex: HashMap::new(),
        }
    }

    fn process(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut atoms = parse_atoms(input)?;
        let offsets = atom_offsets(&atoms, 0);
        let sizes = atoms.iter().map(|x| x.size()).collect::<Vec<_>>();
        let mut data = input.to_vec();
        // bytes removed so far from the boxes before the current one
        let mut shrink = 0;

        for (atom, offset) in atoms.iter_mut().zip(&offsets) {
            let kind = atom.kind;
            let size = atom.size();

            match &kind {
                b"moov" => {
                    self.read_moov(atom)?;
                    self.strip_moov(atom)?;
                }
                b"moof" => {
                    if self.tracks.is_empty() {
                        warn!(
                            "no track information for the fragment at {}, it is copied as is",
                            offset
                        );
                        continue;
                    }

                    self.decrypt_fragment(atom, *offset, input, &mut data, shrink)?;
                }
                _ => continue,
            }

            shrink += size - atom.size();
        }

        let mut output = Vec::with_capacity(data.len());

        for ((atom, offset), size) in atoms.iter().zip(offsets).zip(sizes) {
            if matches!(&atom.kind, b"moov" | b"moof") {
                atom.write(&mut output);
            } else {
                output.extend_from_slice(&data[offset as usize..(offset + size) as usize]);
            }
        }

        Ok(output)
    }

    fn read_moov(&mut self, moov: &Atom) -> Result<()> {
        if let Some(mvex) = moov.child(b"mvex") {
            for trex in mvex.children_of(&TrexBox::KIND) {
                let trex = TrexBox::parse(trex)?;
                self.trex.insert(trex.track_id, trex);
            }
        }

        for trak in moov.children_of(b"trak") {
            let track_id = TkhdBox::from_child(trak)?
                .ok_or_else(|| Error::invalid_format("trak box has no tkhd box"))?
                .track_id;

            let Some(stsd) = trak.find("mdia/minf/stbl/stsd") else {
                continue;
            };

            let mut entries = Vec::with_capacity(stsd.children().len());

            for entry in stsd.children() {
                entries.push(match entry.child(b"sinf") {
                    Some(sinf) => Some(self.protected_entry(track_id, sinf)?),
                    None => None,
                });
            }

            self.tracks.insert(track_id, entries);
        }

        Ok(())
    }

    fn protected_entry(&self, track_id: u32, sinf: &Atom) -> Result<ProtectedEntry> {
        FrmaBox::from_child(sinf)?
            .ok_or_else(|| Error::invalid_format("sinf box has no frma box"))?;
        let schm = SchmBox::from_child(sinf)?
            .ok_or_else(|| Error::invalid_format("sinf box has no schm box"))?;
        let tenc = match sinf.child(b"schi") {
            Some(schi) => TencBox::from_schi(schi)?,
            None => None,
        }
        .ok_or_else(|| Error::invalid_format("sinf box has no track encryption box"))?;

        let is_piff = &schm.scheme_type == b"piff";
        let variant = CencVariant::from_scheme(
            &schm.scheme_type,
            schm.scheme_version,
            is_piff.then_some(tenc.default_is_protected),
        )?;
        let params = decrypt_params(variant, &tenc)?;
        let key = self
            .processor
            .get_key(track_id, &tenc.default_kid)
            .copied();

        if key.is_none() {
            warn!(
                "no key for track {} with KID {}, it stays encrypted",
                track_id,
                tenc.default_kid_hex()
            );
        } else {
            debug!(
                "track {} is {} with {} byte IVs",
                track_id, variant, params.iv_size
            );
        }

        Ok(ProtectedEntry {
            scheme_type: schm.scheme_type,
            variant,
            passthrough: tenc.default_is_protected == 0,
            tenc,
            params,
            key,
        })
    }

    /// Put the original format back on every sample description which can be decrypted.
    fn strip_moov(&self, moov: &mut Atom) -> Result<()> {
        for trak in moov.children_mut()?.iter_mut().filter(|x| x.is(b"trak")) {
            let Some(track_id) = TkhdBox::from_child(trak)?.map(|x| x.track_id) else {
                continue;
            };
            let Some(entries) = self.tracks.get(&track_id) else {
                continue;
            };
            let Some(stsd) = trak.find_mut("mdia/minf/stbl/stsd") else {
                continue;
            };

            for (entry, protected) in stsd.children_mut()?.iter_mut().zip(entries) {
                if protected.as_ref().is_none_or(|x| x.key.is_none()) {
                    continue;
                }

                if let Some(sinf) = entry.remove_child(b"sinf")
                    && let Some(frma) = FrmaBox::from_child(&sinf)?
                {
                    entry.kind = frma.original_format;
                }
            }
        }

        Ok(())
    }

    fn decrypt_fragment(
        &self,
        moof: &mut Atom,
        moof_start: u64,
        input: &[u8],
        data: &mut [u8],
        shrink: u64,
    ) -> Result<()> {
        let original_size = moof.size();
        let layouts = fragment_layout(moof, moof_start, input.len(), &self.trex)?;
        let trafs = moof.children_mut()?.iter_mut().filter(|x| x.is(b"traf"));

        for (traf, layout) in trafs.zip(&layouts) {
            let track_id = layout.tfhd.track_id;
            let entry = self
                .tracks
                .get(&track_id)
                .and_then(|x| x.get((layout.sample_description_index as usize).checked_sub(1)?))
                .and_then(|x| x.as_ref());

            let Some(entry) = entry else {
                trace!("track {} fragment at {} is in the clear", track_id, moof_start);
                continue;
            };

            let Some(key) = entry.key else {
                continue;
            };

            if entry.passthrough {
                trace!("track {} fragment at {} is not protected", track_id, moof_start);
            } else {
                let table = SampleInfoTable::from_traf(
                    traf,
                    &entry.tenc,
                    &entry.scheme_type,
                    input,
                    layout.base_offset,
                )?;

                if table.sample_count() as usize != layout.samples.len() {
                    return Err(Error::invalid_format(format!(
                        "track {} fragment has {} samples but encryption information for {}",
                        track_id,
                        layout.samples.len(),
                        table.sample_count()
                    )));
                }

                let mut decrypter = match entry.variant {
                    CencVariant::PiffCtr | CencVariant::PiffCbc => SampleDecrypter::new(
                        SingleSampleDecrypter::from_algorithm_id(
                            entry.tenc.default_is_protected,
                            &key,
                        )?,
                        table,
                    ),
                    _ => SampleDecrypter::create(&entry.params, &key, table)?,
                };

                for (index, (offset, size)) in layout.samples.iter().enumerate() {
                    let range = *offset..*offset + *size;
                    let sample =
                        decrypter.decrypt_sample_data(index as u32, &input[range.clone()])?;
                    data[range].copy_from_slice(&sample);
                }

                trace!(
                    "track {} fragment at {} has {} decrypted samples",
                    track_id,
                    moof_start,
                    layout.samples.len()
                );
            }

            traf.remove_children_where(|x| {
                x.is(&SaioBox::KIND)
                    || x.is(&SaizBox::KIND)
                    || x.is(&SencBox::KIND)
                    || x.is_uuid(&PIFF_SENC_UUID)
            });
        }

        let moof_shrink = (original_size - moof.size()) as i64;
        let total_shrink = shrink as i64 + moof_shrink;
        let trafs = moof.children_mut()?.iter_mut().filter(|x| x.is(b"traf"));

        for (traf, layout) in trafs.zip(&layouts) {
            match layout.base {
                DataBase::Moof if moof_shrink > 0 => {
                    rewrite_data_offsets(traf, |_, x| {
                        x.map(|x| to_data_offset(x as i64 - moof_shrink)).transpose()
                    })?;
                }
                DataBase::Explicit if total_shrink > 0 => {
                    let mut tfhd = layout.tfhd.clone();
                    tfhd.base_data_offset = Some(layout.base_offset - total_shrink as u64);

                    if let Some(child) = traf.child_mut(&TfhdBox::KIND) {
                        *child = tfhd.to_atom();
                    }
                }
                _ => (),
            }
        }

        Ok(())
    }
}

/// Cipher parameters of a protected track, as read from its track encryption box.
fn decrypt_params(variant: CencVariant, tenc: &TencBox) -> Result<CipherParams> {
    let iv_size = tenc.default_per_sample_iv_size;

    if !matches!(iv_size, 0 | 8 | 16) {
        return Err(Error::invalid_format(format!(
            "per sample IV size {} is not one of 0, 8 or 16",
            iv_size
        )));
    }

    // a pattern needs both block counts, anything else decrypts every block
    let (crypt_byte_block, skip_byte_block) =
        if tenc.default_crypt_byte_block != 0 && tenc.default_skip_byte_block != 0 {
            (tenc.default_crypt_byte_block, tenc.default_skip_byte_block)
        } else {
            (0, 0)
        };

    let mode = variant.mode();

    CipherParams::new(
        mode,
        iv_size,
        crypt_byte_block,
        skip_byte_block,
        iv_size == 0,
        variant == CencVariant::MpegCbcs && mode == CipherMode::Cbc,
    )
}

/// Parse a 16-byte hex string.
pub(crate) fn parse_hex_16(input: &str) -> Result<[u8; 16]> {
    let bytes = hex::decode(input)?;
    let len = bytes.len();

    bytes.try_into().map_err(|_| {
        Error::invalid_parameters(format!("expected 16 bytes of hex, got {} bytes", len))
    })
}
