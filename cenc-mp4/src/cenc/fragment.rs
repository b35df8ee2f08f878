//! Where the samples of a movie fragment live, and how the track run offsets
//! follow the `moof` box when it changes size.

use crate::{
    Atom, Error, Result,
    boxes::{TfhdBox, TrexBox, TrunBox, TypedBox},
};
use std::collections::HashMap;

/// What the data offsets of a track fragment are relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DataBase {
    /// Start of the enclosing `moof` box.
    Moof,
    /// End of the data of the previous track fragment.
    PreviousData,
    /// Explicit `base_data_offset` from the start of the file.
    Explicit,
}

#[derive(Debug, Clone)]
pub(crate) struct TrafLayout {
    pub(crate) tfhd: TfhdBox,
    pub(crate) base: DataBase,
    /// Absolute offset the data offsets of the fragment are relative to.
    pub(crate) base_offset: u64,
    /// 1-based index into the `stsd` entries of the track.
    pub(crate) sample_description_index: u32,
    /// First sample of every run, relative to the `moof` start.
    pub(crate) run_starts: Vec<i64>,
    /// Absolute offset and size of every sample.
    pub(crate) samples: Vec<(usize, usize)>,
}

/// Locate the samples of every track fragment in `moof`, which starts at
/// `moof_start` within a buffer of `data_size` bytes.
pub(crate) fn fragment_layout(
    moof: &Atom,
    moof_start: u64,
    data_size: usize,
    trex: &HashMap<u32, TrexBox>,
) -> Result<Vec<TrafLayout>> {
    let mut layouts = Vec::new();
    let mut previous_end = None;

    for (index, traf) in moof.children_of(b"traf").enumerate() {
        let tfhd = TfhdBox::from_child(traf)?
            .ok_or_else(|| Error::invalid_format("traf box has no tfhd box"))?;
        let trex = trex.get(&tfhd.track_id);

        let (base, base_offset) = match tfhd.base_data_offset {
            Some(offset) => (DataBase::Explicit, offset as i64),
            None if tfhd.default_base_is_moof() || index == 0 => {
                (DataBase::Moof, moof_start as i64)
            }
            None => (
                DataBase::PreviousData,
                previous_end.unwrap_or(moof_start as i64),
            ),
        };

        let mut run_starts = Vec::new();
        let mut samples = Vec::new();
        let mut position = base_offset;

        for trun in traf.children_of(&TrunBox::KIND) {
            let trun = TrunBox::parse(trun)?;

            if let Some(data_offset) = trun.data_offset {
                position = base_offset + data_offset as i64;
            }

            run_starts.push(position - moof_start as i64);

            for sample in &trun.samples {
                let size = sample
                    .sample_size
                    .or(tfhd.default_sample_size)
                    .or(trex.map(|x| x.default_sample_size))
                    .ok_or_else(|| {
                        Error::invalid_format(format!(
                            "track {} has a sample without a size",
                            tfhd.track_id
                        ))
                    })? as i64;

                if position < 0 || position + size > data_size as i64 {
                    return Err(Error::invalid_format(format!(
                        "{} byte sample at offset {} is outside the {} byte input",
                        size, position, data_size
                    )));
                }

                samples.push((position as usize, size as usize));
                position += size;
            }
        }

        previous_end = Some(position);
        layouts.push(TrafLayout {
            sample_description_index: tfhd
                .sample_description_index
                .or(trex.map(|x| x.default_sample_description_index))
                .unwrap_or(1),
            tfhd,
            base,
            base_offset: base_offset.max(0) as u64,
            run_starts,
            samples,
        });
    }

    Ok(layouts)
}

/// Rewrite the data offset of every track run in `traf` through `f`, which
/// gets the run index and its current offset.
pub(crate) fn rewrite_data_offsets(
    traf: &mut Atom,
    mut f: impl FnMut(usize, Option<i32>) -> Result<Option<i32>>,
) -> Result<()> {
    let mut run_index = 0;

    for child in traf.children_mut()? {
        if !child.is(&TrunBox::KIND) {
            continue;
        }

        let mut trun = TrunBox::parse(child)?;
        let data_offset = f(run_index, trun.data_offset)?;

        if data_offset != trun.data_offset {
            trun.data_offset = data_offset;
            *child = trun.to_atom();
        }

        run_index += 1;
    }

    Ok(())
}

/// Narrow a data offset to the 32 bits a track run can hold.
pub(crate) fn to_data_offset(offset: i64) -> Result<i32> {
    i32::try_from(offset).map_err(|_| {
        Error::not_supported(format!("data offset {} does not fit in a track run", offset))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::TrunSample;

    fn traf(tfhd: TfhdBox, data_offset: Option<i32>, sizes: &[u32]) -> Atom {
        let trun = TrunBox {
            version: 0,
            flags: TrunBox::FLAG_SAMPLE_SIZE_PRESENT
                | data_offset.map_or(0, |_| TrunBox::FLAG_DATA_OFFSET_PRESENT),
            data_offset,
            first_sample_flags: None,
            samples: sizes
                .iter()
                .map(|x| TrunSample {
                    sample_size: Some(*x),
                    ..Default::default()
                })
                .collect(),
        };

        Atom::container(b"traf", vec![tfhd.to_atom(), trun.to_atom()])
    }

    fn tfhd(track_id: u32, flags: u32) -> TfhdBox {
        TfhdBox {
            flags,
            track_id,
            base_data_offset: None,
            sample_description_index: None,
            default_sample_duration: None,
            default_sample_size: None,
            default_sample_flags: None,
        }
    }

    #[test]
    fn test_layout_bases() {
        let moof = Atom::container(
            b"moof",
            vec![
                traf(tfhd(1, 0), Some(100), &[10, 20]),
                traf(tfhd(2, 0), None, &[5]),
                traf(tfhd(3, TfhdBox::FLAG_DEFAULT_BASE_IS_MOOF), Some(200), &[7]),
            ],
        );
        let trex = HashMap::from([(
            2,
            TrexBox {
                track_id: 2,
                default_sample_description_index: 2,
                default_sample_duration: 0,
                default_sample_size: 0,
                default_sample_flags: 0,
            },
        )]);

        let layouts = fragment_layout(&moof, 1000, 2000, &trex).unwrap();
        assert_eq!(layouts[0].base, DataBase::Moof);
        assert_eq!(layouts[0].samples, vec![(1100, 10), (1110, 20)]);
        assert_eq!(layouts[1].base, DataBase::PreviousData);
        assert_eq!(layouts[1].samples, vec![(1130, 5)]);
        assert_eq!(layouts[1].run_starts, vec![130]);
        assert_eq!(layouts[1].base_offset, 1130);
        assert_eq!(layouts[1].sample_description_index, 2);
        assert_eq!(layouts[2].samples, vec![(1200, 7)]);
        assert_eq!(layouts[2].sample_description_index, 1);

        assert!(
            fragment_layout(&moof, 1000, 1150, &trex)
                .unwrap_err()
                .is_invalid_format()
        );
    }

    #[test]
    fn test_rewrite_data_offsets() {
        let mut traf = traf(tfhd(1, 0), None, &[10]);
        rewrite_data_offsets(&mut traf, |_, x| Ok(Some(x.unwrap_or(0) + 24))).unwrap();

        let trun = TrunBox::from_child(&traf).unwrap().unwrap();
        assert_eq!(trun.data_offset, Some(24));
        assert_ne!(trun.flags & TrunBox::FLAG_DATA_OFFSET_PRESENT, 0);
    }
}
