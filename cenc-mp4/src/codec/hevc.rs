/*
    REFERENCES
    ----------

    1. ITU-T H.265 (V8), 7.3.2.2 seq_parameter_set_rbsp, 7.3.2.3 pic_parameter_set_rbsp,
       7.3.6.1 slice_segment_header, 7.3.7 st_ref_pic_set and 7.4.8 (equations 7-61, 7-62)
    2. ISO/IEC 14496-15, 8.3.3.1 HEVCDecoderConfigurationRecord

*/

use super::{
    BitReader, CodecParser, NaluKind, VideoCodec, bits::ceil_log2, escaped_size,
    skip_scaling_list, unescape,
};
use crate::{Error, Reader, Result};
use log::trace;
use std::collections::HashMap;

const NALU_TYPE_BLA_W_LP: u8 = 16;
const NALU_TYPE_IDR_W_RADL: u8 = 19;
const NALU_TYPE_IDR_N_LP: u8 = 20;
const NALU_TYPE_RSV_IRAP_23: u8 = 23;
const NALU_TYPE_VPS: u8 = 32;
const NALU_TYPE_SPS: u8 = 33;
const NALU_TYPE_PPS: u8 = 34;

const MAX_SPS_ID: u32 = 15;
const MAX_PPS_ID: u32 = 63;
const MAX_SHORT_TERM_REF_PIC_SETS: u32 = 64;
const MAX_LONG_TERM_REF_PICS_SPS: u32 = 32;
const MAX_DPB_SIZE: u32 = 16;

const SLICE_TYPE_B: u32 = 0;
const SLICE_TYPE_P: u32 = 1;

/// Parsed `hvcC` box.
#[derive(Debug, Clone, Default)]
pub struct HevcDecoderConfig {
    pub nalu_length_size: usize,
    /// Every parameter set and SEI NAL unit of the record, in order.
    pub nal_units: Vec<Vec<u8>>,
}

impl HevcDecoderConfig {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        // version, profile tier level, segmentation, parallelism, chroma format,
        // bit depths and average frame rate
        reader.skip(21)?;
        let nalu_length_size = (reader.read_u8()? & 0x03) as usize + 1;
        let mut nal_units = Vec::new();

        for _ in 0..reader.read_u8()? {
            reader.skip(1)?; // array completeness and NAL unit type
            for _ in 0..reader.read_u16()? {
                let size = reader.read_u16()? as usize;
                nal_units.push(reader.read_bytes_u8(size)?);
            }
        }

        Ok(Self {
            nalu_length_size,
            nal_units,
        })
    }
}

#[derive(Debug, Clone, Default)]
struct ShortTermRefPicSet {
    delta_poc_s0: Vec<i32>,
    used_by_curr_pic_s0: Vec<bool>,
    delta_poc_s1: Vec<i32>,
    used_by_curr_pic_s1: Vec<bool>,
}

impl ShortTermRefPicSet {
    fn num_delta_pocs(&self) -> usize {
        self.delta_poc_s0.len() + self.delta_poc_s1.len()
    }

    fn num_used(&self) -> u32 {
        self.used_by_curr_pic_s0
            .iter()
            .chain(&self.used_by_curr_pic_s1)
            .filter(|x| **x)
            .count() as u32
    }

    /// `st_ref_pic_set(idx)`, where `sets` holds the sets parsed before it and
    /// `num_sets` is the sps `num_short_term_ref_pic_sets`.
    fn parse(
        bits: &mut BitReader,
        idx: usize,
        num_sets: usize,
        sets: &[ShortTermRefPicSet],
    ) -> Result<Self> {
        let inter_ref_pic_set_prediction_flag = idx != 0 && bits.read_flag()?;

        if !inter_ref_pic_set_prediction_flag {
            let num_negative_pics = bits.read_ue_max(MAX_DPB_SIZE, "num_negative_pics")?;
            let num_positive_pics = bits.read_ue_max(MAX_DPB_SIZE, "num_positive_pics")?;
            let mut set = Self::default();
            let mut poc = 0i32;

            for _ in 0..num_negative_pics {
                poc -= bits.read_ue_max(1 << 15, "delta_poc_s0_minus1")? as i32 + 1;
                set.delta_poc_s0.push(poc);
                set.used_by_curr_pic_s0.push(bits.read_flag()?);
            }

            poc = 0;

            for _ in 0..num_positive_pics {
                poc += bits.read_ue_max(1 << 15, "delta_poc_s1_minus1")? as i32 + 1;
                set.delta_poc_s1.push(poc);
                set.used_by_curr_pic_s1.push(bits.read_flag()?);
            }

            return Ok(set);
        }

        let delta_idx = if idx == num_sets {
            bits.read_ue_max(idx as u32 - 1, "delta_idx_minus1")? as usize + 1
        } else {
            1
        };
        let delta_rps_sign = bits.read_flag()?;
        let abs_delta_rps = bits.read_ue_max(1 << 15, "abs_delta_rps_minus1")? as i32 + 1;
        let delta_rps = if delta_rps_sign {
            -abs_delta_rps
        } else {
            abs_delta_rps
        };

        let reference = idx
            .checked_sub(delta_idx)
            .and_then(|x| sets.get(x))
            .ok_or_else(|| Error::invalid_format("st_ref_pic_set references a missing set"))?;

        let mut used_by_curr_pic_flag = Vec::with_capacity(reference.num_delta_pocs() + 1);
        let mut use_delta_flag = Vec::with_capacity(reference.num_delta_pocs() + 1);

        for _ in 0..=reference.num_delta_pocs() {
            let used = bits.read_flag()?;
            used_by_curr_pic_flag.push(used);
            use_delta_flag.push(used || bits.read_flag()?);
        }

        let num_negative = reference.delta_poc_s0.len();
        let num_delta = reference.num_delta_pocs();
        let mut set = Self::default();

        for (j, poc) in reference.delta_poc_s1.iter().enumerate().rev() {
            let d_poc = poc + delta_rps;
            if d_poc < 0 && use_delta_flag[num_negative + j] {
                set.delta_poc_s0.push(d_poc);
                set.used_by_curr_pic_s0
                    .push(used_by_curr_pic_flag[num_negative + j]);
            }
        }

        if delta_rps < 0 && use_delta_flag[num_delta] {
            set.delta_poc_s0.push(delta_rps);
            set.used_by_curr_pic_s0.push(used_by_curr_pic_flag[num_delta]);
        }

        for (j, poc) in reference.delta_poc_s0.iter().enumerate() {
            let d_poc = poc + delta_rps;
            if d_poc < 0 && use_delta_flag[j] {
                set.delta_poc_s0.push(d_poc);
                set.used_by_curr_pic_s0.push(used_by_curr_pic_flag[j]);
            }
        }

        for (j, poc) in reference.delta_poc_s0.iter().enumerate().rev() {
            let d_poc = poc + delta_rps;
            if d_poc > 0 && use_delta_flag[j] {
                set.delta_poc_s1.push(d_poc);
                set.used_by_curr_pic_s1.push(used_by_curr_pic_flag[j]);
            }
        }

        if delta_rps > 0 && use_delta_flag[num_delta] {
            set.delta_poc_s1.push(delta_rps);
            set.used_by_curr_pic_s1.push(used_by_curr_pic_flag[num_delta]);
        }

        for (j, poc) in reference.delta_poc_s1.iter().enumerate() {
            let d_poc = poc + delta_rps;
            if d_poc > 0 && use_delta_flag[num_negative + j] {
                set.delta_poc_s1.push(d_poc);
                set.used_by_curr_pic_s1
                    .push(used_by_curr_pic_flag[num_negative + j]);
            }
        }

        Ok(set)
    }
}

#[derive(Debug, Clone, Default)]
struct Sps {
    separate_colour_plane_flag: bool,
    chroma_array_type: u32,
    log2_max_pic_order_cnt_lsb: u32,
    pic_size_in_ctbs: u32,
    sample_adaptive_offset_enabled_flag: bool,
    short_term_ref_pic_sets: Vec<ShortTermRefPicSet>,
    long_term_ref_pics_present_flag: bool,
    used_by_curr_pic_lt_sps_flag: Vec<bool>,
    temporal_mvp_enabled_flag: bool,
}

#[derive(Debug, Clone, Default)]
struct Pps {
    seq_parameter_set_id: u32,
    dependent_slice_segments_enabled_flag: bool,
    output_flag_present_flag: bool,
    num_extra_slice_header_bits: u32,
    cabac_init_present_flag: bool,
    num_ref_idx_l0_default_active_minus1: u32,
    num_ref_idx_l1_default_active_minus1: u32,
    slice_chroma_qp_offsets_present_flag: bool,
    weighted_pred_flag: bool,
    weighted_bipred_flag: bool,
    tiles_enabled_flag: bool,
    entropy_coding_sync_enabled_flag: bool,
    loop_filter_across_slices_enabled_flag: bool,
    deblocking_filter_override_enabled_flag: bool,
    deblocking_filter_disabled_flag: bool,
    lists_modification_present_flag: bool,
    slice_segment_header_extension_present_flag: bool,
    chroma_qp_offset_list_enabled_flag: bool,
}

/// Parameter set tracker for H.265 streams.
#[derive(Debug, Default)]
pub struct HevcParser {
    sps: HashMap<u32, Sps>,
    pps: HashMap<u32, Pps>,
}

fn skip_profile_tier_level(bits: &mut BitReader, max_sub_layers_minus1: u32) -> Result<()> {
    // general profile space, tier, profile idc, compatibility flags,
    // constraint flags and level idc
    bits.skip_bits(96)?;

    let mut sub_layer_profile_present_flag = Vec::new();
    let mut sub_layer_level_present_flag = Vec::new();

    for _ in 0..max_sub_layers_minus1 {
        sub_layer_profile_present_flag.push(bits.read_flag()?);
        sub_layer_level_present_flag.push(bits.read_flag()?);
    }

    if max_sub_layers_minus1 > 0 {
        bits.skip_bits(2 * (8 - max_sub_layers_minus1 as usize))?; // reserved_zero_2bits
    }

    for (profile, level) in sub_layer_profile_present_flag
        .into_iter()
        .zip(sub_layer_level_present_flag)
    {
        if profile {
            bits.skip_bits(88)?;
        }

        if level {
            bits.skip_bits(8)?;
        }
    }

    Ok(())
}

fn skip_scaling_list_data(bits: &mut BitReader) -> Result<()> {
    for size_id in 0..4 {
        let step = if size_id == 3 { 3 } else { 1 };

        for _ in (0..6).step_by(step) {
            if !bits.read_flag()? {
                bits.skip_ue()?; // scaling_list_pred_matrix_id_delta
            } else {
                if size_id > 1 {
                    bits.skip_se()?; // scaling_list_dc_coef_minus8
                }

                skip_scaling_list(bits, 64.min(1 << (4 + (size_id << 1))))?;
            }
        }
    }

    Ok(())
}

impl HevcParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_sps(&mut self, nalu: &[u8]) -> Result<()> {
        let rbsp = unescape(nalu);
        let mut bits = BitReader::new(&rbsp);
        bits.skip_bits(16)?; // nal unit header

        bits.skip_bits(4)?; // sps_video_parameter_set_id
        let max_sub_layers_minus1 = bits.read_bits(3)?;
        bits.skip_bits(1)?; // sps_temporal_id_nesting_flag
        skip_profile_tier_level(&mut bits, max_sub_layers_minus1)?;

        let id = bits.read_ue_max(MAX_SPS_ID, "sps_seq_parameter_set_id")?;
        let mut sps = Sps::default();

        let chroma_format_idc = bits.read_ue_max(3, "chroma_format_idc")?;
        if chroma_format_idc == 3 {
            sps.separate_colour_plane_flag = bits.read_flag()?;
        }
        sps.chroma_array_type = if sps.separate_colour_plane_flag {
            0
        } else {
            chroma_format_idc
        };

        let pic_width = bits.read_ue()? as u64;
        let pic_height = bits.read_ue()? as u64;

        if bits.read_flag()? {
            // conformance window offsets
            for _ in 0..4 {
                bits.skip_ue()?;
            }
        }

        bits.skip_ue()?; // bit_depth_luma_minus8
        bits.skip_ue()?; // bit_depth_chroma_minus8
        sps.log2_max_pic_order_cnt_lsb =
            bits.read_ue_max(12, "log2_max_pic_order_cnt_lsb_minus4")? + 4;

        let sub_layer_ordering_info_present_flag = bits.read_flag()?;
        let first = if sub_layer_ordering_info_present_flag {
            0
        } else {
            max_sub_layers_minus1
        };

        for _ in first..=max_sub_layers_minus1 {
            bits.skip_ue()?; // sps_max_dec_pic_buffering_minus1
            bits.skip_ue()?; // sps_max_num_reorder_pics
            bits.skip_ue()?; // sps_max_latency_increase_plus1
        }

        let log2_min_cb_size = bits.read_ue_max(3, "log2_min_luma_coding_block_size_minus3")? + 3;
        let log2_ctb_size =
            log2_min_cb_size + bits.read_ue_max(3, "log2_diff_max_min_luma_coding_block_size")?;
        let ctb_size = 1u64 << log2_ctb_size;
        let pic_size_in_ctbs = pic_width.div_ceil(ctb_size) * pic_height.div_ceil(ctb_size);
        sps.pic_size_in_ctbs = pic_size_in_ctbs
            .try_into()
            .map_err(|_| Error::invalid_format("sps picture size is too large"))?;

        bits.skip_ue()?; // log2_min_luma_transform_block_size_minus2
        bits.skip_ue()?; // log2_diff_max_min_luma_transform_block_size
        bits.skip_ue()?; // max_transform_hierarchy_depth_inter
        bits.skip_ue()?; // max_transform_hierarchy_depth_intra

        if bits.read_flag()? && bits.read_flag()? {
            // scaling_list_enabled_flag and sps_scaling_list_data_present_flag
            skip_scaling_list_data(&mut bits)?;
        }

        bits.skip_bits(1)?; // amp_enabled_flag
        sps.sample_adaptive_offset_enabled_flag = bits.read_flag()?;

        if bits.read_flag()? {
            // pcm sample bit depths, block sizes and loop filter flag
            bits.skip_bits(8)?;
            bits.skip_ue()?;
            bits.skip_ue()?;
            bits.skip_bits(1)?;
        }

        let num_short_term_ref_pic_sets =
            bits.read_ue_max(MAX_SHORT_TERM_REF_PIC_SETS, "num_short_term_ref_pic_sets")?;

        for i in 0..num_short_term_ref_pic_sets as usize {
            let set = ShortTermRefPicSet::parse(
                &mut bits,
                i,
                num_short_term_ref_pic_sets as usize,
                &sps.short_term_ref_pic_sets,
            )?;
            sps.short_term_ref_pic_sets.push(set);
        }

        sps.long_term_ref_pics_present_flag = bits.read_flag()?;

        if sps.long_term_ref_pics_present_flag {
            let count = bits.read_ue_max(MAX_LONG_TERM_REF_PICS_SPS, "num_long_term_ref_pics_sps")?;

            for _ in 0..count {
                bits.skip_bits(sps.log2_max_pic_order_cnt_lsb as usize)?; // lt_ref_pic_poc_lsb_sps
                sps.used_by_curr_pic_lt_sps_flag.push(bits.read_flag()?);
            }
        }

        sps.temporal_mvp_enabled_flag = bits.read_flag()?;

        trace!("hevc sps {} parsed", id);
        self.sps.insert(id, sps);
        Ok(())
    }

    fn parse_pps(&mut self, nalu: &[u8]) -> Result<()> {
        let rbsp = unescape(nalu);
        let mut bits = BitReader::new(&rbsp);
        bits.skip_bits(16)?; // nal unit header

        let id = bits.read_ue_max(MAX_PPS_ID, "pps_pic_parameter_set_id")?;
        let mut pps = Pps {
            seq_parameter_set_id: bits.read_ue_max(MAX_SPS_ID, "pps_seq_parameter_set_id")?,
            dependent_slice_segments_enabled_flag: bits.read_flag()?,
            output_flag_present_flag: bits.read_flag()?,
            num_extra_slice_header_bits: bits.read_bits(3)?,
            ..Default::default()
        };

        bits.skip_bits(1)?; // sign_data_hiding_enabled_flag
        pps.cabac_init_present_flag = bits.read_flag()?;
        pps.num_ref_idx_l0_default_active_minus1 = bits.read_ue_max(14, "num_ref_idx_l0")?;
        pps.num_ref_idx_l1_default_active_minus1 = bits.read_ue_max(14, "num_ref_idx_l1")?;
        bits.skip_se()?; // init_qp_minus26
        bits.skip_bits(1)?; // constrained_intra_pred_flag
        let transform_skip_enabled_flag = bits.read_flag()?;

        if bits.read_flag()? {
            bits.skip_ue()?; // diff_cu_qp_delta_depth
        }

        bits.skip_se()?; // pps_cb_qp_offset
        bits.skip_se()?; // pps_cr_qp_offset
        pps.slice_chroma_qp_offsets_present_flag = bits.read_flag()?;
        pps.weighted_pred_flag = bits.read_flag()?;
        pps.weighted_bipred_flag = bits.read_flag()?;
        bits.skip_bits(1)?; // transquant_bypass_enabled_flag
        pps.tiles_enabled_flag = bits.read_flag()?;
        pps.entropy_coding_sync_enabled_flag = bits.read_flag()?;

        if pps.tiles_enabled_flag {
            let num_tile_columns_minus1 = bits.read_ue_max(1024, "num_tile_columns_minus1")?;
            let num_tile_rows_minus1 = bits.read_ue_max(1024, "num_tile_rows_minus1")?;

            if !bits.read_flag()? {
                // uniform_spacing_flag is off, explicit column widths and row heights
                for _ in 0..num_tile_columns_minus1 + num_tile_rows_minus1 {
                    bits.skip_ue()?;
                }
            }

            bits.skip_bits(1)?; // loop_filter_across_tiles_enabled_flag
        }

        pps.loop_filter_across_slices_enabled_flag = bits.read_flag()?;

        if bits.read_flag()? {
            // deblocking_filter_control_present_flag
            pps.deblocking_filter_override_enabled_flag = bits.read_flag()?;
            pps.deblocking_filter_disabled_flag = bits.read_flag()?;

            if !pps.deblocking_filter_disabled_flag {
                bits.skip_se()?; // pps_beta_offset_div2
                bits.skip_se()?; // pps_tc_offset_div2
            }
        }

        if bits.read_flag()? {
            skip_scaling_list_data(&mut bits)?;
        }

        pps.lists_modification_present_flag = bits.read_flag()?;
        bits.skip_ue()?; // log2_parallel_merge_level_minus2
        pps.slice_segment_header_extension_present_flag = bits.read_flag()?;

        if bits.read_flag()? {
            // pps_extension_present_flag
            let range_extension_flag = bits.read_flag()?;
            bits.skip_bits(7)?; // multilayer, 3d, scc and 4 bits of extensions

            if range_extension_flag {
                if transform_skip_enabled_flag {
                    bits.skip_ue()?; // log2_max_transform_skip_block_size_minus2
                }

                bits.skip_bits(1)?; // cross_component_prediction_enabled_flag
                pps.chroma_qp_offset_list_enabled_flag = bits.read_flag()?;
            }
        }

        trace!("hevc pps {} parsed", id);
        self.pps.insert(id, pps);
        Ok(())
    }

    /// Number of bits of `slice_segment_header()`, byte alignment included.
    fn slice_segment_header_bits(&self, rbsp: &[u8], nal_unit_type: u8) -> Result<usize> {
        let mut bits = BitReader::new(rbsp);

        let first_slice_segment_in_pic_flag = bits.read_flag()?;

        if (NALU_TYPE_BLA_W_LP..=NALU_TYPE_RSV_IRAP_23).contains(&nal_unit_type) {
            bits.skip_bits(1)?; // no_output_of_prior_pics_flag
        }

        let pps_id = bits.read_ue_max(MAX_PPS_ID, "slice_pic_parameter_set_id")?;
        let pps = self.pps.get(&pps_id).ok_or_else(|| {
            Error::invalid_format(format!("slice references unknown pps {}", pps_id))
        })?;
        let sps = self.sps.get(&pps.seq_parameter_set_id).ok_or_else(|| {
            Error::invalid_format(format!(
                "pps {} references unknown sps {}",
                pps_id, pps.seq_parameter_set_id
            ))
        })?;

        let mut dependent_slice_segment_flag = false;

        if !first_slice_segment_in_pic_flag {
            if pps.dependent_slice_segments_enabled_flag {
                dependent_slice_segment_flag = bits.read_flag()?;
            }

            bits.skip_bits(ceil_log2(sps.pic_size_in_ctbs) as usize)?; // slice_segment_address
        }

        if !dependent_slice_segment_flag {
            bits.skip_bits(pps.num_extra_slice_header_bits as usize)?; // slice_reserved_flag
            let slice_type = bits.read_ue_max(2, "slice_type")?;

            if pps.output_flag_present_flag {
                bits.skip_bits(1)?; // pic_output_flag
            }

            if sps.separate_colour_plane_flag {
                bits.skip_bits(2)?; // colour_plane_id
            }

            let mut slice_temporal_mvp_enabled_flag = false;
            let mut num_pic_total_curr = 0;

            if nal_unit_type != NALU_TYPE_IDR_W_RADL && nal_unit_type != NALU_TYPE_IDR_N_LP {
                bits.skip_bits(sps.log2_max_pic_order_cnt_lsb as usize)?; // slice_pic_order_cnt_lsb

                let num_sets = sps.short_term_ref_pic_sets.len();

                if !bits.read_flag()? {
                    // short_term_ref_pic_set_sps_flag is off, the set is coded here
                    let set = ShortTermRefPicSet::parse(
                        &mut bits,
                        num_sets,
                        num_sets,
                        &sps.short_term_ref_pic_sets,
                    )?;
                    num_pic_total_curr += set.num_used();
                } else {
                    let idx = if num_sets > 1 {
                        bits.read_bits(ceil_log2(num_sets as u32))? as usize
                    } else {
                        0
                    };
                    let set = sps.short_term_ref_pic_sets.get(idx).ok_or_else(|| {
                        Error::invalid_format(format!(
                            "slice references unknown short term ref pic set {}",
                            idx
                        ))
                    })?;
                    num_pic_total_curr += set.num_used();
                }

                if sps.long_term_ref_pics_present_flag {
                    let num_lt_sps = sps.used_by_curr_pic_lt_sps_flag.len() as u32;
                    let num_long_term_sps = if num_lt_sps > 0 {
                        bits.read_ue_max(num_lt_sps, "num_long_term_sps")?
                    } else {
                        0
                    };
                    let num_long_term_pics = bits.read_ue_max(32, "num_long_term_pics")?;

                    for i in 0..num_long_term_sps + num_long_term_pics {
                        let used = if i < num_long_term_sps {
                            let lt_idx_sps = if num_lt_sps > 1 {
                                bits.read_bits(ceil_log2(num_lt_sps))? as usize
                            } else {
                                0
                            };
                            sps.used_by_curr_pic_lt_sps_flag
                                .get(lt_idx_sps)
                                .copied()
                                .ok_or_else(|| Error::invalid_format("lt_idx_sps is out of range"))?
                        } else {
                            bits.skip_bits(sps.log2_max_pic_order_cnt_lsb as usize)?; // poc_lsb_lt
                            bits.read_flag()? // used_by_curr_pic_lt_flag
                        };

                        if used {
                            num_pic_total_curr += 1;
                        }

                        if bits.read_flag()? {
                            bits.skip_ue()?; // delta_poc_msb_cycle_lt
                        }
                    }
                }

                if sps.temporal_mvp_enabled_flag {
                    slice_temporal_mvp_enabled_flag = bits.read_flag()?;
                }
            }

            let mut slice_sao_luma_flag = false;
            let mut slice_sao_chroma_flag = false;

            if sps.sample_adaptive_offset_enabled_flag {
                slice_sao_luma_flag = bits.read_flag()?;

                if sps.chroma_array_type != 0 {
                    slice_sao_chroma_flag = bits.read_flag()?;
                }
            }

            if slice_type == SLICE_TYPE_P || slice_type == SLICE_TYPE_B {
                let mut num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
                let mut num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;

                if bits.read_flag()? {
                    // num_ref_idx_active_override_flag
                    num_ref_idx_l0_active_minus1 =
                        bits.read_ue_max(14, "num_ref_idx_l0_active_minus1")?;

                    if slice_type == SLICE_TYPE_B {
                        num_ref_idx_l1_active_minus1 =
                            bits.read_ue_max(14, "num_ref_idx_l1_active_minus1")?;
                    }
                }

                if pps.lists_modification_present_flag && num_pic_total_curr > 1 {
                    // ref_pic_lists_modification
                    let entry_bits = ceil_log2(num_pic_total_curr) as usize;

                    if bits.read_flag()? {
                        bits.skip_bits(entry_bits * (num_ref_idx_l0_active_minus1 as usize + 1))?;
                    }

                    if slice_type == SLICE_TYPE_B && bits.read_flag()? {
                        bits.skip_bits(entry_bits * (num_ref_idx_l1_active_minus1 as usize + 1))?;
                    }
                }

                if slice_type == SLICE_TYPE_B {
                    bits.skip_bits(1)?; // mvd_l1_zero_flag
                }

                if pps.cabac_init_present_flag {
                    bits.skip_bits(1)?; // cabac_init_flag
                }

                if slice_temporal_mvp_enabled_flag {
                    let collocated_from_l0_flag =
                        slice_type != SLICE_TYPE_B || bits.read_flag()?;

                    if (collocated_from_l0_flag && num_ref_idx_l0_active_minus1 > 0)
                        || (!collocated_from_l0_flag && num_ref_idx_l1_active_minus1 > 0)
                    {
                        bits.skip_ue()?; // collocated_ref_idx
                    }
                }

                if (pps.weighted_pred_flag && slice_type == SLICE_TYPE_P)
                    || (pps.weighted_bipred_flag && slice_type == SLICE_TYPE_B)
                {
                    // pred_weight_table
                    bits.skip_ue()?; // luma_log2_weight_denom

                    if sps.chroma_array_type != 0 {
                        bits.skip_se()?; // delta_chroma_log2_weight_denom
                    }

                    let mut lists = vec![num_ref_idx_l0_active_minus1];
                    if slice_type == SLICE_TYPE_B {
                        lists.push(num_ref_idx_l1_active_minus1);
                    }

                    for num_ref_idx_active_minus1 in lists {
                        let count = num_ref_idx_active_minus1 as usize + 1;
                        let mut luma_weight_flags = Vec::with_capacity(count);
                        let mut chroma_weight_flags = vec![false; count];

                        for _ in 0..count {
                            luma_weight_flags.push(bits.read_flag()?);
                        }

                        if sps.chroma_array_type != 0 {
                            for flag in chroma_weight_flags.iter_mut() {
                                *flag = bits.read_flag()?;
                            }
                        }

                        for (luma, chroma) in luma_weight_flags.into_iter().zip(chroma_weight_flags)
                        {
                            if luma {
                                bits.skip_se()?; // delta_luma_weight
                                bits.skip_se()?; // luma_offset
                            }

                            if chroma {
                                for _ in 0..2 {
                                    bits.skip_se()?; // delta_chroma_weight
                                    bits.skip_se()?; // delta_chroma_offset
                                }
                            }
                        }
                    }
                }

                bits.skip_ue()?; // five_minus_max_num_merge_cand
            }

            bits.skip_se()?; // slice_qp_delta

            if pps.slice_chroma_qp_offsets_present_flag {
                bits.skip_se()?; // slice_cb_qp_offset
                bits.skip_se()?; // slice_cr_qp_offset
            }

            if pps.chroma_qp_offset_list_enabled_flag {
                bits.skip_bits(1)?; // cu_chroma_qp_offset_enabled_flag
            }

            let deblocking_filter_override_flag =
                pps.deblocking_filter_override_enabled_flag && bits.read_flag()?;
            let mut slice_deblocking_filter_disabled_flag = pps.deblocking_filter_disabled_flag;

            if deblocking_filter_override_flag {
                slice_deblocking_filter_disabled_flag = bits.read_flag()?;

                if !slice_deblocking_filter_disabled_flag {
                    bits.skip_se()?; // slice_beta_offset_div2
                    bits.skip_se()?; // slice_tc_offset_div2
                }
            }

            if pps.loop_filter_across_slices_enabled_flag
                && (slice_sao_luma_flag
                    || slice_sao_chroma_flag
                    || !slice_deblocking_filter_disabled_flag)
            {
                bits.skip_bits(1)?; // slice_loop_filter_across_slices_enabled_flag
            }
        }

        if pps.tiles_enabled_flag || pps.entropy_coding_sync_enabled_flag {
            let num_entry_point_offsets = bits.read_ue()? as usize;

            if num_entry_point_offsets > 0 {
                let offset_len = bits.read_ue_max(31, "offset_len_minus1")? as usize + 1;
                let total = num_entry_point_offsets
                    .checked_mul(offset_len)
                    .ok_or_else(|| Error::invalid_format("too many entry points"))?;
                bits.skip_bits(total)?; // entry_point_offset_minus1
            }
        }

        if pps.slice_segment_header_extension_present_flag {
            let length = bits.read_ue_max(256, "slice_segment_header_extension_length")?;
            bits.skip_bits(8 * length as usize)?;
        }

        // byte_alignment(), a one bit followed by zero bits
        if !bits.read_flag()? {
            return Err(Error::invalid_format(
                "slice segment header is not followed by alignment_bit_equal_to_one",
            ));
        }
        bits.byte_align();

        Ok(bits.position())
    }
}

impl CodecParser for HevcParser {
    fn feed(&mut self, nalu: &[u8]) -> Result<NaluKind> {
        let Some(header) = nalu.first() else {
            return Ok(NaluKind::Other);
        };

        match (header >> 1) & 0x3F {
            NALU_TYPE_VPS => Ok(NaluKind::ParameterSet),
            NALU_TYPE_SPS => {
                self.parse_sps(nalu)?;
                Ok(NaluKind::ParameterSet)
            }
            NALU_TYPE_PPS => {
                self.parse_pps(nalu)?;
                Ok(NaluKind::ParameterSet)
            }
            0..=9 | 16..=21 => Ok(NaluKind::Slice),
            _ => Ok(NaluKind::Other),
        }
    }

    fn slice_header_size(&self, nalu: &[u8]) -> Result<usize> {
        if nalu.len() < 2 {
            return Err(Error::invalid_format("truncated NAL unit header"));
        }

        let payload = &nalu[2..];
        let rbsp = unescape(payload);
        let size = self.slice_segment_header_bits(&rbsp, (nalu[0] >> 1) & 0x3F)?;
        Ok(escaped_size(payload, size / 8))
    }

    fn codec(&self) -> VideoCodec {
        VideoCodec::Hevc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::bits::{BitWriter, escape};

    fn nalu(nal_unit_type: u8, rbsp: &[u8]) -> Vec<u8> {
        let mut data = vec![nal_unit_type << 1, 0x01];
        data.extend(escape(rbsp));
        data
    }

    fn sps() -> Vec<u8> {
        let mut w = BitWriter::default();
        w.put(0, 4).put(0, 3).put(1, 1); // vps id, max sub layers, nesting
        w.put(0, 2).put(0, 1).put(1, 5).put(0x6000_0000, 32); // profile
        w.put(0b1001, 4).put(0, 32).put(0, 11).put(0, 1).put(93, 8); // constraints, level
        w.ue(0).ue(1).ue(1280).ue(720).flag(false); // id, chroma 4:2:0, size, no window
        w.ue(0).ue(0).ue(4).flag(true).ue(4).ue(2).ue(0); // bit depths, poc lsb 8 bits, ordering
        w.ue(0).ue(3).ue(0).ue(3).ue(0).ue(0); // 64x64 ctb, transform sizes and depths
        w.flag(false).flag(true).flag(true).flag(false); // scaling, amp, sao, pcm
        w.ue(2); // two short term sets
        w.ue(1).ue(0).ue(0).flag(true); // set 0: {-1}
        w.flag(true).flag(true).ue(0).flag(true).flag(true); // set 1: {-1, -2} from set 0
        w.flag(true).ue(1).put(0, 8).flag(true); // one long term sps picture, used
        w.flag(true).flag(true).flag(false).flag(false); // tmvp, strong intra, no vui, no ext
        w.trailing_bits();
        nalu(NALU_TYPE_SPS, &w.bytes())
    }

    fn pps() -> Vec<u8> {
        let mut w = BitWriter::default();
        w.ue(0).ue(0).flag(true).flag(false).put(1, 3); // ids, dependent slices, 1 extra bit
        w.flag(false).flag(true).ue(0).ue(0).se(0); // sign hiding, cabac init, ref idx, qp
        w.flag(false).flag(false).flag(false).se(0).se(0); // intra, skip, cu qp, cb, cr
        w.flag(true).flag(true).flag(false).flag(false); // chroma offsets, weighted pred
        w.flag(true).flag(false).ue(1).ue(0).flag(true).flag(true); // 2x1 uniform tiles
        w.flag(true); // loop filter across slices
        w.flag(true).flag(true).flag(false).se(0).se(0); // deblocking override enabled
        w.flag(false).flag(true).ue(0).flag(true).flag(false); // lists mod, header ext
        w.trailing_bits();
        nalu(NALU_TYPE_PPS, &w.bytes())
    }

    fn parser() -> HevcParser {
        let mut parser = HevcParser::new();
        assert_eq!(parser.feed(&sps()).unwrap(), NaluKind::ParameterSet);
        assert_eq!(parser.feed(&pps()).unwrap(), NaluKind::ParameterSet);
        parser
    }

    fn check(nal_unit_type: u8, header: &BitWriter) {
        let header_size = header.bytes().len();
        let mut rbsp = header.bytes();
        rbsp.extend_from_slice(&[0x9A, 0x00, 0x00, 0x01, 0x77]);
        let slice = nalu(nal_unit_type, &rbsp);
        let expected = escaped_size(&slice[2..], header_size);

        let mut parser = parser();
        assert_eq!(parser.feed(&slice).unwrap(), NaluKind::Slice);
        assert_eq!(parser.slice_header_size(&slice).unwrap(), expected);
    }

    #[test]
    fn test_hevc_config() {
        let mut data = vec![0; 21];
        data.push(0xFF);
        data.push(2);
        for nal in [sps(), pps()] {
            data.push(0x80 | (nal[0] >> 1));
            data.extend_from_slice(&1u16.to_be_bytes());
            data.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            data.extend_from_slice(&nal);
        }

        let config = HevcDecoderConfig::parse(&data).unwrap();
        assert_eq!(config.nalu_length_size, 4);
        assert_eq!(config.nal_units, vec![sps(), pps()]);
    }

    #[test]
    fn test_idr_slice_header() {
        let mut w = BitWriter::default();
        w.flag(true).flag(false).ue(0); // first slice, no_output_of_prior_pics, pps
        w.put(0, 1).ue(2); // reserved bit, I slice
        w.flag(true).flag(true); // sao luma and chroma
        w.se(2).se(1).se(-1); // qp, cb and cr deltas
        w.flag(false); // no deblocking override
        w.flag(true); // loop filter across slices
        w.ue(1).ue(9).put(300, 10); // one entry point
        w.ue(0); // no header extension
        w.trailing_bits();
        check(NALU_TYPE_IDR_W_RADL, &w);
    }

    #[test]
    fn test_p_slice_header_with_coded_rps() {
        let mut w = BitWriter::default();
        w.flag(false).ue(0).flag(false).put(5, 8); // not first, pps, independent, address
        w.put(0, 1).ue(1).put(3, 8); // reserved bit, P slice, poc lsb
        // inline short term set predicted from set 1 with delta +1
        w.flag(false).flag(true).ue(0).flag(false).ue(0);
        w.flag(true).flag(false).flag(true).flag(true);
        // one long term picture from the sps and one coded in the slice
        w.ue(1).ue(1).flag(false).put(7, 8).flag(false).flag(true).ue(2);
        w.flag(true); // slice tmvp
        w.flag(true).flag(false); // sao luma, no chroma
        w.flag(true).ue(1); // two active references
        w.flag(true).put(1, 1).put(0, 1); // list modification, two 1 bit entries
        w.flag(false); // cabac_init_flag
        w.ue(1); // collocated_ref_idx
        w.ue(2).se(0).flag(true).flag(false).flag(false).flag(true); // weight table flags
        w.se(1).se(-1).se(0).se(0).se(0).se(0); // luma for ref 0, chroma for ref 1
        w.ue(2).se(-3).se(1).se(-1); // merge candidates, qp, cb and cr
        w.flag(true).flag(false).se(0).se(0).flag(true); // deblocking override
        w.ue(1).ue(9).put(100, 10); // one entry point
        w.ue(2).put(0xAA, 8).put(0x55, 8); // header extension
        w.trailing_bits();
        check(1, &w);
    }

    #[test]
    fn test_dependent_slice_segment() {
        let mut w = BitWriter::default();
        w.flag(false).ue(0).flag(true).put(17, 8); // dependent segment at address 17
        w.ue(0); // no entry points
        w.ue(1).put(0x42, 8); // header extension
        w.trailing_bits();
        check(1, &w);
    }

    #[test]
    fn test_inter_rps_derivation() {
        let mut parser = HevcParser::new();
        parser.feed(&sps()).unwrap();
        let sets = &parser.sps[&0].short_term_ref_pic_sets;
        assert_eq!(sets[0].delta_poc_s0, vec![-1]);
        assert_eq!(sets[1].delta_poc_s0, vec![-1, -2]);
        assert_eq!(sets[1].num_used(), 2);
    }
}
