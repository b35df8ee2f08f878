/*
    REFERENCES
    ----------

    1. ITU-T H.264 (08/2021), 7.3.2.1.1 seq_parameter_set_data, 7.3.2.2 pic_parameter_set_rbsp
       and 7.3.3 slice_header
    2. ISO/IEC 14496-15, 5.3.3.1 AVCDecoderConfigurationRecord

*/

use super::{
    BitReader, CodecParser, NaluKind, VideoCodec, bits::ceil_log2, escaped_size,
    skip_scaling_list, unescape,
};
use crate::{Error, Reader, Result};
use log::trace;
use std::collections::HashMap;

const NALU_TYPE_NON_IDR_SLICE: u8 = 1;
const NALU_TYPE_IDR_SLICE: u8 = 5;
const NALU_TYPE_SPS: u8 = 7;
const NALU_TYPE_PPS: u8 = 8;

const MAX_SPS_ID: u32 = 31;
const MAX_PPS_ID: u32 = 255;
const MAX_SLICE_GROUPS: u32 = 256;
const MAX_REF_FRAMES_IN_PIC_ORDER_CNT_CYCLE: u32 = 255;

const SLICE_TYPE_P: u32 = 0;
const SLICE_TYPE_B: u32 = 1;
const SLICE_TYPE_I: u32 = 2;
const SLICE_TYPE_SP: u32 = 3;
const SLICE_TYPE_SI: u32 = 4;

/// Parsed `avcC` box.
#[derive(Debug, Clone, Default)]
pub struct AvcDecoderConfig {
    pub nalu_length_size: usize,
    pub sequence_parameter_sets: Vec<Vec<u8>>,
    pub picture_parameter_sets: Vec<Vec<u8>>,
}

impl AvcDecoderConfig {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        reader.skip(4)?; // version, profile, compatibility and level
        let nalu_length_size = (reader.read_u8()? & 0x03) as usize + 1;

        let mut sequence_parameter_sets = Vec::new();
        for _ in 0..(reader.read_u8()? & 0x1F) {
            let size = reader.read_u16()? as usize;
            sequence_parameter_sets.push(reader.read_bytes_u8(size)?);
        }

        let mut picture_parameter_sets = Vec::new();
        for _ in 0..reader.read_u8()? {
            let size = reader.read_u16()? as usize;
            picture_parameter_sets.push(reader.read_bytes_u8(size)?);
        }

        Ok(Self {
            nalu_length_size,
            sequence_parameter_sets,
            picture_parameter_sets,
        })
    }
}

#[derive(Debug, Clone, Default)]
struct Sps {
    chroma_array_type: u32,
    separate_colour_plane_flag: bool,
    log2_max_frame_num: u32,
    pic_order_cnt_type: u32,
    log2_max_pic_order_cnt_lsb: u32,
    delta_pic_order_always_zero_flag: bool,
    frame_mbs_only_flag: bool,
    pic_size_in_map_units: u32,
}

#[derive(Debug, Clone, Default)]
struct Pps {
    seq_parameter_set_id: u32,
    entropy_coding_mode_flag: bool,
    bottom_field_pic_order_in_frame_present_flag: bool,
    num_slice_groups_minus1: u32,
    slice_group_map_type: u32,
    slice_group_change_rate: u32,
    num_ref_idx_l0_default_active_minus1: u32,
    num_ref_idx_l1_default_active_minus1: u32,
    weighted_pred_flag: bool,
    weighted_bipred_idc: u32,
    deblocking_filter_control_present_flag: bool,
    redundant_pic_cnt_present_flag: bool,
}

/// Parameter set tracker for H.264 streams.
#[derive(Debug, Default)]
pub struct AvcParser {
    sps: HashMap<u32, Sps>,
    pps: HashMap<u32, Pps>,
}

impl AvcParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_sps(&mut self, nalu: &[u8]) -> Result<()> {
        let rbsp = unescape(nalu);
        let mut bits = BitReader::new(&rbsp);
        bits.skip_bits(8)?; // nal unit header

        let profile_idc = bits.read_bits(8)?;
        bits.skip_bits(8)?; // constraint flags and reserved bits
        bits.skip_bits(8)?; // level_idc
        let id = bits.read_ue_max(MAX_SPS_ID, "seq_parameter_set_id")?;

        let mut sps = Sps {
            chroma_array_type: 1,
            ..Default::default()
        };

        if matches!(
            profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            let chroma_format_idc = bits.read_ue_max(3, "chroma_format_idc")?;

            if chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = bits.read_flag()?;
            }

            sps.chroma_array_type = if sps.separate_colour_plane_flag {
                0
            } else {
                chroma_format_idc
            };

            bits.skip_ue()?; // bit_depth_luma_minus8
            bits.skip_ue()?; // bit_depth_chroma_minus8
            bits.skip_bits(1)?; // qpprime_y_zero_transform_bypass_flag

            if bits.read_flag()? {
                let count = if chroma_format_idc != 3 { 8 } else { 12 };

                for i in 0..count {
                    if bits.read_flag()? {
                        skip_scaling_list(&mut bits, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        sps.log2_max_frame_num = bits.read_ue_max(12, "log2_max_frame_num_minus4")? + 4;
        sps.pic_order_cnt_type = bits.read_ue_max(2, "pic_order_cnt_type")?;

        if sps.pic_order_cnt_type == 0 {
            sps.log2_max_pic_order_cnt_lsb =
                bits.read_ue_max(12, "log2_max_pic_order_cnt_lsb_minus4")? + 4;
        } else if sps.pic_order_cnt_type == 1 {
            sps.delta_pic_order_always_zero_flag = bits.read_flag()?;
            bits.skip_se()?; // offset_for_non_ref_pic
            bits.skip_se()?; // offset_for_top_to_bottom_field
            let cycle = bits.read_ue_max(
                MAX_REF_FRAMES_IN_PIC_ORDER_CNT_CYCLE,
                "num_ref_frames_in_pic_order_cnt_cycle",
            )?;

            for _ in 0..cycle {
                bits.skip_se()?; // offset_for_ref_frame
            }
        }

        bits.skip_ue()?; // max_num_ref_frames
        bits.skip_bits(1)?; // gaps_in_frame_num_value_allowed_flag
        let pic_width_in_mbs = bits.read_ue()? as u64 + 1;
        let pic_height_in_map_units = bits.read_ue()? as u64 + 1;
        sps.frame_mbs_only_flag = bits.read_flag()?;
        sps.pic_size_in_map_units = (pic_width_in_mbs * pic_height_in_map_units)
            .try_into()
            .map_err(|_| Error::invalid_format("sps picture size is too large"))?;

        trace!("avc sps {} parsed", id);
        self.sps.insert(id, sps);
        Ok(())
    }

    fn parse_pps(&mut self, nalu: &[u8]) -> Result<()> {
        let rbsp = unescape(nalu);
        let mut bits = BitReader::new(&rbsp);
        bits.skip_bits(8)?; // nal unit header

        let id = bits.read_ue_max(MAX_PPS_ID, "pic_parameter_set_id")?;
        let mut pps = Pps {
            seq_parameter_set_id: bits.read_ue_max(MAX_SPS_ID, "seq_parameter_set_id")?,
            entropy_coding_mode_flag: bits.read_flag()?,
            bottom_field_pic_order_in_frame_present_flag: bits.read_flag()?,
            num_slice_groups_minus1: bits
                .read_ue_max(MAX_SLICE_GROUPS - 1, "num_slice_groups_minus1")?,
            ..Default::default()
        };

        if pps.num_slice_groups_minus1 > 0 {
            pps.slice_group_map_type = bits.read_ue_max(6, "slice_group_map_type")?;

            match pps.slice_group_map_type {
                0 => {
                    for _ in 0..=pps.num_slice_groups_minus1 {
                        bits.skip_ue()?; // run_length_minus1
                    }
                }
                2 => {
                    for _ in 0..pps.num_slice_groups_minus1 {
                        bits.skip_ue()?; // top_left
                        bits.skip_ue()?; // bottom_right
                    }
                }
                3..=5 => {
                    bits.skip_bits(1)?; // slice_group_change_direction_flag
                    pps.slice_group_change_rate = bits.read_ue()?.saturating_add(1);
                }
                6 => {
                    let pic_size_in_map_units = bits.read_ue()? as usize + 1;
                    let id_bits = ceil_log2(pps.num_slice_groups_minus1 + 1) as usize;
                    bits.skip_bits(pic_size_in_map_units * id_bits)?;
                }
                _ => (),
            }
        }

        pps.num_ref_idx_l0_default_active_minus1 = bits.read_ue_max(31, "num_ref_idx_l0")?;
        pps.num_ref_idx_l1_default_active_minus1 = bits.read_ue_max(31, "num_ref_idx_l1")?;
        pps.weighted_pred_flag = bits.read_flag()?;
        pps.weighted_bipred_idc = bits.read_bits(2)?;
        bits.skip_se()?; // pic_init_qp_minus26
        bits.skip_se()?; // pic_init_qs_minus26
        bits.skip_se()?; // chroma_qp_index_offset
        pps.deblocking_filter_control_present_flag = bits.read_flag()?;
        bits.skip_bits(1)?; // constrained_intra_pred_flag
        pps.redundant_pic_cnt_present_flag = bits.read_flag()?;

        trace!("avc pps {} parsed", id);
        self.pps.insert(id, pps);
        Ok(())
    }

    /// Number of bits in the slice header of a coded slice NAL unit, NAL header excluded.
    fn slice_header_bits(&self, rbsp: &[u8], nal_unit_type: u8, nal_ref_idc: u8) -> Result<usize> {
        let mut bits = BitReader::new(rbsp);

        bits.skip_ue()?; // first_mb_in_slice
        let slice_type = bits.read_ue_max(9, "slice_type")? % 5;
        let pps_id = bits.read_ue_max(MAX_PPS_ID, "pic_parameter_set_id")?;
        let pps = self.pps.get(&pps_id).ok_or_else(|| {
            Error::invalid_format(format!("slice references unknown pps {}", pps_id))
        })?;
        let sps = self.sps.get(&pps.seq_parameter_set_id).ok_or_else(|| {
            Error::invalid_format(format!(
                "pps {} references unknown sps {}",
                pps_id, pps.seq_parameter_set_id
            ))
        })?;

        if sps.separate_colour_plane_flag {
            bits.skip_bits(2)?; // colour_plane_id
        }

        bits.skip_bits(sps.log2_max_frame_num as usize)?; // frame_num

        let mut field_pic_flag = false;
        if !sps.frame_mbs_only_flag {
            field_pic_flag = bits.read_flag()?;

            if field_pic_flag {
                bits.skip_bits(1)?; // bottom_field_flag
            }
        }

        if nal_unit_type == NALU_TYPE_IDR_SLICE {
            bits.skip_ue()?; // idr_pic_id
        }

        if sps.pic_order_cnt_type == 0 {
            bits.skip_bits(sps.log2_max_pic_order_cnt_lsb as usize)?; // pic_order_cnt_lsb

            if pps.bottom_field_pic_order_in_frame_present_flag && !field_pic_flag {
                bits.skip_se()?; // delta_pic_order_cnt_bottom
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            bits.skip_se()?; // delta_pic_order_cnt[0]

            if pps.bottom_field_pic_order_in_frame_present_flag && !field_pic_flag {
                bits.skip_se()?; // delta_pic_order_cnt[1]
            }
        }

        if pps.redundant_pic_cnt_present_flag {
            bits.skip_ue()?; // redundant_pic_cnt
        }

        if slice_type == SLICE_TYPE_B {
            bits.skip_bits(1)?; // direct_spatial_mv_pred_flag
        }

        let mut num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
        let mut num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;

        if matches!(slice_type, SLICE_TYPE_P | SLICE_TYPE_SP | SLICE_TYPE_B)
            && bits.read_flag()?
        {
            // num_ref_idx_active_override_flag
            num_ref_idx_l0_active_minus1 = bits.read_ue_max(31, "num_ref_idx_l0_active_minus1")?;

            if slice_type == SLICE_TYPE_B {
                num_ref_idx_l1_active_minus1 =
                    bits.read_ue_max(31, "num_ref_idx_l1_active_minus1")?;
            }
        }

        // ref_pic_list_modification
        if slice_type != SLICE_TYPE_I && slice_type != SLICE_TYPE_SI {
            skip_ref_pic_list_modification(&mut bits)?;
        }

        if slice_type == SLICE_TYPE_B {
            skip_ref_pic_list_modification(&mut bits)?;
        }

        if (pps.weighted_pred_flag && matches!(slice_type, SLICE_TYPE_P | SLICE_TYPE_SP))
            || (pps.weighted_bipred_idc == 1 && slice_type == SLICE_TYPE_B)
        {
            // pred_weight_table
            bits.skip_ue()?; // luma_log2_weight_denom

            if sps.chroma_array_type != 0 {
                bits.skip_ue()?; // chroma_log2_weight_denom
            }

            let mut lists = vec![num_ref_idx_l0_active_minus1];
            if slice_type == SLICE_TYPE_B {
                lists.push(num_ref_idx_l1_active_minus1);
            }

            for num_ref_idx_active_minus1 in lists {
                for _ in 0..=num_ref_idx_active_minus1 {
                    if bits.read_flag()? {
                        bits.skip_se()?; // luma_weight
                        bits.skip_se()?; // luma_offset
                    }

                    if sps.chroma_array_type != 0 && bits.read_flag()? {
                        for _ in 0..2 {
                            bits.skip_se()?; // chroma_weight
                            bits.skip_se()?; // chroma_offset
                        }
                    }
                }
            }
        }

        if nal_ref_idc != 0 {
            // dec_ref_pic_marking
            if nal_unit_type == NALU_TYPE_IDR_SLICE {
                bits.skip_bits(1)?; // no_output_of_prior_pics_flag
                bits.skip_bits(1)?; // long_term_reference_flag
            } else if bits.read_flag()? {
                // adaptive_ref_pic_marking_mode_flag
                loop {
                    let operation = bits.read_ue_max(6, "memory_management_control_operation")?;

                    if operation == 0 {
                        break;
                    }

                    if operation == 1 || operation == 3 {
                        bits.skip_ue()?; // difference_of_pic_nums_minus1
                    }

                    if operation == 2 {
                        bits.skip_ue()?; // long_term_pic_num
                    }

                    if operation == 3 || operation == 6 {
                        bits.skip_ue()?; // long_term_frame_idx
                    }

                    if operation == 4 {
                        bits.skip_ue()?; // max_long_term_frame_idx_plus1
                    }
                }
            }
        }

        if pps.entropy_coding_mode_flag && slice_type != SLICE_TYPE_I && slice_type != SLICE_TYPE_SI
        {
            bits.skip_ue()?; // cabac_init_idc
        }

        bits.skip_se()?; // slice_qp_delta

        if slice_type == SLICE_TYPE_SP || slice_type == SLICE_TYPE_SI {
            if slice_type == SLICE_TYPE_SP {
                bits.skip_bits(1)?; // sp_for_switch_flag
            }

            bits.skip_se()?; // slice_qs_delta
        }

        if pps.deblocking_filter_control_present_flag {
            let disable_deblocking_filter_idc = bits.read_ue()?;

            if disable_deblocking_filter_idc != 1 {
                bits.skip_se()?; // slice_alpha_c0_offset_div2
                bits.skip_se()?; // slice_beta_offset_div2
            }
        }

        if pps.num_slice_groups_minus1 > 0 && (3..=5).contains(&pps.slice_group_map_type) {
            let rate = pps.slice_group_change_rate.max(1);
            let size = ceil_log2(sps.pic_size_in_map_units / rate + 1);
            bits.skip_bits(size as usize)?; // slice_group_change_cycle
        }

        Ok(bits.position())
    }
}

fn skip_ref_pic_list_modification(bits: &mut BitReader) -> Result<()> {
    if bits.read_flag()? {
        loop {
            let modification_of_pic_nums_idc =
                bits.read_ue_max(5, "modification_of_pic_nums_idc")?;

            match modification_of_pic_nums_idc {
                0 | 1 => bits.skip_ue()?, // abs_diff_pic_num_minus1
                2 => bits.skip_ue()?,     // long_term_pic_num
                3 => break,
                _ => (),
            }
        }
    }

    Ok(())
}

impl CodecParser for AvcParser {
    fn feed(&mut self, nalu: &[u8]) -> Result<NaluKind> {
        let Some(header) = nalu.first() else {
            return Ok(NaluKind::Other);
        };

        match header & 0x1F {
            NALU_TYPE_SPS => {
                self.parse_sps(nalu)?;
                Ok(NaluKind::ParameterSet)
            }
            NALU_TYPE_PPS => {
                self.parse_pps(nalu)?;
                Ok(NaluKind::ParameterSet)
            }
            NALU_TYPE_NON_IDR_SLICE | NALU_TYPE_IDR_SLICE => Ok(NaluKind::Slice),
            _ => Ok(NaluKind::Other),
        }
    }

    fn slice_header_size(&self, nalu: &[u8]) -> Result<usize> {
        let header = *nalu
            .first()
            .ok_or_else(|| Error::invalid_format("empty NAL unit"))?;
        let payload = &nalu[1..];
        let rbsp = unescape(payload);
        let size = self.slice_header_bits(&rbsp, header & 0x1F, (header >> 5) & 0x03)?;
        Ok(escaped_size(payload, size.div_ceil(8)))
    }

    fn codec(&self) -> VideoCodec {
        VideoCodec::Avc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Baseline profile, 320x240, frame_mbs_only, pic_order_cnt_type 0,
    // log2_max_frame_num 4, log2_max_pic_order_cnt_lsb 4.
    //
    // 67 | 42 00 1e | 1 (sps id 0) 1 (log2_max_frame_num_minus4 0) 1 (poc type 0)
    // 1 (log2_max_poc_lsb_minus4 0) 011 (max_num_ref_frames 2) 0 (gaps)
    // 000010100 (width mbs minus1 19) 0001111 (height minus1 14) 1 (frame_mbs_only)
    // 1 (direct_8x8) 0 (cropping) 0 (vui) 1 (stop bit)
    const SPS: [u8; 8] = [0x67, 0x42, 0x00, 0x1E, 0xF6, 0x0A, 0x0F, 0xC8];

    // 68 | 1 (pps id 0) 1 (sps id 0) 0 (cavlc) 0 (bottom field poc) 1 (slice groups 0)
    // 1 1 (num ref idx 0, 0) 0 (weighted pred) 00 (bipred) 1 1 1 (qp, qs, chroma offsets)
    // 1 (deblocking control) 0 (constrained intra) 0 (redundant pic cnt) 1 (stop bit)
    const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];

    #[test]
    fn test_avc_config() {
        let mut data = vec![1, 0x42, 0, 0x1E, 0xFF, 0xE1];
        data.extend_from_slice(&(SPS.len() as u16).to_be_bytes());
        data.extend_from_slice(&SPS);
        data.push(1);
        data.extend_from_slice(&(PPS.len() as u16).to_be_bytes());
        data.extend_from_slice(&PPS);

        let config = AvcDecoderConfig::parse(&data).unwrap();
        assert_eq!(config.nalu_length_size, 4);
        assert_eq!(config.sequence_parameter_sets, vec![SPS.to_vec()]);
        assert_eq!(config.picture_parameter_sets, vec![PPS.to_vec()]);
    }

    #[test]
    fn test_idr_slice_header_size() {
        let mut parser = AvcParser::new();
        assert_eq!(parser.feed(&SPS).unwrap(), NaluKind::ParameterSet);
        assert_eq!(parser.feed(&PPS).unwrap(), NaluKind::ParameterSet);

        // 65 | 1 (first_mb 0) 0001000 (slice_type 7, I) 1 (pps 0) 0000 (frame_num)
        // 1 (idr_pic_id 0) 0000 (poc lsb) 0 0 (no_output_of_prior_pics, long_term_reference)
        // 1 (slice_qp_delta 0) 1 (disable_deblocking_filter_idc 0) 1 1 (alpha, beta)
        // = 24 bits, followed by slice data
        let slice = [0x65, 0x88, 0x84, 0x0F, 0xAB, 0xCD];
        assert_eq!(parser.feed(&slice).unwrap(), NaluKind::Slice);
        assert_eq!(parser.slice_header_size(&slice).unwrap(), 3);
    }

    #[test]
    fn test_unknown_pps_is_invalid_format() {
        let parser = AvcParser::new();
        let slice = [0x65, 0x88, 0x80];
        assert!(
            parser
                .slice_header_size(&slice)
                .unwrap_err()
                .is_invalid_format()
        );
    }
}
