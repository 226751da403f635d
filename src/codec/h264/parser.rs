// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoding of SPS/PPS parameter sets and slice headers.
//!
//! Field order in the decode functions is part of the bit-exact contract and
//! follows clause 7.3 of the specification. Derived values are computed
//! immediately after decode, before a record is published to the store.

use std::rc::Rc;

use enumn::N;

use crate::bitstream::BitReadError;
use crate::bitstream::BitReader;
use crate::codec::h264::nalu::NaluHeader;
use crate::codec::h264::nalu::NaluType;
use crate::error::ParseError;
use crate::error::ParseResult;
use crate::error::UnsupportedFeature;

pub const MAX_SPS_COUNT: usize = 32;
pub const MAX_PPS_COUNT: usize = 256;

/// Upper bound on reference-picture-list modification entries; one more than
/// the largest legal reference index so a missing sentinel is caught.
const MAX_RPLM_ENTRIES: usize = 33;

/// Upper bound on adaptive memory-management operations in one marking
/// record, guarding sentinel-less malformed streams.
const MAX_MMCO_OPS: usize = 66;

pub(super) const DEFAULT_4X4_INTRA: [u8; 16] = [
    6, 13, 13, 20, 20, 20, 28, 28, 28, 28, 32, 32, 32, 37, 37, 42,
];

pub(super) const DEFAULT_4X4_INTER: [u8; 16] = [
    10, 14, 14, 20, 20, 20, 24, 24, 24, 24, 27, 27, 27, 30, 30, 34,
];

pub(super) const DEFAULT_8X8_INTRA: [u8; 64] = [
    6, 10, 10, 13, 11, 13, 16, 16, 16, 16, 18, 18, 18, 18, 18, 23, 23, 23, 23, 23, 23, 25, 25, 25,
    25, 25, 25, 25, 27, 27, 27, 27, 27, 27, 27, 27, 29, 29, 29, 29, 29, 29, 29, 31, 31, 31, 31, 31,
    31, 33, 33, 33, 33, 33, 36, 36, 36, 36, 38, 38, 38, 40, 40, 42,
];

pub(super) const DEFAULT_8X8_INTER: [u8; 64] = [
    9, 13, 13, 15, 13, 15, 17, 17, 17, 17, 19, 19, 19, 19, 19, 21, 21, 21, 21, 21, 21, 22, 22, 22,
    22, 22, 22, 22, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 27, 27, 27, 27, 27,
    27, 28, 28, 28, 28, 28, 30, 30, 30, 30, 32, 32, 32, 33, 33, 35,
];

/// Rows of the `normAdjust4x4(m, i, j)` table, one per `m = qP % 6`. The
/// column is selected by the parity of (i, j). See 8.5.9.
const NORM_ADJUST_4X4: [[u32; 3]; 6] = [
    [10, 16, 13],
    [11, 18, 14],
    [13, 20, 16],
    [14, 23, 18],
    [16, 25, 20],
    [18, 29, 23],
];

/// Rows of the `normAdjust8x8(m, i, j)` table; the column is selected by the
/// mod-4 classification of (i, j). See 8.5.9.
const NORM_ADJUST_8X8: [[u32; 6]; 6] = [
    [20, 18, 32, 19, 25, 24],
    [22, 19, 35, 21, 28, 26],
    [26, 23, 42, 24, 33, 31],
    [28, 25, 45, 26, 35, 33],
    [32, 28, 51, 30, 40, 38],
    [36, 32, 58, 34, 43, 41],
];

/// `normAdjust4x4(m, k)` for the raster coefficient index `k`.
pub fn norm_adjust_4x4(m: usize, k: usize) -> u32 {
    let (i, j) = (k / 4, k % 4);

    let col = if i % 2 == 0 && j % 2 == 0 {
        0
    } else if i % 2 == 1 && j % 2 == 1 {
        1
    } else {
        2
    };

    NORM_ADJUST_4X4[m][col]
}

/// `normAdjust8x8(m, k)` for the raster coefficient index `k`.
pub fn norm_adjust_8x8(m: usize, k: usize) -> u32 {
    let (i, j) = (k / 8, k % 8);

    let col = if i % 4 == 0 && j % 4 == 0 {
        0
    } else if i % 2 == 1 && j % 2 == 1 {
        1
    } else if i % 4 == 2 && j % 4 == 2 {
        2
    } else if i % 4 == 0 && j % 2 == 1 || i % 2 == 1 && j % 4 == 0 {
        3
    } else if i % 4 == 0 && j % 4 == 2 || i % 4 == 2 && j % 4 == 0 {
        4
    } else {
        5
    };

    NORM_ADJUST_8X8[m][col]
}

/// `LevelScale4x4[list][m][k]`, derived from a scaling matrix.
pub type LevelScale4x4 = [[[u32; 16]; 6]; 6];
/// `LevelScale8x8[list][m][k]`, derived from a scaling matrix.
pub type LevelScale8x8 = [[[u32; 64]; 6]; 6];

fn derive_level_scale_4x4(lists: &[[u8; 16]; 6]) -> LevelScale4x4 {
    let mut out = [[[0; 16]; 6]; 6];
    for (list, scaling) in lists.iter().enumerate() {
        for m in 0..6 {
            for k in 0..16 {
                out[list][m][k] = u32::from(scaling[k]) * norm_adjust_4x4(m, k);
            }
        }
    }
    out
}

fn derive_level_scale_8x8(lists: &[[u8; 64]; 6]) -> LevelScale8x8 {
    let mut out = [[[0; 64]; 6]; 6];
    for (list, scaling) in lists.iter().enumerate() {
        for m in 0..6 {
            for k in 0..64 {
                out[list][m][k] = u32::from(scaling[k]) * norm_adjust_8x8(m, k);
            }
        }
    }
    out
}

/// Translates a reader-level failure into the crate taxonomy, attaching the
/// offset where the read started.
fn reader_err(e: BitReadError, offset: u64) -> ParseError {
    match e {
        BitReadError::Exhausted { needed, available } => ParseError::Exhausted { needed, available },
        other => ParseError::invalid(offset, other.to_string()),
    }
}

/// Reads a `ue(v)` syntax element and range-checks it.
fn read_ue_field(r: &mut BitReader, field: &'static str, max: u32) -> ParseResult<u32> {
    let offset = r.absolute_byte_offset();
    let value: u32 = r.read_ue().map_err(|e| reader_err(e, offset))?;

    if value > max {
        return Err(ParseError::OutOfRange {
            offset,
            field,
            value: i64::from(value),
            min: 0,
            max: i64::from(max),
        });
    }

    Ok(value)
}

/// Reads a `se(v)` syntax element and range-checks it.
fn read_se_field(r: &mut BitReader, field: &'static str, min: i32, max: i32) -> ParseResult<i32> {
    let offset = r.absolute_byte_offset();
    let value: i32 = r.read_se().map_err(|e| reader_err(e, offset))?;

    if value < min || value > max {
        return Err(ParseError::OutOfRange {
            offset,
            field,
            value: i64::from(value),
            min: i64::from(min),
            max: i64::from(max),
        });
    }

    Ok(value)
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Profile {
    Baseline = 66,
    Main = 77,
    Extended = 88,
    High = 100,
    High10 = 110,
    High422P = 122,
}

/// Slice category, i.e. `slice_type % 5`. See table 7-6.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum SliceType {
    P = 0,
    B = 1,
    #[default]
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }

    pub fn is_sp(&self) -> bool {
        matches!(self, SliceType::Sp)
    }

    pub fn is_si(&self) -> bool {
        matches!(self, SliceType::Si)
    }

    /// The unsupported-feature signal for a category this crate does not
    /// decode; `None` for I slices.
    fn unsupported(&self) -> Option<UnsupportedFeature> {
        match self {
            SliceType::P => Some(UnsupportedFeature::PSlice),
            SliceType::B => Some(UnsupportedFeature::BSlice),
            SliceType::Sp => Some(UnsupportedFeature::SpSlice),
            SliceType::Si => Some(UnsupportedFeature::SiSlice),
            SliceType::I => None,
        }
    }
}

/// Hypothetical reference decoder parameters. See E.1.2.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    pub cpb_cnt_minus1: u8,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub bit_rate_value_minus1: [u32; 32],
    pub cpb_size_value_minus1: [u32; 32],
    pub cbr_flag: [bool; 32],
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub time_offset_length: u8,
}

/// Video usability information. See E.1.1. Parsed in full; only
/// `bitstream_restriction` data feeds back into derived values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,

    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,

    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,

    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u8,
    pub chroma_sample_loc_type_bottom_field: u8,

    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,

    pub nal_hrd_parameters_present_flag: bool,
    pub nal_hrd_parameters: HrdParams,
    pub vcl_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters: HrdParams,
    pub low_delay_hrd_flag: bool,

    pub pic_struct_present_flag: bool,

    pub bitstream_restriction_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_mb_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

impl Default for VuiParams {
    fn default() -> Self {
        Self {
            aspect_ratio_info_present_flag: Default::default(),
            aspect_ratio_idc: Default::default(),
            sar_width: Default::default(),
            sar_height: Default::default(),
            overscan_info_present_flag: Default::default(),
            overscan_appropriate_flag: Default::default(),
            video_signal_type_present_flag: Default::default(),
            // Inferred values from E.2.1 when the signal-type group is absent.
            video_format: 5,
            video_full_range_flag: Default::default(),
            colour_description_present_flag: Default::default(),
            colour_primaries: 2,
            transfer_characteristics: 2,
            matrix_coefficients: 2,
            chroma_loc_info_present_flag: Default::default(),
            chroma_sample_loc_type_top_field: Default::default(),
            chroma_sample_loc_type_bottom_field: Default::default(),
            timing_info_present_flag: Default::default(),
            num_units_in_tick: Default::default(),
            time_scale: Default::default(),
            fixed_frame_rate_flag: Default::default(),
            nal_hrd_parameters_present_flag: Default::default(),
            nal_hrd_parameters: Default::default(),
            vcl_hrd_parameters_present_flag: Default::default(),
            vcl_hrd_parameters: Default::default(),
            low_delay_hrd_flag: Default::default(),
            pic_struct_present_flag: Default::default(),
            bitstream_restriction_flag: Default::default(),
            motion_vectors_over_pic_boundaries_flag: Default::default(),
            max_bytes_per_pic_denom: Default::default(),
            max_bits_per_mb_denom: Default::default(),
            log2_max_mv_length_horizontal: Default::default(),
            log2_max_mv_length_vertical: Default::default(),
            max_num_reorder_frames: Default::default(),
            max_dec_frame_buffering: Default::default(),
        }
    }
}

/// A sequence parameter set, keyed by `seq_parameter_set_id` in [0, 31].
#[derive(Debug, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,
    pub profile_idc: u8,

    pub constraint_set0_flag: bool,
    pub constraint_set1_flag: bool,
    pub constraint_set2_flag: bool,
    pub constraint_set3_flag: bool,
    pub constraint_set4_flag: bool,
    pub constraint_set5_flag: bool,

    pub level_idc: u8,

    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,

    pub seq_scaling_matrix_present_flag: bool,
    /// 4x4 scaling lists as read with 7.3.2.1.1.1, or the inferred flat and
    /// fallback values.
    pub scaling_lists_4x4: [[u8; 16]; 6],
    /// 8x8 scaling lists as read with 7.3.2.1.1.1.
    pub scaling_lists_8x8: [[u8; 64]; 6],

    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: Vec<i32>,

    pub max_num_ref_frames: u8,
    pub gaps_in_frame_num_value_allowed_flag: bool,

    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,

    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    /// `ExpectedDeltaPerPicOrderCntCycle`, see 7-12.
    pub expected_delta_per_pic_order_cnt_cycle: i32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,

    /// `LevelScale = ScalingMatrix * normAdjust`, recomputed from the 4x4
    /// scaling lists before the record is stored.
    pub level_scale_4x4: LevelScale4x4,
    /// The 8x8 counterpart of [`Sps::level_scale_4x4`].
    pub level_scale_8x8: LevelScale8x8,
}

impl Default for Sps {
    fn default() -> Self {
        Self {
            seq_parameter_set_id: Default::default(),
            profile_idc: Default::default(),
            constraint_set0_flag: Default::default(),
            constraint_set1_flag: Default::default(),
            constraint_set2_flag: Default::default(),
            constraint_set3_flag: Default::default(),
            constraint_set4_flag: Default::default(),
            constraint_set5_flag: Default::default(),
            level_idc: Default::default(),
            chroma_format_idc: Default::default(),
            separate_colour_plane_flag: Default::default(),
            bit_depth_luma_minus8: Default::default(),
            bit_depth_chroma_minus8: Default::default(),
            qpprime_y_zero_transform_bypass_flag: Default::default(),
            seq_scaling_matrix_present_flag: Default::default(),
            scaling_lists_4x4: [[0; 16]; 6],
            scaling_lists_8x8: [[0; 64]; 6],
            log2_max_frame_num_minus4: Default::default(),
            pic_order_cnt_type: Default::default(),
            log2_max_pic_order_cnt_lsb_minus4: Default::default(),
            delta_pic_order_always_zero_flag: Default::default(),
            offset_for_non_ref_pic: Default::default(),
            offset_for_top_to_bottom_field: Default::default(),
            num_ref_frames_in_pic_order_cnt_cycle: Default::default(),
            offset_for_ref_frame: Default::default(),
            max_num_ref_frames: Default::default(),
            gaps_in_frame_num_value_allowed_flag: Default::default(),
            pic_width_in_mbs_minus1: Default::default(),
            pic_height_in_map_units_minus1: Default::default(),
            frame_mbs_only_flag: Default::default(),
            mb_adaptive_frame_field_flag: Default::default(),
            direct_8x8_inference_flag: Default::default(),
            frame_cropping_flag: Default::default(),
            frame_crop_left_offset: Default::default(),
            frame_crop_right_offset: Default::default(),
            frame_crop_top_offset: Default::default(),
            frame_crop_bottom_offset: Default::default(),
            expected_delta_per_pic_order_cnt_cycle: Default::default(),
            vui_parameters_present_flag: Default::default(),
            vui_parameters: Default::default(),
            level_scale_4x4: [[[0; 16]; 6]; 6],
            level_scale_8x8: [[[0; 64]; 6]; 6],
        }
    }
}

impl Sps {
    /// `ChromaArrayType`, see 7.4.2.1.1.
    pub const fn chroma_array_type(&self) -> u8 {
        match self.separate_colour_plane_flag {
            false => self.chroma_format_idc,
            true => 0,
        }
    }

    /// `SubWidthC` and `SubHeightC` from table 6-1.
    pub const fn sub_width_height_c(&self) -> (u32, u32) {
        match (self.chroma_format_idc, self.separate_colour_plane_flag) {
            (1, false) => (2, 2),
            (2, false) => (2, 1),
            (3, false) => (1, 1),
            // Monochrome or separate planes; undefined by table 6-1.
            _ => (1, 1),
        }
    }

    /// `MbHeightC`, the chroma macroblock height in samples. See 6-3.
    pub const fn mb_height_c(&self) -> u32 {
        match self.chroma_array_type() {
            0 => 0,
            _ => 16 / self.sub_width_height_c().1,
        }
    }

    /// `MaxFrameNum`, see 7-10.
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// `PicWidthInMbs`, see 7-13.
    pub const fn pic_width_in_mbs(&self) -> u32 {
        self.pic_width_in_mbs_minus1 as u32 + 1
    }

    /// `FrameHeightInMbs`, see 7-18.
    pub const fn frame_height_in_mbs(&self) -> u32 {
        (2 - self.frame_mbs_only_flag as u32) * (self.pic_height_in_map_units_minus1 as u32 + 1)
    }

    /// `QpBdOffsetY`, see 7-4.
    pub const fn qp_bd_offset_y(&self) -> i32 {
        6 * self.bit_depth_luma_minus8 as i32
    }

    /// Coded width in luma samples.
    pub const fn width(&self) -> u32 {
        self.pic_width_in_mbs() * 16
    }

    /// Coded height in luma samples.
    pub const fn height(&self) -> u32 {
        self.frame_height_in_mbs() * 16
    }

    /// The visible rectangle after cropping, as ((left, top), (right,
    /// bottom)) in luma samples.
    pub fn visible_rectangle(&self) -> ((u32, u32), (u32, u32)) {
        if !self.frame_cropping_flag {
            return ((0, 0), (self.width(), self.height()));
        }

        let (crop_unit_x, crop_unit_y) = self.crop_unit_x_y();
        (
            (
                self.frame_crop_left_offset * crop_unit_x,
                self.frame_crop_top_offset * crop_unit_y,
            ),
            (
                self.width()
                    .saturating_sub(self.frame_crop_right_offset * crop_unit_x),
                self.height()
                    .saturating_sub(self.frame_crop_bottom_offset * crop_unit_y),
            ),
        )
    }

    /// `CropUnitX` and `CropUnitY`, see 7-19 through 7-22.
    fn crop_unit_x_y(&self) -> (u32, u32) {
        match self.chroma_array_type() {
            0 => (1, 2 - u32::from(self.frame_mbs_only_flag)),
            _ => {
                let (sub_width_c, sub_height_c) = self.sub_width_height_c();
                (
                    sub_width_c,
                    sub_height_c * (2 - u32::from(self.frame_mbs_only_flag)),
                )
            }
        }
    }

    /// Recomputes the derived quantization tables from the scaling lists.
    fn derive_quant_tables(&mut self) {
        self.level_scale_4x4 = derive_level_scale_4x4(&self.scaling_lists_4x4);
        self.level_scale_8x8 = derive_level_scale_8x8(&self.scaling_lists_8x8);
    }
}

/// A picture parameter set, keyed by `pic_parameter_set_id` in [0, 255].
/// Holds the SPS it resolved against at decode time.
#[derive(Debug, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,

    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_slice_groups_minus1: u32,

    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,

    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,

    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,

    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,

    pub transform_8x8_mode_flag: bool,
    pub pic_scaling_matrix_present_flag: bool,
    pub scaling_lists_4x4: [[u8; 16]; 6],
    pub scaling_lists_8x8: [[u8; 64]; 6],
    /// Inferred equal to `chroma_qp_index_offset` when absent.
    pub second_chroma_qp_index_offset: i8,

    /// Derived quantization tables for the lists in effect for this picture.
    pub level_scale_4x4: LevelScale4x4,
    pub level_scale_8x8: LevelScale8x8,

    /// The SPS this PPS resolved against.
    pub sps: Rc<Sps>,
}

/// A reference-picture-list modification entry. See 7.3.3.1.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub modification_of_pic_nums_idc: u8,
    /* if modification_of_pic_nums_idc == 0 || 1 */
    pub abs_diff_pic_num_minus1: u32,
    /* if modification_of_pic_nums_idc == 2 */
    pub long_term_pic_num: u32,
}

/// The prediction weight table. See 7.3.3.2.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,

    pub luma_weight_l0: [i16; 32],
    pub luma_offset_l0: [i8; 32],
    /* if ChromaArrayType != 0 */
    pub chroma_weight_l0: [[i16; 2]; 32],
    pub chroma_offset_l0: [[i8; 2]; 32],

    /* if slice_type % 5 == 1 */
    pub luma_weight_l1: [i16; 32],
    pub luma_offset_l1: [i8; 32],
    pub chroma_weight_l1: [[i16; 2]; 32],
    pub chroma_offset_l1: [[i8; 2]; 32],
}

/// `MaxLongTermFrameIdx`, derived from `max_long_term_frame_idx_plus1` where
/// zero means "no long-term frame indices".
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxLongTermFrameIdx {
    #[default]
    NoLongTermFrameIndices,
    Idx(u32),
}

impl MaxLongTermFrameIdx {
    pub fn from_value_plus1(plus1: u32) -> Self {
        match plus1 {
            0 => Self::NoLongTermFrameIndices,
            i => Self::Idx(i - 1),
        }
    }

    pub fn to_value_plus1(self) -> u32 {
        match self {
            Self::NoLongTermFrameIndices => 0,
            Self::Idx(i) => i + 1,
        }
    }
}

/// One adaptive memory-management control operation. See table 7-9.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarkingInner {
    pub memory_management_control_operation: u8,
    /* operations 1 and 3 */
    pub difference_of_pic_nums_minus1: u32,
    /* operation 2 */
    pub long_term_pic_num: u32,
    /* operations 3 and 6 */
    pub long_term_frame_idx: u32,
    /* operation 4 */
    pub max_long_term_frame_idx: MaxLongTermFrameIdx,
}

/// The decoded-reference-picture-marking record. See 7.3.3.3.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    /* IDR pictures only */
    pub no_output_of_prior_pics_flag: bool,
    pub long_term_reference_flag: bool,

    /* non-IDR pictures only */
    pub adaptive_ref_pic_marking_mode_flag: bool,
    pub inner: Vec<RefPicMarkingInner>,
}

/// A decoded slice header plus its optional sub-records.
///
/// The referenced PPS (and through it the SPS) is guaranteed to resolve in
/// the store that decoded this header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    /// Absolute byte offset of the slice header in the original stream.
    pub offset: u64,

    pub first_mb_in_slice: u32,
    /// The raw coding type in [0, 9]; see [`SliceHeader::category`].
    pub slice_type: u8,
    pub pic_parameter_set_id: u8,
    pub colour_plane_id: u8,
    pub frame_num: u16,

    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,

    pub idr_pic_id: u16,

    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],

    pub redundant_pic_cnt: u8,

    pub direct_spatial_mv_pred_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,

    pub ref_pic_list_modification_flag_l0: bool,
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,
    pub ref_pic_list_modification_flag_l1: bool,
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,

    pub pred_weight_table: PredWeightTable,
    pub dec_ref_pic_marking: RefPicMarking,

    pub cabac_init_idc: u8,
    pub slice_qp_delta: i8,

    pub sp_for_switch_flag: bool,
    pub slice_qs_delta: i8,

    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,

    // Derived values, filled in as soon as their inputs are known.
    /// `MbaffFrameFlag`, see 7-25.
    pub mbaff_frame_flag: bool,
    /// `PicHeightInMbs`, see 7-26.
    pub pic_height_in_mbs: u32,
    /// `PicHeightInSamplesL`, see 7-27.
    pub pic_height_in_samples_l: u32,
    /// `PicHeightInSamplesC`, see 7-28.
    pub pic_height_in_samples_c: u32,
    /// `PicSizeInMbs`, see 7-29.
    pub pic_size_in_mbs: u32,
    /// `MaxPicNum`, see 7.4.3.
    pub max_pic_num: u32,
    /// `SliceQPY`, see 7-30.
    pub slice_qp_y: i32,
}

impl SliceHeader {
    /// The slice category, i.e. `slice_type % 5`.
    pub fn category(&self) -> SliceType {
        SliceType::n(self.slice_type % 5).unwrap_or(SliceType::I)
    }
}

/// The id-addressable store owning decoded parameter sets, and the slice
/// header decoder reading from it.
///
/// Assigning at an id drops any previous occupant.
pub struct Parser {
    sps_store: [Option<Rc<Sps>>; MAX_SPS_COUNT],
    pps_store: [Option<Rc<Pps>>; MAX_PPS_COUNT],
}

impl Default for Parser {
    fn default() -> Self {
        Parser {
            sps_store: std::array::from_fn(|_| None),
            pps_store: std::array::from_fn(|_| None),
        }
    }
}

impl Parser {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get_sps(&self, sps_id: u8) -> Option<&Rc<Sps>> {
        self.sps_store.get(usize::from(sps_id)).and_then(|s| s.as_ref())
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Rc<Pps>> {
        self.pps_store.get(usize::from(pps_id)).and_then(|s| s.as_ref())
    }

    fn fill_default_scaling_list_4x4(list: &mut [u8; 16], i: usize) {
        // Table 7-2.
        if i < 3 {
            *list = DEFAULT_4X4_INTRA;
        } else {
            *list = DEFAULT_4X4_INTER;
        }
    }

    fn fill_default_scaling_list_8x8(list: &mut [u8; 64], i: usize) {
        if i % 2 == 0 {
            *list = DEFAULT_8X8_INTRA;
        } else {
            *list = DEFAULT_8X8_INTER;
        }
    }

    fn fill_fallback_scaling_list_4x4(
        lists: &mut [[u8; 16]; 6],
        i: usize,
        default_intra: &[u8; 16],
        default_inter: &[u8; 16],
    ) {
        // Table 7-2.
        lists[i] = match i {
            0 => *default_intra,
            1 | 2 => lists[i - 1],
            3 => *default_inter,
            _ => lists[i - 1],
        }
    }

    fn fill_fallback_scaling_list_8x8(
        lists: &mut [[u8; 64]; 6],
        i: usize,
        default_intra: &[u8; 64],
        default_inter: &[u8; 64],
    ) {
        // Table 7-2.
        lists[i] = match i {
            0 => *default_intra,
            1 => *default_inter,
            _ => lists[i - 2],
        }
    }

    fn fill_scaling_list_flat(lists_4x4: &mut [[u8; 16]; 6], lists_8x8: &mut [[u8; 64]; 6]) {
        // Flat_4x4_16 and Flat_8x8_16, see 7-8 and 7-9.
        for list in lists_4x4 {
            list.fill(16);
        }
        for list in lists_8x8 {
            list.fill(16);
        }
    }

    fn parse_scaling_list<U: AsMut<[u8]>>(
        r: &mut BitReader,
        scaling_list: &mut U,
        use_default: &mut bool,
    ) -> ParseResult<()> {
        // 7.3.2.1.1.1
        let mut last_scale = 8u8;
        let mut next_scale = 8u8;

        for j in 0..scaling_list.as_mut().len() {
            if next_scale != 0 {
                let delta_scale = read_se_field(r, "delta_scale", -128, 127)?;
                next_scale = ((i32::from(last_scale) + delta_scale + 256) % 256) as u8;
                *use_default = j == 0 && next_scale == 0;
                if *use_default {
                    return Ok(());
                }
            }

            scaling_list.as_mut()[j] = if next_scale == 0 {
                last_scale
            } else {
                next_scale
            };
            last_scale = scaling_list.as_mut()[j];
        }

        Ok(())
    }

    fn parse_sps_scaling_lists(r: &mut BitReader, sps: &mut Sps) -> ParseResult<()> {
        for i in 0..6 {
            if r.read_bit()? {
                let mut use_default = false;
                Parser::parse_scaling_list(r, &mut sps.scaling_lists_4x4[i], &mut use_default)?;

                if use_default {
                    Parser::fill_default_scaling_list_4x4(&mut sps.scaling_lists_4x4[i], i);
                }
            } else {
                Parser::fill_fallback_scaling_list_4x4(
                    &mut sps.scaling_lists_4x4,
                    i,
                    &DEFAULT_4X4_INTRA,
                    &DEFAULT_4X4_INTER,
                );
            }
        }

        let num_8x8 = if sps.chroma_format_idc != 3 { 2 } else { 6 };
        for i in 0..num_8x8 {
            if r.read_bit()? {
                let mut use_default = false;
                Parser::parse_scaling_list(r, &mut sps.scaling_lists_8x8[i], &mut use_default)?;

                if use_default {
                    Parser::fill_default_scaling_list_8x8(&mut sps.scaling_lists_8x8[i], i);
                }
            } else {
                Parser::fill_fallback_scaling_list_8x8(
                    &mut sps.scaling_lists_8x8,
                    i,
                    &DEFAULT_8X8_INTRA,
                    &DEFAULT_8X8_INTER,
                );
            }
        }

        Ok(())
    }

    fn parse_pps_scaling_lists(r: &mut BitReader, pps: &mut Pps, sps: &Sps) -> ParseResult<()> {
        for i in 0..6 {
            if r.read_bit()? {
                let mut use_default = false;
                Parser::parse_scaling_list(r, &mut pps.scaling_lists_4x4[i], &mut use_default)?;

                if use_default {
                    Parser::fill_default_scaling_list_4x4(&mut pps.scaling_lists_4x4[i], i);
                }
            } else if !sps.seq_scaling_matrix_present_flag {
                // Table 7-2, fallback rule A.
                Parser::fill_fallback_scaling_list_4x4(
                    &mut pps.scaling_lists_4x4,
                    i,
                    &DEFAULT_4X4_INTRA,
                    &DEFAULT_4X4_INTER,
                );
            } else {
                // Table 7-2, fallback rule B.
                Parser::fill_fallback_scaling_list_4x4(
                    &mut pps.scaling_lists_4x4,
                    i,
                    &sps.scaling_lists_4x4[0],
                    &sps.scaling_lists_4x4[3],
                );
            }
        }

        if pps.transform_8x8_mode_flag {
            let num_8x8 = if sps.chroma_format_idc != 3 { 2 } else { 6 };

            for i in 0..num_8x8 {
                if r.read_bit()? {
                    let mut use_default = false;
                    Parser::parse_scaling_list(r, &mut pps.scaling_lists_8x8[i], &mut use_default)?;

                    if use_default {
                        Parser::fill_default_scaling_list_8x8(&mut pps.scaling_lists_8x8[i], i);
                    }
                } else if !sps.seq_scaling_matrix_present_flag {
                    // Fallback rule A.
                    Parser::fill_fallback_scaling_list_8x8(
                        &mut pps.scaling_lists_8x8,
                        i,
                        &DEFAULT_8X8_INTRA,
                        &DEFAULT_8X8_INTER,
                    );
                } else {
                    // Fallback rule B.
                    Parser::fill_fallback_scaling_list_8x8(
                        &mut pps.scaling_lists_8x8,
                        i,
                        &sps.scaling_lists_8x8[0],
                        &sps.scaling_lists_8x8[1],
                    );
                }
            }
        }

        Ok(())
    }

    fn parse_hrd(r: &mut BitReader, hrd: &mut HrdParams) -> ParseResult<()> {
        hrd.cpb_cnt_minus1 = read_ue_field(r, "cpb_cnt_minus1", 31)? as u8;
        hrd.bit_rate_scale = r.read_bits(4)?;
        hrd.cpb_size_scale = r.read_bits(4)?;

        for idx in 0..=usize::from(hrd.cpb_cnt_minus1) {
            hrd.bit_rate_value_minus1[idx] = read_ue_field(r, "bit_rate_value_minus1", u32::MAX)?;
            hrd.cpb_size_value_minus1[idx] = read_ue_field(r, "cpb_size_value_minus1", u32::MAX)?;
            hrd.cbr_flag[idx] = r.read_bit()?;
        }

        hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.dpb_output_delay_length_minus1 = r.read_bits(5)?;
        hrd.time_offset_length = r.read_bits(5)?;
        Ok(())
    }

    fn parse_vui(r: &mut BitReader, sps: &mut Sps) -> ParseResult<()> {
        let vui = &mut sps.vui_parameters;

        vui.aspect_ratio_info_present_flag = r.read_bit()?;
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.read_bits(8)?;
            if vui.aspect_ratio_idc == 255 {
                vui.sar_width = r.read_bits(16)?;
                vui.sar_height = r.read_bits(16)?;
            }
        }

        vui.overscan_info_present_flag = r.read_bit()?;
        if vui.overscan_info_present_flag {
            vui.overscan_appropriate_flag = r.read_bit()?;
        }

        vui.video_signal_type_present_flag = r.read_bit()?;
        if vui.video_signal_type_present_flag {
            vui.video_format = r.read_bits(3)?;
            vui.video_full_range_flag = r.read_bit()?;
            vui.colour_description_present_flag = r.read_bit()?;
            if vui.colour_description_present_flag {
                vui.colour_primaries = r.read_bits(8)?;
                vui.transfer_characteristics = r.read_bits(8)?;
                vui.matrix_coefficients = r.read_bits(8)?;
            }
        }

        vui.chroma_loc_info_present_flag = r.read_bit()?;
        if vui.chroma_loc_info_present_flag {
            vui.chroma_sample_loc_type_top_field =
                read_ue_field(r, "chroma_sample_loc_type_top_field", 5)? as u8;
            vui.chroma_sample_loc_type_bottom_field =
                read_ue_field(r, "chroma_sample_loc_type_bottom_field", 5)? as u8;
        }

        vui.timing_info_present_flag = r.read_bit()?;
        if vui.timing_info_present_flag {
            let offset = r.absolute_byte_offset();

            vui.num_units_in_tick = r.read_bits(32)?;
            if vui.num_units_in_tick == 0 {
                return Err(ParseError::invalid(
                    offset,
                    "num_units_in_tick == 0 is not allowed by E.2.1",
                ));
            }

            vui.time_scale = r.read_bits(32)?;
            if vui.time_scale == 0 {
                return Err(ParseError::invalid(
                    offset,
                    "time_scale == 0 is not allowed by E.2.1",
                ));
            }

            vui.fixed_frame_rate_flag = r.read_bit()?;
        }

        vui.nal_hrd_parameters_present_flag = r.read_bit()?;
        if vui.nal_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.nal_hrd_parameters)?;
        }

        vui.vcl_hrd_parameters_present_flag = r.read_bit()?;
        if vui.vcl_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.vcl_hrd_parameters)?;
        }

        if vui.nal_hrd_parameters_present_flag || vui.vcl_hrd_parameters_present_flag {
            vui.low_delay_hrd_flag = r.read_bit()?;
        }

        vui.pic_struct_present_flag = r.read_bit()?;
        vui.bitstream_restriction_flag = r.read_bit()?;

        if vui.bitstream_restriction_flag {
            vui.motion_vectors_over_pic_boundaries_flag = r.read_bit()?;
            vui.max_bytes_per_pic_denom = read_ue_field(r, "max_bytes_per_pic_denom", u32::MAX)?;
            vui.max_bits_per_mb_denom = read_ue_field(r, "max_bits_per_mb_denom", 16)?;
            vui.log2_max_mv_length_horizontal =
                read_ue_field(r, "log2_max_mv_length_horizontal", 16)?;
            vui.log2_max_mv_length_vertical = read_ue_field(r, "log2_max_mv_length_vertical", 16)?;
            vui.max_num_reorder_frames = read_ue_field(r, "max_num_reorder_frames", u32::MAX)?;
            vui.max_dec_frame_buffering = read_ue_field(r, "max_dec_frame_buffering", u32::MAX)?;
        }

        Ok(())
    }

    /// Decodes an SPS RBSP at the reader's position and publishes it in the
    /// store, overwriting any previous set with the same id.
    pub fn parse_sps(&mut self, r: &mut BitReader) -> ParseResult<&Rc<Sps>> {
        let mut sps = Sps {
            profile_idc: r.read_bits(8)?,
            constraint_set0_flag: r.read_bit()?,
            constraint_set1_flag: r.read_bit()?,
            constraint_set2_flag: r.read_bit()?,
            constraint_set3_flag: r.read_bit()?,
            constraint_set4_flag: r.read_bit()?,
            constraint_set5_flag: r.read_bit()?,
            ..Default::default()
        };

        // reserved_zero_2bits
        r.skip_bits(2)?;

        sps.level_idc = r.read_bits(8)?;
        sps.seq_parameter_set_id =
            read_ue_field(r, "seq_parameter_set_id", MAX_SPS_COUNT as u32 - 1)? as u8;

        if matches!(
            sps.profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            sps.chroma_format_idc = read_ue_field(r, "chroma_format_idc", 3)? as u8;
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = r.read_bit()?;
            }

            sps.bit_depth_luma_minus8 = read_ue_field(r, "bit_depth_luma_minus8", 6)? as u8;
            sps.bit_depth_chroma_minus8 = read_ue_field(r, "bit_depth_chroma_minus8", 6)? as u8;
            sps.qpprime_y_zero_transform_bypass_flag = r.read_bit()?;
            sps.seq_scaling_matrix_present_flag = r.read_bit()?;

            if sps.seq_scaling_matrix_present_flag {
                Parser::parse_sps_scaling_lists(r, &mut sps)?;
            } else {
                Parser::fill_scaling_list_flat(
                    &mut sps.scaling_lists_4x4,
                    &mut sps.scaling_lists_8x8,
                );
            }
        } else {
            sps.chroma_format_idc = 1;
            Parser::fill_scaling_list_flat(&mut sps.scaling_lists_4x4, &mut sps.scaling_lists_8x8);
        }

        sps.log2_max_frame_num_minus4 = read_ue_field(r, "log2_max_frame_num_minus4", 12)? as u8;
        sps.pic_order_cnt_type = read_ue_field(r, "pic_order_cnt_type", 2)? as u8;

        if sps.pic_order_cnt_type == 0 {
            sps.log2_max_pic_order_cnt_lsb_minus4 =
                read_ue_field(r, "log2_max_pic_order_cnt_lsb_minus4", 12)? as u8;
        } else if sps.pic_order_cnt_type == 1 {
            sps.delta_pic_order_always_zero_flag = r.read_bit()?;
            sps.offset_for_non_ref_pic = read_se_field(r, "offset_for_non_ref_pic", i32::MIN + 1, i32::MAX)?;
            sps.offset_for_top_to_bottom_field =
                read_se_field(r, "offset_for_top_to_bottom_field", i32::MIN + 1, i32::MAX)?;
            sps.num_ref_frames_in_pic_order_cnt_cycle =
                read_ue_field(r, "num_ref_frames_in_pic_order_cnt_cycle", 254)? as u8;

            let mut offset_acc = 0i32;
            for _ in 0..sps.num_ref_frames_in_pic_order_cnt_cycle {
                let offset = read_se_field(r, "offset_for_ref_frame", i32::MIN + 1, i32::MAX)?;
                sps.offset_for_ref_frame.push(offset);

                // (7-12)
                offset_acc = offset_acc.wrapping_add(offset);
            }
            sps.expected_delta_per_pic_order_cnt_cycle = offset_acc;
        }

        sps.max_num_ref_frames = read_ue_field(r, "max_num_ref_frames", 16)? as u8;
        sps.gaps_in_frame_num_value_allowed_flag = r.read_bit()?;
        sps.pic_width_in_mbs_minus1 = read_ue_field(r, "pic_width_in_mbs_minus1", u16::MAX as u32)? as u16;
        sps.pic_height_in_map_units_minus1 =
            read_ue_field(r, "pic_height_in_map_units_minus1", u16::MAX as u32)? as u16;
        sps.frame_mbs_only_flag = r.read_bit()?;

        if !sps.frame_mbs_only_flag {
            sps.mb_adaptive_frame_field_flag = r.read_bit()?;
        }

        sps.direct_8x8_inference_flag = r.read_bit()?;
        sps.frame_cropping_flag = r.read_bit()?;

        if sps.frame_cropping_flag {
            let offset = r.absolute_byte_offset();
            sps.frame_crop_left_offset = read_ue_field(r, "frame_crop_left_offset", u32::MAX)?;
            sps.frame_crop_right_offset = read_ue_field(r, "frame_crop_right_offset", u32::MAX)?;
            sps.frame_crop_top_offset = read_ue_field(r, "frame_crop_top_offset", u32::MAX)?;
            sps.frame_crop_bottom_offset = read_ue_field(r, "frame_crop_bottom_offset", u32::MAX)?;

            let (crop_unit_x, crop_unit_y) = sps.crop_unit_x_y();

            sps.frame_crop_left_offset
                .checked_add(sps.frame_crop_right_offset)
                .and_then(|v| v.checked_mul(crop_unit_x))
                .and_then(|v| sps.width().checked_sub(v))
                .ok_or_else(|| ParseError::invalid(offset, "cropped width underflows"))?;

            sps.frame_crop_top_offset
                .checked_add(sps.frame_crop_bottom_offset)
                .and_then(|v| v.checked_mul(crop_unit_y))
                .and_then(|v| sps.height().checked_sub(v))
                .ok_or_else(|| ParseError::invalid(offset, "cropped height underflows"))?;
        }

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            Parser::parse_vui(r, &mut sps)?;
        }

        sps.derive_quant_tables();

        let id = usize::from(sps.seq_parameter_set_id);
        Ok(&*self.sps_store[id].insert(Rc::new(sps)))
    }

    /// Decodes a PPS RBSP at the reader's position, resolving its SPS
    /// reference, and publishes it in the store.
    pub fn parse_pps(&mut self, r: &mut BitReader) -> ParseResult<&Rc<Pps>> {
        let offset = r.absolute_byte_offset();
        let pic_parameter_set_id =
            read_ue_field(r, "pic_parameter_set_id", MAX_PPS_COUNT as u32 - 1)? as u8;
        let seq_parameter_set_id =
            read_ue_field(r, "seq_parameter_set_id", MAX_SPS_COUNT as u32 - 1)? as u8;

        let sps = self
            .get_sps(seq_parameter_set_id)
            .cloned()
            .ok_or(ParseError::UnresolvedReference {
                offset,
                set: "SPS",
                id: u32::from(seq_parameter_set_id),
            })?;

        let mut pps = Pps {
            pic_parameter_set_id,
            seq_parameter_set_id,
            entropy_coding_mode_flag: r.read_bit()?,
            bottom_field_pic_order_in_frame_present_flag: r.read_bit()?,
            num_slice_groups_minus1: read_ue_field(r, "num_slice_groups_minus1", 7)?,
            num_ref_idx_l0_default_active_minus1: 0,
            num_ref_idx_l1_default_active_minus1: 0,
            weighted_pred_flag: false,
            weighted_bipred_idc: 0,
            pic_init_qp_minus26: 0,
            pic_init_qs_minus26: 0,
            chroma_qp_index_offset: 0,
            deblocking_filter_control_present_flag: false,
            constrained_intra_pred_flag: false,
            redundant_pic_cnt_present_flag: false,
            transform_8x8_mode_flag: false,
            pic_scaling_matrix_present_flag: false,
            scaling_lists_4x4: [[0; 16]; 6],
            scaling_lists_8x8: [[0; 64]; 6],
            second_chroma_qp_index_offset: 0,
            level_scale_4x4: [[[0; 16]; 6]; 6],
            level_scale_8x8: [[[0; 64]; 6]; 6],
            sps,
        };

        if pps.num_slice_groups_minus1 > 0 {
            return Err(ParseError::Unsupported(UnsupportedFeature::Fmo));
        }

        pps.num_ref_idx_l0_default_active_minus1 =
            read_ue_field(r, "num_ref_idx_l0_default_active_minus1", 31)? as u8;
        pps.num_ref_idx_l1_default_active_minus1 =
            read_ue_field(r, "num_ref_idx_l1_default_active_minus1", 31)? as u8;

        pps.weighted_pred_flag = r.read_bit()?;
        pps.weighted_bipred_idc = r.read_bits(2)?;

        let qp_bd_offset_y = pps.sps.qp_bd_offset_y();
        pps.pic_init_qp_minus26 =
            read_se_field(r, "pic_init_qp_minus26", -(26 + qp_bd_offset_y), 25)? as i8;
        pps.pic_init_qs_minus26 = read_se_field(r, "pic_init_qs_minus26", -26, 25)? as i8;
        pps.chroma_qp_index_offset = read_se_field(r, "chroma_qp_index_offset", -12, 12)? as i8;

        // Inferred equal to chroma_qp_index_offset unless present in the
        // trailing group.
        pps.second_chroma_qp_index_offset = pps.chroma_qp_index_offset;

        pps.deblocking_filter_control_present_flag = r.read_bit()?;
        pps.constrained_intra_pred_flag = r.read_bit()?;
        pps.redundant_pic_cnt_present_flag = r.read_bit()?;

        if r.has_more_rbsp_data() {
            pps.transform_8x8_mode_flag = r.read_bit()?;
            pps.pic_scaling_matrix_present_flag = r.read_bit()?;

            if pps.pic_scaling_matrix_present_flag {
                let sps = Rc::clone(&pps.sps);
                Parser::parse_pps_scaling_lists(r, &mut pps, &sps)?;
            }

            pps.second_chroma_qp_index_offset =
                read_se_field(r, "second_chroma_qp_index_offset", -12, 12)? as i8;
        }

        if !pps.pic_scaling_matrix_present_flag {
            // Inferred equal to the sequence-level lists.
            pps.scaling_lists_4x4 = pps.sps.scaling_lists_4x4;
            pps.scaling_lists_8x8 = pps.sps.scaling_lists_8x8;
        }

        pps.level_scale_4x4 = derive_level_scale_4x4(&pps.scaling_lists_4x4);
        pps.level_scale_8x8 = derive_level_scale_8x8(&pps.scaling_lists_8x8);

        let id = usize::from(pps.pic_parameter_set_id);
        Ok(&*self.pps_store[id].insert(Rc::new(pps)))
    }

    fn parse_ref_pic_list_modification(
        r: &mut BitReader,
        entries: &mut Vec<RefPicListModification>,
    ) -> ParseResult<()> {
        loop {
            if entries.len() >= MAX_RPLM_ENTRIES {
                return Err(ParseError::invalid(
                    r.absolute_byte_offset(),
                    "ref_pic_list_modification without terminator",
                ));
            }

            let idc = read_ue_field(r, "modification_of_pic_nums_idc", 3)? as u8;
            let mut entry = RefPicListModification {
                modification_of_pic_nums_idc: idc,
                ..Default::default()
            };

            match idc {
                0 | 1 => {
                    entry.abs_diff_pic_num_minus1 =
                        read_ue_field(r, "abs_diff_pic_num_minus1", u32::MAX)?;
                }
                2 => {
                    entry.long_term_pic_num = read_ue_field(r, "long_term_pic_num", u32::MAX)?;
                }
                _ => break,
            }

            entries.push(entry);
        }

        Ok(())
    }

    fn parse_ref_pic_list_modifications(
        r: &mut BitReader,
        header: &mut SliceHeader,
    ) -> ParseResult<()> {
        let category = header.category();

        if !category.is_i() && !category.is_si() {
            header.ref_pic_list_modification_flag_l0 = r.read_bit()?;
            if header.ref_pic_list_modification_flag_l0 {
                Parser::parse_ref_pic_list_modification(
                    r,
                    &mut header.ref_pic_list_modification_l0,
                )?;
            }
        }

        if category.is_b() {
            header.ref_pic_list_modification_flag_l1 = r.read_bit()?;
            if header.ref_pic_list_modification_flag_l1 {
                Parser::parse_ref_pic_list_modification(
                    r,
                    &mut header.ref_pic_list_modification_l1,
                )?;
            }
        }

        Ok(())
    }

    fn parse_pred_weight_table(
        r: &mut BitReader,
        sps: &Sps,
        header: &mut SliceHeader,
    ) -> ParseResult<()> {
        let category = header.category();
        let pt = &mut header.pred_weight_table;

        pt.luma_log2_weight_denom = read_ue_field(r, "luma_log2_weight_denom", 7)? as u8;

        // Weights not present in the stream are inferred to be
        // 2 ^ log2_weight_denom, offsets to be 0.
        let default_luma_weight = 1 << pt.luma_log2_weight_denom;
        for i in 0..=usize::from(header.num_ref_idx_l0_active_minus1) {
            pt.luma_weight_l0[i] = default_luma_weight;
        }
        if category.is_b() {
            for i in 0..=usize::from(header.num_ref_idx_l1_active_minus1) {
                pt.luma_weight_l1[i] = default_luma_weight;
            }
        }

        if sps.chroma_array_type() != 0 {
            pt.chroma_log2_weight_denom = read_ue_field(r, "chroma_log2_weight_denom", 7)? as u8;
            let default_chroma_weight = 1 << pt.chroma_log2_weight_denom;

            for i in 0..=usize::from(header.num_ref_idx_l0_active_minus1) {
                pt.chroma_weight_l0[i] = [default_chroma_weight; 2];
            }
            if category.is_b() {
                for i in 0..=usize::from(header.num_ref_idx_l1_active_minus1) {
                    pt.chroma_weight_l1[i] = [default_chroma_weight; 2];
                }
            }
        }

        for i in 0..=usize::from(header.num_ref_idx_l0_active_minus1) {
            if r.read_bit()? {
                pt.luma_weight_l0[i] = read_se_field(r, "luma_weight_l0", -128, 127)? as i16;
                pt.luma_offset_l0[i] = read_se_field(r, "luma_offset_l0", -128, 127)? as i8;
            }

            if sps.chroma_array_type() != 0 && r.read_bit()? {
                for j in 0..2 {
                    pt.chroma_weight_l0[i][j] =
                        read_se_field(r, "chroma_weight_l0", -128, 127)? as i16;
                    pt.chroma_offset_l0[i][j] =
                        read_se_field(r, "chroma_offset_l0", -128, 127)? as i8;
                }
            }
        }

        if category.is_b() {
            for i in 0..=usize::from(header.num_ref_idx_l1_active_minus1) {
                if r.read_bit()? {
                    pt.luma_weight_l1[i] = read_se_field(r, "luma_weight_l1", -128, 127)? as i16;
                    pt.luma_offset_l1[i] = read_se_field(r, "luma_offset_l1", -128, 127)? as i8;
                }

                if sps.chroma_array_type() != 0 && r.read_bit()? {
                    for j in 0..2 {
                        pt.chroma_weight_l1[i][j] =
                            read_se_field(r, "chroma_weight_l1", -128, 127)? as i16;
                        pt.chroma_offset_l1[i][j] =
                            read_se_field(r, "chroma_offset_l1", -128, 127)? as i8;
                    }
                }
            }
        }

        Ok(())
    }

    fn parse_dec_ref_pic_marking(
        r: &mut BitReader,
        nalu: &NaluHeader,
        header: &mut SliceHeader,
    ) -> ParseResult<()> {
        let rpm = &mut header.dec_ref_pic_marking;

        if nalu.idr_pic_flag {
            rpm.no_output_of_prior_pics_flag = r.read_bit()?;
            rpm.long_term_reference_flag = r.read_bit()?;
            return Ok(());
        }

        rpm.adaptive_ref_pic_marking_mode_flag = r.read_bit()?;
        if !rpm.adaptive_ref_pic_marking_mode_flag {
            return Ok(());
        }

        loop {
            if rpm.inner.len() >= MAX_MMCO_OPS {
                return Err(ParseError::invalid(
                    r.absolute_byte_offset(),
                    "dec_ref_pic_marking without terminating operation",
                ));
            }

            let op = read_ue_field(r, "memory_management_control_operation", 6)? as u8;
            if op == 0 {
                break;
            }

            let mut marking = RefPicMarkingInner {
                memory_management_control_operation: op,
                ..Default::default()
            };

            if op == 1 || op == 3 {
                marking.difference_of_pic_nums_minus1 =
                    read_ue_field(r, "difference_of_pic_nums_minus1", u32::MAX)?;
            }
            if op == 2 {
                marking.long_term_pic_num = read_ue_field(r, "long_term_pic_num", u32::MAX)?;
            }
            if op == 3 || op == 6 {
                marking.long_term_frame_idx = read_ue_field(r, "long_term_frame_idx", u32::MAX)?;
            }
            if op == 4 {
                marking.max_long_term_frame_idx = MaxLongTermFrameIdx::from_value_plus1(
                    read_ue_field(r, "max_long_term_frame_idx_plus1", u32::MAX)?,
                );
            }

            rpm.inner.push(marking);
        }

        Ok(())
    }

    /// Decodes a slice header at the reader's position, leaving the reader
    /// positioned at the first bit of the slice data.
    ///
    /// Stops with [`ParseError::Unsupported`] the moment an undecodable
    /// coding type is observed.
    pub fn parse_slice_header(
        &self,
        r: &mut BitReader,
        nalu: &NaluHeader,
    ) -> ParseResult<SliceHeader> {
        if !matches!(
            nalu.type_,
            NaluType::Slice
                | NaluType::SliceDpa
                | NaluType::SliceDpb
                | NaluType::SliceDpc
                | NaluType::SliceIdr
                | NaluType::SliceExt
        ) {
            return Err(ParseError::invalid(
                r.absolute_byte_offset(),
                format!("{:?} is not a slice NAL unit", nalu.type_),
            ));
        }

        if matches!(nalu.type_, NaluType::SliceExt) {
            return Err(ParseError::Unsupported(
                UnsupportedFeature::MultiviewExtension,
            ));
        }

        let mut header = SliceHeader {
            offset: r.absolute_byte_offset(),
            first_mb_in_slice: read_ue_field(r, "first_mb_in_slice", u32::MAX)?,
            ..Default::default()
        };

        header.slice_type = read_ue_field(r, "slice_type", 9)? as u8;
        if let Some(feature) = header.category().unsupported() {
            return Err(ParseError::Unsupported(feature));
        }

        header.pic_parameter_set_id = read_ue_field(r, "pic_parameter_set_id", 255)? as u8;

        let pps = self.get_pps(header.pic_parameter_set_id).ok_or(
            ParseError::UnresolvedReference {
                offset: header.offset,
                set: "PPS",
                id: u32::from(header.pic_parameter_set_id),
            },
        )?;
        let sps = &pps.sps;

        if sps.separate_colour_plane_flag {
            header.colour_plane_id = r.read_bits(2)?;
        }

        header.frame_num = r.read_bits(usize::from(sps.log2_max_frame_num_minus4) + 4)?;

        if !sps.frame_mbs_only_flag {
            header.field_pic_flag = r.read_bit()?;
            if header.field_pic_flag {
                header.bottom_field_flag = r.read_bit()?;
            }
        }

        // Derived per 7-25 through 7-29 as soon as the inputs are known.
        header.mbaff_frame_flag = sps.mb_adaptive_frame_field_flag && !header.field_pic_flag;
        header.pic_height_in_mbs =
            sps.frame_height_in_mbs() / (1 + u32::from(header.field_pic_flag));
        header.pic_height_in_samples_l = header.pic_height_in_mbs * 16;
        header.pic_height_in_samples_c = header.pic_height_in_mbs * sps.mb_height_c();
        header.pic_size_in_mbs = sps.pic_width_in_mbs() * header.pic_height_in_mbs;
        header.max_pic_num = sps.max_frame_num() << u32::from(header.field_pic_flag);

        if header.field_pic_flag || header.mbaff_frame_flag {
            return Err(ParseError::Unsupported(UnsupportedFeature::InterlacedCoding));
        }

        if nalu.idr_pic_flag {
            header.idr_pic_id = read_ue_field(r, "idr_pic_id", 0xffff)? as u16;
        }

        if sps.pic_order_cnt_type == 0 {
            header.pic_order_cnt_lsb =
                r.read_bits(usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4)?;

            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt_bottom =
                    read_se_field(r, "delta_pic_order_cnt_bottom", i32::MIN + 1, i32::MAX)?;
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            header.delta_pic_order_cnt[0] =
                read_se_field(r, "delta_pic_order_cnt", i32::MIN + 1, i32::MAX)?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt[1] =
                    read_se_field(r, "delta_pic_order_cnt", i32::MIN + 1, i32::MAX)?;
            }
        }

        if pps.redundant_pic_cnt_present_flag {
            header.redundant_pic_cnt = read_ue_field(r, "redundant_pic_cnt", 127)? as u8;
        }

        let category = header.category();

        if category.is_b() {
            header.direct_spatial_mv_pred_flag = r.read_bit()?;
        }

        if category.is_p() || category.is_sp() || category.is_b() {
            header.num_ref_idx_active_override_flag = r.read_bit()?;
            if header.num_ref_idx_active_override_flag {
                header.num_ref_idx_l0_active_minus1 =
                    read_ue_field(r, "num_ref_idx_l0_active_minus1", 31)? as u8;
                if category.is_b() {
                    header.num_ref_idx_l1_active_minus1 =
                        read_ue_field(r, "num_ref_idx_l1_active_minus1", 31)? as u8;
                }
            } else {
                header.num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
                if category.is_b() {
                    header.num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
                }
            }
        }

        let ref_idx_limit = if header.field_pic_flag { 31 } else { 15 };
        for (field, value) in [
            ("num_ref_idx_l0_active_minus1", header.num_ref_idx_l0_active_minus1),
            ("num_ref_idx_l1_active_minus1", header.num_ref_idx_l1_active_minus1),
        ] {
            if value > ref_idx_limit {
                return Err(ParseError::OutOfRange {
                    offset: header.offset,
                    field,
                    value: i64::from(value),
                    min: 0,
                    max: i64::from(ref_idx_limit),
                });
            }
        }

        Parser::parse_ref_pic_list_modifications(r, &mut header)?;

        if (pps.weighted_pred_flag && (category.is_p() || category.is_sp()))
            || (pps.weighted_bipred_idc == 1 && category.is_b())
        {
            Parser::parse_pred_weight_table(r, sps, &mut header)?;
        }

        if nalu.ref_idc != 0 {
            Parser::parse_dec_ref_pic_marking(r, nalu, &mut header)?;
        }

        if pps.entropy_coding_mode_flag && !category.is_i() && !category.is_si() {
            header.cabac_init_idc = read_ue_field(r, "cabac_init_idc", 2)? as u8;
        }

        header.slice_qp_delta = read_se_field(r, "slice_qp_delta", -87, 77)? as i8;
        header.slice_qp_y = 26 + i32::from(pps.pic_init_qp_minus26) + i32::from(header.slice_qp_delta);

        if category.is_sp() || category.is_si() {
            if category.is_sp() {
                header.sp_for_switch_flag = r.read_bit()?;
            }
            header.slice_qs_delta = read_se_field(r, "slice_qs_delta", -51, 51)? as i8;
        }

        if pps.deblocking_filter_control_present_flag {
            header.disable_deblocking_filter_idc =
                read_ue_field(r, "disable_deblocking_filter_idc", 2)? as u8;

            if header.disable_deblocking_filter_idc != 1 {
                header.slice_alpha_c0_offset_div2 =
                    read_se_field(r, "slice_alpha_c0_offset_div2", -6, 6)? as i8;
                header.slice_beta_offset_div2 =
                    read_se_field(r, "slice_beta_offset_div2", -6, 6)? as i8;
            }
        }

        if pps.num_slice_groups_minus1 > 0 {
            return Err(ParseError::Unsupported(UnsupportedFeature::Fmo));
        }

        Ok(header)
    }

    /// Re-validates the ranges of every directly-decoded slice-header field
    /// and the parameter-set reference chain.
    pub fn check_slice_header(&self, header: &SliceHeader, nalu: &NaluHeader) -> ParseResult<()> {
        let offset = header.offset;

        if header.slice_type > 9 {
            return Err(ParseError::OutOfRange {
                offset,
                field: "slice_type",
                value: i64::from(header.slice_type),
                min: 0,
                max: 9,
            });
        }

        if nalu.idr_pic_flag {
            if !matches!(header.slice_type, 2 | 4 | 7 | 9) {
                return Err(ParseError::invalid(
                    offset,
                    format!("slice_type {} is not valid in an IDR picture", header.slice_type),
                ));
            }
            if header.frame_num != 0 {
                return Err(ParseError::invalid(
                    offset,
                    format!("frame_num {} != 0 in an IDR picture", header.frame_num),
                ));
            }
        }

        let pps = self.get_pps(header.pic_parameter_set_id).ok_or(
            ParseError::UnresolvedReference {
                offset,
                set: "PPS",
                id: u32::from(header.pic_parameter_set_id),
            },
        )?;

        let qp_bd_offset_y = pps.sps.qp_bd_offset_y();
        if header.slice_qp_y < -qp_bd_offset_y || header.slice_qp_y > 51 {
            return Err(ParseError::OutOfRange {
                offset,
                field: "SliceQPY",
                value: i64::from(header.slice_qp_y),
                min: i64::from(-qp_bd_offset_y),
                max: 51,
            });
        }

        for (field, value) in [
            ("slice_alpha_c0_offset_div2", header.slice_alpha_c0_offset_div2),
            ("slice_beta_offset_div2", header.slice_beta_offset_div2),
        ] {
            if !(-6..=6).contains(&value) {
                return Err(ParseError::OutOfRange {
                    offset,
                    field,
                    value: i64::from(value),
                    min: -6,
                    max: 6,
                });
            }
        }

        Ok(())
    }
}

/// One SEI message header: the payload itself is skipped, not interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeiMessage {
    pub payload_type: u32,
    pub payload_size: u32,
}

fn read_ff_coded(r: &mut BitReader) -> ParseResult<u32> {
    let mut value = 0u32;
    loop {
        let byte: u32 = r.read_bits(8)?;
        value = value.saturating_add(byte);
        if byte != 0xff {
            return Ok(value);
        }
    }
}

/// Decodes the SEI message list at the reader's position, skipping payload
/// bodies. See 7.3.2.3.1.
pub fn parse_sei(r: &mut BitReader) -> ParseResult<Vec<SeiMessage>> {
    let mut messages = Vec::new();

    loop {
        let payload_type = read_ff_coded(r)?;
        let payload_size = read_ff_coded(r)?;

        r.skip_bits(payload_size as usize * 8)?;
        messages.push(SeiMessage {
            payload_type,
            payload_size,
        });

        if !r.has_more_rbsp_data() {
            return Ok(messages);
        }
    }
}

/// Decodes an access unit delimiter, returning `primary_pic_type`. See
/// 7.3.2.4.
pub fn parse_aud(r: &mut BitReader) -> ParseResult<u8> {
    Ok(r.read_bits(3)?)
}
