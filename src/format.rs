// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Data structures describing the stream formats negotiated with the device.

use std::fmt;
use std::fmt::Display;

use enumn::N;

/// Coded formats the device can produce or consume.
#[derive(PartialEq, Eq, PartialOrd, Ord, N, Clone, Copy, Debug)]
#[repr(u32)]
pub enum Format {
    H264 = 0,
    Hevc = 1,
}

impl Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Format::*;
        match self {
            H264 => write!(f, "H264"),
            Hevc => write!(f, "HEVC"),
        }
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord, N, Clone, Copy, Debug)]
#[repr(u32)]
pub enum Profile {
    H264Baseline = 0,
    H264Main = 1,
    H264High = 2,
    HevcMain = 16,
    HevcMain10 = 17,
}

impl Profile {
    pub fn to_format(self) -> Format {
        use Profile::*;
        match self {
            H264Baseline | H264Main | H264High => Format::H264,
            HevcMain | HevcMain10 => Format::Hevc,
        }
    }
}

/// Bits per pixel sample component.
#[derive(PartialEq, Eq, PartialOrd, Ord, N, Clone, Copy, Debug)]
#[repr(u32)]
pub enum BitDepth {
    Depth8 = 8,
    Depth10 = 10,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` fits entirely within `other`, i.e. whether a session
    /// configured for `other` can be fast-reconfigured to `self` without
    /// reallocating its frame buffers.
    pub fn fits_within(&self, other: &Resolution) -> bool {
        self.width <= other.width && self.height <= other.height
    }
}

impl Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Copy, Clone)]
pub enum Bitrate {
    /// Constant bitrate.
    Cbr { target: u32 },
    /// Variable bitrate.
    Vbr { target: u32, peak: u32 },
}

impl Bitrate {
    pub fn target(&self) -> u32 {
        match self {
            Bitrate::Cbr { target } => *target,
            Bitrate::Vbr { target, .. } => *target,
        }
    }
}

/// Picture type tag attached by the device to every returned packet.
#[derive(PartialEq, Eq, PartialOrd, Ord, N, Clone, Copy, Debug)]
#[repr(u32)]
pub enum PictureType {
    Idr = 0,
    I = 1,
    P = 2,
    B = 3,
    /// The device consumed the frame but produced no visible output. The
    /// packet must be absorbed without emitting anything downstream.
    NotCoded = 4,
    Unspecified = 5,
}

impl PictureType {
    pub fn is_keyframe(&self) -> bool {
        matches!(self, PictureType::Idr | PictureType::I)
    }
}

/// Caller-supplied hint for a queued input picture.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum PictureHint {
    Intra,
    /// Force an IDR at this picture.
    Idr,
    Predicted,
    BiPredicted,
    #[default]
    Unspecified,
}

/// The repeating reference structure of the stream.
///
/// The pump only needs the structure's reorder depth, both to size the
/// guessed-DTS window and to derive the picture-timing SEI output delays.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum GopStructure {
    /// All pictures reference only the past; decode order == display order.
    LowDelay,
    Ipp,
    Ibp,
    Ibbp,
    Ibbbp,
    /// A structure the pump has no table for; reorder depth is assumed to be
    /// the worst case.
    Custom,
}

impl GopStructure {
    /// Number of leading output packets whose DTS must be guessed rather than
    /// taken from the submission FIFO, i.e. the number of pending
    /// non-reference frames in one GOP period.
    ///
    /// With IBBBP and input PTS 0 1 2 3 4 .. the output DTS are -3 -2 -1 0 1
    /// .. where the first three are the guessed values; with IBP only -1 is
    /// guessed.
    pub fn dts_offset(&self) -> u64 {
        match self {
            GopStructure::LowDelay | GopStructure::Ipp => 0,
            GopStructure::Ibp => 1,
            GopStructure::Ibbp => 2,
            GopStructure::Ibbbp => 3,
            GopStructure::Custom => 7,
        }
    }

    pub fn reorder_depth(&self) -> u32 {
        self.dts_offset() as u32
    }

    fn coding_order_poc_offsets(&self) -> &'static [u64] {
        match self {
            GopStructure::LowDelay | GopStructure::Ipp | GopStructure::Custom => &[1],
            GopStructure::Ibp => &[2, 1],
            GopStructure::Ibbp => &[3, 1, 2],
            GopStructure::Ibbbp => &[4, 2, 1, 3],
        }
    }

    /// Display-order picture count of the frame at coding-order position
    /// `frame_idx`, offset by `gop_size - 1` so the first GOP starts at the
    /// period boundary.
    pub fn display_poc(&self, frame_idx: u64) -> u64 {
        if matches!(self, GopStructure::LowDelay | GopStructure::Ipp) {
            return frame_idx;
        }
        let offsets = self.coding_order_poc_offsets();
        let gop_size = offsets.len() as u64;
        let gop_idx = frame_idx % gop_size;
        let gop_num = frame_idx / gop_size;
        offsets[gop_idx as usize] + gop_size * gop_num + gop_size - 1
    }

    /// `pic_dpb_output_delay` for the picture-timing SEI of frame
    /// `frame_idx`.
    pub fn dpb_output_delay(&self, frame_idx: u64) -> u32 {
        (self.reorder_depth() as u64 + self.display_poc(frame_idx) - frame_idx) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dts_offsets_match_reorder_depth_of_structure() {
        assert_eq!(GopStructure::LowDelay.dts_offset(), 0);
        assert_eq!(GopStructure::Ipp.dts_offset(), 0);
        assert_eq!(GopStructure::Ibp.dts_offset(), 1);
        assert_eq!(GopStructure::Ibbp.dts_offset(), 2);
        assert_eq!(GopStructure::Ibbbp.dts_offset(), 3);
        assert_eq!(GopStructure::Custom.dts_offset(), 7);
    }

    #[test]
    fn low_delay_poc_is_coding_order() {
        for idx in 0..10 {
            assert_eq!(GopStructure::LowDelay.display_poc(idx), idx);
            assert_eq!(GopStructure::LowDelay.dpb_output_delay(idx), 0);
        }
    }

    #[test]
    fn ibp_poc_covers_every_display_slot_once() {
        // Two GOPs of IBP: each display POC in the covered window appears
        // exactly once.
        let mut pocs: Vec<u64> = (0..6).map(|i| GopStructure::Ibp.display_poc(i)).collect();
        pocs.sort_unstable();
        pocs.dedup();
        assert_eq!(pocs.len(), 6);
    }

    #[test]
    fn resolution_fits_within() {
        let big = Resolution {
            width: 1920,
            height: 1080,
        };
        let small = Resolution {
            width: 1280,
            height: 720,
        };
        assert!(small.fits_within(&big));
        assert!(!big.fits_within(&small));
        assert!(big.fits_within(&big));
    }
}
