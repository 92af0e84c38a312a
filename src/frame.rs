// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Input pictures queued for submission and their auxiliary side data.

use std::sync::Arc;

use crate::format::BitDepth;
use crate::format::PictureHint;
use crate::format::Resolution;

/// A frame buffer resident in device memory, identified by a small index the
/// device recycles explicitly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HwSurface {
    pub frame_index: u16,
    /// Transport handle of the device instance this surface currently belongs
    /// to. Patched when a session is torn down and reopened so the surface
    /// does not keep pointing at the dead instance.
    pub device_handle: i64,
}

/// Backing storage of a queued picture. Exactly one representation is valid
/// at a time; the device write path picks the submission flavor from the
/// variant rather than from a runtime format tag.
#[derive(Clone, Debug)]
pub enum FrameStorage {
    /// Pixel planes held in system memory, copied into the device on write.
    Software(Arc<Vec<u8>>),
    /// A device-resident surface submitted by index.
    Hardware(HwSurface),
}

impl FrameStorage {
    pub fn hw_surface(&self) -> Option<&HwSurface> {
        match self {
            FrameStorage::Hardware(surface) => Some(surface),
            FrameStorage::Software(_) => None,
        }
    }
}

/// Where a custom SEI NAL must be placed relative to the first VCL NAL of
/// its access unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeiPlacement {
    BeforeVcl,
    AfterVcl,
}

/// One caller-supplied SEI payload carried through the session untouched
/// (apart from NAL framing and emulation prevention).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustomSei {
    pub payload_type: u8,
    pub placement: SeiPlacement,
    pub payload: Vec<u8>,
}

/// One auxiliary metadata record rendered into the size-prefixed block that
/// accompanies a frame submission.
#[derive(Clone, Debug)]
pub enum AuxRecord {
    /// Change the target bitrate starting at this frame.
    BitrateChange(u32),
    /// Long-term-reference directive, passed through opaquely.
    LongTermRef(Vec<u8>),
    HdrStatic(Vec<u8>),
    HdrDynamic(Vec<u8>),
    CloseCaption(Vec<u8>),
    /// Spliced into the output access unit by the packet assembler rather
    /// than interpreted by the device.
    CustomSei(CustomSei),
    RoiMap(Vec<u8>),
}

impl AuxRecord {
    fn tag(&self) -> u32 {
        match self {
            AuxRecord::BitrateChange(_) => 1,
            AuxRecord::LongTermRef(_) => 2,
            AuxRecord::HdrStatic(_) => 3,
            AuxRecord::HdrDynamic(_) => 4,
            AuxRecord::CloseCaption(_) => 5,
            AuxRecord::CustomSei(_) => 6,
            AuxRecord::RoiMap(_) => 7,
        }
    }
}

/// The set of auxiliary records attached to one input picture.
#[derive(Clone, Debug, Default)]
pub struct AuxData {
    pub records: Vec<AuxRecord>,
}

impl AuxData {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The custom SEI entries of this set, in submission order.
    pub fn custom_seis(&self) -> impl Iterator<Item = &CustomSei> {
        self.records.iter().filter_map(|r| match r {
            AuxRecord::CustomSei(sei) => Some(sei),
            _ => None,
        })
    }

    /// Render the records the device consumes into its tagged wire block:
    /// a `(tag: u32, size: u32, payload)` sequence in little endian. Custom
    /// SEI records are not included; they never reach the device.
    pub fn to_device_block(&self) -> Vec<u8> {
        let mut block = Vec::new();
        for record in &self.records {
            let payload: &[u8] = match record {
                AuxRecord::BitrateChange(target) => {
                    block.extend_from_slice(&record.tag().to_le_bytes());
                    block.extend_from_slice(&4u32.to_le_bytes());
                    block.extend_from_slice(&target.to_le_bytes());
                    continue;
                }
                AuxRecord::LongTermRef(data)
                | AuxRecord::HdrStatic(data)
                | AuxRecord::HdrDynamic(data)
                | AuxRecord::CloseCaption(data)
                | AuxRecord::RoiMap(data) => data,
                AuxRecord::CustomSei(_) => continue,
            };
            block.extend_from_slice(&record.tag().to_le_bytes());
            block.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            block.extend_from_slice(payload);
        }
        block
    }
}

/// One queued input picture, owned by the frame queue from enqueue until the
/// device confirms the write.
#[derive(Clone, Debug)]
pub struct PendingFrame {
    pub storage: FrameStorage,
    pub pts: i64,
    pub hint: PictureHint,
    pub aux: AuxData,
    pub resolution: Resolution,
    pub bit_depth: BitDepth,
    pub end_of_stream: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_block_skips_custom_sei() {
        let aux = AuxData {
            records: vec![
                AuxRecord::BitrateChange(500_000),
                AuxRecord::CustomSei(CustomSei {
                    payload_type: 5,
                    placement: SeiPlacement::BeforeVcl,
                    payload: vec![1, 2, 3],
                }),
                AuxRecord::CloseCaption(vec![0xAA, 0xBB]),
            ],
        };
        let block = aux.to_device_block();
        // Bitrate record: tag 1, size 4, value.
        assert_eq!(&block[0..4], &1u32.to_le_bytes());
        assert_eq!(&block[4..8], &4u32.to_le_bytes());
        assert_eq!(&block[8..12], &500_000u32.to_le_bytes());
        // Close caption record follows immediately; the custom SEI record is
        // not rendered.
        assert_eq!(&block[12..16], &5u32.to_le_bytes());
        assert_eq!(&block[16..20], &2u32.to_le_bytes());
        assert_eq!(&block[20..], &[0xAA, 0xBB]);
    }

    #[test]
    fn custom_seis_iterates_in_order() {
        let aux = AuxData {
            records: vec![
                AuxRecord::CustomSei(CustomSei {
                    payload_type: 5,
                    placement: SeiPlacement::BeforeVcl,
                    payload: vec![1],
                }),
                AuxRecord::HdrStatic(vec![9]),
                AuxRecord::CustomSei(CustomSei {
                    payload_type: 100,
                    placement: SeiPlacement::AfterVcl,
                    payload: vec![2],
                }),
            ],
        };
        let types: Vec<u8> = aux.custom_seis().map(|s| s.payload_type).collect();
        assert_eq!(types, vec![5, 100]);
    }
}
