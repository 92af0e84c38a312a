// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoders for the SEI NAL units the pump synthesizes: buffering-period and
//! picture-timing messages when HRD signalling is enabled, and caller
//! supplied custom payloads.

use thiserror::Error as ThisError;

use crate::bitstream::bitwriter::BitWriter;
use crate::device::HrdParams;
use crate::format::Format;
use crate::format::GopStructure;
use crate::format::PictureType;
use crate::frame::CustomSei;

/// Hard cap on a single SEI payload. Anything larger is dropped by the
/// caller with a warning rather than truncated.
pub const MAX_SEI_DATA: usize = 5120;

/// Bytes preceding the SEI payload: 4-byte start code, NAL header, payload
/// type and payload size. Emulation prevention scanning starts after them.
const SEI_PREFIX_SIZE: usize = 8;

#[derive(Debug, ThisError)]
pub enum SeiBuildError {
    #[error("sei payload of {0} bytes exceeds the maximum of {MAX_SEI_DATA}")]
    Oversized(usize),
}

/// Insert an emulation prevention byte (0x03) wherever the two previously
/// emitted bytes are zero and the next byte is 0x03 or less, so no payload
/// byte run can be mistaken for a start code.
pub fn insert_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        if out.len() >= 2
            && out[out.len() - 2] == 0
            && out[out.len() - 1] == 0
            && byte <= 0x03
        {
            out.push(0x03);
        }
        out.push(byte);
    }
    out
}

fn push_nal_header(out: &mut Vec<u8>, codec: Format) {
    out.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
    match codec {
        // nal_unit_type=6 (SEI), nal_ref_idc=0.
        Format::H264 => out.push(0x06),
        // nal_unit_type=39 (prefix SEI), layer_id=0, temporal_id_plus1=1.
        Format::Hevc => out.extend_from_slice(&[0x4E, 0x01]),
    }
}

/// Render one caller-supplied SEI payload as a complete NAL unit: start
/// code, NAL header, payload type, 0xFF-continuation size chain, escaped
/// payload and RBSP trailing byte.
pub fn encode_custom_sei_nal(codec: Format, sei: &CustomSei) -> Result<Vec<u8>, SeiBuildError> {
    if sei.payload.len() > MAX_SEI_DATA {
        return Err(SeiBuildError::Oversized(sei.payload.len()));
    }

    let mut out = Vec::with_capacity(sei.payload.len() + 16);
    push_nal_header(&mut out, codec);
    out.push(sei.payload_type);

    // Payload size: one 0xFF byte per full 255, then the remainder.
    let mut remaining = sei.payload.len();
    while remaining >= 0xFF {
        out.push(0xFF);
        remaining -= 0xFF;
    }
    out.push(remaining as u8);

    // Escape the payload in place; the zero-byte history starts fresh at the
    // payload, the size field is not part of it.
    let mut zeros = 0usize;
    for &byte in &sei.payload {
        if zeros >= 2 && byte <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }
        out.push(byte);
        if byte == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
    }

    out.push(0x80);
    Ok(out)
}

/// Synthesizes HRD timing SEI. The device leaves hypothetical-reference
/// -decoder signalling to the host, so when it is enabled the pump emits a
/// buffering-period SEI on every keyframe and a picture-timing SEI on every
/// coded picture.
///
/// Only the HEVC syntax is produced; for H.264 streams the device emits its
/// own timing information and `new` returns `None`.
pub struct SeiEncoder {
    gop: GopStructure,
    intra_period: u32,
    hrd: HrdParams,
    au_cpb_removal_delay: u32,
}

impl SeiEncoder {
    pub fn new(codec: Format, gop: GopStructure, intra_period: u32, hrd: HrdParams) -> Option<Self> {
        match codec {
            Format::Hevc => Some(SeiEncoder {
                gop,
                intra_period,
                hrd,
                au_cpb_removal_delay: 0,
            }),
            Format::H264 => None,
        }
    }

    /// Start over for a new coded video sequence.
    pub fn reset(&mut self) {
        self.au_cpb_removal_delay = 0;
    }

    fn finish_payload(mut writer: BitWriter, payload_bit_size: u32) -> Vec<u8> {
        // Fill in bit 1 and padding 0s for byte alignment.
        if payload_bit_size % 8 != 0 {
            writer.put_bits(1, 1);
            writer.put_bits((8 - payload_bit_size % 8 - 1) as u8, 0);
        }
        // RBSP trailing stop bit and alignment padding 0s.
        writer.put_bits(8, 0x80);

        let mut bytes = writer.finish();
        let escaped = insert_emulation_prevention(&bytes[SEI_PREFIX_SIZE..]);
        bytes.truncate(SEI_PREFIX_SIZE);
        bytes.extend_from_slice(&escaped);
        bytes
    }

    /// Buffering-period SEI for the access unit at coding order `frame_idx`.
    pub fn buffering_period(&self, frame_idx: u64) -> Vec<u8> {
        let init_len = self.hrd.initial_cpb_removal_delay_length;
        let au_len = self.hrd.au_cpb_removal_delay_length;

        let concatenation_flag =
            (frame_idx == 0 || self.gop.display_poc(frame_idx) == 0) as u32;

        // bp_seq_parameter_set_id=0 (1 bit) + irap_cpb_params_present_flag=0
        // + concatenation_flag + au_cpb_removal_delay_delta_minus1 + one CPB
        // entry of initial removal delay and offset.
        let payload_bit_size = 1 + 1 + 1 + au_len as u32 + 2 * init_len as u32;
        let payload_byte_size = (payload_bit_size + 7) / 8;

        let mut writer = BitWriter::new();
        writer.put_bits32(1); // NAL start code
        writer.put_bits(16, (39 << 9) | 1); // nal_unit_type=39, temporal_id_plus1=1
        writer.put_bits(8, 0); // payload_type=0 (buffering_period)
        writer.put_bits(8, payload_byte_size);

        writer.put_ue(0); // bp_seq_parameter_set_id=0
        writer.put_bits(1, 0); // irap_cpb_params_present_flag=0
        writer.put_bits(1, concatenation_flag);
        writer.put_bits(au_len, 0); // au_cpb_removal_delay_delta_minus1=0

        let initial_removal_delay = if self.hrd.bit_rate == 0 {
            0
        } else {
            (90_000u64 * self.hrd.cpb_size as u64 / self.hrd.bit_rate as u64) as u32
        };
        let initial_removal_offset = if self.hrd.bit_rate == 0 {
            0
        } else {
            (90_000u64 * self.hrd.cpb_size as u64 / self.hrd.bit_rate as u64) as u32
                - initial_removal_delay
        };
        // nal_hrd_parameters_present_flag=1, CpbCnt = 1.
        writer.put_bits(init_len, initial_removal_delay);
        writer.put_bits(init_len, initial_removal_offset);
        // vcl_hrd_parameters_present_flag=0

        Self::finish_payload(writer, payload_bit_size)
    }

    /// Picture-timing SEI for the access unit at coding order `frame_idx`.
    /// Advances the AU removal-delay counter, resetting it at every intra
    /// refresh point.
    pub fn pic_timing(&mut self, frame_idx: u64, picture_type: PictureType) -> Vec<u8> {
        let au_len = self.hrd.au_cpb_removal_delay_length;
        let dpb_len = self.hrd.dpb_output_delay_length;

        // CpbDpbDelaysPresentFlag=1: au_cpb_removal_delay_minus1 and
        // pic_dpb_output_delay only.
        let payload_bit_size = au_len as u32 + dpb_len as u32;
        let payload_byte_size = (payload_bit_size + 7) / 8;

        let mut writer = BitWriter::new();
        writer.put_bits32(1); // NAL start code
        writer.put_bits(16, (39 << 9) | 1);
        writer.put_bits(8, 1); // payload_type=1 (picture_timing)
        writer.put_bits(8, payload_byte_size);

        writer.put_bits(au_len, self.au_cpb_removal_delay);
        self.au_cpb_removal_delay += 1;
        let is_intra = picture_type.is_keyframe();
        if self.intra_period != 0
            && matches!(self.gop, GopStructure::LowDelay | GopStructure::Ipp)
        {
            if frame_idx == 0
                || picture_type == PictureType::Idr
                || self.au_cpb_removal_delay % self.intra_period == 0
            {
                self.au_cpb_removal_delay = 0;
            }
        } else if is_intra {
            self.au_cpb_removal_delay = 0;
        }

        writer.put_bits(dpb_len, self.gop.dpb_output_delay(frame_idx));

        Self::finish_payload(writer, payload_bit_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SeiPlacement;

    fn custom(payload: Vec<u8>) -> CustomSei {
        CustomSei {
            payload_type: 5,
            placement: SeiPlacement::BeforeVcl,
            payload,
        }
    }

    #[test]
    fn custom_sei_size_chain() {
        // 600 = 255 + 255 + 90.
        let nal = encode_custom_sei_nal(Format::Hevc, &custom(vec![0xAB; 600])).unwrap();
        assert_eq!(&nal[..4], &[0, 0, 0, 1]);
        assert_eq!(&nal[4..6], &[0x4E, 0x01]);
        assert_eq!(nal[6], 5);
        assert_eq!(&nal[7..10], &[0xFF, 0xFF, 0x5A]);
        assert_eq!(&nal[10..610], &[0xAB; 600][..]);
        assert_eq!(nal[610], 0x80);
        assert_eq!(nal.len(), 611);
    }

    #[test]
    fn custom_sei_size_multiple_of_255() {
        // An exact multiple keeps a terminating remainder byte of zero.
        let nal = encode_custom_sei_nal(Format::H264, &custom(vec![1; 255])).unwrap();
        assert_eq!(nal[4], 0x06);
        assert_eq!(&nal[6..8], &[0xFF, 0x00]);
        let nal = encode_custom_sei_nal(Format::H264, &custom(vec![1; 510])).unwrap();
        assert_eq!(&nal[6..9], &[0xFF, 0xFF, 0x00]);
    }

    #[test]
    fn custom_sei_empty_payload() {
        let nal = encode_custom_sei_nal(Format::H264, &custom(vec![])).unwrap();
        // Start code, header, type, zero size, trailing byte.
        assert_eq!(nal, vec![0, 0, 0, 1, 0x06, 5, 0, 0x80]);
    }

    #[test]
    fn custom_sei_escapes_zero_runs() {
        let nal = encode_custom_sei_nal(Format::Hevc, &custom(vec![0, 0, 0, 0, 2, 0, 0, 3]))
            .unwrap();
        // Payload starts after [start code][4E 01][type][size].
        assert_eq!(
            &nal[8..],
            &[0, 0, 0x03, 0, 0, 0x03, 2, 0, 0, 0x03, 3, 0x80]
        );
    }

    #[test]
    fn custom_sei_oversized_is_rejected() {
        let err = encode_custom_sei_nal(Format::Hevc, &custom(vec![0; MAX_SEI_DATA + 1]));
        assert!(matches!(err, Err(SeiBuildError::Oversized(_))));
    }

    fn hrd() -> HrdParams {
        HrdParams {
            bit_rate: 1_000_000,
            cpb_size: 2_000_000,
            ..Default::default()
        }
    }

    #[test]
    fn buffering_period_bit_exact() {
        let encoder =
            SeiEncoder::new(Format::Hevc, GopStructure::LowDelay, 0, hrd()).unwrap();
        // 90000 * cpb / bitrate = 180000 = 0x02BF20; concatenation flag set
        // on frame 0; two emulation prevention bytes break up the zero runs
        // around the 24-bit fields.
        assert_eq!(
            encoder.buffering_period(0),
            vec![
                0x00, 0x00, 0x00, 0x01, 0x4E, 0x01, 0x00, 0x0A, 0xA0, 0x00, 0x00, 0x03, 0x00,
                0xAF, 0xC8, 0x00, 0x00, 0x03, 0x00, 0x00, 0x10, 0x80,
            ]
        );
    }

    #[test]
    fn buffering_period_concatenation_only_at_period_start() {
        let encoder =
            SeiEncoder::new(Format::Hevc, GopStructure::LowDelay, 0, hrd()).unwrap();
        let first = encoder.buffering_period(0);
        let later = encoder.buffering_period(30);
        // Same layout, concatenation bit cleared.
        assert_eq!(first[8], 0xA0);
        assert_eq!(later[8], 0x80);
    }

    #[test]
    fn pic_timing_bit_exact_and_counter_resets() {
        let mut encoder =
            SeiEncoder::new(Format::Hevc, GopStructure::LowDelay, 0, hrd()).unwrap();
        // Frame 0, IDR: both 24-bit fields are zero, escaped.
        assert_eq!(
            encoder.pic_timing(0, PictureType::Idr),
            vec![
                0x00, 0x00, 0x00, 0x01, 0x4E, 0x01, 0x01, 0x06, 0x00, 0x00, 0x03, 0x00, 0x00,
                0x03, 0x00, 0x00, 0x80,
            ]
        );
        // The counter was reset by the IDR, so the next P picture carries
        // au_cpb_removal_delay_minus1 = 0 again.
        let p = encoder.pic_timing(1, PictureType::P);
        assert_eq!(p[7], 0x06);
        // Third picture increments to 1.
        let p2 = encoder.pic_timing(2, PictureType::P);
        // 24-bit value 1: 0x000001 would alias a start code, so it gets an
        // escape byte: 00 00 03 01.
        assert_eq!(&p2[8..12], &[0x00, 0x00, 0x03, 0x01]);
    }

    #[test]
    fn no_hrd_sei_for_h264() {
        assert!(SeiEncoder::new(Format::H264, GopStructure::LowDelay, 0, hrd()).is_none());
    }
}
