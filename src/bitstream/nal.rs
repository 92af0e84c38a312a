// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Start-code scanning and NAL classification over one access unit.
//!
//! The scanner serves both directions of the pump: on the way out it locates
//! the spot where synthesized SEI must be spliced (before the first VCL NAL)
//! and the parameter-set header run worth caching; on the way in it finds
//! custom SEI payloads to extract and detects access units made of nothing
//! but SEI, which the device cannot digest on their own.

use log::warn;

use crate::format::Format;
use crate::frame::CustomSei;
use crate::frame::SeiPlacement;

/// Coarse classification of a NAL unit, enough for splicing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalKind {
    /// VPS/SPS/PPS.
    ParameterSet,
    /// Access unit delimiter.
    Aud,
    Sei,
    /// A video-coding-layer unit, i.e. slice data.
    Vcl,
    Other,
}

/// One NAL unit located in an access unit. `start` is the offset of the
/// start code, `header` the offset of the first NAL header byte, `end` the
/// offset one past the last payload byte.
#[derive(Debug, Clone, Copy)]
pub struct Nal {
    pub start: usize,
    pub header: usize,
    pub end: usize,
    pub nal_type: u8,
    pub kind: NalKind,
}

fn classify(codec: Format, nal_type: u8) -> NalKind {
    match codec {
        Format::H264 => match nal_type {
            1..=5 => NalKind::Vcl,
            6 => NalKind::Sei,
            7 | 8 => NalKind::ParameterSet,
            9 => NalKind::Aud,
            _ => NalKind::Other,
        },
        Format::Hevc => match nal_type {
            0..=31 => NalKind::Vcl,
            32..=34 => NalKind::ParameterSet,
            35 => NalKind::Aud,
            39 | 40 => NalKind::Sei,
            _ => NalKind::Other,
        },
    }
}

/// Find the next `00 00 01` (optionally preceded by another zero) at or
/// after `from`. Returns the offset of the start code and its length.
pub fn find_next_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut pos = from;
    while pos + 3 <= data.len() {
        if data[pos] == 0 && data[pos + 1] == 0 && data[pos + 2] == 1 {
            if pos > from && data[pos - 1] == 0 {
                return Some((pos - 1, 4));
            }
            return Some((pos, 3));
        }
        pos += 1;
    }
    None
}

/// All NAL units of `data`, in stream order.
pub fn scan_nals(codec: Format, data: &[u8]) -> Vec<Nal> {
    let mut nals: Vec<Nal> = Vec::new();
    let mut pos = 0;
    while let Some((start, prefix_len)) = find_next_start_code(data, pos) {
        let header = start + prefix_len;
        if header >= data.len() {
            break;
        }
        let nal_type = match codec {
            Format::H264 => data[header] & 0x1F,
            Format::Hevc => (data[header] >> 1) & 0x3F,
        };
        if let Some(prev) = nals.last_mut() {
            prev.end = start;
        }
        nals.push(Nal {
            start,
            header,
            end: data.len(),
            nal_type,
            kind: classify(codec, nal_type),
        });
        pos = header + 1;
    }
    nals
}

/// Summary of an access unit used by the packet assembler and the input
/// scanner.
#[derive(Debug, Default)]
pub struct AuSummary {
    /// Byte range of the leading parameter-set run (VPS/SPS/PPS), if the
    /// access unit carries one before its first VCL unit.
    pub header_range: Option<std::ops::Range<usize>>,
    /// Offset of the start code of the first VCL unit. Synthesized SEI is
    /// inserted immediately before it, after all preceding non-VCL units.
    pub first_vcl: Option<usize>,
    /// An SEI unit appears after the first VCL unit and may need relocation.
    pub sei_after_vcl: bool,
    /// The access unit consists of SEI units only.
    pub sei_only: bool,
}

pub fn scan_access_unit(codec: Format, data: &[u8]) -> AuSummary {
    let nals = scan_nals(codec, data);
    let mut summary = AuSummary {
        sei_only: !nals.is_empty(),
        ..Default::default()
    };
    let mut header_start = None;
    let mut header_end = 0;
    for nal in &nals {
        match nal.kind {
            NalKind::ParameterSet if summary.first_vcl.is_none() => match header_start {
                None => {
                    header_start = Some(nal.start);
                    header_end = nal.end;
                }
                // Extend a still-contiguous run.
                Some(_) if header_end == nal.start => header_end = nal.end,
                Some(_) => {}
            },
            NalKind::Vcl => {
                if summary.first_vcl.is_none() {
                    summary.first_vcl = Some(nal.start);
                }
            }
            NalKind::Sei => {
                if summary.first_vcl.is_some() {
                    summary.sei_after_vcl = true;
                }
            }
            _ => {}
        }
        if nal.kind != NalKind::Sei {
            summary.sei_only = false;
        }
    }
    summary.header_range = header_start.map(|start| start..header_end);
    summary
}

/// Offset at which synthesized SEI must be spliced into `data`: right before
/// the first VCL unit, or at the end if the access unit has none.
pub fn sei_insertion_point(codec: Format, data: &[u8]) -> usize {
    scan_access_unit(codec, data)
        .first_vcl
        .unwrap_or(data.len())
}

/// Parse one SEI NAL payload (bytes between the NAL header and the end of
/// the unit) into a custom SEI entry. Returns `None` and warns if the size
/// field runs past the end of the unit.
fn parse_sei_payload(body: &[u8], placement: SeiPlacement) -> Option<CustomSei> {
    let mut pos = 0;
    let payload_type = *body.get(pos)?;
    pos += 1;

    // Payload size: a run of 0xFF bytes, each standing for 255, closed by
    // the remainder.
    let mut size = 0usize;
    loop {
        let byte = match body.get(pos) {
            Some(b) => *b,
            None => {
                warn!("custom sei size field runs past the end of the access unit");
                return None;
            }
        };
        pos += 1;
        size += byte as usize;
        if byte != 0xFF {
            break;
        }
    }

    // Copy the payload, dropping each 0x03 escape byte that follows two
    // zeros.
    let mut payload = Vec::with_capacity(size);
    let mut zeros = 0usize;
    for &byte in &body[pos..] {
        if payload.len() == size {
            break;
        }
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        if byte == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        payload.push(byte);
    }
    if payload.len() != size {
        warn!(
            "custom sei truncated: required size {}, actual size {}",
            size,
            payload.len()
        );
        return None;
    }

    Some(CustomSei {
        payload_type,
        placement,
        payload,
    })
}

/// Extract custom SEI payloads from an access unit.
///
/// An SEI unit before the first VCL unit is only extracted when its payload
/// type matches `wanted_type` (the configured passthrough type); SEI after
/// the first VCL unit is always extracted since the device cannot parse it
/// in place.
pub fn extract_custom_seis(codec: Format, data: &[u8], wanted_type: Option<u8>) -> Vec<CustomSei> {
    let mut seis = Vec::new();
    let mut vcl_found = false;
    for nal in scan_nals(codec, data) {
        match nal.kind {
            NalKind::Vcl => vcl_found = true,
            NalKind::Sei => {
                let header_len = match codec {
                    Format::H264 => 1,
                    Format::Hevc => 2,
                };
                let body = &data[(nal.header + header_len).min(nal.end)..nal.end];
                let placement = if vcl_found {
                    SeiPlacement::AfterVcl
                } else {
                    SeiPlacement::BeforeVcl
                };
                if let Some(sei) = parse_sei_payload(body, placement) {
                    if vcl_found || wanted_type == Some(sei.payload_type) {
                        seis.push(sei);
                    }
                }
            }
            _ => {}
        }
    }
    seis
}
