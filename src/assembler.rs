// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Builds the final output packets from what the device returns: skips the
//! device metadata header, prepends the cached parameter-set header where
//! the stream configuration calls for it, splices synthesized and caller
//! supplied SEI at the right spot of the access unit and assigns decode
//! timestamps.

use log::warn;

use crate::bitstream::nal;
use crate::bitstream::sei;
use crate::bitstream::sei::SeiEncoder;
use crate::device::DevicePacket;
use crate::device::SessionConfig;
use crate::format::Format;
use crate::format::PictureType;
use crate::frame::CustomSei;
use crate::frame::SeiPlacement;
use crate::reorder::TimestampReorderer;

/// Packets whose custom SEI has not been matched yet are associated to their
/// SEI set by presentation timestamp modulo this ring size. Two in-flight
/// packets whose timestamps collide modulo the ring evict each other; the
/// stored full timestamp makes that an observable warning instead of a
/// silent mis-attach.
const SEI_RING_SIZE: usize = 32;

struct StashedSeis {
    pts: i64,
    seis: Vec<CustomSei>,
}

/// One assembled compressed access unit, ready for downstream consumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPacket {
    pub data: Vec<u8>,
    pub pts: i64,
    pub dts: i64,
    pub keyframe: bool,
    pub end_of_stream: bool,
}

pub struct PacketAssembler {
    codec: Format,
    headers_out_of_band: bool,
    reorderer: TimestampReorderer,
    sei_encoder: Option<SeiEncoder>,
    saved_header: Vec<u8>,
    /// Set when `set_stream_header` installed a header that differs from the
    /// previously cached one; cleared once it has been re-prepended.
    header_dirty: bool,
    first_packet_done: bool,
    /// Count of coded (non-skip) packets assembled, i.e. the coding-order
    /// index used for timing SEI.
    coded_frames: u64,
    sei_ring: [Option<StashedSeis>; SEI_RING_SIZE],
}

impl PacketAssembler {
    pub fn new(config: &SessionConfig) -> Self {
        PacketAssembler {
            codec: config.codec,
            headers_out_of_band: config.headers_out_of_band,
            reorderer: TimestampReorderer::new(config.gop.dts_offset(), config.ticks_per_frame),
            sei_encoder: config
                .hrd
                .and_then(|hrd| SeiEncoder::new(config.codec, config.gop, config.intra_period, hrd)),
            saved_header: Vec::new(),
            header_dirty: false,
            first_packet_done: false,
            coded_frames: 0,
            sei_ring: Default::default(),
        }
    }

    /// Record the presentation timestamp of a frame the device accepted.
    pub fn record_submission_pts(&mut self, pts: i64) {
        self.reorderer.record_submission_pts(pts);
    }

    /// Keep `seis` until the packet with presentation timestamp `pts` comes
    /// back from the device.
    pub fn stash_custom_seis(&mut self, pts: i64, seis: Vec<CustomSei>) {
        if seis.is_empty() {
            return;
        }
        let slot = (pts.rem_euclid(SEI_RING_SIZE as i64)) as usize;
        if let Some(stashed) = &self.sei_ring[slot] {
            warn!(
                "custom sei for pts {} evicted by colliding pts {}",
                stashed.pts, pts
            );
        }
        self.sei_ring[slot] = Some(StashedSeis { pts, seis });
    }

    /// Install the out-of-band parameter-set header for the current session
    /// configuration.
    pub fn set_stream_header(&mut self, header: Vec<u8>) {
        if header != self.saved_header {
            self.header_dirty = true;
            self.saved_header = header;
        }
    }

    /// Restart assembly for a new coded video sequence, keeping the cached
    /// header until the reopened session replaces it.
    pub fn reset_for_sequence_change(&mut self) {
        self.reorderer.reset();
        if let Some(encoder) = &mut self.sei_encoder {
            encoder.reset();
        }
        self.coded_frames = 0;
        self.first_packet_done = false;
    }

    fn take_stashed_seis(&mut self, pts: i64) -> Vec<CustomSei> {
        let slot = (pts.rem_euclid(SEI_RING_SIZE as i64)) as usize;
        match self.sei_ring[slot].take() {
            Some(stashed) if stashed.pts == pts => stashed.seis,
            Some(stashed) => {
                warn!(
                    "stashed custom sei pts {} does not match packet pts {}, dropping",
                    stashed.pts, pts
                );
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    fn render_custom_seis(&self, seis: &[CustomSei], placement: SeiPlacement) -> Vec<u8> {
        let mut out = Vec::new();
        for custom in seis.iter().filter(|s| s.placement == placement) {
            match sei::encode_custom_sei_nal(self.codec, custom) {
                Ok(nal) => out.extend_from_slice(&nal),
                Err(e) => warn!("dropping custom sei: {}", e),
            }
        }
        out
    }

    /// Turn one device packet into an output packet. Returns `None` for
    /// not-coded (skip) pictures, which consume their timestamp but emit
    /// nothing.
    pub fn assemble(&mut self, packet: &DevicePacket) -> Option<OutputPacket> {
        if packet.picture_type == PictureType::NotCoded {
            // Keep DTS assignment aligned for the frames that follow.
            self.reorderer.next_output_dts(packet.pts);
            return None;
        }

        let payload = packet.payload();
        let dts = self.reorderer.next_output_dts(packet.pts);
        let keyframe = packet.picture_type.is_keyframe();

        let summary = nal::scan_access_unit(self.codec, payload);
        // An in-band header run is the most recent cache source.
        if let Some(range) = &summary.header_range {
            let header = &payload[range.clone()];
            if header != self.saved_header.as_slice() {
                self.saved_header = header.to_vec();
                self.header_dirty = false;
            }
        }

        let prepend_header = if !self.saved_header.is_empty() && summary.header_range.is_none() {
            if !self.first_packet_done {
                self.headers_out_of_band
            } else {
                // Re-prepend on later keyframes only if the header changed
                // since it was last emitted.
                keyframe && self.header_dirty
            }
        } else {
            false
        };

        let seis = self.take_stashed_seis(packet.pts);
        let insertion = summary.first_vcl.unwrap_or(payload.len());

        let mut data = Vec::with_capacity(payload.len() + 256);
        if prepend_header {
            data.extend_from_slice(&self.saved_header);
            self.header_dirty = false;
        }
        data.extend_from_slice(&payload[..insertion]);
        if let Some(encoder) = &mut self.sei_encoder {
            if keyframe {
                data.extend_from_slice(&encoder.buffering_period(self.coded_frames));
            }
            data.extend_from_slice(&encoder.pic_timing(self.coded_frames, packet.picture_type));
        }
        data.extend_from_slice(&self.render_custom_seis(&seis, SeiPlacement::BeforeVcl));
        data.extend_from_slice(&payload[insertion..]);
        data.extend_from_slice(&self.render_custom_seis(&seis, SeiPlacement::AfterVcl));

        self.first_packet_done = true;
        self.coded_frames += 1;

        Some(OutputPacket {
            data,
            pts: packet.pts,
            dts,
            keyframe,
            end_of_stream: packet.end_of_stream,
        })
    }
}
