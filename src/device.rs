// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This module defines the interface an actual codec device needs to
//! implement in order to be driven by the session pump. Every call is one
//! synchronous round trip against the device; the pump never assumes the
//! device completes work between calls.

use std::time::Duration;

use crate::error::VideoResult;
use crate::format::BitDepth;
use crate::format::Bitrate;
use crate::format::Format;
use crate::format::GopStructure;
use crate::format::PictureType;
use crate::format::Profile;
use crate::format::Resolution;
use crate::frame::FrameStorage;

/// Hypothetical-reference-decoder signalling parameters. When present, the
/// pump synthesizes buffering-period and picture-timing SEI for every coded
/// access unit.
#[derive(Debug, Clone, Copy)]
pub struct HrdParams {
    /// Unscaled bitrate the CPB drains at, in bits per second.
    pub bit_rate: u32,
    /// Unscaled coded picture buffer size, in bits.
    pub cpb_size: u32,
    pub initial_cpb_removal_delay_length: u8,
    pub au_cpb_removal_delay_length: u8,
    pub dpb_output_delay_length: u8,
}

impl Default for HrdParams {
    fn default() -> Self {
        HrdParams {
            bit_rate: 0,
            cpb_size: 0,
            initial_cpb_removal_delay_length: 24,
            au_cpb_removal_delay_length: 24,
            dpb_output_delay_length: 24,
        }
    }
}

/// Everything needed to open one device session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub codec: Format,
    pub profile: Option<Profile>,
    pub resolution: Resolution,
    pub bit_depth: BitDepth,
    pub bitrate: Bitrate,
    pub frame_rate: u32,
    /// Timestamp ticks spanned by one frame; used for guessed DTS values.
    pub ticks_per_frame: i64,
    pub gop: GopStructure,
    pub intra_period: u32,
    pub low_delay: bool,
    /// `Some` enables HRD signalling in the produced bitstream.
    pub hrd: Option<HrdParams>,
    /// Whether the stream carries its parameter-set headers out-of-band, in
    /// which case the first emitted packet is prefixed with them.
    pub headers_out_of_band: bool,
    /// Maximum number of hardware frames in flight; sizes the frame pool.
    pub hw_frame_pool_size: usize,
    pub keep_alive_timeout: Duration,
}

/// One frame submission as the device sees it.
#[derive(Debug, Clone)]
pub struct DeviceFrame {
    pub storage: Option<FrameStorage>,
    pub pts: i64,
    pub force_idr: bool,
    /// Auxiliary metadata block, already rendered to the device's tagged
    /// record format.
    pub aux_block: Vec<u8>,
    pub resolution: Resolution,
    pub bit_depth: BitDepth,
    pub start_of_stream: bool,
    /// An end-of-stream marker; `storage` is `None` and no picture data
    /// accompanies it.
    pub end_of_stream: bool,
}

/// One compressed access unit as returned by the device.
#[derive(Debug, Clone)]
pub struct DevicePacket {
    /// Raw bytes as read from the device, starting with `meta_size` bytes of
    /// metadata header the caller must skip.
    pub data: Vec<u8>,
    pub meta_size: usize,
    pub pts: i64,
    pub picture_type: PictureType,
    /// Hardware frame index released by this packet, if any.
    pub recycle_index: Option<u16>,
    pub end_of_stream: bool,
}

impl DevicePacket {
    pub fn payload(&self) -> &[u8] {
        &self.data[self.meta_size..]
    }
}

/// Result of a non-failing frame write.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The device consumed the frame; `bytes` were transferred.
    Accepted { bytes: usize },
    /// The device's input queue is full. The frame was not consumed and must
    /// be retried unchanged.
    WouldBlock,
}

/// Result of a non-failing packet read.
#[derive(Debug)]
pub enum ReadOutcome {
    Packet(DevicePacket),
    /// No packet is ready yet.
    WouldBlock,
    /// The session is drained; no further packet will ever be produced.
    Eof,
}

/// The device's state for one encode (or decode) stream.
///
/// Fault reporting: a transient fault the device can clear through a session
/// close/reopen cycle is `Err(VideoError::RecoverableFault)`; anything else
/// is fatal for the session.
pub trait DeviceSession {
    /// Submit one frame (or end-of-stream marker) to the device.
    fn write_frame(&mut self, frame: &DeviceFrame) -> VideoResult<WriteOutcome>;

    /// Retrieve the next compressed packet, if one is ready.
    fn read_packet(&mut self) -> VideoResult<ReadOutcome>;

    /// The out-of-band parameter-set header bytes for this session's
    /// configuration.
    fn stream_header(&mut self) -> VideoResult<Vec<u8>>;

    /// Reconfigure the session in place for a new geometry. Only valid when
    /// the new resolution fits within the originally configured one and the
    /// pixel format and bit depth are unchanged.
    fn reconfigure(&mut self, config: &SessionConfig) -> VideoResult<()>;

    /// Transport handle of the underlying device instance. Hardware surfaces
    /// bound to a previous instance are patched to this value after a
    /// close/reopen cycle.
    fn device_handle(&self) -> i64;

    fn close(&mut self) -> VideoResult<()>;
}

pub trait VideoBackend {
    type Session: DeviceSession;

    /// Open a new session. The returned session is idle until its first
    /// `write_frame`.
    fn open_session(&mut self, config: &SessionConfig) -> VideoResult<Self::Session>;
}
