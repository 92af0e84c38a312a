// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The session pump: drives queued input pictures into a device session and
//! pulls assembled packets back out, surviving mid-stream geometry changes
//! and recoverable device faults without losing frames.

use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::assembler::OutputPacket;
use crate::assembler::PacketAssembler;
use crate::device::DeviceFrame;
use crate::device::DeviceSession;
use crate::device::ReadOutcome;
use crate::device::SessionConfig;
use crate::device::VideoBackend;
use crate::device::WriteOutcome;
use crate::error::VideoError;
use crate::error::VideoResult;
use crate::format::BitDepth;
use crate::format::PictureHint;
use crate::format::Resolution;
use crate::frame::FrameStorage;
use crate::frame::PendingFrame;
use crate::pool::HwFramePool;
use crate::queue::FrameQueue;

/// Lifecycle of one pump. Every boolean question about the session
/// (`started`, `flushing`, ...) is answered by reading this enum; there is
/// no separate flag to fall out of sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Opened, nothing submitted yet.
    Idle,
    /// Steady state: frames go in, packets come out.
    Normal,
    /// The input queue is exhausted after an end of input; the end-of-stream
    /// marker goes (or went) out and the device is draining.
    Flushing,
    /// A queued frame wants a different geometry. An end-of-stream marker
    /// was (or is about to be) submitted to terminate the current coded
    /// sequence; the queue is retained untouched.
    SeqChangeDraining,
    /// The device was reinitialized with the new geometry; the first
    /// retained frame has not been accepted yet.
    SeqChangeOpening,
    /// Transient state while pushing the retained backlog after a
    /// reinitialization, with no new external input.
    QueuedFrameDraining,
    /// End-of-stream was delivered downstream. Sticky.
    Ended,
}

/// What a `receive_packet` call produced.
#[derive(Debug)]
pub enum PumpEvent {
    Packet(OutputPacket),
    /// Nothing ready yet; call again after feeding more input or giving the
    /// device time.
    TryAgain,
    /// The stream is complete. Repeated calls keep returning this.
    EndOfStream,
}

pub struct SessionPump<B: VideoBackend> {
    backend: B,
    session: Option<B::Session>,
    config: SessionConfig,
    state: SessionState,
    queue: FrameQueue,
    pool: HwFramePool,
    assembler: PacketAssembler,
    /// The caller signaled the end of input. Frames supplied afterwards are
    /// a contract violation.
    end_of_input: bool,
    /// The end-of-stream marker for the current drain (flush or sequence
    /// change) has been accepted by the device.
    drain_marker_sent: bool,
    /// Geometry the externally visible config held before a speculative
    /// switch, restored if the first submission at the new geometry fails
    /// fatally.
    speculative_geometry: Option<(Resolution, BitDepth)>,
}

impl<B: VideoBackend> SessionPump<B> {
    pub fn new(mut backend: B, config: SessionConfig) -> VideoResult<Self> {
        let mut session = backend.open_session(&config)?;
        let mut assembler = PacketAssembler::new(&config);
        if config.headers_out_of_band {
            assembler.set_stream_header(session.stream_header()?);
        }
        Ok(SessionPump {
            backend,
            session: Some(session),
            pool: HwFramePool::new(config.hw_frame_pool_size),
            assembler,
            config,
            state: SessionState::Idle,
            queue: FrameQueue::new(),
            end_of_input: false,
            drain_marker_sent: false,
            speculative_geometry: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the pump is draining towards an end of stream or a sequence
    /// change boundary.
    pub fn is_flushing(&self) -> bool {
        self.end_of_input || self.state == SessionState::SeqChangeDraining
    }

    /// Queue one picture for submission, or signal the end of input with
    /// `None`.
    ///
    /// Frames are accepted in any state of an ongoing stream, including mid
    /// sequence change; supplying one after the end of input was signaled is
    /// a contract violation.
    pub fn send_frame(&mut self, frame: Option<PendingFrame>) -> VideoResult<()> {
        match frame {
            None => {
                if !self.end_of_input {
                    debug!("end of input signaled");
                    self.end_of_input = true;
                }
                self.pump_writes()
            }
            Some(frame) => {
                if self.end_of_input || self.state == SessionState::Ended {
                    error!("frame submitted after end of input");
                    return Err(VideoError::InvalidOperation);
                }
                if self.queue.enqueue(frame).is_err() {
                    return Err(VideoError::OutOfMemory);
                }
                self.pump_writes()
            }
        }
    }

    /// Try to retrieve the next assembled packet.
    ///
    /// This also advances the write side: retained frames are pushed after a
    /// reinitialization and pending end-of-stream markers are retried here.
    pub fn receive_packet(&mut self) -> VideoResult<PumpEvent> {
        if self.state == SessionState::Ended {
            return Ok(PumpEvent::EndOfStream);
        }
        self.pump_writes()?;

        let session = self.session.as_mut().ok_or(VideoError::InvalidOperation)?;
        let outcome = match session.read_packet() {
            Ok(outcome) => outcome,
            Err(VideoError::RecoverableFault) => {
                warn!("recoverable device fault on read, resetting session");
                self.reset_session()?;
                return Ok(PumpEvent::TryAgain);
            }
            Err(e) => {
                error!("fatal device error on read in state {:?}", self.state);
                return Err(e);
            }
        };

        let packet = match outcome {
            ReadOutcome::WouldBlock => return Ok(PumpEvent::TryAgain),
            ReadOutcome::Eof => {
                self.state = SessionState::Ended;
                return Ok(PumpEvent::EndOfStream);
            }
            ReadOutcome::Packet(packet) => packet,
        };

        // The device is done reading this hardware frame; its slot can host
        // a new submission.
        if let Some(index) = packet.recycle_index {
            self.pool.recycle(index);
        }

        if packet.end_of_stream {
            // A bare marker carries no access unit and must not consume a
            // timestamp.
            let assembled = if packet.payload().is_empty() {
                None
            } else {
                self.assembler.assemble(&packet)
            };

            // An end of stream while a sequence change drains marks the old
            // sequence's boundary: reopen at the new geometry and resume
            // from the retained queue, without surfacing it downstream.
            if self.state == SessionState::SeqChangeDraining {
                self.reinit_for_sequence_change()?;
                self.pump_writes()?;
                return Ok(match assembled {
                    Some(out) => PumpEvent::Packet(OutputPacket {
                        end_of_stream: false,
                        ..out
                    }),
                    None => PumpEvent::TryAgain,
                });
            }

            self.state = SessionState::Ended;
            return Ok(match assembled {
                Some(out) => PumpEvent::Packet(out),
                None => PumpEvent::EndOfStream,
            });
        }

        Ok(match self.assembler.assemble(&packet) {
            Some(out) => PumpEvent::Packet(out),
            None => PumpEvent::TryAgain,
        })
    }

    /// Make as much write-side progress as the device allows.
    fn pump_writes(&mut self) -> VideoResult<()> {
        loop {
            match self.state {
                SessionState::Ended => return Ok(()),
                SessionState::SeqChangeDraining => {
                    // Only the drain marker goes out; the queue is retained.
                    return self.submit_drain_marker();
                }
                _ => {}
            }
            if self.queue.is_empty() {
                if self.state == SessionState::QueuedFrameDraining {
                    self.state = SessionState::Normal;
                }
                if self.end_of_input {
                    self.state = SessionState::Flushing;
                    return self.submit_drain_marker();
                }
                return Ok(());
            }
            if !self.try_submit_head()? {
                return Ok(());
            }
        }
    }

    /// Submit the head of the queue. `Ok(true)` means progress was made and
    /// the caller should keep pumping; `Ok(false)` means the device is busy.
    fn try_submit_head(&mut self) -> VideoResult<bool> {
        let head = match self.queue.peek_head() {
            Some(head) => head,
            None => return Ok(false),
        };

        // A geometry change cannot be fed to the running sequence; drain it
        // first. With nothing submitted yet there is nothing to drain and
        // the session is simply reshaped.
        if head.resolution != self.config.resolution || head.bit_depth != self.config.bit_depth {
            if self.state == SessionState::Idle {
                self.reinit_for_sequence_change()?;
                return Ok(true);
            }
            info!(
                "sequence change: {} -> {}, draining current sequence",
                self.config.resolution, head.resolution
            );
            self.state = SessionState::SeqChangeDraining;
            self.submit_drain_marker()?;
            return Ok(false);
        }

        let device_frame = DeviceFrame {
            storage: Some(head.storage.clone()),
            pts: head.pts,
            force_idr: head.hint == PictureHint::Idr,
            aux_block: head.aux.to_device_block(),
            resolution: head.resolution,
            bit_depth: head.bit_depth,
            start_of_stream: matches!(
                self.state,
                SessionState::Idle | SessionState::SeqChangeOpening
            ),
            end_of_stream: head.end_of_stream,
        };

        match self.write_to_device(&device_frame)? {
            WriteOutcome::WouldBlock => {
                if self.state == SessionState::QueuedFrameDraining {
                    // Back-pressure ends the backlog drain; the rest goes
                    // out on later pump cycles.
                    self.state = SessionState::Normal;
                }
                Ok(false)
            }
            WriteOutcome::Accepted { bytes } => {
                debug!(
                    "frame pts {} sent to device, {} bytes",
                    device_frame.pts, bytes
                );
                let frame = self.queue.pop_head().expect("peeked head disappeared");
                self.on_frame_accepted(frame)?;
                Ok(true)
            }
        }
    }

    /// One device write with fault handling: a recoverable fault resets the
    /// session and reports "busy" so the same frame is retried; fatal errors
    /// restore any speculatively switched geometry before surfacing.
    fn write_to_device(&mut self, device_frame: &DeviceFrame) -> VideoResult<WriteOutcome> {
        let session = self.session.as_mut().ok_or(VideoError::InvalidOperation)?;
        match session.write_frame(device_frame) {
            Ok(outcome) => Ok(outcome),
            Err(VideoError::RecoverableFault) => {
                warn!("recoverable device fault on write, resetting session");
                self.reset_session()?;
                Ok(WriteOutcome::WouldBlock)
            }
            Err(e) => {
                if let Some((resolution, bit_depth)) = self.speculative_geometry.take() {
                    self.config.resolution = resolution;
                    self.config.bit_depth = bit_depth;
                }
                error!("fatal device error on write in state {:?}", self.state);
                Err(e)
            }
        }
    }

    fn on_frame_accepted(&mut self, frame: PendingFrame) -> VideoResult<()> {
        self.speculative_geometry = None;
        self.assembler.record_submission_pts(frame.pts);
        let seis = frame.aux.custom_seis().cloned().collect::<Vec<_>>();
        self.assembler.stash_custom_seis(frame.pts, seis);

        // Ownership of a hardware-backed frame moves to the pool until the
        // device recycles its index.
        if let FrameStorage::Hardware(_) = &frame.storage {
            let slot = self
                .pool
                .acquire_free_slot()
                .map_err(|_| VideoError::PoolExhausted)?;
            self.pool
                .bind(slot, frame.storage)
                .map_err(|e| VideoError::BackendFailure(anyhow::anyhow!(e)))?;
        }

        if frame.end_of_stream {
            // The caller tagged the last picture instead of sending a
            // separate end marker.
            self.end_of_input = true;
            self.drain_marker_sent = true;
        }
        match self.state {
            SessionState::Idle => self.state = SessionState::Normal,
            SessionState::SeqChangeOpening => {
                self.state = if self.queue.is_empty() {
                    SessionState::Normal
                } else {
                    SessionState::QueuedFrameDraining
                };
            }
            _ => {}
        }
        Ok(())
    }

    /// Submit (or retry) the end-of-stream marker that terminates the
    /// current coded sequence.
    fn submit_drain_marker(&mut self) -> VideoResult<()> {
        if self.drain_marker_sent {
            return Ok(());
        }
        let marker = DeviceFrame {
            storage: None,
            pts: 0,
            force_idr: false,
            aux_block: Vec::new(),
            resolution: self.config.resolution,
            bit_depth: self.config.bit_depth,
            start_of_stream: false,
            end_of_stream: true,
        };
        if let WriteOutcome::Accepted { .. } = self.write_to_device(&marker)? {
            self.drain_marker_sent = true;
        }
        Ok(())
    }

    /// Tear down and reopen the device session with the same configuration
    /// after a recoverable fault. The frame being written stays at the head
    /// of the queue and is retried by the next pump cycle.
    fn reset_session(&mut self) -> VideoResult<()> {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close() {
                warn!("error closing faulted session: {}", e);
            }
        }
        let mut session = self.backend.open_session(&self.config)?;
        self.pool.rebind_device_handle(session.device_handle());
        if self.config.headers_out_of_band {
            self.assembler.set_stream_header(session.stream_header()?);
        }
        self.session = Some(session);
        // A drain marker the dead session had accepted died with it.
        if self.is_flushing() {
            self.drain_marker_sent = false;
        }
        Ok(())
    }

    /// Reshape the session for the geometry of the retained queue's head:
    /// fast reconfigure when the new geometry fits inside the original
    /// allocation, full teardown and reopen otherwise.
    fn reinit_for_sequence_change(&mut self) -> VideoResult<()> {
        let (resolution, bit_depth) = match self.queue.peek_head() {
            Some(head) => (head.resolution, head.bit_depth),
            None => {
                warn!("sequence change with an empty queue");
                self.state = SessionState::Normal;
                return Ok(());
            }
        };

        let old_resolution = self.config.resolution;
        let old_bit_depth = self.config.bit_depth;
        self.speculative_geometry = Some((old_resolution, old_bit_depth));
        self.config.resolution = resolution;
        self.config.bit_depth = bit_depth;

        if resolution.fits_within(&old_resolution) && bit_depth == old_bit_depth {
            info!("fast reconfigure to {}", resolution);
            let session = self.session.as_mut().ok_or(VideoError::InvalidOperation)?;
            session.reconfigure(&self.config)?;
        } else {
            info!("reopening session at {}", resolution);
            if let Some(mut session) = self.session.take() {
                if let Err(e) = session.close() {
                    warn!("error closing drained session: {}", e);
                }
            }
            let session = self.backend.open_session(&self.config)?;
            self.pool.rebind_device_handle(session.device_handle());
            self.session = Some(session);
        }

        self.assembler.reset_for_sequence_change();
        if self.config.headers_out_of_band {
            let session = self.session.as_mut().ok_or(VideoError::InvalidOperation)?;
            let header = session.stream_header()?;
            self.assembler.set_stream_header(header);
        }
        self.drain_marker_sent = false;
        self.state = SessionState::SeqChangeOpening;
        Ok(())
    }

    /// Drop the session and every queued frame. Queued frames are only
    /// discarded here and on drop, never silently during pumping.
    pub fn close(&mut self) -> VideoResult<()> {
        self.queue.clear();
        self.pool.clear();
        self.state = SessionState::Ended;
        if let Some(mut session) = self.session.take() {
            session.close()?;
        }
        Ok(())
    }
}
