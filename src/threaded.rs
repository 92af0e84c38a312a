// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Optional latency-hiding write path.
//!
//! A device write blocks for one full round trip. Callers that cannot
//! afford that run the write on a worker thread instead; the bound stays at
//! one in-flight write per session because the next submission joins the
//! previous worker before spawning its own. This is deliberately a bounded
//! queue of depth one, not a pipeline.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread;
use std::thread::JoinHandle;

use anyhow::anyhow;

use crate::device::DeviceFrame;
use crate::device::DeviceSession;
use crate::device::WriteOutcome;
use crate::error::VideoError;
use crate::error::VideoResult;

pub struct ThreadedWriter<S: DeviceSession + Send + 'static> {
    /// The session is shared with the read path, which must take the same
    /// lock; writes and reads are serialized, never concurrent.
    session: Arc<Mutex<S>>,
    in_flight: Option<JoinHandle<VideoResult<WriteOutcome>>>,
}

impl<S: DeviceSession + Send + 'static> ThreadedWriter<S> {
    pub fn new(session: Arc<Mutex<S>>) -> Self {
        ThreadedWriter {
            session,
            in_flight: None,
        }
    }

    /// Hand `frame` to a worker for submission, after joining the previous
    /// worker. Returns the outcome of the *previous* write, if there was
    /// one; a `WouldBlock` there means its frame must be resubmitted.
    pub fn begin_write(&mut self, frame: DeviceFrame) -> VideoResult<Option<WriteOutcome>> {
        let previous = self.finish_write()?;
        let session = Arc::clone(&self.session);
        self.in_flight = Some(thread::spawn(move || {
            let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
            session.write_frame(&frame)
        }));
        Ok(previous)
    }

    /// Join the in-flight write, if any, and return its outcome.
    pub fn finish_write(&mut self) -> VideoResult<Option<WriteOutcome>> {
        match self.in_flight.take() {
            None => Ok(None),
            Some(handle) => handle
                .join()
                .map_err(|_| VideoError::BackendFailure(anyhow!("write worker panicked")))?
                .map(Some),
        }
    }

    /// Whether a write is currently outstanding.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }
}

impl<S: DeviceSession + Send + 'static> Drop for ThreadedWriter<S> {
    fn drop(&mut self) {
        // Do not leave a worker holding the session lock past our lifetime.
        let _ = self.finish_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DevicePacket;
    use crate::device::ReadOutcome;
    use crate::device::SessionConfig;
    use crate::format::BitDepth;
    use crate::format::Resolution;

    #[derive(Default)]
    struct RecordingSession {
        written_pts: Vec<i64>,
        block_next: bool,
    }

    impl DeviceSession for RecordingSession {
        fn write_frame(&mut self, frame: &DeviceFrame) -> VideoResult<WriteOutcome> {
            if self.block_next {
                self.block_next = false;
                return Ok(WriteOutcome::WouldBlock);
            }
            self.written_pts.push(frame.pts);
            Ok(WriteOutcome::Accepted { bytes: 1 })
        }

        fn read_packet(&mut self) -> VideoResult<ReadOutcome> {
            Ok(ReadOutcome::WouldBlock)
        }

        fn stream_header(&mut self) -> VideoResult<Vec<u8>> {
            Ok(Vec::new())
        }

        fn reconfigure(&mut self, _config: &SessionConfig) -> VideoResult<()> {
            Ok(())
        }

        fn device_handle(&self) -> i64 {
            0
        }

        fn close(&mut self) -> VideoResult<()> {
            Ok(())
        }
    }

    fn marker(pts: i64) -> DeviceFrame {
        DeviceFrame {
            storage: None,
            pts,
            force_idr: false,
            aux_block: Vec::new(),
            resolution: Resolution {
                width: 320,
                height: 240,
            },
            bit_depth: BitDepth::Depth8,
            start_of_stream: false,
            end_of_stream: false,
        }
    }

    #[test]
    fn writes_are_serialized_in_submission_order() {
        let session = Arc::new(Mutex::new(RecordingSession::default()));
        let mut writer = ThreadedWriter::new(Arc::clone(&session));

        assert_eq!(writer.begin_write(marker(0)).unwrap(), None);
        assert!(writer.is_busy());
        // The second submission joins the first, whose outcome comes back.
        assert_eq!(
            writer.begin_write(marker(1)).unwrap(),
            Some(WriteOutcome::Accepted { bytes: 1 })
        );
        assert_eq!(
            writer.finish_write().unwrap(),
            Some(WriteOutcome::Accepted { bytes: 1 })
        );
        assert!(!writer.is_busy());

        let session = session.lock().unwrap();
        assert_eq!(session.written_pts, vec![0, 1]);
    }

    #[test]
    fn would_block_outcome_reaches_the_caller() {
        let session = Arc::new(Mutex::new(RecordingSession {
            block_next: true,
            ..Default::default()
        }));
        let mut writer = ThreadedWriter::new(Arc::clone(&session));

        writer.begin_write(marker(0)).unwrap();
        assert_eq!(
            writer.finish_write().unwrap(),
            Some(WriteOutcome::WouldBlock)
        );
        // The blocked frame never reached the device; resubmission works.
        writer.begin_write(marker(0)).unwrap();
        writer.finish_write().unwrap();
        assert_eq!(session.lock().unwrap().written_pts, vec![0]);
    }
}
