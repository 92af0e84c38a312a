// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode-timestamp assignment for packets returned out of input order.
//!
//! The device emits packets in decode order while input frames arrive in
//! presentation order. Submission timestamps are recorded in a ring; each
//! output packet takes the oldest recorded value as its DTS, lagging the
//! submission stream by the GOP's reorder depth. The first `dts_offset`
//! packets have no recorded value that old, so their DTS is guessed backwards
//! from the first frame's PTS (the I frame of an IBBBP stream gets
//! `pts - 3 * ticks_per_frame`, keeping `pts > dts` everywhere).

use log::warn;

const FIFO_SIZE: usize = 256;

pub struct TimestampReorderer {
    ring: [i64; FIFO_SIZE],
    write_idx: u64,
    read_idx: u64,
    dts_offset: u64,
    ticks_per_frame: i64,
    first_frame_pts: Option<i64>,
    gop_offset_count: i64,
    packets_emitted: u64,
    latest_dts: Option<i64>,
}

impl TimestampReorderer {
    pub fn new(dts_offset: u64, ticks_per_frame: i64) -> Self {
        TimestampReorderer {
            ring: [0; FIFO_SIZE],
            write_idx: 0,
            read_idx: 0,
            dts_offset,
            ticks_per_frame,
            first_frame_pts: None,
            gop_offset_count: 0,
            packets_emitted: 0,
            latest_dts: None,
        }
    }

    /// Record the presentation timestamp of a submitted frame.
    pub fn record_submission_pts(&mut self, pts: i64) {
        if self.first_frame_pts.is_none() {
            self.first_frame_pts = Some(pts);
        }
        if self.write_idx - self.read_idx >= FIFO_SIZE as u64 {
            warn!("timestamp ring overflow, dropping oldest submission pts");
            self.read_idx += 1;
        }
        self.ring[(self.write_idx % FIFO_SIZE as u64) as usize] = pts;
        self.write_idx += 1;
    }

    /// Compute the DTS for the next output packet, whose presentation
    /// timestamp is `pts`.
    ///
    /// The result never exceeds `pts`; a violation coming from irregular
    /// input timestamps is clamped with a warning. A DTS regression relative
    /// to the previous packet is logged but not otherwise corrected.
    pub fn next_output_dts(&mut self, pts: i64) -> i64 {
        let mut dts = if self.packets_emitted < self.dts_offset {
            let first = self.first_frame_pts.unwrap_or(pts);
            let guessed =
                first + (self.gop_offset_count - self.dts_offset as i64) * self.ticks_per_frame;
            self.gop_offset_count += 1;
            guessed
        } else if self.read_idx < self.write_idx {
            let recorded = self.ring[(self.read_idx % FIFO_SIZE as u64) as usize];
            self.read_idx += 1;
            recorded
        } else {
            warn!("timestamp ring underrun, using packet pts as dts");
            pts
        };
        self.packets_emitted += 1;

        if dts > pts {
            warn!("dts: {} > pts: {}, forcing dts = pts", dts, pts);
            dts = pts;
        }
        if let Some(latest) = self.latest_dts {
            if dts < latest {
                warn!("dts: {} < latest dts: {}", dts, latest);
            }
        }
        self.latest_dts = Some(dts);
        dts
    }

    /// Forget all recorded state. Called when the session restarts at a
    /// sequence change so the new GOP gets its own guessed window.
    pub fn reset(&mut self) {
        self.write_idx = 0;
        self.read_idx = 0;
        self.first_frame_pts = None;
        self.gop_offset_count = 0;
        self.packets_emitted = 0;
        self.latest_dts = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_delay_takes_recorded_pts_directly() {
        let mut reorderer = TimestampReorderer::new(0, 1);
        for pts in 0..5 {
            reorderer.record_submission_pts(pts);
        }
        for pts in 0..5 {
            assert_eq!(reorderer.next_output_dts(pts), pts);
        }
    }

    #[test]
    fn guessed_window_then_fifo() {
        // IBBBP: PTS 0 1 2 3 4 .. must produce DTS -3 -2 -1 0 1 ..
        let mut reorderer = TimestampReorderer::new(3, 1);
        for pts in 0..8 {
            reorderer.record_submission_pts(pts);
        }
        // Decode order of the first GOP: I(0) P(4) B(2) B(1) B(3), but DTS
        // assignment only depends on emission order.
        let dts: Vec<i64> = [0, 4, 2, 1, 3, 5, 7, 6]
            .iter()
            .map(|&pts| reorderer.next_output_dts(pts))
            .collect();
        assert_eq!(dts, vec![-3, -2, -1, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn dts_never_exceeds_pts() {
        let mut reorderer = TimestampReorderer::new(0, 1);
        reorderer.record_submission_pts(100);
        // The packet claims a pts below the recorded submission value.
        let dts = reorderer.next_output_dts(50);
        assert_eq!(dts, 50);
    }

    #[test]
    fn guess_scales_with_tick_duration() {
        let mut reorderer = TimestampReorderer::new(2, 3003);
        reorderer.record_submission_pts(6006);
        reorderer.record_submission_pts(9009);
        assert_eq!(reorderer.next_output_dts(6006), 6006 - 2 * 3003);
        assert_eq!(reorderer.next_output_dts(9009), 6006 - 3003);
    }

    #[test]
    fn reset_restores_guessing() {
        let mut reorderer = TimestampReorderer::new(1, 1);
        reorderer.record_submission_pts(10);
        reorderer.next_output_dts(10);
        reorderer.reset();
        reorderer.record_submission_pts(20);
        // After reset the first packet is guessed from the new first pts.
        assert_eq!(reorderer.next_output_dts(20), 19);
    }
}
