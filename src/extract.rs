// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Preprocessing of compressed packets on their way into the device's
//! decode path.
//!
//! The device-side parser cannot digest vendor-custom SEI, so custom
//! payloads are pulled out here and re-attached to the decoded frame as side
//! data. Access units consisting of SEI alone are worse: the device rejects
//! them outright, so they are held back and merged into the next packet that
//! carries something else.

use log::warn;

use crate::bitstream::nal;
use crate::format::Format;
use crate::frame::CustomSei;

/// Upper bound on the bytes parked in the lone-SEI cache. A lone-SEI packet
/// that would push the cache past this is dropped with a warning.
pub const LONE_SEI_CACHE_MAX: usize = 64 * 1024;

/// What became of one scanned input packet.
pub struct ScannedInput {
    /// Bytes to hand to the device: the packet itself, prefixed with any
    /// previously cached lone SEI. `None` when the whole packet was parked
    /// in the cache (or dropped) and nothing should be written yet.
    pub device_data: Option<Vec<u8>>,
    /// Custom SEI extracted from the packet, to be attached to the frame
    /// decoded from it.
    pub custom_seis: Vec<CustomSei>,
}

pub struct InputScanner {
    codec: Format,
    /// SEI payload type configured for passthrough, if any.
    passthrough_type: Option<u8>,
    lone_sei: Vec<u8>,
}

impl InputScanner {
    pub fn new(codec: Format, passthrough_type: Option<u8>) -> Self {
        InputScanner {
            codec,
            passthrough_type,
            lone_sei: Vec::new(),
        }
    }

    /// Scan one compressed input packet, extracting custom SEI and resolving
    /// the lone-SEI cache.
    pub fn scan(&mut self, data: &[u8]) -> ScannedInput {
        let custom_seis = nal::extract_custom_seis(self.codec, data, self.passthrough_type);
        let summary = nal::scan_access_unit(self.codec, data);

        if summary.sei_only {
            if self.lone_sei.len() + data.len() > LONE_SEI_CACHE_MAX {
                warn!(
                    "lone sei packet of {} bytes would overflow the cache, dropping",
                    data.len()
                );
            } else {
                self.lone_sei.extend_from_slice(data);
            }
            return ScannedInput {
                device_data: None,
                custom_seis,
            };
        }

        let device_data = if self.lone_sei.is_empty() {
            data.to_vec()
        } else {
            let mut merged = std::mem::take(&mut self.lone_sei);
            merged.extend_from_slice(data);
            merged
        };
        ScannedInput {
            device_data: Some(device_data),
            custom_seis,
        }
    }

    /// Bytes currently parked in the lone-SEI cache.
    pub fn cached_bytes(&self) -> usize {
        self.lone_sei.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::sei::encode_custom_sei_nal;
    use crate::frame::SeiPlacement;

    fn slice_au() -> Vec<u8> {
        let mut au = vec![0, 0, 0, 1, 0x26, 0x01];
        au.extend_from_slice(&[0x77; 12]);
        au
    }

    fn lone_sei_au(payload: Vec<u8>) -> Vec<u8> {
        encode_custom_sei_nal(
            Format::Hevc,
            &CustomSei {
                payload_type: 5,
                placement: SeiPlacement::BeforeVcl,
                payload,
            },
        )
        .unwrap()
    }

    #[test]
    fn lone_sei_cached_and_merged_into_next_packet() {
        let mut scanner = InputScanner::new(Format::Hevc, Some(5));

        let lone = lone_sei_au(vec![1, 2, 3]);
        let scanned = scanner.scan(&lone);
        assert!(scanned.device_data.is_none());
        assert_eq!(scanned.custom_seis.len(), 1);
        assert_eq!(scanner.cached_bytes(), lone.len());

        let slice = slice_au();
        let scanned = scanner.scan(&slice);
        let mut expected = lone;
        expected.extend_from_slice(&slice);
        assert_eq!(scanned.device_data, Some(expected));
        assert_eq!(scanner.cached_bytes(), 0);
    }

    #[test]
    fn several_lone_seis_accumulate_in_order() {
        let mut scanner = InputScanner::new(Format::Hevc, Some(5));
        let first = lone_sei_au(vec![1]);
        let second = lone_sei_au(vec![2]);
        scanner.scan(&first);
        scanner.scan(&second);

        let slice = slice_au();
        let merged = scanner.scan(&slice).device_data.unwrap();
        let mut expected = first;
        expected.extend_from_slice(&second);
        expected.extend_from_slice(&slice);
        assert_eq!(merged, expected);
    }

    #[test]
    fn overflowing_lone_sei_is_dropped() {
        let mut scanner = InputScanner::new(Format::Hevc, Some(5));
        let big = lone_sei_au(vec![0xAA; 4000]);
        let mut cached = 0;
        // Fill the cache until a packet stops fitting.
        while scanner.cached_bytes() + big.len() <= LONE_SEI_CACHE_MAX {
            scanner.scan(&big);
            cached = scanner.cached_bytes();
        }
        // One more is dropped, leaving the cache unchanged.
        scanner.scan(&big);
        assert_eq!(scanner.cached_bytes(), cached);
    }

    #[test]
    fn ordinary_packet_passes_through_untouched() {
        let mut scanner = InputScanner::new(Format::Hevc, None);
        let slice = slice_au();
        let scanned = scanner.scan(&slice);
        assert_eq!(scanned.device_data, Some(slice));
        assert!(scanned.custom_seis.is_empty());
    }
}
