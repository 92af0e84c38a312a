// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bitstream-level helpers: bit packing, NAL scanning and SEI encoding.

pub mod bitwriter;
pub mod nal;
pub mod sei;
