// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Session-level frame/packet pump for hardware video codec devices.
//!
//! The device itself is an opaque, blocking collaborator behind the traits
//! in [`device`]: it accepts frames, returns compressed packets and recycles
//! hardware frame indices. Everything around that boundary lives here:
//!
//! * [`pump`] — the state machine driving frame submission and packet
//!   retrieval, including mid-stream resolution and bit-depth changes and
//!   recovery from transient device faults;
//! * [`queue`] and [`pool`] — ownership of pending pictures and of in-flight
//!   hardware frame buffers;
//! * [`bitstream`] — NAL scanning and SEI synthesis at the byte and bit
//!   level;
//! * [`assembler`] — assembly of standard-conformant output packets with
//!   correct decode timestamps ([`reorder`]);
//! * [`extract`] — custom-SEI recovery and lone-SEI merging on the decode
//!   input path.

pub mod assembler;
pub mod bitstream;
pub mod device;
pub mod error;
pub mod extract;
pub mod format;
pub mod frame;
pub mod pool;
pub mod pump;
pub mod queue;
pub mod reorder;
pub mod threaded;

pub use error::VideoError;
pub use error::VideoResult;
pub use pump::PumpEvent;
pub use pump::SessionPump;
pub use pump::SessionState;
