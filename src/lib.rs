// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! 🏹 Sent-packet tracking and retransmission management for QUIC
//! endpoints.
//!
//! quiver is the send-side bookkeeping core of a QUIC stack: it tracks
//! every outgoing packet from the moment it is serialized until the peer
//! acknowledges it, it is declared lost, or it is abandoned, and it drives
//! retransmission decisions and round-trip-time estimation for the
//! congestion controller. The application is responsible for I/O, framing
//! and timers; quiver tells it what to resend and when the next timer
//! should fire.
//!
//! ## Setup
//!
//! The manager borrows a [`Clock`], observes acks through an
//! [`AckListener`] and owns a congestion controller implementing
//! [`SendAlgorithm`]:
//!
//! ```
//! use quiver::test_utils::MockSendAlgorithm;
//! use quiver::NullAckListener;
//! use quiver::SentPacketManager;
//! use quiver::SystemClock;
//!
//! let clock = SystemClock;
//!
//! let mut manager = SentPacketManager::new(
//!     false, // is_server
//!     &clock,
//!     Box::new(NullAckListener),
//!     Box::new(MockSendAlgorithm::default()),
//! );
//! ```
//!
//! ## Sending and acking
//!
//! Every serialized packet is registered before it hits the wire, and
//! reported again once it has:
//!
//! ```
//! use std::time::Instant;
//!
//! use quiver::packet::AckInfo;
//! use quiver::TransmissionType;
//! # use quiver::test_utils::MockSendAlgorithm;
//! # use quiver::{NullAckListener, SentPacketManager, SystemClock};
//! # let clock = SystemClock;
//! # let mut manager = SentPacketManager::new(
//! #     false,
//! #     &clock,
//! #     Box::new(NullAckListener),
//! #     Box::new(MockSendAlgorithm::default()),
//! # );
//!
//! manager.on_serialized(quiver::test_utils::data_packet(1));
//! manager.on_sent(
//!     1,
//!     Instant::now(),
//!     1200,
//!     TransmissionType::NotRetransmission,
//!     true,
//! );
//!
//! let ack = AckInfo {
//!     largest_observed: 1,
//!     ..Default::default()
//! };
//!
//! manager.on_ack(&ack, Instant::now());
//! assert!(!manager.has_unacked_packets());
//! ```
//!
//! ## Retransmitting
//!
//! When the timer returned by
//! [`get_retransmission_time()`] fires, the I/O layer calls
//! [`on_retransmission_timeout()`] and then drains the retransmission
//! queue, re-serializing each payload under a fresh sequence number:
//!
//! ```no_run
//! # use quiver::test_utils::MockSendAlgorithm;
//! # use quiver::{NullAckListener, SentPacketManager, SystemClock};
//! # let clock = SystemClock;
//! # let mut manager = SentPacketManager::new(
//! #     false,
//! #     &clock,
//! #     Box::new(NullAckListener),
//! #     Box::new(MockSendAlgorithm::default()),
//! # );
//! # let mut next_sequence_number = 2;
//! manager.on_retransmission_timeout();
//!
//! while manager.has_pending_retransmissions() {
//!     let pending = manager.next_pending_retransmission();
//!     let old = pending.sequence_number;
//!
//!     // Re-serialize pending.retransmittable_frames under a new number,
//!     // then tell the manager about the renumbering and the send.
//!     let new = next_sequence_number;
//!     next_sequence_number += 1;
//!
//!     manager.on_retransmitted(old, new);
//!     // ... transmit ... then manager.on_sent(new, ...)
//! }
//! ```
//!
//! [`get_retransmission_time()`]: SentPacketManager::get_retransmission_time
//! [`on_retransmission_timeout()`]: SentPacketManager::on_retransmission_timeout

#[macro_use]
extern crate log;

pub mod ack_listener;
pub mod clock;
pub mod congestion;
pub mod packet;
pub mod stats;
pub mod test_utils;
pub mod unacked;

mod manager;

pub use crate::ack_listener::AckListener;
pub use crate::ack_listener::NullAckListener;
pub use crate::clock::Clock;
pub use crate::clock::SystemClock;
pub use crate::congestion::Bandwidth;
pub use crate::congestion::PacingSender;
pub use crate::congestion::SendAlgorithm;
pub use crate::manager::PendingRetransmission;
pub use crate::manager::RetransmitScope;
pub use crate::manager::SentPacketManager;
pub use crate::packet::AckInfo;
pub use crate::packet::EncryptionLevel;
pub use crate::packet::SequenceNumber;
pub use crate::packet::SequenceNumberLength;
pub use crate::packet::SerializedPacket;
pub use crate::packet::TransmissionType;
pub use crate::stats::ConnectionStats;

use std::time::Duration;

/// How the congestion controller should be driven.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CongestionControlOption {
    /// Let the controller release packets as the window allows.
    #[default]
    Standard,

    /// Wrap the controller with a pacing layer that spreads sends out over
    /// each round trip.
    Pace,
}

/// Connection options that concern the sent-packet manager.
///
/// A configuration object is filled in from the negotiated connection
/// parameters and handed to [`SentPacketManager::set_from_config`]; it is
/// also forwarded to the congestion controller.
#[derive(Clone, Copy, Debug, Default)]
pub struct Config {
    initial_round_trip_time: Duration,

    congestion_control: CongestionControlOption,
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    /// Sets the RTT estimate to start from before any sample exists.
    pub fn set_initial_round_trip_time(&mut self, rtt: Duration) {
        self.initial_round_trip_time = rtt;
    }

    /// The negotiated initial RTT, if any.
    pub fn initial_round_trip_time(&self) -> Option<Duration> {
        if self.initial_round_trip_time.is_zero() {
            return None;
        }

        Some(self.initial_round_trip_time)
    }

    pub fn set_congestion_control(
        &mut self, congestion_control: CongestionControlOption,
    ) {
        self.congestion_control = congestion_control;
    }

    pub fn congestion_control(&self) -> CongestionControlOption {
        self.congestion_control
    }
}
