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

//! Interface to the congestion controller.
//!
//! The controller is a replaceable strategy consulted by the manager for
//! pacing decisions, RTT updates and per-packet sent/acked/lost/abandoned
//! callbacks. Implementations live outside this crate; only the interface,
//! a bandwidth unit and the pacing decorator are defined here.

pub mod pacing;

use std::fmt::Debug;
use std::time::Duration;
use std::time::Instant;

use crate::packet::CongestionFeedbackFrame;
use crate::packet::SequenceNumber;
use crate::packet::TransmissionType;
use crate::Config;

pub use pacing::PacingSender;

const NUM_NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Rate of transfer in bits per second.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bandwidth {
    bits_per_second: u64,
}

impl Bandwidth {
    pub const fn zero() -> Self {
        Bandwidth { bits_per_second: 0 }
    }

    pub const fn from_bits_per_second(bits_per_second: u64) -> Self {
        Bandwidth { bits_per_second }
    }

    pub const fn from_bytes_per_second(bytes_per_second: u64) -> Self {
        Bandwidth {
            bits_per_second: bytes_per_second * 8,
        }
    }

    pub const fn from_kbits_per_second(k_bits_per_second: u64) -> Self {
        Bandwidth {
            bits_per_second: k_bits_per_second * 1_000,
        }
    }

    pub const fn to_bits_per_second(self) -> u64 {
        self.bits_per_second
    }

    pub const fn to_bytes_per_second(self) -> u64 {
        self.bits_per_second / 8
    }

    pub const fn is_zero(self) -> bool {
        self.bits_per_second == 0
    }

    /// Time it takes to transfer `bytes` at this rate.
    ///
    /// Zero bandwidth transfers nothing, so the transfer time is reported
    /// as zero rather than forever.
    pub fn transfer_time(self, bytes: usize) -> Duration {
        if self.bits_per_second == 0 {
            return Duration::ZERO;
        }

        let num_nano_bits = 8 * bytes as u128 * NUM_NANOS_PER_SECOND as u128;

        Duration::from_nanos(
            (num_nano_bits / self.bits_per_second as u128) as u64,
        )
    }
}

/// Strategy interface for congestion control.
///
/// The manager owns exactly one algorithm, wrapped by [`PacingSender`].
/// Implementations receive data and return data; they never call back into
/// the manager.
pub trait SendAlgorithm: Debug {
    /// Applies negotiated or application-supplied configuration.
    fn set_from_config(&mut self, config: &Config, is_server: bool);

    /// A congestion feedback frame arrived from the peer.
    fn on_incoming_feedback(
        &mut self, feedback: &CongestionFeedbackFrame, receive_time: Instant,
    );

    /// A new RTT sample was taken.
    fn update_rtt(&mut self, rtt: Duration);

    /// Inform that a packet was sent. Returns false if the algorithm
    /// declines to track the packet, in which case it never counts against
    /// the congestion window.
    fn on_packet_sent(
        &mut self, sent_time: Instant, sequence_number: SequenceNumber,
        bytes: usize, transmission_type: TransmissionType,
        has_retransmittable_data: bool,
    ) -> bool;

    fn on_packet_acked(
        &mut self, sequence_number: SequenceNumber, acked_bytes: usize,
    );

    fn on_packet_lost(
        &mut self, sequence_number: SequenceNumber, loss_time: Instant,
    );

    /// The packet no longer counts against the congestion window.
    fn on_packet_abandoned(
        &mut self, sequence_number: SequenceNumber, abandoned_bytes: usize,
    );

    /// Called when an RTO fires. `packets_retransmitted` reports whether
    /// any packet was queued for retransmission as a result.
    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool);

    /// Time until the next packet may be sent. Zero means immediately.
    fn time_until_send(
        &mut self, now: Instant, transmission_type: TransmissionType,
        has_retransmittable_data: bool, is_handshake: bool,
    ) -> Duration;

    /// Smoothed RTT estimate. Zero until the first sample.
    fn smoothed_rtt(&self) -> Duration;

    /// Suggested retransmission timeout. Zero if the algorithm has no
    /// suggestion yet.
    fn retransmission_delay(&self) -> Duration;

    fn bandwidth_estimate(&self) -> Bandwidth;

    /// Size of the current congestion window in bytes.
    fn congestion_window(&self) -> usize;
}
