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

//! Packet-level types shared between the manager and its collaborators.

use std::collections::BTreeSet;
use std::time::Duration;

use smallvec::SmallVec;

/// Identifier of one wire transmission.
///
/// Sequence numbers increase monotonically and are never reused, including
/// across retransmissions of the same payload.
pub type SequenceNumber = u64;

/// An ordered set of sequence numbers.
pub type SequenceNumberSet = BTreeSet<SequenceNumber>;

/// Number of bytes used to encode a sequence number on the wire.
///
/// Preserved per packet so a retransmission can be re-serialized with the
/// same encoding as the original.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceNumberLength {
    OneByte = 1,
    TwoBytes = 2,
    FourBytes = 4,
    SixBytes = 6,
}

/// Encryption level a packet was sealed under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionLevel {
    Initial,
    ForwardSecure,
}

/// The kind of transmission, or the reason a packet entered the
/// retransmission queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmissionType {
    /// First transmission of a payload.
    NotRetransmission,

    /// Retransmission triggered by nack counting or early retransmit.
    Nack,

    /// Tail loss probe.
    Tlp,

    /// Retransmission timeout.
    Rto,

    /// Forced retransmission of handshake-era packets, e.g. on version
    /// negotiation or an encryption level change.
    Handshake,
}

/// A single retransmittable frame.
///
/// Wire encoding and decoding happen in the framer; the manager only holds
/// frames so they can be handed back for re-serialization under a new
/// sequence number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Crypto {
        offset: u64,
        data: Vec<u8>,
    },

    Stream {
        stream_id: u64,
        offset: u64,
        fin: bool,
        data: Vec<u8>,
    },

    Ping,
}

impl Frame {
    pub fn is_crypto(&self) -> bool {
        matches!(self, Frame::Crypto { .. })
    }
}

/// The retransmittable payload of one packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetransmittableFrames {
    frames: SmallVec<[Frame; 1]>,

    encryption_level: EncryptionLevel,
}

impl RetransmittableFrames {
    pub fn new(encryption_level: EncryptionLevel) -> Self {
        RetransmittableFrames {
            frames: SmallVec::new(),
            encryption_level,
        }
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn encryption_level(&self) -> EncryptionLevel {
        self.encryption_level
    }

    /// Whether any frame carries crypto handshake data.
    pub fn has_crypto_handshake(&self) -> bool {
        self.frames.iter().any(Frame::is_crypto)
    }
}

/// A packet that has just been serialized, before it hits the wire.
#[derive(Debug)]
pub struct SerializedPacket {
    pub sequence_number: SequenceNumber,

    pub sequence_number_length: SequenceNumberLength,

    /// Absent for packets that carry nothing worth retransmitting (e.g.
    /// pure acks).
    pub retransmittable_frames: Option<RetransmittableFrames>,
}

/// Summary of one incoming ACK frame, as decoded by the framer.
#[derive(Clone, Debug, Default)]
pub struct AckInfo {
    /// The largest sequence number the peer has seen.
    pub largest_observed: SequenceNumber,

    /// Peer-reported delay between receiving `largest_observed` and sending
    /// this ack. `None` when the peer did not report a delay.
    pub delta_time_largest_observed: Option<Duration>,

    /// Sequence numbers at or below `largest_observed` the peer has not
    /// seen.
    pub missing_packets: SequenceNumberSet,

    /// Whether the missing-packets list was cut short by frame size limits.
    pub is_truncated: bool,

    /// Packets the peer did not receive but reconstructed via forward error
    /// correction.
    pub revived_packets: SequenceNumberSet,
}

impl AckInfo {
    /// Whether the peer is still waiting for the given sequence number.
    pub fn is_awaiting(&self, sequence_number: SequenceNumber) -> bool {
        sequence_number > self.largest_observed ||
            self.missing_packets.contains(&sequence_number)
    }
}

/// Congestion feedback reported by the peer.
///
/// The manager forwards it to the congestion controller untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct CongestionFeedbackFrame {
    /// The peer's advertised receive window in bytes.
    pub receive_window: u64,
}
