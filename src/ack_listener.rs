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

use crate::packet::SequenceNumber;
use crate::packet::SerializedPacket;

/// Observer informed of the fate of serialized packets.
///
/// The connection registers interest in acks (for example to complete
/// application writes once data is known to have arrived). The manager
/// reports every serialized retransmittable packet, every acked sequence
/// number, and every renumbering caused by a retransmission so the observer
/// can keep following the payload.
pub trait AckListener {
    /// A packet carrying retransmittable frames was serialized.
    fn on_serialized_packet(&mut self, packet: &SerializedPacket);

    /// The peer acknowledged the given sequence number.
    fn on_packet_acked(&mut self, sequence_number: SequenceNumber);

    /// The payload tracked under `old` was reassigned sequence number `new`.
    fn update_sequence_number(
        &mut self, old: SequenceNumber, new: SequenceNumber,
    );
}

/// An [`AckListener`] that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullAckListener;

impl AckListener for NullAckListener {
    fn on_serialized_packet(&mut self, _packet: &SerializedPacket) {}

    fn on_packet_acked(&mut self, _sequence_number: SequenceNumber) {}

    fn update_sequence_number(
        &mut self, _old: SequenceNumber, _new: SequenceNumber,
    ) {
    }
}
