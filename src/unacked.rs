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

//! Tracking of packets that were serialized but not yet accounted for.
//!
//! Each record lives from serialization until its payload is acked,
//! declared lost without anything left to resend, or abandoned. Records of
//! retransmissions of one payload share a transmission group so an ack of
//! any of them settles all of them.

use std::cell::RefCell;
use std::cmp;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

use crate::packet::RetransmittableFrames;
use crate::packet::SequenceNumber;
use crate::packet::SequenceNumberLength;
use crate::packet::SequenceNumberSet;
use crate::packet::SerializedPacket;

/// Set of all sequence numbers that ever carried one logical payload,
/// shared by every record in the group.
///
/// The set only grows. Removing a record does not erase its number, so a
/// late ack of an old transmission still sees the full retransmission
/// history of the payload.
type TransmissionGroup = Rc<RefCell<SequenceNumberSet>>;

/// Everything known about one transmission.
#[derive(Debug)]
pub struct TransmissionInfo {
    retransmittable_frames: Option<RetransmittableFrames>,

    sequence_number_length: SequenceNumberLength,

    /// Unset until the packet actually hits the wire.
    sent_time: Option<Instant>,

    bytes_sent: usize,

    /// Number of times a later packet was acked while this one was still
    /// outstanding.
    nack_count: usize,

    /// Whether the packet counts against the congestion window.
    pending: bool,

    all_transmissions: TransmissionGroup,
}

impl TransmissionInfo {
    pub fn retransmittable_frames(&self) -> Option<&RetransmittableFrames> {
        self.retransmittable_frames.as_ref()
    }

    pub fn sequence_number_length(&self) -> SequenceNumberLength {
        self.sequence_number_length
    }

    pub fn sent_time(&self) -> Option<Instant> {
        self.sent_time
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn nack_count(&self) -> usize {
        self.nack_count
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Snapshot of the sequence numbers that carried this payload, in
    /// ascending order.
    pub fn transmissions(&self) -> Vec<SequenceNumber> {
        self.all_transmissions.borrow().iter().copied().collect()
    }

    /// Highest sequence number that ever carried this payload, whether or
    /// not that transmission is still tracked.
    pub fn newest_transmission(&self) -> SequenceNumber {
        // A group always contains at least the record's own number.
        *self.all_transmissions.borrow().iter().next_back().unwrap()
    }
}

/// Keyed collection of transmission records, iterable in ascending
/// sequence-number order.
#[derive(Debug, Default)]
pub struct UnackedPacketMap {
    packets: BTreeMap<SequenceNumber, TransmissionInfo>,

    /// Highest sequence number handed to the wire so far. Zero until the
    /// first send.
    largest_sent_packet: SequenceNumber,
}

impl UnackedPacketMap {
    pub fn new() -> Self {
        UnackedPacketMap::default()
    }

    /// Registers a freshly serialized packet with its own singleton group.
    pub fn add(&mut self, packet: SerializedPacket) {
        debug_assert!(!self.packets.contains_key(&packet.sequence_number));

        let mut group = SequenceNumberSet::new();
        group.insert(packet.sequence_number);

        self.packets.insert(packet.sequence_number, TransmissionInfo {
            retransmittable_frames: packet.retransmittable_frames,
            sequence_number_length: packet.sequence_number_length,
            sent_time: None,
            bytes_sent: 0,
            nack_count: 0,
            pending: false,
            all_transmissions: Rc::new(RefCell::new(group)),
        });
    }

    /// Moves the payload of `old` under `new` and records both in one
    /// group. The new record starts unsent and not pending.
    pub fn on_retransmitted(
        &mut self, old: SequenceNumber, new: SequenceNumber,
    ) {
        let (frames, length, group) = match self.packets.get_mut(&old) {
            Some(info) => {
                debug_assert!(info.retransmittable_frames.is_some());

                info.all_transmissions.borrow_mut().insert(new);

                (
                    info.retransmittable_frames.take(),
                    info.sequence_number_length,
                    Rc::clone(&info.all_transmissions),
                )
            },

            None => {
                debug_assert!(false, "retransmission of untracked packet");
                return;
            },
        };

        self.packets.insert(new, TransmissionInfo {
            retransmittable_frames: frames,
            sequence_number_length: length,
            sent_time: None,
            bytes_sent: 0,
            nack_count: 0,
            pending: false,
            all_transmissions: group,
        });
    }

    /// Marks the packet as in flight.
    pub fn set_pending(
        &mut self, sequence_number: SequenceNumber, sent_time: Instant,
        bytes_sent: usize,
    ) {
        if let Some(info) = self.packets.get_mut(&sequence_number) {
            info.sent_time = Some(sent_time);
            info.bytes_sent = bytes_sent;
            info.pending = true;

            self.largest_sent_packet =
                cmp::max(self.largest_sent_packet, sequence_number);
        }
    }

    pub fn set_not_pending(&mut self, sequence_number: SequenceNumber) {
        if let Some(info) = self.packets.get_mut(&sequence_number) {
            info.pending = false;
        }
    }

    /// Deletes the record. Its number stays in the group history.
    pub fn remove(&mut self, sequence_number: SequenceNumber) {
        let removed = self.packets.remove(&sequence_number);

        debug_assert!(removed.is_some());
        debug_assert!(!removed.is_some_and(|info| info.pending));
    }

    /// Drops the payload but keeps the record, e.g. when a sibling in the
    /// group was acked while this transmission is still tracked by the
    /// congestion controller.
    pub fn neuter(&mut self, sequence_number: SequenceNumber) {
        if let Some(info) = self.packets.get_mut(&sequence_number) {
            info.retransmittable_frames = None;
        }
    }

    /// Raises the nack count to at least `min_nacks`.
    ///
    /// A gap between a missing packet and the largest observed counts as
    /// that many nacks at once, which keeps the threshold meaningful under
    /// stretch acks.
    pub fn nack(&mut self, sequence_number: SequenceNumber, min_nacks: usize) {
        if let Some(info) = self.packets.get_mut(&sequence_number) {
            info.nack_count = cmp::max(info.nack_count + 1, min_nacks);
        }
    }

    /// Drops up to `count` of the oldest records that are neither in
    /// flight nor the newest transmission of their payload, so a peer
    /// whose missing-packets list was truncated can advance it.
    pub fn clear_previous_retransmissions(&mut self, count: usize) {
        let eligible: Vec<SequenceNumber> = self
            .packets
            .iter()
            .filter(|(sn, info)| {
                !info.pending && **sn != info.newest_transmission()
            })
            .map(|(sn, _)| *sn)
            .take(count)
            .collect();

        for sequence_number in eligible {
            self.remove(sequence_number);
        }
    }

    pub fn get(
        &self, sequence_number: SequenceNumber,
    ) -> Option<&TransmissionInfo> {
        self.packets.get(&sequence_number)
    }

    pub fn iter(&self) -> btree_map::Iter<SequenceNumber, TransmissionInfo> {
        self.packets.iter()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn is_unacked(&self, sequence_number: SequenceNumber) -> bool {
        self.packets.contains_key(&sequence_number)
    }

    pub fn is_pending(&self, sequence_number: SequenceNumber) -> bool {
        self.packets
            .get(&sequence_number)
            .is_some_and(|info| info.pending)
    }

    pub fn has_unacked_packets(&self) -> bool {
        !self.packets.is_empty()
    }

    pub fn has_pending_packets(&self) -> bool {
        self.packets.values().any(|info| info.pending)
    }

    pub fn has_multiple_pending_packets(&self) -> bool {
        self.packets.values().filter(|info| info.pending).nth(1).is_some()
    }

    /// Whether any in-flight packet still carries a payload that could be
    /// retransmitted.
    pub fn has_unacked_retransmittable_frames(&self) -> bool {
        self.packets
            .values()
            .any(|info| info.pending && info.retransmittable_frames.is_some())
    }

    pub fn has_retransmittable_frames(
        &self, sequence_number: SequenceNumber,
    ) -> bool {
        self.packets
            .get(&sequence_number)
            .is_some_and(|info| info.retransmittable_frames.is_some())
    }

    pub fn least_unacked_sent(&self) -> Option<SequenceNumber> {
        self.packets.keys().next().copied()
    }

    pub fn largest_sent(&self) -> SequenceNumber {
        self.largest_sent_packet
    }

    /// Send time of the oldest in-flight packet.
    pub fn first_pending_sent_time(&self) -> Option<Instant> {
        self.packets
            .values()
            .find(|info| info.pending)
            .and_then(|info| info.sent_time)
    }

    /// Send time of the newest in-flight packet.
    pub fn last_packet_sent_time(&self) -> Option<Instant> {
        self.packets
            .values()
            .rev()
            .find(|info| info.pending)
            .and_then(|info| info.sent_time)
    }

    /// Send time of the oldest in-flight packet that still carries a
    /// payload. Used as the base of the tail loss probe timer.
    pub fn first_retransmittable_sent_time(&self) -> Option<Instant> {
        self.packets
            .values()
            .find(|info| {
                info.pending && info.retransmittable_frames.is_some()
            })
            .and_then(|info| info.sent_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::packet::EncryptionLevel;
    use crate::packet::Frame;

    use std::time::Duration;

    fn retransmittable_packet(sequence_number: SequenceNumber) -> SerializedPacket {
        let mut frames = RetransmittableFrames::new(EncryptionLevel::ForwardSecure);
        frames.push(Frame::Stream {
            stream_id: 3,
            offset: 0,
            fin: false,
            data: vec![1, 2, 3],
        });

        SerializedPacket {
            sequence_number,
            sequence_number_length: SequenceNumberLength::TwoBytes,
            retransmittable_frames: Some(frames),
        }
    }

    fn ack_only_packet(sequence_number: SequenceNumber) -> SerializedPacket {
        SerializedPacket {
            sequence_number,
            sequence_number_length: SequenceNumberLength::TwoBytes,
            retransmittable_frames: None,
        }
    }

    #[test]
    fn add_and_query() {
        let mut unacked = UnackedPacketMap::new();
        assert!(!unacked.has_unacked_packets());

        unacked.add(retransmittable_packet(1));

        assert!(unacked.is_unacked(1));
        assert!(!unacked.is_pending(1));
        assert!(!unacked.has_pending_packets());
        assert!(unacked.has_retransmittable_frames(1));
        assert_eq!(unacked.least_unacked_sent(), Some(1));
        assert_eq!(unacked.largest_sent(), 0);

        let info = unacked.get(1).unwrap();
        assert_eq!(info.sent_time(), None);
        assert_eq!(info.transmissions(), vec![1]);
        assert_eq!(info.newest_transmission(), 1);
    }

    #[test]
    fn pending_transitions() {
        let mut unacked = UnackedPacketMap::new();
        unacked.add(retransmittable_packet(1));

        let now = Instant::now();
        unacked.set_pending(1, now, 1200);

        assert!(unacked.is_pending(1));
        assert!(unacked.has_pending_packets());
        assert!(!unacked.has_multiple_pending_packets());
        assert_eq!(unacked.largest_sent(), 1);
        assert_eq!(unacked.get(1).unwrap().bytes_sent(), 1200);
        assert_eq!(unacked.first_pending_sent_time(), Some(now));

        unacked.set_not_pending(1);
        assert!(!unacked.has_pending_packets());
    }

    #[test]
    fn retransmission_moves_frames_and_merges_groups() {
        let mut unacked = UnackedPacketMap::new();
        unacked.add(retransmittable_packet(1));

        unacked.on_retransmitted(1, 2);

        // The payload now travels under the new number only.
        assert!(!unacked.has_retransmittable_frames(1));
        assert!(unacked.has_retransmittable_frames(2));

        // Both records share one group.
        assert_eq!(unacked.get(1).unwrap().transmissions(), vec![1, 2]);
        assert_eq!(unacked.get(2).unwrap().transmissions(), vec![1, 2]);
        assert_eq!(unacked.get(1).unwrap().newest_transmission(), 2);

        // Another retransmission keeps growing the same group.
        unacked.on_retransmitted(2, 5);
        assert_eq!(unacked.get(1).unwrap().transmissions(), vec![1, 2, 5]);
        assert!(unacked.has_retransmittable_frames(5));
    }

    #[test]
    fn group_history_survives_removal() {
        let mut unacked = UnackedPacketMap::new();
        unacked.add(retransmittable_packet(1));
        unacked.on_retransmitted(1, 2);

        unacked.remove(2);

        // The old record still knows a newer transmission existed.
        assert_eq!(unacked.get(1).unwrap().newest_transmission(), 2);
        assert_eq!(unacked.get(1).unwrap().transmissions(), vec![1, 2]);
    }

    #[test]
    fn neuter_keeps_record() {
        let mut unacked = UnackedPacketMap::new();
        unacked.add(retransmittable_packet(1));
        unacked.set_pending(1, Instant::now(), 1200);

        unacked.neuter(1);

        assert!(unacked.is_unacked(1));
        assert!(unacked.is_pending(1));
        assert!(!unacked.has_retransmittable_frames(1));
        assert!(!unacked.has_unacked_retransmittable_frames());
    }

    #[test]
    fn nack_count_accumulates() {
        let mut unacked = UnackedPacketMap::new();
        unacked.add(retransmittable_packet(1));

        // A gap of three counts as three nacks at once.
        unacked.nack(1, 3);
        assert_eq!(unacked.get(1).unwrap().nack_count(), 3);

        // Repeated nacks below the floor still make progress.
        unacked.nack(1, 0);
        assert_eq!(unacked.get(1).unwrap().nack_count(), 4);
    }

    #[test]
    fn clear_previous_retransmissions_skips_pending_and_newest() {
        let mut unacked = UnackedPacketMap::new();
        let now = Instant::now();

        // Two retransmitted payloads: 1 -> 3 and 2 -> 4, with the old
        // transmissions no longer in flight.
        for sn in [1, 2] {
            unacked.add(retransmittable_packet(sn));
            unacked.set_pending(sn, now, 1200);
        }

        unacked.on_retransmitted(1, 3);
        unacked.on_retransmitted(2, 4);
        unacked.set_not_pending(1);
        unacked.set_not_pending(2);
        unacked.set_pending(3, now, 1200);
        unacked.set_pending(4, now, 1200);

        unacked.clear_previous_retransmissions(1);

        assert!(!unacked.is_unacked(1));
        assert!(unacked.is_unacked(2));
        assert!(unacked.is_unacked(3));
        assert!(unacked.is_unacked(4));

        unacked.clear_previous_retransmissions(10);

        // Only the remaining old transmission is eligible.
        assert!(!unacked.is_unacked(2));
        assert!(unacked.is_unacked(3));
        assert!(unacked.is_unacked(4));
    }

    #[test]
    fn sent_time_queries() {
        let mut unacked = UnackedPacketMap::new();
        let start = Instant::now();

        unacked.add(ack_only_packet(1));
        unacked.add(retransmittable_packet(2));
        unacked.add(retransmittable_packet(3));

        unacked.set_pending(1, start, 100);
        unacked.set_pending(2, start + Duration::from_millis(10), 1200);
        unacked.set_pending(3, start + Duration::from_millis(20), 1200);

        assert_eq!(unacked.first_pending_sent_time(), Some(start));
        assert_eq!(
            unacked.last_packet_sent_time(),
            Some(start + Duration::from_millis(20))
        );

        // Packet 1 carries no payload, so the probe base skips it.
        assert_eq!(
            unacked.first_retransmittable_sent_time(),
            Some(start + Duration::from_millis(10))
        );

        assert!(unacked.has_multiple_pending_packets());
    }
}
