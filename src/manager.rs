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

//! The sent-packet manager.
//!
//! Tracks every outgoing packet from serialization until it is acked,
//! declared lost or abandoned, decides what to retransmit and when, and
//! feeds RTT samples to the congestion controller. A single timer serves
//! three regimes: handshake retransmission while crypto packets are
//! outstanding, tail loss probes after that, and the retransmission timeout
//! as the last resort.

use std::cmp;
use std::collections::BTreeMap;
use std::time::Duration;
use std::time::Instant;

use crate::ack_listener::AckListener;
use crate::clock::Clock;
use crate::congestion::Bandwidth;
use crate::congestion::PacingSender;
use crate::congestion::SendAlgorithm;
use crate::packet::AckInfo;
use crate::packet::CongestionFeedbackFrame;
use crate::packet::EncryptionLevel;
use crate::packet::RetransmittableFrames;
use crate::packet::SequenceNumber;
use crate::packet::SequenceNumberLength;
use crate::packet::SequenceNumberSet;
use crate::packet::SerializedPacket;
use crate::packet::TransmissionType;
use crate::stats::ConnectionStats;
use crate::unacked::UnackedPacketMap;
use crate::Config;
use crate::CongestionControlOption;

const DEFAULT_RETRANSMISSION_TIME: Duration = Duration::from_millis(500);

// The TCP RFC calls for a 1 second minimum RTO, but Linux uses 200ms and
// that has held up well in practice.
const MIN_RETRANSMISSION_TIME: Duration = Duration::from_millis(200);

const MAX_RETRANSMISSION_TIME: Duration = Duration::from_secs(60);

const MAX_RETRANSMISSIONS: usize = 10;

// TCP retransmits after 3 nacks.
const NACKS_BEFORE_RETRANSMISSION: usize = 3;

// Only exponentially back off the handshake timer 5 times due to timeouts.
const MAX_HANDSHAKE_RETRANSMISSION_BACKOFFS: usize = 5;

const MIN_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(10);

// Up to two tail loss probes are sent before an RTO fires, per
// draft-dukkipati-tcpm-tcp-loss-probe.
const DEFAULT_MAX_TAIL_LOSS_PROBES: usize = 2;

const MIN_TAIL_LOSS_PROBE_TIMEOUT: Duration = Duration::from_millis(10);

const PACING_GRANULARITY: Duration = Duration::from_micros(1);

/// The timeout regime the shared retransmission timer runs under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RetransmissionTimeoutMode {
    Handshake,
    Tlp,
    Rto,
}

/// Which packets a forced retransmission applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetransmitScope {
    /// Every tracked packet, e.g. after version negotiation.
    AllPackets,

    /// Only packets sealed at the initial encryption level, e.g. after the
    /// keys changed.
    InitialEncryptionOnly,
}

/// Whether a handled packet made it to the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PacketFate {
    ReceivedByPeer,
    NotReceivedByPeer,
}

/// Head of the retransmission queue, handed to the I/O layer so it can
/// re-serialize the payload under a fresh sequence number.
#[derive(Debug)]
pub struct PendingRetransmission<'a> {
    pub sequence_number: SequenceNumber,

    pub transmission_type: TransmissionType,

    pub retransmittable_frames: &'a RetransmittableFrames,

    pub sequence_number_length: SequenceNumberLength,
}

/// Tracks sent packets and drives retransmission and RTT estimation.
///
/// Owned by exactly one connection and driven entirely by it: all
/// operations are synchronous and none block. The congestion controller
/// only ever receives data and returns data, so no callback can re-enter
/// the manager.
pub struct SentPacketManager<'a> {
    unacked_packets: UnackedPacketMap,

    is_server: bool,

    clock: &'a dyn Clock,

    stats: ConnectionStats,

    ack_listener: Box<dyn AckListener>,

    send_algorithm: PacingSender,

    /// Sequence numbers waiting to be resent, with the reason they are
    /// queued. At most one entry per number.
    pending_retransmissions: BTreeMap<SequenceNumber, TransmissionType>,

    /// Latest one-way-corrected RTT sample. `None` until the first
    /// informative ack.
    rtt_sample: Option<Duration>,

    /// Number of payloads whose newest transmission carries crypto
    /// handshake data and is still unacked.
    pending_crypto_packet_count: usize,

    consecutive_rto_count: usize,

    consecutive_tlp_count: usize,

    consecutive_crypto_retransmission_count: usize,

    max_tail_loss_probes: usize,
}

impl<'a> SentPacketManager<'a> {
    pub fn new(
        is_server: bool, clock: &'a dyn Clock,
        ack_listener: Box<dyn AckListener>,
        send_algorithm: Box<dyn SendAlgorithm>,
    ) -> Self {
        SentPacketManager {
            unacked_packets: UnackedPacketMap::new(),

            is_server,

            clock,

            stats: ConnectionStats::default(),

            ack_listener,

            send_algorithm: PacingSender::new(
                send_algorithm,
                PACING_GRANULARITY,
            ),

            pending_retransmissions: BTreeMap::new(),

            rtt_sample: None,

            pending_crypto_packet_count: 0,

            consecutive_rto_count: 0,

            consecutive_tlp_count: 0,

            consecutive_crypto_retransmission_count: 0,

            max_tail_loss_probes: DEFAULT_MAX_TAIL_LOSS_PROBES,
        }
    }

    pub fn set_from_config(&mut self, config: &Config) {
        if let Some(initial_rtt) = config.initial_round_trip_time() {
            // The client seeds its estimate from a previous connection
            // before this point; only the server takes the negotiated
            // value, and only while it has nothing better.
            if self.is_server && self.rtt_sample.is_none() {
                self.rtt_sample = Some(initial_rtt);
                self.send_algorithm.update_rtt(initial_rtt);
            }
        }

        if config.congestion_control() == CongestionControlOption::Pace {
            self.send_algorithm.enable();
        }

        self.send_algorithm.set_from_config(config, self.is_server);
    }

    pub fn set_max_tail_loss_probes(&mut self, max_tail_loss_probes: usize) {
        self.max_tail_loss_probes = max_tail_loss_probes;
    }

    /// Registers a just-serialized packet.
    pub fn on_serialized(&mut self, packet: SerializedPacket) {
        if let Some(frames) = &packet.retransmittable_frames {
            self.ack_listener.on_serialized_packet(&packet);

            if frames.has_crypto_handshake() {
                self.pending_crypto_packet_count += 1;
            }
        }

        self.unacked_packets.add(packet);
    }

    /// Called once the I/O layer has re-serialized a queued retransmission
    /// under `new`. `old` must be at the head of, or at least in, the
    /// retransmission queue.
    pub fn on_retransmitted(
        &mut self, old: SequenceNumber, new: SequenceNumber,
    ) {
        let removed = self.pending_retransmissions.remove(&old);
        debug_assert!(removed.is_some());

        // A listener may be waiting to hear about acks of the original
        // number.
        self.ack_listener.update_sequence_number(old, new);

        self.unacked_packets.on_retransmitted(old, new);
    }

    /// Called after a packet hit the wire. Returns whether the
    /// retransmission timer should be (re)armed.
    pub fn on_sent(
        &mut self, sequence_number: SequenceNumber, sent_time: Instant,
        bytes: usize, transmission_type: TransmissionType,
        has_retransmittable_data: bool,
    ) -> bool {
        debug_assert!(sequence_number > 0);
        debug_assert!(bytes > 0, "cannot send empty packets");

        // The packet can be serialized, sent, and acked before this is
        // called.
        if !self.unacked_packets.is_unacked(sequence_number) {
            return false;
        }

        // Only track packets the send algorithm wants tracked.
        if !self.send_algorithm.on_packet_sent(
            sent_time,
            sequence_number,
            bytes,
            transmission_type,
            has_retransmittable_data,
        ) {
            self.unacked_packets.remove(sequence_number);
            return false;
        }

        let set_retransmission_timer =
            !self.unacked_packets.has_pending_packets();

        self.unacked_packets
            .set_pending(sequence_number, sent_time, bytes);

        // The handshake and tail-loss-probe schedules are re-armed on every
        // send to keep their tight deadlines.
        set_retransmission_timer ||
            self.retransmission_mode() != RetransmissionTimeoutMode::Rto
    }

    /// Processes one incoming ACK frame.
    pub fn on_ack(
        &mut self, received_info: &AckInfo, ack_receive_time: Instant,
    ) {
        // The peer-reported delay is only meaningful for the largest
        // observed packet, so an RTT sample is only taken when that packet
        // is newly acked.
        let largest_observed_acked = self
            .unacked_packets
            .is_unacked(received_info.largest_observed);

        self.maybe_update_rtt(received_info, ack_receive_time);

        self.handle_ack_for_sent_packets(received_info);

        self.maybe_retransmit_on_ack(received_info, ack_receive_time);

        if largest_observed_acked {
            // Forward progress; the backoff schedules start over.
            self.consecutive_rto_count = 0;
            self.consecutive_tlp_count = 0;
            self.consecutive_crypto_retransmission_count = 0;
        }
    }

    /// Drops one packet as never delivered, e.g. when the connection knows
    /// the payload is obsolete.
    pub fn discard_unacked_packet(&mut self, sequence_number: SequenceNumber) {
        self.mark_packet_handled(sequence_number, PacketFate::NotReceivedByPeer);
    }

    fn handle_ack_for_sent_packets(&mut self, received_info: &AckInfo) {
        let acked: Vec<SequenceNumber> = self
            .unacked_packets
            .iter()
            .map(|(sequence_number, _)| *sequence_number)
            .take_while(|sequence_number| {
                *sequence_number <= received_info.largest_observed
            })
            .filter(|sequence_number| {
                !received_info.is_awaiting(*sequence_number)
            })
            .collect();

        for sequence_number in acked {
            // Handling one packet settles its whole transmission group, so
            // later members may already be gone.
            if !self.unacked_packets.is_unacked(sequence_number) {
                continue;
            }

            trace!(
                "{} got an ack for packet {}",
                self.endpoint(),
                sequence_number
            );

            self.mark_packet_handled(
                sequence_number,
                PacketFate::ReceivedByPeer,
            );

            self.ack_listener.on_packet_acked(sequence_number);
        }

        // Packets the peer rebuilt from FEC carry nothing worth resending
        // anymore.
        for &revived in &received_info.revived_packets {
            if !self.unacked_packets.is_unacked(revived) {
                continue;
            }

            if !self.unacked_packets.is_pending(revived) {
                self.unacked_packets.remove(revived);
            } else {
                self.unacked_packets.neuter(revived);
            }
        }

        if received_info.is_truncated {
            // Clear out old transmissions so the peer's missing-packets
            // list can advance past them.
            self.unacked_packets.clear_previous_retransmissions(
                received_info.missing_packets.len() / 2,
            );
        }
    }

    /// Settles one sequence number and, through its transmission group, all
    /// other transmissions of the same payload.
    fn mark_packet_handled(
        &mut self, sequence_number: SequenceNumber, fate: PacketFate,
    ) {
        let (pending, bytes_sent, all_transmissions) =
            match self.unacked_packets.get(sequence_number) {
                Some(info) => (
                    info.is_pending(),
                    info.bytes_sent(),
                    info.transmissions(),
                ),

                None => {
                    debug_assert!(
                        false,
                        "packet is not unacked: {sequence_number}"
                    );
                    error!(
                        "{} packet is not unacked: {}",
                        self.endpoint(),
                        sequence_number
                    );
                    return;
                },
            };

        if pending {
            match fate {
                PacketFate::ReceivedByPeer => self
                    .send_algorithm
                    .on_packet_acked(sequence_number, bytes_sent),

                PacketFate::NotReceivedByPeer => self
                    .send_algorithm
                    .on_packet_abandoned(sequence_number, bytes_sent),
            }

            self.unacked_packets.set_not_pending(sequence_number);
        }

        // The group snapshot includes transmissions that are no longer
        // tracked; the newest one decides whether the retransmissions were
        // wasted work.
        let newest_transmission = *all_transmissions.last().unwrap();

        if newest_transmission != sequence_number {
            self.stats.packets_spuriously_retransmitted += 1;
        }

        let has_crypto_handshake = self
            .unacked_packets
            .get(newest_transmission)
            .and_then(|info| info.retransmittable_frames())
            .is_some_and(RetransmittableFrames::has_crypto_handshake);

        if has_crypto_handshake {
            self.pending_crypto_packet_count -= 1;
        }

        for &transmission in all_transmissions.iter().rev() {
            if !self.unacked_packets.is_unacked(transmission) {
                continue;
            }

            // Whatever the reason it was queued, the payload is settled.
            self.pending_retransmissions.remove(&transmission);

            if has_crypto_handshake {
                // The handshake data is through; no transmission of it
                // needs to stay in flight.
                self.abandon_packet(transmission);
            }

            if self.unacked_packets.is_pending(transmission) {
                self.unacked_packets.neuter(transmission);
            } else {
                self.unacked_packets.remove(transmission);
            }
        }
    }

    /// Nack accounting and loss detection on the ack path.
    fn maybe_retransmit_on_ack(
        &mut self, received_info: &AckInfo, ack_receive_time: Instant,
    ) {
        // Everything still pending at or below the largest observed was
        // reported missing. The gap up to the largest observed counts as
        // that many nacks at once, so a nack threshold meant to tolerate
        // reordering still reacts to stretch acks.
        let nacked: Vec<SequenceNumber> = self
            .unacked_packets
            .iter()
            .take_while(|(sequence_number, _)| {
                **sequence_number <= received_info.largest_observed
            })
            .filter(|(_, info)| info.is_pending())
            .map(|(sequence_number, _)| *sequence_number)
            .collect();

        for sequence_number in nacked {
            debug_assert!(received_info.is_awaiting(sequence_number));

            let min_nacks =
                (received_info.largest_observed - sequence_number) as usize;

            self.unacked_packets.nack(sequence_number, min_nacks);
        }

        let lost_packets = detect_lost_packets(
            &self.unacked_packets,
            received_info.largest_observed,
        );

        for sequence_number in lost_packets {
            trace!(
                "{} packet {} lost",
                self.endpoint(),
                sequence_number
            );

            self.stats.packets_lost += 1;

            self.send_algorithm
                .on_packet_lost(sequence_number, ack_receive_time);

            self.abandon_packet(sequence_number);

            if self
                .unacked_packets
                .has_retransmittable_frames(sequence_number)
            {
                self.mark_for_retransmission(
                    sequence_number,
                    TransmissionType::Nack,
                );
            } else {
                // Nothing left to resend under this number: either a newer
                // transmission carries the payload or the payload already
                // arrived.
                self.unacked_packets.remove(sequence_number);
            }
        }
    }

    /// The armed timer fired; dispatch on the current regime.
    pub fn on_retransmission_timeout(&mut self) {
        debug_assert!(self.unacked_packets.has_pending_packets());

        // One alarm serves all three regimes; which one fired depends on
        // the state at expiry, not on what was armed.
        match self.retransmission_mode() {
            RetransmissionTimeoutMode::Handshake => {
                self.stats.crypto_retransmit_count += 1;
                self.retransmit_crypto_packets();
            },

            RetransmissionTimeoutMode::Tlp => {
                self.stats.tlp_count += 1;
                self.retransmit_oldest_packet();
            },

            RetransmissionTimeoutMode::Rto => {
                self.stats.rto_count += 1;
                self.retransmit_all_packets();
            },
        }
    }

    fn retransmit_crypto_packets(&mut self) {
        debug_assert_eq!(
            self.retransmission_mode(),
            RetransmissionTimeoutMode::Handshake
        );

        self.consecutive_crypto_retransmission_count = cmp::min(
            MAX_HANDSHAKE_RETRANSMISSION_BACKOFFS,
            self.consecutive_crypto_retransmission_count + 1,
        );

        let crypto_packets: Vec<SequenceNumber> = self
            .unacked_packets
            .iter()
            .filter(|(_, info)| {
                // Only packets that are in flight have actually been sent.
                info.is_pending() &&
                    info.retransmittable_frames()
                        .is_some_and(RetransmittableFrames::has_crypto_handshake)
            })
            .map(|(sequence_number, _)| *sequence_number)
            .collect();

        debug_assert!(
            !crypto_packets.is_empty(),
            "no crypto packets found to retransmit"
        );

        for sequence_number in crypto_packets {
            self.mark_for_retransmission(
                sequence_number,
                TransmissionType::Tlp,
            );

            // Free the window now so the retransmissions aren't blocked
            // behind their own originals.
            self.abandon_packet(sequence_number);
        }
    }

    fn retransmit_oldest_packet(&mut self) {
        debug_assert_eq!(
            self.retransmission_mode(),
            RetransmissionTimeoutMode::Tlp
        );

        self.consecutive_tlp_count += 1;

        let probe = self
            .unacked_packets
            .iter()
            .find(|(_, info)| {
                info.is_pending() && info.retransmittable_frames().is_some()
            })
            .map(|(sequence_number, info)| {
                (
                    *sequence_number,
                    info.retransmittable_frames()
                        .is_some_and(RetransmittableFrames::has_crypto_handshake),
                )
            });

        match probe {
            Some((sequence_number, has_crypto_handshake)) => {
                // A handshake packet would have selected handshake mode.
                debug_assert!(!has_crypto_handshake);

                self.mark_for_retransmission(
                    sequence_number,
                    TransmissionType::Tlp,
                );
            },

            None => {
                debug_assert!(
                    false,
                    "no retransmittable packets for tail loss probe"
                );
                error!(
                    "{} no retransmittable packets for tail loss probe",
                    self.endpoint()
                );
            },
        }
    }

    fn retransmit_all_packets(&mut self) {
        trace!(
            "{} retransmission timeout with {} unacked packets",
            self.endpoint(),
            self.unacked_packets.len()
        );

        // Queue every retransmittable packet and let the congestion
        // controller decide how many go out immediately.
        let snapshot: Vec<(SequenceNumber, bool)> = self
            .unacked_packets
            .iter()
            .map(|(sequence_number, info)| {
                (*sequence_number, info.retransmittable_frames().is_some())
            })
            .collect();

        let mut packets_retransmitted = false;

        for (sequence_number, has_frames) in snapshot {
            self.unacked_packets.set_not_pending(sequence_number);

            if has_frames {
                packets_retransmitted = true;

                self.mark_for_retransmission(
                    sequence_number,
                    TransmissionType::Rto,
                );
            }
        }

        self.send_algorithm
            .on_retransmission_timeout(packets_retransmitted);

        if packets_retransmitted {
            self.consecutive_rto_count += 1;
        }
    }

    /// Forces retransmission of tracked packets, e.g. after version
    /// negotiation or an encryption change.
    pub fn retransmit_unacked(&mut self, scope: RetransmitScope) {
        let snapshot: Vec<SequenceNumber> = self
            .unacked_packets
            .iter()
            .map(|(sequence_number, _)| *sequence_number)
            .collect();

        for sequence_number in snapshot {
            let (encryption_level, single_transmission) =
                match self.unacked_packets.get(sequence_number) {
                    Some(info) => (
                        info.retransmittable_frames()
                            .map(RetransmittableFrames::encryption_level),
                        info.transmissions().len() == 1,
                    ),

                    // Dropped while handling an earlier packet.
                    None => continue,
                };

            match encryption_level {
                None => {
                    // No payload here and no sibling transmission that
                    // would resolve it; drop the record.
                    if single_transmission &&
                        scope == RetransmitScope::AllPackets
                    {
                        self.mark_packet_handled(
                            sequence_number,
                            PacketFate::NotReceivedByPeer,
                        );
                    }
                },

                Some(level) => {
                    if scope == RetransmitScope::AllPackets ||
                        level == EncryptionLevel::Initial
                    {
                        self.abandon_packet(sequence_number);

                        self.mark_for_retransmission(
                            sequence_number,
                            TransmissionType::Handshake,
                        );
                    }
                },
            }
        }
    }

    fn mark_for_retransmission(
        &mut self, sequence_number: SequenceNumber,
        transmission_type: TransmissionType,
    ) {
        debug_assert!(self
            .unacked_packets
            .has_retransmittable_frames(sequence_number));
        debug_assert!(self
            .unacked_packets
            .get(sequence_number)
            .is_some_and(|info| info.sent_time().is_some()));

        // An RTO can fire while nack retransmissions of the same data are
        // still queued; the first reason wins.
        self.pending_retransmissions
            .entry(sequence_number)
            .or_insert(transmission_type);
    }

    pub fn has_pending_retransmissions(&self) -> bool {
        !self.pending_retransmissions.is_empty()
    }

    /// Returns the next queued retransmission.
    ///
    /// The queue must not be empty.
    pub fn next_pending_retransmission(&self) -> PendingRetransmission<'_> {
        assert!(
            !self.pending_retransmissions.is_empty(),
            "no pending retransmissions"
        );

        let (&sequence_number, &transmission_type) =
            self.pending_retransmissions.iter().next().unwrap();

        debug_assert!(self.unacked_packets.is_unacked(sequence_number));

        let info = self.unacked_packets.get(sequence_number).unwrap();

        PendingRetransmission {
            sequence_number,
            transmission_type,
            retransmittable_frames: info.retransmittable_frames().unwrap(),
            sequence_number_length: info.sequence_number_length(),
        }
    }

    fn maybe_update_rtt(
        &mut self, received_info: &AckInfo, ack_receive_time: Instant,
    ) {
        // Lower sequence numbers fold the peer's ack aggregation delay into
        // their delta, so only the largest observed packet gives a clean
        // sample. Skip packets that never made it to the wire.
        let sent_time = match self
            .unacked_packets
            .get(received_info.largest_observed)
            .and_then(|info| info.sent_time())
        {
            Some(sent_time) => sent_time,
            None => return,
        };

        let send_delta = ack_receive_time.saturating_duration_since(sent_time);

        match received_info
            .delta_time_largest_observed
            .filter(|delay| send_delta > *delay)
        {
            Some(delay) => self.rtt_sample = Some(send_delta - delay),

            // The peer implied a negative RTT. Use the raw delta as an
            // approximation while there is nothing better, otherwise keep
            // the previous sample.
            None if self.rtt_sample.is_none() => {
                self.rtt_sample = Some(send_delta)
            },

            None => {},
        }

        if let Some(rtt) = self.rtt_sample {
            self.send_algorithm.update_rtt(rtt);
        }
    }

    pub fn on_incoming_feedback(
        &mut self, feedback: &CongestionFeedbackFrame, receive_time: Instant,
    ) {
        self.send_algorithm
            .on_incoming_feedback(feedback, receive_time);
    }

    pub fn time_until_send(
        &mut self, now: Instant, transmission_type: TransmissionType,
        has_retransmittable_data: bool, is_handshake: bool,
    ) -> Duration {
        self.send_algorithm.time_until_send(
            now,
            transmission_type,
            has_retransmittable_data,
            is_handshake,
        )
    }

    /// Absolute deadline of the retransmission timer, or `None` when no
    /// packets are in flight.
    pub fn get_retransmission_time(&self) -> Option<Instant> {
        if !self.unacked_packets.has_pending_packets() {
            return None;
        }

        let now = self.clock.approximate_now();

        match self.retransmission_mode() {
            RetransmissionTimeoutMode::Handshake =>
                Some(now + self.crypto_retransmission_delay()),

            RetransmissionTimeoutMode::Tlp => {
                // The probe is about the oldest outstanding data, so it is
                // based on the earliest pending packet that still carries a
                // payload, and never armed in the past.
                let sent_time = self
                    .unacked_packets
                    .first_retransmittable_sent_time()
                    .unwrap();

                Some(cmp::max(now, sent_time + self.tail_loss_probe_delay()))
            },

            RetransmissionTimeoutMode::Rto => {
                let sent_time =
                    self.unacked_packets.first_pending_sent_time().unwrap();

                // Always wait at least 1.5 * SRTT from now.
                let min_timeout = now + self.smoothed_rtt() * 3 / 2;
                let rto_timeout = sent_time + self.retransmission_delay();

                Some(cmp::max(min_timeout, rto_timeout))
            },
        }
    }

    fn retransmission_mode(&self) -> RetransmissionTimeoutMode {
        debug_assert!(self.unacked_packets.has_pending_packets());

        if self.pending_crypto_packet_count > 0 {
            return RetransmissionTimeoutMode::Handshake;
        }

        if self.consecutive_tlp_count < self.max_tail_loss_probes &&
            self.unacked_packets.has_unacked_retransmittable_frames()
        {
            return RetransmissionTimeoutMode::Tlp;
        }

        RetransmissionTimeoutMode::Rto
    }

    fn crypto_retransmission_delay(&self) -> Duration {
        // Equivalent to the TLP delay but slightly more aggressive, since
        // handshake packets don't wait out a delayed ack.
        let delay =
            cmp::max(MIN_HANDSHAKE_TIMEOUT, self.smoothed_rtt() * 3 / 2);

        delay * (1u32 << self.consecutive_crypto_retransmission_count as u32)
    }

    fn tail_loss_probe_delay(&self) -> Duration {
        let srtt = self.smoothed_rtt();

        if !self.unacked_packets.has_multiple_pending_packets() {
            // With a single packet outstanding the probe also has to wait
            // out the peer's delayed ack.
            return cmp::max(
                srtt * 3 / 2 + self.delayed_ack_time(),
                srtt * 2,
            );
        }

        cmp::max(MIN_TAIL_LOSS_PROBE_TIMEOUT, srtt * 2)
    }

    fn retransmission_delay(&self) -> Duration {
        let mut delay = self.send_algorithm.retransmission_delay();

        if delay.is_zero() {
            // No estimate yet; use the default timeout.
            delay = DEFAULT_RETRANSMISSION_TIME;
        } else if delay < MIN_RETRANSMISSION_TIME {
            delay = MIN_RETRANSMISSION_TIME;
        }

        // Exponential backoff, capped both in exponent and in total.
        delay = delay *
            (1u32 <<
                cmp::min(self.consecutive_rto_count, MAX_RETRANSMISSIONS)
                    as u32);

        cmp::min(delay, MAX_RETRANSMISSION_TIME)
    }

    /// Assumed upper bound on the peer's ack aggregation delay.
    ///
    /// Kept at half the minimum RTO so the delayed ack arrives well before
    /// a retransmission fires; both directions are assumed to take the same
    /// time.
    pub fn delayed_ack_time(&self) -> Duration {
        MIN_RETRANSMISSION_TIME / 2
    }

    fn abandon_packet(&mut self, sequence_number: SequenceNumber) {
        if !self.unacked_packets.is_pending(sequence_number) {
            return;
        }

        let bytes_sent = self
            .unacked_packets
            .get(sequence_number)
            .unwrap()
            .bytes_sent();

        debug_assert!(bytes_sent > 0);

        self.send_algorithm
            .on_packet_abandoned(sequence_number, bytes_sent);

        self.unacked_packets.set_not_pending(sequence_number);
    }

    fn endpoint(&self) -> &'static str {
        if self.is_server {
            "server"
        } else {
            "client"
        }
    }

    pub fn is_unacked(&self, sequence_number: SequenceNumber) -> bool {
        self.unacked_packets.is_unacked(sequence_number)
    }

    pub fn has_unacked_packets(&self) -> bool {
        self.unacked_packets.has_unacked_packets()
    }

    pub fn has_retransmittable_frames(
        &self, sequence_number: SequenceNumber,
    ) -> bool {
        self.unacked_packets
            .has_retransmittable_frames(sequence_number)
    }

    pub fn least_unacked_sent(&self) -> Option<SequenceNumber> {
        self.unacked_packets.least_unacked_sent()
    }

    pub fn rtt_sample(&self) -> Option<Duration> {
        self.rtt_sample
    }

    pub fn smoothed_rtt(&self) -> Duration {
        self.send_algorithm.smoothed_rtt()
    }

    pub fn bandwidth_estimate(&self) -> Bandwidth {
        self.send_algorithm.bandwidth_estimate()
    }

    pub fn congestion_window(&self) -> usize {
        self.send_algorithm.congestion_window()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn pending_crypto_packet_count(&self) -> usize {
        self.pending_crypto_packet_count
    }

    pub fn consecutive_rto_count(&self) -> usize {
        self.consecutive_rto_count
    }

    pub fn consecutive_tlp_count(&self) -> usize {
        self.consecutive_tlp_count
    }

    pub fn consecutive_crypto_retransmission_count(&self) -> usize {
        self.consecutive_crypto_retransmission_count
    }

    pub fn using_pacing(&self) -> bool {
        self.send_algorithm.is_enabled()
    }
}

/// Decides which pending packets at or below `largest_observed` count as
/// lost, based on their nack counts.
///
/// A packet normally needs 3 nacks. When nothing has been sent beyond the
/// largest observed packet there may never be 3 later acks, so for packets
/// that still carry a payload the threshold drops to the distance from the
/// largest observed (early retransmit, RFC 5827).
fn detect_lost_packets(
    unacked_packets: &UnackedPacketMap, largest_observed: SequenceNumber,
) -> SequenceNumberSet {
    let mut lost_packets = SequenceNumberSet::new();

    for (&sequence_number, info) in unacked_packets.iter() {
        if sequence_number > largest_observed {
            break;
        }

        if !info.is_pending() {
            continue;
        }

        let mut num_nacks_needed = NACKS_BEFORE_RETRANSMISSION;

        if info.retransmittable_frames().is_some() &&
            unacked_packets.largest_sent() == largest_observed
        {
            num_nacks_needed = (largest_observed - sequence_number) as usize;
        }

        if info.nack_count() < num_nacks_needed {
            continue;
        }

        lost_packets.insert(sequence_number);
    }

    lost_packets
}
