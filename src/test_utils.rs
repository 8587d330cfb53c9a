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

//! Testing utilities.
//!
//! A controllable clock, a scriptable congestion controller and a
//! recording ack listener, shared by this crate's tests and usable by
//! downstream consumers driving the manager in simulations.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use std::time::Instant;

use crate::clock::Clock;
use crate::congestion::Bandwidth;
use crate::congestion::SendAlgorithm;
use crate::packet::CongestionFeedbackFrame;
use crate::packet::EncryptionLevel;
use crate::packet::Frame;
use crate::packet::RetransmittableFrames;
use crate::packet::SequenceNumber;
use crate::packet::SequenceNumberLength;
use crate::packet::SerializedPacket;
use crate::packet::TransmissionType;
use crate::AckListener;
use crate::Config;

/// A [`Clock`] that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<Instant>,
}

impl ManualClock {
    pub fn new(now: Instant) -> Self {
        ManualClock { now: Cell::new(now) }
    }

    pub fn set_now(&self, now: Instant) {
        self.now.set(now);
    }

    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

impl Clock for ManualClock {
    fn approximate_now(&self) -> Instant {
        self.now.get()
    }
}

/// Calls recorded and answers returned by [`MockSendAlgorithm`].
///
/// Shared behind `Rc` so a test keeps access after the algorithm moves
/// into the manager.
#[derive(Debug)]
pub struct MockSendAlgorithmState {
    pub smoothed_rtt: Duration,
    pub retransmission_delay: Duration,
    pub bandwidth_estimate: Bandwidth,
    pub congestion_window: usize,
    pub time_until_send: Duration,

    /// When set, `on_packet_sent` declines to track packets.
    pub refuse_packets: bool,

    pub sent: Vec<(SequenceNumber, usize)>,
    pub acked: Vec<(SequenceNumber, usize)>,
    pub lost: Vec<SequenceNumber>,
    pub abandoned: Vec<(SequenceNumber, usize)>,
    pub rtt_updates: Vec<Duration>,
    pub retransmission_timeouts: Vec<bool>,
    pub feedback_frames: usize,
    pub configured: bool,
}

impl Default for MockSendAlgorithmState {
    fn default() -> Self {
        MockSendAlgorithmState {
            smoothed_rtt: Duration::ZERO,
            retransmission_delay: Duration::ZERO,
            bandwidth_estimate: Bandwidth::zero(),
            congestion_window: 10 * 1350,
            time_until_send: Duration::ZERO,
            refuse_packets: false,
            sent: Vec::new(),
            acked: Vec::new(),
            lost: Vec::new(),
            abandoned: Vec::new(),
            rtt_updates: Vec::new(),
            retransmission_timeouts: Vec::new(),
            feedback_frames: 0,
            configured: false,
        }
    }
}

/// A scriptable [`SendAlgorithm`] that records every call.
#[derive(Debug, Default)]
pub struct MockSendAlgorithm {
    state: Rc<RefCell<MockSendAlgorithmState>>,
}

impl MockSendAlgorithm {
    /// Returns a handle to the shared state, valid after the algorithm is
    /// moved into a manager.
    pub fn state(&self) -> Rc<RefCell<MockSendAlgorithmState>> {
        Rc::clone(&self.state)
    }

    pub fn set_smoothed_rtt(&mut self, smoothed_rtt: Duration) {
        self.state.borrow_mut().smoothed_rtt = smoothed_rtt;
    }

    pub fn set_retransmission_delay(&mut self, delay: Duration) {
        self.state.borrow_mut().retransmission_delay = delay;
    }

    pub fn set_bandwidth_estimate(&mut self, bandwidth: Bandwidth) {
        self.state.borrow_mut().bandwidth_estimate = bandwidth;
    }

    pub fn refuse_packets(&mut self) {
        self.state.borrow_mut().refuse_packets = true;
    }
}

impl SendAlgorithm for MockSendAlgorithm {
    fn set_from_config(&mut self, _config: &Config, _is_server: bool) {
        self.state.borrow_mut().configured = true;
    }

    fn on_incoming_feedback(
        &mut self, _feedback: &CongestionFeedbackFrame,
        _receive_time: Instant,
    ) {
        self.state.borrow_mut().feedback_frames += 1;
    }

    fn update_rtt(&mut self, rtt: Duration) {
        self.state.borrow_mut().rtt_updates.push(rtt);
    }

    fn on_packet_sent(
        &mut self, _sent_time: Instant, sequence_number: SequenceNumber,
        bytes: usize, _transmission_type: TransmissionType,
        _has_retransmittable_data: bool,
    ) -> bool {
        let mut state = self.state.borrow_mut();

        if state.refuse_packets {
            return false;
        }

        state.sent.push((sequence_number, bytes));
        true
    }

    fn on_packet_acked(
        &mut self, sequence_number: SequenceNumber, acked_bytes: usize,
    ) {
        self.state.borrow_mut().acked.push((sequence_number, acked_bytes));
    }

    fn on_packet_lost(
        &mut self, sequence_number: SequenceNumber, _loss_time: Instant,
    ) {
        self.state.borrow_mut().lost.push(sequence_number);
    }

    fn on_packet_abandoned(
        &mut self, sequence_number: SequenceNumber, abandoned_bytes: usize,
    ) {
        self.state
            .borrow_mut()
            .abandoned
            .push((sequence_number, abandoned_bytes));
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        self.state
            .borrow_mut()
            .retransmission_timeouts
            .push(packets_retransmitted);
    }

    fn time_until_send(
        &mut self, _now: Instant, _transmission_type: TransmissionType,
        _has_retransmittable_data: bool, _is_handshake: bool,
    ) -> Duration {
        self.state.borrow().time_until_send
    }

    fn smoothed_rtt(&self) -> Duration {
        self.state.borrow().smoothed_rtt
    }

    fn retransmission_delay(&self) -> Duration {
        self.state.borrow().retransmission_delay
    }

    fn bandwidth_estimate(&self) -> Bandwidth {
        self.state.borrow().bandwidth_estimate
    }

    fn congestion_window(&self) -> usize {
        self.state.borrow().congestion_window
    }
}

/// An event observed by [`RecordingAckListener`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckEvent {
    Serialized(SequenceNumber),
    Acked(SequenceNumber),
    Renumbered(SequenceNumber, SequenceNumber),
}

/// An [`AckListener`] that records every notification.
#[derive(Debug, Default)]
pub struct RecordingAckListener {
    events: Rc<RefCell<Vec<AckEvent>>>,
}

impl RecordingAckListener {
    /// Returns a handle to the recorded events, valid after the listener
    /// is moved into a manager.
    pub fn events(&self) -> Rc<RefCell<Vec<AckEvent>>> {
        Rc::clone(&self.events)
    }
}

impl AckListener for RecordingAckListener {
    fn on_serialized_packet(&mut self, packet: &SerializedPacket) {
        self.events
            .borrow_mut()
            .push(AckEvent::Serialized(packet.sequence_number));
    }

    fn on_packet_acked(&mut self, sequence_number: SequenceNumber) {
        self.events.borrow_mut().push(AckEvent::Acked(sequence_number));
    }

    fn update_sequence_number(
        &mut self, old: SequenceNumber, new: SequenceNumber,
    ) {
        self.events.borrow_mut().push(AckEvent::Renumbered(old, new));
    }
}

/// A 1200 byte stream packet.
pub fn data_packet(sequence_number: SequenceNumber) -> SerializedPacket {
    let mut frames = RetransmittableFrames::new(EncryptionLevel::ForwardSecure);
    frames.push(Frame::Stream {
        stream_id: 3,
        offset: 0,
        fin: false,
        data: vec![0; 1200],
    });

    SerializedPacket {
        sequence_number,
        sequence_number_length: SequenceNumberLength::TwoBytes,
        retransmittable_frames: Some(frames),
    }
}

/// A crypto handshake packet at the initial encryption level.
pub fn crypto_packet(sequence_number: SequenceNumber) -> SerializedPacket {
    let mut frames = RetransmittableFrames::new(EncryptionLevel::Initial);
    frames.push(Frame::Crypto {
        offset: 0,
        data: vec![0; 1200],
    });

    SerializedPacket {
        sequence_number,
        sequence_number_length: SequenceNumberLength::FourBytes,
        retransmittable_frames: Some(frames),
    }
}

/// A packet with nothing worth retransmitting, e.g. a pure ack.
pub fn ack_only_packet(sequence_number: SequenceNumber) -> SerializedPacket {
    SerializedPacket {
        sequence_number,
        sequence_number_length: SequenceNumberLength::TwoBytes,
        retransmittable_frames: None,
    }
}
