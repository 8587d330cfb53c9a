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

//! Pacing decorator around the congestion controller.
//!
//! Spreads sends over time instead of releasing the whole congestion window
//! in a burst. The decorator exposes the same interface as the wrapped
//! algorithm and delegates everything; it only adds a delay of its own in
//! [`time_until_send`] once a valid RTT estimate exists.
//!
//! [`time_until_send`]: SendAlgorithm::time_until_send

use std::cmp;
use std::time::Duration;
use std::time::Instant;

use crate::packet::CongestionFeedbackFrame;
use crate::packet::SequenceNumber;
use crate::packet::TransmissionType;
use crate::Config;

use super::Bandwidth;
use super::SendAlgorithm;

#[derive(Debug)]
pub struct PacingSender {
    sender: Box<dyn SendAlgorithm>,

    /// Disabled the decorator is a pure pass-through. Enabling is one-way.
    enabled: bool,

    /// Sends due within this much of the pacing deadline go out immediately
    /// instead of bouncing off a timer.
    alarm_granularity: Duration,

    next_packet_send_time: Option<Instant>,

    last_delayed_packet_sent_time: Option<Instant>,

    was_last_send_delayed: bool,

    /// Pacing is pointless without an RTT estimate, so nothing is delayed
    /// until the first sample arrives.
    has_valid_rtt: bool,
}

impl PacingSender {
    pub fn new(
        sender: Box<dyn SendAlgorithm>, alarm_granularity: Duration,
    ) -> Self {
        PacingSender {
            sender,

            enabled: false,

            alarm_granularity,

            next_packet_send_time: None,

            last_delayed_packet_sent_time: None,

            was_last_send_delayed: false,

            has_valid_rtt: false,
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl SendAlgorithm for PacingSender {
    fn set_from_config(&mut self, config: &Config, is_server: bool) {
        self.sender.set_from_config(config, is_server);
    }

    fn on_incoming_feedback(
        &mut self, feedback: &CongestionFeedbackFrame, receive_time: Instant,
    ) {
        self.sender.on_incoming_feedback(feedback, receive_time);
    }

    fn update_rtt(&mut self, rtt: Duration) {
        self.has_valid_rtt = true;
        self.sender.update_rtt(rtt);
    }

    fn on_packet_sent(
        &mut self, sent_time: Instant, sequence_number: SequenceNumber,
        bytes: usize, transmission_type: TransmissionType,
        has_retransmittable_data: bool,
    ) -> bool {
        if self.enabled && self.has_valid_rtt {
            let delay = self.sender.bandwidth_estimate().transfer_time(bytes);

            if self.was_last_send_delayed {
                // The alarm can take a while to get invoked; let the
                // connection make up for lost time.
                let next = self.next_packet_send_time.unwrap_or(sent_time) +
                    delay;

                self.next_packet_send_time = Some(next);

                let application_limited = self
                    .last_delayed_packet_sent_time
                    .is_some_and(|last| sent_time > last + delay);

                let making_up_for_lost_time = next <= sent_time;

                if making_up_for_lost_time || application_limited {
                    self.was_last_send_delayed = false;
                    self.last_delayed_packet_sent_time = None;
                } else {
                    self.last_delayed_packet_sent_time = Some(sent_time);
                }
            } else {
                let base = cmp::max(
                    self.next_packet_send_time.unwrap_or(sent_time),
                    sent_time,
                );

                self.next_packet_send_time = Some(base + delay);
            }
        }

        self.sender.on_packet_sent(
            sent_time,
            sequence_number,
            bytes,
            transmission_type,
            has_retransmittable_data,
        )
    }

    fn on_packet_acked(
        &mut self, sequence_number: SequenceNumber, acked_bytes: usize,
    ) {
        self.sender.on_packet_acked(sequence_number, acked_bytes);
    }

    fn on_packet_lost(
        &mut self, sequence_number: SequenceNumber, loss_time: Instant,
    ) {
        self.sender.on_packet_lost(sequence_number, loss_time);
    }

    fn on_packet_abandoned(
        &mut self, sequence_number: SequenceNumber, abandoned_bytes: usize,
    ) {
        self.sender.on_packet_abandoned(sequence_number, abandoned_bytes);
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        self.sender.on_retransmission_timeout(packets_retransmitted);
    }

    fn time_until_send(
        &mut self, now: Instant, transmission_type: TransmissionType,
        has_retransmittable_data: bool, is_handshake: bool,
    ) -> Duration {
        let time_until_send = self.sender.time_until_send(
            now,
            transmission_type,
            has_retransmittable_data,
            is_handshake,
        );

        if !self.enabled || !self.has_valid_rtt {
            return time_until_send;
        }

        if !time_until_send.is_zero() {
            // The underlying sender is blocking anyway.
            return time_until_send;
        }

        match self.next_packet_send_time {
            Some(next) if next > now + self.alarm_granularity => {
                self.was_last_send_delayed = true;
                next - now
            },

            _ => Duration::ZERO,
        }
    }

    fn smoothed_rtt(&self) -> Duration {
        self.sender.smoothed_rtt()
    }

    fn retransmission_delay(&self) -> Duration {
        self.sender.retransmission_delay()
    }

    fn bandwidth_estimate(&self) -> Bandwidth {
        self.sender.bandwidth_estimate()
    }

    fn congestion_window(&self) -> usize {
        self.sender.congestion_window()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::packet::TransmissionType;
    use crate::test_utils::MockSendAlgorithm;

    fn paced_sender(bytes_per_second: u64) -> PacingSender {
        let mut algorithm = MockSendAlgorithm::default();
        algorithm.set_bandwidth_estimate(Bandwidth::from_bytes_per_second(
            bytes_per_second,
        ));

        let mut pacer = PacingSender::new(
            Box::new(algorithm),
            Duration::from_micros(1),
        );
        pacer.enable();
        pacer
    }

    #[test]
    fn passthrough_when_disabled() {
        let algorithm = MockSendAlgorithm::default();
        let mut pacer =
            PacingSender::new(Box::new(algorithm), Duration::from_micros(1));

        let now = Instant::now();
        pacer.update_rtt(Duration::from_millis(100));

        assert!(pacer.on_packet_sent(
            now,
            1,
            1200,
            TransmissionType::NotRetransmission,
            true
        ));

        assert_eq!(
            pacer.time_until_send(
                now,
                TransmissionType::NotRetransmission,
                true,
                false
            ),
            Duration::ZERO
        );
    }

    #[test]
    fn no_pacing_before_first_rtt_sample() {
        let mut pacer = paced_sender(1000);

        let now = Instant::now();
        assert!(pacer.on_packet_sent(
            now,
            1,
            1000,
            TransmissionType::NotRetransmission,
            true
        ));

        assert_eq!(
            pacer.time_until_send(
                now,
                TransmissionType::NotRetransmission,
                true,
                false
            ),
            Duration::ZERO
        );
    }

    #[test]
    fn delays_next_send() {
        let mut pacer = paced_sender(1000);
        pacer.update_rtt(Duration::from_millis(100));

        let now = Instant::now();

        // 1000 bytes at 1000 B/s pushes the next send a second out.
        assert!(pacer.on_packet_sent(
            now,
            1,
            1000,
            TransmissionType::NotRetransmission,
            true
        ));

        assert_eq!(
            pacer.time_until_send(
                now,
                TransmissionType::NotRetransmission,
                true,
                false
            ),
            Duration::from_secs(1)
        );

        // Once the pacing deadline passes, sending is allowed again.
        assert_eq!(
            pacer.time_until_send(
                now + Duration::from_secs(1),
                TransmissionType::NotRetransmission,
                true,
                false
            ),
            Duration::ZERO
        );
    }

    #[test]
    fn enable_is_one_way() {
        let mut pacer = paced_sender(1000);
        assert!(pacer.is_enabled());

        pacer.enable();
        assert!(pacer.is_enabled());
    }
}
