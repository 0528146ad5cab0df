//! Session-Sender datapath: stamps probes on egress, reads reflections on
//! ingress.

use std::sync::atomic::{AtomicU64, Ordering};

use super::{
    field, offsets, refresh_udp_checksum, Classifier, EngineConfig, Verdict, STAMP_FRAME_LEN,
    STAMP_OFFSET,
};
use crate::{
    packets::{sender_offsets, ReflectorPacket, STAMP_PACKET_LEN},
    session::SequenceCounter,
    time::{DatapathClock, NtpTimestamp},
};

/// The four timestamps of one probe exchange plus both sequence numbers.
///
/// Handed to whatever consumes the sender's ingress hook; correlation and
/// delay computation happen there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSample {
    pub sender_seq: u32,
    pub reflector_seq: u32,
    /// Sender transmit time.
    pub t1: NtpTimestamp,
    /// Reflector receive time.
    pub t2: NtpTimestamp,
    /// Reflector transmit time.
    pub t3: NtpTimestamp,
    /// Sender receive time.
    pub t4: NtpTimestamp,
    /// TTL the reflector saw on the test packet.
    pub sender_ttl: u8,
}

#[derive(Debug, Default)]
pub struct SenderCounters {
    pub packets_stamped: AtomicU64,
    pub packets_returned: AtomicU64,
}

/// Egress/ingress program pair of the Session-Sender.
pub struct SenderEngine<C> {
    config: EngineConfig,
    classifier: Classifier,
    clock: C,
    seq: SequenceCounter,
    counters: SenderCounters,
}

impl<C: DatapathClock> SenderEngine<C> {
    pub fn new(config: EngineConfig, clock: C) -> Self {
        Self {
            classifier: Classifier::new(config.port),
            config,
            clock,
            seq: SequenceCounter::new(),
            counters: SenderCounters::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn counters(&self) -> &SenderCounters {
        &self.counters
    }

    /// Egress hook. Writes the next sequence number, t1 and the error
    /// estimate into an outgoing test packet.
    ///
    /// Always passes the frame on; frames that are not complete test packets
    /// from this probe are not touched.
    pub fn on_egress(&self, frame: &mut [u8]) -> Verdict {
        if !self.classifier.matches(frame) {
            return Verdict::Pass;
        }
        let Some((head, tail)) = frame.split_first_chunk_mut::<STAMP_FRAME_LEN>() else {
            return Verdict::Pass;
        };
        if !self.config.is_local(field(head, offsets::IP_SRC)) {
            return Verdict::Pass;
        }

        let seq = self.seq.next();
        let estimate = self.config.error_estimate.to_wire();

        let at = |offset: usize| STAMP_OFFSET + offset;
        head[at(sender_offsets::SEQ)..at(sender_offsets::T1)].copy_from_slice(&seq.to_be_bytes());
        head[at(sender_offsets::ERROR_ESTIMATE)..at(sender_offsets::MBZ)]
            .copy_from_slice(&estimate.to_be_bytes());

        // t1 as close to transmission as the program gets.
        let t1 = NtpTimestamp::encode(self.config.unix_ns(self.clock.tai_ns()));
        head[at(sender_offsets::T1)..at(sender_offsets::ERROR_ESTIMATE)]
            .copy_from_slice(&t1.to_bytes());
        refresh_udp_checksum(head, tail);

        self.counters.packets_stamped.fetch_add(1, Ordering::Relaxed);
        Verdict::Pass
    }

    /// Ingress hook. Never modifies the frame; returns the exchange's
    /// timestamps when the frame is a reflected packet for this probe.
    pub fn on_ingress(&self, frame: &[u8]) -> Option<ProbeSample> {
        let t4 = NtpTimestamp::encode(self.config.unix_ns(self.clock.tai_ns()));

        if !self.classifier.matches(frame) {
            return None;
        }
        let head = frame.first_chunk::<STAMP_FRAME_LEN>()?;
        if !self.config.is_local(field(head, offsets::IP_DST)) {
            return None;
        }

        let answer = ReflectorPacket::from_array(&field::<STAMP_PACKET_LEN>(head, STAMP_OFFSET));
        self.counters
            .packets_returned
            .fetch_add(1, Ordering::Relaxed);

        Some(ProbeSample {
            sender_seq: answer.sender_seq,
            reflector_seq: answer.seq,
            t1: answer.sender_t1,
            t2: answer.t2,
            t3: answer.t3,
            t4,
            sender_ttl: answer.sender_ttl,
        })
    }

    /// Number of probes stamped so far.
    pub fn stamped(&self) -> u32 {
        self.seq.issued()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::{error_estimate::ErrorEstimate, packets::SenderPacket};

    struct FixedClock(u64);

    impl DatapathClock for FixedClock {
        fn tai_ns(&self) -> u64 {
            self.0
        }
    }

    fn probe_frame(src: [u8; 4]) -> Vec<u8> {
        let mut frame = vec![0u8; STAMP_FRAME_LEN];
        frame[12..14].copy_from_slice(&[0x08, 0x00]);
        frame[14] = 0x45;
        frame[23] = 17;
        frame[26..30].copy_from_slice(&src);
        frame[34..36].copy_from_slice(&862u16.to_be_bytes());
        frame[36..38].copy_from_slice(&862u16.to_be_bytes());
        frame
    }

    #[test]
    fn test_egress_stamps_seq_t1_and_estimate() {
        let config = EngineConfig {
            tai_offset_ns: 37_000_000_000,
            error_estimate: ErrorEstimate::for_clock(true, false),
            ..EngineConfig::default()
        };
        let engine = SenderEngine::new(config, FixedClock(1_037_000_000_000));

        let mut first = probe_frame([10, 0, 0, 1]);
        let mut second = probe_frame([10, 0, 0, 1]);
        assert_eq!(engine.on_egress(&mut first), Verdict::Pass);
        assert_eq!(engine.on_egress(&mut second), Verdict::Pass);

        let first = SenderPacket::from_bytes(&first[STAMP_OFFSET..]).unwrap();
        let second = SenderPacket::from_bytes(&second[STAMP_OFFSET..]).unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert_eq!(first.t1.decode(), 1_000_000_000_000);
        assert_eq!(first.error_estimate, config.error_estimate.to_wire());
        assert_eq!(engine.stamped(), 2);
    }

    #[test]
    fn test_egress_skips_foreign_source() {
        let config = EngineConfig {
            local_addr: Ipv4Addr::new(10, 0, 0, 1),
            ..EngineConfig::default()
        };
        let engine = SenderEngine::new(config, FixedClock(5));
        let mut frame = probe_frame([10, 0, 0, 2]);
        let original = frame.clone();

        engine.on_egress(&mut frame);
        assert_eq!(frame, original);
        assert_eq!(engine.stamped(), 0);
    }

    #[test]
    fn test_egress_short_probe_untouched() {
        let engine = SenderEngine::new(EngineConfig::default(), FixedClock(5));
        let mut frame = probe_frame([10, 0, 0, 1]);
        frame.truncate(STAMP_FRAME_LEN - 10);
        let original = frame.clone();

        assert_eq!(engine.on_egress(&mut frame), Verdict::Pass);
        assert_eq!(frame, original);
    }

    #[test]
    fn test_ingress_exposes_four_timestamps() {
        let engine = SenderEngine::new(EngineConfig::default(), FixedClock(9_000_000_000));
        let mut frame = probe_frame([10, 0, 0, 2]);
        let request = SenderPacket {
            seq: 41,
            t1: NtpTimestamp::encode(6_000_000_000),
            error_estimate: 0,
            mbz: [0; 30],
        };
        let answer = ReflectorPacket::reflect(
            &request,
            5,
            NtpTimestamp::encode(7_000_000_000),
            NtpTimestamp::encode(8_000_000_000),
            0,
            60,
        );
        frame[STAMP_OFFSET..].copy_from_slice(&answer.to_bytes());
        let original = frame.clone();

        let sample = engine.on_ingress(&frame).unwrap();
        assert_eq!(sample.sender_seq, 41);
        assert_eq!(sample.reflector_seq, 5);
        assert_eq!(sample.t1.decode(), 6_000_000_000);
        assert_eq!(sample.t2.decode(), 7_000_000_000);
        assert_eq!(sample.t3.decode(), 8_000_000_000);
        assert_eq!(sample.t4.decode(), 9_000_000_000);
        assert_eq!(sample.sender_ttl, 60);
        assert_eq!(frame, original);
    }

    #[test]
    fn test_ingress_ignores_truncated_reflection() {
        let engine = SenderEngine::new(EngineConfig::default(), FixedClock(1));
        let frame = probe_frame([10, 0, 0, 2]);
        assert!(engine.on_ingress(&frame[..60]).is_none());
    }
}
