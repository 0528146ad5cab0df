//! Session-Reflector datapath: turns test packets around on ingress.

use std::sync::atomic::{AtomicU64, Ordering};

use super::{
    field, offsets, refresh_udp_checksum, swap_fields, Classifier, EngineConfig, Verdict,
    STAMP_FRAME_LEN, STAMP_OFFSET,
};
use crate::{
    packets::{ReflectorPacket, SenderPacket, STAMP_PACKET_LEN},
    session::SequenceCounter,
    time::{DatapathClock, NtpTimestamp},
};

/// Aggregate packet counters for the reflector.
#[derive(Debug, Default)]
pub struct ReflectorCounters {
    /// STAMP frames seen on ingress.
    pub packets_received: AtomicU64,
    /// Frames turned around.
    pub packets_reflected: AtomicU64,
    /// Matching frames left untouched (short or not addressed to us).
    pub packets_passed: AtomicU64,
    /// Reflected frames seen leaving on egress.
    pub packets_transmitted: AtomicU64,
}

/// Ingress/egress program pair of the Session-Reflector.
pub struct ReflectorEngine<C> {
    config: EngineConfig,
    classifier: Classifier,
    clock: C,
    seq: SequenceCounter,
    counters: ReflectorCounters,
}

impl<C: DatapathClock> ReflectorEngine<C> {
    pub fn new(config: EngineConfig, clock: C) -> Self {
        Self {
            classifier: Classifier::new(config.port),
            config,
            clock,
            seq: SequenceCounter::new(),
            counters: ReflectorCounters::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn counters(&self) -> &ReflectorCounters {
        &self.counters
    }

    fn now(&self) -> NtpTimestamp {
        NtpTimestamp::encode(self.config.unix_ns(self.clock.tai_ns()))
    }

    /// Ingress hook. Rewrites a test packet into a reflected packet in place
    /// and redirects it out of `ifindex`, the interface it arrived on.
    ///
    /// The frame is left unmodified whenever it is not a complete STAMP test
    /// packet addressed to this reflector.
    pub fn on_ingress(&self, frame: &mut [u8], ifindex: u32) -> Verdict {
        // Receive timestamp first, ahead of any parsing.
        let t2 = self.now();

        if !self.classifier.matches(frame) {
            return Verdict::Pass;
        }
        self.counters.packets_received.fetch_add(1, Ordering::Relaxed);

        let Some((head, tail)) = frame.split_first_chunk_mut::<STAMP_FRAME_LEN>() else {
            self.counters.packets_passed.fetch_add(1, Ordering::Relaxed);
            return Verdict::Pass;
        };
        if !self.config.is_local(field(head, offsets::IP_DST)) {
            self.counters.packets_passed.fetch_add(1, Ordering::Relaxed);
            return Verdict::Pass;
        }

        // From here on every access is inside the fixed-size header block.
        self.turnaround(head, tail, t2);
        self.counters.packets_reflected.fetch_add(1, Ordering::Relaxed);

        Verdict::Redirect { ifindex }
    }

    fn turnaround(&self, head: &mut [u8; STAMP_FRAME_LEN], tail: &[u8], t2: NtpTimestamp) {
        let request = SenderPacket::from_array(&field::<STAMP_PACKET_LEN>(head, STAMP_OFFSET));
        let [ttl] = field::<1>(head, offsets::IP_TTL);
        let seq = self.seq.next();

        let t3 = self.now();
        let answer = ReflectorPacket::reflect(
            &request,
            seq,
            t2,
            t3,
            self.config.error_estimate.to_wire(),
            ttl,
        );
        head[STAMP_OFFSET..].copy_from_slice(&answer.to_bytes());

        swap_fields::<4>(head, offsets::IP_SRC, offsets::IP_DST);
        swap_fields::<6>(head, offsets::ETH_SRC, offsets::ETH_DST);
        refresh_udp_checksum(head, tail);
    }

    /// Egress hook. Reflected packets leave unchanged; only counted here.
    pub fn on_egress(&self, frame: &[u8]) -> Verdict {
        if self.classifier.matches(frame) {
            self.counters
                .packets_transmitted
                .fetch_add(1, Ordering::Relaxed);
        }
        Verdict::Pass
    }

    /// Number of packets reflected so far.
    pub fn reflected(&self) -> u32 {
        self.seq.issued()
    }
}
