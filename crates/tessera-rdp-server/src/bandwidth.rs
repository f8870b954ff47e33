//! Bandwidth shaping: a 15-slot bucket window refilled from the
//! estimated (or configured) bitrate, plus the sliding statistics used
//! to estimate the link's average bitrate from autodetect results.

pub const MAX_BUCKET: usize = 15;
pub const MAX_STATISTIC: usize = 30;

/// Encoding bitrate assumed until measurements arrive (bits/s).
const STD_ENCODING_BITRATE: u32 = 10 * 1024 * 1024;

/// Measurements under this byte count say nothing about the link.
const MIN_DATA_SIZE: u32 = 7 * 1024;

#[derive(Debug, Clone, Copy, Default)]
struct Sample {
    bits: u32,
    time_delta_ms: u32,
}

#[derive(Debug)]
pub struct BandwidthMgmt {
    buckets: [u32; MAX_BUCKET],
    current_bucket: usize,
    statistics: [Sample; MAX_STATISTIC],
    current_statistic: usize,
    /// Debt left by frames that overran their buckets (bits).
    pub future_data_size_used: u32,
    suppressed_frames: u32,
    /// Fixed bitrate override; 0 selects autodetect.
    pub configured_bitrate: u32,
    /// Sliding average in KBit/s from the statistics window.
    pub autodetect_bitrate_kbit: u32,
    rtt_in_flight: bool,
    rtt_last_start_ms: u64,
    pub frame_ack_hint: Option<u32>,
}

impl BandwidthMgmt {
    #[must_use]
    pub fn new(configured_bitrate: u32) -> BandwidthMgmt {
        BandwidthMgmt {
            buckets: [0; MAX_BUCKET],
            current_bucket: 0,
            statistics: [Sample::default(); MAX_STATISTIC],
            current_statistic: 0,
            future_data_size_used: 0,
            suppressed_frames: 0,
            configured_bitrate,
            autodetect_bitrate_kbit: 0,
            rtt_in_flight: false,
            rtt_last_start_ms: 0,
            frame_ack_hint: None,
        }
    }

    /// Fill every bucket from `bitrate / fps` (used at activation).
    pub fn init_buckets(&mut self, bitrate: u32, fps: u32) {
        let bitrate = if bitrate == 0 {
            STD_ENCODING_BITRATE
        } else {
            bitrate
        };
        let target = bitrate / fps.max(1);
        self.buckets = [target; MAX_BUCKET];
    }

    /// Advance to the next bucket and refill it, paying back any debt.
    /// Returns the bucket's size: 0 means the next frame is suppressed,
    /// except that after `fps` consecutive suppressions one frame is
    /// forced through to keep the session alive.
    pub fn update_bucket(&mut self, fps: u32) -> u32 {
        self.current_bucket = (self.current_bucket + 1) % MAX_BUCKET;

        let mut target = if self.configured_bitrate != 0 {
            let target = self.configured_bitrate / fps.max(1);
            self.buckets[self.current_bucket] = target;
            return target;
        } else if self.autodetect_bitrate_kbit > 20 {
            self.autodetect_bitrate_kbit * 1024 / fps.max(1)
        } else {
            STD_ENCODING_BITRATE / fps.max(1)
        };

        if target < self.future_data_size_used {
            self.future_data_size_used -= target;
            if self.suppressed_frames == fps {
                // Heavy channel traffic must not starve the display
                // forever: let one frame through.
                self.suppressed_frames = 0;
            } else {
                target = 0;
                self.suppressed_frames += 1;
            }
        } else {
            target -= self.future_data_size_used;
            self.future_data_size_used = 0;
            self.suppressed_frames = 0;
        }

        self.buckets[self.current_bucket] = target;
        target
    }

    fn using_buckets(&self, frame_acknowledge: u32, fps: u32) -> usize {
        let mut using = frame_acknowledge as usize;
        if using == 0 {
            using = ((fps / 2) as usize).min(MAX_BUCKET);
        }
        using.min(MAX_BUCKET)
    }

    fn debit_recursive(&mut self, mut size_used: u32, mut depth: usize, index: isize) -> u32 {
        let mut index = index.rem_euclid(MAX_BUCKET as isize) as usize;
        loop {
            let bucket = self.buckets[index];
            if size_used > bucket {
                size_used -= bucket;
                self.buckets[index] = 0;
                depth -= 1;
                if depth == 0 {
                    return size_used;
                }
                index = (index + 1) % MAX_BUCKET;
            } else {
                self.buckets[index] -= size_used;
                return 0;
            }
        }
    }

    /// Debit `bytes_sent` (converted to bits) from the window, spilling
    /// backwards over the buckets in use. The unpayable remainder is
    /// booked as future debt.
    pub fn update_data_usage(&mut self, bytes_sent: u32, frame_acknowledge: u32, fps: u32) {
        if self.configured_bitrate != 0 {
            return;
        }
        let mut bits = bytes_sent.saturating_mul(8);
        let using = self.using_buckets(frame_acknowledge, fps);
        let current = self.current_bucket;
        let bucket = self.buckets[current];
        if bits > bucket {
            bits -= bucket;
            self.buckets[current] = 0;
            bits = self.debit_recursive(bits, using, current as isize - using as isize);
        } else {
            self.buckets[current] -= bits;
            bits = 0;
        }
        if bits > 0 {
            self.future_data_size_used += bits;
        }
    }

    /// Largest frame the sliding window currently allows.
    #[must_use]
    pub fn max_target_frame_size(&self, frame_acknowledge: u32, fps: u32) -> u32 {
        if self.configured_bitrate != 0 {
            return self.buckets[self.current_bucket];
        }
        let using = self.using_buckets(frame_acknowledge, fps);
        let mut total = 0u32;
        for offset in 0..using {
            let index =
                (self.current_bucket as isize - offset as isize).rem_euclid(MAX_BUCKET as isize);
            total = total.saturating_add(self.buckets[index as usize]);
        }
        total
    }

    #[must_use]
    pub fn current_bucket_size(&self) -> u32 {
        self.buckets[self.current_bucket]
    }

    /// Whether an RTT probe should go out: only with no in-flight
    /// frames, no probe outstanding, and at most once per second.
    pub fn should_probe_rtt(
        &mut self,
        now_ms: u64,
        last_ack_frame: u32,
        next_frame_id: u32,
        frame_acknowledge: u32,
    ) -> bool {
        if frame_acknowledge == 0 {
            return false;
        }
        if last_ack_frame + frame_acknowledge + 1 < next_frame_id {
            return false;
        }
        if self.rtt_in_flight {
            return false;
        }
        if now_ms.saturating_sub(self.rtt_last_start_ms) < 1000 {
            return false;
        }
        self.rtt_last_start_ms = now_ms;
        self.rtt_in_flight = true;
        true
    }

    /// RTT measure response: adjust the ack window to
    /// `clamp(rtt * fps / 1000, 2, fps)`.
    pub fn rtt_measured(&mut self, base_rtt_ms: u32, fps: u32, frame_acknowledge: u32) {
        if frame_acknowledge != 0 {
            let ack = (base_rtt_ms * fps / 1000).clamp(2, fps);
            if ack != frame_acknowledge {
                tracing::trace!(rtt = base_rtt_ms, ack, "adjusted frame acknowledge window");
                self.frame_ack_hint = Some(ack);
            }
        }
        self.rtt_in_flight = false;
    }

    fn average_bitrate(&self) -> u32 {
        let mut bits: u64 = 0;
        let mut time: u64 = 0;
        for s in &self.statistics {
            bits += u64::from(s.bits);
            time += u64::from(s.time_delta_ms);
        }
        if time == 0 {
            0
        } else {
            (bits / time) as u32
        }
    }

    /// Ingest a bandwidth measurement (byte count over `time_delta` ms).
    pub fn bandwidth_measured(&mut self, byte_count: u32, time_delta_ms: u32) {
        if byte_count < MIN_DATA_SIZE {
            return;
        }

        if time_delta_ms < 2 {
            // Too fast to measure: inflate the current average so real
            // results can catch up later.
            if self.autodetect_bitrate_kbit > 100 * 1024 {
                return;
            }
            let mut average = self.autodetect_bitrate_kbit;
            if average == 0 {
                average = STD_ENCODING_BITRATE / 1024;
            } else {
                average *= 2;
            }
            for s in &mut self.statistics {
                s.bits = average;
                s.time_delta_ms = 1;
            }
            self.autodetect_bitrate_kbit = average;
            return;
        }

        self.current_statistic = (self.current_statistic + 1) % MAX_STATISTIC;
        self.statistics[self.current_statistic] = Sample {
            bits: byte_count.saturating_mul(8),
            time_delta_ms,
        };

        let average = self.average_bitrate();
        if average != 0 {
            self.autodetect_bitrate_kbit = average;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_bitrate_is_static() {
        let mut bw = BandwidthMgmt::new(1_000_000);
        bw.init_buckets(0, 20);
        assert_eq!(bw.update_bucket(20), 50_000);
        // Usage never books debt under a fixed bitrate.
        bw.update_data_usage(1_000_000, 2, 20);
        assert_eq!(bw.future_data_size_used, 0);
        assert_eq!(bw.max_target_frame_size(2, 20), 50_000);
    }

    #[test]
    fn overrun_creates_debt_and_suppresses() {
        let mut bw = BandwidthMgmt::new(0);
        bw.autodetect_bitrate_kbit = 100; // 100 KBit/s -> 5120 bits/frame
        bw.init_buckets(100 * 1024, 20);

        // Send far more than the window holds.
        bw.update_data_usage(1_000_000, 2, 20);
        assert!(bw.future_data_size_used > 0);

        // Following ticks are suppressed while the debt is paid.
        assert_eq!(bw.update_bucket(20), 0);
    }

    #[test]
    fn one_frame_is_forced_after_fps_suppressions() {
        let mut bw = BandwidthMgmt::new(0);
        bw.autodetect_bitrate_kbit = 100;
        let fps = 5;
        bw.init_buckets(0, fps);
        // Enough debt to suppress far more than fps frames.
        bw.future_data_size_used = 100 * 1024 * 10;

        let mut zeros = 0;
        let mut forced = false;
        for _ in 0..=fps {
            if bw.update_bucket(fps) == 0 {
                zeros += 1;
            } else {
                forced = true;
                break;
            }
        }
        assert_eq!(zeros, fps);
        assert!(forced, "a frame must be forced through after fps suppressions");
    }

    #[test]
    fn window_sum_respects_bucket_count() {
        let mut bw = BandwidthMgmt::new(0);
        bw.init_buckets(15 * 1024 * 8 * 20, 20); // 15 KiB/frame in bits
        let per_bucket = bw.buckets[0];
        assert_eq!(bw.max_target_frame_size(3, 20), per_bucket * 3);
        assert_eq!(bw.max_target_frame_size(0, 20), per_bucket * 10); // fps/2
    }

    #[test]
    fn rtt_probe_rate_limited_and_gated_on_inflight() {
        let mut bw = BandwidthMgmt::new(0);
        // In-flight frames: no probe.
        assert!(!bw.should_probe_rtt(10_000, 0, 10, 2));
        // Idle: probe fires once, then not again inside a second.
        assert!(bw.should_probe_rtt(10_000, 9, 10, 2));
        assert!(!bw.should_probe_rtt(10_500, 9, 10, 2));
        bw.rtt_measured(100, 20, 2);
        assert!(bw.should_probe_rtt(11_100, 9, 10, 2));
    }

    #[test]
    fn rtt_adjusts_ack_window_with_clamp() {
        let mut bw = BandwidthMgmt::new(0);
        bw.rtt_measured(1, 20, 5);
        assert_eq!(bw.frame_ack_hint, Some(2)); // lower clamp
        bw.rtt_measured(10_000, 20, 5);
        assert_eq!(bw.frame_ack_hint, Some(20)); // upper clamp = fps
        bw.rtt_measured(250, 20, 4);
        assert_eq!(bw.frame_ack_hint, Some(5));
    }

    #[test]
    fn bandwidth_average_over_window() {
        let mut bw = BandwidthMgmt::new(0);
        // 100 KiB over 100 ms -> ~8192 kbit/s
        bw.bandwidth_measured(100 * 1024, 100);
        let expected = (100 * 1024 * 8) / 100;
        assert_eq!(bw.autodetect_bitrate_kbit, expected);
        // Tiny samples are ignored.
        let before = bw.autodetect_bitrate_kbit;
        bw.bandwidth_measured(10, 100);
        assert_eq!(bw.autodetect_bitrate_kbit, before);
    }

    #[test]
    fn fast_measurements_inflate_average() {
        let mut bw = BandwidthMgmt::new(0);
        bw.autodetect_bitrate_kbit = 1000;
        bw.bandwidth_measured(50 * 1024, 1);
        assert_eq!(bw.autodetect_bitrate_kbit, 2000);
    }
}
