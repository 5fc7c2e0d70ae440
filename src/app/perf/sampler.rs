use chrono::{DateTime, Utc};
use tracing::debug;

use crate::app::models::{LogEvent, OutputPayload, PerfSnapshot};
use crate::app::perf::parse::{
    compute_cpu_percent_x100, parse_battery_totals, parse_cpu_totals, parse_mem_totals,
    parse_net_totals, split_marked_sections, CpuTotals, NetTotals, Section, MARK_FRAME_END,
};
use crate::app::supervisor::pipeline::LineObserver;

/// Sample carried over between frames for rate computation.
#[derive(Debug, Clone, Copy)]
struct Baseline {
    ts_ms: i64,
    cpu: Option<CpuTotals>,
    net: Option<NetTotals>,
}

/// Folds the marked output of the device-side sampling loop into
/// `PerfSnapshot`s, one per completed frame.
#[derive(Debug, Default)]
pub struct PerfSampler {
    frame: Vec<String>,
    baseline: Option<Baseline>,
}

impl PerfSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str, now: DateTime<Utc>) -> Option<PerfSnapshot> {
        if line.trim() != MARK_FRAME_END {
            self.frame.push(line.to_string());
            return None;
        }
        let frame = std::mem::take(&mut self.frame);
        let snapshot = self.fold_frame(&frame, now.timestamp_millis());
        if snapshot.is_none() {
            debug!(lines = frame.len(), "perf frame carried no usable sections");
        }
        snapshot
    }

    fn fold_frame(&mut self, frame: &[String], ts_ms: i64) -> Option<PerfSnapshot> {
        let sections = split_marked_sections(frame.iter().map(String::as_str));
        if sections.is_empty() {
            return None;
        }
        let section = |key: Section| sections.get(&key).map(String::as_str).unwrap_or("");

        let cpu = parse_cpu_totals(section(Section::ProcStat)).ok();
        let mem = parse_mem_totals(section(Section::MemInfo)).ok();
        let net = parse_net_totals(section(Section::NetDev)).ok();
        let battery = parse_battery_totals(section(Section::Battery));

        let mut snapshot = PerfSnapshot {
            ts_ms,
            cpu_total_percent_x100: None,
            mem_total_bytes: mem.map(|mem| mem.total_bytes),
            mem_used_bytes: mem.map(|mem| mem.total_bytes.saturating_sub(mem.available_bytes)),
            net_rx_bps: None,
            net_tx_bps: None,
            battery_level: battery.level,
            battery_temp_decic: battery.temperature_decic,
        };

        if let Some(prev) = self.baseline {
            if let (Some(prev_cpu), Some(cpu)) = (prev.cpu, cpu) {
                snapshot.cpu_total_percent_x100 = compute_cpu_percent_x100(prev_cpu, cpu);
            }
            let elapsed_ms = ts_ms.saturating_sub(prev.ts_ms);
            if let (Some(prev_net), Some(net), true) = (prev.net, net, elapsed_ms > 0) {
                let rate = |prev: u64, curr: u64| curr.saturating_sub(prev) * 1000 / elapsed_ms as u64;
                snapshot.net_rx_bps = Some(rate(prev_net.rx_bytes, net.rx_bytes));
                snapshot.net_tx_bps = Some(rate(prev_net.tx_bytes, net.tx_bytes));
            }
        }

        self.baseline = Some(Baseline { ts_ms, cpu, net });
        Some(snapshot)
    }
}

impl LineObserver for PerfSampler {
    fn on_line(&mut self, event: &mut LogEvent) -> Vec<OutputPayload> {
        self.push_line(&event.line, event.timestamp)
            .map(OutputPayload::Perf)
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::perf::parse::{MARK_BATTERY, MARK_MEMINFO, MARK_NETDEV, MARK_PROC_STAT};
    use chrono::{Duration, TimeZone};

    fn frame(cpu: &str, rx: u64, tx: u64) -> Vec<String> {
        format!(
            "{MARK_PROC_STAT}\n{cpu}\n{MARK_MEMINFO}\nMemTotal: 1000 kB\nMemAvailable: 400 kB\n{MARK_NETDEV}\n wlan0: {rx} 0 0 0 0 0 0 0 {tx} 0 0 0 0 0 0 0\n{MARK_BATTERY}\n  level: 77\n  temperature: 312\n{MARK_FRAME_END}"
        )
        .lines()
        .map(str::to_string)
        .collect()
    }

    fn feed(sampler: &mut PerfSampler, lines: &[String], now: DateTime<Utc>) -> Vec<PerfSnapshot> {
        lines
            .iter()
            .filter_map(|line| sampler.push_line(line, now))
            .collect()
    }

    #[test]
    fn first_frame_has_levels_but_no_rates() {
        let mut sampler = PerfSampler::new();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let snapshots = feed(&mut sampler, &frame("cpu 100 0 0 100", 1000, 500), now);
        assert_eq!(snapshots.len(), 1);
        let first = &snapshots[0];
        assert_eq!(first.cpu_total_percent_x100, None);
        assert_eq!(first.mem_total_bytes, Some(1000 * 1024));
        assert_eq!(first.mem_used_bytes, Some(600 * 1024));
        assert_eq!(first.battery_level, Some(77));
        assert_eq!(first.battery_temp_decic, Some(312));
        assert_eq!(first.net_rx_bps, None);
    }

    #[test]
    fn second_frame_computes_cpu_and_network_rates() {
        let mut sampler = PerfSampler::new();
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        feed(&mut sampler, &frame("cpu 100 0 0 100", 1000, 500), start);
        let snapshots = feed(
            &mut sampler,
            &frame("cpu 175 0 0 125", 3000, 1500),
            start + Duration::milliseconds(2000),
        );
        let second = &snapshots[0];
        assert_eq!(second.cpu_total_percent_x100, Some(7500));
        assert_eq!(second.net_rx_bps, Some(1000));
        assert_eq!(second.net_tx_bps, Some(500));
    }

    #[test]
    fn empty_frame_yields_nothing() {
        let mut sampler = PerfSampler::new();
        assert!(sampler.push_line("garbage", Utc::now()).is_none());
        assert!(sampler.push_line(MARK_FRAME_END, Utc::now()).is_none());
    }
}
