use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTotals {
    pub total: u64,
    pub idle: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemTotals {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetTotals {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatteryTotals {
    pub level: Option<u8>,
    pub temperature_decic: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    ProcStat,
    MemInfo,
    NetDev,
    Battery,
}

pub const MARK_PROC_STAT: &str = "__DROIDBENCH_PROC_STAT__";
pub const MARK_MEMINFO: &str = "__DROIDBENCH_MEMINFO__";
pub const MARK_NETDEV: &str = "__DROIDBENCH_NETDEV__";
pub const MARK_BATTERY: &str = "__DROIDBENCH_BATTERY__";
/// Closes one sampling frame.
pub const MARK_FRAME_END: &str = "__DROIDBENCH_FRAME_END__";

impl Section {
    pub fn from_marker(line: &str) -> Option<Self> {
        match line.trim() {
            MARK_PROC_STAT => Some(Section::ProcStat),
            MARK_MEMINFO => Some(Section::MemInfo),
            MARK_NETDEV => Some(Section::NetDev),
            MARK_BATTERY => Some(Section::Battery),
            _ => None,
        }
    }
}

/// Device-side loop emitting one marked frame per interval.
pub fn build_perf_loop_script(interval_ms: u64) -> String {
    let sleep = format!("{}.{:03}", interval_ms / 1000, interval_ms % 1000);
    let body = [
        format!("echo {MARK_PROC_STAT}"),
        "cat /proc/stat".to_string(),
        format!("echo {MARK_MEMINFO}"),
        "cat /proc/meminfo".to_string(),
        format!("echo {MARK_NETDEV}"),
        "cat /proc/net/dev".to_string(),
        format!("echo {MARK_BATTERY}"),
        "dumpsys battery".to_string(),
        format!("echo {MARK_FRAME_END}"),
        format!("sleep {sleep}"),
    ]
    .join("; ");
    format!("while true; do {body}; done")
}

/// Groups the lines of one frame by the marker that precedes them. Lines
/// before the first marker are dropped.
pub fn split_marked_sections<'a, I>(lines: I) -> HashMap<Section, String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut sections: HashMap<Section, String> = HashMap::new();
    let mut current: Option<Section> = None;
    for line in lines {
        if let Some(section) = Section::from_marker(line) {
            current = Some(section);
            sections.entry(section).or_default();
            continue;
        }
        if let Some(section) = current {
            let buf = sections.entry(section).or_default();
            buf.push_str(line);
            buf.push('\n');
        }
    }
    sections
}

pub fn parse_cpu_totals(proc_stat: &str) -> Result<CpuTotals, String> {
    let counters: Vec<u64> = proc_stat
        .lines()
        .find_map(|line| line.strip_prefix("cpu "))
        .ok_or_else(|| "Missing aggregate cpu line".to_string())?
        .split_whitespace()
        .map(|field| field.parse::<u64>().map_err(|_| format!("Invalid cpu counter: {field}")))
        .collect::<Result<_, _>>()?;
    if counters.len() < 4 {
        return Err("cpu line has fewer than four counters".to_string());
    }

    // user nice system idle iowait irq softirq steal guest guest_nice
    let idle = counters[3].saturating_add(counters.get(4).copied().unwrap_or(0));
    let total = counters
        .iter()
        .fold(0u64, |acc, value| acc.saturating_add(*value));
    Ok(CpuTotals { total, idle })
}

/// Busy share between two samples in hundredths of a percent.
pub fn compute_cpu_percent_x100(prev: CpuTotals, curr: CpuTotals) -> Option<u16> {
    let total = curr.total.checked_sub(prev.total).filter(|delta| *delta > 0)?;
    let idle = curr.idle.saturating_sub(prev.idle).min(total);
    let busy = (total - idle) as u128;
    Some((busy * 10_000 / total as u128) as u16)
}

pub fn parse_mem_totals(meminfo: &str) -> Result<MemTotals, String> {
    let fields: HashMap<&str, u64> = meminfo
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let value = rest.split_whitespace().next()?.parse().ok()?;
            Some((key.trim(), value))
        })
        .collect();

    let total_kb = *fields
        .get("MemTotal")
        .ok_or_else(|| "Missing MemTotal".to_string())?;
    let available_kb = fields.get("MemAvailable").copied().unwrap_or_else(|| {
        ["MemFree", "Buffers", "Cached"]
            .iter()
            .filter_map(|key| fields.get(key))
            .fold(0u64, |acc, value| acc.saturating_add(*value))
    });

    Ok(MemTotals {
        total_bytes: total_kb.saturating_mul(1024),
        available_bytes: available_kb.min(total_kb).saturating_mul(1024),
    })
}

/// Sums receive/transmit byte counters over every interface except loopback.
pub fn parse_net_totals(netdev: &str) -> Result<NetTotals, String> {
    let mut totals: Option<NetTotals> = None;
    for line in netdev.lines() {
        let Some((iface, rest)) = line.split_once(':') else {
            continue;
        };
        let iface = iface.trim();
        if iface.is_empty() || iface == "lo" || iface.contains('|') {
            continue;
        }
        let cols: Vec<&str> = rest.split_whitespace().collect();
        let (Some(rx), Some(tx)) = (
            cols.first().and_then(|value| value.parse::<u64>().ok()),
            cols.get(8).and_then(|value| value.parse::<u64>().ok()),
        ) else {
            continue;
        };
        let entry = totals.get_or_insert(NetTotals {
            rx_bytes: 0,
            tx_bytes: 0,
        });
        entry.rx_bytes = entry.rx_bytes.saturating_add(rx);
        entry.tx_bytes = entry.tx_bytes.saturating_add(tx);
    }
    totals.ok_or_else(|| "No interfaces in /proc/net/dev".to_string())
}

pub fn parse_battery_totals(battery: &str) -> BatteryTotals {
    let mut totals = BatteryTotals::default();
    for line in battery.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        match key.trim() {
            "level" => totals.level = value.trim().parse().ok(),
            "temperature" => totals.temperature_decic = value.trim().parse().ok(),
            _ => {}
        }
    }
    totals
}
