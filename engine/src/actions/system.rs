//! Host status for `get_system_status`
//!
//! Reads the Linux proc/sys interfaces directly; each field is optional so the
//! report degrades gracefully on other platforms or inside containers.

use super::handlers::format_size;
use sdk::errors::EngineError;
use tokio::fs;

pub(super) async fn status_report() -> Result<String, EngineError> {
    let uptime = read("/proc/uptime").await.and_then(|s| parse_uptime(&s));
    let load = read("/proc/loadavg").await.and_then(|s| parse_loadavg(&s));
    let memory = read("/proc/meminfo").await.and_then(|s| parse_meminfo(&s));
    let temperature = read("/sys/class/thermal/thermal_zone0/temp")
        .await
        .and_then(|s| parse_millidegrees(&s));

    let mut lines = Vec::new();
    if let Some(secs) = uptime {
        lines.push(format!("Uptime: {}", format_duration(secs)));
    }
    if let Some((one, five, fifteen)) = load {
        lines.push(format!("Load average: {:.2} {:.2} {:.2}", one, five, fifteen));
    }
    if let Some((total, available)) = memory {
        let used = total.saturating_sub(available);
        lines.push(format!(
            "Memory: {} used of {} ({:.0}%)",
            format_size(used),
            format_size(total),
            used as f64 * 100.0 / total.max(1) as f64
        ));
    }
    if let Some(celsius) = temperature {
        lines.push(format!("CPU temperature: {:.1} °C", celsius));
    }

    if lines.is_empty() {
        return Err(EngineError::ActionFailed(
            "system status is not available on this host".to_string(),
        ));
    }
    Ok(lines.join("\n"))
}

async fn read(path: &str) -> Option<String> {
    fs::read_to_string(path).await.ok()
}

fn parse_uptime(raw: &str) -> Option<u64> {
    let secs: f64 = raw.split_whitespace().next()?.parse().ok()?;
    Some(secs as u64)
}

fn parse_loadavg(raw: &str) -> Option<(f64, f64, f64)> {
    let mut parts = raw.split_whitespace().map(|p| p.parse::<f64>());
    let one = parts.next()?.ok()?;
    let five = parts.next()?.ok()?;
    let fifteen = parts.next()?.ok()?;
    Some((one, five, fifteen))
}

/// Returns `(total, available)` in bytes
fn parse_meminfo(raw: &str) -> Option<(u64, u64)> {
    let field = |name: &str| -> Option<u64> {
        raw.lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|kb| kb.parse::<u64>().ok())
            .and_then(|kb| kb.checked_mul(1024))
    };
    Some((field("MemTotal")?, field("MemAvailable")?))
}

fn parse_millidegrees(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().map(|m| m / 1000.0)
}

fn format_duration(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else {
        format!("{}h {}m", hours, minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uptime() {
        assert_eq!(parse_uptime("350735.47 234388.90\n"), Some(350735));
        assert_eq!(parse_uptime(""), None);
    }

    #[test]
    fn test_parse_loadavg() {
        assert_eq!(
            parse_loadavg("0.52 0.58 0.59 1/389 12345\n"),
            Some((0.52, 0.58, 0.59))
        );
        assert_eq!(parse_loadavg("garbage"), None);
    }

    #[test]
    fn test_parse_meminfo() {
        let raw = "MemTotal:        3884328 kB\nMemFree:          512000 kB\nMemAvailable:    1942164 kB\n";
        assert_eq!(
            parse_meminfo(raw),
            Some((3884328 * 1024, 1942164 * 1024))
        );
        assert_eq!(parse_meminfo("MemTotal: 10 kB\n"), None);
    }

    #[test]
    fn test_parse_meminfo_rejects_overflowing_values() {
        let raw = format!("MemTotal: {} kB\nMemAvailable: 1 kB\n", u64::MAX);
        assert_eq!(parse_meminfo(&raw), None);
    }

    #[test]
    fn test_parse_millidegrees() {
        assert_eq!(parse_millidegrees("48312\n"), Some(48.312));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(59), "0h 0m");
        assert_eq!(format_duration(3 * 3600 + 120), "3h 2m");
        assert_eq!(format_duration(2 * 86_400 + 3600), "2d 1h 0m");
    }
}
