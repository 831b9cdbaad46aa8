use crate::error::{ParseError, Result};

/// 将秒数格式化为 `HH:MM:SS.mmm`（四舍五入到毫秒，负数按 0 处理）
pub fn format_timecode(seconds: f64) -> String {
    let total_ms = if seconds.is_finite() && seconds > 0.0 {
        (seconds * 1000.0).round() as u64
    } else {
        0
    };
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let secs = (total_ms / 1000) % 60;
    let millis = total_ms % 1000;
    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, secs, millis)
}

/// 解析 `HH:MM:SS.mmm` 为秒数
///
/// 三个字段都按浮点数解析，和检测器的输出保持兼容（例如 `00:01:5.5` 也能接受）。
pub fn parse_timecode(timecode: &str) -> Result<f64> {
    let parts: Vec<&str> = timecode.trim().split(':').collect();
    if parts.len() != 3 {
        return Err(ParseError::InvalidTimecode(timecode.to_string()));
    }

    let mut fields = [0.0f64; 3];
    for (slot, part) in fields.iter_mut().zip(&parts) {
        let value: f64 = part
            .parse()
            .map_err(|_| ParseError::InvalidTimecode(timecode.to_string()))?;
        if !value.is_finite() || value < 0.0 {
            return Err(ParseError::InvalidTimecode(timecode.to_string()));
        }
        *slot = value;
    }

    let [hours, minutes, seconds] = fields;
    Ok(hours * 3600.0 + minutes * 60.0 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timecode() {
        assert_eq!(format_timecode(0.0), "00:00:00.000");
        assert_eq!(format_timecode(120.0), "00:02:00.000");
        assert_eq!(format_timecode(3725.5), "01:02:05.500");
        assert_eq!(format_timecode(-3.0), "00:00:00.000");
    }

    #[test]
    fn test_parse_timecode() {
        assert!((parse_timecode("00:00:10.250").unwrap() - 10.25).abs() < 1e-9);
        assert!((parse_timecode("01:02:05.500").unwrap() - 3725.5).abs() < 1e-9);
        assert!(parse_timecode("10.0").is_err());
        assert!(parse_timecode("aa:00:00.000").is_err());
        assert!(parse_timecode("00:-1:00.000").is_err());
    }

    #[test]
    fn test_roundtrip_within_one_millisecond() {
        let mut seconds = 0.0;
        while seconds < 7300.0 {
            let back = parse_timecode(&format_timecode(seconds)).unwrap();
            assert!((back - seconds).abs() <= 0.001, "{} -> {}", seconds, back);
            seconds += 12.3457;
        }
    }
}
