use serde::{de, Deserialize, Deserializer};
use std::time::Duration;

/// Parse a human duration string: a number followed by `ms`, `s`, `m` or
/// `h`. A bare number is taken as seconds; `0` disables interval settings.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let (digits, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(pos) => s.split_at(pos),
        None => (s, "s"),
    };
    let amount: f64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration '{s}'"))?;
    if amount < 0.0 {
        return Err(format!("negative duration '{s}'"));
    }

    let millis = match unit.trim() {
        "ms" => amount,
        "s" => amount * 1_000.0,
        "m" => amount * 60_000.0,
        "h" => amount * 3_600_000.0,
        other => return Err(format!("unknown duration unit '{other}'")),
    };
    Ok(Duration::from_millis(millis.round() as u64))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(u64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Text(s) => parse_duration(&s).map_err(de::Error::custom),
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_units() {
        assert_eq!(parse_duration("200ms").unwrap(), Duration::from_millis(200));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("fast").is_err());
    }
}
