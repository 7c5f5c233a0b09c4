//! Go-style duration strings
//!
//! CertificateRequest durations travel as Go `time.Duration` strings
//! (`1h`, `90m`, `1h0m0s`). The evaluator compares requested durations
//! against its configured one, so both sides need the same codec.

use std::time::Duration;

use crate::error::Error;

/// Parse a Go duration string into a [`Duration`].
///
/// Supports the `h`, `m`, `s`, `ms` units in any combination, e.g. `1h`,
/// `1h30m`, `3600s`, `1h0m0s`. Fractions and negative durations are not
/// supported; neither writes them.
pub fn parse(input: &str) -> Result<Duration, Error> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::config("empty duration"));
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }

        let unit = if c == 'm' && chars.peek() == Some(&'s') {
            chars.next();
            "ms"
        } else if c == 'h' || c == 'm' || c == 's' {
            match c {
                'h' => "h",
                'm' => "m",
                _ => "s",
            }
        } else {
            return Err(Error::config(format!(
                "invalid duration {input:?}: unexpected character {c:?}"
            )));
        };

        if number.is_empty() {
            return Err(Error::config(format!(
                "invalid duration {input:?}: missing value before unit"
            )));
        }
        let value: u64 = number
            .parse()
            .map_err(|_| Error::config(format!("invalid duration {input:?}")))?;
        number.clear();

        total += match unit {
            "h" => Duration::from_secs(value * 3600),
            "m" => Duration::from_secs(value * 60),
            "s" => Duration::from_secs(value),
            _ => Duration::from_millis(value),
        };
    }

    if !number.is_empty() {
        return Err(Error::config(format!(
            "invalid duration {input:?}: trailing value without unit"
        )));
    }

    Ok(total)
}

/// Format a [`Duration`] as a Go duration string.
///
/// Sub-second precision is dropped; the driver only requests whole-second
/// lifetimes.
pub fn format(d: Duration) -> String {
    let mut secs = d.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }

    let hours = secs / 3600;
    secs %= 3600;
    let minutes = secs / 60;
    secs %= 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if secs > 0 || out.is_empty() {
        out.push_str(&format!("{secs}s"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        assert_eq!(parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse("90m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse("1h0m0s").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse("3600s").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse("250ms").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn rejects_malformed_input() {
        for input in ["", "h", "1", "1x", "1h3", "one hour", "-1h"] {
            assert!(parse(input).is_err(), "expected rejection of {input:?}");
        }
    }

    #[test]
    fn formats_round_values() {
        assert_eq!(format(Duration::from_secs(3600)), "1h");
        assert_eq!(format(Duration::from_secs(5400)), "1h30m");
        assert_eq!(format(Duration::from_secs(90)), "1m30s");
        assert_eq!(format(Duration::ZERO), "0s");
    }

    #[test]
    fn format_and_parse_agree_on_the_default_lifetime() {
        let d = Duration::from_secs(3600);
        assert_eq!(parse(&format(d)).unwrap(), d);
    }
}
