//! Parsing for the Go `time.Duration` strings used by policy evaluation
//! intervals (`"10s"`, `"1h30m"`, `"1.5h"`).

use std::time::Duration;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("negative durations are not supported")]
    Negative,

    #[error("invalid floating-point number: {}", .0)]
    NotANumber(#[from] std::num::ParseFloatError),
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

const MINUTE: Duration = Duration::from_secs(60);

fn unit(unit: &str) -> Result<Duration, ParseError> {
    // U+00B5 is the "micro sign" while U+03BC is "Greek letter mu"
    match unit {
        "ns" => Ok(Duration::from_nanos(1)),
        "us" | "\u{00b5}s" | "\u{03bc}s" => Ok(Duration::from_micros(1)),
        "ms" => Ok(Duration::from_millis(1)),
        "s" => Ok(Duration::from_secs(1)),
        "m" => Ok(MINUTE),
        "h" => Ok(MINUTE * 60),
        _ => Err(ParseError::InvalidUnit),
    }
}

/// Parses a Go duration string.
///
/// A bare `"0"` is the only value accepted without a unit.
pub fn parse(s: &str) -> Result<Duration, ParseError> {
    let mut rest = s.trim();
    if rest.starts_with('-') {
        let magnitude = parse(&rest[1..])?;
        if magnitude.is_zero() {
            return Ok(magnitude);
        }
        return Err(ParseError::Negative);
    }
    rest = rest.trim_start_matches('+');

    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(ParseError::NoUnit);
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let unit_start = rest
            .find(|c: char| c.is_alphabetic())
            .ok_or(ParseError::NoUnit)?;
        let (value, tail) = rest.split_at(unit_start);
        let value = value.parse::<f64>()?;
        let unit_end = tail
            .find(|c: char| !c.is_alphabetic())
            .unwrap_or(tail.len());
        let (name, tail) = tail.split_at(unit_end);
        total += unit(name)?.mul_f64(value);
        rest = tail;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_go_durations() {
        const HOUR: Duration = Duration::from_secs(60 * 60);
        let cases: &[(&str, Duration)] = &[
            ("0", Duration::ZERO),
            ("+0", Duration::ZERO),
            ("-0", Duration::ZERO),
            ("0s", Duration::ZERO),
            ("5s", Duration::from_secs(5)),
            ("+5s", Duration::from_secs(5)),
            ("5.6s", Duration::from_secs(5) + Duration::from_millis(600)),
            (".5s", Duration::from_millis(500)),
            ("13ms", Duration::from_millis(13)),
            ("12\u{00b5}s", Duration::from_micros(12)),
            ("15m", 15 * MINUTE),
            ("3h30m", 3 * HOUR + 30 * MINUTE),
            (
                "10.5s4m",
                4 * MINUTE + Duration::from_secs(10) + Duration::from_millis(500),
            ),
            ("1.5h", HOUR + 30 * MINUTE),
        ];

        for (input, expected) in cases {
            assert_eq!(parse(input).as_ref(), Ok(expected), "{input}");
        }
    }

    #[test]
    fn rejects_malformed_durations() {
        assert_eq!(parse("10"), Err(ParseError::NoUnit));
        assert_eq!(parse(""), Err(ParseError::NoUnit));
        assert_eq!(parse("10d"), Err(ParseError::InvalidUnit));
        assert_eq!(parse("-5s"), Err(ParseError::Negative));
        assert!(matches!(parse("x5s"), Err(ParseError::NotANumber(_))));
    }
}
