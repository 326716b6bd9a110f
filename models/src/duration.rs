//! Parsing for duration strings carried in annotations ("90s", "5m", "1h30m").
//!
//! Third parties write these values by hand, so the accepted syntax is the familiar
//! unit-suffixed form. A bare number has no unit and is rejected.

use snafu::ensure;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, error::Error>;

/// Parse a unit-suffixed duration string into a [`Duration`].
///
/// Accepted units are `ms`, `s`, `m` and `h`. Multiple segments may be
/// concatenated ("1h30m"); segments must appear with strictly decreasing units.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    ensure!(!trimmed.is_empty(), error::EmptySnafu);

    let mut total = Duration::ZERO;
    let mut chars = trimmed.chars().peekable();
    let mut parsed_any = false;

    while chars.peek().is_some() {
        let mut digits = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() {
                digits.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        ensure!(
            !digits.is_empty(),
            error::InvalidSyntaxSnafu { input: trimmed }
        );

        let value: u64 = digits
            .parse()
            .map_err(|_| error::InvalidSyntaxSnafu { input: trimmed }.build())?;

        let mut unit = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit.push(*c);
                chars.next();
            } else {
                break;
            }
        }

        let segment = match unit.as_str() {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            // A missing unit ("20") is ambiguous and rejected outright.
            _ => {
                return error::UnknownUnitSnafu {
                    input: trimmed,
                    unit,
                }
                .fail()
            }
        };
        total += segment;
        parsed_any = true;
    }

    ensure!(parsed_any, error::InvalidSyntaxSnafu { input: trimmed });
    Ok(total)
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Duration string is empty"))]
        Empty,

        #[snafu(display("Cannot parse duration '{}'", input))]
        InvalidSyntax { input: String },

        #[snafu(display("Unknown duration unit '{}' in '{}'", unit, input))]
        UnknownUnit { input: String, unit: String },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_duration() {
        let test_cases = vec![
            ("30s", Duration::from_secs(30)),
            ("5m", Duration::from_secs(300)),
            ("1h", Duration::from_secs(3600)),
            ("1h30m", Duration::from_secs(5400)),
            ("2m30s", Duration::from_secs(150)),
            ("250ms", Duration::from_millis(250)),
            (" 10m ", Duration::from_secs(600)),
        ];
        for (input, expected) in test_cases {
            assert_eq!(parse_duration(input).unwrap(), expected, "input: {}", input);
        }
    }

    #[test]
    fn test_parse_duration_rejects_invalid() {
        // A bare number must not be silently interpreted.
        for input in ["", "20", "m", "5x", "1h30", "abc", "-5m"] {
            assert!(parse_duration(input).is_err(), "input: {}", input);
        }
    }
}
