//! ISO-8601 durations (`P1DT2H`, `PT30S`, `P2W`)

use std::time::Duration;

use super::DefinitionError;

/// Parse an ISO-8601 duration. Years and months are not supported because
/// their length depends on the calendar.
pub fn parse_duration(text: &str) -> Result<Duration, DefinitionError> {
    let invalid = || DefinitionError::InvalidDuration(text.to_string());

    let rest = text.trim().strip_prefix('P').ok_or_else(invalid)?;
    if rest.is_empty() {
        return Err(invalid());
    }

    let (date_part, time_part) = match rest.split_once('T') {
        Some((date, time)) if !time.is_empty() => (date, Some(time)),
        Some(_) => return Err(invalid()),
        None => (rest, None),
    };

    let mut seconds = 0f64;
    for (value, unit) in components(date_part).ok_or_else(invalid)? {
        seconds += value
            * match unit {
                'W' => 7.0 * 86_400.0,
                'D' => 86_400.0,
                _ => return Err(invalid()),
            };
    }
    if let Some(time) = time_part {
        for (value, unit) in components(time).ok_or_else(invalid)? {
            seconds += value
                * match unit {
                    'H' => 3_600.0,
                    'M' => 60.0,
                    'S' => 1.0,
                    _ => return Err(invalid()),
                };
        }
    }

    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}

fn components(part: &str) -> Option<Vec<(f64, char)>> {
    let mut out = Vec::new();
    let mut number = String::new();
    for c in part.chars() {
        if c.is_ascii_digit() || c == '.' || c == ',' {
            number.push(if c == ',' { '.' } else { c });
        } else {
            if number.is_empty() {
                return None;
            }
            out.push((number.parse().ok()?, c));
            number.clear();
        }
    }
    number.is_empty().then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_components() {
        assert_eq!(parse_duration("PT30S").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("PT5M").unwrap(), Duration::from_secs(300));
        assert_eq!(
            parse_duration("P1DT2H30M").unwrap(),
            Duration::from_secs(86_400 + 2 * 3_600 + 30 * 60)
        );
        assert_eq!(parse_duration("PT0.5S").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("P2W").unwrap(), Duration::from_secs(14 * 86_400));
    }

    #[test]
    fn test_reject_invalid() {
        for text in ["", "P", "PT", "5M", "P1M", "PT5X", "PTM", "P1DT"] {
            assert!(parse_duration(text).is_err(), "{text} should be rejected");
        }
    }
}
