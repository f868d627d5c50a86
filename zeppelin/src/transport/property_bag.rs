use std::collections::HashMap;

use anyhow::{Context, Result};
use urlencoding::{decode, encode};

/// Parse a topic property bag (`key=value&key2=value2`, URL-encoded) into a
/// map. Keys without a value map to an empty string.
pub(crate) fn parse(query: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();

    let query = query.strip_prefix('?').unwrap_or(query);
    if query.is_empty() {
        return Ok(map);
    }

    for prop in query.split('&') {
        match prop.find('=') {
            None => {
                let key = decode(prop).context(format!("Unable to URL decode key {prop}"))?;
                map.insert(key.into_owned(), String::new());
            }
            Some(pos) => {
                let key =
                    decode(&prop[..pos]).context(format!("Unable to URL decode key {prop}"))?;
                let value = decode(&prop[pos + 1..])
                    .context(format!("Unable to URL decode value {prop}"))?;
                map.insert(key.into_owned(), value.into_owned());
            }
        }
    }

    Ok(map)
}

/// Build a property bag from key/value pairs, URL-encoding both sides.
pub(crate) fn build(properties: &[(&str, &str)]) -> String {
    properties
        .iter()
        .map(|(key, value)| format!("{}={}", encode(key), encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_property() {
        let props = parse("$rid=0").expect("Unable to parse properties");
        assert_eq!(props.len(), 1);
        assert_eq!(props.get("$rid").unwrap(), "0");
    }

    #[test]
    fn parse_multiple_with_question_mark() {
        let props = parse("?src_topic=GDP&dest_topic=GDP-OUT").expect("Unable to parse properties");
        assert_eq!(props.len(), 2);
        assert_eq!(props.get("src_topic").unwrap(), "GDP");
        assert_eq!(props.get("dest_topic").unwrap(), "GDP-OUT");
    }

    #[test]
    fn parse_decodes_url_escapes() {
        let props = parse("%24.to=%2Fdevices%2Fdev-1").expect("Unable to parse properties");
        assert_eq!(props.get("$.to").unwrap(), "/devices/dev-1");
    }

    #[test]
    fn build_encodes_both_sides() {
        let bag = build(&[("$.on", "out/topic"), ("$.ct", "application/json")]);
        assert_eq!(bag, "%24.on=out%2Ftopic&%24.ct=application%2Fjson");
    }

    #[test]
    fn empty_bag_parses_to_nothing() {
        assert!(parse("").expect("Unable to parse properties").is_empty());
    }
}
