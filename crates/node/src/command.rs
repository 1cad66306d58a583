//! Tolerant scanner for relay commands.
//!
//! A command is any text containing `relay` followed (eventually) by
//! `:<number>` and `state` followed by `:true`. Order and surrounding
//! content do not matter, so `{"relay": 1, "state": true}` and
//! `relay:1 state:true` are the same command. Missing pieces fall back to
//! "no relay" and `false` instead of rejecting the message. The number is
//! read like C `atoi`: a value with no digits at all (`"relay": "1"`) is
//! relay 0.

/// Scratch buffer size; payload bytes past `COMMAND_BUF_LEN - 1` are dropped.
pub(crate) const COMMAND_BUF_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct RelayCommand {
    /// `None` when the `relay` token or its colon is missing, or the number
    /// is negative or too large for any channel.
    pub(crate) relay: Option<u64>,
    pub(crate) state: bool,
}

impl RelayCommand {
    /// The addressed channel, if it is one of `channel_count` relays.
    pub(crate) fn channel(&self, channel_count: usize) -> Option<usize> {
        let idx = usize::try_from(self.relay?).ok()?;
        (idx < channel_count).then_some(idx)
    }
}

pub(crate) fn parse_relay_command(payload: &[u8]) -> RelayCommand {
    let buf = &payload[..payload.len().min(COMMAND_BUF_LEN - 1)];

    RelayCommand {
        relay: value_after(buf, b"relay").and_then(atoi),
        state: value_after(buf, b"state").is_some_and(|v| v.starts_with(b"true")),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Bytes after the first `key`, the next `:` that follows it, and any spaces.
fn value_after<'a>(buf: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
    let after_key = &buf[find(buf, key)? + key.len()..];
    let colon = after_key.iter().position(|&b| b == b':')?;
    let value = &after_key[colon + 1..];
    let spaces = value.iter().take_while(|&&b| b == b' ').count();
    Some(&value[spaces..])
}

/// C `atoi`: skip whitespace, optional sign, then the leading digits. No
/// digits reads as 0. Negative and overflowing values are `None`.
fn atoi(value: &[u8]) -> Option<u64> {
    let ws = value
        .iter()
        .take_while(|&&b| b.is_ascii_whitespace() || b == 0x0b)
        .count();
    let mut rest = &value[ws..];

    let negative = match rest.first() {
        Some(b'-') => true,
        Some(b'+') => false,
        _ => return digits(rest),
    };
    rest = &rest[1..];
    match digits(rest)? {
        0 => Some(0),
        _ if negative => None,
        n => Some(n),
    }
}

fn digits(value: &[u8]) -> Option<u64> {
    value
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .try_fold(0u64, |acc, b| acc.checked_mul(10)?.checked_add(u64::from(b - b'0')))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> RelayCommand {
        parse_relay_command(s.as_bytes())
    }

    // -- well-formed payloads -----------------------------------------------

    #[test]
    fn parses_json_command() {
        let cmd = parse(r#"{"relay": 2, "state": true}"#);
        assert_eq!(cmd, RelayCommand { relay: Some(2), state: true });
    }

    #[test]
    fn parses_compact_json() {
        let cmd = parse(r#"{"relay":0,"state":false}"#);
        assert_eq!(cmd, RelayCommand { relay: Some(0), state: false });
    }

    #[test]
    fn order_independent() {
        let cmd = parse(r#"{"state": true, "relay": 1}"#);
        assert_eq!(cmd, RelayCommand { relay: Some(1), state: true });
    }

    #[test]
    fn plain_text_tokens() {
        let cmd = parse("please set relay:1 to state:   true thanks");
        assert_eq!(cmd, RelayCommand { relay: Some(1), state: true });
    }

    // -- defaults -----------------------------------------------------------

    #[test]
    fn missing_state_defaults_to_off() {
        let cmd = parse(r#"{"relay": 1}"#);
        assert_eq!(cmd, RelayCommand { relay: Some(1), state: false });
    }

    #[test]
    fn missing_relay_is_none() {
        let cmd = parse(r#"{"state": true}"#);
        assert_eq!(cmd, RelayCommand { relay: None, state: true });
    }

    #[test]
    fn empty_payload() {
        assert_eq!(parse(""), RelayCommand::default());
    }

    #[test]
    fn relay_without_digits_reads_as_zero() {
        assert_eq!(parse(r#"{"relay": "one"}"#).relay, Some(0));
        assert_eq!(parse(r#"{"relay": "1", "state": true}"#).relay, Some(0));
        assert_eq!(parse("relay:").relay, Some(0));
    }

    #[test]
    fn relay_without_colon_is_none() {
        assert_eq!(parse("relay").relay, None);
    }

    #[test]
    fn signed_relay_index() {
        assert_eq!(parse("relay: +2 state: true").relay, Some(2));
        assert_eq!(parse("relay:-0").relay, Some(0));
        assert_eq!(parse(r#"{"relay": -1}"#).relay, None);
        assert_eq!(parse("relay:- 1").relay, Some(0));
    }

    #[test]
    fn quoted_or_capitalised_true_is_false() {
        assert!(!parse(r#"{"relay": 1, "state": "true"}"#).state);
        assert!(!parse(r#"{"relay": 1, "state": True}"#).state);
    }

    #[test]
    fn state_only_compares_four_bytes() {
        assert!(parse("relay:1 state:trueish").state);
    }

    #[test]
    fn whitespace_before_index_is_skipped() {
        assert_eq!(parse("relay:\t1").relay, Some(1));
        let pretty = "{\n  \"relay\":\n    1,\n  \"state\": true\n}";
        assert_eq!(parse(pretty), RelayCommand { relay: Some(1), state: true });
    }

    #[test]
    fn huge_index_does_not_overflow() {
        let cmd = parse(r#"{"relay": 99999999999999999999999, "state": true}"#);
        assert_eq!(cmd.relay, None);
    }

    // -- truncation ---------------------------------------------------------

    #[test]
    fn tokens_past_buffer_are_ignored() {
        let padding = " ".repeat(COMMAND_BUF_LEN);
        let cmd = parse(&format!("{padding}{{\"relay\": 1, \"state\": true}}"));
        assert_eq!(cmd, RelayCommand::default());
    }

    #[test]
    fn token_split_by_truncation_is_lost() {
        // `state` starts inside the buffer but its value is cut off.
        let prefix = "x".repeat(COMMAND_BUF_LEN - 1 - "relay:1 state:".len());
        let cmd = parse(&format!("{prefix}relay:1 state:true"));
        assert_eq!(cmd, RelayCommand { relay: Some(1), state: false });
    }

    // -- channel bounds -----------------------------------------------------

    #[test]
    fn channel_in_range() {
        let cmd = RelayCommand { relay: Some(2), state: true };
        assert_eq!(cmd.channel(3), Some(2));
    }

    #[test]
    fn channel_out_of_range() {
        assert_eq!(RelayCommand { relay: Some(3), state: true }.channel(3), None);
        assert_eq!(RelayCommand { relay: Some(9), state: true }.channel(3), None);
        assert_eq!(RelayCommand { relay: None, state: true }.channel(3), None);
    }
}
