//! CTCP framing: `\x01VERB params\x01` inside PRIVMSG/NOTICE bodies.

/// The CTCP delimiter character (`\x01`).
pub const CTCP_DELIM: char = '\x01';

/// A borrowed view of one CTCP payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ctcp<'a> {
    /// Verb as sent (compare with [`Ctcp::is`]).
    pub verb: &'a str,
    pub params: Option<&'a str>,
}

impl<'a> Ctcp<'a> {
    /// Parse a message body. The closing delimiter is optional, as many
    /// clients omit it.
    pub fn parse(text: &'a str) -> Option<Self> {
        let inner = text.strip_prefix(CTCP_DELIM)?;
        let inner = inner.strip_suffix(CTCP_DELIM).unwrap_or(inner);
        let (verb, params) = match inner.split_once(' ') {
            Some((v, p)) => (v, Some(p).filter(|p| !p.is_empty())),
            None => (inner, None),
        };
        if verb.is_empty() || !verb.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return None;
        }
        Some(Self { verb, params })
    }

    pub fn is(&self, verb: &str) -> bool {
        self.verb.eq_ignore_ascii_case(verb)
    }
}

/// Wrap `verb` and optional params in CTCP delimiters.
pub fn encode(verb: &str, params: Option<&str>) -> String {
    match params {
        Some(p) if !p.is_empty() => format!("{CTCP_DELIM}{verb} {p}{CTCP_DELIM}"),
        _ => format!("{CTCP_DELIM}{verb}{CTCP_DELIM}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_action() {
        let c = Ctcp::parse("\x01ACTION waves\x01").unwrap();
        assert!(c.is("action"));
        assert_eq!(c.params, Some("waves"));
    }

    #[test]
    fn parse_without_closing_delimiter() {
        let c = Ctcp::parse("\x01VERSION").unwrap();
        assert!(c.is("VERSION"));
        assert_eq!(c.params, None);
    }

    #[test]
    fn not_ctcp() {
        assert!(Ctcp::parse("hello").is_none());
        assert!(Ctcp::parse("\x01\x01").is_none());
        assert!(Ctcp::parse("\x01 x\x01").is_none());
    }

    #[test]
    fn encode_forms() {
        assert_eq!(encode("PING", Some("123")), "\x01PING 123\x01");
        assert_eq!(encode("VERSION", None), "\x01VERSION\x01");
    }
}
