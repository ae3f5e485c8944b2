//! Control-port message framing.
//!
//! Reply parsing, command formatting and the mapping from snake_case
//! config field names to the PascalCase keywords Tor expects.

use crate::error::{Result, StatusCode, TorPoolError};
use std::fmt;

/// Position of a line within a multi-line reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// `250-key=value`, more lines follow.
    Mid,
    /// `250+key=`, a dot-terminated data block follows.
    Data,
    /// `250 OK`, last line of the reply.
    End,
}

/// One `NNN<sep>text` line of a control reply.
#[derive(Debug, Clone)]
pub struct ReplyLine {
    /// Three-digit status code.
    pub code: u16,
    /// Where the line sits in the reply.
    pub kind: LineKind,
    /// Everything after the separator.
    pub text: String,
}

impl ReplyLine {
    /// Parse a line with its CRLF already stripped.
    pub fn parse(line: &str) -> Result<Self> {
        let malformed = || TorPoolError::ProtocolError(format!("Malformed reply line: '{}'", line));

        let code = line
            .get(..3)
            .filter(|digits| digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse::<u16>().ok())
            .ok_or_else(malformed)?;
        let kind = match line.as_bytes().get(3) {
            Some(b'-') => LineKind::Mid,
            Some(b'+') => LineKind::Data,
            Some(b' ') => LineKind::End,
            _ => return Err(malformed()),
        };

        Ok(ReplyLine {
            code,
            kind,
            text: line[4..].to_string(),
        })
    }

    /// Last line of its reply.
    pub fn is_end(&self) -> bool {
        self.kind == LineKind::End
    }

    /// Opens a data block.
    pub fn is_data(&self) -> bool {
        self.kind == LineKind::Data
    }
}

/// All lines of one reply. The code is taken from the first line.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Reply status.
    pub code: u16,
    /// Lines in arrival order.
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    /// Group lines into a reply. Fails on an empty list.
    pub fn new(lines: Vec<ReplyLine>) -> Result<Self> {
        match lines.first() {
            Some(first) => Ok(Reply {
                code: first.code,
                lines,
            }),
            None => Err(TorPoolError::ProtocolError("Empty reply".to_string())),
        }
    }

    /// Classified status.
    pub fn status(&self) -> StatusCode {
        StatusCode::from(self.code)
    }

    /// Line texts joined by newlines.
    pub fn message(&self) -> String {
        let texts: Vec<&str> = self.lines.iter().map(|l| l.text.as_str()).collect();
        texts.join("\n")
    }

    /// Text of the first line, empty if there is none.
    pub fn first_line(&self) -> &str {
        self.lines.first().map_or("", |l| l.text.as_str())
    }

    /// Value of the first `key=value` line.
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .find_map(|l| l.text.strip_prefix(key)?.strip_prefix('='))
    }

    /// `Ok(self)` for 2xx replies; auth codes become
    /// [`TorPoolError::AuthenticationFailed`], the rest
    /// [`TorPoolError::CommandRejected`].
    pub fn into_result(self) -> Result<Self> {
        let status = self.status();
        if status.is_success() {
            return Ok(self);
        }
        let message = self.message();
        if status.is_auth_failure() {
            Err(TorPoolError::AuthenticationFailed(message))
        } else {
            Err(TorPoolError::CommandRejected {
                code: self.code,
                message,
            })
        }
    }
}

/// A Tor signal sent with the SIGNAL command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Switch to clean circuits.
    NewNym,
    /// Forget client-side cached IPs.
    ClearDnsCache,
    /// Controlled shutdown.
    Shutdown,
}

impl Signal {
    /// Get the signal name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::NewNym => "NEWNYM",
            Signal::ClearDnsCache => "CLEARDNSCACHE",
            Signal::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render a value as a control-protocol argument.
///
/// Plain printable ASCII without spaces is sent as is. Anything else is
/// wrapped in double quotes with C-style escapes.
pub fn quote_string(s: &str) -> String {
    let bare = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_graphic() && c != '"' && c != '\\');
    if bare {
        return s.to_string();
    }

    let escaped: String = s
        .chars()
        .map(|c| match c {
            '"' => "\\\"".to_string(),
            '\\' => "\\\\".to_string(),
            '\n' => "\\n".to_string(),
            '\r' => "\\r".to_string(),
            '\t' => "\\t".to_string(),
            other => other.to_string(),
        })
        .collect();
    format!("\"{}\"", escaped)
}

/// `KEYWORD arg arg\r\n`.
pub fn format_command(keyword: &str, args: &[&str]) -> String {
    let mut parts = vec![keyword];
    parts.extend_from_slice(args);
    format!("{}\r\n", parts.join(" "))
}

/// Turn a snake_case config field name into Tor's PascalCase keyword.
///
/// `socks_port` becomes `SocksPort`, `http_tunnel_port` becomes
/// `HttpTunnelPort`. Each segment is capitalised and the rest lowercased.
pub fn config_keyword(key: &str) -> String {
    key.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Build the SETCONF command assigning every value to one keyword.
///
/// A list-valued option such as `SocksPort` is repeated once per element,
/// which replaces the whole list on Tor's side.
pub fn format_setconf(keyword: &str, values: &[String]) -> String {
    let args: Vec<String> = if values.is_empty() {
        vec![keyword.to_string()]
    } else {
        values
            .iter()
            .map(|v| format!("{}={}", keyword, quote_string(v)))
            .collect()
    };
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    format_command("SETCONF", &arg_refs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_line_parsing() {
        let line = ReplyLine::parse("250 OK").unwrap();
        assert_eq!((line.code, line.kind), (250, LineKind::End));
        assert_eq!(line.text, "OK");

        let mid = ReplyLine::parse("250-version=0.4.8.12").unwrap();
        assert!(!mid.is_end() && !mid.is_data());
        assert!(ReplyLine::parse("250+config-text=").unwrap().is_data());
    }

    #[test]
    fn test_reply_line_rejects_garbage() {
        assert!(ReplyLine::parse("25").is_err());
        assert!(ReplyLine::parse("ABC OK").is_err());
        assert!(ReplyLine::parse("250/OK").is_err());
        assert!(ReplyLine::parse("+50 OK").is_err());
    }

    #[test]
    fn test_reply_value_lookup() {
        let reply = Reply::new(vec![
            ReplyLine::parse("250-version=0.4.8.12").unwrap(),
            ReplyLine::parse("250 OK").unwrap(),
        ])
        .unwrap();
        assert_eq!(reply.value_of("version"), Some("0.4.8.12"));
        assert_eq!(reply.value_of("versio"), None);
    }

    #[test]
    fn test_reply_auth_failure_maps_to_auth_error() {
        let reply = Reply::new(vec![ReplyLine::parse("515 Bad authentication").unwrap()]).unwrap();
        assert!(matches!(
            reply.into_result(),
            Err(TorPoolError::AuthenticationFailed(_))
        ));

        let reply = Reply::new(vec![ReplyLine::parse("552 Unrecognized option").unwrap()]).unwrap();
        assert!(matches!(
            reply.into_result(),
            Err(TorPoolError::CommandRejected { code: 552, .. })
        ));
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_string("{de},{nl}"), "{de},{nl}");
        assert_eq!(quote_string(""), r#""""#);
        assert_eq!(quote_string("a b"), r#""a b""#);
        assert_eq!(quote_string(r#"x"y"#), r#""x\"y""#);
        assert_eq!(quote_string("tab\there"), r#""tab\there""#);
    }

    #[test]
    fn test_config_keyword() {
        assert_eq!(config_keyword("socks_port"), "SocksPort");
        assert_eq!(config_keyword("http_tunnel_port"), "HttpTunnelPort");
        assert_eq!(config_keyword("data_directory"), "DataDirectory");
        assert_eq!(config_keyword("dns_port"), "DnsPort");
    }

    #[test]
    fn test_setconf_repeats_keyword_per_value() {
        let cmd = format_setconf("SocksPort", &["10080".to_string(), "10084".to_string()]);
        assert_eq!(cmd, "SETCONF SocksPort=10080 SocksPort=10084\r\n");

        let cmd = format_setconf("DataDirectory", &["/tmp/tor data".to_string()]);
        assert_eq!(cmd, "SETCONF DataDirectory=\"/tmp/tor data\"\r\n");
    }
}
