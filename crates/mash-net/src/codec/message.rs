use std::fmt;

use super::Param;

/// A command or response exchanged with the servers of the farm.
///
/// On the wire a message is one line: its name followed by its
/// space-separated parameters. A parameter is single-quoted when it is empty,
/// contains a space, needs escaping (`'` and newlines) or is a text that would
/// otherwise be read back as a number.
///
/// Backslashes are not escaped, as the servers of the farm expect. A text
/// holding a literal `\n` reads back with a newline, and a quoted text
/// ending with a backslash reads back with a trailing `'` instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub name: String,
    pub params: Vec<Param>,
}

impl Message {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(name: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// Append one parameter.
    pub fn arg(mut self, value: impl Into<Param>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn param(&self, index: usize) -> Option<&Param> {
        self.params.get(index)
    }

    pub fn int(&self, index: usize) -> Option<i64> {
        self.param(index).and_then(Param::as_int)
    }

    pub fn float(&self, index: usize) -> Option<f64> {
        self.param(index).and_then(Param::as_float)
    }

    /// Textual value of a parameter, numbers included.
    pub fn text(&self, index: usize) -> Option<String> {
        self.param(index).map(Param::to_string)
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    /// Wire representation, without the trailing newline.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Parse one line (without its newline).
    ///
    /// Unquoted parameters become integers, floats or texts, in that order
    /// of preference. A quoted parameter left open at the end of the line
    /// keeps what was read so far.
    pub fn decode(line: &str) -> Message {
        let mut parts = line.split(' ');
        let name = parts.next().unwrap_or_default().to_string();

        let mut params = Vec::new();
        let mut quoted: Option<String> = None;

        for part in parts {
            match quoted.as_mut() {
                None => match part.strip_prefix('\'') {
                    Some(rest) if closes_quote(rest) => {
                        params.push(Param::Str(unescape(&rest[..rest.len() - 1])));
                    }
                    Some(rest) => quoted = Some(rest.to_string()),
                    None => params.push(Param::guess(&unescape(part))),
                },
                Some(acc) => {
                    acc.push(' ');
                    if closes_quote(part) {
                        acc.push_str(&part[..part.len() - 1]);
                        params.push(Param::Str(unescape(acc)));
                        quoted = None;
                    } else {
                        acc.push_str(part);
                    }
                }
            }
        }
        if let Some(acc) = quoted {
            params.push(Param::Str(unescape(&acc)));
        }

        Message { name, params }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for param in &self.params {
            let raw = param.to_string();
            let encoded = escape(&raw);
            let must_quote = encoded != raw
                || encoded.is_empty()
                || encoded.contains(' ')
                || param.is_ambiguous_text();
            if must_quote {
                write!(f, " '{encoded}'")?;
            } else {
                write!(f, " {encoded}")?;
            }
        }
        Ok(())
    }
}

impl From<&str> for Message {
    fn from(line: &str) -> Self {
        Message::decode(line)
    }
}

/// A closing quote is a trailing `'` that is not itself escaped.
fn closes_quote(part: &str) -> bool {
    part.ends_with('\'') && (part.len() == 1 || !part.ends_with("\\'"))
}

fn escape(text: &str) -> String {
    text.replace('\'', "\\'").replace('\n', "\\n")
}

fn unescape(text: &str) -> String {
    text.replace("\\'", "'").replace("\\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPLICATED: &str = "This\nis a \"complicated\"\n'parameter'";

    #[test]
    fn encode_simple_message() {
        let msg = Message::new("SOME_NAME")
            .arg(1)
            .arg(2.0)
            .arg("hi")
            .arg("hello world");
        assert_eq!(msg.encode(), "SOME_NAME 1 2.0 hi 'hello world'");
    }

    #[test]
    fn decode_simple_message() {
        let msg = Message::decode("SOME_NAME 1 2.0 hi 'hello world'");
        assert_eq!(msg.name, "SOME_NAME");
        assert_eq!(
            msg.params,
            vec![
                Param::Int(1),
                Param::Float(2.0),
                Param::Str("hi".into()),
                Param::Str("hello world".into()),
            ]
        );
    }

    #[test]
    fn complicated_parameter_is_escaped_and_restored() {
        let msg = Message::new("TEXT").arg(COMPLICATED);
        let line = msg.encode();
        assert_eq!(line, r#"TEXT 'This\nis a "complicated"\n\'parameter\''"#);
        assert!(!line.contains('\n'));
        assert_eq!(Message::decode(&line), msg);
    }

    #[test]
    fn message_without_parameters() {
        let msg = Message::decode("STATUS");
        assert_eq!(msg, Message::new("STATUS"));
        assert!(msg.params.is_empty());
        assert_eq!(msg.encode(), "STATUS");
    }

    #[test]
    fn single_word_quoted_parameters_close_immediately() {
        let msg = Message::decode("A 'abc' '' 3");
        assert_eq!(
            msg.params,
            vec![Param::Str("abc".into()), Param::Str(String::new()), Param::Int(3)]
        );
    }

    #[test]
    fn leading_and_trailing_spaces_survive() {
        for text in [" x", "x ", "  ", "'", "it's here", ""] {
            let msg = Message::new("T").arg(text);
            assert_eq!(Message::decode(&msg.encode()), msg, "value {text:?}");
        }
    }

    #[test]
    fn numeric_looking_text_stays_text() {
        let msg = Message::new("SETTING").arg("42").arg("0.5");
        assert_eq!(msg.encode(), "SETTING '42' '0.5'");
        assert_eq!(Message::decode(&msg.encode()), msg);
    }

    #[test]
    fn backslashes_are_sent_verbatim() {
        let path = Message::new("T").arg(r"C:\new");
        assert_eq!(path.encode(), r"T C:\new");
        assert_eq!(Message::decode(&path.encode()).text(0).as_deref(), Some("C:\new"));

        let trailing = Message::new("T").arg(r"a b\");
        assert_eq!(trailing.encode(), r"T 'a b\'");
        assert_eq!(Message::decode(&trailing.encode()).text(0).as_deref(), Some("a b'"));

        let unquoted = Message::new("T").arg(r"a\");
        assert_eq!(Message::decode(&unquoted.encode()), unquoted);
    }

    #[test]
    fn unterminated_quote_keeps_content() {
        let msg = Message::decode("ERROR 'Because the test");
        assert_eq!(msg.text(0).as_deref(), Some("Because the test"));
    }

    #[test]
    fn typed_accessors() {
        let msg = Message::decode("TRAIN_ERROR 0.5 3 name");
        assert_eq!(msg.float(0), Some(0.5));
        assert_eq!(msg.int(1), Some(3));
        assert_eq!(msg.float(1), Some(3.0));
        assert_eq!(msg.text(2).as_deref(), Some("name"));
        assert_eq!(msg.param(3), None);
    }
}
