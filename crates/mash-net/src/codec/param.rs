use std::fmt;

/// One positional argument of a [`Message`](super::Message).
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Param {
    /// Interpret an unquoted token: integer first, then float, then text.
    pub fn guess(text: &str) -> Param {
        if let Ok(v) = text.parse::<i64>() {
            return Param::Int(v);
        }
        if let Ok(v) = text.parse::<f64>() {
            return Param::Float(v);
        }
        Param::Str(text.to_string())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Param::Int(v) => Some(*v),
            Param::Str(s) => s.parse().ok(),
            Param::Float(_) => None,
        }
    }

    /// Integers are widened.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Param::Int(v) => Some(*v as f64),
            Param::Float(v) => Some(*v),
            Param::Str(s) => s.parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Param::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Whether an unquoted rendering of this value would not decode back to it.
    pub(crate) fn is_ambiguous_text(&self) -> bool {
        match self {
            Param::Str(s) => !matches!(Param::guess(s), Param::Str(_)),
            _ => false,
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Int(v) => write!(f, "{v}"),
            // `1.0` must stay a float on the other side.
            Param::Float(v) if v.is_finite() && v.fract() == 0.0 => write!(f, "{v:.1}"),
            Param::Float(v) => write!(f, "{v}"),
            Param::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Param::Int(v)
    }
}

impl From<i32> for Param {
    fn from(v: i32) -> Self {
        Param::Int(v.into())
    }
}

impl From<u32> for Param {
    fn from(v: u32) -> Self {
        Param::Int(v.into())
    }
}

impl From<usize> for Param {
    fn from(v: usize) -> Self {
        Param::Int(v as i64)
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Param::Float(v)
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::Str(v.to_string())
    }
}

impl From<String> for Param {
    fn from(v: String) -> Self {
        Param::Str(v)
    }
}

impl From<&String> for Param {
    fn from(v: &String) -> Self {
        Param::Str(v.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guess_prefers_integers() {
        assert_eq!(Param::guess("12"), Param::Int(12));
        assert_eq!(Param::guess("-3"), Param::Int(-3));
        assert_eq!(Param::guess("0.25"), Param::Float(0.25));
        assert_eq!(Param::guess("1e3"), Param::Float(1000.0));
        assert_eq!(Param::guess("abc"), Param::Str("abc".into()));
    }

    #[test]
    fn whole_floats_keep_a_fraction() {
        assert_eq!(Param::Float(2.0).to_string(), "2.0");
        assert_eq!(Param::Float(0.5).to_string(), "0.5");
        assert_eq!(Param::Float(1e20).to_string(), "100000000000000000000.0");
    }

    #[test]
    fn accessors_convert_when_lossless() {
        assert_eq!(Param::Int(4).as_float(), Some(4.0));
        assert_eq!(Param::Str("7".into()).as_int(), Some(7));
        assert_eq!(Param::Float(1.5).as_int(), None);
        assert_eq!(Param::Int(1).as_str(), None);
    }
}
