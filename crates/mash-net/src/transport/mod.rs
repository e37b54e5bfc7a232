mod error;
pub use error::TransportError;

mod connection;
pub use connection::Connection;

mod client;
pub use client::Client;

/// Remove the first complete line from `buffer`, skipping empty ones.
pub(crate) fn extract_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let mut line: Vec<u8> = buffer.drain(..=pos).collect();
        line.pop();
        if !line.is_empty() {
            return Some(line);
        }
    }
    None
}

pub(crate) fn has_line(buffer: &[u8]) -> bool {
    let mut rest = buffer;
    while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
        if pos > 0 {
            return true;
        }
        rest = &rest[1..];
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_lines_are_skipped() {
        let mut buffer = b"\n\nOK\nREA".to_vec();
        assert!(has_line(&buffer));
        assert_eq!(extract_line(&mut buffer).unwrap(), b"OK");
        assert_eq!(buffer, b"REA");
        assert!(!has_line(&buffer));
        assert!(extract_line(&mut buffer).is_none());
    }

    #[test]
    fn only_newlines_is_not_a_line() {
        let mut buffer = b"\n\n".to_vec();
        assert!(!has_line(&buffer));
        assert!(extract_line(&mut buffer).is_none());
        assert!(buffer.is_empty());
    }
}
