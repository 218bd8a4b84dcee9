//! Log-line decoding for the init-container tail.

use futures::io::{AsyncBufRead, AsyncBufReadExt};

/// Read the next line from a log stream and sanitize it.
///
/// Bytes that are not valid UTF-8 are replaced rather than ending the
/// stream. Returns `None` at end of stream.
pub async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    Ok(Some(sanitize_line(&String::from_utf8_lossy(buf))))
}

/// Strip terminal control sequences and control characters from one log
/// line so it can be rendered safely inside the progress view.
///
/// CSI (`ESC [ ... final`) and OSC (`ESC ] ... BEL|ESC \`) sequences are
/// removed entirely; other control characters are dropped, except tab which
/// becomes a space. Trailing whitespace (including a stray `\r`) is trimmed.
pub fn sanitize_line(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.peek() {
                Some('[') => {
                    chars.next();
                    // Parameter and intermediate bytes, then one final byte.
                    for c in chars.by_ref() {
                        if ('\x40'..='\x7e').contains(&c) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    chars.next();
                    while let Some(c) = chars.next() {
                        if c == '\x07' {
                            break;
                        }
                        if c == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            },
            '\t' => out.push(' '),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }

    out.truncate(out.trim_end().len());
    out
}
