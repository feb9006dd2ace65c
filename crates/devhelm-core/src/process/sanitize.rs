//! Byte-stream filter between raw PTY output and the scrollback buffer.
//!
//! A dev server's PTY stream is full of cursor choreography that only
//! makes sense on a live screen. The scrollback log wants plain lines
//! with color kept, so everything except SGR is removed here. The log
//! file and the virtual terminal both receive the unfiltered stream.

/// Reduces raw terminal output to scrollback-friendly text.
///
/// Keeps SGR sequences (colors, text attributes) byte for byte. Drops
/// every other CSI (cursor movement, erase), OSC sequences (titles) and
/// two-byte escapes (charset designation). Carriage returns become
/// newlines, so `\r`-style progress overwrites land on separate lines.
pub fn sanitize_for_log(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        let b = data[i];

        if b == 0x1b && i + 1 < data.len() {
            let next = data[i + 1];

            if next == b'[' {
                // CSI: ESC [ <parameter/intermediate bytes> <final byte>
                let mut j = i + 2;
                while j < data.len() && (0x20..=0x3f).contains(&data[j]) {
                    j += 1;
                }
                if j < data.len() && (0x40..=0x7e).contains(&data[j]) {
                    if data[j] == b'm' {
                        out.extend_from_slice(&data[i..=j]);
                    }
                    i = j + 1;
                } else {
                    // Sequence ran off the end of the chunk
                    i = data.len();
                }
                continue;
            }

            if next == b']' {
                // OSC: ESC ] ... terminated by BEL or ESC \
                let mut j = i + 2;
                while j < data.len() {
                    if data[j] == 0x07 {
                        j += 1;
                        break;
                    }
                    if data[j] == 0x1b && j + 1 < data.len() && data[j + 1] == b'\\' {
                        j += 2;
                        break;
                    }
                    j += 1;
                }
                i = j;
                continue;
            }

            // Any other two-byte escape (e.g. ESC ( B)
            i += 2;
            continue;
        }

        if b == b'\r' {
            out.push(b'\n');
            if i + 1 < data.len() && data[i + 1] == b'\n' {
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }

        out.push(b);
        i += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitize_str(input: &str) -> String {
        String::from_utf8(sanitize_for_log(input.as_bytes())).unwrap()
    }

    #[test]
    fn passes_plain_text_through() {
        assert_eq!(sanitize_str("hello world\n"), "hello world\n");
    }

    #[test]
    fn keeps_sgr_sequences() {
        let input = "\x1b[31mred\x1b[0m \x1b[1;4;32mbold\x1b[m";
        assert_eq!(sanitize_str(input), input);
    }

    #[test]
    fn drops_cursor_and_erase_sequences() {
        assert_eq!(sanitize_str("\x1b[2Jfresh"), "fresh");
        assert_eq!(sanitize_str("\x1b[1;5Hmoved"), "moved");
        assert_eq!(sanitize_str("left\x1b[K"), "left");
        assert_eq!(sanitize_str("\x1b[?25lspinner\x1b[?25h"), "spinner");
    }

    #[test]
    fn drops_osc_sequences() {
        assert_eq!(sanitize_str("\x1b]0;my title\x07after"), "after");
        assert_eq!(sanitize_str("\x1b]2;title\x1b\\after"), "after");
    }

    #[test]
    fn drops_charset_designation() {
        assert_eq!(sanitize_str("\x1b(Btext"), "text");
    }

    #[test]
    fn normalizes_carriage_returns() {
        assert_eq!(sanitize_str("line\r\n"), "line\n");
        assert_eq!(
            sanitize_str("progress: 10%\rprogress: 20%\rprogress: 30%\n"),
            "progress: 10%\nprogress: 20%\nprogress: 30%\n"
        );
    }

    #[test]
    fn drops_truncated_csi() {
        assert_eq!(sanitize_str("ok\x1b[31"), "ok");
    }

    #[test]
    fn is_idempotent() {
        let cases: &[&[u8]] = &[
            b"plain\n",
            b"\x1b[32mgreen\x1b[0m\r\npartial\r",
            b"\x1b]0;t\x07\x1b[2J\x1b[Hbody",
            b"trailing\x1b[12",
            b"\x1b(B\x1b[1mBOLD",
        ];
        for case in cases {
            let once = sanitize_for_log(case);
            assert_eq!(sanitize_for_log(&once), once);
        }
    }
}
