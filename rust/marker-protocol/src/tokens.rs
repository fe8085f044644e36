// marker-protocol: ASCII token encoding and frame parity

use crate::{ProtocolError, ProtocolResult};

/// Named control tokens accepted inside angle brackets.
const TOKEN_MAP: [(&str, &[u8]); 9] = [
    ("CR", b"\r"),
    ("LF", b"\n"),
    ("CRLF", b"\r\n"),
    ("TAB", b"\t"),
    ("ESC", b"\x1B"),
    ("STX", b"\x02"),
    ("ETX", b"\x03"),
    ("NUL", b"\x00"),
    ("SP", b" "),
];

/// Resolve `<CR>`-style tokens in `text` and return the raw wire bytes.
///
/// Supported forms: the named set (`<CR>`, `<LF>`, `<CRLF>`, `<TAB>`, `<ESC>`,
/// `<STX>`, `<ETX>`, `<NUL>`, `<SP>`), `<0xNN>` for a hex byte, and `<dNNN>`
/// for a decimal byte. Tokens are case-insensitive. An unknown token is
/// emitted literally as `<token>`; a `<` without a closing `>` is a plain
/// character. Everything outside brackets encodes as UTF-8.
pub fn encode_tokens(text: &str) -> ProtocolResult<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('<') {
        out.extend_from_slice(rest[..open].as_bytes());
        let after = &rest[open + 1..];
        let Some(close) = after.find('>') else {
            // no closing bracket: literal '<', keep scanning after it
            out.push(b'<');
            rest = after;
            continue;
        };
        let token = after[..close].trim();
        match resolve_token(token)? {
            Some(bytes) => out.extend_from_slice(&bytes),
            None => {
                out.push(b'<');
                out.extend_from_slice(token.as_bytes());
                out.push(b'>');
            }
        }
        rest = &after[close + 1..];
    }
    out.extend_from_slice(rest.as_bytes());
    Ok(out)
}

fn resolve_token(token: &str) -> ProtocolResult<Option<Vec<u8>>> {
    let up = token.to_ascii_uppercase();
    for (name, bytes) in TOKEN_MAP {
        if up == name {
            return Ok(Some(bytes.to_vec()));
        }
    }
    if let Some(hex) = up.strip_prefix("0X") {
        if hex.len() == 2 && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            let value = u8::from_str_radix(hex, 16)
                .map_err(|e| ProtocolError::InvalidFrame(e.to_string()))?;
            return Ok(Some(vec![value]));
        }
        return Ok(None);
    }
    if let Some(dec) = up.strip_prefix('D') {
        if (1..=3).contains(&dec.len()) && dec.bytes().all(|b| b.is_ascii_digit()) {
            let value: u32 = dec
                .parse()
                .map_err(|e: std::num::ParseIntError| ProtocolError::InvalidFrame(e.to_string()))?;
            if value > 255 {
                return Err(ProtocolError::DecTokenOutOfRange(token.to_string()));
            }
            return Ok(Some(vec![value as u8]));
        }
        return Ok(None);
    }
    Ok(None)
}

/// Enforce the marker's frame parity rule: a payload ending in CR or CRLF
/// must have an even total byte count; when it is odd, an LF is inserted
/// immediately before the final CR.
pub fn ensure_even_before_cr(payload: Vec<u8>) -> Vec<u8> {
    if payload.len() % 2 == 0 {
        return payload;
    }
    let mut payload = payload;
    if payload.ends_with(b"\r\n") {
        payload.insert(payload.len() - 2, b'\n');
    } else if payload.ends_with(b"\r") {
        payload.insert(payload.len() - 1, b'\n');
    }
    payload
}

/// How transmitted frames are rendered in logs and dry-run dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrintMode {
    Hex,
    Ascii,
    #[default]
    HexAscii,
}

/// Upper-case space-separated hex rendering, e.g. `25 48 0A 0D`.
pub fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Printable-ASCII rendering with `.` for control bytes.
pub fn ascii_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if (0x20..=0x7E).contains(&b) { b as char } else { '.' })
        .collect()
}

/// Recoverable ASCII rendering: control bytes become their token form, so
/// the string round-trips through [`encode_tokens`] without ambiguity.
/// `<` is escaped as `<0x3C>` to keep literal text distinguishable from
/// tokens.
pub fn token_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\r' => out.push_str("<CR>"),
            b'\n' => out.push_str("<LF>"),
            b'\t' => out.push_str("<TAB>"),
            0x1B => out.push_str("<ESC>"),
            0x02 => out.push_str("<STX>"),
            0x03 => out.push_str("<ETX>"),
            0x00 => out.push_str("<NUL>"),
            b'<' => out.push_str("<0x3C>"),
            0x20..=0x7E => out.push(b as char),
            other => out.push_str(&format!("<0x{other:02X}>")),
        }
    }
    out
}

/// Render a frame per the configured print mode.
pub fn dump(bytes: &[u8], mode: PrintMode) -> String {
    match mode {
        PrintMode::Hex => hex_string(bytes),
        PrintMode::Ascii => ascii_string(bytes),
        PrintMode::HexAscii => {
            format!("HEX: {} | ASCII: {}", hex_string(bytes), ascii_string(bytes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case("%H<CR>", &[0x25, 0x48, 0x0D]; "named cr")]
    #[test_case("<0x1D>", &[0x1D]; "hex byte")]
    #[test_case("<d031>", &[31]; "dec byte")]
    #[test_case("<STX>A<ETX>", &[0x02, 0x41, 0x03]; "stx etx")]
    #[test_case("<sp>", &[0x20]; "case insensitive")]
    fn encodes_tokens(text: &str, expected: &[u8]) {
        assert_eq!(encode_tokens(text).expect("encode"), expected);
    }

    #[test]
    fn unknown_token_kept_literally() {
        assert_eq!(encode_tokens("<WAT>").expect("encode"), b"<WAT>");
    }

    #[test]
    fn unterminated_bracket_is_plain_text() {
        assert_eq!(encode_tokens("a<b").expect("encode"), b"a<b");
    }

    #[test]
    fn dec_token_out_of_range_rejected() {
        assert!(matches!(
            encode_tokens("<d300>"),
            Err(ProtocolError::DecTokenOutOfRange(_))
        ));
    }

    #[test]
    fn odd_cr_frame_gets_lf_inserted() {
        // %H<CR> is three bytes; parity inserts LF before CR
        let framed = ensure_even_before_cr(encode_tokens("%H<CR>").expect("encode"));
        assert_eq!(framed, [0x25, 0x48, 0x0A, 0x0D]);
    }

    #[test]
    fn even_cr_frame_untouched() {
        let framed = ensure_even_before_cr(encode_tokens("%J1<CR>").expect("encode"));
        assert_eq!(framed, b"%J1\r");
    }

    #[test]
    fn crlf_frame_parity() {
        let framed = ensure_even_before_cr(encode_tokens("%H<CRLF>").expect("encode"));
        assert_eq!(framed, [0x25, 0x48, 0x0A, 0x0D, 0x0A]);
        assert_eq!(framed.len() % 2, 0, "CRLF counts toward total length");
    }

    #[test]
    fn non_cr_frame_untouched() {
        let framed = ensure_even_before_cr(vec![0x1D]);
        assert_eq!(framed, [0x1D]);
    }

    #[test]
    fn dump_modes() {
        let bytes = [0x25, 0x48, 0x0A, 0x0D];
        assert_eq!(dump(&bytes, PrintMode::Hex), "25 48 0A 0D");
        assert_eq!(dump(&bytes, PrintMode::Ascii), "%H..");
        assert_eq!(
            dump(&bytes, PrintMode::HexAscii),
            "HEX: 25 48 0A 0D | ASCII: %H.."
        );
    }

    #[test]
    fn token_string_is_recoverable() {
        let bytes = [0x25, 0x48, 0x0A, 0x0D, 0x00, 0x3C];
        let rendered = token_string(&bytes);
        assert_eq!(rendered, "%H<LF><CR><NUL><0x3C>");
        assert_eq!(encode_tokens(&rendered).expect("re-encode"), bytes);
    }

    proptest! {
        // Any bracket-free ASCII text framed with a trailing CR ends up even-length.
        #[test]
        fn cr_terminated_frames_are_even(text in "[ -;=-~]{0,64}") {
            let encoded = encode_tokens(&format!("{text}<CR>")).expect("encode");
            let framed = ensure_even_before_cr(encoded);
            prop_assert!(framed.ends_with(b"\r"));
            prop_assert_eq!(framed.len() % 2, 0);
        }

        // token_string output re-encodes to the original bytes.
        #[test]
        fn token_string_round_trips(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let rendered = token_string(&bytes);
            prop_assert_eq!(encode_tokens(&rendered).expect("re-encode"), bytes);
        }
    }
}
