//! Short-filename character handling: the fixed code page used to fold a
//! long Unicode name down to the 8.3 on-disk alphabet, and the rules for
//! which characters are legal, replaced, or dropped when generating a
//! short name.
//!
//! There is no crate in the retrieved pack that carries an OEM code page
//! table, so this is hand-authored against IBM code page 850 (the classic
//! DOS default for short names outside the ASCII range), restricted to the
//! printable upper half actually reachable from a short name.

/// Classification of a Unicode code point when folding it into a short
/// 8.3 name component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortNameChar {
    /// Illegal in a short name outright (e.g. `"*+,/:;<=>?\`).
    Illegal,
    /// Legal as-is once upper-cased.
    Literal(u8),
    /// Dropped silently (spaces and a handful of punctuation marks).
    Skip,
    /// Not representable in cp850; replaced with `_`.
    Replace,
}

const ILLEGAL_ASCII: &[u8] = b"\"*+,/:;<=>?[\\]|";

/// The upper half of code page 850 (0x80..=0xFF), indexed by `byte - 0x80`.
/// Matches the standard IBM CP850 layout used by DOS/Windows FAT drivers.
const CP850_UPPER: [char; 128] = [
    // 0x80..=0x8F
    'Ç', 'ü', 'é', 'â', 'ä', 'à', 'å', 'ç', 'ê', 'ë', 'è', 'ï', 'î', 'ì', 'Ä', 'Å',
    // 0x90..=0x9F
    'É', 'æ', 'Æ', 'ô', 'ö', 'ò', 'û', 'ù', 'ÿ', 'Ö', 'Ü', 'ø', '£', 'Ø', '×', 'ƒ',
    // 0xA0..=0xAF
    'á', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ª', 'º', '¿', '®', '¬', '½', '¼', '¡', '«', '»',
    // 0xB0..=0xBF
    '░', '▒', '▓', '│', '┤', 'Á', 'Â', 'À', '©', '╣', '║', '╗', '╝', '¢', '¥', '┐',
    // 0xC0..=0xCF
    '└', '┴', '┬', '├', '─', '┼', 'ã', 'Ã', '╚', '╔', '╩', '╦', '╠', '═', '╬', '¤',
    // 0xD0..=0xDF
    'ð', 'Ð', 'Ê', 'Ë', 'È', 'ı', 'Í', 'Î', 'Ï', '┘', '┌', '█', '▄', '¦', 'Ì', '▀',
    // 0xE0..=0xEF
    'Ó', 'ß', 'Ô', 'Ò', 'õ', 'Õ', 'µ', 'þ', 'Þ', 'Ú', 'Û', 'Ù', 'ý', 'Ý', '¯', '´',
    // 0xF0..=0xFF
    '\u{00ad}', '±', '‗', '¾', '¶', '§', '÷', '¸', '°', '¨', '·', '¹', '³', '²', '■', '\u{00a0}',
];

/// Folds one Unicode code point of an 8.3 name component into its on-disk
/// representation.
pub fn classify(ch: char) -> ShortNameChar {
    if ch == ' ' || ch == '.' {
        return ShortNameChar::Skip;
    }
    if ch.is_ascii() {
        let byte = ch as u8;
        return if byte < 0x20 || ILLEGAL_ASCII.contains(&byte) {
            ShortNameChar::Illegal
        } else {
            ShortNameChar::Literal(byte.to_ascii_uppercase())
        };
    }
    match encode_cp850(ch) {
        Some(byte) => ShortNameChar::Literal(byte),
        None => ShortNameChar::Replace,
    }
}

/// Encodes a single Unicode scalar into its cp850 byte, if representable.
pub fn encode_cp850(ch: char) -> Option<u8> {
    let upper = ch.to_uppercase().next().unwrap_or(ch);
    CP850_UPPER
        .iter()
        .position(|&c| c == upper)
        .map(|idx| (idx + 0x80) as u8)
}

/// Decodes a cp850 byte (0x80..=0xFF) back to Unicode; ASCII bytes decode
/// to themselves.
pub fn decode_cp850(byte: u8) -> char {
    if byte < 0x80 {
        byte as char
    } else {
        CP850_UPPER[(byte - 0x80) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_letters_uppercase() {
        assert_eq!(classify('a'), ShortNameChar::Literal(b'A'));
    }

    #[test]
    fn illegal_ascii_is_rejected() {
        assert_eq!(classify('*'), ShortNameChar::Illegal);
    }

    #[test]
    fn space_and_dot_are_skipped() {
        assert_eq!(classify(' '), ShortNameChar::Skip);
        assert_eq!(classify('.'), ShortNameChar::Skip);
    }

    #[test]
    fn cp850_round_trips_through_decode() {
        let byte = encode_cp850('é').unwrap();
        assert_eq!(decode_cp850(byte), 'É');
    }

    #[test]
    fn unmapped_code_point_is_replaced() {
        assert_eq!(classify('你'), ShortNameChar::Replace);
    }
}
