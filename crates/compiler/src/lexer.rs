//! Tokenizer: a lazy stream of [`Token`]s over UTF-8 source bytes.
//!
//! Mirrors `PascalTokenizer`'s `Start`/`Curr`/`Line`/`LinePtr` cursor style:
//! the lexer owns byte offsets into the source rather than an iterator
//! adapter chain, which keeps multi-character lookahead (`:=`, `<=`, `..`,
//! block comments) simple.

use crate::token::{Keyword, Punct, Token, TokenKind};
use pasc_core::PString;

pub struct Lexer<'src> {
    src: &'src [u8],
    start: usize,
    curr: usize,
    line: u32,
    line_start: usize,
    /// One-token pushback buffer for `peek()`, so peeking never re-lexes.
    lookahead: Option<Token>,
}

impl<'src> Lexer<'src> {
    pub fn new(src: &'src str) -> Self {
        Lexer {
            src: src.as_bytes(),
            start: 0,
            curr: 0,
            line: 1,
            line_start: 0,
            lookahead: None,
        }
    }

    pub fn peek(&mut self) -> Token {
        if self.lookahead.is_none() {
            self.lookahead = Some(self.scan());
        }
        self.lookahead.clone().unwrap()
    }

    pub fn next(&mut self) -> Token {
        if let Some(tok) = self.lookahead.take() {
            return tok;
        }
        self.scan()
    }

    fn column(&self) -> u32 {
        (self.start - self.line_start) as u32 + 1
    }

    fn at_end(&self) -> bool {
        self.curr >= self.src.len()
    }

    fn peek_byte(&self) -> u8 {
        if self.at_end() {
            0
        } else {
            self.src[self.curr]
        }
    }

    fn peek2_byte(&self) -> u8 {
        if self.curr + 1 >= self.src.len() {
            0
        } else {
            self.src[self.curr + 1]
        }
    }

    fn advance(&mut self) -> u8 {
        let b = self.src[self.curr];
        self.curr += 1;
        b
    }

    fn matches(&mut self, b: u8) -> bool {
        if self.peek_byte() == b {
            self.curr += 1;
            true
        } else {
            false
        }
    }

    fn newline(&mut self) {
        self.line += 1;
        self.line_start = self.curr;
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek_byte() {
                b' ' | b'\t' | b'\r' => {
                    self.curr += 1;
                }
                b'\n' => {
                    self.curr += 1;
                    self.newline();
                }
                b'(' if self.peek2_byte() == b'*' => {
                    self.curr += 2;
                    while !self.at_end() && !(self.peek_byte() == b'*' && self.peek2_byte() == b')')
                    {
                        if self.peek_byte() == b'\n' {
                            self.curr += 1;
                            self.newline();
                        } else {
                            self.curr += 1;
                        }
                    }
                    if !self.at_end() {
                        self.curr += 2; // consume "*)"
                    }
                }
                b'{' => {
                    self.curr += 1;
                    while !self.at_end() && self.peek_byte() != b'}' {
                        if self.peek_byte() == b'\n' {
                            self.curr += 1;
                            self.newline();
                        } else {
                            self.curr += 1;
                        }
                    }
                    if !self.at_end() {
                        self.curr += 1; // consume "}"
                    }
                }
                b'/' if self.peek2_byte() == b'/' => {
                    while !self.at_end() && self.peek_byte() != b'\n' {
                        self.curr += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn make(&self, kind: TokenKind) -> Token {
        Token {
            kind,
            line: self.line,
            column: self.column(),
        }
    }

    fn lexeme(&self) -> &'src str {
        std::str::from_utf8(&self.src[self.start..self.curr]).unwrap_or("")
    }

    fn scan(&mut self) -> Token {
        self.skip_trivia();
        self.start = self.curr;
        if self.at_end() {
            return self.make(TokenKind::Eof);
        }
        let b = self.advance();
        match b {
            b'0'..=b'9' => self.number(),
            b'$' => self.radix_literal(16),
            b'&' => self.radix_literal(8),
            b'%' => self.radix_literal(2),
            b'#' => self.char_escape(),
            b'\'' => self.quoted_run(),
            b'_' | b'A'..=b'Z' | b'a'..=b'z' => self.identifier(),
            _ => self.punct(b),
        }
    }

    fn number(&mut self) -> Token {
        while self.peek_byte().is_ascii_digit() {
            self.curr += 1;
        }
        let mut is_real = false;
        if self.peek_byte() == b'.' && self.peek2_byte() != b'.' && self.peek2_byte().is_ascii_digit() {
            is_real = true;
            self.curr += 1;
            while self.peek_byte().is_ascii_digit() {
                self.curr += 1;
            }
        }
        if self.peek_byte() == b'e' || self.peek_byte() == b'E' {
            let save = self.curr;
            self.curr += 1;
            if self.peek_byte() == b'+' || self.peek_byte() == b'-' {
                self.curr += 1;
            }
            if self.peek_byte().is_ascii_digit() {
                is_real = true;
                while self.peek_byte().is_ascii_digit() {
                    self.curr += 1;
                }
            } else {
                self.curr = save;
            }
        }
        if self.peek_byte().is_ascii_alphabetic() || self.peek_byte() == b'_' {
            while self.peek_byte().is_ascii_alphanumeric() || self.peek_byte() == b'_' {
                self.curr += 1;
            }
            return self.make(TokenKind::Error("malformed number literal"));
        }
        let text = self.lexeme();
        if is_real {
            match text.parse::<f64>() {
                Ok(v) => self.make(TokenKind::Real(v)),
                Err(_) => self.make(TokenKind::Error("malformed real literal")),
            }
        } else {
            match text.parse::<i64>() {
                Ok(v) => self.make(TokenKind::Int(v)),
                Err(_) => match text.parse::<u64>() {
                    Ok(v) => self.make(TokenKind::UInt(v)),
                    Err(_) => self.make(TokenKind::Error("integer literal out of range")),
                },
            }
        }
    }

    fn radix_literal(&mut self, radix: u32) -> Token {
        let digit_start = self.curr;
        while is_radix_digit(self.peek_byte(), radix) {
            self.curr += 1;
        }
        if self.curr == digit_start {
            return self.make(TokenKind::Error("expected digits after radix prefix"));
        }
        let text = std::str::from_utf8(&self.src[digit_start..self.curr]).unwrap_or("");
        match u64::from_str_radix(text, radix) {
            Ok(v) => self.make(TokenKind::UInt(v)),
            Err(_) => self.make(TokenKind::Error("malformed radix literal")),
        }
    }

    /// `#N` char escape, where `N` may itself be `$hex`, `&octal`, or
    /// `%binary` in addition to plain decimal.
    fn char_escape(&mut self) -> Token {
        let code = match self.peek_byte() {
            b'$' => {
                self.curr += 1;
                self.read_radix_value(16)
            }
            b'&' => {
                self.curr += 1;
                self.read_radix_value(8)
            }
            b'%' => {
                self.curr += 1;
                self.read_radix_value(2)
            }
            _ => self.read_radix_value(10),
        };
        match code.and_then(|c| char::from_u32(c as u32)) {
            Some(c) => self.make(TokenKind::Char(c)),
            None => self.make(TokenKind::Error("invalid character code")),
        }
    }

    fn read_radix_value(&mut self, radix: u32) -> Option<u64> {
        let digit_start = self.curr;
        while is_radix_digit(self.peek_byte(), radix) {
            self.curr += 1;
        }
        if self.curr == digit_start {
            return None;
        }
        let text = std::str::from_utf8(&self.src[digit_start..self.curr]).ok()?;
        u64::from_str_radix(text, radix).ok()
    }

    /// A run of `'...'` segments and `#N` escapes concatenated together,
    /// e.g. `'line 1'#13#10'line 2'`. A doubled quote `''` inside a run is
    /// an escaped literal quote, not the run's terminator. A run that folds
    /// to exactly one character becomes a char literal; otherwise a string.
    fn quoted_run(&mut self) -> Token {
        let mut value = PString::new();
        let mut char_count = 0usize;
        let mut last_char = '\0';
        loop {
            // self.advance() already consumed the opening quote for the
            // first segment; for later segments we re-enter here only via
            // the loop below after seeing another `'`.
            loop {
                if self.at_end() {
                    return self.make(TokenKind::Error("unterminated string literal"));
                }
                let b = self.advance();
                if b == b'\'' {
                    if self.peek_byte() == b'\'' {
                        self.curr += 1;
                        value.push('\'');
                        char_count += 1;
                        last_char = '\'';
                        continue;
                    }
                    break;
                }
                if b == b'\n' {
                    return self.make(TokenKind::Error("unterminated string literal"));
                }
                // Decode one UTF-8 scalar starting at b.
                let extra = utf8_extra_bytes(b);
                let start = self.curr - 1;
                self.curr += extra.min(self.src.len() - self.curr);
                let ch = std::str::from_utf8(&self.src[start..self.curr])
                    .ok()
                    .and_then(|s| s.chars().next())
                    .unwrap_or('\u{FFFD}');
                value.push(ch);
                char_count += 1;
                last_char = ch;
            }
            // After closing a `'...'` segment, a following `#N` extends the
            // same run; a following `'` starts a new quoted segment only if
            // immediately adjacent (handled by re-entering the outer loop).
            match self.peek_byte() {
                b'#' => {
                    self.curr += 1;
                    let escape = self.char_escape();
                    match escape.kind {
                        TokenKind::Char(c) => {
                            value.push(c);
                            char_count += 1;
                            last_char = c;
                        }
                        _ => return escape,
                    }
                }
                b'\'' => {
                    self.curr += 1;
                    continue;
                }
                _ => break,
            }
        }
        if char_count == 1 {
            self.make(TokenKind::Char(last_char))
        } else {
            self.make(TokenKind::Str(value))
        }
    }

    fn identifier(&mut self) -> Token {
        while self.peek_byte().is_ascii_alphanumeric() || self.peek_byte() == b'_' {
            self.curr += 1;
        }
        let text = self.lexeme();
        match Keyword::lookup(text) {
            Some(kw) => self.make(TokenKind::Keyword(kw)),
            None => self.make(TokenKind::Ident(text.to_string())),
        }
    }

    fn punct(&mut self, b: u8) -> Token {
        let p = match b {
            b'+' => {
                if self.matches(b'=') {
                    Punct::PlusEq
                } else {
                    Punct::Plus
                }
            }
            b'-' => {
                if self.matches(b'=') {
                    Punct::MinusEq
                } else {
                    Punct::Minus
                }
            }
            b'*' => {
                if self.matches(b'=') {
                    Punct::StarEq
                } else {
                    Punct::Star
                }
            }
            b'/' => {
                if self.matches(b'=') {
                    Punct::SlashEq
                } else {
                    Punct::Slash
                }
            }
            b'%' => {
                if self.matches(b'=') {
                    Punct::PercentEq
                } else {
                    Punct::Percent
                }
            }
            b':' => {
                if self.matches(b'=') {
                    Punct::Assign
                } else {
                    Punct::Colon
                }
            }
            b'=' => Punct::Eq,
            b'<' => {
                if self.matches(b'>') {
                    Punct::NotEq
                } else if self.matches(b'=') {
                    Punct::Le
                } else if self.matches(b'<') {
                    Punct::LShift
                } else {
                    Punct::Lt
                }
            }
            b'>' => {
                if self.matches(b'=') {
                    Punct::Ge
                } else if self.matches(b'>') {
                    Punct::RShift
                } else {
                    Punct::Gt
                }
            }
            b'(' => Punct::LParen,
            b')' => Punct::RParen,
            b'[' => Punct::LBracket,
            b']' => Punct::RBracket,
            b',' => Punct::Comma,
            b';' => Punct::Semicolon,
            b'.' => {
                if self.matches(b'.') {
                    Punct::DotDot
                } else {
                    Punct::Dot
                }
            }
            b'^' => Punct::Caret,
            b'@' => Punct::At,
            _ => return self.make(TokenKind::Error("unknown character")),
        };
        self.make(TokenKind::Punct(p))
    }
}

fn is_radix_digit(b: u8, radix: u32) -> bool {
    match radix {
        2 => matches!(b, b'0' | b'1'),
        8 => matches!(b, b'0'..=b'7'),
        16 => b.is_ascii_hexdigit(),
        _ => b.is_ascii_digit(),
    }
}

fn utf8_extra_bytes(lead: u8) -> usize {
    if lead & 0x80 == 0 {
        0
    } else if lead & 0xE0 == 0xC0 {
        1
    } else if lead & 0xF0 == 0xE0 {
        2
    } else if lead & 0xF8 == 0xF0 {
        3
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut lx = Lexer::new(src);
        let mut out = Vec::new();
        loop {
            let t = lx.next();
            if t.is_eof() {
                break;
            }
            out.push(t.kind);
        }
        out
    }

    #[test]
    fn lexes_keywords_case_insensitively() {
        assert_eq!(
            kinds("Begin End"),
            vec![
                TokenKind::Keyword(Keyword::Begin),
                TokenKind::Keyword(Keyword::End)
            ]
        );
    }

    #[test]
    fn lexes_integer_and_real_literals() {
        assert_eq!(kinds("42"), vec![TokenKind::Int(42)]);
        assert_eq!(kinds("3.14"), vec![TokenKind::Real(3.14)]);
        assert_eq!(kinds("1.."), vec![TokenKind::Int(1), TokenKind::Punct(Punct::DotDot)]);
    }

    #[test]
    fn lexes_radix_literals() {
        assert_eq!(kinds("$FF"), vec![TokenKind::UInt(255)]);
        assert_eq!(kinds("&17"), vec![TokenKind::UInt(15)]);
        assert_eq!(kinds("%101"), vec![TokenKind::UInt(5)]);
    }

    #[test]
    fn lexes_char_and_string_literals() {
        assert_eq!(kinds("'a'"), vec![TokenKind::Char('a')]);
        assert_eq!(kinds("#65"), vec![TokenKind::Char('A')]);
        let toks = kinds("'hello'");
        match &toks[0] {
            TokenKind::Str(s) => assert_eq!(s.as_str(), "hello"),
            other => panic!("expected Str, got {other:?}"),
        }
    }

    #[test]
    fn doubled_quote_is_an_escaped_quote_not_a_terminator() {
        let toks = kinds("'it''s'");
        match &toks[0] {
            TokenKind::Str(s) => assert_eq!(s.as_str(), "it's"),
            other => panic!("expected Str, got {other:?}"),
        }
    }

    #[test]
    fn string_and_char_escape_runs_concatenate() {
        let toks = kinds("'line1'#10'line2'");
        match &toks[0] {
            TokenKind::Str(s) => assert_eq!(s.as_str(), "line1\nline2"),
            other => panic!("expected Str, got {other:?}"),
        }
    }

    #[test]
    fn skips_block_and_line_comments() {
        assert_eq!(kinds("(* hi *) 1 { also hi } 2 // trailing\n3"), vec![
            TokenKind::Int(1),
            TokenKind::Int(2),
            TokenKind::Int(3),
        ]);
    }

    #[test]
    fn peek_does_not_consume() {
        let mut lx = Lexer::new("1 2");
        assert_eq!(lx.peek().kind, TokenKind::Int(1));
        assert_eq!(lx.peek().kind, TokenKind::Int(1));
        assert_eq!(lx.next().kind, TokenKind::Int(1));
        assert_eq!(lx.next().kind, TokenKind::Int(2));
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let mut lx = Lexer::new("'oops");
        assert!(matches!(lx.next().kind, TokenKind::Error(_)));
    }

    #[test]
    fn tracks_line_numbers_across_newlines() {
        let mut lx = Lexer::new("1\n2\n3");
        assert_eq!(lx.next().line, 1);
        assert_eq!(lx.next().line, 2);
        assert_eq!(lx.next().line, 3);
    }
}
