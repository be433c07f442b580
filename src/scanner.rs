use strum_macros::{Display, EnumString};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
pub enum TokenType {
    // Single-character tokens.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,

    // One or two character tokens.
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,

    // Literals.
    Identifier,
    String,
    Number,

    // Keywords.
    And,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,

    Error,
    Eof,
}

static KEYWORDS: phf::Map<&'static str, TokenType> = phf::phf_map! {
    "and" => TokenType::And,
    "class" => TokenType::Class,
    "else" => TokenType::Else,
    "false" => TokenType::False,
    "for" => TokenType::For,
    "fun" => TokenType::Fun,
    "if" => TokenType::If,
    "nil" => TokenType::Nil,
    "or" => TokenType::Or,
    "print" => TokenType::Print,
    "return" => TokenType::Return,
    "super" => TokenType::Super,
    "this" => TokenType::This,
    "true" => TokenType::True,
    "var" => TokenType::Var,
    "while" => TokenType::While,
};

#[derive(Debug, Clone)]
pub struct Token<'a> {
    pub token_type: TokenType,
    pub value: &'a str,
    pub line: usize,
}

pub struct Scanner<'a> {
    source: &'a str,
    start: usize,
    current: usize,
    line: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Scanner<'a> {
        Scanner {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Token<'a> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenType::Eof);
        }

        let c = self.advance();

        if Self::is_alpha(c) {
            return self.make_identifier_token();
        }
        if Self::is_digit(c) {
            return self.make_number_token();
        }

        match c {
            b'(' => self.make_token(TokenType::LeftParen),
            b')' => self.make_token(TokenType::RightParen),
            b'{' => self.make_token(TokenType::LeftBrace),
            b'}' => self.make_token(TokenType::RightBrace),
            b';' => self.make_token(TokenType::Semicolon),
            b',' => self.make_token(TokenType::Comma),
            b'.' => self.make_token(TokenType::Dot),
            b'-' => self.make_token(TokenType::Minus),
            b'+' => self.make_token(TokenType::Plus),
            b'/' => self.make_token(TokenType::Slash),
            b'*' => self.make_token(TokenType::Star),
            b'"' => self.make_string_token(),
            b'!' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenType::BangEqual)
                } else {
                    self.make_token(TokenType::Bang)
                }
            }
            b'=' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenType::EqualEqual)
                } else {
                    self.make_token(TokenType::Equal)
                }
            }
            b'<' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenType::LessEqual)
                } else {
                    self.make_token(TokenType::Less)
                }
            }
            b'>' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenType::GreaterEqual)
                } else {
                    self.make_token(TokenType::Greater)
                }
            }
            _ => self.error_token("Unexpected character."),
        }
    }

    fn is_digit(byte: u8) -> bool {
        byte.is_ascii_digit()
    }

    fn is_alpha(byte: u8) -> bool {
        byte.is_ascii_alphabetic() || byte == b'_'
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn byte_at(&self, index: usize) -> u8 {
        self.source.as_bytes()[index]
    }

    fn advance(&mut self) -> u8 {
        let byte = self.byte_at(self.current);
        self.current += 1;
        byte
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() {
            0
        } else {
            self.byte_at(self.current)
        }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.source.len() {
            0
        } else {
            self.byte_at(self.current + 1)
        }
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.byte_at(self.current) != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'\n' => {
                    self.line += 1;
                    self.advance();
                }
                b'/' => {
                    if self.peek_next() == b'/' {
                        while self.peek() != b'\n' && !self.is_at_end() {
                            self.advance();
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn make_identifier_token(&mut self) -> Token<'a> {
        while Self::is_alpha(self.peek()) || Self::is_digit(self.peek()) {
            self.advance();
        }
        let lexeme = &self.source[self.start..self.current];
        let token_type = KEYWORDS
            .get(lexeme)
            .copied()
            .unwrap_or(TokenType::Identifier);
        self.make_token(token_type)
    }

    fn make_number_token(&mut self) -> Token<'a> {
        while Self::is_digit(self.peek()) {
            self.advance();
        }
        // A fractional part needs a digit after the dot.
        if self.peek() == b'.' && Self::is_digit(self.peek_next()) {
            self.advance();
            while Self::is_digit(self.peek()) {
                self.advance();
            }
        }
        self.make_token(TokenType::Number)
    }

    fn make_string_token(&mut self) -> Token<'a> {
        while self.peek() != b'"' && !self.is_at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.advance();
        }
        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }
        self.advance();
        self.make_token(TokenType::String)
    }

    fn make_token(&self, token_type: TokenType) -> Token<'a> {
        Token {
            token_type,
            value: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'a> {
        Token {
            token_type: TokenType::Error,
            value: message,
            line: self.line,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_types(source: &str) -> Vec<TokenType> {
        let mut scanner = Scanner::new(source);
        let mut types = vec![];
        loop {
            let token = scanner.scan_token();
            let token_type = token.token_type;
            types.push(token_type);
            if token_type == TokenType::Eof {
                break;
            }
        }
        types
    }

    #[test]
    fn test_scan_statement() {
        assert_eq!(
            token_types("var answer = 42;"),
            vec![
                TokenType::Var,
                TokenType::Identifier,
                TokenType::Equal,
                TokenType::Number,
                TokenType::Semicolon,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_and_identifiers() {
        assert_eq!(
            token_types("class fun funny superb super"),
            vec![
                TokenType::Class,
                TokenType::Fun,
                TokenType::Identifier,
                TokenType::Identifier,
                TokenType::Super,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn test_two_character_operators() {
        assert_eq!(
            token_types("== != <= >= = < >"),
            vec![
                TokenType::EqualEqual,
                TokenType::BangEqual,
                TokenType::LessEqual,
                TokenType::GreaterEqual,
                TokenType::Equal,
                TokenType::Less,
                TokenType::Greater,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_and_lines() {
        let mut scanner = Scanner::new("// comment\nprint 1;");
        let token = scanner.scan_token();
        assert_eq!(token.token_type, TokenType::Print);
        assert_eq!(token.line, 2);
    }

    #[test]
    fn test_unterminated_string() {
        let mut scanner = Scanner::new("\"open");
        let token = scanner.scan_token();
        assert_eq!(token.token_type, TokenType::Error);
        assert_eq!(token.value, "Unterminated string.");
    }

    #[test]
    fn test_string_lexeme_keeps_quotes() {
        let mut scanner = Scanner::new("\"hi\"");
        let token = scanner.scan_token();
        assert_eq!(token.token_type, TokenType::String);
        assert_eq!(token.value, "\"hi\"");
    }

    #[test]
    fn test_number_with_fraction() {
        let mut scanner = Scanner::new("3.25");
        let token = scanner.scan_token();
        assert_eq!(token.token_type, TokenType::Number);
        assert_eq!(token.value, "3.25");
    }
}
