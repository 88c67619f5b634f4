use radix_trie::Trie;
use thiserror::Error;

use super::token::{Token, TokenKind};
use super::util::StrCursor;

#[derive(Debug, Clone, Error)]
pub enum ScannerError {
    #[error("[line {}] Error: Unterminated string.", .0)]
    UnterminatedString(u64),

    #[error("[line {}] Error: Unexpected character.", .0)]
    UnexpectedCharacter(u64),
}

pub struct Scanner<'a> {
    source: &'a str,
    cursor: StrCursor<'a>,
    start: usize,
    keywords: Trie<&'static str, TokenKind>,
    line: u64,
}

const KEYWORDS: [(&str, TokenKind); 14] = [
    ("and", TokenKind::And),
    ("else", TokenKind::Else),
    ("false", TokenKind::False),
    ("for", TokenKind::For),
    ("fun", TokenKind::Fun),
    ("if", TokenKind::If),
    ("nil", TokenKind::Nil),
    ("or", TokenKind::Or),
    ("print", TokenKind::Print),
    ("return", TokenKind::Return),
    ("this", TokenKind::This),
    ("true", TokenKind::True),
    ("var", TokenKind::Var),
    ("while", TokenKind::While),
];

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Self {
        let mut keywords = Trie::new();
        for keyword in KEYWORDS.iter() {
            keywords.insert(keyword.0, keyword.1);
        }

        Self {
            source,
            cursor: StrCursor::new(source),
            start: 0,
            keywords,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Result<Token<'a>, ScannerError> {
        self.skip_whitespace();
        self.start = self.cursor.index;

        // Hosts terminate interpreter input with a NUL sentinel.
        if let Some('\0') = self.cursor.peek() {
            return Ok(self.create_token(TokenKind::EOF));
        }

        let ch = match self.cursor.advance() {
            Some(ch) => ch,
            None => return Ok(self.create_token(TokenKind::EOF)),
        };

        let token = match ch {
            '(' => self.create_token(TokenKind::ParenLeft),
            ')' => self.create_token(TokenKind::ParenRight),
            '{' => self.create_token(TokenKind::BraceLeft),
            '}' => self.create_token(TokenKind::BraceRight),
            '[' => self.create_token(TokenKind::BracketLeft),
            ']' => self.create_token(TokenKind::BracketRight),
            ';' => self.create_token(TokenKind::Semicolon),
            ',' => self.create_token(TokenKind::Comma),
            '.' => self.create_token(TokenKind::Dot),
            '/' => self.create_token(TokenKind::Slash),
            '*' => self.create_token(TokenKind::Star),
            '-' => self.create_token_match('-', TokenKind::MinusMinus, TokenKind::Minus),
            '+' => self.create_token_match('+', TokenKind::PlusPlus, TokenKind::Plus),
            '!' => self.create_token_match('=', TokenKind::BangEqual, TokenKind::Bang),
            '=' => self.create_token_match('=', TokenKind::EqualEqual, TokenKind::Equal),
            '<' => self.create_token_match('=', TokenKind::LessEqual, TokenKind::Less),
            '>' => self.create_token_match('=', TokenKind::GreaterEqual, TokenKind::Greater),
            '"' => self.create_string_token()?,
            ch if ch.is_ascii_digit() => self.create_digit_token(),
            ch if ch.is_alphabetic() || ch == '_' => self.create_identifier_token(),
            _ => return Err(ScannerError::UnexpectedCharacter(self.line)),
        };
        Ok(token)
    }

    fn match_token(&mut self, expected: char) -> bool {
        if let Some(ch) = self.cursor.peek() {
            if ch == expected {
                self.cursor.advance();
                return true;
            }
        }
        false
    }

    fn create_token(&self, kind: TokenKind) -> Token<'a> {
        let data = &self.source[self.start..self.cursor.index];
        Token::new(kind, data, self.line, self.start)
    }

    fn create_token_match(
        &mut self,
        matches: char,
        if_matches: TokenKind,
        otherwise: TokenKind,
    ) -> Token<'a> {
        if self.match_token(matches) {
            self.create_token(if_matches)
        } else {
            self.create_token(otherwise)
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.cursor.peek() {
            match ch {
                '\n' => {
                    self.line += 1;
                    self.cursor.advance();
                }
                ' ' | '\t' | '\r' => {
                    self.cursor.advance();
                }
                '#' => {
                    // Comment runs to the end of the line.
                    while let Some(ch) = self.cursor.peek() {
                        if ch == '\n' {
                            break;
                        }
                        self.cursor.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn create_identifier_token(&mut self) -> Token<'a> {
        self.cursor
            .advance_when(|ch| ch.is_alphanumeric() || ch == '_');

        let identifier = &self.source[self.start..self.cursor.index];
        if let Some(kind) = self.keywords.get(identifier) {
            self.create_token(*kind)
        } else {
            self.create_token(TokenKind::Identifier)
        }
    }

    fn create_digit_token(&mut self) -> Token<'a> {
        let check_digit = |ch: char| ch.is_ascii_digit();

        self.cursor.advance_when(check_digit);

        // Check for a fractional part and scan that.
        if let Some('.') = self.cursor.peek() {
            if let Some(ch) = self.cursor.peek_next() {
                if check_digit(ch) {
                    self.cursor.advance(); // Consume the dot.
                    self.cursor.advance_when(check_digit);
                }
            }
        }

        self.create_token(TokenKind::Number)
    }

    fn create_string_token(&mut self) -> Result<Token<'a>, ScannerError> {
        loop {
            match self.cursor.peek() {
                Some('"') => {
                    self.cursor.advance();
                    break;
                }
                Some('\n') => {
                    self.line += 1;
                    self.cursor.advance();
                }
                Some('\0') | None => return Err(ScannerError::UnterminatedString(self.line)),
                Some(_) => {
                    self.cursor.advance();
                }
            }
        }

        Ok(self.create_token(TokenKind::String))
    }
}
