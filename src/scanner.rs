use std::{collections::HashMap, iter::Peekable, str::Chars, sync::OnceLock};
use strum_macros::{Display, EnumString};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
pub enum TokenType {
    // Single-character tokens.
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Colon,
    Semicolon,
    Slash,
    Star,
    Percent,

    // One or two character tokens.
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    PlusEqual,
    MinusEqual,
    StarEqual,
    SlashEqual,
    PercentEqual,
    StarStar,

    // Literals.
    Identifier,
    String,
    Int,
    Float,

    // Keywords.
    And,
    As,
    Break,
    Case,
    Catch,
    Class,
    Const,
    Continue,
    Default,
    Else,
    Export,
    False,
    For,
    Fun,
    If,
    Import,
    In,
    Nil,
    Or,
    Print,
    Pub,
    Return,
    Static,
    Super,
    Switch,
    This,
    True,
    Try,
    Var,
    While,

    Error,
    Eof,
}

static KEYWORDS: phf::Map<&'static str, TokenType> = phf::phf_map! {
    "and" => TokenType::And,
    "as" => TokenType::As,
    "break" => TokenType::Break,
    "case" => TokenType::Case,
    "catch" => TokenType::Catch,
    "class" => TokenType::Class,
    "const" => TokenType::Const,
    "continue" => TokenType::Continue,
    "default" => TokenType::Default,
    "else" => TokenType::Else,
    "export" => TokenType::Export,
    "false" => TokenType::False,
    "for" => TokenType::For,
    "fun" => TokenType::Fun,
    "if" => TokenType::If,
    "import" => TokenType::Import,
    "in" => TokenType::In,
    "nil" => TokenType::Nil,
    "or" => TokenType::Or,
    "print" => TokenType::Print,
    "pub" => TokenType::Pub,
    "return" => TokenType::Return,
    "static" => TokenType::Static,
    "super" => TokenType::Super,
    "switch" => TokenType::Switch,
    "this" => TokenType::This,
    "true" => TokenType::True,
    "try" => TokenType::Try,
    "var" => TokenType::Var,
    "while" => TokenType::While,
};

#[derive(Debug)]
struct TrieNode {
    children: HashMap<char, TrieNode>,
    token_type: Option<TokenType>,
    is_end: bool,
}

impl TrieNode {
    fn new() -> Self {
        TrieNode {
            children: HashMap::new(),
            token_type: None,
            is_end: false,
        }
    }
}

static TRIE_ROOT: OnceLock<TrieNode> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Token<'a> {
    pub token_type: TokenType,
    pub value: &'a str,
    pub line: u32,
}

impl<'a> Token<'a> {
    pub fn empty() -> Token<'a> {
        Token {
            token_type: TokenType::Eof,
            value: "",
            line: 0,
        }
    }
}

pub struct Scanner<'a> {
    source: &'a str,
    chars: Peekable<Chars<'a>>,
    start: usize,
    current: usize,
    line: u32,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Box<Scanner<'a>> {
        TRIE_ROOT.get_or_init(|| {
            let mut root = TrieNode::new();
            for (keyword, token) in KEYWORDS.entries() {
                let mut current_node = &mut root;
                for c in keyword.chars() {
                    current_node = current_node.children.entry(c).or_insert(TrieNode::new());
                }
                current_node.token_type = Some(*token);
                current_node.is_end = true;
            }
            root
        });

        let chars = source.chars().peekable();
        Box::new(Scanner {
            source,
            chars,
            start: 0,
            current: 0,
            line: 1,
        })
    }

    pub fn scan_token(&mut self) -> Token<'a> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_end() {
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
            '(' => self.make_token(TokenType::LeftParen),
            ')' => self.make_token(TokenType::RightParen),
            '[' => self.make_token(TokenType::LeftBracket),
            ']' => self.make_token(TokenType::RightBracket),
            '{' => self.make_token(TokenType::LeftBrace),
            '}' => self.make_token(TokenType::RightBrace),
            ';' => self.make_token(TokenType::Semicolon),
            ':' => self.make_token(TokenType::Colon),
            ',' => self.make_token(TokenType::Comma),
            '.' => self.make_token(TokenType::Dot),
            '"' => self.make_string_token(),
            '-' => {
                if self.match_char('=') {
                    self.make_token(TokenType::MinusEqual)
                } else {
                    self.make_token(TokenType::Minus)
                }
            }
            '+' => {
                if self.match_char('=') {
                    self.make_token(TokenType::PlusEqual)
                } else {
                    self.make_token(TokenType::Plus)
                }
            }
            '/' => {
                if self.match_char('=') {
                    self.make_token(TokenType::SlashEqual)
                } else {
                    self.make_token(TokenType::Slash)
                }
            }
            '*' => {
                if self.match_char('*') {
                    self.make_token(TokenType::StarStar)
                } else if self.match_char('=') {
                    self.make_token(TokenType::StarEqual)
                } else {
                    self.make_token(TokenType::Star)
                }
            }
            '%' => {
                if self.match_char('=') {
                    self.make_token(TokenType::PercentEqual)
                } else {
                    self.make_token(TokenType::Percent)
                }
            }
            '!' => {
                if self.match_char('=') {
                    self.make_token(TokenType::BangEqual)
                } else {
                    self.make_token(TokenType::Bang)
                }
            }
            '=' => {
                if self.match_char('=') {
                    self.make_token(TokenType::EqualEqual)
                } else {
                    self.make_token(TokenType::Equal)
                }
            }
            '<' => {
                if self.match_char('=') {
                    self.make_token(TokenType::LessEqual)
                } else {
                    self.make_token(TokenType::Less)
                }
            }
            '>' => {
                if self.match_char('=') {
                    self.make_token(TokenType::GreaterEqual)
                } else {
                    self.make_token(TokenType::Greater)
                }
            }
            _ => self.error_token("Unexpected character."),
        }
    }

    fn is_digit(ch: char) -> bool {
        ch.is_ascii_digit()
    }

    fn is_alpha(ch: char) -> bool {
        ch.is_ascii_alphabetic() || ch == '_'
    }

    fn make_identifier_token(&mut self) -> Token<'a> {
        loop {
            match self.peek() {
                Some(c) if Self::is_alpha(*c) || Self::is_digit(*c) => self.advance(),
                _ => break,
            };
        }
        let token_type = self.identifier_type();
        self.make_token(token_type)
    }

    fn identifier_type(&mut self) -> TokenType {
        self.check_keyword().unwrap_or(TokenType::Identifier)
    }

    fn make_number_token(&mut self) -> Token<'a> {
        loop {
            match self.peek() {
                Some(c) if Self::is_digit(*c) => self.advance(),
                _ => break,
            };
        }

        let mut is_float = false;
        if let Some('.') = self.peek() {
            if let Some(c) = self.peek_next() {
                if Self::is_digit(c) {
                    is_float = true;
                    self.advance(); // consume the dot
                    while let Some(ch) = self.peek() {
                        if Self::is_digit(*ch) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
            }
        }

        if is_float {
            self.make_token(TokenType::Float)
        } else {
            self.make_token(TokenType::Int)
        }
    }

    fn make_string_token(&mut self) -> Token<'a> {
        loop {
            match self.peek() {
                Some('"') => break,
                Some(ch) => {
                    if *ch == '\n' {
                        self.line += 1;
                    }
                    self.advance();
                }
                None => return self.error_token("Unterminated string."),
            }
        }

        self.advance(); // the closing quote
        self.make_token(TokenType::String)
    }

    fn skip_whitespace(&mut self) {
        loop {
            let next_char = self.peek_next();

            match (self.peek(), next_char) {
                (Some('\n'), _) => {
                    self.line += 1;
                    self.advance();
                }
                (Some(c), _) if c.is_whitespace() => {
                    self.advance();
                }
                (Some('/'), Some('/')) => {
                    while let Some(ch) = self.peek() {
                        if *ch == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                (Some(_), _) | (None, _) => return,
            }
        }
    }

    fn peek(&mut self) -> Option<&char> {
        self.chars.peek()
    }

    fn peek_next(&self) -> Option<char> {
        if self.is_end() {
            return None;
        }

        let mut iter = self.chars.clone();
        iter.next();
        iter.next()
    }

    fn is_end(&self) -> bool {
        self.current >= self.source.len()
    }

    /// Unscanned tail of the source, for one-token lookahead probes.
    pub fn remaining_source(&self) -> &'a str {
        &self.source[self.current..]
    }

    fn make_token(&self, token_type: TokenType) -> Token<'a> {
        Token {
            token_type,
            value: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, reason: &'static str) -> Token<'a> {
        Token {
            token_type: TokenType::Error,
            value: reason,
            line: self.line,
        }
    }

    fn match_char(&mut self, expected: char) -> bool {
        if let Some(&next_char) = self.chars.peek() {
            if next_char == expected {
                self.advance();
                return true;
            }
        }
        false
    }

    fn check_keyword(&mut self) -> Option<TokenType> {
        let trie_root = TRIE_ROOT.get().expect("Trie not initialized");
        let mut current_node = trie_root;

        let substring = &self.source[self.start..self.current];
        for ch in substring.chars() {
            match current_node.children.get(&ch) {
                Some(child) => current_node = child,
                None => return Some(TokenType::Identifier),
            }
        }
        if current_node.is_end {
            current_node.token_type
        } else {
            Some(TokenType::Identifier)
        }
    }

    fn advance(&mut self) -> char {
        if let Some(next_char) = self.chars.next() {
            self.current += next_char.len_utf8();
            next_char
        } else {
            '\0'
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_and_identifiers() {
        let mut scanner = Scanner::new("const constant switch switcher in instance");
        let expected = [
            (TokenType::Const, "const"),
            (TokenType::Identifier, "constant"),
            (TokenType::Switch, "switch"),
            (TokenType::Identifier, "switcher"),
            (TokenType::In, "in"),
            (TokenType::Identifier, "instance"),
            (TokenType::Eof, ""),
        ];
        for (token_type, value) in expected {
            let token = scanner.scan_token();
            assert_eq!(token.token_type, token_type);
            assert_eq!(token.value, value);
        }
    }

    #[test]
    fn test_int_and_float_literals() {
        let mut scanner = Scanner::new("42 3.25 7.");
        assert_eq!(scanner.scan_token().token_type, TokenType::Int);
        assert_eq!(scanner.scan_token().token_type, TokenType::Float);
        // `7.` scans as the int 7 followed by a dot
        assert_eq!(scanner.scan_token().token_type, TokenType::Int);
        assert_eq!(scanner.scan_token().token_type, TokenType::Dot);
    }

    #[test]
    fn test_compound_operators() {
        let mut scanner = Scanner::new("+= -= *= /= %= ** * =");
        let expected = [
            TokenType::PlusEqual,
            TokenType::MinusEqual,
            TokenType::StarEqual,
            TokenType::SlashEqual,
            TokenType::PercentEqual,
            TokenType::StarStar,
            TokenType::Star,
            TokenType::Equal,
        ];
        for token_type in expected {
            assert_eq!(scanner.scan_token().token_type, token_type);
        }
    }

    #[test]
    fn test_string_literal_and_lines() {
        let mut scanner = Scanner::new("\"hi\"\n\"there\"");
        let first = scanner.scan_token();
        assert_eq!(first.token_type, TokenType::String);
        assert_eq!(first.value, "\"hi\"");
        assert_eq!(first.line, 1);
        let second = scanner.scan_token();
        assert_eq!(second.token_type, TokenType::String);
        assert_eq!(second.line, 2);
    }

    #[test]
    fn test_unterminated_string() {
        let mut scanner = Scanner::new("\"oops");
        assert_eq!(scanner.scan_token().token_type, TokenType::Error);
    }
}
