//! Tokenization of source text.
//!
//! The lexer produces a flat token stream with source locations. String
//! literals may contain backtick splices (`"Hello `name`!"`); those are kept
//! as raw segments and re-lexed by the parser so an interpolant's
//! sub-expressions get real locations.

use strum::IntoStaticStr;

use crate::{
    diagnostics::{CompilationErrors, DiagnosticCode},
    location::CodeLocation,
};

/// Keywords and punctuation, plus the literal-carrying kinds.
#[derive(Debug, Clone, PartialEq, IntoStaticStr)]
pub enum TokenKind {
    Identifier(String),
    IntegerLiteral(i64),
    RealLiteral(f64),
    /// A string literal split into text and backtick-splice segments.
    StringLiteral(Vec<StringSegment>),

    // keywords
    Class,
    Struct,
    Enum,
    Var,
    Property,
    Get,
    Set,
    Function,
    Constructor,
    Destructor,
    Sends,
    If,
    Else,
    While,
    Do,
    For,
    Loop,
    Break,
    Continue,
    Return,
    Throw,
    Delete,
    Timeout,
    New,
    Local,
    Null,
    True,
    False,
    This,
    As,
    TypeIdKeyword,
    MemberIdKeyword,
    Static,
    Virtual,
    Override,

    // punctuation
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Colon,
    Semicolon,

    // operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Ampersand,
    Pipe,
    Caret,
    Tilde,
    LessLess,
    GreaterGreater,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    AndAnd,
    OrOr,
    Bang,
    PlusPlus,
    MinusMinus,

    EndOfFile,
}

/// One piece of a string literal.
#[derive(Debug, Clone, PartialEq)]
pub enum StringSegment {
    Text(String),
    /// Raw source between backticks, with the location of its first
    /// character so the parser can lex it in place.
    Splice { source: String, location: CodeLocation },
}

/// A token with its source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub location: CodeLocation,
}

/// Tokenizes one code entry, raising diagnostics for malformed input.
pub fn tokenize(origin: &str, code: &str, errors: &mut CompilationErrors) -> Vec<Token> {
    Lexer::new(origin, code).run(errors)
}

struct Lexer<'src> {
    origin: &'src str,
    chars: Vec<char>,
    position: usize,
    line: u32,
    column: u32,
}

impl<'src> Lexer<'src> {
    fn new(origin: &'src str, code: &str) -> Self {
        Self {
            origin,
            chars: code.chars().collect(),
            position: 0,
            line: 1,
            column: 1,
        }
    }

    fn run(mut self, errors: &mut CompilationErrors) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let location = self.here();
            let Some(c) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::EndOfFile,
                    location,
                });
                return tokens;
            };
            let kind = if c.is_ascii_digit() {
                self.lex_number()
            } else if c.is_alphabetic() || c == '_' {
                self.lex_word()
            } else if c == '"' {
                match self.lex_string() {
                    Some(kind) => kind,
                    None => {
                        errors.raise(location, DiagnosticCode::UnterminatedString, "unterminated string literal");
                        tokens.push(Token {
                            kind: TokenKind::EndOfFile,
                            location: self.here(),
                        });
                        return tokens;
                    }
                }
            } else {
                match self.lex_operator() {
                    Some(kind) => kind,
                    None => {
                        errors.raise(
                            location.clone(),
                            DiagnosticCode::UnexpectedCharacter,
                            format!("unexpected character '{c}'"),
                        );
                        self.bump();
                        continue;
                    }
                }
            };
            let mut token_location = location;
            let end = self.here();
            token_location.end_line = end.start_line;
            token_location.end_character = end.start_character;
            tokens.push(Token {
                kind,
                location: token_location,
            });
        }
    }

    fn here(&self) -> CodeLocation {
        CodeLocation::point(self.origin, self.line, self.column)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.position).copied()
    }

    fn peek_ahead(&self, offset: usize) -> Option<char> {
        self.chars.get(self.position + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.position += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek_ahead(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek_ahead(1) == Some('*') => {
                    self.bump();
                    self.bump();
                    while let Some(c) = self.bump() {
                        if c == '*' && self.peek() == Some('/') {
                            self.bump();
                            break;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn lex_number(&mut self) -> TokenKind {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        // A dot starts the fractional part only when followed by a digit, so
        // `5.ToString()` still lexes as member access.
        if self.peek() == Some('.') && self.peek_ahead(1).is_some_and(|c| c.is_ascii_digit()) {
            text.push('.');
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
            if matches!(self.peek(), Some('e' | 'E')) {
                text.push('e');
                self.bump();
                if matches!(self.peek(), Some('+' | '-')) {
                    text.push(self.bump().unwrap_or('+'));
                }
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
            }
            TokenKind::RealLiteral(text.parse().unwrap_or(0.0))
        } else {
            TokenKind::IntegerLiteral(text.parse().unwrap_or(0))
        }
    }

    fn lex_word(&mut self) -> TokenKind {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        match text.as_str() {
            "class" => TokenKind::Class,
            "struct" => TokenKind::Struct,
            "enum" => TokenKind::Enum,
            "var" => TokenKind::Var,
            "property" => TokenKind::Property,
            "get" => TokenKind::Get,
            "set" => TokenKind::Set,
            "function" => TokenKind::Function,
            "constructor" => TokenKind::Constructor,
            "destructor" => TokenKind::Destructor,
            "sends" => TokenKind::Sends,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "do" => TokenKind::Do,
            "for" => TokenKind::For,
            "loop" => TokenKind::Loop,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "return" => TokenKind::Return,
            "throw" => TokenKind::Throw,
            "delete" => TokenKind::Delete,
            "timeout" => TokenKind::Timeout,
            "new" => TokenKind::New,
            "local" => TokenKind::Local,
            "null" => TokenKind::Null,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "this" => TokenKind::This,
            "as" => TokenKind::As,
            "typeid" => TokenKind::TypeIdKeyword,
            "memberid" => TokenKind::MemberIdKeyword,
            "static" => TokenKind::Static,
            "virtual" => TokenKind::Virtual,
            "override" => TokenKind::Override,
            _ => TokenKind::Identifier(text),
        }
    }

    /// Lexes a string literal, splitting backtick splices into segments.
    /// Returns `None` on an unterminated literal.
    fn lex_string(&mut self) -> Option<TokenKind> {
        self.bump(); // opening quote
        let mut segments = Vec::new();
        let mut text = String::new();
        loop {
            let c = self.peek()?;
            match c {
                '"' => {
                    self.bump();
                    if !text.is_empty() || segments.is_empty() {
                        segments.push(StringSegment::Text(std::mem::take(&mut text)));
                    }
                    return Some(TokenKind::StringLiteral(segments));
                }
                '\\' => {
                    self.bump();
                    let escaped = self.bump()?;
                    text.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        other => other,
                    });
                }
                '`' => {
                    if !text.is_empty() {
                        segments.push(StringSegment::Text(std::mem::take(&mut text)));
                    }
                    self.bump();
                    let location = self.here();
                    let mut source = String::new();
                    loop {
                        let inner = self.peek()?;
                        if inner == '`' {
                            self.bump();
                            break;
                        }
                        source.push(inner);
                        self.bump();
                    }
                    segments.push(StringSegment::Splice { source, location });
                }
                _ => {
                    text.push(c);
                    self.bump();
                }
            }
        }
    }

    fn lex_operator(&mut self) -> Option<TokenKind> {
        let c = self.peek()?;
        let two = |lexer: &mut Self, kind: TokenKind| {
            lexer.bump();
            lexer.bump();
            Some(kind)
        };
        let one = |lexer: &mut Self, kind: TokenKind| {
            lexer.bump();
            Some(kind)
        };
        match (c, self.peek_ahead(1)) {
            ('<', Some('<')) => two(self, TokenKind::LessLess),
            ('>', Some('>')) => two(self, TokenKind::GreaterGreater),
            ('+', Some('+')) => two(self, TokenKind::PlusPlus),
            ('-', Some('-')) => two(self, TokenKind::MinusMinus),
            ('+', Some('=')) => two(self, TokenKind::PlusAssign),
            ('-', Some('=')) => two(self, TokenKind::MinusAssign),
            ('*', Some('=')) => two(self, TokenKind::StarAssign),
            ('/', Some('=')) => two(self, TokenKind::SlashAssign),
            ('%', Some('=')) => two(self, TokenKind::PercentAssign),
            ('=', Some('=')) => two(self, TokenKind::Equal),
            ('!', Some('=')) => two(self, TokenKind::NotEqual),
            ('<', Some('=')) => two(self, TokenKind::LessEqual),
            ('>', Some('=')) => two(self, TokenKind::GreaterEqual),
            ('&', Some('&')) => two(self, TokenKind::AndAnd),
            ('|', Some('|')) => two(self, TokenKind::OrOr),
            ('(', _) => one(self, TokenKind::LeftParen),
            (')', _) => one(self, TokenKind::RightParen),
            ('{', _) => one(self, TokenKind::LeftBrace),
            ('}', _) => one(self, TokenKind::RightBrace),
            ('[', _) => one(self, TokenKind::LeftBracket),
            (']', _) => one(self, TokenKind::RightBracket),
            (',', _) => one(self, TokenKind::Comma),
            ('.', _) => one(self, TokenKind::Dot),
            (':', _) => one(self, TokenKind::Colon),
            (';', _) => one(self, TokenKind::Semicolon),
            ('+', _) => one(self, TokenKind::Plus),
            ('-', _) => one(self, TokenKind::Minus),
            ('*', _) => one(self, TokenKind::Star),
            ('/', _) => one(self, TokenKind::Slash),
            ('%', _) => one(self, TokenKind::Percent),
            ('&', _) => one(self, TokenKind::Ampersand),
            ('|', _) => one(self, TokenKind::Pipe),
            ('^', _) => one(self, TokenKind::Caret),
            ('~', _) => one(self, TokenKind::Tilde),
            ('=', _) => one(self, TokenKind::Assign),
            ('<', _) => one(self, TokenKind::Less),
            ('>', _) => one(self, TokenKind::Greater),
            ('!', _) => one(self, TokenKind::Bang),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(code: &str) -> Vec<TokenKind> {
        let mut errors = CompilationErrors::new();
        let tokens = tokenize("test", code, &mut errors);
        assert!(errors.is_empty(), "unexpected lex errors: {:?}", errors.events());
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn keywords_and_identifiers() {
        let kinds = lex("function Factorial");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Function,
                TokenKind::Identifier("Factorial".to_owned()),
                TokenKind::EndOfFile
            ]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(lex("42")[0], TokenKind::IntegerLiteral(42));
        assert_eq!(lex("2.5")[0], TokenKind::RealLiteral(2.5));
        // Dot not followed by a digit is member access, not a fraction.
        let kinds = lex("5.Count");
        assert_eq!(kinds[0], TokenKind::IntegerLiteral(5));
        assert_eq!(kinds[1], TokenKind::Dot);
    }

    #[test]
    fn string_with_splice() {
        let kinds = lex("\"Hi `name`!\"");
        let TokenKind::StringLiteral(segments) = &kinds[0] else {
            panic!("expected string literal");
        };
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], StringSegment::Text("Hi ".to_owned()));
        assert!(matches!(&segments[1], StringSegment::Splice { source, .. } if source == "name"));
        assert_eq!(segments[2], StringSegment::Text("!".to_owned()));
    }

    #[test]
    fn compound_operators() {
        let kinds = lex("a += b << 2");
        assert_eq!(kinds[1], TokenKind::PlusAssign);
        assert_eq!(kinds[3], TokenKind::LessLess);
    }

    #[test]
    fn comments_are_trivia() {
        let kinds = lex("a // line\n/* block */ b");
        assert_eq!(kinds.len(), 3);
    }

    #[test]
    fn unterminated_string_reports() {
        let mut errors = CompilationErrors::new();
        tokenize("test", "\"abc", &mut errors);
        assert_eq!(errors.events()[0].code, DiagnosticCode::UnterminatedString);
    }
}
