//! Lexer for the hardware description language using logos
//!
//! Supports tokens like:
//! - Keywords: module, enum, fn, if, elif, else, for, in, return, pass
//! - Identifiers: acc, self, Delay
//! - Numbers: 1, 2.5, 1e-3
//! - Operators: + - * / % << >> & | ^ == != < > <= >= and or not
//! - Assignment: = += -= *= /=
//! - Doc comments: `/// text` (plain `//` comments are skipped)

use logos::Logos;

use crate::error::{CompileError, CompileResult};

/// Token types for the hardware description language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\r]+")]
#[logos(skip r"//([^/\n][^\n]*)?")]
pub enum Token {
    #[regex(r"///[^\n]*", |lex| lex.slice()[3..].trim().to_string())]
    DocComment(String),

    // Literals
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    // Keywords
    #[token("module")]
    Module,
    #[token("enum")]
    Enum,
    #[token("fn")]
    Fn,
    #[token("if")]
    If,
    #[token("elif")]
    Elif,
    #[token("else")]
    Else,
    #[token("for")]
    For,
    #[token("in")]
    In,
    #[token("return")]
    Return,
    #[token("pass")]
    Pass,
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("not")]
    Not,
    #[token("true")]
    True,
    #[token("false")]
    False,

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Operators
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,

    // Assignment
    #[token("=")]
    Equals,
    #[token("+=")]
    PlusEq,
    #[token("-=")]
    MinusEq,
    #[token("*=")]
    StarEq,
    #[token("/=")]
    SlashEq,

    // Punctuation
    #[token(".")]
    Dot,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(";")]
    Semicolon,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::DocComment(s) => write!(f, "/// {}", s),
            Token::Float(n) => write!(f, "{}", n),
            Token::Int(n) => write!(f, "{}", n),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Module => write!(f, "module"),
            Token::Enum => write!(f, "enum"),
            Token::Fn => write!(f, "fn"),
            Token::If => write!(f, "if"),
            Token::Elif => write!(f, "elif"),
            Token::Else => write!(f, "else"),
            Token::For => write!(f, "for"),
            Token::In => write!(f, "in"),
            Token::Return => write!(f, "return"),
            Token::Pass => write!(f, "pass"),
            Token::And => write!(f, "and"),
            Token::Or => write!(f, "or"),
            Token::Not => write!(f, "not"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Shl => write!(f, "<<"),
            Token::Shr => write!(f, ">>"),
            Token::Amp => write!(f, "&"),
            Token::Pipe => write!(f, "|"),
            Token::Caret => write!(f, "^"),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::Le => write!(f, "<="),
            Token::Ge => write!(f, ">="),
            Token::Equals => write!(f, "="),
            Token::PlusEq => write!(f, "+="),
            Token::MinusEq => write!(f, "-="),
            Token::StarEq => write!(f, "*="),
            Token::SlashEq => write!(f, "/="),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Semicolon => write!(f, ";"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
        }
    }
}

/// A token with the source line it started on
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

/// Lexer wrapper that provides a stream of tokens
pub struct Lexer<'source> {
    inner: logos::Lexer<'source, Token>,
    source: &'source str,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            inner: Token::lexer(source),
            source,
        }
    }

    /// Line number (1-based) of the current token
    pub fn line(&self) -> usize {
        let offset = self.inner.span().start;
        self.source[..offset].matches('\n').count() + 1
    }

    /// Lex the whole input, failing on the first unrecognised character
    pub fn tokenize(mut self) -> CompileResult<Vec<Spanned>> {
        let mut tokens = Vec::new();
        while let Some(result) = self.inner.next() {
            let line = self.line();
            match result {
                Ok(token) => tokens.push(Spanned { token, line }),
                Err(()) => {
                    return Err(CompileError::lexer_error(
                        line,
                        format!("unexpected input '{}'", self.inner.slice()),
                    ))
                }
            }
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tokens(source: &str) -> Vec<Token> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_assignment() {
        assert_eq!(
            tokens("self.acc = self.acc + x;"),
            vec![
                Token::Ident("self".to_string()),
                Token::Dot,
                Token::Ident("acc".to_string()),
                Token::Equals,
                Token::Ident("self".to_string()),
                Token::Dot,
                Token::Ident("acc".to_string()),
                Token::Plus,
                Token::Ident("x".to_string()),
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            tokens("0 -10 0.25 1e-3"),
            vec![
                Token::Int(0),
                Token::Minus,
                Token::Int(10),
                Token::Float(0.25),
                Token::Float(1e-3),
            ]
        );
    }

    #[test]
    fn test_keywords_and_operators() {
        assert_eq!(
            tokens("if a >= b and not c { x += 1; }"),
            vec![
                Token::If,
                Token::Ident("a".to_string()),
                Token::Ge,
                Token::Ident("b".to_string()),
                Token::And,
                Token::Not,
                Token::Ident("c".to_string()),
                Token::LBrace,
                Token::Ident("x".to_string()),
                Token::PlusEq,
                Token::Int(1),
                Token::Semicolon,
                Token::RBrace,
            ]
        );
        // keywords only match whole words
        assert_eq!(tokens("index"), vec![Token::Ident("index".to_string())]);
    }

    #[test]
    fn test_slice_punctuation() {
        assert_eq!(
            tokens("x[:-1]"),
            vec![
                Token::Ident("x".to_string()),
                Token::LBracket,
                Token::Colon,
                Token::Minus,
                Token::Int(1),
                Token::RBracket,
            ]
        );
    }

    #[test]
    fn test_comments() {
        assert_eq!(
            tokens("// skipped\n/// kept doc\nfn"),
            vec![Token::DocComment("kept doc".to_string()), Token::Fn]
        );
    }

    #[test]
    fn test_line_numbers_and_errors() {
        let spanned = Lexer::new("a\nb\n\nc").tokenize().unwrap();
        let lines: Vec<usize> = spanned.iter().map(|s| s.line).collect();
        assert_eq!(lines, vec![1, 2, 4]);

        let err = Lexer::new("a = 1;\nb = $;").tokenize().unwrap_err();
        assert!(matches!(err, CompileError::LexerError { line: 2, .. }));
    }
}
