//! Parser for hardware module descriptions
//!
//! Parses sources like:
//! ```text
//! enum Mode { Idle, Run }
//!
//! module Acc {
//!     fn init() { self.acc = sfix(0.0, 2, -10, saturate); }
//!     fn main(x) {
//!         self.acc = self.acc + x;
//!         return self.acc;
//!     }
//! }
//! ```

use crate::ast::{
    Arg, AssignOp, BinOp, Design, EnumDef, Expr, FunctionDef, ModuleDef, Stmt, UnaryOp,
};
use crate::error::{CompileError, CompileResult};
use crate::lexer::{Lexer, Spanned, Token};

/// Recursive-descent parser over a pre-lexed token stream
pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    lex_error: Option<CompileError>,
}

impl Parser {
    pub fn new(source: &str) -> Self {
        match Lexer::new(source).tokenize() {
            Ok(tokens) => Self {
                tokens,
                pos: 0,
                lex_error: None,
            },
            Err(e) => Self {
                tokens: Vec::new(),
                pos: 0,
                lex_error: Some(e),
            },
        }
    }

    fn current(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn peek(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|s| &s.token)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |s| s.line)
    }

    fn error(&self, msg: impl Into<String>) -> CompileError {
        CompileError::parse_error(self.line(), msg)
    }

    /// Advance to the next token
    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Check if current token matches expected
    fn check(&self, expected: &Token) -> bool {
        match self.current() {
            Some(tok) => std::mem::discriminant(tok) == std::mem::discriminant(expected),
            None => false,
        }
    }

    /// Consume the token if it matches
    fn eat(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consume token if it matches, otherwise error
    fn expect(&mut self, expected: Token) -> CompileResult<Token> {
        if self.check(&expected) {
            self.advance()
                .ok_or_else(|| self.error("Unexpected end of input"))
        } else {
            Err(self.error(format!(
                "Expected '{}', got {}",
                expected,
                self.describe_current()
            )))
        }
    }

    fn expect_ident(&mut self, what: &str) -> CompileResult<String> {
        match self.current() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(format!(
                "Expected {}, got {}",
                what,
                self.describe_current()
            ))),
        }
    }

    fn describe_current(&self) -> String {
        match self.current() {
            Some(tok) => format!("'{}'", tok),
            None => "end of input".to_string(),
        }
    }

    /// Collect consecutive doc comments
    fn parse_docs(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        while let Some(Token::DocComment(text)) = self.current() {
            lines.push(text.clone());
            self.advance();
        }
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }

    /// Parse a complete source file
    pub fn parse_design(&mut self) -> CompileResult<Design> {
        if let Some(e) = self.lex_error.take() {
            return Err(e);
        }

        let mut design = Design::default();
        loop {
            let doc = self.parse_docs();
            match self.current() {
                Some(Token::Module) => design.modules.push(self.parse_module(doc)?),
                Some(Token::Enum) => design.enums.push(self.parse_enum()?),
                None => break,
                _ => {
                    return Err(self.error(format!(
                        "Expected 'module' or 'enum', got {}",
                        self.describe_current()
                    )))
                }
            }
        }
        Ok(design)
    }

    fn parse_enum(&mut self) -> CompileResult<EnumDef> {
        self.expect(Token::Enum)?;
        let name = self.expect_ident("enum name")?;
        self.expect(Token::LBrace)?;

        let mut variants = Vec::new();
        while !self.check(&Token::RBrace) {
            variants.push(self.expect_ident("enum variant")?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RBrace)?;

        if variants.is_empty() {
            return Err(self.error(format!("enum '{}' has no variants", name)));
        }
        Ok(EnumDef { name, variants })
    }

    fn parse_module(&mut self, doc: Option<String>) -> CompileResult<ModuleDef> {
        self.expect(Token::Module)?;
        let name = self.expect_ident("module name")?;
        self.expect(Token::LBrace)?;

        let mut functions = Vec::new();
        loop {
            let doc = self.parse_docs();
            if self.eat(&Token::RBrace) {
                break;
            }
            functions.push(self.parse_function(doc)?);
        }

        Ok(ModuleDef {
            name,
            doc,
            functions,
        })
    }

    fn parse_function(&mut self, doc: Option<String>) -> CompileResult<FunctionDef> {
        self.expect(Token::Fn)?;
        let name = self.expect_ident("function name")?;
        self.expect(Token::LParen)?;

        let mut params = Vec::new();
        while !self.check(&Token::RParen) {
            params.push(self.expect_ident("parameter name")?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen)?;

        let body = self.parse_block()?;
        Ok(FunctionDef {
            name,
            params,
            doc,
            body,
        })
    }

    fn parse_block(&mut self) -> CompileResult<Vec<Stmt>> {
        self.expect(Token::LBrace)?;
        let mut statements = Vec::new();
        loop {
            self.parse_docs();
            if self.eat(&Token::RBrace) {
                break;
            }
            if self.current().is_none() {
                return Err(self.error("Unexpected end of input, missing '}'"));
            }
            statements.push(self.parse_statement()?);
        }
        Ok(statements)
    }

    fn parse_statement(&mut self) -> CompileResult<Stmt> {
        match self.current() {
            Some(Token::If) => self.parse_if(),
            Some(Token::For) => {
                self.advance();
                let var = self.expect_ident("loop variable")?;
                self.expect(Token::In)?;
                let iter = self.parse_expr()?;
                let body = self.parse_block()?;
                Ok(Stmt::For { var, iter, body })
            }
            Some(Token::Return) => {
                self.advance();
                let mut values = Vec::new();
                if !self.check(&Token::Semicolon) {
                    values.push(self.parse_expr()?);
                    while self.eat(&Token::Comma) {
                        values.push(self.parse_expr()?);
                    }
                }
                self.expect(Token::Semicolon)?;
                Ok(Stmt::Return(values))
            }
            Some(Token::Pass) => {
                self.advance();
                self.expect(Token::Semicolon)?;
                Ok(Stmt::Pass)
            }
            _ => self.parse_simple_statement(),
        }
    }

    fn parse_if(&mut self) -> CompileResult<Stmt> {
        self.expect(Token::If)?;
        let mut branches = Vec::new();
        let cond = self.parse_expr()?;
        branches.push((cond, self.parse_block()?));

        while self.eat(&Token::Elif) {
            let cond = self.parse_expr()?;
            branches.push((cond, self.parse_block()?));
        }

        let orelse = if self.eat(&Token::Else) {
            self.parse_block()?
        } else {
            Vec::new()
        };

        Ok(Stmt::If { branches, orelse })
    }

    /// Assignment or expression statement
    fn parse_simple_statement(&mut self) -> CompileResult<Stmt> {
        let mut targets = vec![self.parse_expr()?];
        while self.eat(&Token::Comma) {
            targets.push(self.parse_expr()?);
        }

        let op = match self.current() {
            Some(Token::Equals) => Some(AssignOp::Plain),
            Some(Token::PlusEq) => Some(AssignOp::Add),
            Some(Token::MinusEq) => Some(AssignOp::Sub),
            Some(Token::StarEq) => Some(AssignOp::Mul),
            Some(Token::SlashEq) => Some(AssignOp::Div),
            _ => None,
        };

        let stmt = match op {
            Some(op) => {
                self.advance();
                for target in &targets {
                    if !matches!(target, Expr::Name(_) | Expr::Attr(..) | Expr::Index(..)) {
                        return Err(self.error(format!("cannot assign to '{}'", target)));
                    }
                }
                let first = self.parse_expr()?;
                let value = if self.check(&Token::Comma) {
                    let mut items = vec![first];
                    while self.eat(&Token::Comma) {
                        items.push(self.parse_expr()?);
                    }
                    Expr::Tuple(items)
                } else {
                    first
                };
                Stmt::Assign { targets, op, value }
            }
            None => {
                if targets.len() != 1 {
                    return Err(self.error("Expected '=' after assignment targets"));
                }
                Stmt::Expr(targets.remove(0))
            }
        };

        self.expect(Token::Semicolon)?;
        Ok(stmt)
    }

    /// Parse an expression (handles operator precedence)
    pub fn parse_expr(&mut self) -> CompileResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = binary(BinOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = binary(BinOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> CompileResult<Expr> {
        if self.eat(&Token::Not) {
            let operand = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_bitor()?;
        loop {
            let op = match self.current() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::Ne,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.advance();
            let right = self.parse_bitor()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_bitor(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_bitxor()?;
        while self.eat(&Token::Pipe) {
            let right = self.parse_bitxor()?;
            left = binary(BinOp::BitOr, left, right);
        }
        Ok(left)
    }

    fn parse_bitxor(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_bitand()?;
        while self.eat(&Token::Caret) {
            let right = self.parse_bitand()?;
            left = binary(BinOp::BitXor, left, right);
        }
        Ok(left)
    }

    fn parse_bitand(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_shift()?;
        while self.eat(&Token::Amp) {
            let right = self.parse_shift()?;
            left = binary(BinOp::BitAnd, left, right);
        }
        Ok(left)
    }

    fn parse_shift(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.current() {
                Some(Token::Shl) => BinOp::Shl,
                Some(Token::Shr) => BinOp::Shr,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    /// Parse additive expressions: a + b, a - b
    fn parse_additive(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    /// Parse multiplicative expressions: a * b, a / b, a % b
    fn parse_multiplicative(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    /// Parse unary minus; negative literals fold into the literal
    fn parse_unary(&mut self) -> CompileResult<Expr> {
        if self.eat(&Token::Minus) {
            let operand = self.parse_unary()?;
            return Ok(match operand {
                Expr::Int(n) => Expr::Int(-n),
                Expr::Float(n) => Expr::Float(-n),
                other => Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(other),
                },
            });
        }
        self.parse_postfix()
    }

    /// Parse postfix expressions: a.b, a[i], a(args)
    fn parse_postfix(&mut self) -> CompileResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = self.expect_ident("attribute name after '.'")?;
                expr = Expr::attr(expr, name);
            } else if self.eat(&Token::LBracket) {
                expr = self.parse_subscript(expr)?;
            } else if self.check(&Token::LParen) {
                let args = self.parse_args()?;
                expr = Expr::call(expr, args);
            } else {
                break;
            }
        }
        Ok(expr)
    }

    /// After `[`: an index `a[i]` or a slice `a[lo:hi]`
    fn parse_subscript(&mut self, base: Expr) -> CompileResult<Expr> {
        let lower = if self.check(&Token::Colon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        if !self.eat(&Token::Colon) {
            self.expect(Token::RBracket)?;
            return match lower {
                Some(index) => Ok(Expr::index(base, index)),
                None => Err(self.error("Expected an index")),
            };
        }
        let upper = if self.check(&Token::RBracket) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(Token::RBracket)?;
        Ok(Expr::slice(base, lower, upper))
    }

    /// Parse call arguments: (a, b, name=c)
    fn parse_args(&mut self) -> CompileResult<Vec<Arg>> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        while !self.check(&Token::RParen) {
            let named = matches!(
                (self.current(), self.peek(1)),
                (Some(Token::Ident(_)), Some(Token::Equals))
            );
            if named {
                let name = self.expect_ident("argument name")?;
                self.expect(Token::Equals)?;
                args.push(Arg::named(name, self.parse_expr()?));
            } else {
                args.push(Arg::positional(self.parse_expr()?));
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen)?;
        Ok(args)
    }

    /// Parse primary expressions: literals, names, parentheses, lists
    fn parse_primary(&mut self) -> CompileResult<Expr> {
        match self.current() {
            Some(Token::Int(n)) => {
                let n = *n;
                self.advance();
                Ok(Expr::Int(n))
            }
            Some(Token::Float(n)) => {
                let n = *n;
                self.advance();
                Ok(Expr::Float(n))
            }
            Some(Token::True) => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            Some(Token::False) => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.advance();
                Ok(Expr::Name(name))
            }
            Some(Token::LParen) => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => self.parse_list(),
            None => Err(self.error("Unexpected end of input")),
            Some(other) => Err(self.error(format!("Unexpected token '{}'", other))),
        }
    }

    /// Parse `[a, b]`, `[]` or `[item; count]`
    fn parse_list(&mut self) -> CompileResult<Expr> {
        self.expect(Token::LBracket)?;
        if self.eat(&Token::RBracket) {
            return Ok(Expr::List(Vec::new()));
        }

        let first = self.parse_expr()?;
        if self.eat(&Token::Semicolon) {
            let count = match self.advance() {
                Some(Token::Int(n)) if n >= 0 => n as usize,
                _ => return Err(self.error("Expected a non-negative repeat count")),
            };
            self.expect(Token::RBracket)?;
            return Ok(Expr::Repeat(Box::new(first), count));
        }

        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if self.check(&Token::RBracket) {
                break; // Trailing comma
            }
            items.push(self.parse_expr()?);
        }
        self.expect(Token::RBracket)?;
        Ok(Expr::List(items))
    }
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

/// Parse a whole source file
pub fn parse_design(source: &str) -> CompileResult<Design> {
    Parser::new(source).parse_design()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse_body(body: &str) -> Vec<Stmt> {
        let source = format!("module M {{ fn main(x) {{ {} }} }}", body);
        let design = parse_design(&source).unwrap();
        design.modules[0].functions[0].body.clone()
    }

    #[test]
    fn test_parse_module_and_enum() {
        let design = parse_design(
            "enum Mode { Idle, Run, }\n\
             /// Accumulator\n\
             module Acc {\n\
                 fn init() { self.acc = 0; }\n\
                 /// step\n\
                 fn main(x, y) { return x; }\n\
             }",
        )
        .unwrap();

        assert_eq!(design.enums[0].variants, vec!["Idle", "Run"]);
        assert_eq!(design.enumeration("Mode").unwrap().ordinal("Run"), Some(1));

        let module = design.module("Acc").unwrap();
        assert_eq!(module.doc.as_deref(), Some("Accumulator"));
        assert_eq!(module.functions.len(), 2);
        let main = module.function("main").unwrap();
        assert_eq!(main.params, vec!["x", "y"]);
        assert_eq!(main.doc.as_deref(), Some("step"));
    }

    #[test]
    fn test_parse_assignment_precedence() {
        let body = parse_body("self.a = x + 2 * -y;");
        assert_eq!(body.len(), 1);
        if let Stmt::Assign { targets, op, value } = &body[0] {
            assert_eq!(targets[0].to_string(), "self.a");
            assert_eq!(*op, AssignOp::Plain);
            assert_eq!(value.to_string(), "(x + (2 * -y))");
        } else {
            panic!("Expected Assignment");
        }
    }

    #[test]
    fn test_parse_multiple_targets_and_compound() {
        let body = parse_body("a, self.b[1] = self.f(x); c += 1;");
        if let Stmt::Assign { targets, value, .. } = &body[0] {
            assert_eq!(targets.len(), 2);
            assert!(matches!(value, Expr::Call { .. }));
        } else {
            panic!("Expected Assignment");
        }
        assert!(matches!(
            &body[1],
            Stmt::Assign {
                op: AssignOp::Add,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_control_flow() {
        let body = parse_body(
            "if x > 0 and not y { pass; } elif x == 0 { a = 1; } else { a = 2; }\n\
             for i in range(0, 4) { a = i; }\n\
             for t in self.taps { a = t; }\n\
             return a, -1;",
        );
        assert_eq!(body.len(), 4);
        if let Stmt::If { branches, orelse } = &body[0] {
            assert_eq!(branches.len(), 2);
            assert_eq!(branches[0].0.to_string(), "((x > 0) and not y)");
            assert_eq!(orelse.len(), 1);
        } else {
            panic!("Expected If");
        }
        assert!(matches!(&body[2], Stmt::For { var, .. } if var == "t"));
        assert_eq!(body[3], Stmt::Return(vec![Expr::name("a"), Expr::Int(-1)]));
    }

    #[test]
    fn test_parse_lists_and_calls() {
        let body = parse_body(
            "self.taps = [sfix(0.0, 0, -17); 4]; self.v = [1, 2, 3,]; y = resize(x, 0, -7, round=true);",
        );
        if let Stmt::Assign { value, .. } = &body[0] {
            assert!(matches!(value, Expr::Repeat(_, 4)));
        }
        if let Stmt::Assign { value, .. } = &body[1] {
            assert_eq!(value.to_string(), "[1, 2, 3]");
        }
        if let Stmt::Assign { value, .. } = &body[2] {
            if let Expr::Call { args, .. } = value {
                assert_eq!(args.len(), 4);
                assert_eq!(args[3].name.as_deref(), Some("round"));
            } else {
                panic!("Expected Call");
            }
        }
    }

    #[test]
    fn test_parse_slices() {
        let body = parse_body("self.shr = [x] + self.shr[:-1]; y = self.shr[1:]; z = self.shr[1:3];");
        let values: Vec<String> = body
            .iter()
            .map(|stmt| match stmt {
                Stmt::Assign { value, .. } => value.to_string(),
                other => panic!("Expected Assignment, got {}", other),
            })
            .collect();
        assert_eq!(values, vec!["([x] + self.shr[:-1])", "self.shr[1:]", "self.shr[1:3]"]);

        if let Stmt::Assign { value: Expr::Slice { lower, upper, .. }, .. } = &body[2] {
            assert_eq!(lower.as_deref(), Some(&Expr::Int(1)));
            assert_eq!(upper.as_deref(), Some(&Expr::Int(3)));
        } else {
            panic!("Expected Slice");
        }

        assert!(parse_design("module M { fn main() { a = b[]; } }").is_err());
        assert!(parse_design("module M { fn main() { a[1:] = b; } }").is_err());
    }

    #[test]
    fn test_parse_errors() {
        let err = parse_design("module M { fn main() { a = ; } }").unwrap_err();
        assert!(matches!(err, CompileError::ParseError { line: 1, .. }));

        let err = parse_design("module M {\n fn main() {\n a = 1\n }\n}").unwrap_err();
        assert!(matches!(err, CompileError::ParseError { line: 4, .. }));

        assert!(parse_design("fn main() {}").is_err());
        assert!(parse_design("module M { fn main() { 1 = x; } }").is_err());
    }
}
