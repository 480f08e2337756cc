//! Syntax tree for hardware module descriptions
//!
//! The tree is immutable once parsed: lowering passes take `&[Stmt]` and
//! build rewritten copies.

use std::convert::Infallible;
use std::fmt;

/// A parsed source file: enumerations and module classes
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Design {
    pub enums: Vec<EnumDef>,
    pub modules: Vec<ModuleDef>,
}

impl Design {
    pub fn module(&self, name: &str) -> Option<&ModuleDef> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn enumeration(&self, name: &str) -> Option<&EnumDef> {
        self.enums.iter().find(|e| e.name == name)
    }
}

/// `enum Mode { Idle, Run }`
#[derive(Debug, Clone, PartialEq)]
pub struct EnumDef {
    pub name: String,
    pub variants: Vec<String>,
}

impl EnumDef {
    pub fn ordinal(&self, variant: &str) -> Option<i64> {
        self.variants.iter().position(|v| v == variant).map(|i| i as i64)
    }
}

/// A module class: constructor plus step and helper functions
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDef {
    pub name: String,
    pub doc: Option<String>,
    pub functions: Vec<FunctionDef>,
}

impl ModuleDef {
    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub doc: Option<String>,
    pub body: Vec<Stmt>,
}

/// Statements
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `a = e;`, `a, b = call();`, `a += e;`
    Assign {
        targets: Vec<Expr>,
        op: AssignOp,
        value: Expr,
    },
    /// Expression evaluated for its effect (calls)
    Expr(Expr),
    /// `if c { } elif d { } else { }`
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        orelse: Vec<Stmt>,
    },
    /// `for x in iter { }`
    For {
        var: String,
        iter: Expr,
        body: Vec<Stmt>,
    },
    Return(Vec<Expr>),
    Pass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Plain,
    Add,
    Sub,
    Mul,
    Div,
}

impl AssignOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            AssignOp::Plain => "=",
            AssignOp::Add => "+=",
            AssignOp::Sub => "-=",
            AssignOp::Mul => "*=",
            AssignOp::Div => "/=",
        }
    }

    /// The binary operator a compound assignment applies
    pub fn binary(&self) -> Option<BinOp> {
        match self {
            AssignOp::Plain => None,
            AssignOp::Add => Some(BinOp::Add),
            AssignOp::Sub => Some(BinOp::Sub),
            AssignOp::Mul => Some(BinOp::Mul),
            AssignOp::Div => Some(BinOp::Div),
        }
    }
}

/// Expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Bool(bool),
    Name(String),
    /// `base.name`
    Attr(Box<Expr>, String),
    /// `base[index]`
    Index(Box<Expr>, Box<Expr>),
    /// `base[lower:upper]`, either bound optional
    Slice {
        base: Box<Expr>,
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
    },
    Call { func: Box<Expr>, args: Vec<Arg> },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary { op: UnaryOp, operand: Box<Expr> },
    /// `[a, b, c]`
    List(Vec<Expr>),
    /// `[e; n]`
    Repeat(Box<Expr>, usize),
    /// `a, b` on the right-hand side of an assignment
    Tuple(Vec<Expr>),
}

/// Call argument, optionally named (`ret_0 => dest` after lowering)
#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub name: Option<String>,
    pub value: Expr,
}

impl Arg {
    pub fn positional(value: Expr) -> Self {
        Self { name: None, value }
    }

    pub fn named(name: impl Into<String>, value: Expr) -> Self {
        Self {
            name: Some(name.into()),
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
    /// List concatenation; lowering gives list-typed `+` this operator
    Concat,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Concat => "++",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl Expr {
    pub fn name(name: impl Into<String>) -> Self {
        Expr::Name(name.into())
    }

    pub fn attr(base: Expr, name: impl Into<String>) -> Self {
        Expr::Attr(Box::new(base), name.into())
    }

    pub fn index(base: Expr, index: Expr) -> Self {
        Expr::Index(Box::new(base), Box::new(index))
    }

    pub fn slice(base: Expr, lower: Option<Expr>, upper: Option<Expr>) -> Self {
        Expr::Slice {
            base: Box::new(base),
            lower: lower.map(Box::new),
            upper: upper.map(Box::new),
        }
    }

    pub fn call(func: Expr, args: Vec<Arg>) -> Self {
        Expr::Call {
            func: Box::new(func),
            args,
        }
    }

    /// Name of the variable at the root of an attribute/index chain
    pub fn root_name(&self) -> Option<&str> {
        match self {
            Expr::Name(name) => Some(name),
            Expr::Attr(base, _) | Expr::Index(base, _) => base.root_name(),
            _ => None,
        }
    }

    /// Numeric literal, possibly negated
    pub fn is_numeric_literal(&self) -> bool {
        match self {
            Expr::Int(_) | Expr::Float(_) => true,
            Expr::Unary {
                op: UnaryOp::Neg,
                operand,
            } => operand.is_numeric_literal(),
            _ => false,
        }
    }

    /// Flatten `a.b[i].c` into its root and the access chain after it
    pub fn chain(&self) -> (&Expr, Vec<Access<'_>>) {
        let mut accesses = Vec::new();
        let mut node = self;
        loop {
            match node {
                Expr::Attr(base, name) => {
                    accesses.push(Access::Field(name));
                    node = base;
                }
                Expr::Index(base, index) => {
                    accesses.push(Access::Index(index));
                    node = base;
                }
                _ => break,
            }
        }
        accesses.reverse();
        (node, accesses)
    }

    /// Rebuild an access chain on top of `root`
    pub fn from_chain(root: Expr, accesses: &[Access<'_>]) -> Expr {
        accesses.iter().fold(root, |base, access| match access {
            Access::Field(name) => Expr::attr(base, *name),
            Access::Index(index) => Expr::index(base, (*index).clone()),
        })
    }

    /// Rooted at `self`
    pub fn is_self_rooted(&self) -> bool {
        matches!(self.chain().0, Expr::Name(n) if n == "self")
    }

    /// First attribute name below `self`, skipping an explicit `next`/`current`
    pub fn self_attribute(&self) -> Option<&str> {
        let (root, chain) = self.chain();
        if !matches!(root, Expr::Name(n) if n == "self") {
            return None;
        }
        let mut fields = chain.iter().filter_map(|a| match a {
            Access::Field(name) => Some(*name),
            Access::Index(_) => None,
        });
        match fields.next() {
            Some("next") | Some("current") => fields.next(),
            other => other,
        }
    }

    /// Rebuild bottom-up, applying `f` to every node after its children
    pub fn try_transform<E, F>(self, f: &mut F) -> Result<Expr, E>
    where
        F: FnMut(Expr) -> Result<Expr, E>,
    {
        let rebuilt = match self {
            Expr::Attr(base, name) => Expr::Attr(Box::new(base.try_transform(f)?), name),
            Expr::Index(base, index) => Expr::Index(
                Box::new(base.try_transform(f)?),
                Box::new(index.try_transform(f)?),
            ),
            Expr::Call { func, args } => {
                let func = func.try_transform(f)?;
                let mut rebuilt = Vec::with_capacity(args.len());
                for arg in args {
                    rebuilt.push(Arg {
                        name: arg.name,
                        value: arg.value.try_transform(f)?,
                    });
                }
                Expr::call(func, rebuilt)
            }
            Expr::Binary { op, lhs, rhs } => Expr::Binary {
                op,
                lhs: Box::new(lhs.try_transform(f)?),
                rhs: Box::new(rhs.try_transform(f)?),
            },
            Expr::Unary { op, operand } => Expr::Unary {
                op,
                operand: Box::new(operand.try_transform(f)?),
            },
            Expr::List(items) => Expr::List(
                items
                    .into_iter()
                    .map(|item| item.try_transform(f))
                    .collect::<Result<_, E>>()?,
            ),
            Expr::Slice { base, lower, upper } => Expr::Slice {
                base: Box::new(base.try_transform(f)?),
                lower: match lower {
                    Some(bound) => Some(Box::new(bound.try_transform(f)?)),
                    None => None,
                },
                upper: match upper {
                    Some(bound) => Some(Box::new(bound.try_transform(f)?)),
                    None => None,
                },
            },
            Expr::Repeat(item, n) => Expr::Repeat(Box::new(item.try_transform(f)?), n),
            Expr::Tuple(items) => Expr::Tuple(
                items
                    .into_iter()
                    .map(|item| item.try_transform(f))
                    .collect::<Result<_, E>>()?,
            ),
            leaf => leaf,
        };
        f(rebuilt)
    }

    /// Replace every use of variable `name` with `with`
    pub fn substitute(self, name: &str, with: &Expr) -> Expr {
        let result: Result<Expr, Infallible> = self.try_transform(&mut |e| {
            Ok(match e {
                Expr::Name(n) if n == name => with.clone(),
                other => other,
            })
        });
        match result {
            Ok(expr) => expr,
            Err(never) => match never {},
        }
    }

    /// Visit this node and every sub-expression, parents first
    pub fn walk(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Attr(base, _) => base.walk(f),
            Expr::Index(base, index) => {
                base.walk(f);
                index.walk(f);
            }
            Expr::Call { func, args } => {
                func.walk(f);
                for arg in args {
                    arg.value.walk(f);
                }
            }
            Expr::Binary { lhs, rhs, .. } => {
                lhs.walk(f);
                rhs.walk(f);
            }
            Expr::Unary { operand, .. } => operand.walk(f),
            Expr::List(items) | Expr::Tuple(items) => {
                for item in items {
                    item.walk(f);
                }
            }
            Expr::Slice { base, lower, upper } => {
                base.walk(f);
                for bound in lower.iter().chain(upper) {
                    bound.walk(f);
                }
            }
            Expr::Repeat(item, _) => item.walk(f),
            Expr::Int(_) | Expr::Float(_) | Expr::Bool(_) | Expr::Name(_) => {}
        }
    }
}

/// One step of an attribute/index chain
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Access<'a> {
    Field(&'a str),
    Index(&'a Expr),
}

impl Stmt {
    /// Visit every expression in this statement and its nested blocks
    pub fn walk_exprs(&self, f: &mut impl FnMut(&Expr)) {
        match self {
            Stmt::Assign { targets, value, .. } => {
                for target in targets {
                    target.walk(f);
                }
                value.walk(f);
            }
            Stmt::Expr(expr) => expr.walk(f),
            Stmt::If { branches, orelse } => {
                for (cond, body) in branches {
                    cond.walk(f);
                    body.iter().for_each(|s| s.walk_exprs(f));
                }
                orelse.iter().for_each(|s| s.walk_exprs(f));
            }
            Stmt::For { iter, body, .. } => {
                iter.walk(f);
                body.iter().for_each(|s| s.walk_exprs(f));
            }
            Stmt::Return(values) => values.iter().for_each(|v| v.walk(f)),
            Stmt::Pass => {}
        }
    }

    /// Replace variable `name`; an inner loop rebinding the name shadows it
    pub fn substitute(&self, name: &str, with: &Expr) -> Stmt {
        let sub = |e: &Expr| e.clone().substitute(name, with);
        match self {
            Stmt::Assign { targets, op, value } => Stmt::Assign {
                targets: targets.iter().map(sub).collect(),
                op: *op,
                value: sub(value),
            },
            Stmt::Expr(expr) => Stmt::Expr(sub(expr)),
            Stmt::If { branches, orelse } => Stmt::If {
                branches: branches
                    .iter()
                    .map(|(cond, body)| (sub(cond), substitute_block(body, name, with)))
                    .collect(),
                orelse: substitute_block(orelse, name, with),
            },
            Stmt::For { var, iter, body } => Stmt::For {
                var: var.clone(),
                iter: sub(iter),
                body: if var == name {
                    body.clone()
                } else {
                    substitute_block(body, name, with)
                },
            },
            Stmt::Return(values) => Stmt::Return(values.iter().map(sub).collect()),
            Stmt::Pass => Stmt::Pass,
        }
    }
}

pub fn substitute_block(body: &[Stmt], name: &str, with: &Expr) -> Vec<Stmt> {
    body.iter().map(|s| s.substitute(name, with)).collect()
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(n) => write!(f, "{}", n),
            Expr::Float(n) => write!(f, "{:?}", n),
            Expr::Bool(b) => write!(f, "{}", b),
            Expr::Name(name) => write!(f, "{}", name),
            Expr::Attr(base, name) => write!(f, "{}.{}", base, name),
            Expr::Index(base, index) => write!(f, "{}[{}]", base, index),
            Expr::Slice { base, lower, upper } => {
                write!(f, "{}[", base)?;
                if let Some(lower) = lower {
                    write!(f, "{}", lower)?;
                }
                write!(f, ":")?;
                if let Some(upper) = upper {
                    write!(f, "{}", upper)?;
                }
                write!(f, "]")
            }
            Expr::Call { func, args } => {
                write!(f, "{}(", func)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if let Some(name) = &arg.name {
                        write!(f, "{}=", name)?;
                    }
                    write!(f, "{}", arg.value)?;
                }
                write!(f, ")")
            }
            Expr::Binary { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
            Expr::Unary { op, operand } => match op {
                UnaryOp::Neg => write!(f, "-{}", operand),
                UnaryOp::Not => write!(f, "not {}", operand),
            },
            Expr::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Expr::Repeat(item, n) => write!(f, "[{}; {}]", item, n),
            Expr::Tuple(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Assign { targets, op, value } => {
                for (i, target) in targets.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", target)?;
                }
                write!(f, " {} {};", op.symbol(), value)
            }
            Stmt::Expr(expr) => write!(f, "{};", expr),
            Stmt::If { branches, .. } => match branches.first() {
                Some((cond, _)) => write!(f, "if {} {{ ... }}", cond),
                None => write!(f, "if"),
            },
            Stmt::For { var, iter, .. } => write!(f, "for {} in {} {{ ... }}", var, iter),
            Stmt::Return(values) => {
                write!(f, "return")?;
                for (i, value) in values.iter().enumerate() {
                    write!(f, "{}{}", if i == 0 { " " } else { ", " }, value)?;
                }
                write!(f, ";")
            }
            Stmt::Pass => write!(f, "pass;"),
        }
    }
}
