//! Tree lowering pipeline
//!
//! Rewrites the body of every converted function into the procedural form
//! the emitter renders. Six passes run in a fixed order, each on the output
//! of the previous one:
//!
//! 1. enum folding: `Mode.Run` becomes its ordinal
//! 2. loop normalization: `for x in self.c` becomes an index loop
//! 3. call restructuring: `self.sub.f(a)` becomes `Pkg.f(self.sub, a, ret_0=dest)`
//! 4. pending insertion: `self.a = v` becomes `self.next.a = v`
//! 5. auto-resize: writes to fixed-point registers get an explicit `resize`,
//!    complex registers one per part; list `+` becomes concatenation
//! 6. sub-module assignment: becomes `Pkg.rtl_deepcopy(target, value)`

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::ast::{substitute_block, Access, Arg, BinOp, Design, Expr, Stmt, UnaryOp};
use crate::error::{CompileError, CompileResult, StateDisciplineError, TranslationError};
use crate::fixed::FixedFormat;
use crate::sim::{BUILTINS, POLICIES};
use crate::types::{FunctionSignature, HwType, ModuleTypeSignature, SignatureSet};

/// Everything a pass may consult while rewriting one function
pub struct CompileContext<'a> {
    pub design: &'a Design,
    pub set: &'a SignatureSet,
    pub signature: &'a ModuleTypeSignature,
    pub function: &'a FunctionSignature,
    /// Call result holders introduced by the passes, declared as variables
    pub synthesized: IndexMap<String, HwType>,
    /// Loop variables; integers that need no declaration
    pub loop_vars: Vec<String>,
    calls: usize,
}

enum Cursor<'s> {
    Module(&'s ModuleTypeSignature),
    Value(HwType),
}

impl<'a> CompileContext<'a> {
    pub fn new(
        design: &'a Design,
        set: &'a SignatureSet,
        signature: &'a ModuleTypeSignature,
        function: &'a FunctionSignature,
    ) -> Self {
        Self {
            design,
            set,
            signature,
            function,
            synthesized: IndexMap::new(),
            loop_vars: Vec::new(),
            calls: 0,
        }
    }

    pub fn class(&self) -> &str {
        &self.signature.class
    }

    /// Hardware type of a variable or own-state path
    pub fn type_of(&self, expr: &Expr) -> Option<HwType> {
        match expr {
            Expr::Int(_) => Some(HwType::Integer),
            Expr::Bool(_) => Some(HwType::Boolean),
            Expr::Name(name) => self
                .function
                .variable(name)
                .cloned()
                .or_else(|| self.synthesized.get(name).cloned())
                .or_else(|| self.loop_vars.contains(name).then_some(HwType::Integer)),
            Expr::Attr(..) | Expr::Index(..) => {
                let (root, chain) = expr.chain();
                let mut cursor = match root {
                    Expr::Name(name) if name == "self" => Cursor::Module(self.signature),
                    other => self.cursor(self.type_of(other)?)?,
                };
                for access in chain {
                    cursor = match (cursor, access) {
                        (Cursor::Module(sig), Access::Field("next" | "current")) => Cursor::Module(sig),
                        (Cursor::Module(sig), Access::Field(name)) => {
                            self.cursor(sig.attribute(name)?.ty.clone())?
                        }
                        (Cursor::Value(HwType::List(element, _)), Access::Index(_)) => self.cursor(*element)?,
                        (Cursor::Value(HwType::Complex(format)), Access::Field("real" | "imag")) => {
                            Cursor::Value(HwType::Fixed(format))
                        }
                        _ => return None,
                    };
                }
                match cursor {
                    Cursor::Module(sig) => Some(HwType::Module(sig.package.clone())),
                    Cursor::Value(ty) => Some(ty),
                }
            }
            // element type is what matters; the length is the sliced list's
            Expr::Slice { base, .. } => self.type_of(base),
            _ => None,
        }
    }

    fn cursor(&self, ty: HwType) -> Option<Cursor<'_>> {
        match ty {
            HwType::Module(package) => self.set.get(&package).map(|sig| Cursor::Module(sig.as_ref())),
            other => Some(Cursor::Value(other)),
        }
    }

    fn fresh_call(&mut self, ty: HwType) -> String {
        let name = format!("_call{}_", self.calls);
        self.calls += 1;
        self.synthesized.insert(name.clone(), ty);
        name
    }

    fn unsupported(&self, construct: impl fmt::Display, reason: impl Into<String>) -> CompileError {
        TranslationError::unsupported(self.class(), construct.to_string(), reason).into()
    }
}

/// One rewrite over a function body
pub trait Pass: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, ctx: &mut CompileContext<'_>, body: &[Stmt]) -> CompileResult<Vec<Stmt>>;
}

/// The passes in the order they must run
pub fn pipeline() -> Vec<Box<dyn Pass>> {
    vec![
        Box::new(EnumFolding),
        Box::new(LoopNormalization),
        Box::new(CallRestructuring),
        Box::new(PendingInsertion),
        Box::new(AutoResize),
        Box::new(SubmoduleAssignment),
    ]
}

/// A converted function, ready for emission
#[derive(Debug, Clone, PartialEq)]
pub struct LoweredFunction {
    pub signature: FunctionSignature,
    pub body: Vec<Stmt>,
    pub synthesized: IndexMap<String, HwType>,
}

/// All converted functions of one package
#[derive(Debug, Clone, PartialEq)]
pub struct LoweredModule {
    pub signature: Arc<ModuleTypeSignature>,
    pub functions: Vec<LoweredFunction>,
}

/// Run every pass over one function body
pub fn lower_body(ctx: &mut CompileContext<'_>, body: &[Stmt]) -> CompileResult<Vec<Stmt>> {
    let mut current = body.to_vec();
    for pass in pipeline() {
        current = pass.run(ctx, &current)?;
        tracing::trace!(
            class = ctx.class(),
            function = %ctx.function.name,
            pass = pass.name(),
            statements = current.len(),
            "lowered"
        );
    }
    Ok(current)
}

/// Lower every converted function of a signature. Functions whose types
/// could not be inferred are left out; calling one from a converted
/// function is an error.
pub fn lower_module(
    design: &Design,
    set: &SignatureSet,
    signature: &Arc<ModuleTypeSignature>,
) -> CompileResult<LoweredModule> {
    for (function, err) in &signature.failures {
        tracing::warn!(
            package = %signature.package,
            function = %function,
            "skipping conversion: {}",
            err
        );
    }

    let count = design.modules.iter().filter(|m| m.name == signature.class).count();
    if count != 1 {
        return Err(TranslationError::AmbiguousSourceDefinition {
            class: signature.class.clone(),
            count,
        }
        .into());
    }
    let module = design.module(&signature.class).ok_or_else(|| {
        TranslationError::unsupported(&signature.class, &signature.class, "no source definition")
    })?;

    let mut functions = Vec::new();
    for (name, function) in &signature.functions {
        let source = module.function(name).ok_or_else(|| {
            TranslationError::unsupported(&signature.class, name, "no source definition")
        })?;
        let mut ctx = CompileContext::new(design, set, signature, function);
        let body = lower_body(&mut ctx, &source.body)?;
        functions.push(LoweredFunction {
            signature: function.clone(),
            body,
            synthesized: ctx.synthesized,
        });
    }
    tracing::debug!(package = %signature.package, functions = functions.len(), "lowered module");

    Ok(LoweredModule {
        signature: signature.clone(),
        functions,
    })
}

pub(crate) fn is_range_call(expr: &Expr) -> bool {
    matches!(expr, Expr::Call { func, .. } if matches!(func.as_ref(), Expr::Name(n) if n == "range"))
}

/// Rebuild statements bottom-up: nested blocks first, then `f` on the
/// statement itself.
fn rewrite_block<F>(body: &[Stmt], f: &mut F) -> CompileResult<Vec<Stmt>>
where
    F: FnMut(Stmt) -> CompileResult<Stmt>,
{
    let mut out = Vec::with_capacity(body.len());
    for stmt in body {
        let stmt = match stmt {
            Stmt::If { branches, orelse } => {
                let mut rewritten = Vec::with_capacity(branches.len());
                for (cond, block) in branches {
                    rewritten.push((cond.clone(), rewrite_block(block, f)?));
                }
                Stmt::If {
                    branches: rewritten,
                    orelse: rewrite_block(orelse, f)?,
                }
            }
            Stmt::For { var, iter, body } => Stmt::For {
                var: var.clone(),
                iter: iter.clone(),
                body: rewrite_block(body, f)?,
            },
            other => other.clone(),
        };
        out.push(f(stmt)?);
    }
    Ok(out)
}

/// Apply `f` to every expression node of every statement
fn rewrite_exprs<F>(body: &[Stmt], f: &mut F) -> CompileResult<Vec<Stmt>>
where
    F: FnMut(Expr) -> CompileResult<Expr>,
{
    let mut out = Vec::with_capacity(body.len());
    for stmt in body {
        out.push(match stmt {
            Stmt::Assign { targets, op, value } => {
                let mut rewritten = Vec::with_capacity(targets.len());
                for target in targets {
                    rewritten.push(target.clone().try_transform(f)?);
                }
                Stmt::Assign {
                    targets: rewritten,
                    op: *op,
                    value: value.clone().try_transform(f)?,
                }
            }
            Stmt::Expr(expr) => Stmt::Expr(expr.clone().try_transform(f)?),
            Stmt::If { branches, orelse } => {
                let mut rewritten = Vec::with_capacity(branches.len());
                for (cond, block) in branches {
                    rewritten.push((cond.clone().try_transform(f)?, rewrite_exprs(block, f)?));
                }
                Stmt::If {
                    branches: rewritten,
                    orelse: rewrite_exprs(orelse, f)?,
                }
            }
            Stmt::For { var, iter, body } => Stmt::For {
                var: var.clone(),
                iter: iter.clone().try_transform(f)?,
                body: rewrite_exprs(body, f)?,
            },
            Stmt::Return(values) => {
                let mut rewritten = Vec::with_capacity(values.len());
                for value in values {
                    rewritten.push(value.clone().try_transform(f)?);
                }
                Stmt::Return(rewritten)
            }
            Stmt::Pass => Stmt::Pass,
        });
    }
    Ok(out)
}

/// Pass 1
pub struct EnumFolding;

impl Pass for EnumFolding {
    fn name(&self) -> &'static str {
        "enum-folding"
    }

    fn run(&self, ctx: &mut CompileContext<'_>, body: &[Stmt]) -> CompileResult<Vec<Stmt>> {
        let ctx = &*ctx;
        rewrite_exprs(body, &mut |expr| match expr {
            Expr::Attr(base, variant) => {
                let def = match base.as_ref() {
                    Expr::Name(name) => ctx.design.enumeration(name),
                    _ => None,
                };
                match def {
                    Some(def) => def.ordinal(&variant).map(Expr::Int).ok_or_else(|| {
                        ctx.unsupported(
                            format!("{}.{}", def.name, variant),
                            format!("enum {} has no such variant", def.name),
                        )
                    }),
                    None => Ok(Expr::Attr(base, variant)),
                }
            }
            other => Ok(other),
        })
    }
}

/// Pass 2
pub struct LoopNormalization;

impl LoopNormalization {
    fn index_name(depth: usize) -> String {
        if depth == 0 {
            "_i_".to_string()
        } else {
            format!("_i{}_", depth)
        }
    }

    fn block(&self, ctx: &mut CompileContext<'_>, body: &[Stmt], depth: usize) -> Vec<Stmt> {
        body.iter()
            .map(|stmt| match stmt {
                Stmt::For { var, iter, body } if is_range_call(iter) => {
                    if !ctx.loop_vars.contains(var) {
                        ctx.loop_vars.push(var.clone());
                    }
                    Stmt::For {
                        var: var.clone(),
                        iter: iter.clone(),
                        body: self.block(ctx, body, depth + 1),
                    }
                }
                Stmt::For { var, iter, body } => {
                    let index = Self::index_name(depth);
                    if !ctx.loop_vars.contains(&index) {
                        ctx.loop_vars.push(index.clone());
                    }
                    let element = Expr::index(iter.clone(), Expr::name(&index));
                    let inner = substitute_block(body, var, &element);
                    let extent = Expr::call(
                        Expr::name("len"),
                        vec![Arg::positional(iter.clone())],
                    );
                    Stmt::For {
                        var: index,
                        iter: Expr::call(Expr::name("range"), vec![Arg::positional(extent)]),
                        body: self.block(ctx, &inner, depth + 1),
                    }
                }
                Stmt::If { branches, orelse } => Stmt::If {
                    branches: branches
                        .iter()
                        .map(|(cond, block)| (cond.clone(), self.block(ctx, block, depth)))
                        .collect(),
                    orelse: self.block(ctx, orelse, depth),
                },
                other => other.clone(),
            })
            .collect()
    }
}

impl Pass for LoopNormalization {
    fn name(&self) -> &'static str {
        "loop-normalization"
    }

    fn run(&self, ctx: &mut CompileContext<'_>, body: &[Stmt]) -> CompileResult<Vec<Stmt>> {
        Ok(self.block(ctx, body, 0))
    }
}

/// Pass 3
pub struct CallRestructuring;

impl CallRestructuring {
    fn block(&self, ctx: &mut CompileContext<'_>, body: &[Stmt]) -> CompileResult<Vec<Stmt>> {
        let mut out = Vec::with_capacity(body.len());
        for stmt in body {
            self.stmt(ctx, stmt, &mut out)?;
        }
        Ok(out)
    }

    fn stmt(&self, ctx: &mut CompileContext<'_>, stmt: &Stmt, out: &mut Vec<Stmt>) -> CompileResult<()> {
        match stmt {
            Stmt::Assign { targets, op, value } => {
                if let Some(binary) = op.binary() {
                    return Err(TranslationError::UnsupportedCompoundAssignment {
                        class: ctx.class().to_string(),
                        statement: stmt.to_string(),
                        operator: op.symbol().to_string(),
                        binary: binary.symbol().to_string(),
                    }
                    .into());
                }
                match value {
                    Expr::Call { func, args } if matches!(func.as_ref(), Expr::Attr(..)) => {
                        let args = self.hoist_args(ctx, args, out)?;
                        let (callee, mut args, returns) = self.dispatch(ctx, func, args)?;
                        if returns.len() != targets.len() {
                            return Err(TranslationError::MultipleAssignmentArityMismatch {
                                class: ctx.class().to_string(),
                                statement: stmt.to_string(),
                                targets: targets.len(),
                                returns: returns.len(),
                            }
                            .into());
                        }
                        for (i, target) in targets.iter().enumerate() {
                            args.push(Arg::named(format!("ret_{}", i), target.clone()));
                        }
                        out.push(Stmt::Expr(Expr::call(callee, args)));
                    }
                    Expr::Tuple(_) => {
                        return Err(ctx.unsupported(stmt, "only a call can produce several values"))
                    }
                    _ if targets.len() != 1 => {
                        return Err(TranslationError::MultipleAssignmentArityMismatch {
                            class: ctx.class().to_string(),
                            statement: stmt.to_string(),
                            targets: targets.len(),
                            returns: 1,
                        }
                        .into())
                    }
                    _ => {
                        let value = self.hoist(ctx, value.clone(), out)?;
                        out.push(Stmt::Assign {
                            targets: targets.clone(),
                            op: *op,
                            value,
                        });
                    }
                }
            }
            Stmt::Expr(Expr::Call { func, args }) if matches!(func.as_ref(), Expr::Attr(..)) => {
                let args = self.hoist_args(ctx, args, out)?;
                let (callee, mut args, returns) = self.dispatch(ctx, func, args)?;
                for (i, ty) in returns.into_iter().enumerate() {
                    let discard = ctx.fresh_call(ty);
                    args.push(Arg::named(format!("ret_{}", i), Expr::Name(discard)));
                }
                out.push(Stmt::Expr(Expr::call(callee, args)));
            }
            Stmt::Expr(expr) => {
                let expr = self.hoist(ctx, expr.clone(), out)?;
                out.push(Stmt::Expr(expr));
            }
            Stmt::If { branches, orelse } => {
                // elif conditions are evaluated up front with the first one
                let mut lowered = Vec::with_capacity(branches.len());
                for (cond, block) in branches {
                    let cond = self.hoist(ctx, cond.clone(), out)?;
                    lowered.push((cond, self.block(ctx, block)?));
                }
                out.push(Stmt::If {
                    branches: lowered,
                    orelse: self.block(ctx, orelse)?,
                });
            }
            Stmt::For { var, iter, body } => {
                let iter = self.hoist(ctx, iter.clone(), out)?;
                out.push(Stmt::For {
                    var: var.clone(),
                    iter,
                    body: self.block(ctx, body)?,
                });
            }
            Stmt::Return(values) => {
                let mut lowered = Vec::with_capacity(values.len());
                for value in values {
                    lowered.push(self.hoist(ctx, value.clone(), out)?);
                }
                out.push(Stmt::Return(lowered));
            }
            Stmt::Pass => out.push(Stmt::Pass),
        }
        Ok(())
    }

    fn hoist_args(&self, ctx: &mut CompileContext<'_>, args: &[Arg], out: &mut Vec<Stmt>) -> CompileResult<Vec<Arg>> {
        let mut lowered = Vec::with_capacity(args.len());
        for arg in args {
            if let Some(name) = &arg.name {
                return Err(ctx.unsupported(
                    format!("{}={}", name, arg.value),
                    "keyword arguments are only accepted by builtins",
                ));
            }
            lowered.push(Arg::positional(self.hoist(ctx, arg.value.clone(), out)?));
        }
        Ok(lowered)
    }

    /// Replace method calls nested in `expr` by variables holding their
    /// result; the calls themselves are appended to `out`.
    fn hoist(&self, ctx: &mut CompileContext<'_>, expr: Expr, out: &mut Vec<Stmt>) -> CompileResult<Expr> {
        expr.try_transform(&mut |node| {
            let (func, args) = match node {
                Expr::Call { func, args } => (func, args),
                other => return Ok(other),
            };
            if matches!(func.as_ref(), Expr::Name(n) if BUILTINS.contains(&n.as_str())) {
                return Ok(Expr::Call { func, args });
            }
            if !matches!(func.as_ref(), Expr::Attr(..)) {
                return Err(ctx.unsupported(
                    Expr::Call { func, args },
                    "only builtins and functions of self or its sub-modules can be called",
                ));
            }

            let display = Expr::Call {
                func: func.clone(),
                args: args.clone(),
            };
            let (callee, mut args, returns) = self.dispatch(ctx, &func, args)?;
            let ty = match returns.as_slice() {
                [ty] => ty.clone(),
                _ => {
                    return Err(ctx.unsupported(
                        display,
                        format!("a call inside an expression must return one value, not {}", returns.len()),
                    ))
                }
            };
            let holder = ctx.fresh_call(ty);
            args.push(Arg::named("ret_0", Expr::name(&holder)));
            out.push(Stmt::Expr(Expr::call(callee, args)));
            Ok(Expr::Name(holder))
        })
    }

    /// Explicit-receiver form of a method call plus the callee's return types
    fn dispatch(
        &self,
        ctx: &CompileContext<'_>,
        func: &Expr,
        args: Vec<Arg>,
    ) -> CompileResult<(Expr, Vec<Arg>, Vec<HwType>)> {
        let (receiver, method) = match func {
            Expr::Attr(receiver, method) => (receiver.as_ref(), method.as_str()),
            other => return Err(ctx.unsupported(other, "not a method call")),
        };

        let own = receiver.is_self_rooted() && receiver.self_attribute().is_none();
        let (callee, first, signature) = if own {
            (Expr::name(method), Expr::name("self"), ctx.signature)
        } else {
            match ctx.type_of(receiver) {
                Some(HwType::Module(package)) if receiver.is_self_rooted() => {
                    let signature = ctx.set.get(&package).ok_or_else(|| {
                        ctx.unsupported(receiver, format!("no signature for package {}", package))
                    })?;
                    (
                        Expr::attr(Expr::name(&package), method),
                        receiver.clone(),
                        signature.as_ref(),
                    )
                }
                _ => return Err(ctx.unsupported(receiver, "receiver is not self or one of its sub-modules")),
            }
        };

        let returns = signature.function(method)?.returns.clone();
        let mut lowered = Vec::with_capacity(args.len() + 1);
        lowered.push(Arg::positional(first));
        lowered.extend(args);
        Ok((callee, lowered, returns))
    }
}

impl Pass for CallRestructuring {
    fn name(&self) -> &'static str {
        "call-restructuring"
    }

    fn run(&self, ctx: &mut CompileContext<'_>, body: &[Stmt]) -> CompileResult<Vec<Stmt>> {
        self.block(ctx, body)
    }
}

/// Pass 4
pub struct PendingInsertion;

impl PendingInsertion {
    fn target(ctx: &CompileContext<'_>, target: &Expr) -> CompileResult<Expr> {
        if !target.is_self_rooted() {
            return Ok(target.clone());
        }
        let (root, mut chain) = target.chain();
        match chain.first() {
            Some(Access::Field("next")) => {
                chain.remove(0);
            }
            Some(Access::Field("current")) => {
                return Err(StateDisciplineError::AssignToCommittedState {
                    class: ctx.class().to_string(),
                    path: target.to_string(),
                }
                .into())
            }
            _ => {}
        }
        let last = chain
            .iter()
            .rposition(|a| matches!(a, Access::Field(_)))
            .ok_or_else(|| ctx.unsupported(target, "assignment target has no attribute"))?;
        chain.insert(last, Access::Field("next"));
        Ok(Expr::from_chain(root.clone(), &chain))
    }

    /// `self.current.x` reads the committed record, which is `self.x`
    fn committed(expr: Expr) -> CompileResult<Expr> {
        Ok(match expr {
            Expr::Attr(base, name) if name == "current" && base.is_self_rooted() => *base,
            other => other,
        })
    }
}

impl Pass for PendingInsertion {
    fn name(&self) -> &'static str {
        "pending-insertion"
    }

    fn run(&self, ctx: &mut CompileContext<'_>, body: &[Stmt]) -> CompileResult<Vec<Stmt>> {
        let ctx = &*ctx;
        let body = rewrite_block(body, &mut |stmt| match stmt {
            Stmt::Assign { targets, op, value } => Ok(Stmt::Assign {
                targets: targets
                    .iter()
                    .map(|t| Self::target(ctx, t))
                    .collect::<CompileResult<_>>()?,
                op,
                value,
            }),
            Stmt::Expr(Expr::Call { func, args }) => {
                let args = args
                    .into_iter()
                    .map(|arg| match &arg.name {
                        Some(name) if name.starts_with("ret_") => {
                            Ok(Arg::named(name.clone(), Self::target(ctx, &arg.value)?))
                        }
                        _ => Ok(arg),
                    })
                    .collect::<CompileResult<_>>()?;
                Ok(Stmt::Expr(Expr::Call { func, args }))
            }
            other => Ok(other),
        })?;
        rewrite_exprs(&body, &mut Self::committed)
    }
}

/// Pass 5
pub struct AutoResize;

impl AutoResize {
    fn is_literal_at(value: &Expr, format: &FixedFormat) -> bool {
        match value {
            Expr::Call { func, args } if matches!(func.as_ref(), Expr::Name(n) if n == "sfix") => {
                args.len() >= 3
                    && args[0].value.is_numeric_literal()
                    && args[1].value == Expr::Int(format.left as i64)
                    && args[2].value == Expr::Int(format.right as i64)
            }
            _ => false,
        }
    }

    fn resized(value: Expr, format: &FixedFormat) -> Expr {
        let left = Arg::positional(Expr::Int(format.left as i64));
        let right = Arg::positional(Expr::Int(format.right as i64));
        if value.is_numeric_literal() {
            return Expr::call(Expr::name("sfix"), vec![Arg::positional(value), left, right]);
        }
        if Self::is_literal_at(&value, format) {
            return value;
        }
        Expr::call(
            Expr::name("resize"),
            vec![
                Arg::positional(value),
                left,
                right,
                Arg::positional(Expr::name(format.overflow.keyword())),
                Arg::positional(Expr::name(format.round.keyword())),
            ],
        )
    }

    /// Items of list literals inside a concatenation
    fn resized_items(value: Expr, format: &FixedFormat) -> Expr {
        match value {
            Expr::List(items) => Expr::List(items.into_iter().map(|i| Self::resized(i, format)).collect()),
            Expr::Binary {
                op: op @ (BinOp::Add | BinOp::Concat),
                lhs,
                rhs,
            } => Expr::Binary {
                op,
                lhs: Box::new(Self::resized_items(*lhs, format)),
                rhs: Box::new(Self::resized_items(*rhs, format)),
            },
            other => other,
        }
    }

    /// Complex writes become a pair of part-wise resizes
    fn resized_complex(ctx: &CompileContext<'_>, value: Expr, format: &FixedFormat) -> CompileResult<Expr> {
        let pair = |re: Expr, im: Expr| {
            Expr::call(
                Expr::name("complex"),
                vec![
                    Arg::positional(Self::resized(re, format)),
                    Arg::positional(Self::resized(im, format)),
                ],
            )
        };
        match value {
            Expr::Call { ref func, ref args } if matches!(func.as_ref(), Expr::Name(n) if n == "complex") => {
                let (parts, policies): (Vec<&Arg>, Vec<&Arg>) = args
                    .iter()
                    .partition(|a| !matches!(&a.value, Expr::Name(p) if POLICIES.contains(&p.as_str())));
                match parts.as_slice() {
                    [re, im] => Ok(pair(re.value.clone(), im.value.clone())),
                    [_, _, left, right]
                        if left.value == Expr::Int(format.left as i64)
                            && right.value == Expr::Int(format.right as i64) =>
                    {
                        Ok(value.clone())
                    }
                    [re, im, left, right] => {
                        let part = |v: &Expr| {
                            let builtin = if v.is_numeric_literal() { "sfix" } else { "resize" };
                            let mut args = vec![
                                Arg::positional(v.clone()),
                                (*left).clone(),
                                (*right).clone(),
                            ];
                            args.extend(policies.iter().map(|a| (*a).clone()));
                            Expr::call(Expr::name(builtin), args)
                        };
                        Ok(pair(part(&re.value), part(&im.value)))
                    }
                    _ => Err(ctx.unsupported(&value, "complex takes two parts and optional bounds")),
                }
            }
            Expr::Name(_) | Expr::Attr(..) | Expr::Index(..) => {
                Ok(pair(Expr::attr(value.clone(), "real"), Expr::attr(value, "imag")))
            }
            other => Err(ctx.unsupported(&other, "complex arithmetic has no VHDL form")),
        }
    }

    fn is_list(ctx: &CompileContext<'_>, expr: &Expr) -> bool {
        match expr {
            Expr::List(_) | Expr::Repeat(..) | Expr::Slice { .. } => true,
            Expr::Binary { op: BinOp::Concat, .. } => true,
            other => matches!(ctx.type_of(other), Some(HwType::List(..))),
        }
    }

    fn is_complex(ctx: &CompileContext<'_>, expr: &Expr) -> bool {
        matches!(ctx.type_of(expr), Some(HwType::Complex(_)))
    }

    /// Operators whose meaning depends on operand types
    fn typed_operators(ctx: &CompileContext<'_>, expr: Expr) -> CompileResult<Expr> {
        let complex_math = match &expr {
            Expr::Binary { op, lhs, rhs } => {
                !matches!(op, BinOp::Eq | BinOp::Ne) && (Self::is_complex(ctx, lhs) || Self::is_complex(ctx, rhs))
            }
            Expr::Unary { op: UnaryOp::Neg, operand } => Self::is_complex(ctx, operand),
            Expr::Call { func, args } => {
                matches!(func.as_ref(), Expr::Name(n) if n == "resize" || n == "scalb")
                    && args.first().is_some_and(|a| Self::is_complex(ctx, &a.value))
            }
            _ => false,
        };
        if complex_math {
            return Err(ctx.unsupported(&expr, "complex arithmetic has no VHDL form"));
        }
        Ok(match expr {
            Expr::Binary { op: BinOp::Add, lhs, rhs } if Self::is_list(ctx, &lhs) || Self::is_list(ctx, &rhs) => {
                Expr::Binary {
                    op: BinOp::Concat,
                    lhs,
                    rhs,
                }
            }
            other => other,
        })
    }
}

impl Pass for AutoResize {
    fn name(&self) -> &'static str {
        "auto-resize"
    }

    fn run(&self, ctx: &mut CompileContext<'_>, body: &[Stmt]) -> CompileResult<Vec<Stmt>> {
        let ctx = &*ctx;
        let body = rewrite_block(body, &mut |stmt| match stmt {
            Stmt::Assign { targets, op, value } if targets.len() == 1 && targets[0].is_self_rooted() => {
                let value = match ctx.type_of(&targets[0]) {
                    Some(HwType::Fixed(format)) => Self::resized(value, &format),
                    Some(HwType::Complex(format)) => Self::resized_complex(ctx, value, &format)?,
                    Some(HwType::List(element, _)) => match *element {
                        HwType::Fixed(format) => Self::resized_items(value, &format),
                        _ => value,
                    },
                    _ => value,
                };
                Ok(Stmt::Assign { targets, op, value })
            }
            other => Ok(other),
        })?;
        rewrite_exprs(&body, &mut |expr| Self::typed_operators(ctx, expr))
    }
}

/// Pass 6
pub struct SubmoduleAssignment;

impl SubmoduleAssignment {
    fn strip_next(target: &Expr) -> Expr {
        let (root, chain) = target.chain();
        let kept: Vec<Access<'_>> = chain
            .into_iter()
            .filter(|a| !matches!(a, Access::Field("next")))
            .collect();
        Expr::from_chain(root.clone(), &kept)
    }
}

impl Pass for SubmoduleAssignment {
    fn name(&self) -> &'static str {
        "submodule-assignment"
    }

    fn run(&self, ctx: &mut CompileContext<'_>, body: &[Stmt]) -> CompileResult<Vec<Stmt>> {
        let ctx = &*ctx;
        rewrite_block(body, &mut |stmt| match stmt {
            Stmt::Assign { targets, op, value } if targets.len() == 1 => {
                let procedure = match ctx.type_of(&targets[0]) {
                    Some(HwType::Module(package)) => Some((package, "rtl_deepcopy")),
                    Some(HwType::List(element, _)) => match *element {
                        HwType::Module(package) => Some((package, "rtl_list_deepcopy")),
                        _ => None,
                    },
                    _ => None,
                };
                Ok(match procedure {
                    Some((package, procedure)) => Stmt::Expr(Expr::call(
                        Expr::attr(Expr::name(package), procedure),
                        vec![
                            Arg::positional(Self::strip_next(&targets[0])),
                            Arg::positional(value),
                        ],
                    )),
                    None => Stmt::Assign { targets, op, value },
                })
            }
            other => Ok(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::complex::ComplexSfix;
    use crate::config::ConversionConfig;
    use crate::extract::extract;
    use crate::fixed::{Overflow, Round, Sfix};
    use crate::parser::{parse_design, Parser};
    use crate::sim::Simulator;
    use crate::value::Value;
    use pretty_assertions::assert_eq;

    const DESIGN: &str = "
        enum Mode { Idle, Run }
        module Stage {
            fn init() { self.out = sfix(0.0, 1, -8); }
            fn main(x) { self.out = x; return self.out; }
        }
        module Top {
            fn init() {
                self.mode = Mode.Idle;
                self.acc = sfix(0.0, 2, -10, saturate, round);
                self.taps = [sfix(0.0, 0, -8); 2];
                self.stages = [Stage(), Stage()];
                self.last = Stage();
                self.count = 0;
            }
            fn pair(x) { return x, self.count; }
            fn main(x) {
                self.mode = Mode.Run;
                for t in self.taps { self.acc = self.acc + t; }
                a, b = self.pair(x);
                y = self.last.main(self.stages[0].main(x));
                self.count = self.count + 1;
                self.acc = 0.5;
                self.last = self.stages[1];
                return y;
            }
        }
    ";

    fn converted() -> (Design, SignatureSet) {
        let design = Arc::new(parse_design(DESIGN).unwrap());
        let sim = Simulator::new(design.clone());
        let mut top = sim.instantiate("Top", vec![]).unwrap();
        let x = || vec![Value::Fixed(Sfix::new(0.25, 0, -8))];
        top.simulate(vec![x(), x()]).unwrap();
        let set = extract(&design, &top, &ConversionConfig::default()).unwrap();
        ((*design).clone(), set)
    }

    fn lines(body: &[Stmt]) -> Vec<String> {
        body.iter().map(|s| s.to_string()).collect()
    }

    fn function_body(source: &str) -> Vec<Stmt> {
        let design = parse_design(&format!("module T {{ fn f(x) {{ {} }} }}", source)).unwrap();
        design.modules[0].functions[0].body.clone()
    }

    #[test]
    fn test_full_pipeline() {
        let (design, set) = converted();
        let lowered = lower_module(&design, &set, set.top().unwrap()).unwrap();
        let main = lowered
            .functions
            .iter()
            .find(|f| f.signature.name == "main")
            .unwrap();

        assert_eq!(
            lines(&main.body),
            vec![
                "self.next.mode = 1;",
                "for _i_ in range(len(self.taps)) { ... }",
                "pair(self, x, ret_0=a, ret_1=b);",
                "Stage_0.main(self.stages[0], x, ret_0=_call0_);",
                "Stage_0.main(self.last, _call0_, ret_0=y);",
                "self.next.count = (self.count + 1);",
                "self.next.acc = sfix(0.5, 2, -10);",
                "Stage_0.rtl_deepcopy(self.last, self.stages[1]);",
                "return y;",
            ]
        );

        match &main.body[1] {
            Stmt::For { body, .. } => assert_eq!(
                lines(body),
                vec!["self.next.acc = resize((self.acc + self.taps[_i_]), 2, -10, saturate, round);"]
            ),
            other => panic!("Expected loop, got {}", other),
        }
        assert_eq!(
            main.synthesized.get("_call0_"),
            Some(&HwType::Fixed(FixedFormat::with_policy(1, -8, Overflow::Saturate, Round::Round)))
        );
    }

    #[test]
    fn test_type_of_paths() {
        let (design, set) = converted();
        let top = set.top().unwrap();
        let main = top.function("main").unwrap();
        let ctx = CompileContext::new(&design, &set, top, main);

        let parse = |s: &str| Parser::new(s).parse_expr().unwrap();
        assert_eq!(ctx.type_of(&parse("self.count")), Some(HwType::Integer));
        assert_eq!(ctx.type_of(&parse("self.next.count")), Some(HwType::Integer));
        assert_eq!(
            ctx.type_of(&parse("self.stages[1].out")),
            Some(HwType::Fixed(FixedFormat::with_policy(1, -8, Overflow::Saturate, Round::Round)))
        );
        assert_eq!(ctx.type_of(&parse("self.last")), Some(HwType::Module("Stage_0".to_string())));
        assert_eq!(ctx.type_of(&parse("self.missing")), None);
    }

    fn synthetic() -> (Design, SignatureSet) {
        let design = parse_design("module T { fn f(x) { pass; } fn pair() { return 1, 2; } }").unwrap();
        let mut sig = ModuleTypeSignature::new("T", "T_0");
        sig.attributes.insert(
            "a".to_string(),
            crate::types::AttributeSignature {
                ty: HwType::Integer,
                initial: Some(Value::Int(0)),
                constant: false,
            },
        );
        let mut f = FunctionSignature::new("f");
        f.args.push(("x".to_string(), HwType::Integer));
        sig.functions.insert("f".to_string(), f);
        let mut pair = FunctionSignature::new("pair");
        pair.returns = vec![HwType::Integer, HwType::Integer];
        sig.functions.insert("pair".to_string(), pair);
        let set = SignatureSet {
            top: "T_0".to_string(),
            modules: [("T_0".to_string(), Arc::new(sig))].into_iter().collect(),
        };
        (design, set)
    }

    fn lower_source(source: &str) -> CompileResult<Vec<Stmt>> {
        let (design, set) = synthetic();
        let sig = set.top().unwrap();
        let function = sig.function("f").unwrap();
        let mut ctx = CompileContext::new(&design, &set, sig, function);
        lower_body(&mut ctx, &function_body(source))
    }

    #[test]
    fn test_compound_assignment_rejected() {
        let err = lower_source("self.a += 1;").unwrap_err();
        assert!(matches!(
            err,
            CompileError::Translation(TranslationError::UnsupportedCompoundAssignment { ref operator, ref binary, .. })
                if operator == "+=" && binary == "+"
        ));
    }

    #[test]
    fn test_arity_mismatch() {
        let err = lower_source("q = self.pair();").unwrap_err();
        assert!(matches!(
            err,
            CompileError::Translation(TranslationError::MultipleAssignmentArityMismatch { targets: 1, returns: 2, .. })
        ));
        assert!(lower_source("p, q = self.pair();").is_ok());
    }

    #[test]
    fn test_assign_to_committed_state() {
        let err = lower_source("self.current.a = 1;").unwrap_err();
        assert!(matches!(
            err,
            CompileError::StateDiscipline(StateDisciplineError::AssignToCommittedState { ref path, .. })
                if path == "self.current.a"
        ));
        assert_eq!(lines(&lower_source("self.next.a = 1;").unwrap()), vec!["self.next.a = 1;"]);
    }

    #[test]
    fn test_committed_reads_use_the_plain_record() {
        assert_eq!(
            lines(&lower_source("y = self.current.a + 1; return self.current.a;").unwrap()),
            vec!["y = (self.a + 1);", "return self.a;"]
        );

        let (design, set) = converted();
        let top = set.top().unwrap();
        let main = top.function("main").unwrap();
        let mut ctx = CompileContext::new(&design, &set, top, main);
        let body = lower_body(&mut ctx, &function_body("self.count = self.current.last.out;")).unwrap();
        assert_eq!(lines(&body), vec!["self.next.count = self.last.out;"]);
    }

    #[test]
    fn test_explicit_pending_write_into_submodule() {
        let (design, set) = converted();
        let top = set.top().unwrap();
        let main = top.function("main").unwrap();
        let mut ctx = CompileContext::new(&design, &set, top, main);
        let body = lower_body(
            &mut ctx,
            &function_body("self.next.last.out = x; self.next.stages[1].out = x;"),
        )
        .unwrap();
        assert_eq!(
            lines(&body),
            vec![
                "self.last.next.out = resize(x, 1, -8, saturate, round);",
                "self.stages[1].next.out = resize(x, 1, -8, saturate, round);",
            ]
        );
    }

    const SIGNALS: &str = "
        module Sig {
            fn init() {
                self.reg = complex(0.5, 1.2, 1, -12);
                self.shr = [sfix(0.0, 0, -8); 3];
            }
            fn main(x, c) {
                self.next.reg = c;
                self.shr = [x] + self.shr[:-1];
                return self.reg.real;
            }
        }
    ";

    fn signals() -> (Design, SignatureSet) {
        let design = Arc::new(parse_design(SIGNALS).unwrap());
        let mut top = Simulator::new(design.clone()).instantiate("Sig", vec![]).unwrap();
        let c = ComplexSfix::with_policy(0.25, -0.5, 0, -4, Overflow::Wrap, Round::Truncate);
        let input = || vec![Value::Fixed(Sfix::new(0.25, 0, -8)), Value::Complex(c)];
        top.simulate(vec![input(), input()]).unwrap();
        let set = extract(&design, &top, &ConversionConfig::default()).unwrap();
        ((*design).clone(), set)
    }

    fn lower_signals(source: &str) -> CompileResult<Vec<Stmt>> {
        let (design, set) = signals();
        let top = set.top().unwrap();
        let main = top.function("main").unwrap();
        let mut ctx = CompileContext::new(&design, &set, top, main);
        lower_body(&mut ctx, &function_body(source))
    }

    #[test]
    fn test_complex_and_list_writes() {
        let (design, set) = signals();
        let lowered = lower_module(&design, &set, set.top().unwrap()).unwrap();
        let main = lowered
            .functions
            .iter()
            .find(|f| f.signature.name == "main")
            .unwrap();
        assert_eq!(
            lines(&main.body),
            vec![
                "self.next.reg = complex(resize(c.real, 1, -12, saturate, round), resize(c.imag, 1, -12, saturate, round));",
                "self.next.shr = ([resize(x, 0, -8, saturate, round)] ++ self.shr[:-1]);",
                "return self.reg.real;",
            ]
        );

        let top = set.top().unwrap();
        let ctx = CompileContext::new(&design, &set, top, top.function("main").unwrap());
        let parse = |s: &str| Parser::new(s).parse_expr().unwrap();
        assert_eq!(
            ctx.type_of(&parse("c.imag")).and_then(|t| t.fixed_format().map(|f| (f.left, f.right))),
            Some((0, -4))
        );
        assert!(matches!(ctx.type_of(&parse("self.shr[1:]")), Some(HwType::List(..))));
    }

    #[test]
    fn test_complex_constructor_writes() {
        assert_eq!(
            lines(&lower_signals("self.reg = complex(x, 0.25); self.next.reg = complex(0.0, 0.0, 1, -12);").unwrap()),
            vec![
                "self.next.reg = complex(resize(x, 1, -12, saturate, round), sfix(0.25, 1, -12));",
                "self.next.reg = complex(0.0, 0.0, 1, -12);",
            ]
        );
        assert_eq!(
            lines(&lower_signals("self.reg = complex(x, 0.5, 2, -4, wrap);").unwrap()),
            vec!["self.next.reg = complex(resize(resize(x, 2, -4, wrap), 1, -12, saturate, round), resize(sfix(0.5, 2, -4, wrap), 1, -12, saturate, round));"]
        );
    }

    #[test]
    fn test_complex_arithmetic_rejected() {
        for source in ["self.reg = c * c;", "y = c + c;", "return -c;", "y = resize(c, 1, -4);"] {
            assert!(
                matches!(
                    lower_signals(source),
                    Err(CompileError::Translation(TranslationError::UnsupportedConstruct { ref reason, .. }))
                        if reason.contains("complex arithmetic")
                ),
                "{}",
                source
            );
        }
        assert!(lower_signals("y = c == c;").is_ok());
    }

    #[test]
    fn test_unsupported_calls() {
        assert!(matches!(
            lower_source("q = foo(x);"),
            Err(CompileError::Translation(TranslationError::UnsupportedConstruct { .. }))
        ));
        assert!(matches!(
            lower_source("q = self.pair() + 1;"),
            Err(CompileError::Translation(TranslationError::UnsupportedConstruct { .. }))
        ));
        assert!(matches!(
            lower_source("p, q = 1, 2;"),
            Err(CompileError::Translation(TranslationError::UnsupportedConstruct { .. }))
        ));
    }

    #[test]
    fn test_discarded_returns_and_nested_loops() {
        let (design, set) = synthetic();
        let sig = set.top().unwrap();
        let function = sig.function("f").unwrap();
        let mut ctx = CompileContext::new(&design, &set, sig, function);
        let body = lower_body(
            &mut ctx,
            &function_body("self.pair(); for r in rows { for c in r { self.a = c; } }"),
        )
        .unwrap();

        assert_eq!(lines(&body)[0], "pair(self, ret_0=_call0_, ret_1=_call1_);");
        assert_eq!(ctx.synthesized.len(), 2);
        match &body[1] {
            Stmt::For { var, iter, body } => {
                assert_eq!(var, "_i_");
                assert_eq!(iter.to_string(), "range(len(rows))");
                match &body[0] {
                    Stmt::For { var, iter, body } => {
                        assert_eq!(var, "_i1_");
                        assert_eq!(iter.to_string(), "range(len(rows[_i_]))");
                        assert_eq!(lines(body), vec!["self.next.a = rows[_i_][_i1_];"]);
                    }
                    other => panic!("Expected inner loop, got {}", other),
                }
            }
            other => panic!("Expected loop, got {}", other),
        }
        assert_eq!(ctx.loop_vars, vec!["_i_", "_i1_"]);
    }

    #[test]
    fn test_unknown_enum_variant() {
        let design = parse_design("enum Mode { Idle } module T { fn f(x) { self.a = Mode.Run; } }").unwrap();
        let (_, set) = synthetic();
        let sig = set.top().unwrap();
        let function = sig.function("f").unwrap();
        let mut ctx = CompileContext::new(&design, &set, sig, function);
        let body = design.modules[0].functions[0].body.clone();
        assert!(matches!(
            EnumFolding.run(&mut ctx, &body),
            Err(CompileError::Translation(TranslationError::UnsupportedConstruct { .. }))
        ));
    }
}
