//! VHDL emitter
//!
//! Renders a lowered module as one VHDL package: the `next_t`/`self_t`
//! record pair, an array-of-self type, the state-management procedures and
//! one procedure per converted function. List types and complex records
//! shared between packages go into a separate `Typedefs` package.

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;

use crate::ast::{Arg, BinOp, Design, Expr, Stmt, UnaryOp};
use crate::error::{CompileResult, TranslationError};
use crate::lower::{is_range_call, LoweredFunction, LoweredModule};
use crate::fixed::FixedFormat;
use crate::types::{HwType, ModuleTypeSignature};
use crate::value::Value;

/// Package holding the shared list and record types
pub const TYPEDEFS_PACKAGE: &str = "Typedefs";

const RESERVED: &[&str] = &[
    "abs", "access", "after", "alias", "all", "and", "architecture", "array", "assert", "assume",
    "attribute", "begin", "block", "body", "buffer", "bus", "case", "component", "configuration",
    "constant", "context", "cover", "default", "disconnect", "downto", "else", "elsif", "end",
    "entity", "exit", "fairness", "file", "for", "force", "function", "generate", "generic",
    "group", "guarded", "if", "impure", "in", "inertial", "inout", "is", "label", "library",
    "linkage", "literal", "loop", "map", "mod", "nand", "new", "next", "nor", "not", "null", "of",
    "on", "open", "or", "others", "out", "package", "parameter", "port", "postponed", "procedure",
    "process", "property", "protected", "pure", "range", "record", "register", "reject", "release",
    "rem", "report", "restrict", "return", "rol", "ror", "select", "sequence", "severity",
    "shared", "signal", "sla", "sll", "sra", "srl", "strong", "subtype", "then", "to",
    "transport", "type", "unaffected", "units", "until", "use", "variable", "vmode", "vprop",
    "vunit", "wait", "when", "while", "with", "xnor", "xor",
];

fn is_basic_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.contains("__")
        && !name.ends_with('_')
}

/// Name as a legal VHDL identifier; reserved or malformed names become
/// extended identifiers (`\next\`, `\_i_\`).
pub fn escape(name: &str) -> String {
    if is_basic_identifier(name) && !RESERVED.contains(&name.to_ascii_lowercase().as_str()) {
        name.to_string()
    } else {
        format!("\\{}\\", name)
    }
}

fn bound(b: i32) -> String {
    if b < 0 {
        format!("m{}", -b)
    } else {
        b.to_string()
    }
}

/// Record type with `real` and `imag` fields of `format`
pub fn complex_type_name(format: &FixedFormat) -> String {
    format!("complex_sfix{}_{}", bound(format.left), bound(format.right))
}

/// Name of the unconstrained array type for lists of `element`
pub fn list_type_name(element: &HwType) -> Option<String> {
    match element {
        HwType::Integer | HwType::Enum(_) => Some("integer_list_t".to_string()),
        HwType::Boolean => Some("boolean_list_t".to_string()),
        HwType::Fixed(format) => Some(format!(
            "sfixed_{}_{}_list_t",
            bound(format.left),
            bound(format.right)
        )),
        HwType::Complex(format) => Some(format!("{}_list_t", complex_type_name(format))),
        HwType::Module(package) => Some(format!("{}.self_t_list", package)),
        HwType::List(..) => None,
    }
}

/// VHDL subtype indication of a hardware type
pub fn vhdl_type(ty: &HwType) -> CompileResult<String> {
    Ok(match ty {
        HwType::Integer | HwType::Enum(_) => "integer".to_string(),
        HwType::Boolean => "boolean".to_string(),
        HwType::Fixed(format) => format!("sfixed({} downto {})", format.left, format.right),
        HwType::Complex(format) => complex_type_name(format),
        HwType::Module(package) => format!("{}.self_t", package),
        HwType::List(element, len) => {
            let name = list_type_name(element).ok_or_else(|| {
                TranslationError::unsupported("", ty.to_string(), "lists of lists have no VHDL type")
            })?;
            format!("{}(0 to {})", name, len.saturating_sub(1))
        }
    })
}

fn real(value: f64) -> String {
    let text = value.to_string();
    if text.contains('.') {
        text
    } else {
        format!("{}.0", text)
    }
}

/// VHDL literal for a constructor-time value
pub fn literal(value: &Value) -> Option<String> {
    match value {
        Value::Int(n) => Some(n.to_string()),
        Value::Bool(b) => Some((if *b { "True" } else { "False" }).to_string()),
        Value::Enum { ordinal, .. } => Some(ordinal.to_string()),
        Value::Fixed(fix) => {
            let format = fix.format()?;
            Some(format!("to_sfixed({}, {}, {})", real(fix.value()), format.left, format.right))
        }
        Value::Complex(c) => {
            let format = c.format()?;
            Some(format!(
                "(real=>to_sfixed({}, {2}, {3}), imag=>to_sfixed({}, {2}, {3}))",
                real(c.real().value()),
                real(c.imag().value()),
                format.left,
                format.right
            ))
        }
        Value::List(items) => {
            let items = items.iter().map(literal).collect::<Option<Vec<_>>>()?;
            match items.as_slice() {
                [one] => Some(format!("(0 => {})", one)),
                _ => Some(format!("({})", items.join(", "))),
            }
        }
        Value::Float(_) | Value::Module(_) | Value::Tuple(_) => None,
    }
}

fn policy(name: &str) -> Option<&'static str> {
    match name {
        "wrap" => Some("fixed_wrap"),
        "saturate" => Some("fixed_saturate"),
        "truncate" => Some("fixed_truncate"),
        "round" => Some("fixed_round"),
        _ => None,
    }
}

fn binary_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Mod => "mod",
        BinOp::Shl => "sla",
        BinOp::Shr => "sra",
        BinOp::BitAnd | BinOp::And => "and",
        BinOp::BitOr | BinOp::Or => "or",
        BinOp::BitXor => "xor",
        BinOp::Eq => "=",
        BinOp::Ne => "/=",
        BinOp::Lt => "<",
        BinOp::Gt => ">",
        BinOp::Le => "<=",
        BinOp::Ge => ">=",
        BinOp::Concat => "&",
    }
}

/// Package names already written, shared by parallel emitters
#[derive(Debug, Default)]
pub struct EmittedRegistry {
    names: Mutex<IndexSet<String>>,
}

impl EmittedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `package`; false when it was emitted before
    pub fn claim(&self, package: &str) -> bool {
        self.names.lock().insert(package.to_string())
    }

    pub fn contains(&self, package: &str) -> bool {
        self.names.lock().contains(package)
    }

    pub fn names(&self) -> Vec<String> {
        self.names.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.lock().is_empty()
    }
}

/// Indented line buffer
struct Writer {
    out: String,
    depth: usize,
}

impl Writer {
    fn new() -> Self {
        Self {
            out: String::new(),
            depth: 0,
        }
    }

    fn line(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        if text.is_empty() {
            self.out.push('\n');
            return;
        }
        for _ in 0..self.depth {
            self.out.push_str("    ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn blank(&mut self) {
        self.out.push('\n');
    }

    fn indent(&mut self) {
        self.depth += 1;
    }

    fn dedent(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn comment(&mut self, doc: &str) {
        for line in doc.lines().map(str::trim).filter(|l| !l.is_empty()) {
            self.line(format!("-- {}", line));
        }
    }

    fn finish(self) -> String {
        self.out
    }
}

fn file_header(w: &mut Writer) {
    w.line(format!("-- generated by fixrtl {}", env!("CARGO_PKG_VERSION")));
    w.line("library ieee;");
    w.indent();
    w.line("use ieee.std_logic_1164.all;");
    w.line("use ieee.numeric_std.all;");
    w.line("use ieee.fixed_float_types.all;");
    w.line("use ieee.fixed_pkg.all;");
    w.line("use ieee.math_real.all;");
    w.dedent();
    w.blank();
}

/// Renders lowered modules as VHDL packages
pub struct VhdlEmitter<'a> {
    design: &'a Design,
    registry: &'a EmittedRegistry,
}

impl<'a> VhdlEmitter<'a> {
    pub fn new(design: &'a Design, registry: &'a EmittedRegistry) -> Self {
        Self { design, registry }
    }

    /// Package source for `module`, or `None` when that package was already
    /// emitted through the same registry.
    pub fn emit(&self, module: &LoweredModule) -> CompileResult<Option<String>> {
        let package = &module.signature.package;
        if self.registry.contains(package) {
            tracing::debug!(package = %package, "already emitted");
            return Ok(None);
        }
        let text = self.package(module)?;
        if !self.registry.claim(package) {
            return Ok(None);
        }
        tracing::debug!(package = %package, bytes = text.len(), "emitted package");
        Ok(Some(text))
    }

    fn package(&self, module: &LoweredModule) -> CompileResult<String> {
        let sig = module.signature.as_ref();
        let source = self.design.module(&sig.class);
        let mut w = Writer::new();

        file_header(&mut w);
        w.line("library work;");
        w.indent();
        w.line(format!("use work.{}.all;", TYPEDEFS_PACKAGE));
        w.line("use work.all;");
        w.dedent();
        w.blank();

        if let Some(doc) = source.and_then(|m| m.doc.as_deref()) {
            w.comment(doc);
        }
        w.line(format!("package {} is", sig.package));
        w.indent();
        self.records(&mut w, sig)?;
        w.blank();
        w.line("type self_t_list is array (natural range <>) of self_t;");
        w.blank();
        for prototype in Self::state_prototypes() {
            w.line(format!("{};", prototype));
        }
        for function in &module.functions {
            w.line(format!("{};", self.prototype(function)?));
        }
        w.dedent();
        w.line("end package;");
        w.blank();

        w.line(format!("package body {} is", sig.package));
        w.indent();
        self.state_procedures(&mut w, sig)?;
        for function in &module.functions {
            w.blank();
            let doc = source
                .and_then(|m| m.function(&function.signature.name))
                .and_then(|f| f.doc.as_deref());
            self.procedure(&mut w, sig, function, doc)?;
        }
        w.dedent();
        w.line("end package body;");
        Ok(w.finish())
    }

    fn records(&self, w: &mut Writer, sig: &ModuleTypeSignature) -> CompileResult<()> {
        w.line("type next_t is record");
        w.indent();
        let mut registers = 0;
        for (name, attr) in sig.registers() {
            w.line(format!("{}: {};", escape(name), vhdl_type(&attr.ty)?));
            registers += 1;
        }
        if registers == 0 {
            w.line("unused: boolean;");
        }
        w.dedent();
        w.line("end record;");
        w.blank();

        w.line("type self_t is record");
        w.indent();
        for (name, attr) in &sig.attributes {
            w.line(format!("{}: {};", escape(name), vhdl_type(&attr.ty)?));
        }
        w.line("\\next\\: next_t;");
        w.dedent();
        w.line("end record;");
        Ok(())
    }

    fn state_prototypes() -> [&'static str; 6] {
        [
            "procedure rtl_init(self: inout self_t)",
            "procedure rtl_constants(self: inout self_t)",
            "procedure rtl_reset(self: inout self_t)",
            "procedure rtl_deepcopy(self: inout self_t; other: in self_t)",
            "procedure rtl_list_deepcopy(self: inout self_t_list; other: in self_t_list)",
            "procedure rtl_commit(self: inout self_t)",
        ]
    }

    /// `Pkg.procedure(self.sub)` for every sub-module, looping over lists
    fn each_submodule(w: &mut Writer, sig: &ModuleTypeSignature, procedure: &str) {
        for (name, attr) in sig.submodules() {
            let field = escape(name);
            match &attr.ty {
                HwType::Module(package) => {
                    w.line(format!("{}.{}(self.{});", package, procedure, field));
                }
                HwType::List(element, _) => {
                    if let HwType::Module(package) = element.as_ref() {
                        w.line(format!("for i in self.{}'range loop", field));
                        w.indent();
                        w.line(format!("{}.{}(self.{}(i));", package, procedure, field));
                        w.dedent();
                        w.line("end loop;");
                    }
                }
                _ => {}
            }
        }
    }

    fn state_procedures(&self, w: &mut Writer, sig: &ModuleTypeSignature) -> CompileResult<()> {
        let [init, constants, reset, deepcopy, list_deepcopy, commit] = Self::state_prototypes();

        // pending starts from committed so unassigned registers hold
        w.line(format!("{} is", init));
        w.line("begin");
        w.indent();
        for (name, _) in sig.registers() {
            let field = escape(name);
            w.line(format!("self.\\next\\.{} := self.{};", field, field));
        }
        Self::each_submodule(w, sig, "rtl_init");
        w.dedent();
        w.line("end procedure;");
        w.blank();

        w.line(format!("{} is", constants));
        w.line("begin");
        w.indent();
        for (name, attr) in sig.attributes.iter().filter(|(_, a)| a.constant && !a.ty.is_module()) {
            if let Some(value) = attr.initial.as_ref().and_then(literal) {
                w.line(format!("self.{} := {};", escape(name), value));
            }
        }
        Self::each_submodule(w, sig, "rtl_constants");
        w.dedent();
        w.line("end procedure;");
        w.blank();

        w.line(format!("{} is", reset));
        w.line("begin");
        w.indent();
        for (name, attr) in sig.registers() {
            if let Some(value) = attr.initial.as_ref().and_then(literal) {
                w.line(format!("self.\\next\\.{} := {};", escape(name), value));
            }
        }
        Self::each_submodule(w, sig, "rtl_reset");
        w.line("rtl_commit(self);");
        w.dedent();
        w.line("end procedure;");
        w.blank();

        w.line(format!("{} is", deepcopy));
        w.line("begin");
        w.indent();
        for (name, _) in sig.registers() {
            let field = escape(name);
            w.line(format!("self.\\next\\.{} := other.{};", field, field));
        }
        for (name, attr) in sig.submodules() {
            let field = escape(name);
            match &attr.ty {
                HwType::Module(package) => {
                    w.line(format!("{}.rtl_deepcopy(self.{}, other.{});", package, field, field))
                }
                HwType::List(element, _) => {
                    if let HwType::Module(package) = element.as_ref() {
                        w.line(format!("{}.rtl_list_deepcopy(self.{}, other.{});", package, field, field))
                    }
                }
                _ => {}
            }
        }
        w.dedent();
        w.line("end procedure;");
        w.blank();

        w.line(format!("{} is", list_deepcopy));
        w.line("begin");
        w.indent();
        w.line("for i in self'range loop");
        w.indent();
        w.line("rtl_deepcopy(self(i), other(i));");
        w.dedent();
        w.line("end loop;");
        w.dedent();
        w.line("end procedure;");
        w.blank();

        w.line(format!("{} is", commit));
        w.line("begin");
        w.indent();
        for (name, _) in sig.registers() {
            let field = escape(name);
            w.line(format!("self.{} := self.\\next\\.{};", field, field));
        }
        Self::each_submodule(w, sig, "rtl_commit");
        w.dedent();
        w.line("end procedure;");
        Ok(())
    }

    fn prototype(&self, function: &LoweredFunction) -> CompileResult<String> {
        let sig = &function.signature;
        let mut params = vec!["self: inout self_t".to_string()];
        for (name, ty) in &sig.args {
            params.push(format!("{}: {}", escape(name), vhdl_type(ty)?));
        }
        for (i, ty) in sig.returns.iter().enumerate() {
            params.push(format!("ret_{}: out {}", i, vhdl_type(ty)?));
        }
        Ok(format!("procedure {}({})", escape(&sig.name), params.join("; ")))
    }

    fn procedure(
        &self,
        w: &mut Writer,
        module: &ModuleTypeSignature,
        function: &LoweredFunction,
        doc: Option<&str>,
    ) -> CompileResult<()> {
        let sig = &function.signature;
        w.line(format!("{} is", self.prototype(function)?));
        w.indent();
        if let Some(doc) = doc {
            w.comment(doc);
        }
        let args: Vec<&str> = sig.args.iter().map(|(n, _)| n.as_str()).collect();
        for (name, ty) in sig.locals.iter().chain(&function.synthesized) {
            if args.contains(&name.as_str()) {
                continue;
            }
            w.line(format!("variable {}: {};", escape(name), vhdl_type(ty)?));
        }
        w.dedent();
        w.line("begin");
        w.indent();
        let body = Body { class: &module.class };
        body.block(w, &function.body)?;
        w.dedent();
        w.line("end procedure;");
        Ok(())
    }
}

/// Statement and expression rendering for one class
struct Body<'a> {
    class: &'a str,
}

impl Body<'_> {
    fn unsupported(&self, construct: impl ToString, reason: &str) -> TranslationError {
        TranslationError::unsupported(self.class, construct.to_string(), reason)
    }

    fn block(&self, w: &mut Writer, body: &[Stmt]) -> CompileResult<()> {
        for stmt in body {
            self.stmt(w, stmt)?;
        }
        Ok(())
    }

    fn stmt(&self, w: &mut Writer, stmt: &Stmt) -> CompileResult<()> {
        match stmt {
            Stmt::Assign { targets, value, .. } => match targets.as_slice() {
                [target] => w.line(format!("{} := {};", self.expr(target)?, self.expr(value)?)),
                _ => return Err(self.unsupported(stmt, "multiple targets without a call").into()),
            },
            Stmt::Expr(Expr::Call { func, args }) => {
                w.line(format!("{}({});", self.callee(func)?, self.args(args)?));
            }
            Stmt::Expr(_) => return Err(self.unsupported(stmt, "expression statement has no effect").into()),
            Stmt::If { branches, orelse } => {
                for (i, (cond, block)) in branches.iter().enumerate() {
                    let keyword = if i == 0 { "if" } else { "elsif" };
                    w.line(format!("{} {} then", keyword, self.expr(cond)?));
                    w.indent();
                    self.block(w, block)?;
                    w.dedent();
                }
                if !orelse.is_empty() {
                    w.line("else");
                    w.indent();
                    self.block(w, orelse)?;
                    w.dedent();
                }
                w.line("end if;");
            }
            Stmt::For { var, iter, body } => {
                w.line(format!("for {} in {} loop", escape(var), self.range(iter)?));
                w.indent();
                self.block(w, body)?;
                w.dedent();
                w.line("end loop;");
            }
            Stmt::Return(values) => {
                for (i, value) in values.iter().enumerate() {
                    w.line(format!("ret_{} := {};", i, self.expr(value)?));
                }
                w.line("return;");
            }
            Stmt::Pass => w.line("null;"),
        }
        Ok(())
    }

    fn range(&self, iter: &Expr) -> CompileResult<String> {
        let args = match iter {
            Expr::Call { args, .. } if is_range_call(iter) => args,
            other => return Err(self.unsupported(other, "loops must run over range(...)").into()),
        };
        match args.as_slice() {
            [Arg { value: Expr::Call { func, args }, .. }]
                if matches!(func.as_ref(), Expr::Name(n) if n == "len") && args.len() == 1 =>
            {
                Ok(format!("{}'range", self.expr(&args[0].value)?))
            }
            [end] => Ok(format!("0 to {} - 1", self.operand(&end.value)?)),
            [start, end] => Ok(format!(
                "{} to {} - 1",
                self.expr(&start.value)?,
                self.operand(&end.value)?
            )),
            _ => Err(self.unsupported(iter, "range takes one or two arguments").into()),
        }
    }

    fn callee(&self, func: &Expr) -> CompileResult<String> {
        match func {
            Expr::Name(name) => Ok(escape(name)),
            Expr::Attr(base, name) => match base.as_ref() {
                Expr::Name(package) => Ok(format!("{}.{}", package, escape(name))),
                other => Err(self.unsupported(other, "call was not restructured").into()),
            },
            other => Err(self.unsupported(other, "not a procedure").into()),
        }
    }

    fn args(&self, args: &[Arg]) -> CompileResult<String> {
        let mut rendered = Vec::with_capacity(args.len());
        for arg in args {
            let value = self.expr(&arg.value)?;
            rendered.push(match &arg.name {
                Some(name) => format!("{}=>{}", escape(name), value),
                None => value,
            });
        }
        Ok(rendered.join(", "))
    }

    /// Operand of a binary or unary operator; nested operators are
    /// parenthesized.
    fn operand(&self, expr: &Expr) -> CompileResult<String> {
        let text = self.expr(expr)?;
        Ok(match expr {
            Expr::Binary { .. } | Expr::Unary { .. } => format!("({})", text),
            _ => text,
        })
    }

    /// One side of `&`; a single-item list literal is its bare element
    fn concat_operand(&self, expr: &Expr) -> CompileResult<String> {
        match expr {
            Expr::List(items) if items.len() == 1 => self.operand(&items[0]),
            Expr::Binary { op: BinOp::Concat, .. } => self.expr(expr),
            other => self.operand(other),
        }
    }

    fn expr(&self, expr: &Expr) -> CompileResult<String> {
        Ok(match expr {
            Expr::Int(n) => n.to_string(),
            Expr::Float(v) => real(*v),
            Expr::Bool(b) => (if *b { "True" } else { "False" }).to_string(),
            Expr::Name(name) => escape(name),
            Expr::Attr(base, name) => format!("{}.{}", self.expr(base)?, escape(name)),
            Expr::Index(base, index) => {
                let base = self.expr(base)?;
                match index.as_ref() {
                    Expr::Int(n) if *n < 0 => format!("{0}({0}'length{1})", base, n),
                    other => format!("{}({})", base, self.expr(other)?),
                }
            }
            Expr::Binary {
                op: BinOp::Concat,
                lhs,
                rhs,
            } => format!("{} & {}", self.concat_operand(lhs)?, self.concat_operand(rhs)?),
            Expr::Binary { op, lhs, rhs } => {
                format!("{} {} {}", self.operand(lhs)?, binary_symbol(*op), self.operand(rhs)?)
            }
            Expr::Slice { base, lower, upper } => {
                let base = self.expr(base)?;
                let lower = match lower.as_deref() {
                    None => "0".to_string(),
                    Some(Expr::Int(n)) if *n < 0 => format!("{}'length{}", base, n),
                    Some(other) => self.expr(other)?,
                };
                let upper = match upper.as_deref() {
                    None => format!("{}'high", base),
                    Some(Expr::Int(n)) if *n < 0 => format!("{}'high{}", base, n),
                    Some(Expr::Int(n)) => (n - 1).to_string(),
                    Some(other) => format!("{} - 1", self.operand(other)?),
                };
                format!("{}({} to {})", base, lower, upper)
            }
            Expr::Unary { op, operand } => match op {
                UnaryOp::Neg => format!("-{}", self.operand(operand)?),
                UnaryOp::Not => format!("not {}", self.operand(operand)?),
            },
            Expr::Call { func, args } => self.builtin(expr, func, args)?,
            Expr::List(items) => {
                let items = items.iter().map(|i| self.expr(i)).collect::<CompileResult<Vec<_>>>()?;
                match items.as_slice() {
                    [one] => format!("(0 => {})", one),
                    _ => format!("({})", items.join(", ")),
                }
            }
            Expr::Repeat(item, _) => format!("(others => {})", self.expr(item)?),
            Expr::Tuple(_) => return Err(self.unsupported(expr, "tuples have no VHDL form").into()),
        })
    }

    fn builtin(&self, expr: &Expr, func: &Expr, args: &[Arg]) -> CompileResult<String> {
        let name = match func {
            Expr::Name(name) => name.as_str(),
            _ => return Err(self.unsupported(expr, "only builtins can be called inside expressions").into()),
        };
        let mut positional = Vec::new();
        let mut policies = Vec::new();
        for arg in args {
            match &arg.value {
                Expr::Name(word) if arg.name.is_none() && policy(word).is_some() => {
                    policies.extend(policy(word));
                }
                Expr::Name(word) if word == "wrap_ok" => {}
                value => positional.push(self.expr(value)?),
            }
        }

        Ok(match (name, positional.as_slice()) {
            ("sfix", [value, left, right]) => {
                if policies.is_empty() {
                    format!("to_sfixed({}, {}, {})", value, left, right)
                } else {
                    let overflow = policies.iter().find(|p| matches!(**p, "fixed_wrap" | "fixed_saturate"));
                    let round = policies.iter().find(|p| matches!(**p, "fixed_truncate" | "fixed_round"));
                    format!(
                        "to_sfixed({}, {}, {}, {}, {})",
                        value,
                        left,
                        right,
                        overflow.copied().unwrap_or("fixed_saturate"),
                        round.copied().unwrap_or("fixed_round")
                    )
                }
            }
            ("resize", [value, left, right]) => {
                let overflow = policies.iter().find(|p| matches!(**p, "fixed_wrap" | "fixed_saturate"));
                let round = policies.iter().find(|p| matches!(**p, "fixed_truncate" | "fixed_round"));
                format!(
                    "resize({}, {}, {}, {}, {})",
                    value,
                    left,
                    right,
                    overflow.copied().unwrap_or("fixed_wrap"),
                    round.copied().unwrap_or("fixed_truncate")
                )
            }
            ("complex", [re, im]) => format!("(real=>{}, imag=>{})", re, im),
            ("complex", [re, im, left, right]) => {
                let overflow = policies.iter().find(|p| matches!(**p, "fixed_wrap" | "fixed_saturate"));
                let round = policies.iter().find(|p| matches!(**p, "fixed_truncate" | "fixed_round"));
                let part = |value: &String, source: Option<&Expr>| {
                    let function = if source.is_some_and(Expr::is_numeric_literal) { "to_sfixed" } else { "resize" };
                    format!(
                        "{}({}, {}, {}, {}, {})",
                        function,
                        value,
                        left,
                        right,
                        overflow.copied().unwrap_or("fixed_saturate"),
                        round.copied().unwrap_or("fixed_round")
                    )
                };
                format!(
                    "(real=>{}, imag=>{})",
                    part(re, args.first().map(|a| &a.value)),
                    part(im, args.get(1).map(|a| &a.value))
                )
            }
            ("scalb", [value, shift]) => format!("scalb({}, {})", value, shift),
            ("len", [value]) => format!("{}'length", value),
            ("left_index", [value]) => format!("{}'left", value),
            ("right_index", [value]) => format!("{}'right", value),
            ("abs", [value]) => format!("abs({})", value),
            ("sfix", [_]) => {
                return Err(self.unsupported(expr, "fixed-point literal needs explicit bounds").into())
            }
            _ => return Err(self.unsupported(expr, "no VHDL rendering for this call").into()),
        })
    }
}

/// Every hardware type the lowered modules declare, list elements included
fn each_type<F>(modules: &[LoweredModule], f: &mut F) -> CompileResult<()>
where
    F: FnMut(&HwType) -> CompileResult<()>,
{
    fn visit<F>(ty: &HwType, f: &mut F) -> CompileResult<()>
    where
        F: FnMut(&HwType) -> CompileResult<()>,
    {
        f(ty)?;
        if let HwType::List(element, _) = ty {
            visit(element, f)?;
        }
        Ok(())
    }

    for module in modules {
        for attr in module.signature.attributes.values() {
            visit(&attr.ty, f)?;
        }
        for function in &module.functions {
            let sig = &function.signature;
            for ty in sig
                .args
                .iter()
                .map(|(_, t)| t)
                .chain(sig.locals.values())
                .chain(&sig.returns)
                .chain(function.synthesized.values())
            {
                visit(ty, f)?;
            }
        }
    }
    Ok(())
}

/// Every scalar list type referenced by the lowered modules, first-use order
pub fn list_typedefs(modules: &[LoweredModule]) -> CompileResult<IndexMap<String, String>> {
    let mut out = IndexMap::new();
    each_type(modules, &mut |ty| {
        if let HwType::List(element, _) = ty {
            if !element.is_module() {
                if let Some(name) = list_type_name(element) {
                    if !out.contains_key(&name) {
                        out.insert(name, vhdl_type(element)?);
                    }
                }
            }
        }
        Ok(())
    })?;
    Ok(out)
}

/// Complex record types by name, first-use order
pub fn complex_typedefs(modules: &[LoweredModule]) -> CompileResult<IndexMap<String, FixedFormat>> {
    let mut out = IndexMap::new();
    each_type(modules, &mut |ty| {
        if let HwType::Complex(format) = ty {
            out.entry(complex_type_name(format)).or_insert(*format);
        }
        Ok(())
    })?;
    Ok(out)
}

/// The shared `Typedefs` package
pub fn emit_typedefs(modules: &[LoweredModule]) -> CompileResult<String> {
    let mut w = Writer::new();
    file_header(&mut w);
    w.line(format!("package {} is", TYPEDEFS_PACKAGE));
    w.indent();
    for (name, format) in complex_typedefs(modules)? {
        let part = vhdl_type(&HwType::Fixed(format))?;
        w.line(format!("type {} is record", name));
        w.indent();
        w.line(format!("real: {};", part));
        w.line(format!("imag: {};", part));
        w.dedent();
        w.line("end record;");
    }
    for (name, element) in list_typedefs(modules)? {
        w.line(format!("type {} is array (natural range <>) of {};", name, element));
    }
    w.dedent();
    w.line("end package;");
    Ok(w.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConversionConfig;
    use crate::error::CompileError;
    use crate::extract::extract;
    use crate::fixed::{FixedFormat, Sfix};
    use crate::lower::lower_module;
    use crate::parser::parse_design;
    use crate::sim::Simulator;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_escape() {
        assert_eq!(escape("acc"), "acc");
        assert_eq!(escape("next"), "\\next\\");
        assert_eq!(escape("Signal"), "\\Signal\\");
        assert_eq!(escape("_i_"), "\\_i_\\");
        assert_eq!(escape("a__b"), "\\a__b\\");
        assert_eq!(escape("ret_0"), "ret_0");
    }

    #[test]
    fn test_types_and_literals() {
        let fixed = HwType::Fixed(FixedFormat::new(2, -10));
        assert_eq!(vhdl_type(&fixed).unwrap(), "sfixed(2 downto -10)");
        assert_eq!(
            vhdl_type(&HwType::List(Box::new(fixed.clone()), 4)).unwrap(),
            "sfixed_2_m10_list_t(0 to 3)"
        );
        assert_eq!(
            vhdl_type(&HwType::List(Box::new(HwType::Module("Stage_0".into())), 2)).unwrap(),
            "Stage_0.self_t_list(0 to 1)"
        );
        assert_eq!(vhdl_type(&HwType::Enum("Mode".into())).unwrap(), "integer");
        assert!(vhdl_type(&HwType::List(Box::new(HwType::List(Box::new(HwType::Integer), 2)), 2)).is_err());

        assert_eq!(literal(&Value::Bool(true)).unwrap(), "True");
        assert_eq!(literal(&Value::Fixed(Sfix::new(-1.0, 2, -10))).unwrap(), "to_sfixed(-1.0, 2, -10)");
        assert_eq!(literal(&Value::List(vec![Value::Int(1)])).unwrap(), "(0 => 1)");
        assert_eq!(literal(&Value::List(vec![Value::Int(1), Value::Int(2)])).unwrap(), "(1, 2)");
        assert_eq!(literal(&Value::Float(0.5)), None);
    }

    #[test]
    fn test_registry_is_append_only() {
        let registry = EmittedRegistry::new();
        assert!(registry.claim("Acc_0"));
        assert!(!registry.claim("Acc_0"));
        assert!(registry.claim("Stage_0"));
        assert_eq!(registry.names(), vec!["Acc_0", "Stage_0"]);
        assert!(registry.contains("Stage_0"));
    }

    fn emitted(source: &str, top: &str, inputs: Vec<Vec<Value>>) -> (Vec<String>, String) {
        let design = Arc::new(parse_design(source).unwrap());
        let mut instance = Simulator::new(design.clone()).instantiate(top, vec![]).unwrap();
        instance.simulate(inputs).unwrap();
        let set = extract(&design, &instance, &ConversionConfig::default()).unwrap();
        let lowered: Vec<LoweredModule> = set
            .modules
            .values()
            .map(|sig| lower_module(&design, &set, sig).unwrap())
            .collect();
        let registry = EmittedRegistry::new();
        let emitter = VhdlEmitter::new(&design, &registry);
        let packages = lowered
            .iter()
            .map(|m| emitter.emit(m).unwrap().unwrap())
            .collect();
        (packages, emit_typedefs(&lowered).unwrap())
    }

    #[test]
    fn test_accumulator_package() {
        let (packages, _) = emitted(
            "/// Saturating accumulator
            module Acc {
                fn init() { self.acc = sfix(0.0, 2, -10, saturate, round); self.gain = 2; }
                /// one step
                fn main(x) {
                    if x > 0.0 { self.acc = self.acc + x; } else { pass; }
                    return self.acc;
                }
            }",
            "Acc",
            vec![vec![Value::Fixed(Sfix::new(1.5, 1, -10))]; 3],
        );
        let text = &packages[0];

        assert!(text.starts_with("-- generated by fixrtl"));
        assert!(text.contains("-- Saturating accumulator\npackage Acc_0 is"));
        assert!(text.contains(
            "    type next_t is record\n        acc: sfixed(2 downto -10);\n    end record;"
        ));
        assert!(text.contains("        gain: integer;\n        \\next\\: next_t;\n    end record;"));
        assert!(text.contains("type self_t_list is array (natural range <>) of self_t;"));
        assert!(text.contains(
            "procedure main(self: inout self_t; x: sfixed(1 downto -10); ret_0: out sfixed(2 downto -10));"
        ));
        assert!(text.contains("self.\\next\\.acc := self.acc;"));
        assert!(text.contains(") is\n        -- one step\n    begin\n"));
        assert!(text.contains("self.gain := 2;"));
        assert!(text.contains("self.\\next\\.acc := to_sfixed(0.0, 2, -10);\n        rtl_commit(self);"));
        assert!(text.contains("self.acc := self.\\next\\.acc;"));
        assert!(text.contains(
            "        if x > 0.0 then\n            self.\\next\\.acc := resize(self.acc + x, 2, -10, fixed_saturate, fixed_round);\n        else\n            null;\n        end if;\n        ret_0 := self.acc;\n        return;\n"
        ));
        assert!(text.ends_with("end package body;\n"));
    }

    #[test]
    fn test_submodules_loops_and_typedefs() {
        let (packages, typedefs) = emitted(
            "module Tap {
                fn init() { self.y = sfix(0.0, 1, -8, wrap, truncate); }
                fn main(x) { self.y = x; return self.y; }
            }
            module Fir {
                fn init() {
                    self.taps = [Tap(), Tap()];
                    self.coef = [sfix(0.5, 0, -8, wrap, truncate); 2];
                    self.next_sum = sfix(0.0, 3, -8, wrap, truncate);
                }
                fn main(x) {
                    sum = sfix(0.0, 3, -8, wrap, truncate);
                    for i in range(len(self.taps)) {
                        sum = resize(sum + self.taps[i].main(x) * self.coef[i], 3, -8);
                    }
                    self.next_sum = sum;
                    return sum;
                }
            }",
            "Fir",
            vec![vec![Value::Fixed(Sfix::new(0.25, 0, -8))]; 2],
        );
        assert_eq!(packages.len(), 2);
        let fir = &packages[1];

        assert!(fir.contains("taps: Tap_0.self_t_list(0 to 1);"));
        assert!(fir.contains("coef: sfixed_0_m8_list_t(0 to 1);"));
        assert!(fir.contains(
            "for i in self.taps'range loop\n            Tap_0.rtl_commit(self.taps(i));\n        end loop;"
        ));
        assert!(fir.contains("Tap_0.rtl_list_deepcopy(self.taps, other.taps);"));
        assert!(fir.contains("self.coef := (to_sfixed(0.5, 0, -8), to_sfixed(0.5, 0, -8));"));
        assert!(fir.contains("variable sum: sfixed(3 downto -8);"));
        assert!(fir.contains("variable \\_call0_\\: sfixed(1 downto -8);"));
        assert!(fir.contains(
            "        for i in self.taps'range loop\n            Tap_0.main(self.taps(i), x, ret_0=>\\_call0_\\);\n            sum := resize(sum + (\\_call0_\\ * self.coef(i)), 3, -8, fixed_wrap, fixed_truncate);\n        end loop;"
        ));
        assert!(fir.contains("self.\\next\\.next_sum := resize(sum, 3, -8, fixed_wrap, fixed_truncate);"));

        assert!(typedefs.contains("package Typedefs is\n    type sfixed_0_m8_list_t is array (natural range <>) of sfixed(0 downto -8);\nend package;"));
    }

    #[test]
    fn test_explicit_state_selectors() {
        let (packages, _) = emitted(
            "module Cell {
                fn init() { self.a = 0; }
                fn main(x) { return self.a; }
            }
            module Holder {
                fn init() { self.s = Cell(); self.reg = 0; }
                fn main(x) {
                    self.next.s.a = x;
                    self.reg = self.current.reg + 1;
                    return self.current.reg;
                }
            }",
            "Holder",
            vec![vec![Value::Int(1)], vec![Value::Int(2)]],
        );
        let holder = packages
            .iter()
            .find(|p| p.contains("package Holder_0 is"))
            .unwrap();
        assert!(holder.contains("        self.s.\\next\\.a := x;\n"));
        assert!(holder.contains("        self.\\next\\.reg := self.reg + 1;\n"));
        assert!(holder.contains("        ret_0 := self.reg;\n"));
        assert!(!holder.contains("current"));
    }

    #[test]
    fn test_complex_register_and_shift_register() {
        use crate::complex::ComplexSfix;
        use crate::fixed::{Overflow, Round};

        let c = ComplexSfix::with_policy(0.25, -0.5, 0, -4, Overflow::Wrap, Round::Truncate);
        let input = || vec![Value::Fixed(Sfix::new(0.25, 0, -8)), Value::Complex(c)];
        let (packages, typedefs) = emitted(
            "module Sig {
                fn init() {
                    self.reg = complex(0.5, 1.2, 1, -12);
                    self.shr = [sfix(0.0, 0, -8); 3];
                }
                fn main(x, c) {
                    self.next.reg = c;
                    self.shr = [x] + self.shr[:-1];
                    return self.reg.real;
                }
            }",
            "Sig",
            vec![input(), input()],
        );
        let sig = &packages[0];

        assert!(sig.contains("        reg: complex_sfix1_m12;\n"));
        assert!(sig.contains("        shr: sfixed_0_m8_list_t(0 to 2);\n"));
        assert!(sig.contains(
            "self.\\next\\.reg := (real=>to_sfixed(0.5, 1, -12), imag=>to_sfixed(1.199951171875, 1, -12));"
        ));
        assert!(sig.contains(
            "procedure main(self: inout self_t; x: sfixed(0 downto -8); c: complex_sfix0_m4; ret_0: out sfixed(1 downto -12));"
        ));
        assert!(sig.contains(
            "        self.\\next\\.reg := (real=>resize(c.real, 1, -12, fixed_saturate, fixed_round), imag=>resize(c.imag, 1, -12, fixed_saturate, fixed_round));\n"
        ));
        assert!(sig.contains(
            "        self.\\next\\.shr := resize(x, 0, -8, fixed_saturate, fixed_round) & self.shr(0 to self.shr'high-1);\n"
        ));
        assert!(sig.contains("        ret_0 := self.reg.real;\n"));

        assert!(typedefs.contains(
            "    type complex_sfix1_m12 is record\n        real: sfixed(1 downto -12);\n        imag: sfixed(1 downto -12);\n    end record;\n"
        ));
        assert!(typedefs.contains("type complex_sfix0_m4 is record"));
        assert!(typedefs.contains("    type sfixed_0_m8_list_t is array (natural range <>) of sfixed(0 downto -8);\n"));
        assert!(typedefs.find("complex_sfix1_m12").unwrap() < typedefs.find("sfixed_0_m8_list_t").unwrap());
    }

    #[test]
    fn test_slice_ranges() {
        let body = Body { class: "T" };
        let parse = |s: &str| crate::parser::Parser::new(s).parse_expr().unwrap();
        let render = |s: &str| body.expr(&parse(s)).unwrap();
        assert_eq!(render("a[1:]"), "a(1 to a'high)");
        assert_eq!(render("a[:3]"), "a(0 to 2)");
        assert_eq!(render("a[-2:]"), "a(a'length-2 to a'high)");
        assert_eq!(render("a[i:n + 1]"), "a(i to (n + 1) - 1)");

        let concat = Expr::Binary {
            op: BinOp::Concat,
            lhs: Box::new(parse("[x]")),
            rhs: Box::new(parse("a[:-1]")),
        };
        assert_eq!(body.expr(&concat).unwrap(), "x & a(0 to a'high-1)");
        assert_eq!(
            vhdl_type(&HwType::List(Box::new(HwType::Complex(FixedFormat::new(0, -4))), 2)).unwrap(),
            "complex_sfix0_m4_list_t(0 to 1)"
        );
    }

    #[test]
    fn test_repeated_emission_is_skipped() {
        let design = parse_design("module M { fn main(x) { return x; } }").unwrap();
        let mut sig = ModuleTypeSignature::new("M", "M_0");
        let mut main = crate::types::FunctionSignature::new("main");
        main.args.push(("x".to_string(), HwType::Boolean));
        main.returns.push(HwType::Boolean);
        sig.functions.insert("main".to_string(), main.clone());
        let module = LoweredModule {
            signature: Arc::new(sig),
            functions: vec![LoweredFunction {
                signature: main,
                body: design.modules[0].functions[0].body.clone(),
                synthesized: IndexMap::new(),
            }],
        };
        let registry = EmittedRegistry::new();
        let emitter = VhdlEmitter::new(&design, &registry);

        let text = emitter.emit(&module).unwrap().unwrap();
        assert!(text.contains("unused: boolean;"));
        assert!(emitter.emit(&module).unwrap().is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unrenderable_constructs() {
        let body = Body { class: "M" };
        let mut w = Writer::new();
        let tuple = Stmt::Expr(Expr::Tuple(vec![Expr::Int(1)]));
        assert!(matches!(
            body.stmt(&mut w, &tuple),
            Err(CompileError::Translation(TranslationError::UnsupportedConstruct { .. }))
        ));
        let lazy = Expr::call(Expr::name("sfix"), vec![Arg::positional(Expr::Float(0.5))]);
        assert!(body.expr(&lazy).is_err());
        let while_loop = Expr::call(Expr::name("items"), vec![]);
        assert!(body.range(&while_loop).is_err());

        let policy = Expr::call(
            Expr::name("sfix"),
            vec![
                Arg::positional(Expr::Float(0.5)),
                Arg::positional(Expr::Int(0)),
                Arg::positional(Expr::Int(-4)),
                Arg::positional(Expr::name("wrap")),
            ],
        );
        assert_eq!(body.expr(&policy).unwrap(), "to_sfixed(0.5, 0, -4, fixed_wrap, fixed_round)");
    }
}
