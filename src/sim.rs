//! Cycle-accurate simulator for parsed designs
//!
//! Owns module instances, applies the register commit protocol and records a
//! [`TraceRecord`] for every function invocation.
//!
//! ```text
//! construct:  run `init(args)`, writes land in pending, then one commit
//! cycle:      commit the whole instance tree, then run `main(input)`
//! ```
//!
//! Reads of `self.x` see committed state. Writes to `self.x` and
//! `self.next.x` go to pending and are resized to the register's declared
//! fixed-point format. Writing through `self.current` is a discipline
//! violation outside construction.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::ast::{Access, Arg, BinOp, Design, Expr, Stmt, UnaryOp, substitute_block};
use crate::complex::ComplexSfix;
use crate::config::ConversionConfig;
use crate::diagnostics::{current_path, enter_path, take_diagnostics, OverflowDiagnostic};
use crate::error::{
    CompileError, CompileResult, StateDisciplineError, TranslationError,
};
use crate::fixed::{FloatMode, Overflow, Round, Sfix};
use crate::registers::{clock, Clocked, Registers};
use crate::trace::TraceRecord;
use crate::value::Value;

/// Functions provided by the language itself
pub const BUILTINS: &[&str] = &[
    "sfix",
    "complex",
    "resize",
    "scalb",
    "len",
    "range",
    "left_index",
    "right_index",
    "abs",
];

/// Policy identifiers accepted by `sfix`, `complex` and `resize`
pub const POLICIES: &[&str] = &["wrap", "saturate", "truncate", "round", "wrap_ok"];

#[derive(Debug, Clone, PartialEq)]
struct Settings {
    constructor: String,
    entry: String,
    strict_wrap: bool,
    float_mode: bool,
}

impl From<&ConversionConfig> for Settings {
    fn from(config: &ConversionConfig) -> Self {
        Self {
            constructor: config.constructor.clone(),
            entry: config.entry.clone(),
            strict_wrap: config.strict_wrap,
            float_mode: config.float_mode,
        }
    }
}

/// Builds module instances from a parsed design
pub struct Simulator {
    design: Arc<Design>,
    settings: Arc<Settings>,
}

impl Simulator {
    pub fn new(design: Arc<Design>) -> Self {
        Self::with_config(design, &ConversionConfig::default())
    }

    pub fn with_config(design: Arc<Design>, config: &ConversionConfig) -> Self {
        Self {
            design,
            settings: Arc::new(Settings::from(config)),
        }
    }

    pub fn design(&self) -> &Arc<Design> {
        &self.design
    }

    /// Construct an instance of `class`, running its constructor with `args`
    pub fn instantiate(&self, class: &str, args: Vec<Value>) -> CompileResult<Instance> {
        Instance::construct(self.design.clone(), self.settings.clone(), class, args)
    }
}

/// Sub-modules owned by an instance attribute
#[derive(Debug, Clone, PartialEq)]
pub enum Child {
    One(Instance),
    Many(Vec<Instance>),
}

impl Child {
    pub fn instances(&self) -> &[Instance] {
        match self {
            Child::One(instance) => std::slice::from_ref(instance),
            Child::Many(list) => list,
        }
    }

    fn instances_mut(&mut self) -> &mut [Instance] {
        match self {
            Child::One(instance) => std::slice::from_mut(instance),
            Child::Many(list) => list,
        }
    }
}

/// A live module instance
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    design: Arc<Design>,
    settings: Arc<Settings>,
    class: String,
    regs: Registers<IndexMap<String, Value>>,
    children: IndexMap<String, Child>,
    /// Committed state right after construction
    initial: IndexMap<String, Value>,
    /// Attribute -> function that last wrote it after construction
    written_by: IndexMap<String, String>,
    traces: Vec<TraceRecord>,
    diagnostics: Vec<OverflowDiagnostic>,
    constructing: bool,
}

/// An own-state access with its indices evaluated
#[derive(Debug, Clone, PartialEq)]
enum Step {
    Field(String),
    Index(i64),
}

struct Frame {
    function: String,
    locals: IndexMap<String, Value>,
    record: TraceRecord,
}

enum Flow {
    Next,
    Return(Vec<Value>),
}

fn sim_error(msg: impl Into<String>) -> CompileError {
    CompileError::simulation(current_path(), msg)
}

impl Instance {
    fn construct(
        design: Arc<Design>,
        settings: Arc<Settings>,
        class: &str,
        args: Vec<Value>,
    ) -> CompileResult<Instance> {
        let count = design.modules.iter().filter(|m| m.name == class).count();
        match count {
            0 => return Err(sim_error(format!("unknown module '{}'", class))),
            1 => {}
            n => {
                return Err(TranslationError::AmbiguousSourceDefinition {
                    class: class.to_string(),
                    count: n,
                }
                .into())
            }
        }

        let has_constructor = design
            .module(class)
            .map_or(false, |m| m.function(&settings.constructor).is_some());
        let constructor = settings.constructor.clone();
        let _float = settings.float_mode.then(FloatMode::enter);

        let mut instance = Instance {
            design,
            settings,
            class: class.to_string(),
            regs: Registers::new(IndexMap::new()),
            children: IndexMap::new(),
            initial: IndexMap::new(),
            written_by: IndexMap::new(),
            traces: Vec::new(),
            diagnostics: Vec::new(),
            constructing: true,
        };

        if has_constructor {
            instance.invoke(&constructor, args)?;
        } else if !args.is_empty() {
            return Err(sim_error(format!(
                "{} has no '{}' but was given {} arguments",
                class,
                constructor,
                args.len()
            )));
        }

        instance.constructing = false;
        instance.regs.commit();
        instance.initial = instance.regs.current().clone();
        Ok(instance)
    }

    pub fn class_name(&self) -> &str {
        &self.class
    }

    pub fn design(&self) -> &Arc<Design> {
        &self.design
    }

    pub fn constructor_name(&self) -> &str {
        &self.settings.constructor
    }

    pub fn entry_name(&self) -> &str {
        &self.settings.entry
    }

    /// Committed value of a register
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.regs.current().get(name)
    }

    pub fn pending_attribute(&self, name: &str) -> Option<&Value> {
        self.regs.pending().get(name)
    }

    pub fn attributes(&self) -> &IndexMap<String, Value> {
        self.regs.current()
    }

    pub fn initial(&self) -> &IndexMap<String, Value> {
        &self.initial
    }

    pub fn children(&self) -> &IndexMap<String, Child> {
        &self.children
    }

    pub fn traces(&self) -> &[TraceRecord] {
        &self.traces
    }

    pub fn call_count(&self, function: &str) -> usize {
        self.traces.iter().filter(|t| t.function == function).count()
    }

    /// Written at least once after construction
    pub fn is_written(&self, attribute: &str) -> bool {
        self.written_by.contains_key(attribute)
    }

    /// Overflow events seen during the steps of this instance
    pub fn diagnostics(&self) -> &[OverflowDiagnostic] {
        &self.diagnostics
    }

    /// One clock cycle: commit, then the entry function
    pub fn cycle(&mut self, input: Vec<Value>) -> CompileResult<Option<Value>> {
        clock(self, input)
    }

    /// Run one cycle per input, collecting the outputs
    pub fn simulate(&mut self, inputs: Vec<Vec<Value>>) -> CompileResult<Vec<Option<Value>>> {
        inputs.into_iter().map(|input| self.cycle(input)).collect()
    }

    /// Call a function by name; multiple returns come back as a tuple
    pub fn call(&mut self, function: &str, args: Vec<Value>) -> CompileResult<Option<Value>> {
        let returns = self.invoke(function, args)?;
        Ok(returns.map(pack))
    }

    fn invoke(&mut self, name: &str, args: Vec<Value>) -> CompileResult<Option<Vec<Value>>> {
        let design = self.design.clone();
        let module = design
            .module(&self.class)
            .ok_or_else(|| sim_error(format!("unknown module '{}'", self.class)))?;
        let function = module
            .function(name)
            .ok_or_else(|| sim_error(format!("{} has no function '{}'", self.class, name)))?;

        if function.params.len() != args.len() {
            return Err(sim_error(format!(
                "{}.{} takes {} arguments, got {}",
                self.class,
                name,
                function.params.len(),
                args.len()
            )));
        }

        let _path = enter_path(format!("{}.{}", self.class, name));
        let bound: Vec<(String, Value)> = function.params.iter().cloned().zip(args).collect();
        let mut frame = Frame {
            function: name.to_string(),
            locals: bound.iter().cloned().collect(),
            record: TraceRecord::new(name, bound),
        };

        let returns = match self.exec_block(&mut frame, &function.body)? {
            Flow::Return(values) if !values.is_empty() => Some(values),
            _ => None,
        };

        if !self.constructing {
            if let Some(values) = &returns {
                frame.record.set_returns(values.clone());
            }
            self.traces.push(frame.record);
        }
        Ok(returns)
    }

    fn commit_tree(&mut self) -> CompileResult<()> {
        for (name, next) in self.regs.pending() {
            if let Some(previous) = self.regs.current().get(name) {
                if !previous.same_shape(next) {
                    let function = self
                        .written_by
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| self.settings.entry.clone());
                    return Err(StateDisciplineError::TypeNotConsistent {
                        class: self.class.clone(),
                        function,
                        variable: name.clone(),
                        previous: previous.to_string(),
                        next: next.to_string(),
                    }
                    .into());
                }
            }
        }

        self.regs.commit();
        for child in self.children.values_mut() {
            for instance in child.instances_mut() {
                instance.commit_tree()?;
            }
        }
        Ok(())
    }

    /// Copy of the state without the recorded history, for sub-modules
    /// read as values
    fn detached(&self) -> Instance {
        Instance {
            design: self.design.clone(),
            settings: self.settings.clone(),
            class: self.class.clone(),
            regs: self.regs.clone(),
            children: self
                .children
                .iter()
                .map(|(name, child)| {
                    let child = match child {
                        Child::One(instance) => Child::One(instance.detached()),
                        Child::Many(list) => Child::Many(list.iter().map(Instance::detached).collect()),
                    };
                    (name.clone(), child)
                })
                .collect(),
            initial: self.initial.clone(),
            written_by: self.written_by.clone(),
            traces: Vec::new(),
            diagnostics: Vec::new(),
            constructing: self.constructing,
        }
    }

    /// Structural copy for sub-module assignment: pending := other's committed state
    fn deepcopy_from(&mut self, other: &Instance, function: &str) -> CompileResult<()> {
        if other.class != self.class {
            return Err(sim_error(format!(
                "cannot assign a {} to a {} sub-module",
                other.class, self.class
            )));
        }
        *self.regs.pending_mut() = other.regs.current().clone();
        for name in other.regs.current().keys() {
            self.written_by.insert(name.clone(), function.to_string());
        }
        for (name, child) in self.children.iter_mut() {
            let source = other
                .children
                .get(name)
                .ok_or_else(|| sim_error(format!("{} has no sub-module '{}'", other.class, name)))?;
            for (dst, src) in child.instances_mut().iter_mut().zip(source.instances()) {
                dst.deepcopy_from(src, function)?;
            }
        }
        Ok(())
    }

    fn exec_block(&mut self, frame: &mut Frame, body: &[Stmt]) -> CompileResult<Flow> {
        for stmt in body {
            if let Flow::Return(values) = self.exec_stmt(frame, stmt)? {
                return Ok(Flow::Return(values));
            }
        }
        Ok(Flow::Next)
    }

    fn exec_stmt(&mut self, frame: &mut Frame, stmt: &Stmt) -> CompileResult<Flow> {
        match stmt {
            Stmt::Assign { targets, op, value } => {
                let value = self.eval(frame, value)?;
                if let [target] = targets.as_slice() {
                    let value = match op.binary() {
                        Some(bin) => {
                            let current = self.eval(frame, target)?;
                            binary_op(bin, current, value).map_err(sim_error)?
                        }
                        None => value,
                    };
                    self.assign(frame, target, value)?;
                } else {
                    let items = match value {
                        Value::Tuple(items) if items.len() == targets.len() => items,
                        other => {
                            return Err(sim_error(format!(
                                "cannot unpack {} into {} targets in '{}'",
                                other,
                                targets.len(),
                                stmt
                            )))
                        }
                    };
                    for (target, item) in targets.iter().zip(items) {
                        self.assign(frame, target, item)?;
                    }
                }
                Ok(Flow::Next)
            }
            Stmt::Expr(expr) => {
                self.eval(frame, expr)?;
                Ok(Flow::Next)
            }
            Stmt::If { branches, orelse } => {
                for (cond, body) in branches {
                    if self.condition(frame, cond)? {
                        return self.exec_block(frame, body);
                    }
                }
                self.exec_block(frame, orelse)
            }
            Stmt::For { var, iter, body } => self.exec_for(frame, var, iter, body),
            Stmt::Return(values) => {
                let values = values
                    .iter()
                    .map(|v| self.eval(frame, v))
                    .collect::<CompileResult<Vec<_>>>()?;
                Ok(Flow::Return(values))
            }
            Stmt::Pass => Ok(Flow::Next),
        }
    }

    /// Range loops bind the variable; container loops index the container,
    /// so loop bodies act on the real sub-modules and registers.
    fn exec_for(
        &mut self,
        frame: &mut Frame,
        var: &str,
        iter: &Expr,
        body: &[Stmt],
    ) -> CompileResult<Flow> {
        let is_range = matches!(iter, Expr::Call { func, .. } if matches!(func.as_ref(), Expr::Name(n) if n == "range"));

        let items = match self.eval(frame, iter)? {
            Value::List(items) => items,
            other => {
                return Err(sim_error(format!(
                    "cannot iterate over a {} in '{}'",
                    other.kind_name(),
                    iter
                )))
            }
        };

        if is_range {
            for item in items {
                frame.locals.insert(var.to_string(), item);
                if let Flow::Return(values) = self.exec_block(frame, body)? {
                    return Ok(Flow::Return(values));
                }
            }
        } else {
            for i in 0..items.len() {
                let element = Expr::index(iter.clone(), Expr::Int(i as i64));
                let body = substitute_block(body, var, &element);
                if let Flow::Return(values) = self.exec_block(frame, &body)? {
                    return Ok(Flow::Return(values));
                }
            }
        }
        Ok(Flow::Next)
    }

    fn condition(&mut self, frame: &mut Frame, cond: &Expr) -> CompileResult<bool> {
        let value = self.eval(frame, cond)?;
        value
            .truthy()
            .ok_or_else(|| sim_error(format!("condition '{}' is a {}", cond, value.kind_name())))
    }

    fn assign(&mut self, frame: &mut Frame, target: &Expr, value: Value) -> CompileResult<()> {
        if target.is_self_rooted() {
            let steps = self.resolve_steps(frame, target)?;
            let function = frame.function.clone();
            return self.write_steps(&steps, value, &function);
        }

        let (root, chain) = target.chain();
        let name = match root {
            Expr::Name(name) => name,
            other => return Err(sim_error(format!("cannot assign to '{}'", other))),
        };

        if chain.is_empty() {
            frame.record.bind(name, &value);
            frame.locals.insert(name.clone(), value);
            return Ok(());
        }

        let steps = self.eval_accesses(frame, &chain)?;
        let slot = frame
            .locals
            .get_mut(name)
            .ok_or_else(|| sim_error(format!("name '{}' is not defined", name)))?;
        store(slot, &steps, value, false).map_err(sim_error)?;
        let whole = slot.clone();
        frame.record.bind(name, &whole);
        Ok(())
    }

    fn resolve_steps(&mut self, frame: &mut Frame, expr: &Expr) -> CompileResult<Vec<Step>> {
        let (_, chain) = expr.chain();
        self.eval_accesses(frame, &chain)
    }

    fn eval_accesses(&mut self, frame: &mut Frame, chain: &[Access<'_>]) -> CompileResult<Vec<Step>> {
        let mut steps = Vec::with_capacity(chain.len());
        for access in chain {
            match access {
                Access::Field(name) => steps.push(Step::Field(name.to_string())),
                Access::Index(index) => {
                    let value = self.eval(frame, index)?;
                    let i = value.as_int().ok_or_else(|| {
                        sim_error(format!("index '{}' is a {}", index, value.kind_name()))
                    })?;
                    steps.push(Step::Index(i));
                }
            }
        }
        Ok(steps)
    }

    fn read_steps(&self, pending: bool, steps: &[Step]) -> CompileResult<Value> {
        let (first, rest) = steps
            .split_first()
            .ok_or_else(|| sim_error("'self' is not a value"))?;
        let name = match first {
            Step::Field(name) => name.as_str(),
            Step::Index(_) => return Err(sim_error("'self' cannot be indexed")),
        };

        match name {
            "next" => return self.read_steps(true, rest),
            "current" => return self.read_steps(false, rest),
            _ => {}
        }

        if let Some(child) = self.children.get(name) {
            return match (child, rest.split_first()) {
                (Child::One(instance), None) => Ok(Value::Module(Box::new(instance.detached()))),
                (Child::One(instance), Some(_)) => instance.read_steps(false, rest),
                (Child::Many(list), None) => Ok(Value::List(
                    list.iter()
                        .map(|i| Value::Module(Box::new(i.detached())))
                        .collect(),
                )),
                (Child::Many(list), Some((Step::Index(i), tail))) => {
                    let instance = &list[normalize_index(*i, list.len())?];
                    if tail.is_empty() {
                        Ok(Value::Module(Box::new(instance.detached())))
                    } else {
                        instance.read_steps(false, tail)
                    }
                }
                (Child::Many(_), Some((Step::Field(field), _))) => Err(sim_error(format!(
                    "sub-module list '{}' has no attribute '{}'",
                    name, field
                ))),
            };
        }

        let state = if pending {
            self.regs.pending()
        } else {
            self.regs.current()
        };
        let mut value = state
            .get(name)
            .ok_or_else(|| sim_error(format!("{} has no attribute '{}'", self.class, name)))?;
        for (n, step) in rest.iter().enumerate() {
            value = match (step, value) {
                (Step::Index(i), Value::List(items)) => &items[normalize_index(*i, items.len())?],
                (Step::Field(field), Value::Complex(c)) if n + 1 == rest.len() => {
                    return complex_part(c, field);
                }
                (step, value) => {
                    return Err(sim_error(format!(
                        "cannot apply {:?} to a {}",
                        step,
                        value.kind_name()
                    )))
                }
            };
        }
        Ok(value.clone())
    }

    fn write_steps(&mut self, steps: &[Step], value: Value, function: &str) -> CompileResult<()> {
        let (first, rest) = steps
            .split_first()
            .ok_or_else(|| sim_error("cannot assign to 'self'"))?;
        let name = match first {
            Step::Field(name) => name.clone(),
            Step::Index(_) => return Err(sim_error("'self' cannot be indexed")),
        };

        match name.as_str() {
            "current" if !self.constructing => {
                return Err(StateDisciplineError::AssignToCommittedState {
                    class: self.class.clone(),
                    path: render_path(&steps[1..]),
                }
                .into())
            }
            "current" | "next" => return self.write_steps(rest, value, function),
            _ => {}
        }

        if self.children.contains_key(&name) {
            return self.write_child(&name, rest, value, function);
        }

        if self.constructing && rest.is_empty() {
            match value {
                Value::Module(instance) => {
                    self.regs.pending_mut().shift_remove(&name);
                    self.children.insert(name, Child::One(*instance));
                }
                Value::List(items)
                    if !items.is_empty() && items.iter().all(|v| matches!(v, Value::Module(_))) =>
                {
                    let list = items
                        .into_iter()
                        .filter_map(|v| match v {
                            Value::Module(instance) => Some(*instance),
                            _ => None,
                        })
                        .collect();
                    self.regs.pending_mut().shift_remove(&name);
                    self.children.insert(name, Child::Many(list));
                }
                other => {
                    self.regs.pending_mut().insert(name, other);
                }
            }
            return Ok(());
        }

        let coerce = !self.constructing;
        let class = self.class.clone();
        let slot = self
            .regs
            .pending_mut()
            .get_mut(&name)
            .ok_or_else(|| sim_error(format!("{} has no attribute '{}'", class, name)))?;
        store(slot, rest, value, coerce).map_err(sim_error)?;

        if !self.constructing {
            self.written_by.insert(name, function.to_string());
        }
        Ok(())
    }

    fn write_child(
        &mut self,
        name: &str,
        rest: &[Step],
        value: Value,
        function: &str,
    ) -> CompileResult<()> {
        let constructing = self.constructing;
        let child = self
            .children
            .get_mut(name)
            .ok_or_else(|| sim_error(format!("no sub-module '{}'", name)))?;

        let (instance, tail): (&mut Instance, &[Step]) = match (child, rest.split_first()) {
            (Child::One(instance), _) => (instance, rest),
            (Child::Many(list), None) => {
                let items = match value {
                    Value::List(items) if items.len() == list.len() => items,
                    other => {
                        return Err(sim_error(format!(
                            "cannot assign {} to sub-module list '{}'",
                            other, name
                        )))
                    }
                };
                for (dst, item) in list.iter_mut().zip(items) {
                    dst.replace_with(item, constructing, function)?;
                }
                return Ok(());
            }
            (Child::Many(list), Some((Step::Index(i), tail))) => {
                let idx = normalize_index(*i, list.len())?;
                (&mut list[idx], tail)
            }
            (Child::Many(_), Some((Step::Field(field), _))) => {
                return Err(sim_error(format!(
                    "sub-module list '{}' has no attribute '{}'",
                    name, field
                )))
            }
        };

        if tail.is_empty() {
            instance.replace_with(value, constructing, function)
        } else {
            instance.write_steps(tail, value, function)
        }
    }

    fn replace_with(&mut self, value: Value, constructing: bool, function: &str) -> CompileResult<()> {
        match value {
            Value::Module(source) if constructing => {
                *self = *source;
                Ok(())
            }
            Value::Module(source) => self.deepcopy_from(&source, function),
            other => Err(sim_error(format!(
                "cannot assign a {} to sub-module {}",
                other.kind_name(),
                self.class
            ))),
        }
    }

    fn child_mut(&mut self, steps: &[Step]) -> CompileResult<&mut Instance> {
        let (first, rest) = steps
            .split_first()
            .ok_or_else(|| sim_error("missing sub-module name"))?;
        let name = match first {
            Step::Field(name) => name.as_str(),
            Step::Index(_) => return Err(sim_error("'self' cannot be indexed")),
        };
        if name == "next" || name == "current" {
            return self.child_mut(rest);
        }

        match self.children.get_mut(name) {
            Some(Child::One(instance)) => {
                if rest.is_empty() {
                    Ok(instance)
                } else {
                    instance.child_mut(rest)
                }
            }
            Some(Child::Many(list)) => match rest.split_first() {
                Some((Step::Index(i), tail)) => {
                    let idx = normalize_index(*i, list.len())?;
                    let instance = &mut list[idx];
                    if tail.is_empty() {
                        Ok(instance)
                    } else {
                        instance.child_mut(tail)
                    }
                }
                _ => Err(sim_error(format!("sub-module list '{}' must be indexed", name))),
            },
            None => Err(sim_error(format!("'{}' is not a sub-module", name))),
        }
    }

    fn eval(&mut self, frame: &mut Frame, expr: &Expr) -> CompileResult<Value> {
        match expr {
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Float(n) => Ok(Value::Float(*n)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Name(name) => frame.locals.get(name).cloned().ok_or_else(|| {
                if name == "self" {
                    sim_error("'self' is not a value")
                } else {
                    sim_error(format!("name '{}' is not defined", name))
                }
            }),
            Expr::Attr(base, member) => {
                if let Expr::Name(name) = base.as_ref() {
                    if let Some(def) = self.design.enumeration(name) {
                        let ordinal = def.ordinal(member).ok_or_else(|| {
                            sim_error(format!("enum {} has no variant '{}'", name, member))
                        })?;
                        return Ok(Value::Enum {
                            name: name.clone(),
                            variant: member.clone(),
                            ordinal,
                        });
                    }
                }
                if expr.is_self_rooted() {
                    let steps = self.resolve_steps(frame, expr)?;
                    return self.read_steps(false, &steps);
                }
                match self.eval(frame, base)? {
                    Value::Module(instance) => {
                        instance.read_steps(false, &[Step::Field(member.clone())])
                    }
                    Value::Complex(c) => complex_part(&c, member),
                    other => Err(sim_error(format!(
                        "a {} has no attribute '{}'",
                        other.kind_name(),
                        member
                    ))),
                }
            }
            Expr::Index(base, index) => {
                if expr.is_self_rooted() {
                    let steps = self.resolve_steps(frame, expr)?;
                    return self.read_steps(false, &steps);
                }
                let base = self.eval(frame, base)?;
                let i = self.eval(frame, index)?;
                let i = i
                    .as_int()
                    .ok_or_else(|| sim_error(format!("index is a {}", i.kind_name())))?;
                match base {
                    Value::List(mut items) => {
                        let idx = normalize_index(i, items.len())?;
                        Ok(items.swap_remove(idx))
                    }
                    other => Err(sim_error(format!("cannot index a {}", other.kind_name()))),
                }
            }
            Expr::Slice { base, lower, upper } => {
                let mut items = match self.eval(frame, base)? {
                    Value::List(items) => items,
                    other => return Err(sim_error(format!("cannot slice a {}", other.kind_name()))),
                };
                let lower = self.slice_bound(frame, lower.as_deref())?;
                let upper = self.slice_bound(frame, upper.as_deref())?;
                let (lo, hi) = slice_range(items.len(), lower, upper);
                items.truncate(hi);
                Ok(Value::List(items.split_off(lo)))
            }
            Expr::Call { func, args } => self.eval_call(frame, func, args),
            Expr::Binary {
                op: op @ (BinOp::And | BinOp::Or),
                lhs,
                rhs,
            } => {
                let left = self.condition(frame, lhs)?;
                let short = match op {
                    BinOp::And => !left,
                    _ => left,
                };
                if short {
                    return Ok(Value::Bool(left));
                }
                Ok(Value::Bool(self.condition(frame, rhs)?))
            }
            Expr::Binary { op, lhs, rhs } => {
                let left = self.eval(frame, lhs)?;
                let right = self.eval(frame, rhs)?;
                binary_op(*op, left, right).map_err(sim_error)
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(frame, operand)?;
                unary_op(*op, value).map_err(sim_error)
            }
            Expr::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| self.eval(frame, item))
                    .collect::<CompileResult<_>>()?,
            )),
            Expr::Repeat(item, n) => {
                let value = self.eval(frame, item)?;
                Ok(Value::List(vec![value; *n]))
            }
            Expr::Tuple(items) => Ok(Value::Tuple(
                items
                    .iter()
                    .map(|item| self.eval(frame, item))
                    .collect::<CompileResult<_>>()?,
            )),
        }
    }

    fn slice_bound(&mut self, frame: &mut Frame, bound: Option<&Expr>) -> CompileResult<Option<i64>> {
        let Some(bound) = bound else {
            return Ok(None);
        };
        let value = self.eval(frame, bound)?;
        match value.as_int() {
            Some(i) => Ok(Some(i)),
            None => Err(sim_error(format!("slice bound '{}' is a {}", bound, value.kind_name()))),
        }
    }

    fn eval_args(&mut self, frame: &mut Frame, args: &[Arg]) -> CompileResult<Vec<Value>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            if let Some(name) = &arg.name {
                return Err(sim_error(format!(
                    "keyword argument '{}' is only accepted by builtins",
                    name
                )));
            }
            values.push(self.eval(frame, &arg.value)?);
        }
        Ok(values)
    }

    fn eval_call(&mut self, frame: &mut Frame, func: &Expr, args: &[Arg]) -> CompileResult<Value> {
        match func {
            Expr::Name(name) if BUILTINS.contains(&name.as_str()) => self.builtin(frame, name, args),
            Expr::Name(name) if self.design.module(name).is_some() => {
                let values = self.eval_args(frame, args)?;
                let instance =
                    Instance::construct(self.design.clone(), self.settings.clone(), name, values)?;
                Ok(Value::Module(Box::new(instance)))
            }
            Expr::Attr(receiver, method) => {
                let values = self.eval_args(frame, args)?;
                let returns = if matches!(receiver.as_ref(), Expr::Name(n) if n == "self") {
                    self.invoke(method, values)?
                } else if receiver.is_self_rooted() {
                    let steps = self.resolve_steps(frame, receiver)?;
                    self.child_mut(&steps)?.invoke(method, values)?
                } else {
                    return Err(sim_error(format!(
                        "'{}' is not 'self' or one of its sub-modules",
                        receiver
                    )));
                };
                Ok(returns.map(pack).unwrap_or(Value::Tuple(Vec::new())))
            }
            other => Err(sim_error(format!("'{}' is not callable", other))),
        }
    }

    fn builtin(&mut self, frame: &mut Frame, name: &str, args: &[Arg]) -> CompileResult<Value> {
        let mut values = Vec::new();
        let mut overflow = None;
        let mut round = None;
        let mut wrap_ok = false;

        for arg in args {
            let policy = match &arg.value {
                Expr::Name(p) if POLICIES.contains(&p.as_str()) && !frame.locals.contains_key(p) => {
                    Some(p.as_str())
                }
                _ => None,
            };
            match (&arg.name, policy) {
                (_, Some(p)) => match p {
                    "wrap_ok" => wrap_ok = true,
                    p => {
                        if let Some(o) = Overflow::from_keyword(p) {
                            overflow = Some(o);
                        }
                        if let Some(r) = Round::from_keyword(p) {
                            round = Some(r);
                        }
                    }
                },
                (Some(key), None) => {
                    return Err(sim_error(format!("{}() got unknown keyword '{}'", name, key)))
                }
                (None, None) => values.push(self.eval(frame, &arg.value)?),
            }
        }

        let bad_args = || {
            sim_error(format!(
                "invalid arguments to {}(): {}",
                name,
                values
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        };

        let result = match (name, values.as_slice()) {
            ("sfix", [v]) => Value::Fixed(Sfix::lazy(v.as_f64().ok_or_else(bad_args)?)),
            ("sfix", [v, l, r]) => {
                let (l, r) = bounds(l, r).ok_or_else(bad_args)?;
                let mut fix = Sfix::lazy(v.as_f64().ok_or_else(bad_args)?);
                if wrap_ok {
                    fix = fix.expect_wrap();
                }
                Value::Fixed(fix.resize(
                    l,
                    r,
                    overflow.unwrap_or(Overflow::Saturate),
                    round.unwrap_or(Round::Round),
                ))
            }
            ("complex", [Value::Fixed(re), Value::Fixed(im)]) => {
                if !re.same_format(im) {
                    return Err(bad_args());
                }
                Value::Complex(ComplexSfix::new(*re, *im))
            }
            ("complex", [re, im]) => Value::Complex(ComplexSfix::lazy(
                re.as_f64().ok_or_else(bad_args)?,
                im.as_f64().ok_or_else(bad_args)?,
            )),
            ("complex", [re, im, l, r]) => {
                let (l, r) = bounds(l, r).ok_or_else(bad_args)?;
                let part = |v: &Value| -> CompileResult<Sfix> {
                    let fix = match v {
                        Value::Fixed(fix) => *fix,
                        other => Sfix::lazy(other.as_f64().ok_or_else(bad_args)?),
                    };
                    Ok(if wrap_ok { fix.expect_wrap() } else { fix })
                };
                Value::Complex(ComplexSfix::new(part(re)?, part(im)?).resize(
                    l,
                    r,
                    overflow.unwrap_or(Overflow::Saturate),
                    round.unwrap_or(Round::Round),
                ))
            }
            ("resize", [Value::Complex(c), l, r]) => {
                let (l, r) = bounds(l, r).ok_or_else(bad_args)?;
                let c = if wrap_ok { c.expect_wrap() } else { *c };
                Value::Complex(c.resize(
                    l,
                    r,
                    overflow.unwrap_or(Overflow::Wrap),
                    round.unwrap_or(Round::Truncate),
                ))
            }
            ("resize", [x, l, r]) => {
                let (l, r) = bounds(l, r).ok_or_else(bad_args)?;
                let mut fix = match x {
                    Value::Fixed(fix) => *fix,
                    other => Sfix::lazy(other.as_f64().ok_or_else(bad_args)?),
                };
                if wrap_ok {
                    fix = fix.expect_wrap();
                }
                Value::Fixed(fix.resize(
                    l,
                    r,
                    overflow.unwrap_or(Overflow::Wrap),
                    round.unwrap_or(Round::Truncate),
                ))
            }
            ("scalb", [Value::Fixed(x), i]) => {
                let i = i.as_int().ok_or_else(bad_args)?;
                Value::Fixed(x.scalb(i as i32))
            }
            ("scalb", [Value::Complex(x), i]) => {
                let i = i.as_int().ok_or_else(bad_args)?;
                Value::Complex(x.scalb(i as i32))
            }
            ("len", [Value::List(items)]) => Value::Int(items.len() as i64),
            ("range", [n]) => {
                let n = n.as_int().ok_or_else(bad_args)?;
                Value::List((0..n).map(Value::Int).collect())
            }
            ("range", [a, b]) => {
                let (a, b) = (a.as_int().ok_or_else(bad_args)?, b.as_int().ok_or_else(bad_args)?);
                Value::List((a..b).map(Value::Int).collect())
            }
            ("left_index", [Value::Fixed(x)]) => Value::Int(x.left().ok_or_else(bad_args)? as i64),
            ("right_index", [Value::Fixed(x)]) => {
                Value::Int(x.right().ok_or_else(bad_args)? as i64)
            }
            ("abs", [Value::Fixed(x)]) => Value::Fixed(x.abs()),
            ("abs", [Value::Int(n)]) => Value::Int(n.checked_abs().ok_or_else(bad_args)?),
            ("abs", [Value::Float(n)]) => Value::Float(n.abs()),
            _ => return Err(bad_args()),
        };
        Ok(result)
    }
}

impl Clocked for Instance {
    type Input = Vec<Value>;
    type Output = Option<Value>;
    type Error = CompileError;

    fn commit(&mut self) -> CompileResult<()> {
        self.commit_tree()
    }

    fn step(&mut self, input: Vec<Value>) -> CompileResult<Option<Value>> {
        let entry = self.settings.entry.clone();
        let result = {
            let _float = self.settings.float_mode.then(FloatMode::enter);
            self.call(&entry, input)
        };

        let found = take_diagnostics();
        if self.settings.strict_wrap {
            if let Some(wrap) = found.iter().find(|d| d.is_unexpected_wrap()) {
                return Err(CompileError::simulation(
                    wrap.path.clone(),
                    format!("unexpected wrap {} -> {}", wrap.old, wrap.new),
                ));
            }
        }
        self.diagnostics.extend(found);
        result
    }
}

fn pack(mut values: Vec<Value>) -> Value {
    if values.len() == 1 {
        values.remove(0)
    } else {
        Value::Tuple(values)
    }
}

fn bounds(left: &Value, right: &Value) -> Option<(i32, i32)> {
    let l = i32::try_from(left.as_int()?).ok()?;
    let r = i32::try_from(right.as_int()?).ok()?;
    (l >= r).then_some((l, r))
}

fn complex_part(c: &ComplexSfix, field: &str) -> CompileResult<Value> {
    c.part(field)
        .map(Value::Fixed)
        .ok_or_else(|| sim_error(format!("a complex has no attribute '{}'", field)))
}

/// Clamped `[lo, hi)` range of a slice, negative bounds counting from the end
fn slice_range(len: usize, lower: Option<i64>, upper: Option<i64>) -> (usize, usize) {
    let len = len as i64;
    let clamp = |i: i64| if i < 0 { (len + i).max(0) } else { i.min(len) };
    let lo = lower.map_or(0, clamp);
    let hi = upper.map_or(len, clamp).max(lo);
    (lo as usize, hi as usize)
}

fn normalize_index(i: i64, len: usize) -> CompileResult<usize> {
    let idx = if i < 0 { len as i64 + i } else { i };
    if idx < 0 || idx >= len as i64 {
        return Err(sim_error(format!("index {} out of range for length {}", i, len)));
    }
    Ok(idx as usize)
}

fn render_path(steps: &[Step]) -> String {
    let mut path = String::from("self");
    for step in steps {
        match step {
            Step::Field(name) => {
                path.push('.');
                path.push_str(name);
            }
            Step::Index(i) => path.push_str(&format!("[{}]", i)),
        }
    }
    path
}

/// Write `value` into `slot` following `steps`; with `coerce`, the value
/// takes the shape of what it replaces.
fn store(slot: &mut Value, steps: &[Step], value: Value, coerce: bool) -> Result<(), String> {
    match steps.split_first() {
        None => {
            let value = if coerce { value.coerce_like(slot) } else { value };
            *slot = value;
            Ok(())
        }
        Some((Step::Index(i), tail)) => match slot {
            Value::List(items) => {
                let idx = if *i < 0 { items.len() as i64 + i } else { *i };
                let len = items.len();
                let item = usize::try_from(idx)
                    .ok()
                    .and_then(|idx| items.get_mut(idx))
                    .ok_or_else(|| format!("index {} out of range for length {}", i, len))?;
                store(item, tail, value, coerce)
            }
            other => Err(format!("cannot index a {}", other.kind_name())),
        },
        Some((Step::Field(field), _)) => Err(format!(
            "cannot set attribute '{}' of a {}",
            field,
            slot.kind_name()
        )),
    }
}

fn binary_op(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, String> {
    if op.is_comparison() {
        return compare(op, &lhs, &rhs).map(Value::Bool);
    }

    let unsupported = |l: &Value, r: &Value| {
        format!(
            "unsupported operands for '{}': {} and {}",
            op.symbol(),
            l.kind_name(),
            r.kind_name()
        )
    };

    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => int_op(op, a, b).map(Value::Int),
        (Value::Bool(a), Value::Bool(b)) => match op {
            BinOp::And | BinOp::BitAnd => Ok(Value::Bool(a && b)),
            BinOp::Or | BinOp::BitOr => Ok(Value::Bool(a || b)),
            BinOp::BitXor => Ok(Value::Bool(a ^ b)),
            _ => Err(unsupported(&Value::Bool(a), &Value::Bool(b))),
        },
        (Value::Fixed(a), Value::Fixed(b)) => match op {
            BinOp::Add => Ok(Value::Fixed(a + b)),
            BinOp::Sub => Ok(Value::Fixed(a - b)),
            BinOp::Mul => Ok(Value::Fixed(a * b)),
            _ => Err(unsupported(&Value::Fixed(a), &Value::Fixed(b))),
        },
        (Value::List(mut a), Value::List(b)) if matches!(op, BinOp::Add | BinOp::Concat) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (Value::Complex(a), Value::Complex(b)) => match op {
            BinOp::Add => Ok(Value::Complex(a + b)),
            BinOp::Sub => Ok(Value::Complex(a - b)),
            BinOp::Mul => Ok(Value::Complex(a * b)),
            _ => Err(unsupported(&Value::Complex(a), &Value::Complex(b))),
        },
        (Value::Complex(c), Value::Fixed(x)) | (Value::Fixed(x), Value::Complex(c)) if op == BinOp::Mul => {
            Ok(Value::Complex(c * x))
        }
        (Value::Fixed(a), Value::Int(n)) => match op {
            BinOp::Shl | BinOp::Shr if n >= 0 => {
                let n = u32::try_from(n).map_err(|e| e.to_string())?;
                Ok(Value::Fixed(if op == BinOp::Shl { a.shl(n) } else { a.shr(n) }))
            }
            _ => fixed_literal_op(op, a, n as f64, false),
        },
        (Value::Fixed(a), Value::Float(x)) => fixed_literal_op(op, a, x, false),
        (Value::Int(n), Value::Fixed(a)) => fixed_literal_op(op, a, n as f64, true),
        (Value::Float(x), Value::Fixed(a)) => fixed_literal_op(op, a, x, true),
        (l @ (Value::Int(_) | Value::Float(_)), r @ (Value::Int(_) | Value::Float(_))) => {
            let (a, b) = (l.as_f64().unwrap_or(0.0), r.as_f64().unwrap_or(0.0));
            match op {
                BinOp::Add => Ok(Value::Float(a + b)),
                BinOp::Sub => Ok(Value::Float(a - b)),
                BinOp::Mul => Ok(Value::Float(a * b)),
                BinOp::Div => Ok(Value::Float(a / b)),
                _ => Err(unsupported(&l, &r)),
            }
        }
        (l, r) => Err(unsupported(&l, &r)),
    }
}

/// Fixed-point combined with a plain number; `flipped` when the number was
/// the left operand.
fn fixed_literal_op(op: BinOp, fix: Sfix, n: f64, flipped: bool) -> Result<Value, String> {
    let result = match (op, flipped) {
        (BinOp::Add, false) => fix + n,
        (BinOp::Add, true) => n + fix,
        (BinOp::Sub, false) => fix - n,
        (BinOp::Sub, true) => n - fix,
        (BinOp::Mul, false) => fix * n,
        (BinOp::Mul, true) => n * fix,
        _ => {
            return Err(format!(
                "unsupported operator '{}' between fixed-point and a number",
                op.symbol()
            ))
        }
    };
    Ok(Value::Fixed(result))
}

fn int_op(op: BinOp, a: i64, b: i64) -> Result<i64, String> {
    let overflow = || format!("integer overflow in {} {} {}", a, op.symbol(), b);
    match op {
        BinOp::Add => a.checked_add(b).ok_or_else(overflow),
        BinOp::Sub => a.checked_sub(b).ok_or_else(overflow),
        BinOp::Mul => a.checked_mul(b).ok_or_else(overflow),
        BinOp::Div if b == 0 => Err("division by zero".to_string()),
        BinOp::Div => a.checked_div(b).ok_or_else(overflow),
        BinOp::Mod if b == 0 => Err("modulo by zero".to_string()),
        // sign of the divisor
        BinOp::Mod => {
            let r = a.wrapping_rem(b);
            Ok(if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
        }
        BinOp::Shl => u32::try_from(b)
            .ok()
            .and_then(|b| a.checked_shl(b))
            .ok_or_else(overflow),
        BinOp::Shr => u32::try_from(b)
            .ok()
            .and_then(|b| a.checked_shr(b))
            .ok_or_else(overflow),
        BinOp::BitAnd => Ok(a & b),
        BinOp::BitOr => Ok(a | b),
        BinOp::BitXor => Ok(a ^ b),
        _ => Err(format!("unsupported operator '{}' on integers", op.symbol())),
    }
}

fn compare(op: BinOp, lhs: &Value, rhs: &Value) -> Result<bool, String> {
    if let (Value::Complex(a), Value::Complex(b)) = (lhs, rhs) {
        return match op {
            BinOp::Eq => Ok(a == b),
            BinOp::Ne => Ok(a != b),
            _ => Err(format!("complex values have no ordering for '{}'", op.symbol())),
        };
    }
    let ordering = match (lhs, rhs) {
        (Value::Bool(a), Value::Bool(b)) => a.partial_cmp(b),
        (
            Value::Enum {
                name: a, ordinal: x, ..
            },
            Value::Enum {
                name: b, ordinal: y, ..
            },
        ) if a == b => x.partial_cmp(y),
        (l, r) => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => {
                return Err(format!(
                    "cannot compare a {} with a {}",
                    l.kind_name(),
                    r.kind_name()
                ))
            }
        },
    };
    let ordering = ordering.ok_or_else(|| "comparison with NaN".to_string())?;
    Ok(match op {
        BinOp::Eq => ordering.is_eq(),
        BinOp::Ne => ordering.is_ne(),
        BinOp::Lt => ordering.is_lt(),
        BinOp::Gt => ordering.is_gt(),
        BinOp::Le => ordering.is_le(),
        BinOp::Ge => ordering.is_ge(),
        _ => return Err(format!("'{}' is not a comparison", op.symbol())),
    })
}

fn unary_op(op: UnaryOp, value: Value) -> Result<Value, String> {
    match (op, value) {
        (UnaryOp::Neg, Value::Int(n)) => n
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| format!("integer overflow in -{}", n)),
        (UnaryOp::Neg, Value::Float(n)) => Ok(Value::Float(-n)),
        (UnaryOp::Neg, Value::Fixed(fix)) => Ok(Value::Fixed(-fix)),
        (UnaryOp::Neg, Value::Complex(c)) => Ok(Value::Complex(-c)),
        (UnaryOp::Not, value) => match value.truthy() {
            Some(b) => Ok(Value::Bool(!b)),
            None => Err(format!("'not' applied to a {}", value.kind_name())),
        },
        (UnaryOp::Neg, value) => Err(format!("cannot negate a {}", value.kind_name())),
    }
}
