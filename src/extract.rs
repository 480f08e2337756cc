//! Execution-trace type extraction
//!
//! Walks a simulated instance tree, groups instances of the same class and
//! shape into one package and merges their trace records into function
//! signatures.
//!
//! Merge rule: for every argument, local and return value the type comes
//! from the most recent call that bound it, but every value ever observed
//! for that name must have a compatible type.

use indexmap::IndexMap;

use crate::ast::Design;
use crate::config::ConversionConfig;
use crate::error::{CompileResult, TranslationError, TypeInferenceError};
use crate::sim::{Child, Instance};
use crate::trace::TraceRecord;
use crate::types::{AttributeSignature, FunctionSignature, HwType, ModuleTypeSignature, SignatureSet};
use crate::value::Value;

/// Construction-time attributes that have a hardware type. Floats, lazy
/// fixed-point constants and tuples are simulation bookkeeping and are
/// dropped; lists mixing element types are dropped with a warning.
pub fn initial_values(instance: &Instance) -> IndexMap<String, Value> {
    let mut values = IndexMap::new();
    for (name, value) in instance.initial() {
        if HwType::from_value(value, &|_| None).is_some() {
            values.insert(name.clone(), value.clone());
        } else if matches!(value, Value::List(items) if !items.is_empty()) {
            tracing::warn!(
                class = instance.class_name(),
                attribute = %name,
                "list {} has no single hardware type and is left out",
                value
            );
        }
    }
    values
}

struct Group<'i> {
    class: String,
    package: String,
    instances: Vec<&'i Instance>,
}

/// Builds the signature set for one simulated top instance
pub struct Extractor<'a> {
    design: &'a Design,
    config: &'a ConversionConfig,
    packages: IndexMap<String, String>,
}

impl<'a> Extractor<'a> {
    pub fn new(design: &'a Design, config: &'a ConversionConfig) -> Self {
        Self {
            design,
            config,
            packages: IndexMap::new(),
        }
    }

    pub fn extract(mut self, top: &Instance) -> CompileResult<SignatureSet> {
        let mut groups = Vec::new();
        let top_package = self.assign(top, &mut groups)?;

        let mut modules = IndexMap::new();
        for group in &groups {
            let signature = self.build(group)?;
            tracing::debug!(
                package = %signature.package,
                instances = group.instances.len(),
                functions = signature.functions.len(),
                "extracted signature"
            );
            modules.insert(group.package.clone(), signature.into());
        }

        Ok(SignatureSet {
            top: top_package,
            modules,
        })
    }

    /// Package for an instance, assigning children first so packages come
    /// out in post-order.
    fn assign<'i>(&mut self, instance: &'i Instance, groups: &mut Vec<Group<'i>>) -> CompileResult<String> {
        for (name, child) in instance.children() {
            let mut package: Option<String> = None;
            for sub in child.instances() {
                let assigned = self.assign(sub, groups)?;
                match &package {
                    Some(first) if *first != assigned => {
                        return Err(TranslationError::unsupported(
                            instance.class_name(),
                            format!("self.{}", name),
                            format!("sub-modules {} and {} in one list differ in shape", first, assigned),
                        )
                        .into())
                    }
                    Some(_) => {}
                    None => package = Some(assigned),
                }
            }
        }

        let key = self.shape_key(instance);
        if let Some(package) = self.packages.get(&key) {
            let package = package.clone();
            if let Some(group) = groups.iter_mut().find(|g| g.package == package) {
                group.instances.push(instance);
            }
            return Ok(package);
        }

        let n = groups
            .iter()
            .filter(|g| g.class == instance.class_name())
            .count();
        let package = format!("{}_{}", instance.class_name(), n);
        self.packages.insert(key, package.clone());
        groups.push(Group {
            class: instance.class_name().to_string(),
            package: package.clone(),
            instances: vec![instance],
        });
        Ok(package)
    }

    /// Class, typed initial values and child packages
    fn shape_key(&self, instance: &Instance) -> String {
        let mut key = instance.class_name().to_string();
        for (name, value) in initial_values(instance) {
            let ty = HwType::from_value(&value, &|_| None);
            if let Some(ty) = ty {
                key.push_str(&format!("|{}:{}={}", name, ty, value));
            }
        }
        for (name, child) in instance.children() {
            let packages: Vec<String> = child
                .instances()
                .iter()
                .map(|sub| self.package_of(sub).unwrap_or_default())
                .collect();
            key.push_str(&format!("|{}:<{}>", name, packages.join(",")));
        }
        key
    }

    fn package_of(&self, instance: &Instance) -> Option<String> {
        self.packages.get(&self.shape_key(instance)).cloned()
    }

    fn build(&self, group: &Group<'_>) -> CompileResult<ModuleTypeSignature> {
        let first = group.instances[0];
        let mut signature = ModuleTypeSignature::new(&group.class, &group.package);

        let convertible = initial_values(first);
        for (name, value) in &convertible {
            if let Some(ty) = HwType::from_value(value, &|_| None) {
                let constant = !group.instances.iter().any(|i| i.is_written(name));
                signature.attributes.insert(
                    name.clone(),
                    AttributeSignature {
                        ty,
                        initial: Some(value.clone()),
                        constant,
                    },
                );
            }
        }

        for (name, child) in first.children() {
            let instances = child.instances();
            let package = instances
                .first()
                .and_then(|sub| self.package_of(sub))
                .unwrap_or_default();
            let ty = match child {
                Child::One(_) => HwType::Module(package),
                Child::Many(list) => HwType::List(Box::new(HwType::Module(package)), list.len()),
            };
            signature.attributes.insert(
                name.clone(),
                AttributeSignature {
                    ty,
                    initial: None,
                    constant: false,
                },
            );
        }

        let excluded: IndexMap<&str, &Value> = first
            .initial()
            .iter()
            .filter(|(name, _)| !convertible.contains_key(*name))
            .map(|(name, value)| (name.as_str(), value))
            .collect();

        let module = match self.design.module(&group.class) {
            Some(module) => module,
            None => return Ok(signature),
        };

        for function in &module.functions {
            if function.name == first.constructor_name() {
                continue;
            }

            let records: Vec<&TraceRecord> = group
                .instances
                .iter()
                .flat_map(|i| i.traces())
                .filter(|t| t.function == function.name)
                .collect();

            if records.is_empty() {
                if self.config.is_required(&function.name) {
                    signature.failures.insert(
                        function.name.clone(),
                        TypeInferenceError::FunctionNotSimulated {
                            class: group.class.clone(),
                            function: function.name.clone(),
                        },
                    );
                } else {
                    tracing::warn!(
                        class = %group.class,
                        function = %function.name,
                        "never called during simulation, skipping conversion"
                    );
                    signature.unsimulated.push(function.name.clone());
                }
                continue;
            }

            let mut used = None;
            for stmt in &function.body {
                stmt.walk_exprs(&mut |expr| {
                    if used.is_none() {
                        if let Some(attr) = expr.self_attribute() {
                            if let Some(value) = excluded.get(attr) {
                                used = Some((attr.to_string(), value.to_string()));
                            }
                        }
                    }
                });
            }

            let result = match used {
                Some((variable, value)) => Err(TypeInferenceError::VariableNotConvertable {
                    class: group.class.clone(),
                    function: function.name.clone(),
                    variable: format!("self.{}", variable),
                    value,
                }),
                None => merge_function(&group.class, &function.name, &records, &|sub| {
                    self.package_of(sub)
                }),
            };

            match result {
                Ok(merged) => {
                    signature.functions.insert(function.name.clone(), merged);
                }
                Err(err) => {
                    tracing::debug!(class = %group.class, function = %function.name, "{}", err);
                    signature.failures.insert(function.name.clone(), err);
                }
            }
        }

        Ok(signature)
    }
}

/// Extract the signature set of a simulated top instance
pub fn extract(design: &Design, top: &Instance, config: &ConversionConfig) -> CompileResult<SignatureSet> {
    Extractor::new(design, config).extract(top)
}

struct Observed<'r> {
    class: &'r str,
    function: &'r str,
    first: IndexMap<String, (HwType, &'r Value)>,
}

impl<'r> Observed<'r> {
    fn observe(
        &mut self,
        variable: &str,
        value: &'r Value,
        package: &dyn Fn(&Instance) -> Option<String>,
    ) -> Result<HwType, TypeInferenceError> {
        let ty = HwType::from_value(value, package).ok_or_else(|| TypeInferenceError::VariableNotConvertable {
            class: self.class.to_string(),
            function: self.function.to_string(),
            variable: variable.to_string(),
            value: value.to_string(),
        })?;

        match self.first.get(variable) {
            Some((first_ty, first_value)) if !first_ty.compatible(&ty) => {
                Err(TypeInferenceError::VariableMultipleTypes {
                    class: self.class.to_string(),
                    function: self.function.to_string(),
                    variable: variable.to_string(),
                    first: first_value.to_string(),
                    second: value.to_string(),
                })
            }
            Some(_) => Ok(ty),
            None => {
                self.first.insert(variable.to_string(), (ty.clone(), value));
                Ok(ty)
            }
        }
    }
}

/// Merge the records of one function, in call order
pub fn merge_function(
    class: &str,
    function: &str,
    records: &[&TraceRecord],
    package: &dyn Fn(&Instance) -> Option<String>,
) -> Result<FunctionSignature, TypeInferenceError> {
    let mut signature = FunctionSignature::new(function);
    signature.calls = records.len();
    let mut observed = Observed {
        class,
        function,
        first: IndexMap::new(),
    };

    let mut return_count: Option<(usize, &Vec<Value>)> = None;
    for &record in records {
        if signature.args.is_empty() {
            signature.args = Vec::with_capacity(record.args.len());
            for (name, value) in &record.args {
                let ty = observed.observe(name, value, package)?;
                signature.args.push((name.clone(), ty));
            }
        } else {
            for (i, (name, value)) in record.args.iter().enumerate() {
                let ty = observed.observe(name, value, package)?;
                if let Some(slot) = signature.args.get_mut(i) {
                    slot.1 = ty;
                }
            }
        }

        for (name, value) in &record.locals {
            let ty = observed.observe(name, value, package)?;
            signature.locals.insert(name.clone(), ty);
        }

        if let Some(values) = &record.returns {
            if let Some((n, previous)) = return_count {
                if n != values.len() {
                    return Err(TypeInferenceError::VariableMultipleTypes {
                        class: class.to_string(),
                        function: function.to_string(),
                        variable: "return".to_string(),
                        first: Value::Tuple(previous.clone()).to_string(),
                        second: Value::Tuple(values.clone()).to_string(),
                    });
                }
            }
            return_count = Some((values.len(), values));
            signature.returns = values
                .iter()
                .enumerate()
                .map(|(i, value)| observed.observe(&format!("ret_{}", i), value, package))
                .collect::<Result<_, _>>()?;
        }
    }

    Ok(signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::{FixedFormat, Overflow, Round, Sfix};
    use crate::parser::parse_design;
    use crate::sim::Simulator;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn run(source: &str, class: &str, inputs: Vec<Vec<Value>>) -> (Arc<Design>, Instance) {
        let design = Arc::new(parse_design(source).unwrap());
        let sim = Simulator::new(design.clone());
        let mut top = sim.instantiate(class, vec![]).unwrap();
        top.simulate(inputs).unwrap();
        (design, top)
    }

    fn fix(v: f64, l: i32, r: i32) -> Value {
        Value::Fixed(Sfix::new(v, l, r))
    }

    fn record(locals: Vec<(&str, Value)>) -> TraceRecord {
        let mut record = TraceRecord::new("main", vec![]);
        for (name, value) in locals {
            record.bind(name, &value);
        }
        record
    }

    fn merge(records: &[TraceRecord]) -> Result<FunctionSignature, TypeInferenceError> {
        let refs: Vec<&TraceRecord> = records.iter().collect();
        merge_function("M", "main", &refs, &|_| None)
    }

    const TWO_FUNCTIONS: &str = "
        module Two {
            fn init() { self.a = 0; }
            fn main(x) { self.a = x; return self.a; }
            fn other(x) { self.a = x + 1; }
        }
    ";

    #[test]
    fn test_unsimulated_function_is_skipped() {
        let (design, top) = run(TWO_FUNCTIONS, "Two", vec![vec![Value::Int(1)], vec![Value::Int(2)]]);
        let set = extract(&design, &top, &ConversionConfig::default()).unwrap();
        let sig = set.top().unwrap();

        assert_eq!(set.top, "Two_0");
        let main = sig.function("main").unwrap();
        assert_eq!(main.args, vec![("x".to_string(), HwType::Integer)]);
        assert_eq!(main.returns, vec![HwType::Integer]);
        assert_eq!(main.calls, 2);
        assert_eq!(sig.unsimulated, vec!["other"]);
        assert!(sig.failures.is_empty());
        assert!(matches!(
            sig.function("other"),
            Err(TypeInferenceError::FunctionNotSimulated { .. })
        ));
    }

    #[test]
    fn test_required_unsimulated_function_fails() {
        let (design, top) = run(TWO_FUNCTIONS, "Two", vec![vec![Value::Int(1)]]);
        let config = ConversionConfig::default().require("other");
        let set = extract(&design, &top, &config).unwrap();
        let sig = set.top().unwrap();
        assert!(sig.unsimulated.is_empty());
        assert_eq!(
            sig.failures.get("other"),
            Some(&TypeInferenceError::FunctionNotSimulated {
                class: "Two".to_string(),
                function: "other".to_string()
            })
        );
        assert!(sig.function("main").is_ok());
    }

    #[test]
    fn test_int_and_bool_bindings_conflict() {
        let result = merge(&[record(vec![("t", Value::Int(1))]), record(vec![("t", Value::Bool(true))])]);
        assert!(matches!(
            result,
            Err(TypeInferenceError::VariableMultipleTypes { ref variable, ref first, ref second, .. })
                if variable == "t" && first == "1" && second == "true"
        ));
    }

    #[test]
    fn test_fixed_bounds_must_match() {
        let result = merge(&[record(vec![("t", fix(0.5, 0, -4))]), record(vec![("t", fix(0.5, 1, -4))])]);
        assert!(matches!(result, Err(TypeInferenceError::VariableMultipleTypes { .. })));

        let merged = merge(&[record(vec![("t", fix(0.5, 0, -4))]), record(vec![("t", fix(-0.25, 0, -4))])]).unwrap();
        assert_eq!(merged.locals["t"], HwType::Fixed(FixedFormat::new(0, -4)));
    }

    #[test]
    fn test_float_local_is_not_convertable() {
        let result = merge(&[record(vec![("t", Value::Float(0.5))])]);
        assert!(matches!(
            result,
            Err(TypeInferenceError::VariableNotConvertable { ref variable, .. }) if variable == "t"
        ));
    }

    #[test]
    fn test_branch_local_and_attributes() {
        let (design, top) = run(
            "module M {
                fn init() { self.acc = sfix(0.0, 2, -10); self.gain = 3; self.scratch = 0.5; }
                fn main(x) {
                    if x > 1 { t = sfix(0.5, 0, -4); }
                    self.acc = self.acc + x;
                    return self.acc, x > 1;
                }
            }",
            "M",
            vec![vec![fix(0.5, 0, -4)], vec![fix(1.5, 1, -4)]],
        );
        // x changes bounds between calls
        let set = extract(&design, &top, &ConversionConfig::default()).unwrap();
        let sig = set.top().unwrap();
        assert!(matches!(
            sig.function("main"),
            Err(TypeInferenceError::VariableMultipleTypes { ref variable, .. }) if variable == "x"
        ));

        assert_eq!(sig.constant_names(), vec!["gain"]);
        assert!(sig.attribute("scratch").is_none());
        assert_eq!(sig.attribute("acc").map(|a| a.constant), Some(false));
    }

    #[test]
    fn test_non_uniform_list_rejected_at_use() {
        let (design, top) = run(
            "module M {
                fn init() { self.taps = [sfix(0.5, 0, -4), sfix(0.5, 1, -4)]; self.n = 0; }
                fn main(x) { self.n = x; }
                fn tap(i) { return self.taps[i]; }
            }",
            "M",
            vec![vec![Value::Int(1)]],
        );
        // call tap directly so it has a trace
        let mut top = top;
        top.call("tap", vec![Value::Int(0)]).unwrap();

        assert!(initial_values(&top).get("taps").is_none());
        let set = extract(&design, &top, &ConversionConfig::default()).unwrap();
        let sig = set.top().unwrap();
        assert!(sig.function("main").is_ok());
        assert!(matches!(
            sig.function("tap"),
            Err(TypeInferenceError::VariableNotConvertable { ref variable, .. }) if variable == "self.taps"
        ));
    }

    #[test]
    fn test_same_shape_instances_share_a_package() {
        let (design, top) = run(
            "module Stage {
                fn init(g) { self.gain = g; self.out = sfix(0.0, 1, -8); }
                fn main(x) { self.out = x * self.gain; return self.out; }
            }
            module Chain {
                fn init() {
                    self.stages = [Stage(sfix(0.5, 0, -8)), Stage(sfix(0.5, 0, -8))];
                    self.odd = Stage(sfix(0.5, 2, -8));
                }
                fn main(x) {
                    for s in self.stages { s.main(x); }
                    return self.odd.main(x);
                }
            }",
            "Chain",
            vec![vec![fix(0.5, 0, -8)]; 3],
        );
        let set = extract(&design, &top, &ConversionConfig::default()).unwrap();

        let packages: Vec<&String> = set.modules.keys().collect();
        assert_eq!(packages, vec!["Stage_0", "Stage_1", "Chain_0"]);
        assert_eq!(set.top, "Chain_0");

        let stage = set.get("Stage_0").unwrap();
        assert_eq!(stage.function("main").unwrap().calls, 6);
        assert_eq!(stage.constant_names(), vec!["gain"]);

        let chain = set.top().unwrap();
        assert_eq!(
            chain.attribute("stages").map(|a| &a.ty),
            Some(&HwType::List(Box::new(HwType::Module("Stage_0".to_string())), 2))
        );
        assert_eq!(chain.dependencies(), vec!["Stage_0", "Stage_1"]);
        let main = chain.function("main").unwrap();
        assert_eq!(
            main.returns,
            vec![HwType::Fixed(FixedFormat::with_policy(1, -8, Overflow::Saturate, Round::Round))]
        );
    }

    proptest! {
        #[test]
        fn prop_merge_law(mask in proptest::collection::vec(any::<bool>(), 1..8), values in proptest::collection::vec(-1.0f64..1.0, 8)) {
            prop_assume!(mask.iter().any(|b| *b));
            let records: Vec<TraceRecord> = mask
                .iter()
                .zip(&values)
                .map(|(bound, v)| if *bound { record(vec![("t", fix(*v, 0, -8))]) } else { record(vec![]) })
                .collect();
            let merged = merge(&records).unwrap();
            prop_assert_eq!(&merged.locals["t"], &HwType::Fixed(FixedFormat::new(0, -8)));
        }
    }
}
