//! Example: Saturating vs. wrapping accumulator
//!
//! Simulates two accumulators that differ only in their overflow policy,
//! prints both output sequences and the overflow diagnostics, then converts
//! the saturating one to VHDL.
//!
//! Run with: cargo run --example accumulator

use std::sync::Arc;

use fixed_rtl::{parse, ConversionConfig, Converter, Sfix, Simulator, Value};

const DESIGN: &str = "
/// Accumulates its input, saturating at the register bounds
module Sat {
    fn init() { self.acc = sfix(0.0, 2, -10, saturate, round); }
    fn main(x) {
        self.acc = self.acc + x;
        return self.acc;
    }
}

/// Same accumulator, wrapping on overflow
module Wrap {
    fn init() { self.acc = sfix(0.0, 2, -10, wrap, truncate); }
    fn main(x) {
        self.acc = self.acc + x;
        return self.acc;
    }
}
";

fn main() {
    println!("=== Accumulator Example ===\n");

    let design = Arc::new(parse(DESIGN).unwrap());
    let simulator = Simulator::new(design.clone());
    let inputs = vec![vec![Value::Fixed(Sfix::new(1.5, 1, -10))]; 5];

    for class in ["Sat", "Wrap"] {
        let mut acc = simulator.instantiate(class, vec![]).unwrap();
        let outputs = acc.simulate(inputs.clone()).unwrap();
        let rendered: Vec<String> = outputs
            .iter()
            .map(|o| o.as_ref().map(|v| v.to_string()).unwrap_or_default())
            .collect();
        println!("{:>5}: {}", class, rendered.join(", "));
        for diagnostic in acc.diagnostics() {
            println!("       {:?} {} -> {} at {}", diagnostic.kind, diagnostic.old, diagnostic.new, diagnostic.path);
        }
    }

    let mut sat = simulator.instantiate("Sat", vec![]).unwrap();
    sat.simulate(inputs).unwrap();
    let converted = Converter::new(ConversionConfig::default())
        .convert(&design, &sat)
        .unwrap();

    println!("\n{}", converted.signatures);
    for file in &converted.files {
        println!("--- {} ---\n{}", file.name, file.contents);
    }
}
