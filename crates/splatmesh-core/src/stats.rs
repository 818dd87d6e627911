//! Run statistics.
//!
//! A registry of named accumulators, shared by handle between the pipeline
//! stages. Each variable only ever accumulates, so concurrent writers cannot
//! disagree about anything except interleaving.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct Variable {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Variable {
    fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

/// Snapshot of one statistic at print time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Default)]
pub struct Registry {
    vars: Mutex<BTreeMap<String, Variable>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation of `name`.
    pub fn add(&self, name: &str, value: f64) {
        let mut vars = self.vars.lock().expect("statistics registry poisoned");
        vars.entry(name.to_owned())
            .or_insert_with(Variable::new)
            .add(value);
    }

    /// Record one event of `name` (an observation of 1).
    pub fn incr(&self, name: &str) {
        self.add(name, 1.0);
    }

    pub fn get(&self, name: &str) -> Option<Sample> {
        let vars = self.vars.lock().expect("statistics registry poisoned");
        vars.get(name).map(|v| Sample {
            count: v.count,
            sum: v.sum,
            min: v.min,
            max: v.max,
        })
    }
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vars = self.vars.lock().expect("statistics registry poisoned");
        for (name, v) in vars.iter() {
            if v.count == 1 {
                writeln!(f, "{}: {}", name, v.sum)?;
            } else {
                writeln!(
                    f,
                    "{}: total={} count={} mean={} min={} max={}",
                    name,
                    v.sum,
                    v.count,
                    v.sum / v.count as f64,
                    v.min,
                    v.max
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn accumulates() {
        let reg = Registry::new();
        reg.add("a", 3.0);
        reg.add("a", 5.0);
        reg.incr("b");
        let a = reg.get("a").unwrap();
        assert_eq!(a.count, 2);
        assert_eq!(a.sum, 8.0);
        assert_eq!(a.min, 3.0);
        assert_eq!(a.max, 5.0);
        assert_eq!(reg.get("b").unwrap().count, 1);
        assert!(reg.get("c").is_none());
    }

    #[test]
    fn concurrent_writers() {
        let reg = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        reg.incr("events");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.get("events").unwrap().count, 8000);
    }

    #[test]
    fn display_sorted_by_name() {
        let reg = Registry::new();
        reg.add("z.last", 1.0);
        reg.add("a.first", 2.0);
        let out = reg.to_string();
        let a = out.find("a.first").unwrap();
        let z = out.find("z.last").unwrap();
        assert!(a < z);
    }
}
